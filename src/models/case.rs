use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// One untrusted row as delivered by a case source, before parsing.
///
/// Field values follow the DataSUS SRAG export: `outcome` is the `EVOLUCAO`
/// code, `icu` the `UTI` code and `vaccination` the `VACINA_COV` code.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct RawCaseRow {
    pub report_date: Option<String>,
    pub onset_date: Option<String>,
    pub outcome: Option<String>,
    pub icu: Option<String>,
    pub vaccination: Option<String>,
    pub state: Option<String>,
    pub municipality_code: Option<String>,
    pub age: Option<i32>,
    pub notification_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Recovered,
    Deceased,
    Unknown,
}

impl Outcome {
    /// `2` (death by SRAG) and `3` (death by other causes) both count as deaths.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "1" | "recovered" | "cura" => Some(Self::Recovered),
            "2" | "3" | "deceased" | "obito" | "óbito" => Some(Self::Deceased),
            "9" | "unknown" | "ignorado" => Some(Self::Unknown),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Recovered => "recovered",
            Self::Deceased => "deceased",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VaccinationStatus {
    Vaccinated,
    Unvaccinated,
    Unknown,
}

impl VaccinationStatus {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_lowercase()).as_deref() {
            Some("1") | Some("vaccinated") | Some("sim") => Self::Vaccinated,
            Some("2") | Some("unvaccinated") | Some("nao") | Some("não") => Self::Unvaccinated,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AgeBand {
    #[serde(rename = "0-12")]
    Child,
    #[serde(rename = "13-18")]
    Adolescent,
    #[serde(rename = "19-60")]
    Adult,
    #[serde(rename = "60+")]
    Senior,
}

impl AgeBand {
    pub fn from_years(years: i32) -> Option<Self> {
        match years {
            0..=12 => Some(Self::Child),
            13..=18 => Some(Self::Adolescent),
            19..=60 => Some(Self::Adult),
            61..=120 => Some(Self::Senior),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Child => "0-12",
            Self::Adolescent => "13-18",
            Self::Adult => "19-60",
            Self::Senior => "60+",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum Age {
    Exact(i32),
    Band(AgeBand),
    Unknown,
}

impl Age {
    pub fn band(&self) -> Option<AgeBand> {
        match self {
            Self::Exact(years) => AgeBand::from_years(*years),
            Self::Band(band) => Some(*band),
            Self::Unknown => None,
        }
    }
}

/// Geography of a case. `municipality` must be stripped before the record
/// leaves the guardrail stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub state: String,
    pub municipality: Option<String>,
}

impl Region {
    pub const UNKNOWN_STATE: &'static str = "NI";

    pub fn new(state: Option<&str>, municipality: Option<&str>) -> Self {
        let state = state
            .map(|s| s.trim().to_uppercase())
            .filter(|s| s.len() == 2 && s.chars().all(|c| c.is_ascii_alphabetic()))
            .unwrap_or_else(|| Self::UNKNOWN_STATE.to_string());
        let municipality = municipality
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty());
        Self {
            state,
            municipality,
        }
    }

    pub fn is_state_level(&self) -> bool {
        self.municipality.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseRecord {
    pub report_date: NaiveDate,
    pub onset_date: Option<NaiveDate>,
    pub outcome: Outcome,
    pub icu_flag: bool,
    pub vaccination_status: VaccinationStatus,
    pub region: Region,
    pub age: Age,
    pub notification_id: Option<String>,
}

impl CaseRecord {
    pub fn is_anonymized(&self) -> bool {
        self.notification_id.is_none()
            && self.region.is_state_level()
            && !matches!(self.age, Age::Exact(_))
    }
}

/// Accepts ISO dates and the `DD/MM/YYYY` layout used by DataSUS exports.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    let date_part = raw.split(['T', ' ']).next().unwrap_or(raw);
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(date_part, "%d/%m/%Y"))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_codes() {
        assert_eq!(Outcome::parse("1"), Some(Outcome::Recovered));
        assert_eq!(Outcome::parse("2"), Some(Outcome::Deceased));
        assert_eq!(Outcome::parse("3"), Some(Outcome::Deceased));
        assert_eq!(Outcome::parse(" 9 "), Some(Outcome::Unknown));
        assert_eq!(Outcome::parse("Deceased"), Some(Outcome::Deceased));
        assert_eq!(Outcome::parse("7"), None);
        assert_eq!(Outcome::parse(""), None);
    }

    #[test]
    fn test_vaccination_codes() {
        assert_eq!(
            VaccinationStatus::parse(Some("1")),
            VaccinationStatus::Vaccinated
        );
        assert_eq!(
            VaccinationStatus::parse(Some("2")),
            VaccinationStatus::Unvaccinated
        );
        assert_eq!(
            VaccinationStatus::parse(Some("9")),
            VaccinationStatus::Unknown
        );
        assert_eq!(VaccinationStatus::parse(None), VaccinationStatus::Unknown);
    }

    #[test]
    fn test_age_bands() {
        assert_eq!(AgeBand::from_years(0), Some(AgeBand::Child));
        assert_eq!(AgeBand::from_years(12), Some(AgeBand::Child));
        assert_eq!(AgeBand::from_years(13), Some(AgeBand::Adolescent));
        assert_eq!(AgeBand::from_years(60), Some(AgeBand::Adult));
        assert_eq!(AgeBand::from_years(61), Some(AgeBand::Senior));
        assert_eq!(AgeBand::from_years(121), None);
        assert_eq!(AgeBand::from_years(-1), None);
    }

    #[test]
    fn test_region_normalizes_state() {
        let region = Region::new(Some(" sp "), Some("355030"));
        assert_eq!(region.state, "SP");
        assert_eq!(region.municipality.as_deref(), Some("355030"));
        assert!(!region.is_state_level());

        let unknown = Region::new(Some("São Paulo"), None);
        assert_eq!(unknown.state, Region::UNKNOWN_STATE);
        assert!(unknown.is_state_level());
    }

    #[test]
    fn test_parse_date_formats() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
        assert_eq!(parse_date("2024-03-07"), Some(expected));
        assert_eq!(parse_date("07/03/2024"), Some(expected));
        assert_eq!(parse_date("2024-03-07T10:00:00"), Some(expected));
        assert_eq!(parse_date("2024-13-01"), None);
        assert_eq!(parse_date("not a date"), None);
    }
}
