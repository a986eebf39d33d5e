use sqlx::PgPool;

use crate::error::PipelineError;
use crate::models::RawCaseRow;
use crate::models::metrics::DateWindow;
use crate::pipeline::retrieve::{CaseSource, SourceRows};

/// Reads `srag_notifications`. Columns are cast to text so that the row
/// parser sees the same shape as the file sources.
pub struct PgCaseSource {
    pool: PgPool,
}

impl PgCaseSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl CaseSource for PgCaseSource {
    #[tracing::instrument(name = "db.notifications.window", skip(self), fields(rows))]
    async fn fetch(&self, window: DateWindow) -> Result<SourceRows, PipelineError> {
        let rows = sqlx::query_as::<_, RawCaseRow>(
            r#"
            SELECT
                dt_notific::text AS report_date,
                dt_sin_pri::text AS onset_date,
                evolucao::text AS outcome,
                uti::text AS icu,
                vacina_cov::text AS vaccination,
                sg_uf AS state,
                co_mun_res AS municipality_code,
                nu_idade_n AS age,
                nu_notific AS notification_id
            FROM srag_notifications
            WHERE dt_notific BETWEEN $1 AND $2
            ORDER BY dt_notific
            "#,
        )
        .bind(window.start)
        .bind(window.end)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PipelineError::DataUnavailable(format!("srag_notifications query failed: {e}")))?;

        tracing::Span::current().record("rows", rows.len());

        Ok(SourceRows { rows, malformed: 0 })
    }

    fn name(&self) -> &str {
        "postgres"
    }
}
