use async_openai::{
    Client,
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
        ChatCompletionRequestSystemMessageContent, ChatCompletionRequestUserMessage,
        ChatCompletionRequestUserMessageContent, CreateChatCompletionRequest,
        CreateChatCompletionResponse,
    },
};

use super::{GenerateRequest, GenerateResponse, Provider};

/// Where chat completions are sent. Both speak the OpenAI wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    OpenAi,
    Gemini,
}

impl Backend {
    /// `google` and `gemini` select Gemini; anything else is OpenAI.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "google" | "gemini" => Self::Gemini,
            _ => Self::OpenAi,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Gemini => "google",
        }
    }

    pub fn host(self) -> &'static str {
        match self {
            Self::OpenAi => "api.openai.com",
            Self::Gemini => "generativelanguage.googleapis.com",
        }
    }

    fn api_base(self) -> Option<String> {
        match self {
            Self::OpenAi => None,
            Self::Gemini => Some(format!("https://{}/v1beta/openai", self.host())),
        }
    }
}

pub struct OpenAIProvider {
    client: Client<OpenAIConfig>,
    backend: Backend,
}

impl OpenAIProvider {
    pub fn new(backend: Backend, api_key: &str) -> Self {
        let mut config = OpenAIConfig::new().with_api_key(api_key);
        if let Some(base) = backend.api_base() {
            config = config.with_api_base(base);
        }
        Self {
            client: Client::with_config(config),
            backend,
        }
    }

    /// Picks the backend named by `LLM_PROVIDER` and the matching key. A
    /// missing key is not an error here: calls fail and the narrative falls
    /// back to its template.
    pub fn from_name(provider: &str, openai_key: Option<&str>, google_key: Option<&str>) -> Self {
        let backend = Backend::from_name(provider);
        let key = match backend {
            Backend::OpenAi => openai_key,
            Backend::Gemini => google_key,
        };
        Self::new(backend, key.unwrap_or_default())
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }
}

fn chat_request(req: &GenerateRequest) -> CreateChatCompletionRequest {
    let mut messages = Vec::with_capacity(2);
    if !req.system.is_empty() {
        messages.push(ChatCompletionRequestMessage::System(
            ChatCompletionRequestSystemMessage {
                content: ChatCompletionRequestSystemMessageContent::Text(req.system.clone()),
                name: None,
            },
        ));
    }
    messages.push(ChatCompletionRequestMessage::User(
        ChatCompletionRequestUserMessage {
            content: ChatCompletionRequestUserMessageContent::Text(req.prompt.clone()),
            name: None,
        },
    ));

    #[allow(deprecated)]
    CreateChatCompletionRequest {
        model: req.model.clone(),
        messages,
        temperature: Some(req.temperature),
        max_completion_tokens: Some(req.max_tokens),
        ..Default::default()
    }
}

fn into_response(response: CreateChatCompletionResponse) -> anyhow::Result<GenerateResponse> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("invalid response: no choices returned"))?;

    let (input_tokens, output_tokens) = response
        .usage
        .map(|u| (u.prompt_tokens, u.completion_tokens))
        .unwrap_or_default();

    Ok(GenerateResponse {
        content: choice.message.content.unwrap_or_default(),
        model: response.model,
        input_tokens,
        output_tokens,
        finish_reason: choice
            .finish_reason
            .map(|r| format!("{r:?}").to_lowercase())
            .unwrap_or_default(),
        provider: String::new(),
    })
}

#[async_trait::async_trait]
impl Provider for OpenAIProvider {
    async fn generate(&self, req: &GenerateRequest) -> anyhow::Result<GenerateResponse> {
        let response = self.client.chat().create(chat_request(req)).await?;
        into_response(response)
    }

    fn name(&self) -> &str {
        self.backend.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(system: &str) -> GenerateRequest {
        GenerateRequest {
            model: "gemini-2.0-flash".into(),
            system: system.into(),
            prompt: "Write the bulletin.".into(),
            temperature: 0.3,
            max_tokens: 512,
            stage: "narrative".into(),
        }
    }

    #[test]
    fn test_from_name_selects_backend() {
        assert_eq!(
            OpenAIProvider::from_name("google", None, Some("k")).backend(),
            Backend::Gemini
        );
        assert_eq!(OpenAIProvider::from_name(" Gemini ", None, None).name(), "google");
        assert_eq!(
            OpenAIProvider::from_name("openai", Some("k"), None).backend(),
            Backend::OpenAi
        );
        assert_eq!(OpenAIProvider::from_name("other", None, None).name(), "openai");
    }

    #[test]
    fn test_gemini_uses_compatible_endpoint() {
        assert_eq!(
            Backend::Gemini.api_base().as_deref(),
            Some("https://generativelanguage.googleapis.com/v1beta/openai")
        );
        assert!(Backend::OpenAi.api_base().is_none());
    }

    #[test]
    fn test_empty_system_prompt_is_omitted() {
        assert_eq!(chat_request(&request("")).messages.len(), 1);
        let with_system = chat_request(&request("You write bulletins."));
        assert_eq!(with_system.messages.len(), 2);
        assert_eq!(with_system.max_completion_tokens, Some(512));
    }
}
