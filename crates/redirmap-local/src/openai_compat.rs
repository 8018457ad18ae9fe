use redirmap_core::{Error, MatchRequest, MatchService, Result};
use serde::{Deserialize, Serialize};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
const DEFAULT_TIMEOUT_MS: u64 = 60_000;
/// Completion budget per chunk; 50 sources with reasons fit comfortably.
pub const DEFAULT_MAX_TOKENS: u64 = 4_000;

fn env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn openai_compat_base_url_from_env() -> Option<String> {
    env("REDIRMAP_OPENAI_COMPAT_BASE_URL")
}

fn openai_compat_api_key_from_env() -> Option<String> {
    env("REDIRMAP_OPENAI_COMPAT_API_KEY").or_else(|| env("OPENAI_API_KEY"))
}

fn openai_compat_model_from_env() -> Option<String> {
    env("REDIRMAP_OPENAI_COMPAT_MODEL")
}

fn openai_compat_timeout_from_env() -> Option<u64> {
    env("REDIRMAP_OPENAI_COMPAT_TIMEOUT_MS").and_then(|s| s.parse().ok())
}

#[derive(Debug, Clone)]
pub struct OpenAiCompatClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiCompatClient {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key,
            model: model.into(),
        }
    }

    /// The hosted default endpoint needs a key; a custom base URL (local gateway, proxy) may not.
    pub fn from_env(client: reqwest::Client, model_override: Option<String>) -> Result<Self> {
        let base_url = openai_compat_base_url_from_env();
        let api_key = openai_compat_api_key_from_env();
        if base_url.is_none() && api_key.is_none() {
            return Err(Error::NotConfigured(
                "missing REDIRMAP_OPENAI_COMPAT_API_KEY (or OPENAI_API_KEY)".to_string(),
            ));
        }

        let model = model_override
            .or_else(openai_compat_model_from_env)
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        Ok(Self::new(
            client,
            base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key,
            model,
        ))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint_chat_completions(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.base_url.trim_end_matches('/')
        )
    }

    pub async fn chat(
        &self,
        system: &str,
        user: &str,
        timeout_ms: u64,
        max_tokens: Option<u64>,
        temperature: Option<f64>,
    ) -> Result<String> {
        let req = ChatCompletionsRequest {
            model: self.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            max_tokens,
            temperature,
            stream: Some(false),
        };

        let mut rb = self
            .client
            .post(self.endpoint_chat_completions())
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(k) = &self.api_key {
            rb = rb.header(reqwest::header::AUTHORIZATION, format!("Bearer {k}"));
        }

        let resp = rb
            .json(&req)
            .send()
            .await
            .map_err(|e| Error::Llm(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Llm(format!(
                "openai_compat chat.completions HTTP {status}"
            )));
        }

        let parsed: ChatCompletionsResponse =
            resp.json().await.map_err(|e| Error::Llm(e.to_string()))?;
        Ok(parsed
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionsRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionsResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Clone, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Clone, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: String,
}

pub fn system_prompt(business_context: Option<&str>) -> String {
    let mut s = String::from(
        "You are an expert in 301 redirects for website migrations.\n\
         Map each old URL to the most semantically relevant new URL.\n\
         \n\
         Rules:\n\
         - Judge the meaning of each URL path, not just shared words\n\
         - One old URL maps to at most one new URL\n\
         - Only pick new URLs from the list you are given\n\
         - Confidence is a number between 0.0 and 1.0\n\
         - If nothing fits, list the old URL under \"unmatched\"\n\
         - Answer with valid JSON only: {\"correspondences\": [...], \"unmatched\": [...]}",
    );
    if let Some(ctx) = business_context.map(str::trim).filter(|c| !c.is_empty()) {
        s.push_str("\n\nBUSINESS CONTEXT FROM THE PROJECT OWNER:\n");
        s.push_str(ctx);
        s.push_str(
            "\n\nUse it to understand renamed terminology, the new site structure and which \
             languages are active. It takes precedence over your own guesses.",
        );
    }
    s
}

pub fn user_prompt(req: &MatchRequest) -> String {
    let mut s = String::new();
    if let Some(ctx) = req.business_context.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
        s.push_str("BUSINESS CONTEXT:\n");
        s.push_str(ctx);
        s.push_str("\n\n");
    }
    s.push_str(&format!("OLD URLS ({}):\n", req.source_urls.len()));
    s.push_str(&req.source_urls.join("\n"));
    s.push_str(&format!("\n\nNEW URLS ({}):\n", req.candidate_targets.len()));
    s.push_str(&req.candidate_targets.join("\n"));
    s.push_str(&format!("\n\nMAIN LANGUAGE: {}\n\n", req.language));
    s.push_str(
        "Map each old URL to the best new URL. Answer in JSON with exactly this structure:\n\
         {\n  \"correspondences\": [\n    {\"old\": \"OLD_URL\", \"new\": \"NEW_URL\", \"confidence\": 0.85, \"reason\": \"short explanation\"}\n  ],\n  \"unmatched\": [\"OLD_URL_WITHOUT_MATCH\"]\n}",
    );
    s
}

/// [`MatchService`] backed by any OpenAI-compatible chat.completions endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiCompatMatcher {
    client: OpenAiCompatClient,
    timeout_ms: u64,
    max_tokens: u64,
}

impl OpenAiCompatMatcher {
    pub fn new(client: OpenAiCompatClient) -> Self {
        Self {
            client,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    pub fn from_env(model_override: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("redirmap/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::NotConfigured(format!("http client: {e}")))?;
        let client = OpenAiCompatClient::from_env(http, model_override)?;
        Ok(Self::new(client)
            .with_timeout_ms(openai_compat_timeout_from_env().unwrap_or(DEFAULT_TIMEOUT_MS)))
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn client(&self) -> &OpenAiCompatClient {
        &self.client
    }
}

#[async_trait::async_trait]
impl MatchService for OpenAiCompatMatcher {
    fn name(&self) -> &'static str {
        "openai_compat"
    }

    async fn complete(&self, req: &MatchRequest) -> Result<String> {
        let content = self
            .client
            .chat(
                &system_prompt(req.business_context.as_deref()),
                &user_prompt(req),
                self.timeout_ms,
                Some(self.max_tokens),
                req.temperature,
            )
            .await?;
        if content.trim().is_empty() {
            return Err(Error::Llm("openai_compat returned an empty completion".to_string()));
        }
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
    use redirmap_core::LanguageTag;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    // Env vars are process-global; serialize tests that mutate them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    struct EnvGuard {
        saved: Vec<(&'static str, Option<String>)>,
    }

    impl EnvGuard {
        fn set(vars: &[(&'static str, Option<&str>)]) -> Self {
            let saved = vars
                .iter()
                .map(|(k, _)| (*k, std::env::var(k).ok()))
                .collect();
            for (k, v) in vars {
                match v {
                    Some(v) => std::env::set_var(k, v),
                    None => std::env::remove_var(k),
                }
            }
            Self { saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (k, v) in &self.saved {
                match v {
                    Some(v) => std::env::set_var(k, v),
                    None => std::env::remove_var(k),
                }
            }
        }
    }

    fn request() -> MatchRequest {
        MatchRequest {
            source_urls: vec!["/fr/contact".to_string(), "/fr/chambres".to_string()],
            candidate_targets: vec!["/fr/nous-contacter".to_string()],
            language: LanguageTag::new("fr"),
            business_context: Some("Hotel in Nice; rooms renamed to suites".to_string()),
            temperature: Some(0.1),
        }
    }

    #[test]
    fn prompts_carry_lists_language_and_context_first() {
        let u = user_prompt(&request());
        assert!(u.starts_with("BUSINESS CONTEXT:\nHotel in Nice"));
        assert!(u.contains("OLD URLS (2):\n/fr/contact\n/fr/chambres"));
        assert!(u.contains("NEW URLS (1):\n/fr/nous-contacter"));
        assert!(u.contains("MAIN LANGUAGE: fr"));
        assert!(u.contains("\"correspondences\""));

        assert!(system_prompt(Some("  ")).ends_with("[...]}"));
        assert!(system_prompt(Some("suites")).contains("BUSINESS CONTEXT FROM THE PROJECT OWNER:\nsuites"));
    }

    #[test]
    fn from_env_requires_a_key_only_for_the_hosted_default() {
        let _lock = ENV_LOCK.lock().unwrap();
        {
            let _env = EnvGuard::set(&[
                ("REDIRMAP_OPENAI_COMPAT_BASE_URL", None),
                ("REDIRMAP_OPENAI_COMPAT_API_KEY", None),
                ("OPENAI_API_KEY", None),
                ("REDIRMAP_OPENAI_COMPAT_MODEL", None),
            ]);
            let err = OpenAiCompatClient::from_env(reqwest::Client::new(), None).unwrap_err();
            assert!(matches!(err, Error::NotConfigured(_)));
        }
        {
            let _env = EnvGuard::set(&[
                ("REDIRMAP_OPENAI_COMPAT_BASE_URL", None),
                ("REDIRMAP_OPENAI_COMPAT_API_KEY", None),
                ("OPENAI_API_KEY", Some("sk-test")),
                ("REDIRMAP_OPENAI_COMPAT_MODEL", None),
            ]);
            let c = OpenAiCompatClient::from_env(reqwest::Client::new(), None).unwrap();
            assert_eq!(c.base_url(), "https://api.openai.com");
            assert_eq!(c.model(), "gpt-3.5-turbo");
        }
        {
            let _env = EnvGuard::set(&[
                ("REDIRMAP_OPENAI_COMPAT_BASE_URL", Some("http://127.0.0.1:9/")),
                ("REDIRMAP_OPENAI_COMPAT_API_KEY", None),
                ("OPENAI_API_KEY", None),
                ("REDIRMAP_OPENAI_COMPAT_MODEL", Some("local-model")),
            ]);
            let c = OpenAiCompatClient::from_env(reqwest::Client::new(), None).unwrap();
            assert_eq!(c.model(), "local-model");
            assert_eq!(c.endpoint_chat_completions(), "http://127.0.0.1:9/v1/chat/completions");
        }
    }

    async fn serve(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn matcher_posts_chat_completion_and_returns_content() {
        let seen: Arc<Mutex<Option<serde_json::Value>>> = Arc::new(Mutex::new(None));
        let app = Router::new()
            .route(
                "/v1/chat/completions",
                post(
                    |State(seen): State<Arc<Mutex<Option<serde_json::Value>>>>,
                     Json(body): Json<serde_json::Value>| async move {
                        *seen.lock().unwrap() = Some(body);
                        Json(serde_json::json!({
                            "choices": [{"message": {"role": "assistant",
                                "content": "{\"correspondences\": [], \"unmatched\": [\"/fr/contact\"]}"}}]
                        }))
                    },
                ),
            )
            .with_state(seen.clone());
        let addr = serve(app).await;

        let client = OpenAiCompatClient::new(
            reqwest::Client::new(),
            format!("http://{addr}"),
            Some("sk-test".to_string()),
            "test-model",
        );
        let matcher = OpenAiCompatMatcher::new(client).with_timeout_ms(5_000);
        let out = matcher.complete(&request()).await.unwrap();
        assert!(out.contains("unmatched"));

        let body = seen.lock().unwrap().clone().unwrap();
        assert_eq!(body["model"], "test-model");
        assert_eq!(body["max_tokens"], 4000);
        assert_eq!(body["temperature"], 0.1);
        assert_eq!(body["messages"][0]["role"], "system");
        assert!(body["messages"][1]["content"]
            .as_str()
            .unwrap()
            .contains("/fr/chambres"));
    }

    #[tokio::test]
    async fn http_errors_and_empty_answers_are_llm_errors() {
        let app = Router::new()
            .route(
                "/v1/chat/completions",
                post(|| async { (StatusCode::TOO_MANY_REQUESTS, "slow down") }),
            )
            .route(
                "/empty/v1/chat/completions",
                post(|| async { Json(serde_json::json!({"choices": []})) }),
            );
        let addr = serve(app).await;

        let limited = OpenAiCompatMatcher::new(OpenAiCompatClient::new(
            reqwest::Client::new(),
            format!("http://{addr}"),
            None,
            "m",
        ));
        let err = limited.complete(&request()).await.unwrap_err();
        assert!(matches!(err, Error::Llm(ref m) if m.contains("429")));

        let empty = OpenAiCompatMatcher::new(OpenAiCompatClient::new(
            reqwest::Client::new(),
            format!("http://{addr}/empty"),
            None,
            "m",
        ));
        assert!(matches!(empty.complete(&request()).await, Err(Error::Llm(_))));
    }
}
