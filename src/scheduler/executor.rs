//! Step dispatch — prompt templating and routing to inference backends.
//!
//! Tiers prefixed `deepseek`/`qwen` (or an explicit `local` executor) go to
//! the local HTTP inference endpoint; `gemini*` tiers go to the remote API
//! with the key taken from the environment; everything else falls back to
//! local with the default model. Dispatch failures are data, not errors —
//! they feed the step retry path.

use serde_json::{json, Value};

/// Placeholders recognized in step prompts.
const PREV_RESULT: &str = "{{prev_result}}";
const PARENT_OUTPUTS: &str = "{{parent_outputs}}";

/// Error snippets from external services are clipped to this length.
const ERROR_SNIPPET_LEN: usize = 200;

/// Token cap requested from the local endpoint.
const LOCAL_NUM_PREDICT: u32 = 4096;

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const GEMINI_FLASH_MODEL: &str = "gemini-2.0-flash";

/// Where a step is dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Local { model: String },
    Gemini { model: String },
}

/// Pick a backend from the step's routing labels.
pub fn route(tier: Option<&str>, executor: Option<&str>, default_local_model: &str) -> Route {
    let tier = tier.unwrap_or("");
    let is_local_tier = tier.starts_with("deepseek") || tier.starts_with("qwen");

    if executor == Some("local") || is_local_tier {
        let model = if is_local_tier {
            tier.to_string()
        } else {
            default_local_model.to_string()
        };
        return Route::Local { model };
    }
    if tier == "gemini-flash" {
        return Route::Gemini {
            model: GEMINI_FLASH_MODEL.to_string(),
        };
    }
    if tier.starts_with("gemini") {
        return Route::Gemini {
            model: tier.to_string(),
        };
    }
    Route::Local {
        model: default_local_model.to_string(),
    }
}

/// Fill a step's prompt template with its parents' outputs. When the
/// template uses neither placeholder but parent output exists, a preamble is
/// prepended instead.
pub fn render_prompt(template: Option<&str>, parent_context: &str) -> String {
    let template = template.unwrap_or("");
    let has_placeholder = template.contains(PREV_RESULT) || template.contains(PARENT_OUTPUTS);

    if has_placeholder {
        return template
            .replace(PREV_RESULT, parent_context)
            .replace(PARENT_OUTPUTS, parent_context);
    }
    if parent_context.is_empty() {
        template.to_string()
    } else if template.is_empty() {
        format!("Previous step outputs:\n\n{parent_context}")
    } else {
        format!("Previous step outputs:\n\n{parent_context}\n\n{template}")
    }
}

/// Outcome of one dispatch.
#[derive(Debug)]
pub struct DispatchResult {
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl DispatchResult {
    fn ok(output: String) -> Self {
        Self {
            success: true,
            output: Some(output),
            error: None,
        }
    }

    fn err(message: impl Into<String>) -> Self {
        let mut message: String = message.into();
        if message.chars().count() > ERROR_SNIPPET_LEN {
            message = message.chars().take(ERROR_SNIPPET_LEN).collect();
        }
        Self {
            success: false,
            output: None,
            error: Some(message),
        }
    }
}

/// HTTP client over the configured inference backends.
pub struct ExecutorClient {
    client: reqwest::Client,
    ollama_url: String,
    default_local_model: String,
    gemini_base: String,
    gemini_key: Option<String>,
}

impl ExecutorClient {
    pub fn new(ollama_url: &str, default_local_model: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            ollama_url: ollama_url.trim_end_matches('/').to_string(),
            default_local_model: default_local_model.to_string(),
            gemini_base: std::env::var("GEMINI_BASE_URL")
                .unwrap_or_else(|_| GEMINI_BASE_URL.to_string()),
            gemini_key: std::env::var("GEMINI_API_KEY").ok(),
        }
    }

    pub fn default_local_model(&self) -> &str {
        &self.default_local_model
    }

    /// Dispatch a prompt to the routed backend. No client-side deadline: the
    /// scheduler's stuck detection is the safety net.
    pub async fn dispatch(&self, route: &Route, prompt: &str) -> DispatchResult {
        match route {
            Route::Local { model } => self.run_local(model, prompt).await,
            Route::Gemini { model } => self.run_gemini(model, prompt).await,
        }
    }

    /// `POST /api/generate` against the local endpoint.
    async fn run_local(&self, model: &str, prompt: &str) -> DispatchResult {
        let url = format!("{}/api/generate", self.ollama_url);
        let body = json!({
            "model": model,
            "prompt": prompt,
            "stream": false,
            "options": { "num_predict": LOCAL_NUM_PREDICT },
        });

        let resp = match self.client.post(&url).json(&body).send().await {
            Ok(resp) => resp,
            Err(e) => return DispatchResult::err(format!("local inference unreachable: {e}")),
        };
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return DispatchResult::err(format!("local inference {status}: {text}"));
        }
        let value: Value = match resp.json().await {
            Ok(v) => v,
            Err(e) => return DispatchResult::err(format!("bad local inference response: {e}")),
        };
        match value.get("response").and_then(|r| r.as_str()) {
            Some(text) => DispatchResult::ok(text.to_string()),
            None => DispatchResult::err("local inference response missing 'response' field"),
        }
    }

    /// `POST /v1beta/models/<model>:generateContent` against the remote API.
    async fn run_gemini(&self, model: &str, prompt: &str) -> DispatchResult {
        let Some(key) = self.gemini_key.as_deref() else {
            return DispatchResult::err("GEMINI_API_KEY is not set");
        };
        let url = format!(
            "{}/v1beta/models/{model}:generateContent?key={key}",
            self.gemini_base
        );
        let body = json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
        });

        let resp = match self.client.post(&url).json(&body).send().await {
            Ok(resp) => resp,
            Err(e) => return DispatchResult::err(format!("remote inference unreachable: {e}")),
        };
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return DispatchResult::err(format!("remote inference {status}: {text}"));
        }
        let value: Value = match resp.json().await {
            Ok(v) => v,
            Err(e) => return DispatchResult::err(format!("bad remote inference response: {e}")),
        };

        let text: String = value
            .pointer("/candidates/0/content/parts")
            .and_then(|parts| parts.as_array())
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        if text.is_empty() {
            return DispatchResult::err("remote inference returned no text candidates");
        }
        DispatchResult::ok(text)
    }
}
