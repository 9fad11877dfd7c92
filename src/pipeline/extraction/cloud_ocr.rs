//! Tier 3: remote vision models, tried in a fixed priority order.
//!
//! Providers sometimes answer with a polite refusal or an error message
//! instead of an HTTP error. Every response is inspected before it is
//! accepted; a degenerate answer moves on to the next provider.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, info_span, warn, Instrument};

use super::confidence::{char_len, heuristic_text_confidence};
use super::preprocess::encode_png;
use super::task::run_blocking;
use super::types::{CloudOcrProvider, PageImage};
use super::ExtractionError;

/// Instruction sent with every page batch.
const OCR_PROMPT: &str = "Transcribe all text in these contract page images exactly as written. \
The text is mostly Arabic with some English, numbers and dates. Preserve line breaks and \
reading order. Output only the transcribed text with no commentary.";

const TEMPERATURE: f32 = 0.1;
const MAX_OUTPUT_TOKENS: u32 = 8192;

/// Refusal and error phrasing is only looked for in the opening of a response.
/// Contract bodies legitimately contain words like "unable to".
const DEGENERATE_HEAD_CHARS: usize = 200;

// ═══════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CloudProviderKind {
    Gemini,
    OpenaiCompatible,
    Ollama,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudProviderConfig {
    pub kind: CloudProviderKind,
    /// Base URL. Defaults per kind when absent.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    pub model: String,
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
}

fn default_provider_timeout() -> u64 {
    60
}

impl CloudProviderConfig {
    pub fn new(kind: CloudProviderKind, model: &str) -> Self {
        Self {
            kind,
            endpoint: None,
            api_key: None,
            model: model.to_string(),
            timeout_secs: default_provider_timeout(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = Some(endpoint.to_string());
        self
    }

    pub fn with_api_key(mut self, key: &str) -> Self {
        self.api_key = Some(key.to_string());
        self
    }

    pub fn build(&self) -> Result<Arc<dyn CloudOcrProvider>, ExtractionError> {
        if self.model.trim().is_empty() {
            return Err(ExtractionError::InvalidConfig(
                "cloud provider model must not be empty".into(),
            ));
        }
        let key = || {
            self.api_key.clone().ok_or_else(|| {
                ExtractionError::InvalidConfig(format!("{:?} provider requires an api_key", self.kind))
            })
        };

        Ok(match self.kind {
            CloudProviderKind::Gemini => {
                let mut p = GeminiProvider::new(&key()?, &self.model, self.timeout_secs);
                if let Some(ref endpoint) = self.endpoint {
                    p.endpoint = trim_url(endpoint);
                }
                Arc::new(p)
            }
            CloudProviderKind::OpenaiCompatible => {
                let endpoint = self
                    .endpoint
                    .as_deref()
                    .unwrap_or("https://api.openai.com/v1");
                Arc::new(OpenAiCompatibleProvider::new(
                    endpoint,
                    &key()?,
                    &self.model,
                    self.timeout_secs,
                ))
            }
            CloudProviderKind::Ollama => {
                let endpoint = self
                    .endpoint
                    .as_deref()
                    .unwrap_or("http://localhost:11434");
                Arc::new(OllamaVisionProvider::new(endpoint, &self.model, self.timeout_secs))
            }
        })
    }
}

/// Providers available from the environment, in priority order.
pub fn providers_from_env() -> Vec<CloudProviderConfig> {
    providers_from_lookup(|name| std::env::var(name).ok())
}

pub(crate) fn providers_from_lookup<F>(lookup: F) -> Vec<CloudProviderConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
    let mut providers = Vec::new();

    if let Some(key) = get("GEMINI_API_KEY") {
        let model = get("GEMINI_MODEL").unwrap_or_else(|| "gemini-1.5-flash".to_string());
        providers.push(CloudProviderConfig::new(CloudProviderKind::Gemini, &model).with_api_key(&key));
    }
    if let Some(key) = get("DEEPSEEK_API_KEY") {
        let model = get("DEEPSEEK_MODEL").unwrap_or_else(|| "deepseek-chat".to_string());
        providers.push(
            CloudProviderConfig::new(CloudProviderKind::OpenaiCompatible, &model)
                .with_endpoint("https://api.deepseek.com")
                .with_api_key(&key),
        );
    }
    if let Some(key) = get("OPENAI_API_KEY") {
        let model = get("OPENAI_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string());
        providers.push(
            CloudProviderConfig::new(CloudProviderKind::OpenaiCompatible, &model)
                .with_endpoint("https://api.openai.com/v1")
                .with_api_key(&key),
        );
    }
    if let Some(model) = get("OLLAMA_OCR_MODEL") {
        let host = get("OLLAMA_HOST").unwrap_or_else(|| "http://localhost:11434".to_string());
        providers.push(CloudProviderConfig::new(CloudProviderKind::Ollama, &model).with_endpoint(&host));
    }
    providers
}

// ═══════════════════════════════════════════════════════════
// Degenerate response detection
// ═══════════════════════════════════════════════════════════

struct DegeneratePattern {
    regex: Regex,
    description: &'static str,
}

static DEGENERATE_PATTERNS: LazyLock<Vec<DegeneratePattern>> = LazyLock::new(|| {
    vec![
        pattern(r"(?i)\bI(?:'|’)?m\s+sorry\b|\bI\s+am\s+sorry\b", "apology"),
        pattern(r"(?i)\bI\s+(?:cannot|can(?:'|’)t|can\s+not)\b", "refusal"),
        pattern(r"(?i)\bunable\s+to\b", "refusal"),
        pattern(r"(?i)\bas\s+an\s+AI\b", "model disclaimer"),
        pattern(r"عذرا|عذراً|آسف", "apology (Arabic)"),
        pattern(r"لا\s*أستطيع|لا\s*يمكنني", "refusal (Arabic)"),
        pattern(r"(?i)^\s*error\s*:", "error string"),
        pattern(r"(?i)internal\s+server\s+error", "server error"),
        pattern(r"(?i)rate\s*limit", "rate limit"),
        pattern(r"(?i)invalid\s+api\s+key", "credential error"),
    ]
});

fn pattern(re: &str, description: &'static str) -> DegeneratePattern {
    DegeneratePattern {
        regex: Regex::new(re).expect("invalid degenerate pattern"),
        description,
    }
}

/// Why a provider response should be discarded, or `None` if it is usable.
pub fn detect_degenerate(text: &str, min_chars: usize) -> Option<String> {
    let len = char_len(text);
    if len == 0 {
        return Some("empty response".into());
    }
    if len < min_chars {
        return Some(format!("response too short ({len} < {min_chars} chars)"));
    }

    let head: String = text.trim().chars().take(DEGENERATE_HEAD_CHARS).collect();
    DEGENERATE_PATTERNS
        .iter()
        .find(|p| p.regex.is_match(&head))
        .map(|p| format!("{} detected in response", p.description))
}

// ═══════════════════════════════════════════════════════════
// Client
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
pub struct CloudOcrResult {
    pub text: String,
    pub confidence: f32,
    pub provider: String,
    pub pages_sent: usize,
}

/// Ordered provider list plus the tier's page cap and character floor.
pub struct CloudOcrClient {
    providers: Vec<Arc<dyn CloudOcrProvider>>,
    max_pages: usize,
    min_chars: usize,
}

impl CloudOcrClient {
    pub fn new(providers: Vec<Arc<dyn CloudOcrProvider>>, max_pages: usize, min_chars: usize) -> Self {
        Self {
            providers,
            max_pages: max_pages.max(1),
            min_chars,
        }
    }

    pub fn from_configs(
        configs: &[CloudProviderConfig],
        max_pages: usize,
        min_chars: usize,
    ) -> Result<Self, ExtractionError> {
        let providers = configs
            .iter()
            .map(CloudProviderConfig::build)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(providers, max_pages, min_chars))
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn max_pages(&self) -> usize {
        self.max_pages
    }

    /// First non-degenerate transcription of up to `max_pages` pages.
    ///
    /// Provider failures fall through to the next provider. Reaching the
    /// deadline stops immediately.
    pub async fn recognize(
        &self,
        pages: &[PageImage],
        deadline: Instant,
    ) -> Result<CloudOcrResult, ExtractionError> {
        if self.providers.is_empty() {
            return Err(ExtractionError::NoProviders);
        }

        let batch: Arc<Vec<PageImage>> =
            Arc::new(pages.iter().take(self.max_pages).cloned().collect());
        let pages_sent = batch.len();
        let mut attempted = 0;

        for provider in &self.providers {
            attempted += 1;
            let name = provider.name().to_string();
            let span = info_span!("cloud_provider", provider = %name, pages = pages_sent);

            let call = {
                let provider = Arc::clone(provider);
                let batch = Arc::clone(&batch);
                run_blocking(deadline, "cloud-ocr", move || provider.recognize(&batch))
            };

            match call.instrument(span).await {
                Ok(text) => {
                    if let Some(reason) = detect_degenerate(&text, self.min_chars) {
                        let e = ExtractionError::ProviderDegenerate {
                            provider: name,
                            reason,
                        };
                        warn!(error = %e, "Discarding provider response");
                        continue;
                    }
                    let confidence = heuristic_text_confidence(&text);
                    info!(provider = %name, chars = char_len(&text), confidence, "Cloud OCR succeeded");
                    return Ok(CloudOcrResult {
                        text: text.trim().to_string(),
                        confidence,
                        provider: name,
                        pages_sent,
                    });
                }
                Err(e @ ExtractionError::DeadlineExceeded { .. }) => return Err(e),
                Err(e) => {
                    warn!(provider = %name, error = %e, "Cloud provider failed, trying next");
                }
            }
        }

        Err(ExtractionError::ProvidersExhausted { attempted })
    }
}

// ═══════════════════════════════════════════════════════════
// HTTP plumbing
// ═══════════════════════════════════════════════════════════

fn trim_url(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

/// Blocking client, created on the calling (blocking) thread.
fn http_client(provider: &str, timeout_secs: u64) -> Result<reqwest::blocking::Client, ExtractionError> {
    reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| ExtractionError::ProviderRequest {
            provider: provider.to_string(),
            reason: format!("HTTP client setup failed: {e}"),
        })
}

/// Scheme, host and path only. Query strings may carry credentials.
fn loggable_url(url: &str) -> &str {
    url.split(['?', '#']).next().unwrap_or(url)
}

fn map_send_error(provider: &str, url: &str, timeout_secs: u64, e: reqwest::Error) -> ExtractionError {
    if e.is_timeout() {
        ExtractionError::ProviderTimeout {
            provider: provider.to_string(),
            timeout_secs,
        }
    } else if e.is_connect() {
        ExtractionError::ProviderRequest {
            provider: provider.to_string(),
            reason: format!("cannot connect to {}", loggable_url(url)),
        }
    } else {
        ExtractionError::ProviderRequest {
            provider: provider.to_string(),
            reason: e.without_url().to_string(),
        }
    }
}

/// How a provider authenticates its requests.
enum ApiAuth<'a> {
    None,
    Bearer(&'a str),
    Header(&'static str, &'a str),
}

/// Send a JSON POST and decode the JSON body, surfacing non-2xx status as an error.
fn post_json<B, R>(
    provider: &str,
    url: &str,
    auth: ApiAuth<'_>,
    timeout_secs: u64,
    body: &B,
) -> Result<R, ExtractionError>
where
    B: Serialize,
    R: for<'de> Deserialize<'de>,
{
    let client = http_client(provider, timeout_secs)?;
    let request = client.post(url).json(body);
    let request = match auth {
        ApiAuth::None => request,
        ApiAuth::Bearer(token) => request.bearer_auth(token),
        ApiAuth::Header(name, value) => request.header(name, value),
    };

    let response = request
        .send()
        .map_err(|e| map_send_error(provider, url, timeout_secs, e))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        return Err(ExtractionError::ProviderRequest {
            provider: provider.to_string(),
            reason: format!("HTTP {}: {}", status.as_u16(), truncate(&body, 300)),
        });
    }

    response.json().map_err(|e| ExtractionError::ProviderRequest {
        provider: provider.to_string(),
        reason: format!("Failed to parse response: {}", e.without_url()),
    })
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

fn encode_pages(pages: &[PageImage]) -> Result<Vec<String>, ExtractionError> {
    pages
        .iter()
        .map(|p| encode_png(&p.image).map(|png| BASE64.encode(png)))
        .collect()
}

// ═══════════════════════════════════════════════════════════
// Gemini
// ═══════════════════════════════════════════════════════════

pub struct GeminiProvider {
    endpoint: String,
    api_key: String,
    model: String,
    timeout_secs: u64,
}

impl GeminiProvider {
    pub fn new(api_key: &str, model: &str, timeout_secs: u64) -> Self {
        Self {
            endpoint: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            timeout_secs,
        }
    }
}

#[derive(Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(rename = "generationConfig")]
    generation_config: GeminiGenerationConfig,
}

#[derive(Serialize)]
struct GeminiContent {
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum GeminiPart {
    Text { text: String },
    InlineData { inline_data: GeminiInlineData },
}

#[derive(Serialize)]
struct GeminiInlineData {
    mime_type: &'static str,
    data: String,
}

#[derive(Serialize)]
struct GeminiGenerationConfig {
    temperature: f32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
}

#[derive(Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    error: Option<ApiErrorBody>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: GeminiResponseContent,
}

#[derive(Deserialize)]
struct GeminiResponseContent {
    #[serde(default)]
    parts: Vec<GeminiResponsePart>,
}

#[derive(Deserialize)]
struct GeminiResponsePart {
    text: Option<String>,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    message: String,
}

fn gemini_request(encoded_pages: Vec<String>) -> GeminiRequest {
    let mut parts = vec![GeminiPart::Text {
        text: OCR_PROMPT.to_string(),
    }];
    parts.extend(encoded_pages.into_iter().map(|data| GeminiPart::InlineData {
        inline_data: GeminiInlineData {
            mime_type: "image/png",
            data,
        },
    }));
    GeminiRequest {
        contents: vec![GeminiContent { parts }],
        generation_config: GeminiGenerationConfig {
            temperature: TEMPERATURE,
            max_output_tokens: MAX_OUTPUT_TOKENS,
        },
    }
}

fn gemini_text(response: GeminiResponse) -> Result<String, ExtractionError> {
    if let Some(error) = response.error {
        return Err(ExtractionError::ProviderRequest {
            provider: "gemini".into(),
            reason: error.message,
        });
    }
    let text: Vec<String> = response
        .candidates
        .and_then(|c| c.into_iter().next())
        .map(|c| c.content.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();
    if text.is_empty() {
        return Err(ExtractionError::ProviderRequest {
            provider: "gemini".into(),
            reason: "Gemini returned no candidates".into(),
        });
    }
    Ok(text.join(""))
}

impl CloudOcrProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn recognize(&self, pages: &[PageImage]) -> Result<String, ExtractionError> {
        let request = gemini_request(encode_pages(pages)?);
        let url = format!("{}/models/{}:generateContent", self.endpoint, self.model);
        let auth = ApiAuth::Header("x-goog-api-key", &self.api_key);
        let response: GeminiResponse =
            post_json(self.name(), &url, auth, self.timeout_secs, &request)?;
        gemini_text(response)
    }
}

// ═══════════════════════════════════════════════════════════
// OpenAI-compatible (OpenAI, DeepSeek, Groq, ...)
// ═══════════════════════════════════════════════════════════

pub struct OpenAiCompatibleProvider {
    name: String,
    endpoint: String,
    api_key: String,
    model: String,
    timeout_secs: u64,
}

impl OpenAiCompatibleProvider {
    pub fn new(endpoint: &str, api_key: &str, model: &str, timeout_secs: u64) -> Self {
        let endpoint = trim_url(endpoint);
        Self {
            name: provider_name_for(&endpoint),
            endpoint,
            api_key: api_key.to_string(),
            model: model.to_string(),
            timeout_secs,
        }
    }
}

/// Short provider label from the endpoint host, e.g. "deepseek" for api.deepseek.com.
fn provider_name_for(endpoint: &str) -> String {
    let host = endpoint
        .split("://")
        .nth(1)
        .unwrap_or(endpoint)
        .split(['/', ':'])
        .next()
        .unwrap_or_default();
    let labels: Vec<&str> = host.split('.').collect();
    match labels.len() {
        0 | 1 => host.to_string(),
        n => labels[n - 2].to_string(),
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: Vec<ChatContent>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ChatContent {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    error: Option<ApiErrorBody>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

impl CloudOcrProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn recognize(&self, pages: &[PageImage]) -> Result<String, ExtractionError> {
        let mut content = vec![ChatContent::Text {
            text: OCR_PROMPT.to_string(),
        }];
        content.extend(encode_pages(pages)?.into_iter().map(|data| ChatContent::ImageUrl {
            image_url: ImageUrl {
                url: format!("data:image/png;base64,{data}"),
            },
        }));
        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content,
            }],
            temperature: TEMPERATURE,
            max_tokens: MAX_OUTPUT_TOKENS,
        };

        let url = format!("{}/chat/completions", self.endpoint);
        let response: ChatResponse = post_json(
            self.name(),
            &url,
            ApiAuth::Bearer(&self.api_key),
            self.timeout_secs,
            &request,
        )?;

        if let Some(error) = response.error {
            return Err(ExtractionError::ProviderRequest {
                provider: self.name.clone(),
                reason: error.message,
            });
        }
        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ExtractionError::ProviderRequest {
                provider: self.name.clone(),
                reason: "response had no choices".into(),
            })
    }
}

// ═══════════════════════════════════════════════════════════
// Ollama (local vision model served over HTTP)
// ═══════════════════════════════════════════════════════════

pub struct OllamaVisionProvider {
    base_url: String,
    model: String,
    timeout_secs: u64,
}

impl OllamaVisionProvider {
    pub fn new(base_url: &str, model: &str, timeout_secs: u64) -> Self {
        Self {
            base_url: trim_url(base_url),
            model: model.to_string(),
            timeout_secs,
        }
    }
}

#[derive(Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage<'a>>,
    stream: bool,
}

#[derive(Serialize)]
struct OllamaMessage<'a> {
    role: &'a str,
    content: &'a str,
    images: Vec<String>,
}

#[derive(Deserialize)]
struct OllamaChatResponse {
    message: OllamaResponseMessage,
}

#[derive(Deserialize)]
struct OllamaResponseMessage {
    content: String,
}

impl CloudOcrProvider for OllamaVisionProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    fn recognize(&self, pages: &[PageImage]) -> Result<String, ExtractionError> {
        let request = OllamaChatRequest {
            model: &self.model,
            messages: vec![OllamaMessage {
                role: "user",
                content: OCR_PROMPT,
                images: encode_pages(pages)?,
            }],
            stream: false,
        };
        let url = format!("{}/api/chat", self.base_url);
        let response: OllamaChatResponse =
            post_json(self.name(), &url, ApiAuth::None, self.timeout_secs, &request)?;
        Ok(response.message.content)
    }
}

// ═══════════════════════════════════════════════════════════
// Mock provider
// ═══════════════════════════════════════════════════════════

/// Mock provider for unit tests. Records how many pages each call received.
pub struct MockCloudProvider {
    name: String,
    response: Result<String, String>,
    pages_seen: std::sync::Mutex<Vec<usize>>,
}

impl MockCloudProvider {
    pub fn new(name: &str, response: &str) -> Self {
        Self {
            name: name.to_string(),
            response: Ok(response.to_string()),
            pages_seen: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn failing(name: &str, reason: &str) -> Self {
        Self {
            name: name.to_string(),
            response: Err(reason.to_string()),
            pages_seen: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Page counts of each call so far.
    pub fn calls(&self) -> Vec<usize> {
        self.pages_seen
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl CloudOcrProvider for MockCloudProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn recognize(&self, pages: &[PageImage]) -> Result<String, ExtractionError> {
        self.pages_seen
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(pages.len());
        self.response
            .clone()
            .map_err(|reason| ExtractionError::ProviderRequest {
                provider: self.name.clone(),
                reason,
            })
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
