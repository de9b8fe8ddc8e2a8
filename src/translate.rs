//! Translation proxy: validates requests, enforces the allowed origin and
//! forwards to the translator backend with server-side credentials.

use crate::config::{origin_matches, Secret, TranslatorConfig};
use crate::error::AppError;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Longest text accepted per request, in characters.
pub const MAX_TEXT_CHARS: usize = 10_000;

/// Most target languages accepted per request.
pub const MAX_TARGETS: usize = 16;

/// Target languages, given either as one code or a list of codes.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Targets {
    One(String),
    Many(Vec<String>),
}

impl Default for Targets {
    fn default() -> Self {
        Targets::Many(Vec::new())
    }
}

impl Targets {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            Targets::One(code) => vec![code],
            Targets::Many(codes) => codes,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranslationRequest {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub to: Targets,
    #[serde(default)]
    pub from: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Translation {
    pub to: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranslationResponse {
    pub translations: Vec<Translation>,
}

/// A request that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedRequest {
    pub text: String,
    pub to: Vec<String>,
    pub from: Option<String>,
}

impl TranslationRequest {
    /// Append target codes given outside the body, e.g. as `?to=` parameters.
    pub fn add_targets(&mut self, extra: impl IntoIterator<Item = String>) {
        let mut codes = std::mem::take(&mut self.to).into_vec();
        codes.extend(extra);
        self.to = Targets::Many(codes);
    }

    pub fn validate(self) -> Result<ValidatedRequest, AppError> {
        let text = self.text.trim();
        if text.is_empty() {
            return Err(AppError::invalid("text must not be empty"));
        }
        if text.chars().count() > MAX_TEXT_CHARS {
            return Err(AppError::invalid(format!(
                "text exceeds {} characters",
                MAX_TEXT_CHARS
            )));
        }

        let mut to: Vec<String> = Vec::new();
        for code in self.to.into_vec() {
            let code = code.trim();
            if code.is_empty() {
                return Err(AppError::invalid("empty target language code"));
            }
            if !to.iter().any(|c| c == code) {
                to.push(code.to_string());
            }
        }
        if to.is_empty() {
            return Err(AppError::invalid("at least one target language is required"));
        }
        if to.len() > MAX_TARGETS {
            return Err(AppError::invalid(format!(
                "at most {} target languages are allowed",
                MAX_TARGETS
            )));
        }

        let from = self
            .from
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty());

        Ok(ValidatedRequest {
            text: text.to_string(),
            to,
            from,
        })
    }
}

/// Upstream translation service.
#[async_trait]
pub trait TranslationBackend: Send + Sync {
    async fn translate(&self, request: &ValidatedRequest) -> Result<Vec<Translation>, AppError>;
}

/// Translator Text API v3.0 client.
pub struct AzureTranslator {
    client: Client,
    url: String,
    key: Secret,
    region: String,
}

#[derive(Serialize)]
struct UpstreamText<'a> {
    #[serde(rename = "Text")]
    text: &'a str,
}

#[derive(Deserialize)]
struct UpstreamResult {
    translations: Vec<Translation>,
}

#[derive(Deserialize)]
struct UpstreamErrorBody {
    error: UpstreamErrorDetail,
}

#[derive(Deserialize)]
struct UpstreamErrorDetail {
    #[serde(default)]
    code: Option<serde_json::Value>,
    message: String,
}

impl AzureTranslator {
    pub fn new(config: &TranslatorConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            url: format!("{}/translator/text/v3.0/translate", config.endpoint),
            key: config.key.clone(),
            region: config.region.clone(),
        })
    }
}

#[async_trait]
impl TranslationBackend for AzureTranslator {
    async fn translate(&self, request: &ValidatedRequest) -> Result<Vec<Translation>, AppError> {
        let mut query: Vec<(&str, &str)> = vec![("api-version", "3.0")];
        query.extend(request.to.iter().map(|code| ("to", code.as_str())));
        if let Some(from) = &request.from {
            query.push(("from", from.as_str()));
        }

        let response = self
            .client
            .post(&self.url)
            .query(&query)
            .header("Ocp-Apim-Subscription-Key", self.key.expose())
            .header("Ocp-Apim-Subscription-Region", &self.region)
            .json(&[UpstreamText {
                text: &request.text,
            }])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::UpstreamUnavailable("translator timed out".to_string())
                } else {
                    AppError::UpstreamUnavailable("translator unreachable".to_string())
                }
            })?;

        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::UpstreamRejected(rejection_message(status, &body)));
        }
        if !status.is_success() {
            return Err(AppError::UpstreamUnavailable(format!(
                "translator returned {}",
                status
            )));
        }

        let mut results: Vec<UpstreamResult> = response
            .json()
            .await
            .map_err(|_| AppError::UpstreamUnavailable("malformed translator response".to_string()))?;
        match results.pop() {
            Some(result) if results.is_empty() => Ok(result.translations),
            _ => Err(AppError::UpstreamUnavailable(
                "unexpected translator response shape".to_string(),
            )),
        }
    }
}

fn rejection_message(status: StatusCode, body: &str) -> String {
    match serde_json::from_str::<UpstreamErrorBody>(body) {
        Ok(parsed) => match parsed.error.code {
            Some(code) => format!("{} ({})", parsed.error.message, code),
            None => parsed.error.message,
        },
        Err(_) => format!("translator returned {}", status),
    }
}

/// Origin-checked front for a [`TranslationBackend`].
pub struct TranslationProxy {
    backend: Arc<dyn TranslationBackend>,
    allowed_origin: String,
}

impl TranslationProxy {
    pub fn new(backend: Arc<dyn TranslationBackend>, allowed_origin: impl Into<String>) -> Self {
        Self {
            backend,
            allowed_origin: allowed_origin.into(),
        }
    }

    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        origin_matches(&self.allowed_origin, origin)
    }

    /// Check `origin`, then decode, validate and forward the request.
    ///
    /// `decode` only runs for an allowed origin, so a denied caller learns
    /// nothing about what a well-formed request looks like.
    pub async fn translate<F>(
        &self,
        origin: Option<&str>,
        decode: F,
    ) -> Result<TranslationResponse, AppError>
    where
        F: FnOnce() -> Result<TranslationRequest, AppError>,
    {
        if !self.origin_allowed(origin) {
            warn!(origin = ?origin, "Translation request from disallowed origin");
            return Err(AppError::OriginDenied);
        }
        let request = decode()?.validate()?;
        debug!(chars = request.text.chars().count(), to = ?request.to, from = ?request.from, "Forwarding translation");

        let translations = self.backend.translate(&request).await.map_err(|e| {
            warn!(error = %e, "Translation failed");
            e
        })?;
        Ok(TranslationResponse { translations })
    }
}
