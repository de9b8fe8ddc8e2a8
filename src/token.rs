//! Speech token issuance with a shared, single-flight refreshed cache.

use crate::config::{Secret, SpeechConfig};
use crate::error::AppError;
use crate::single_flight::SingleFlight;
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Upstream that mints a fresh speech token.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn issue_token(&self) -> Result<String, AppError>;
}

/// STS endpoint of the speech service.
pub struct SpeechTokenSource {
    client: Client,
    endpoint: String,
    key: Secret,
}

impl SpeechTokenSource {
    pub fn new(config: &SpeechConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            endpoint: config.token_endpoint.clone(),
            key: config.key.clone(),
        })
    }
}

#[async_trait]
impl TokenSource for SpeechTokenSource {
    async fn issue_token(&self) -> Result<String, AppError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("Ocp-Apim-Subscription-Key", self.key.expose())
            .body("")
            .send()
            .await
            .map_err(|e| AppError::TokenUnavailable(describe_transport_error(&e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::TokenUnavailable(format!(
                "token endpoint returned {}",
                status
            )));
        }

        let token = response
            .text()
            .await
            .map_err(|e| AppError::TokenUnavailable(describe_transport_error(&e)))?;
        let token = token.trim();
        if token.is_empty() {
            return Err(AppError::TokenUnavailable("empty token".to_string()));
        }
        Ok(token.to_string())
    }
}

fn describe_transport_error(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        "request timed out".to_string()
    } else if e.is_connect() {
        "connection failed".to_string()
    } else {
        "request failed".to_string()
    }
}

/// A cached speech token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenCacheEntry {
    pub token: String,
    pub issued_at: Instant,
    pub ttl: Duration,
}

impl TokenCacheEntry {
    pub fn expires_at(&self) -> Instant {
        self.issued_at + self.ttl
    }

    /// Still servable: not yet inside the safety margin before expiry.
    pub fn is_fresh(&self, now: Instant, margin: Duration) -> bool {
        now + margin < self.expires_at()
    }

    pub fn expires_in(&self, now: Instant) -> Duration {
        self.expires_at().saturating_duration_since(now)
    }
}

type Cache = Arc<Mutex<Option<TokenCacheEntry>>>;

/// Serves cached speech tokens and refreshes them near expiry.
pub struct TokenIssuer {
    source: Arc<dyn TokenSource>,
    cache: Cache,
    flight: SingleFlight<Result<TokenCacheEntry, AppError>>,
    ttl: Duration,
    margin: Duration,
    timeout: Duration,
}

impl TokenIssuer {
    pub fn new(source: Arc<dyn TokenSource>, config: &SpeechConfig) -> Self {
        Self {
            source,
            cache: Arc::new(Mutex::new(None)),
            flight: SingleFlight::new(),
            ttl: config.token_ttl,
            margin: config.safety_margin,
            timeout: config.timeout,
        }
    }

    /// Return a fresh token, fetching at most once per refresh window.
    pub async fn get_token(&self) -> Result<TokenCacheEntry, AppError> {
        if let Some(entry) = self.cached(Instant::now()) {
            return Ok(entry);
        }

        let source = Arc::clone(&self.source);
        let cache = Arc::clone(&self.cache);
        let (ttl, margin, timeout) = (self.ttl, self.margin, self.timeout);

        self.flight
            .run(move || async move {
                // A flight that finished between our cache check and now
                // already stored a fresh entry.
                if let Some(entry) = fresh(&cache, Instant::now(), margin) {
                    return Ok(entry);
                }

                // Freshness counts from before the request, never from
                // when the reply arrived.
                let issued_at = Instant::now();
                debug!("Requesting new speech token");
                let result = match tokio::time::timeout(timeout, source.issue_token()).await {
                    Ok(result) => result,
                    Err(_) => Err(AppError::TokenUnavailable("request timed out".to_string())),
                };

                let mut slot = cache.lock();
                match result {
                    Ok(token) => {
                        let entry = TokenCacheEntry {
                            token,
                            issued_at,
                            ttl,
                        };
                        *slot = Some(entry.clone());
                        info!(ttl_secs = ttl.as_secs(), "Speech token refreshed");
                        Ok(entry)
                    }
                    Err(e) => {
                        *slot = None;
                        warn!(error = %e, "Speech token refresh failed");
                        Err(e)
                    }
                }
            })
            .await
            .map_err(|e| AppError::TokenUnavailable(e.to_string()))?
    }

    fn cached(&self, now: Instant) -> Option<TokenCacheEntry> {
        fresh(&self.cache, now, self.margin)
    }
}

fn fresh(cache: &Cache, now: Instant, margin: Duration) -> Option<TokenCacheEntry> {
    cache
        .lock()
        .as_ref()
        .filter(|entry| entry.is_fresh(now, margin))
        .cloned()
}
