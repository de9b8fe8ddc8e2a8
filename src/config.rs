//! Process-wide credentials and settings, loaded once from the environment.

use std::fmt;
use std::time::Duration;

/// Speech tokens issued by the STS endpoint live for ten minutes.
pub const SPEECH_TOKEN_TTL_SECS: u64 = 600;

const DEFAULT_TOKEN_SAFETY_MARGIN_SECS: u64 = 60;
const DEFAULT_TRANSLATE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_TOKEN_TIMEOUT_SECS: u64 = 15;

/// A credential that must never end up in a log line or a response body.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Debug, Clone)]
pub struct TranslatorConfig {
    pub key: Secret,
    pub region: String,
    /// Resource endpoint, e.g. `https://<name>.cognitiveservices.azure.com`.
    pub endpoint: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct SpeechConfig {
    pub key: Secret,
    pub region: String,
    pub token_endpoint: String,
    pub token_ttl: Duration,
    pub safety_margin: Duration,
    pub timeout: Duration,
}

/// Everything the proxies need, immutable after startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub translator: TranslatorConfig,
    pub speech: SpeechConfig,
    /// Single allowed browser origin, or `*` for any.
    pub allowed_origin: String,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &'static str| -> Result<String, ConfigError> {
            match lookup(name).map(|v| v.trim().to_string()) {
                Some(v) if !v.is_empty() => Ok(v),
                _ => Err(ConfigError::Missing(name)),
            }
        };
        let seconds = |name: &'static str, default: u64| -> Result<Duration, ConfigError> {
            match lookup(name) {
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .map_err(|_| ConfigError::Invalid { name, value: raw }),
                None => Ok(Duration::from_secs(default)),
            }
        };

        let translator = TranslatorConfig {
            key: Secret::new(required("TRANSLATOR_KEY")?),
            region: required("TRANSLATOR_REGION")?,
            endpoint: required("TRANSLATOR_ENDPOINT")?
                .trim_end_matches('/')
                .to_string(),
            timeout: seconds("TRANSLATE_TIMEOUT_SECS", DEFAULT_TRANSLATE_TIMEOUT_SECS)?,
        };

        let speech_region = required("SPEECH_REGION")?;
        let token_endpoint = lookup("SPEECH_TOKEN_ENDPOINT")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| default_token_endpoint(&speech_region));
        let token_ttl = Duration::from_secs(SPEECH_TOKEN_TTL_SECS);
        let safety_margin = seconds("TOKEN_SAFETY_MARGIN_SECS", DEFAULT_TOKEN_SAFETY_MARGIN_SECS)?;
        if safety_margin >= token_ttl {
            return Err(ConfigError::Invalid {
                name: "TOKEN_SAFETY_MARGIN_SECS",
                value: safety_margin.as_secs().to_string(),
            });
        }

        let speech = SpeechConfig {
            key: Secret::new(required("SPEECH_KEY")?),
            region: speech_region,
            token_endpoint,
            token_ttl,
            safety_margin,
            timeout: seconds("TOKEN_TIMEOUT_SECS", DEFAULT_TOKEN_TIMEOUT_SECS)?,
        };

        let allowed_origin = required("CORS_ALLOW_ORIGIN")?;
        if allowed_origin != "*"
            && (!allowed_origin.contains("://")
                || !allowed_origin.bytes().all(|b| b.is_ascii_graphic()))
        {
            return Err(ConfigError::Invalid {
                name: "CORS_ALLOW_ORIGIN",
                value: allowed_origin,
            });
        }

        Ok(Self {
            translator,
            speech,
            allowed_origin,
        })
    }

    pub fn allows_any_origin(&self) -> bool {
        self.allowed_origin == "*"
    }

    /// Whether a request carrying `origin` may use the service.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        origin_matches(&self.allowed_origin, origin)
    }
}

/// `*` admits any caller, including ones that send no `Origin` header.
pub fn origin_matches(allowed: &str, origin: Option<&str>) -> bool {
    if allowed == "*" {
        return true;
    }
    origin.is_some_and(|o| o.trim_end_matches('/') == allowed.trim_end_matches('/'))
}

fn default_token_endpoint(region: &str) -> String {
    format!("https://{}.api.cognitive.microsoft.com/sts/v1.0/issueToken", region)
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {name}")]
    Invalid { name: &'static str, value: String },
}

#[cfg(test)]
pub(crate) fn test_config(allowed_origin: &str) -> Config {
    Config {
        translator: TranslatorConfig {
            key: Secret::new("translator-secret"),
            region: "westeurope".to_string(),
            endpoint: "http://127.0.0.1:9".to_string(),
            timeout: Duration::from_secs(DEFAULT_TRANSLATE_TIMEOUT_SECS),
        },
        speech: SpeechConfig {
            key: Secret::new("speech-secret"),
            region: "westeurope".to_string(),
            token_endpoint: "http://127.0.0.1:9/sts/v1.0/issueToken".to_string(),
            token_ttl: Duration::from_secs(SPEECH_TOKEN_TTL_SECS),
            safety_margin: Duration::from_secs(DEFAULT_TOKEN_SAFETY_MARGIN_SECS),
            timeout: Duration::from_secs(DEFAULT_TOKEN_TIMEOUT_SECS),
        },
        allowed_origin: allowed_origin.to_string(),
    }
}
