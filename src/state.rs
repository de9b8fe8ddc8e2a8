//! Shared application state.

use crate::config::Config;
use crate::rooms::RoomRegistry;
use crate::token::{SpeechTokenSource, TokenIssuer, TokenSource};
use crate::translate::{AzureTranslator, TranslationBackend, TranslationProxy};
use std::sync::Arc;

/// Handles passed into every request and connection task.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub rooms: Arc<RoomRegistry>,
    pub translator: Arc<TranslationProxy>,
    pub tokens: Arc<TokenIssuer>,
}

impl AppState {
    /// Build state wired to the real upstream services.
    pub fn new(config: Config) -> Result<Self, reqwest::Error> {
        let backend = Arc::new(AzureTranslator::new(&config.translator)?);
        let source = Arc::new(SpeechTokenSource::new(&config.speech)?);
        Ok(Self::with_backends(config, backend, source))
    }

    pub fn with_backends(
        config: Config,
        backend: Arc<dyn TranslationBackend>,
        source: Arc<dyn TokenSource>,
    ) -> Self {
        let translator = Arc::new(TranslationProxy::new(backend, config.allowed_origin.clone()));
        let tokens = Arc::new(TokenIssuer::new(source, &config.speech));
        Self {
            config: Arc::new(config),
            rooms: Arc::new(RoomRegistry::new()),
            translator,
            tokens,
        }
    }
}
