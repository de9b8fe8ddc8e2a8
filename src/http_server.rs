//! HTTP server implementation using Axum.

use crate::error::AppError;
use crate::rooms::RoomSummary;
use crate::signaling;
use crate::state::AppState;
use crate::translate::{TranslationRequest, TranslationResponse};
use axum::{
    body::Bytes,
    extract::{
        rejection::QueryRejection,
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderMap, HeaderValue, Method},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use std::net::SocketAddr;
use tokio::time::Instant;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechTokenResponse {
    token: String,
    region: String,
    expires_in_seconds: u64,
}

/// Build the router with every endpoint and middleware attached.
pub fn build_router(state: AppState) -> Router {
    let allow_origin = if state.config.allows_any_origin() {
        AllowOrigin::from(Any)
    } else {
        match HeaderValue::from_str(&state.config.allowed_origin) {
            Ok(origin) => AllowOrigin::exact(origin),
            Err(_) => AllowOrigin::list(Vec::<HeaderValue>::new()),
        }
    };
    let cors = CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        // Signaling
        .route("/ws", get(signaling_upgrade))
        // Credential-shielding proxies
        .route("/translate", post(translate))
        .route("/speech/token", get(speech_token))
        // Diagnostics
        .route("/rooms", get(list_rooms))
        .route("/health", get(health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP server on the given address until Ctrl-C or SIGTERM.
pub async fn run_server(addr: SocketAddr, state: AppState) -> std::io::Result<()> {
    let app = build_router(state);

    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

fn request_origin(headers: &HeaderMap) -> Option<&str> {
    headers.get(header::ORIGIN).and_then(|v| v.to_str().ok())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "ok": true }))
}

async fn list_rooms(State(state): State<AppState>) -> Json<Vec<RoomSummary>> {
    Json(state.rooms.snapshot())
}

async fn signaling_upgrade(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let origin = request_origin(&headers);
    if !state.config.origin_allowed(origin) {
        warn!(origin = ?origin, "Signaling connection from disallowed origin");
        return AppError::OriginDenied.into_response();
    }
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };
    let rooms = state.rooms.clone();
    ws.on_upgrade(move |socket| signaling::serve_connection(socket, rooms))
}

async fn translate(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<Vec<(String, String)>>, QueryRejection>,
    body: Bytes,
) -> Result<Json<TranslationResponse>, AppError> {
    let origin = request_origin(&headers);
    let response = state
        .translator
        .translate(origin, move || decode_translation(query, &body))
        .await?;
    info!(targets = response.translations.len(), "POST /translate ok");
    Ok(Json(response))
}

fn decode_translation(
    query: Result<Query<Vec<(String, String)>>, QueryRejection>,
    body: &[u8],
) -> Result<TranslationRequest, AppError> {
    let Query(params) =
        query.map_err(|e| AppError::invalid(format!("malformed query: {}", e.body_text())))?;
    let mut request: TranslationRequest = serde_json::from_slice(body)
        .map_err(|e| AppError::invalid(format!("malformed body: {}", e)))?;
    request.add_targets(
        params
            .into_iter()
            .filter(|(key, _)| key == "to")
            .map(|(_, value)| value),
    );
    Ok(request)
}

async fn speech_token(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<SpeechTokenResponse>, AppError> {
    let origin = request_origin(&headers);
    if !state.config.origin_allowed(origin) {
        warn!(origin = ?origin, "Speech token request from disallowed origin");
        return Err(AppError::OriginDenied);
    }
    let entry = state.tokens.get_token().await?;
    Ok(Json(SpeechTokenResponse {
        expires_in_seconds: entry.expires_in(Instant::now()).as_secs(),
        token: entry.token,
        region: state.config.speech.region.clone(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::token::TokenSource;
    use crate::translate::{Translation, TranslationBackend, ValidatedRequest};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tower::ServiceExt;

    const ORIGIN: &str = "https://call.example.com";

    #[derive(Default)]
    struct EchoBackend {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TranslationBackend for EchoBackend {
        async fn translate(&self, request: &ValidatedRequest) -> Result<Vec<Translation>, AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(request
                .to
                .iter()
                .map(|to| Translation {
                    to: to.clone(),
                    text: format!("{}:{}", to, request.text),
                })
                .collect())
        }
    }

    struct FixedSource(Option<&'static str>);

    #[async_trait]
    impl TokenSource for FixedSource {
        async fn issue_token(&self) -> Result<String, AppError> {
            self.0
                .map(str::to_string)
                .ok_or_else(|| AppError::TokenUnavailable("backend down".to_string()))
        }
    }

    fn app(token: Option<&'static str>) -> (Router, Arc<EchoBackend>) {
        let backend = Arc::new(EchoBackend::default());
        let state = AppState::with_backends(
            test_config(ORIGIN),
            backend.clone(),
            Arc::new(FixedSource(token)),
        );
        (build_router(state), backend)
    }

    fn translate_request(origin: Option<&str>, uri: &str, body: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(origin) = origin {
            builder = builder.header(header::ORIGIN, origin);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_translate_from_allowed_origin() {
        let (app, backend) = app(Some("tok"));
        let response = app
            .oneshot(translate_request(
                Some(ORIGIN),
                "/translate",
                r#"{"text":"hello","to":["fr"]}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["translations"][0]["to"], "fr");
        assert_eq!(body["translations"][0]["text"], "fr:hello");
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_translate_targets_from_query() {
        let (app, _) = app(Some("tok"));
        let response = app
            .oneshot(translate_request(
                Some(ORIGIN),
                "/translate?to=de&to=es",
                r#"{"text":"hello"}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["translations"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_translate_from_other_origin_is_forbidden() {
        let (app, backend) = app(Some("tok"));
        let response = app
            .oneshot(translate_request(
                Some("https://evil.example.com"),
                "/translate",
                "not even json",
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(json_body(response).await["error"], "origin-denied");
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_translate_bad_requests() {
        for body in [r#"{"text":"","to":["fr"]}"#, r#"{"text":"hi"}"#, "{"] {
            let (app, backend) = app(Some("tok"));
            let response = app
                .oneshot(translate_request(Some(ORIGIN), "/translate", body))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body {}", body);
            assert_eq!(json_body(response).await["error"], "invalid-request");
            assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
        }
    }

    fn token_request(origin: Option<&str>) -> Request<Body> {
        let mut builder = Request::get("/speech/token");
        if let Some(origin) = origin {
            builder = builder.header(header::ORIGIN, origin);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_translate_malformed_query_gets_json_error() {
        let (app, backend) = app(Some("tok"));
        let response = app
            .oneshot(translate_request(
                Some(ORIGIN),
                "/translate?to=%FF&&=x&to",
                r#"{"text":"hello"}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["error"], "invalid-request");
        assert!(body["message"].is_string());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_decode_translation_merges_query_targets() {
        let query = Ok(Query(vec![
            ("to".to_string(), "de".to_string()),
            ("other".to_string(), "x".to_string()),
        ]));
        let request = decode_translation(query, br#"{"text":"hi","to":"fr"}"#).unwrap();
        assert_eq!(request.validate().unwrap().to, vec!["fr".to_string(), "de".to_string()]);

        let err = decode_translation(Ok(Query(Vec::new())), b"[").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn test_speech_token() {
        let (app, _) = app(Some("sts-token"));
        let response = app.oneshot(token_request(Some(ORIGIN))).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["token"], "sts-token");
        assert_eq!(body["region"], "westeurope");
        let expires = body["expiresInSeconds"].as_u64().unwrap();
        assert!(expires > 590 && expires <= 600);
        assert!(body.get("key").is_none());
    }

    #[tokio::test]
    async fn test_speech_token_unavailable() {
        let (app, _) = app(None);
        let response = app.oneshot(token_request(Some(ORIGIN))).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(json_body(response).await["error"], "token-unavailable");
    }

    #[tokio::test]
    async fn test_speech_token_from_other_origin_is_forbidden() {
        for origin in [Some("https://evil.example.com"), None] {
            let (app, _) = app(Some("sts-token"));
            let response = app.oneshot(token_request(origin)).await.unwrap();
            assert_eq!(response.status(), StatusCode::FORBIDDEN);
            let body = json_body(response).await;
            assert_eq!(body["error"], "origin-denied");
            assert!(body.get("token").is_none());
        }
    }

    #[tokio::test]
    async fn test_health_and_rooms() {
        let (app, _) = app(Some("tok"));
        let response = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["ok"], true);

        let response = app
            .oneshot(Request::get("/rooms").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(json_body(response).await, serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_signaling_rejects_other_origin() {
        let (app, _) = app(Some("tok"));
        let request = Request::get("/ws")
            .header(header::ORIGIN, "https://evil.example.com")
            .header(header::CONNECTION, "upgrade")
            .header(header::UPGRADE, "websocket")
            .header(header::SEC_WEBSOCKET_VERSION, "13")
            .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
