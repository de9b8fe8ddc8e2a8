//! Error taxonomy shared by the signaling channel and the REST proxies.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Stable, wire-visible error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    RoomFull,
    NotInRoom,
    NoPeer,
    InvalidRequest,
    OriginDenied,
    UpstreamRejected,
    UpstreamUnavailable,
    TokenUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AppError {
    #[error("room {0:?} already has two participants")]
    RoomFull(String),

    #[error("session has not joined a room")]
    NotInRoom,

    #[error("no peer in room {0:?}")]
    NoPeer(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("origin not allowed")]
    OriginDenied,

    #[error("upstream rejected request: {0}")]
    UpstreamRejected(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("speech token unavailable: {0}")]
    TokenUnavailable(String),
}

impl AppError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RoomFull(_) => ErrorKind::RoomFull,
            Self::NotInRoom => ErrorKind::NotInRoom,
            Self::NoPeer(_) => ErrorKind::NoPeer,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::OriginDenied => ErrorKind::OriginDenied,
            Self::UpstreamRejected(_) => ErrorKind::UpstreamRejected,
            Self::UpstreamUnavailable(_) => ErrorKind::UpstreamUnavailable,
            Self::TokenUnavailable(_) => ErrorKind::TokenUnavailable,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::OriginDenied => StatusCode::FORBIDDEN,
            Self::UpstreamRejected(_) | Self::UpstreamUnavailable(_) | Self::TokenUnavailable(_) => {
                StatusCode::BAD_GATEWAY
            }
            Self::RoomFull(_) => StatusCode::CONFLICT,
            Self::NotInRoom | Self::NoPeer(_) => StatusCode::BAD_REQUEST,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorKind,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.kind(),
            message: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}
