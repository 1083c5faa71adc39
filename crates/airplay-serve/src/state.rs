use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Features bitmask advertised to clients. 0x77 instead of 0x07 so that
/// ordinary apps may AirPlay too; it also makes clients send the body for
/// `/play` as a binary plist.
pub const DEFAULT_FEATURES: u64 = 0x77;
pub const MODEL_NAME: &str = "AppleTV2,1";
pub const PROTOCOL_VERSION: &str = "1.0";
pub const SOURCE_VERSION: &str = "101.10";

/// Identity reported by `/server-info` and the Zeroconf TXT record.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    /// MAC-style `XX:XX:XX:XX:XX:XX` device id.
    pub device_id: String,
    pub features: u64,
    pub model: String,
}

impl ServerInfo {
    pub fn new(device_id: String) -> Self {
        Self {
            device_id,
            features: DEFAULT_FEATURES,
            model: MODEL_NAME.to_owned(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AirPlayError {
    /// Another client already holds the session.
    #[error("session in progress")]
    SessionRejected,

    #[error("bad request: {0:#}")]
    BadRequest(#[source] anyhow::Error),

    #[error("device not available")]
    NotFound,

    #[error("internal error: {0:#}")]
    Internal(#[source] anyhow::Error),
}

impl IntoResponse for AirPlayError {
    fn into_response(self) -> Response {
        let status = match &self {
            // AirPlay-specific code for a busy receiver.
            AirPlayError::SessionRejected => {
                StatusCode::from_u16(453).expect("453 is a valid status code")
            }
            AirPlayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AirPlayError::NotFound => StatusCode::NOT_FOUND,
            AirPlayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::debug!(%status, "AirPlay request failed: {self:#}");
        status.into_response()
    }
}

/// What an AirPlay server needs from whatever actually plays the media.
/// The bridge's per-renderer control point implements this.
#[async_trait]
pub trait AirPlayBackend: Send + Sync + 'static {
    /// Establishes, confirms or (with `None`) releases the client session.
    async fn set_session_id(&self, session_id: Option<String>) -> Result<(), AirPlayError>;

    async fn play(&self, location: String, start_position: f64) -> Result<(), AirPlayError>;

    async fn stop(&self) -> Result<(), AirPlayError>;

    async fn set_scrub(&self, position: f64) -> Result<(), AirPlayError>;

    /// Returns `(duration, position)` in seconds.
    async fn get_scrub(&self) -> Result<(f64, f64), AirPlayError>;

    async fn is_playing(&self) -> Result<bool, AirPlayError>;

    async fn rate(&self, value: f64) -> Result<(), AirPlayError>;

    async fn reverse(&self) -> Result<(), AirPlayError>;

    async fn photo(&self, data: Bytes, transition: Option<String>) -> Result<(), AirPlayError>;
}

pub struct AirPlayStateInner {
    pub backend: Arc<dyn AirPlayBackend>,
    pub info: ServerInfo,
}

pub type AirPlayState = Arc<AirPlayStateInner>;
