/// Errors surfaced by the UPnP layers.
///
/// SOAP faults reported by a renderer inside a well-formed envelope are NOT
/// errors at the transport layer; they travel as [`crate::SoapResponse::Fault`]
/// values and only become [`Error::Command`] once an action call interprets
/// them.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transport error: {0:#}")]
    Transport(#[source] anyhow::Error),

    #[error("unexpected HTTP status {0}")]
    Http(u16),

    #[error("command failed with code {code}: {description}")]
    Command { code: u32, description: String },

    #[error("protocol error: {0:#}")]
    Protocol(#[source] anyhow::Error),

    #[error("invalid duration {0:?}")]
    InvalidDuration(String),

    #[error("missing argument {0:?}")]
    MissingArgument(String),

    #[error("unexpected argument {0:?}")]
    UnexpectedArgument(String),

    #[error("unknown action {0:?}")]
    UnknownAction(String),

    #[error("unknown service {0:?}")]
    UnknownService(String),

    #[error("unknown attribute {0:?}")]
    UnknownAttribute(String),

    #[error("service {0:?} is not initialized")]
    ServiceNotInitialized(String),

    #[error("device is gone")]
    DeviceGone,
}

impl Error {
    pub(crate) fn protocol(e: impl Into<anyhow::Error>) -> Self {
        Error::Protocol(e.into())
    }

    pub(crate) fn transport(e: impl Into<anyhow::Error>) -> Self {
        Error::Transport(e.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
