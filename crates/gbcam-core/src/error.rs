use thiserror::Error;

#[derive(Error, Debug)]
pub enum GbError {
    #[error("SIP parse error: {0}")]
    SipParse(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("XML error: {0}")]
    Xml(String),

    #[error("SDP error: {0}")]
    Sdp(String),

    #[error("Auth failed: {0}")]
    Auth(String),

    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Resource exhausted: {0}")]
    Resource(String),

    #[error("Timeout")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, GbError>;
