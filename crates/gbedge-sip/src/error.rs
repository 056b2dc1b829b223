use thiserror::Error;

#[derive(Error, Debug)]
pub enum SipError {
    #[error("Failed to parse SIP message: {0}")]
    Parse(String),

    #[error("Failed to parse SDP: {0}")]
    Sdp(String),

    #[error("Failed to parse MANSCDP XML: {0}")]
    Xml(String),

    #[error("Connection closed by peer")]
    Disconnected,

    #[error("Unknown transaction {0}")]
    UnknownTransaction(i32),

    #[error("Unknown registration {0}")]
    UnknownRegistration(i32),

    #[error("Unknown dialog {0}")]
    UnknownDialog(i32),

    #[error("Media error: {0}")]
    Media(#[from] gbedge_media::MediaError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, SipError>;
