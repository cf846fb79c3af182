use std::net::SocketAddr;
use thiserror::Error;

/// Media layer errors
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("RTP resources exhausted: {0}")]
    ResourceExhaustion(String),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Socket error: {0}")]
    Socket(#[from] std::io::Error),

    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("No native encoder for codec {0}")]
    UnsupportedCodec(String),

    #[error("Invalid RTP port range {start}-{end}")]
    InvalidPortRange { start: u16, end: u16 },
}
