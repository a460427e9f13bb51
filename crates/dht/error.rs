use boson_cbor::error::CborDecodeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Decode error: {0}")]
    Decode(#[from] CborDecodeError),
    #[error("Invalid message: {0}")]
    InvalidMessage(&'static str),
    #[error("Unknown method: {0:#04x}")]
    UnknownMethod(u8),
    #[error("Unknown message type: {0:#04x}")]
    UnknownType(u8),
}
