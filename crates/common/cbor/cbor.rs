pub mod constants;
pub mod decode;
pub mod encode;
pub mod error;
pub mod structs;

pub use decode::CborDecode;
pub use encode::CborEncode;
pub use error::CborDecodeError;
