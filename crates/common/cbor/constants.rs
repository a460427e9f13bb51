/// Major type tags, already shifted into the high three bits of the
/// initial byte.
pub const MAJOR_UINT: u8 = 0x00;
pub const MAJOR_NINT: u8 = 0x20;
pub const MAJOR_BYTES: u8 = 0x40;
pub const MAJOR_TEXT: u8 = 0x60;
pub const MAJOR_ARRAY: u8 = 0x80;
pub const MAJOR_MAP: u8 = 0xa0;
pub const MAJOR_SIMPLE: u8 = 0xe0;

/// Additional-info values selecting the width of the following argument.
pub const INFO_U8: u8 = 24;
pub const INFO_U16: u8 = 25;
pub const INFO_U32: u8 = 26;
pub const INFO_U64: u8 = 27;
pub const INFO_INDEFINITE: u8 = 31;

pub const CBOR_FALSE: u8 = 0xf4;
pub const CBOR_TRUE: u8 = 0xf5;
pub const CBOR_NULL: u8 = 0xf6;
pub const CBOR_MAP_INDEF: u8 = 0xbf;
pub const CBOR_BREAK: u8 = 0xff;
