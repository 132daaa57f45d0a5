//! Error kinds raised by the cipher, codec and framing layers
use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Encoder was handed a value that has no tag (the null sentinel)
    #[error("unmarshallable value: {0}")]
    UnmarshallableValue(&'static str),

    /// Decoder read a leading byte that maps to no value kind
    #[error("bad format tag: 0x{0:02x}")]
    BadFormatTag(u8),

    /// Decoder needed more bytes than the input holds
    #[error("unexpected end of input")]
    TruncatedInput,

    /// String back-reference points past the end of the intern table
    #[error("out of range back-reference: index {index}, table holds {len}")]
    InvalidBackReference { index: i32, len: usize },

    /// Rotor bank constructed without any rotors
    #[error("rotor count must be at least 1")]
    InvalidRotorCount,

    /// Size prefix decoded to a negative value
    #[error("negative length prefix: {0}")]
    InvalidLength(i32),

    /// Arbitrary-precision digit outside the 15-bit range
    #[error("long digit out of range: 0x{0:04x}")]
    InvalidLongDigit(u16),

    /// Float text that does not parse as a decimal number
    #[error("invalid float literal: {0:?}")]
    InvalidFloat(String),

    /// Unicode payload that is not valid UTF-8
    #[error("unicode payload is not valid UTF-8")]
    InvalidUtf8,

    /// Code object field decoded to the wrong kind of value
    #[error("code object field `{field}` holds {found}")]
    InvalidCodeField {
        field: &'static str,
        found: &'static str,
    },

    /// Value graph nested past [`crate::marshal::MAX_DEPTH`]
    #[error("object graph nested deeper than {0} levels")]
    NestingTooDeep(usize),

    /// Framing payload failed to inflate
    #[error("failed to decompress payload: {0}")]
    Inflate(#[source] io::Error),

    #[error("I/O error: {0}")]
    Io(#[source] io::Error),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            Error::TruncatedInput
        } else {
            Error::Io(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eof_maps_to_truncated_input() {
        let err: Error = io::Error::from(io::ErrorKind::UnexpectedEof).into();
        assert!(matches!(err, Error::TruncatedInput));

        let err: Error = io::Error::from(io::ErrorKind::PermissionDenied).into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_bad_tag_message_shows_byte() {
        let msg = Error::BadFormatTag(b'?').to_string();
        assert_eq!(msg, "bad format tag: 0x3f");
    }
}
