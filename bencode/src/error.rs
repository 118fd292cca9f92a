use std::fmt::Display;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {

    #[error("unexpected end of input")]
    Eof,

    // Decoding an empty stream is an error, not an empty dictionary.
    #[error("empty input")]
    EmptyInput,

    #[error("trailing bytes after top-level value")]
    TrailingBytes,

    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    #[error("invalid byte string length: {0}")]
    InvalidLength(String),

    #[error("invalid token: expected {expected}, found {found}")]
    InvalidToken {
        expected: String,
        found: String,
    },

    // Canonical dictionaries carry each key at most once...
    #[error("duplicate dictionary key: {0:?}")]
    DuplicateKey(String),

    // ...in ascending byte order.
    #[error("dictionary keys out of lexicographic order at {0:?}")]
    UnsortedKey(String),

    #[error("invalid type: {0}")]
    InvalidType(String),

    #[error("dictionary keys must be byte strings")]
    NonStringKey,

    #[error("{0}")]
    Custom(String),

}

impl serde::ser::Error for Error {
    fn custom<T>(msg: T) -> Self where T: Display {
        Error::Custom(msg.to_string())
    }
}

impl serde::de::Error for Error {
    fn custom<T>(msg: T) -> Self where T: Display {
        Error::Custom(msg.to_string())
    }
}
