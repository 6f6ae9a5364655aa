use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    #[error("input ends inside a value")]
    UnexpectedEof,

    #[error("malformed integer {0:?}")]
    InvalidInteger(String),

    #[error("malformed byte string length")]
    InvalidStringLength,

    #[error("unexpected character {0:?} at offset {1}")]
    UnexpectedChar(char, usize),

    #[error("dictionary key is not a byte string")]
    InvalidKey,

    #[error("data after the top-level value")]
    TrailingData,

    #[error("lists and dicts nested too deeply")]
    NestingTooDeep,
}
