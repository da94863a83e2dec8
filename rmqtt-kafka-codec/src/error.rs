#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("Invalid length")]
    InvalidLength,
    #[error("Malformed record")]
    MalformedRecord,
    #[error("Unsupported record version {0}")]
    UnsupportedVersion(u8),
    #[error("utf8 error")]
    Utf8Error,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("Invalid length")]
    InvalidLength,
    #[error("Field too large: {0}")]
    FieldTooLarge(&'static str),
}
