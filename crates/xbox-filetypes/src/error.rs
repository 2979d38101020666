#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A field supplied at an editing boundary is malformed.
    InvalidArgument(String),
    /// A record read from storage does not match its fixed layout.
    Format(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::Format(msg) => write!(f, "malformed record: {msg}"),
        }
    }
}

impl std::error::Error for Error {}
