/// Where a failure happened: the driver operation plus, when known, the
/// logical path and the device byte offset involved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub operation: &'static str,
    pub path: Option<String>,
    pub offset: Option<u64>,
}

impl ErrorContext {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            path: None,
            offset: None,
        }
    }

    pub fn at(operation: &'static str, offset: u64) -> Self {
        Self {
            operation,
            path: None,
            offset: Some(offset),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}

impl std::fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.operation)?;
        if let Some(path) = &self.path {
            write!(f, " '{path}'")?;
        }
        if let Some(offset) = self.offset {
            write!(f, " at {offset:#x}")?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum Error {
    /// Bad magic, a cyclic or out-of-range chain, or a malformed record.
    Format {
        context: ErrorContext,
        reason: String,
    },
    /// The underlying device failed to open, read or write.
    Device {
        context: ErrorContext,
        source: std::io::Error,
    },
    /// The allocator cannot satisfy a request; counts are in clusters.
    OutOfSpace {
        partition: String,
        requested: u32,
        available: u32,
    },
    NotFound(String),
    InvalidArgument(String),
}

impl Error {
    pub(crate) fn format(context: ErrorContext, reason: impl Into<String>) -> Self {
        Error::Format {
            context,
            reason: reason.into(),
        }
    }

    pub(crate) fn device(context: ErrorContext, source: std::io::Error) -> Self {
        Error::Device { context, source }
    }

    /// Attaches a logical path to format and device failures that lack one.
    pub(crate) fn with_path(self, path: &str) -> Self {
        match self {
            Error::Format { context, reason } if context.path.is_none() => Error::Format {
                context: context.with_path(path),
                reason,
            },
            Error::Device { context, source } if context.path.is_none() => Error::Device {
                context: context.with_path(path),
                source,
            },
            other => other,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Format { context, reason } => write!(f, "{context}: {reason}"),
            Error::Device { context, source } => write!(f, "{context}: device error: {source}"),
            Error::OutOfSpace {
                partition,
                requested,
                available,
            } => write!(
                f,
                "not enough free space on {partition}: {requested} clusters requested, {available} available"
            ),
            Error::NotFound(what) => write!(f, "{what} not found"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Device { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<xbox_filetypes::Error> for Error {
    fn from(err: xbox_filetypes::Error) -> Self {
        match err {
            xbox_filetypes::Error::InvalidArgument(msg) => Error::InvalidArgument(msg),
            xbox_filetypes::Error::Format(reason) => {
                Error::format(ErrorContext::new("decode record"), reason)
            }
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Device { source, .. } => source,
            Error::NotFound(_) => std::io::Error::new(std::io::ErrorKind::NotFound, err),
            Error::InvalidArgument(_) => std::io::Error::new(std::io::ErrorKind::InvalidInput, err),
            Error::Format { .. } => std::io::Error::new(std::io::ErrorKind::InvalidData, err),
            Error::OutOfSpace { .. } => std::io::Error::other(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = Error::format(
            ErrorContext::at("resolve chain", 0x1000).with_path("Content\\a.bin"),
            "cluster 7 revisited",
        );
        assert_eq!(
            err.to_string(),
            "resolve chain 'Content\\a.bin' at 0x1000: cluster 7 revisited"
        );
    }

    #[test]
    fn with_path_keeps_existing_path() {
        let err = Error::format(ErrorContext::new("decode").with_path("first"), "bad")
            .with_path("second");
        match err {
            Error::Format { context, .. } => assert_eq!(context.path.as_deref(), Some("first")),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
