use std::{error, fmt, io};

/// An enum of all error kinds.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// A column's declared type has no wire representation.
    UnsupportedType,
    /// The encoded result would not fit the configured buffer, or a single
    /// value is too large for 32-bit length addressing.
    TooLarge,
    /// A buffer could not be decoded.
    Malformed,
    /// A cell value does not match its column's declared type.
    TypeMismatch,
    /// No connection could be obtained from the pool in time.
    ConnectionUnavailable,
    /// The store rejected or failed a command.
    Store,
    /// A rule definition could not be turned into a rule.
    InvalidRules,
    /// Rules could not be serialized to or from their JSON form.
    Serialize,
}

/// Represents a caching error.
///
/// None of these errors should ever fail the query that triggered them; the
/// caller always has the backend to fall back to.
pub struct CacheError {
    repr: ErrorRepr,
}

#[derive(Debug)]
enum ErrorRepr {
    WithDescription(ErrorKind, &'static str),
    WithDescriptionAndDetail(ErrorKind, &'static str, String),
    Store(redis::RedisError),
    Json(serde_json::Error),
}

/// Library generic result type.
pub type CacheResult<T> = Result<T, CacheError>;

impl PartialEq for CacheError {
    fn eq(&self, other: &CacheError) -> bool {
        match (&self.repr, &other.repr) {
            (&ErrorRepr::WithDescription(kind_a, _), &ErrorRepr::WithDescription(kind_b, _)) => {
                kind_a == kind_b
            }
            (
                ErrorRepr::WithDescriptionAndDetail(kind_a, _, _),
                ErrorRepr::WithDescriptionAndDetail(kind_b, _, _),
            ) => kind_a == kind_b,
            (ErrorRepr::Store(a), ErrorRepr::Store(b)) => a == b,
            _ => false,
        }
    }
}

impl From<(ErrorKind, &'static str)> for CacheError {
    fn from((kind, desc): (ErrorKind, &'static str)) -> CacheError {
        CacheError {
            repr: ErrorRepr::WithDescription(kind, desc),
        }
    }
}

impl From<(ErrorKind, &'static str, String)> for CacheError {
    fn from((kind, desc, detail): (ErrorKind, &'static str, String)) -> CacheError {
        CacheError {
            repr: ErrorRepr::WithDescriptionAndDetail(kind, desc, detail),
        }
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> CacheError {
        CacheError {
            repr: ErrorRepr::Store(err),
        }
    }
}

impl From<r2d2::Error> for CacheError {
    fn from(err: r2d2::Error) -> CacheError {
        CacheError::from((
            ErrorKind::ConnectionUnavailable,
            "Could not obtain cache connection",
            err.to_string(),
        ))
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> CacheError {
        CacheError {
            repr: ErrorRepr::Json(err),
        }
    }
}

impl From<io::Error> for CacheError {
    fn from(err: io::Error) -> CacheError {
        CacheError::from(redis::RedisError::from(err))
    }
}

impl error::Error for CacheError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Store(err) => Some(err),
            ErrorRepr::Json(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Debug for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match &self.repr {
            ErrorRepr::WithDescription(kind, desc) => {
                desc.fmt(f)?;
                f.write_str(" - ")?;
                fmt::Debug::fmt(&kind, f)
            }
            ErrorRepr::WithDescriptionAndDetail(kind, desc, detail) => {
                desc.fmt(f)?;
                f.write_str(" - ")?;
                fmt::Debug::fmt(&kind, f)?;
                f.write_str(": ")?;
                detail.fmt(f)
            }
            ErrorRepr::Store(err) => err.fmt(f),
            ErrorRepr::Json(err) => {
                f.write_str("Rule serialization failed: ")?;
                err.fmt(f)
            }
        }
    }
}

impl CacheError {
    /// Returns the kind of the error.
    pub fn kind(&self) -> ErrorKind {
        match &self.repr {
            ErrorRepr::WithDescription(kind, _)
            | ErrorRepr::WithDescriptionAndDetail(kind, _, _) => *kind,
            ErrorRepr::Store(_) => ErrorKind::Store,
            ErrorRepr::Json(_) => ErrorKind::Serialize,
        }
    }

    /// Returns the error detail.
    pub fn detail(&self) -> Option<&str> {
        match &self.repr {
            ErrorRepr::WithDescriptionAndDetail(_, _, detail) => Some(detail.as_str()),
            ErrorRepr::Store(err) => err.detail(),
            _ => None,
        }
    }

    /// Returns the name of the error category for display purposes.
    pub fn category(&self) -> &str {
        match self.kind() {
            ErrorKind::UnsupportedType => "unsupported column type",
            ErrorKind::TooLarge => "result too large to cache",
            ErrorKind::Malformed => "malformed cache entry",
            ErrorKind::TypeMismatch => "type mismatch",
            ErrorKind::ConnectionUnavailable => "could not obtain cache connection",
            ErrorKind::Store => "store error",
            ErrorKind::InvalidRules => "invalid rules",
            ErrorKind::Serialize => "serializing",
        }
    }

    /// Indicates that the store could not be reached at all. Callers treat
    /// this as "cache unavailable" and run the query uncached.
    pub fn is_unavailable(&self) -> bool {
        match &self.repr {
            ErrorRepr::Store(err) => err.is_io_error() || err.is_connection_dropped(),
            _ => self.kind() == ErrorKind::ConnectionUnavailable,
        }
    }

    /// Indicates that this error was produced by the result codec.
    pub fn is_codec_error(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::UnsupportedType
                | ErrorKind::TooLarge
                | ErrorKind::Malformed
                | ErrorKind::TypeMismatch
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_errors_are_unavailable() {
        let err = CacheError::from((
            ErrorKind::ConnectionUnavailable,
            "Could not obtain cache connection",
            "timed out".to_string(),
        ));
        assert!(err.is_unavailable());
        assert_eq!(err.category(), "could not obtain cache connection");
        assert_eq!(err.detail(), Some("timed out"));
    }

    #[test]
    fn io_errors_map_to_store() {
        let err = CacheError::from(io::Error::from(io::ErrorKind::BrokenPipe));
        assert_eq!(err.kind(), ErrorKind::Store);
        assert!(err.is_unavailable());
        assert!(!err.is_codec_error());
    }

    #[test]
    fn display_includes_kind_and_detail() {
        let err = CacheError::from((
            ErrorKind::UnsupportedType,
            "Unsupported column type",
            "ARRAY (2003)".to_string(),
        ));
        assert_eq!(
            err.to_string(),
            "Unsupported column type - UnsupportedType: ARRAY (2003)"
        );
        assert!(err.is_codec_error());
    }
}
