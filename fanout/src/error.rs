//! Error types and result definitions for fan-out operations.
//!
//! Provides a classified error type with captured diagnostic metadata. A [`FanoutError`] holds
//! either a single error with optional detail and source, or several aggregated errors when more
//! than one worker fails at the same time.

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::Location;
use std::sync::Arc;

/// Convenient result type for fan-out operations using [`FanoutError`] as the error type.
pub type FanoutResult<T> = Result<T, FanoutError>;

/// Detailed payload stored for single [`FanoutError`] instances.
#[derive(Debug, Clone)]
struct ErrorPayload {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

/// Main error type for the fan-out stack.
///
/// Every fallible operation of the queue, the workers and the pipeline returns this type. Errors
/// carry an [`ErrorKind`] so callers can decide whether a failure is fatal (ordering violations),
/// expected (shutdown interruptions) or worth retrying.
#[derive(Debug, Clone)]
pub struct FanoutError {
    repr: ErrorRepr,
}

#[derive(Debug, Clone)]
enum ErrorRepr {
    /// Single error payload holding rich metadata.
    Single(ErrorPayload),
    /// Multiple aggregated errors, mostly produced when several channel workers fail.
    Many {
        errors: Vec<FanoutError>,
        location: &'static Location<'static>,
    },
}

/// Categories of errors raised while distributing and applying transactions.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // Configuration Errors
    ConfigError,
    InvalidChannel,

    // Ordering Errors
    OrderingViolation,

    // Lifecycle Errors
    Interrupted,
    QueueShutdown,
    QueueClosed,
    WatchCancelled,

    // Serialization Errors
    SerializationAborted,

    // Worker Errors
    ApplyFailed,
    ChannelWorkerPanic,
    FeederWorkerPanic,
    InvalidState,

    // IO & Encoding Errors
    IoError,
    EncodingError,
    DecodingError,
    InvalidData,

    // Unknown / Uncategorized
    Unknown,

    // Error kind produced by fault injection in tests.
    #[cfg(feature = "failpoints")]
    FailpointTriggered,
}

impl FanoutError {
    /// Returns the [`ErrorKind`] of this error.
    ///
    /// For multiple errors, returns the kind of the first error or [`ErrorKind::Unknown`]
    /// if the error list is empty.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.kind,
            ErrorRepr::Many { ref errors, .. } => errors
                .first()
                .map(|err| err.kind())
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    /// Returns all [`ErrorKind`]s present in this error, flattening aggregates.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match self.repr {
            ErrorRepr::Single(ref payload) => vec![payload.kind],
            ErrorRepr::Many { ref errors, .. } => errors
                .iter()
                .flat_map(|err| err.kinds())
                .collect::<Vec<_>>(),
        }
    }

    /// Returns the detailed error information if available.
    ///
    /// For multiple errors, returns the detail of the first error that has one.
    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.detail.as_deref(),
            ErrorRepr::Many { ref errors, .. } => errors.iter().find_map(|e| e.detail()),
        }
    }

    /// Returns the static description of a single error.
    pub fn description(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::Single(ref payload) => Some(payload.description.as_ref()),
            ErrorRepr::Many { .. } => None,
        }
    }

    /// Returns the aggregated errors when this error wraps more than one failure.
    pub fn errors(&self) -> Option<&[FanoutError]> {
        match self.repr {
            ErrorRepr::Single(_) => None,
            ErrorRepr::Many { ref errors, .. } => Some(errors),
        }
    }

    /// Returns the captured backtrace for this error.
    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self.repr {
            ErrorRepr::Single(ref payload) => Some(payload.backtrace.as_ref()),
            ErrorRepr::Many { .. } => None,
        }
    }

    /// Returns the captured callsite location for this error.
    pub fn location(&self) -> &'static Location<'static> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.location,
            ErrorRepr::Many { location, .. } => location,
        }
    }

    /// Attaches an originating [`error::Error`] to this error and returns the modified instance.
    ///
    /// Has no effect on aggregated errors, which forward their first error as source.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        if let ErrorRepr::Single(ref mut payload) = self.repr {
            payload.source = Some(Arc::new(source));
        }
        self
    }

    #[track_caller]
    fn from_components(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    ) -> Self {
        FanoutError {
            repr: ErrorRepr::Single(ErrorPayload {
                kind,
                description,
                detail,
                source,
                location: Location::caller(),
                backtrace: Arc::new(Backtrace::capture()),
            }),
        }
    }
}

impl PartialEq for FanoutError {
    fn eq(&self, other: &FanoutError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::Single(a), ErrorRepr::Single(b)) => a.kind == b.kind,
            (
                ErrorRepr::Many {
                    errors: errors_a, ..
                },
                ErrorRepr::Many {
                    errors: errors_b, ..
                },
            ) => {
                errors_a.len() == errors_b.len()
                    && errors_a.iter().zip(errors_b.iter()).all(|(a, b)| a == b)
            }
            _ => false,
        }
    }
}

impl Eq for FanoutError {}

impl Hash for FanoutError {
    /// Hashes only what [`PartialEq`] compares, so repeated failures group together.
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(&self.repr).hash(state);
        match &self.repr {
            ErrorRepr::Single(payload) => {
                payload.kind.hash(state);
            }
            ErrorRepr::Many { errors, .. } => {
                errors.len().hash(state);
                for error in errors {
                    error.hash(state);
                }
            }
        }
    }
}

impl fmt::Display for FanoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match &self.repr {
            ErrorRepr::Single(payload) => {
                let location = payload.location;
                write!(
                    f,
                    "[{:?}] {} @ {}:{}:{}",
                    payload.kind,
                    payload.description,
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                write_detail(payload.detail.as_deref(), f, 1)?;
                write_backtrace(payload.backtrace.as_ref(), f, 1)?;

                Ok(())
            }
            ErrorRepr::Many { errors, location } => {
                let count = errors.len();
                write!(
                    f,
                    "[Many] {} error{} aggregated @ {}:{}:{}",
                    count,
                    if count == 1 { "" } else { "s" },
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                if errors.is_empty() {
                    write!(f, "\n  (no inner errors provided)")?;
                }

                for (index, error) in errors.iter().enumerate() {
                    let rendered = format!("{error}");
                    let mut lines = rendered.lines();
                    match lines.next() {
                        Some(first_line) => write!(f, "\n  {}. {}", index + 1, first_line)?,
                        None => write!(f, "\n  {}.", index + 1)?,
                    }

                    for line in lines {
                        if line.is_empty() {
                            write!(f, "\n     ")?;
                        } else {
                            write!(f, "\n     {line}")?;
                        }
                    }
                }

                Ok(())
            }
        }
    }
}

impl error::Error for FanoutError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Single(payload) => payload
                .source
                .as_ref()
                .map(|source| source as &(dyn error::Error + 'static)),
            ErrorRepr::Many { errors, .. } => errors
                .first()
                .map(|error| error as &(dyn error::Error + 'static)),
        }
    }
}

fn write_backtrace(
    backtrace: &Backtrace,
    f: &mut fmt::Formatter<'_>,
    indent: usize,
) -> fmt::Result {
    let indent_str = "  ".repeat(indent);

    let rendered_backtrace = format!("{backtrace}");
    if !rendered_backtrace.trim().is_empty() {
        write!(f, "\n{indent_str}Backtrace:")?;
        for line in rendered_backtrace.lines() {
            if line.trim().is_empty() {
                write!(f, "\n{indent_str}  ")?;
            } else {
                write!(f, "\n{indent_str}  {line}")?;
            }
        }
    }

    Ok(())
}

fn write_detail(detail: Option<&str>, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
    let Some(detail) = detail else {
        return Ok(());
    };

    let indent_str = "  ".repeat(indent);
    if detail.trim().is_empty() {
        return write!(f, "\n{indent_str}Detail: <empty>");
    }

    write!(f, "\n{indent_str}Detail:")?;
    for line in detail.lines() {
        if line.trim().is_empty() {
            write!(f, "\n{indent_str}  ")?;
        } else {
            write!(f, "\n{indent_str}  {line}")?;
        }
    }

    Ok(())
}

/// Creates a [`FanoutError`] from an error kind and static description.
impl From<(ErrorKind, &'static str)> for FanoutError {
    #[track_caller]
    fn from((kind, desc): (ErrorKind, &'static str)) -> FanoutError {
        FanoutError::from_components(kind, Cow::Borrowed(desc), None, None)
    }
}

/// Creates a [`FanoutError`] from an error kind, static description, and dynamic detail.
impl<D> From<(ErrorKind, &'static str, D)> for FanoutError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, desc, detail): (ErrorKind, &'static str, D)) -> FanoutError {
        FanoutError::from_components(kind, Cow::Borrowed(desc), Some(detail.into()), None)
    }
}

/// Aggregates errors, returning a lone error unchanged.
impl<E> From<Vec<E>> for FanoutError
where
    E: Into<FanoutError>,
{
    #[track_caller]
    fn from(errors: Vec<E>) -> FanoutError {
        let location = Location::caller();

        let mut errors: Vec<FanoutError> = errors.into_iter().map(Into::into).collect();

        if errors.len() == 1
            && let Some(error) = errors.pop()
        {
            return error;
        }

        FanoutError {
            repr: ErrorRepr::Many { errors, location },
        }
    }
}

/// Converts [`std::io::Error`] to [`FanoutError`] with [`ErrorKind::IoError`].
impl From<std::io::Error> for FanoutError {
    #[track_caller]
    fn from(err: std::io::Error) -> FanoutError {
        let detail = err.to_string();
        FanoutError::from_components(
            ErrorKind::IoError,
            Cow::Borrowed("I/O operation failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Converts [`serde_json::Error`] to [`FanoutError`] based on the error category.
impl From<serde_json::Error> for FanoutError {
    #[track_caller]
    fn from(err: serde_json::Error) -> FanoutError {
        let (kind, description) = match err.classify() {
            serde_json::error::Category::Io => (ErrorKind::IoError, "JSON I/O operation failed"),
            serde_json::error::Category::Syntax
            | serde_json::error::Category::Data
            | serde_json::error::Category::Eof => {
                (ErrorKind::DecodingError, "JSON decoding failed")
            }
        };

        let detail = err.to_string();
        FanoutError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Converts [`fanout_config::shared::ValidationError`] to [`FanoutError`] with
/// [`ErrorKind::ConfigError`].
impl From<fanout_config::shared::ValidationError> for FanoutError {
    #[track_caller]
    fn from(err: fanout_config::shared::ValidationError) -> FanoutError {
        let detail = err.to_string();
        FanoutError::from_components(
            ErrorKind::ConfigError,
            Cow::Borrowed("Invalid configuration"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}
