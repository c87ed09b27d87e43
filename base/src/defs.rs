use std::error::Error as StdError;
use std::fmt::{Debug, Display, Formatter, Result as FmtResult};
use std::io::Error as IoError;

use serde_json::Error as JsonError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub enum ErrorKind {
    IoError = 1,
    MalformedData = 2,
    InconsistentState = 3,
    UnsupportedFeature = 4,
    ImageError = 5,
    JsonError = 6,
    InvalidArgument = 7,
    DeviceError = 8,
}

pub struct Error {
    pub kind: ErrorKind,
    pub description: String,
    pub source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind, description: String) -> Self {
        Self {
            kind,
            description,
            source: None,
        }
    }

    pub fn with_source<E: StdError + Send + Sync + 'static>(
        kind: ErrorKind,
        description: String,
        source: E,
    ) -> Self {
        Self {
            kind,
            description,
            source: Some(Box::new(source)),
        }
    }
}

impl Debug for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.description)?;
        if let Some(source) = &self.source {
            write!(f, ": {}", source)?;
        }
        Ok(())
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        Debug::fmt(self, f)
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|s| s.as_ref() as &(dyn StdError + 'static))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Converts foreign results into `Result`, attaching a lazily built
/// description of the failed operation.
pub trait IntoResult<T> {
    fn res<F: FnOnce() -> String>(self, err_fn: F) -> Result<T>;
}

impl<T> IntoResult<T> for std::result::Result<T, IoError> {
    fn res<F: FnOnce() -> String>(self, err_fn: F) -> Result<T> {
        self.map_err(|e| Error::with_source(ErrorKind::IoError, err_fn(), e))
    }
}

impl<T> IntoResult<T> for std::result::Result<T, JsonError> {
    fn res<F: FnOnce() -> String>(self, err_fn: F) -> Result<T> {
        self.map_err(|e| Error::with_source(ErrorKind::JsonError, err_fn(), e))
    }
}

impl<T> IntoResult<T> for Option<T> {
    fn res<F: FnOnce() -> String>(self, err_fn: F) -> Result<T> {
        self.ok_or_else(|| Error::new(ErrorKind::InconsistentState, err_fn()))
    }
}
