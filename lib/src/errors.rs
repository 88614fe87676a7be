use chrono::NaiveDate;
use thiserror::Error;

use crate::endpoint::Parameter;

/// Result type returned from functions that can have our `Error`s.
pub type Result<T, E = DimmerError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DimmerError {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    InvalidRegex(#[from] regex::Error),

    #[cfg(feature = "watch")]
    #[error("{0}")]
    Notify(#[from] notify::Error),

    #[error("{0}")]
    DBus(#[from] zbus::Error),

    /// The endpoint is disconnected or was never discovered.
    #[error("Endpoint {0} is unavailable")]
    EndpointUnavailable(String),

    #[error("Endpoint {endpoint} does not support {parameter}")]
    ParameterUnsupported {
        endpoint: String,
        parameter: Parameter,
    },

    /// A communication failure that is worth retrying.
    #[error("I/O with endpoint {endpoint} failed: {reason}")]
    TransientIo { endpoint: String, reason: String },

    #[error("The sun does not rise or set on {0}")]
    NoSolarEvent(NaiveDate),

    #[error("Location is unavailable")]
    LocationUnavailable,

    #[error("Invalid location: latitude {latitude}, longitude {longitude}")]
    InvalidLocation { latitude: f64, longitude: f64 },

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Invalid time {0:?}, expected HH:MM")]
    InvalidTime(String),

    #[error("No matching devices exist")]
    NoDevices,

    #[error("Invalid scale parameters: {low} > {high}")]
    InvalidScaleParameters { low: f64, high: f64 },

    #[error("{0}")]
    Other(String),
}

impl DimmerError {
    /// Errors after which the endpoint should be treated as gone until the
    /// next discovery.
    pub fn is_endpoint_failure(&self) -> bool {
        matches!(
            self,
            DimmerError::EndpointUnavailable(_) | DimmerError::TransientIo { .. }
        )
    }

    pub(crate) fn transient(endpoint: impl Into<String>, reason: impl ToString) -> Self {
        DimmerError::TransientIo {
            endpoint: endpoint.into(),
            reason: reason.to_string(),
        }
    }
}

pub(crate) trait ResultExt<T> {
    /// Attach a message to a foreign error.
    fn error(self, message: &str) -> Result<T>;

    /// Report a foreign error as a retryable failure of `endpoint`.
    fn transient(self, endpoint: &str, message: &str) -> Result<T>;
}

impl<T, E: std::fmt::Display> ResultExt<T> for std::result::Result<T, E> {
    fn error(self, message: &str) -> Result<T> {
        self.map_err(|e| DimmerError::Other(format!("{message}: {e}")))
    }

    fn transient(self, endpoint: &str, message: &str) -> Result<T> {
        self.map_err(|e| DimmerError::transient(endpoint, format!("{message}: {e}")))
    }
}
