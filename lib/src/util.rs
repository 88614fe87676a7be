use std::future::Future;
use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::errors::*;

macro_rules! make_log_macro {
    (@wdoll $macro_name:ident, $block_name:literal, ($dol:tt)) => {
        #[allow(unused_macros)]
        macro_rules! $macro_name {
            ($dol($args:tt)+) => {
                ::log::$macro_name!(target: $block_name, $dol($args)+)
            };
        }
    };
    ($macro_name:ident, $block_name:literal) => {
        make_log_macro!(@wdoll $macro_name, $block_name, ($));
    };
}

pub async fn deserialize_toml_file<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();

    let contents = read_file(path).await?;

    deserialize_toml_str(&contents).map_err(|message| {
        DimmerError::Other(format!(
            "Failed to deserialize TOML file {}{}",
            path.display(),
            message
        ))
    })
}

/// On failure returns a message of the form `" at line N: reason"`.
pub fn deserialize_toml_str<T: DeserializeOwned>(contents: &str) -> std::result::Result<T, String> {
    toml::from_str(contents).map_err(|err| {
        let location_msg = err
            .span()
            .map(|span| {
                let line = 1 + contents.as_bytes()[..(span.start)]
                    .iter()
                    .filter(|b| **b == b'\n')
                    .count();
                format!(" at line {line}")
            })
            .unwrap_or_default();
        format!("{}: {}", location_msg, err.message())
    })
}

pub async fn read_file(path: impl AsRef<Path>) -> std::io::Result<String> {
    let content = tokio::fs::read_to_string(path).await?;
    Ok(content.trim_end().to_string())
}

/// Scale a number from 0.0-1.0 to an arbitrary scale
pub fn scale_to_clamped_relative(absolute_value: f64, low: f64, high: f64) -> Result<f64> {
    if low > high {
        Err(DimmerError::InvalidScaleParameters { low, high })
    } else {
        Ok(absolute_value.clamp(0.0, 1.0) * (high - low) + low)
    }
}

// Scale a number from an arbitrary scale to 0.0-1.0
pub fn scale_to_clamped_absolute(relative_value: f64, low: f64, high: f64) -> Result<f64> {
    if low > high {
        Err(DimmerError::InvalidScaleParameters { low, high })
    } else if low == high {
        Ok(0.0)
    } else {
        Ok((relative_value.clamp(low, high) - low) / (high - low))
    }
}

/// Round and clamp a value onto the 0-100 brightness scale.
pub fn clamp_percent(value: f64) -> u32 {
    if value.is_nan() {
        return 0;
    }
    value.round().clamp(0.0, 100.0) as u32
}

/// Run a single endpoint round-trip, turning an elapsed deadline into a
/// [`DimmerError::TransientIo`].
pub async fn with_deadline<T, F>(deadline: Duration, endpoint: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(DimmerError::transient(
            endpoint,
            format!("no reply within {}ms", deadline.as_millis()),
        )),
    }
}
