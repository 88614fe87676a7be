use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use tokio::fs::read_dir;

use crate::consts::*;
use crate::errors::*;
use crate::util::read_file;

make_log_macro!(debug, "sensor");

/// Anything that can be asked for the current illuminance.
pub trait LightSensor: Send + Sync {
    fn name(&self) -> &str;

    fn read_lux(&self) -> BoxFuture<'_, Result<f64>>;
}

#[derive(Debug, Clone)]
enum Reading {
    Processed(PathBuf),
    Raw {
        raw: PathBuf,
        scale: f64,
        offset: f64,
    },
}

/// An ambient light sensor exposed through the kernel's industrial I/O
/// subsystem.
#[derive(Debug, Clone)]
pub struct IioLightSensor {
    name: String,
    reading: Reading,
}

impl IioLightSensor {
    /// The first light sensor under `/sys/bus/iio/devices`, if any.
    pub async fn discover() -> Result<Option<Self>> {
        Self::discover_in(IIO_DEVICES_PATH).await
    }

    pub async fn discover_in(root: impl AsRef<Path>) -> Result<Option<Self>> {
        let mut entries = read_dir(root.as_ref()).await?;
        let mut devices = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            devices.push(entry.path());
        }
        devices.sort();

        for device in devices {
            if let Some(sensor) = Self::open(&device).await? {
                debug!("using {}", sensor.name);
                return Ok(Some(sensor));
            }
        }
        Ok(None)
    }

    async fn open(device: &Path) -> Result<Option<Self>> {
        let name = match read_file(device.join("name")).await {
            Ok(name) if !name.is_empty() => name,
            _ => device
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };

        let processed = device.join(FILE_ILLUMINANCE_INPUT);
        if tokio::fs::try_exists(&processed).await? {
            return Ok(Some(Self {
                name,
                reading: Reading::Processed(processed),
            }));
        }

        let raw = device.join(FILE_ILLUMINANCE_RAW);
        if !tokio::fs::try_exists(&raw).await? {
            return Ok(None);
        }
        let scale = read_number(&device.join(FILE_ILLUMINANCE_SCALE))
            .await
            .unwrap_or(1.0);
        let offset = read_number(&device.join(FILE_ILLUMINANCE_OFFSET))
            .await
            .unwrap_or(0.0);
        Ok(Some(Self {
            name,
            reading: Reading::Raw { raw, scale, offset },
        }))
    }
}

async fn read_number(path: &Path) -> Result<f64> {
    read_file(path)
        .await?
        .trim()
        .parse()
        .error("Failed to parse sensor value")
}

impl LightSensor for IioLightSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_lux(&self) -> BoxFuture<'_, Result<f64>> {
        Box::pin(async move {
            match &self.reading {
                Reading::Processed(path) => read_number(path).await,
                Reading::Raw { raw, scale, offset } => {
                    Ok((read_number(raw).await? + offset) * scale)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn prefers_processed_illuminance() {
        let root = tempfile::tempdir().unwrap();
        let accel = root.path().join("iio:device0");
        let light = root.path().join("iio:device1");
        tokio::fs::create_dir(&accel).await.unwrap();
        tokio::fs::create_dir(&light).await.unwrap();
        tokio::fs::write(accel.join("name"), "accel_3d\n").await.unwrap();
        tokio::fs::write(light.join("name"), "als\n").await.unwrap();
        tokio::fs::write(light.join(FILE_ILLUMINANCE_INPUT), "312.5\n")
            .await
            .unwrap();

        let sensor = IioLightSensor::discover_in(root.path()).await.unwrap().unwrap();
        assert_eq!(sensor.name(), "als");
        assert_eq!(sensor.read_lux().await.unwrap(), 312.5);
    }

    #[tokio::test]
    async fn scales_raw_readings() {
        let root = tempfile::tempdir().unwrap();
        let light = root.path().join("iio:device0");
        tokio::fs::create_dir(&light).await.unwrap();
        tokio::fs::write(light.join(FILE_ILLUMINANCE_RAW), "100\n").await.unwrap();
        tokio::fs::write(light.join(FILE_ILLUMINANCE_SCALE), "0.5\n").await.unwrap();
        tokio::fs::write(light.join(FILE_ILLUMINANCE_OFFSET), "2\n").await.unwrap();

        let sensor = IioLightSensor::discover_in(root.path()).await.unwrap().unwrap();
        assert_eq!(sensor.name(), "iio:device0");
        assert_eq!(sensor.read_lux().await.unwrap(), 51.0);
    }

    #[tokio::test]
    async fn no_light_sensor() {
        let root = tempfile::tempdir().unwrap();
        tokio::fs::create_dir(root.path().join("iio:device0")).await.unwrap();
        assert!(IioLightSensor::discover_in(root.path()).await.unwrap().is_none());
    }
}
