use std::cmp::max;
use std::path::{Path, PathBuf};

use futures::future::join_all;
use regex::Regex;
use tokio::fs::{OpenOptions, read_dir};
use tokio::io::AsyncWriteExt;
use zbus::Connection;

use super::{Capabilities, Capability, Parameter};
use crate::config::{DimmerConfig, EndpointConfig};
use crate::consts::*;
use crate::errors::*;
use crate::util::*;

make_log_macro!(debug, "backlight");

#[zbus::dbus_proxy(
    interface = "org.freedesktop.login1.Session",
    default_service = "org.freedesktop.login1",
    default_path = "/org/freedesktop/login1/session/auto"
)]
trait Session {
    fn set_brightness(&self, subsystem: &str, name: &str, brightness: u32) -> zbus::Result<()>;
}

/// A kernel backlight device, normally the built-in panel.
///
/// Brightness is exposed as a 0-100 percentage after applying the device's
/// calibration range and root scaling.
pub struct BacklightChannel {
    device_name: String,
    read_brightness_file: PathBuf,
    write_brightness_file: PathBuf,
    max_brightness: u32,
    dbus_proxy: Option<SessionProxy<'static>>,
    config: EndpointConfig,
}

pub(super) async fn discover(
    device_regex: &Regex,
    config: &DimmerConfig,
) -> Result<Vec<BacklightChannel>> {
    let mut sysfs_paths = read_dir(DEVICES_PATH).await?;

    let mut device_names = Vec::new();
    while let Some(sysfs_path) = sysfs_paths.next_entry().await? {
        let device_name = sysfs_path.file_name().to_string_lossy().to_string();
        if device_regex.is_match(&device_name) {
            debug!("{:?} matched {}", device_name, device_regex.as_str());
            device_names.push(device_name);
        }
    }
    // read_dir order is arbitrary, discovery order must not be
    device_names.sort();

    let dbus_conn = match Connection::system().await {
        Ok(conn) => Some(conn),
        Err(e) => {
            debug!("no system bus, writing sysfs directly: {e}");
            None
        }
    };

    let devices = join_all(device_names.iter().map(|device_name| {
        BacklightChannel::open(
            device_name,
            config.endpoint_config(device_name),
            dbus_conn.as_ref(),
        )
    }))
    .await;

    Ok(devices
        .into_iter()
        .filter_map(|device| match device {
            Ok(device) => Some(device),
            Err(e) => {
                debug!("{e}");
                None
            }
        })
        .collect())
}

impl BacklightChannel {
    pub async fn open(
        device_name: &str,
        config: EndpointConfig,
        dbus_conn: Option<&Connection>,
    ) -> Result<Self> {
        let device_path = PathBuf::from(DEVICES_PATH).join(device_name);

        let dbus_proxy = match dbus_conn {
            Some(conn) => match SessionProxy::new(conn).await {
                Ok(proxy) => Some(proxy),
                Err(e) => {
                    debug!("failed to create SessionProxy: {e}");
                    None
                }
            },
            None => None,
        };

        let mut s = Self {
            read_brightness_file: device_path.join({
                if device_path.ends_with("amdgpu_bl0") {
                    FILE_BRIGHTNESS_AMD
                } else {
                    FILE_BRIGHTNESS
                }
            }),
            write_brightness_file: device_path.join(FILE_BRIGHTNESS_WRITE),
            device_name: device_name.to_string(),
            max_brightness: 0,
            dbus_proxy,
            config,
        };
        s.max_brightness = s
            .read_brightness_raw(&device_path.join(FILE_MAX_BRIGHTNESS))
            .await?;
        if s.max_brightness == 0 {
            return Err(DimmerError::Other(format!(
                "{} reports a max brightness of 0",
                s.device_name
            )));
        }
        Ok(s)
    }

    pub fn key(&self) -> String {
        format!("backlight:{}", self.device_name)
    }

    pub fn name(&self) -> String {
        self.device_name.clone()
    }

    /// Read a brightness value from the given path.
    async fn read_brightness_raw(&self, device_file: &Path) -> Result<u32> {
        read_file(device_file)
            .await
            .transient(&self.device_name, "Failed to read brightness file")?
            .parse()
            .transient(&self.device_name, "Failed to read value from brightness file")
    }

    fn unsupported(&self, parameter: Parameter) -> DimmerError {
        DimmerError::ParameterUnsupported {
            endpoint: self.device_name.clone(),
            parameter,
        }
    }

    pub(super) async fn capabilities(&mut self) -> Result<Capabilities> {
        let current = self.get(Parameter::Brightness).await?;
        Ok(Capabilities::from([(
            Parameter::Brightness,
            Capability::percent(current),
        )]))
    }

    /// Query the brightness of this backlight device as a percentage.
    pub(super) async fn get(&mut self, parameter: Parameter) -> Result<u32> {
        if parameter != Parameter::Brightness {
            return Err(self.unsupported(parameter));
        }
        let raw_brightness = self.read_brightness_raw(&self.read_brightness_file).await?;
        self.config
            .ratio_to_percent(raw_brightness as f64 / self.max_brightness as f64)
    }

    /// Set the brightness of this backlight device from a percentage.
    pub(super) async fn set(&mut self, parameter: Parameter, value: u32) -> Result<()> {
        if parameter != Parameter::Brightness {
            return Err(self.unsupported(parameter));
        }
        let ratio = self.config.percent_to_ratio(value)?;
        let raw_brightness = max(1, (ratio * (self.max_brightness as f64)).round() as u32);

        if let Some(proxy) = &self.dbus_proxy {
            match proxy
                .set_brightness("backlight", &self.device_name, raw_brightness)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) => debug!("{e}"),
            }
        }

        // Fall back to writing to sysfs brightness file
        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.write_brightness_file)
            .await
            .transient(&self.device_name, "Could not open brightness file to write")?;
        file.write_all(raw_brightness.to_string().as_bytes())
            .await
            .transient(&self.device_name, "Could not write sysfs brightness")
    }
}
