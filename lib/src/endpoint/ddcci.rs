//! DDC/CI over Linux i2c-dev.
//!
//! See the VESA DDC/CI 1.1 standard, sections 4.3 (timing) and 4.4
//! (Get/Set VCP Feature) for the message layouts encoded here.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use regex::Regex;
use tokio::fs::read_dir;

use super::{Capabilities, Capability, Parameter};
use crate::config::{DimmerConfig, EndpointConfig};
use crate::consts::*;
use crate::errors::*;

make_log_macro!(debug, "ddcci");

mod ioctl {
    nix::ioctl_write_int_bad!(set_i2c_slave_address, crate::consts::I2C_SLAVE);
}

/// Destination address byte of host to display messages (0x37 << 1).
const DISPLAY_WRITE_ADDRESS: u8 = 0x6E;
const HOST_ADDRESS: u8 = 0x51;
/// Virtual host address used when checksumming replies.
const REPLY_CHECKSUM_SEED: u8 = 0x50;

const GET_VCP_OPCODE: u8 = 0x01;
const GET_VCP_REPLY_OPCODE: u8 = 0x02;
const SET_VCP_OPCODE: u8 = 0x03;
const GET_VCP_REPLY_LEN: usize = 11;

const GET_VCP_WAIT: Duration = Duration::from_millis(40);
const SET_VCP_WAIT: Duration = Duration::from_millis(50);

fn checksum(seed: u8, bytes: &[u8]) -> u8 {
    bytes.iter().fold(seed, |acc, b| acc ^ b)
}

fn encode(payload: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(payload.len() + 3);
    message.push(HOST_ADDRESS);
    message.push(0x80 | payload.len() as u8);
    message.extend_from_slice(payload);
    message.push(checksum(DISPLAY_WRITE_ADDRESS, &message));
    message
}

pub(crate) fn encode_get_vcp(code: u8) -> Vec<u8> {
    encode(&[GET_VCP_OPCODE, code])
}

pub(crate) fn encode_set_vcp(code: u8, value: u16) -> Vec<u8> {
    let [high, low] = value.to_be_bytes();
    encode(&[SET_VCP_OPCODE, code, high, low])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct VcpValue {
    pub current: u16,
    pub max: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum VcpReply {
    Value(VcpValue),
    Unsupported,
}

/// Decode a Get VCP Feature reply. `Err` carries a reason worth retrying for.
pub(crate) fn decode_get_vcp_reply(reply: &[u8], code: u8) -> std::result::Result<VcpReply, String> {
    if reply.len() < 3 {
        return Err(format!("short reply of {} bytes", reply.len()));
    }
    let len = (reply[1] & 0x7F) as usize;
    if len == 0 {
        return Err("display is busy (null message)".into());
    }
    if reply.len() < GET_VCP_REPLY_LEN || len != GET_VCP_REPLY_LEN - 3 {
        return Err(format!("unexpected reply length {len}"));
    }
    let expected = checksum(REPLY_CHECKSUM_SEED, &reply[..GET_VCP_REPLY_LEN - 1]);
    if reply[GET_VCP_REPLY_LEN - 1] != expected {
        return Err("reply checksum mismatch".into());
    }
    if reply[2] != GET_VCP_REPLY_OPCODE {
        return Err(format!("unexpected opcode {:#04x}", reply[2]));
    }
    if reply[4] != code {
        return Err(format!("reply for VCP {:#04x}, wanted {code:#04x}", reply[4]));
    }
    match reply[3] {
        0x00 => Ok(VcpReply::Value(VcpValue {
            max: u16::from_be_bytes([reply[6], reply[7]]),
            current: u16::from_be_bytes([reply[8], reply[9]]),
        })),
        0x01 => Ok(VcpReply::Unsupported),
        other => Err(format!("result code {other:#04x}")),
    }
}

/// An open i2c-dev bus addressed at the display's DDC/CI port.
struct I2cBus {
    file: Mutex<File>,
}

impl I2cBus {
    fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        // SAFETY: the fd stays open for the duration of the call
        unsafe { ioctl::set_i2c_slave_address(file.as_raw_fd(), DDC_CI_ADDRESS as i32) }
            .map_err(std::io::Error::from)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Write `request`, wait, then read `reply_len` bytes if asked to.
    fn transact(&self, request: &[u8], wait: Duration, reply_len: usize) -> std::io::Result<Vec<u8>> {
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(request)?;
        std::thread::sleep(wait);
        let mut reply = vec![0; reply_len];
        if reply_len > 0 {
            file.read_exact(&mut reply)?;
        }
        Ok(reply)
    }
}

/// An external monitor answering DDC/CI.
///
/// Brightness is exposed as a percentage of the monitor's maximum, the
/// remaining picture parameters in their native VCP range.
pub struct DdcChannel {
    bus: Arc<I2cBus>,
    bus_path: PathBuf,
    bus_name: String,
    config: EndpointConfig,
    maxima: HashMap<Parameter, u16>,
}

pub(super) async fn discover(device_regex: &Regex, config: &DimmerConfig) -> Result<Vec<DdcChannel>> {
    let mut entries = read_dir(I2C_DEV_PATH).await?;

    let mut buses: Vec<(u32, String)> = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(number) = name.strip_prefix(I2C_DEV_PREFIX) else {
            continue;
        };
        let Ok(number) = number.parse::<u32>() else {
            continue;
        };
        if device_regex.is_match(&name) {
            buses.push((number, name));
        }
    }
    buses.sort();

    let candidates = join_all(buses.into_iter().map(|(_, name)| async move {
        let mut channel = DdcChannel::open(
            &PathBuf::from(I2C_DEV_PATH).join(&name),
            config.endpoint_config(&name),
        )
        .await?;
        // Plenty of buses have no monitor on them, only keep the ones that answer.
        channel.get(Parameter::Brightness).await?;
        Ok::<_, DimmerError>(channel)
    }))
    .await;

    Ok(candidates
        .into_iter()
        .filter_map(|candidate| match candidate {
            Ok(channel) => Some(channel),
            Err(e) => {
                debug!("{e}");
                None
            }
        })
        .collect())
}

impl DdcChannel {
    pub async fn open(bus_path: &Path, config: EndpointConfig) -> Result<Self> {
        let bus_name = bus_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| bus_path.display().to_string());
        let path = bus_path.to_path_buf();
        let bus = tokio::task::spawn_blocking(move || I2cBus::open(&path))
            .await
            .transient(&bus_name, "i2c open task failed")?
            .transient(&bus_name, "Failed to open i2c bus")?;
        Ok(Self {
            bus: Arc::new(bus),
            bus_path: bus_path.to_path_buf(),
            bus_name,
            config,
            maxima: HashMap::new(),
        })
    }

    pub fn key(&self) -> String {
        format!("ddcci:{}", self.bus_path.display())
    }

    pub fn name(&self) -> String {
        self.bus_name.clone()
    }

    fn wait(&self, base: Duration) -> Duration {
        base.mul_f64(self.config.ddcci_sleep_multiplier)
    }

    async fn get_vcp(&self, code: u8) -> Result<VcpReply> {
        let bus = self.bus.clone();
        let request = encode_get_vcp(code);
        let wait = self.wait(GET_VCP_WAIT);
        let reply = tokio::task::spawn_blocking(move || bus.transact(&request, wait, GET_VCP_REPLY_LEN))
            .await
            .transient(&self.bus_name, "i2c task failed")?
            .transient(&self.bus_name, "Get VCP failed")?;
        decode_get_vcp_reply(&reply, code).map_err(|reason| DimmerError::transient(&self.bus_name, reason))
    }

    async fn set_vcp(&self, code: u8, value: u16) -> Result<()> {
        let bus = self.bus.clone();
        let request = encode_set_vcp(code, value);
        let wait = self.wait(SET_VCP_WAIT);
        tokio::task::spawn_blocking(move || bus.transact(&request, wait, 0))
            .await
            .transient(&self.bus_name, "i2c task failed")?
            .transient(&self.bus_name, "Set VCP failed")?;
        Ok(())
    }

    async fn read(&mut self, parameter: Parameter) -> Result<VcpValue> {
        match self.get_vcp(parameter.vcp_code()).await? {
            VcpReply::Value(value) if value.max > 0 => {
                self.maxima.insert(parameter, value.max);
                Ok(value)
            }
            _ => Err(DimmerError::ParameterUnsupported {
                endpoint: self.bus_name.clone(),
                parameter,
            }),
        }
    }

    fn to_public(&self, parameter: Parameter, value: VcpValue) -> Result<u32> {
        match parameter {
            Parameter::Brightness => self
                .config
                .ratio_to_percent(value.current as f64 / value.max as f64),
            _ => Ok(value.current.min(value.max) as u32),
        }
    }

    pub(super) async fn capabilities(&mut self) -> Result<Capabilities> {
        let mut capabilities = Capabilities::new();
        for parameter in Parameter::ALL {
            match self.read(parameter).await {
                Ok(value) => {
                    let current = self.to_public(parameter, value)?;
                    let capability = match parameter {
                        Parameter::Brightness => Capability::percent(current),
                        _ => Capability {
                            min: 0,
                            max: value.max as u32,
                            current,
                            step: 1,
                        },
                    };
                    capabilities.insert(parameter, capability);
                }
                Err(DimmerError::ParameterUnsupported { .. }) => {}
                Err(e) if parameter == Parameter::Brightness => return Err(e),
                Err(e) => debug!("skipping {parameter}: {e}"),
            }
        }
        if capabilities.is_empty() {
            return Err(DimmerError::EndpointUnavailable(self.bus_name.clone()));
        }
        Ok(capabilities)
    }

    pub(super) async fn get(&mut self, parameter: Parameter) -> Result<u32> {
        let value = self.read(parameter).await?;
        self.to_public(parameter, value)
    }

    pub(super) async fn set(&mut self, parameter: Parameter, value: u32) -> Result<()> {
        let max = match self.maxima.get(&parameter) {
            Some(max) => *max,
            None => self.read(parameter).await?.max,
        };
        let raw = match parameter {
            Parameter::Brightness => {
                (self.config.percent_to_ratio(value)? * max as f64).round() as u16
            }
            _ => value.min(max as u32) as u16,
        };
        self.set_vcp(parameter.vcp_code(), raw).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(result: u8, code: u8, max: u16, current: u16) -> Vec<u8> {
        let [max_hi, max_lo] = max.to_be_bytes();
        let [cur_hi, cur_lo] = current.to_be_bytes();
        let mut bytes = vec![
            0x6E,
            0x88,
            GET_VCP_REPLY_OPCODE,
            result,
            code,
            0x00,
            max_hi,
            max_lo,
            cur_hi,
            cur_lo,
        ];
        bytes.push(checksum(REPLY_CHECKSUM_SEED, &bytes));
        bytes
    }

    #[test]
    fn get_vcp_request_layout() {
        // 0x6E ^ 0x51 ^ 0x82 ^ 0x01 ^ 0x10 = 0xAC
        assert_eq!(encode_get_vcp(0x10), vec![0x51, 0x82, 0x01, 0x10, 0xAC]);
    }

    #[test]
    fn set_vcp_request_layout() {
        let message = encode_set_vcp(0x10, 0x0032);
        assert_eq!(&message[..6], &[0x51, 0x84, 0x03, 0x10, 0x00, 0x32]);
        assert_eq!(message[6], checksum(DISPLAY_WRITE_ADDRESS, &message[..6]));
    }

    #[test]
    fn decodes_values() {
        assert_eq!(
            decode_get_vcp_reply(&reply(0x00, 0x12, 100, 70), 0x12),
            Ok(VcpReply::Value(VcpValue {
                current: 70,
                max: 100
            }))
        );
        assert_eq!(
            decode_get_vcp_reply(&reply(0x01, 0x87, 0, 0), 0x87),
            Ok(VcpReply::Unsupported)
        );
    }

    #[test]
    fn rejects_corrupt_replies() {
        let mut corrupt = reply(0x00, 0x10, 100, 50);
        corrupt[8] ^= 0x01;
        assert!(decode_get_vcp_reply(&corrupt, 0x10).is_err());

        assert!(decode_get_vcp_reply(&reply(0x00, 0x12, 100, 50), 0x10).is_err());
        assert!(decode_get_vcp_reply(&[0x6E, 0x80, 0xBE], 0x10).is_err());
        assert!(decode_get_vcp_reply(&[0x6E], 0x10).is_err());
    }
}
