//! Uniform get/set access to display control channels.
//!
//! A [`Channel`] is one way of talking to one display: DDC/CI over an i2c
//! bus, a kernel backlight device, or an in-memory software display. Upper
//! layers never look at the variant; they go through the
//! [`EndpointRegistry`], which adds identity, liveness, timeouts, retries and
//! per-endpoint serialization on top.

mod backlight;
mod ddcci;
mod memory;
mod registry;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use futures::future::BoxFuture;
use regex::Regex;
use serde::Deserialize;

pub use backlight::BacklightChannel;
pub use ddcci::DdcChannel;
pub use memory::{MemoryChannel, MemorySource};
pub use registry::EndpointRegistry;

use crate::config::DimmerConfig;
use crate::errors::*;

make_log_macro!(debug, "endpoint");

/// Session-stable handle for a discovered endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(pub(crate) u32);

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Picture parameters, identified by their MCCS VCP code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parameter {
    Brightness,
    Contrast,
    RedGain,
    GreenGain,
    BlueGain,
    BlackLevel,
    RedBlackLevel,
    GreenBlackLevel,
    BlueBlackLevel,
    Sharpness,
}

impl Parameter {
    pub const ALL: [Parameter; 10] = [
        Parameter::Brightness,
        Parameter::Contrast,
        Parameter::RedGain,
        Parameter::GreenGain,
        Parameter::BlueGain,
        Parameter::BlackLevel,
        Parameter::RedBlackLevel,
        Parameter::GreenBlackLevel,
        Parameter::BlueBlackLevel,
        Parameter::Sharpness,
    ];

    pub fn vcp_code(self) -> u8 {
        match self {
            Parameter::Brightness => 0x10,
            Parameter::Contrast => 0x12,
            Parameter::RedGain => 0x16,
            Parameter::GreenGain => 0x18,
            Parameter::BlueGain => 0x1A,
            Parameter::BlackLevel => 0x6C,
            Parameter::RedBlackLevel => 0x6E,
            Parameter::GreenBlackLevel => 0x70,
            Parameter::BlueBlackLevel => 0x72,
            Parameter::Sharpness => 0x87,
        }
    }

    pub fn from_vcp_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.vcp_code() == code)
    }

    pub fn name(self) -> &'static str {
        match self {
            Parameter::Brightness => "Brightness",
            Parameter::Contrast => "Contrast",
            Parameter::RedGain => "Red Gain",
            Parameter::GreenGain => "Green Gain",
            Parameter::BlueGain => "Blue Gain",
            Parameter::BlackLevel => "Black Level",
            Parameter::RedBlackLevel => "Red Black Level",
            Parameter::GreenBlackLevel => "Green Black Level",
            Parameter::BlueBlackLevel => "Blue Black Level",
            Parameter::Sharpness => "Sharpness",
        }
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Parameter {
    type Err = String;

    /// Accepts `"red-gain"`, `"red_gain"`, `"Red Gain"` and hex VCP codes like `"0x16"`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| !matches!(c, '-' | '_' | ' '))
            .flat_map(char::to_lowercase)
            .collect();
        if let Some(hex) = normalized.strip_prefix("0x") {
            return u8::from_str_radix(hex, 16)
                .ok()
                .and_then(Parameter::from_vcp_code)
                .ok_or_else(|| format!("unknown VCP code {s:?}"));
        }
        Parameter::ALL
            .into_iter()
            .find(|p| p.name().replace(' ', "").to_lowercase() == normalized)
            .ok_or_else(|| format!("unknown parameter {s:?}"))
    }
}

/// Advertised range and current value of one parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    pub min: u32,
    pub max: u32,
    pub current: u32,
    pub step: u32,
}

impl Capability {
    pub fn percent(current: u32) -> Self {
        Self {
            min: 0,
            max: 100,
            current: current.min(100),
            step: 1,
        }
    }

    pub fn clamp(&self, value: u32) -> u32 {
        value.clamp(self.min, self.max)
    }
}

pub type Capabilities = BTreeMap<Parameter, Capability>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// An external monitor reached over its display cable.
    Hardware,
    /// The panel of the machine running the controller.
    Builtin,
}

/// What upper layers know about an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    pub id: EndpointId,
    /// 1-based, in discovery order.
    pub ordinal: usize,
    /// Identifies the same physical channel across rediscovery.
    pub key: String,
    pub name: String,
    pub kind: ChannelKind,
    pub live: bool,
}

pub enum Channel {
    Hardware(DdcChannel),
    Builtin(BacklightChannel),
    Memory(MemoryChannel),
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").field("key", &self.key()).finish()
    }
}

impl Channel {
    pub fn key(&self) -> String {
        match self {
            Channel::Hardware(c) => c.key(),
            Channel::Builtin(c) => c.key(),
            Channel::Memory(c) => c.key(),
        }
    }

    pub fn name(&self) -> String {
        match self {
            Channel::Hardware(c) => c.name(),
            Channel::Builtin(c) => c.name(),
            Channel::Memory(c) => c.name(),
        }
    }

    pub fn kind(&self) -> ChannelKind {
        match self {
            Channel::Hardware(_) => ChannelKind::Hardware,
            Channel::Builtin(_) => ChannelKind::Builtin,
            Channel::Memory(c) => c.kind(),
        }
    }

    pub async fn capabilities(&mut self) -> Result<Capabilities> {
        match self {
            Channel::Hardware(c) => c.capabilities().await,
            Channel::Builtin(c) => c.capabilities().await,
            Channel::Memory(c) => c.capabilities().await,
        }
    }

    pub async fn get(&mut self, parameter: Parameter) -> Result<u32> {
        match self {
            Channel::Hardware(c) => c.get(parameter).await,
            Channel::Builtin(c) => c.get(parameter).await,
            Channel::Memory(c) => c.get(parameter).await,
        }
    }

    /// `value` is already clamped to the advertised range.
    pub async fn set(&mut self, parameter: Parameter, value: u32) -> Result<()> {
        match self {
            Channel::Hardware(c) => c.set(parameter, value).await,
            Channel::Builtin(c) => c.set(parameter, value).await,
            Channel::Memory(c) => c.set(parameter, value).await,
        }
    }
}

/// Enumerates the display channels currently present.
pub trait ChannelSource: Send + Sync {
    fn enumerate(&self) -> BoxFuture<'_, Result<Vec<Channel>>>;
}

/// Kernel backlight devices followed by DDC/CI monitors on i2c buses.
pub struct SystemSource {
    device_regex: Regex,
    config: DimmerConfig,
}

impl SystemSource {
    pub fn new(device_regex: Regex, config: DimmerConfig) -> Self {
        Self {
            device_regex,
            config,
        }
    }
}

impl ChannelSource for SystemSource {
    fn enumerate(&self) -> BoxFuture<'_, Result<Vec<Channel>>> {
        Box::pin(async move {
            let mut channels = Vec::new();

            match backlight::discover(&self.device_regex, &self.config).await {
                Ok(found) => channels.extend(found.into_iter().map(Channel::Builtin)),
                Err(e) => debug!("backlight discovery failed: {e}"),
            }

            if self.config.ddc {
                match ddcci::discover(&self.device_regex, &self.config).await {
                    Ok(found) => channels.extend(found.into_iter().map(Channel::Hardware)),
                    Err(e) => debug!("DDC/CI discovery failed: {e}"),
                }
            }

            Ok(channels)
        })
    }
}
