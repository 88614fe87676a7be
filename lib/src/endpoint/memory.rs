use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;

use super::{Capabilities, Capability, Channel, ChannelKind, ChannelSource, Parameter};
use crate::errors::*;

/// A display that only exists in memory.
///
/// Clones share state, so a handle kept outside the registry can observe
/// writes, unplug the display or inject failures.
#[derive(Debug, Clone)]
pub struct MemoryChannel {
    name: String,
    kind: ChannelKind,
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Debug)]
struct MemoryState {
    capabilities: Capabilities,
    connected: bool,
    transient_failures: u32,
    latency: Duration,
    writes: Vec<(Parameter, u32)>,
}

impl MemoryChannel {
    /// Starts with brightness only, at 50%.
    pub fn new(name: impl Into<String>, kind: ChannelKind) -> Self {
        let mut capabilities = Capabilities::new();
        capabilities.insert(Parameter::Brightness, Capability::percent(50));
        Self {
            name: name.into(),
            kind,
            state: Arc::new(Mutex::new(MemoryState {
                capabilities,
                connected: true,
                transient_failures: 0,
                latency: Duration::ZERO,
                writes: Vec::new(),
            })),
        }
    }

    pub fn with_parameter(self, parameter: Parameter, capability: Capability) -> Self {
        self.lock().capabilities.insert(parameter, capability);
        self
    }

    pub fn without_parameter(self, parameter: Parameter) -> Self {
        self.lock().capabilities.remove(&parameter);
        self
    }

    /// Every round-trip takes this long.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.lock().latency = latency;
        self
    }

    pub fn set_connected(&self, connected: bool) {
        self.lock().connected = connected;
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    /// The next `count` round-trips fail with a retryable error.
    pub fn fail_next(&self, count: u32) {
        self.lock().transient_failures = count;
    }

    pub fn value(&self, parameter: Parameter) -> Option<u32> {
        self.lock().capabilities.get(&parameter).map(|c| c.current)
    }

    /// Every value written so far, oldest first.
    pub fn writes(&self) -> Vec<(Parameter, u32)> {
        self.lock().writes.clone()
    }

    pub fn key(&self) -> String {
        format!("memory:{}", self.name)
    }

    pub fn name(&self) -> String {
        self.name.clone()
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn round_trip(&self) -> Result<()> {
        let latency = self.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.lock();
        if !state.connected {
            return Err(DimmerError::EndpointUnavailable(self.name.clone()));
        }
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(DimmerError::transient(&self.name, "injected failure"));
        }
        Ok(())
    }

    pub(super) async fn capabilities(&mut self) -> Result<Capabilities> {
        self.round_trip().await?;
        Ok(self.lock().capabilities.clone())
    }

    pub(super) async fn get(&mut self, parameter: Parameter) -> Result<u32> {
        self.round_trip().await?;
        self.value(parameter)
            .ok_or_else(|| DimmerError::ParameterUnsupported {
                endpoint: self.name.clone(),
                parameter,
            })
    }

    pub(super) async fn set(&mut self, parameter: Parameter, value: u32) -> Result<()> {
        self.round_trip().await?;
        let mut state = self.lock();
        let Some(capability) = state.capabilities.get_mut(&parameter) else {
            return Err(DimmerError::ParameterUnsupported {
                endpoint: self.name.clone(),
                parameter,
            });
        };
        capability.current = capability.clamp(value);
        let current = capability.current;
        state.writes.push((parameter, current));
        Ok(())
    }
}

/// Offers every connected [`MemoryChannel`] it holds, in insertion order.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    channels: Arc<Mutex<Vec<MemoryChannel>>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, channel: MemoryChannel) {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(channel);
    }
}

impl ChannelSource for MemorySource {
    fn enumerate(&self) -> BoxFuture<'_, Result<Vec<Channel>>> {
        let channels = self
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|c| c.is_connected())
            .cloned()
            .map(Channel::Memory)
            .collect();
        Box::pin(futures::future::ready(Ok(channels)))
    }
}
