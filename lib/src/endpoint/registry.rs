use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tokio::time::sleep;

use super::{Capabilities, Capability, Channel, ChannelSource, EndpointId, EndpointInfo, Parameter};
use crate::config::IoConfig;
use crate::errors::*;
use crate::util::with_deadline;

make_log_macro!(debug, "registry");
make_log_macro!(info, "registry");

/// A channel plus what we have learned about it. Guarded by a per-endpoint
/// lock so one endpoint only ever has a single transaction in flight.
struct Handle {
    channel: Channel,
    capabilities: Option<Capabilities>,
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Capabilities,
    Get(Parameter),
    Set(Parameter, u32),
}

enum Reply {
    Capabilities(Capabilities),
    Value(u32),
    Done,
}

impl Handle {
    fn new(channel: Channel) -> Self {
        Self {
            channel,
            capabilities: None,
        }
    }

    fn remember(&mut self, parameter: Parameter, value: u32) {
        if let Some(capability) = self
            .capabilities
            .as_mut()
            .and_then(|caps| caps.get_mut(&parameter))
        {
            capability.current = value;
        }
    }

    async fn perform(&mut self, op: Op) -> Result<Reply> {
        match op {
            Op::Capabilities => {
                if let Some(capabilities) = &self.capabilities {
                    return Ok(Reply::Capabilities(capabilities.clone()));
                }
                let capabilities = self.channel.capabilities().await?;
                self.capabilities = Some(capabilities.clone());
                Ok(Reply::Capabilities(capabilities))
            }
            Op::Get(parameter) => {
                let value = self.channel.get(parameter).await?;
                self.remember(parameter, value);
                Ok(Reply::Value(value))
            }
            Op::Set(parameter, value) => {
                self.channel.set(parameter, value).await?;
                self.remember(parameter, value);
                Ok(Reply::Done)
            }
        }
    }
}

struct Slot {
    info: EndpointInfo,
    handle: Arc<Mutex<Handle>>,
}

/// Owns every endpoint seen this session.
///
/// Endpoints that disappear are marked dead rather than dropped, so their
/// identifiers stay valid and calls against them fail with
/// [`DimmerError::EndpointUnavailable`].
pub struct EndpointRegistry {
    source: Box<dyn ChannelSource>,
    io: IoConfig,
    slots: RwLock<Vec<Slot>>,
    discovery: Mutex<()>,
}

impl EndpointRegistry {
    pub fn new(source: Box<dyn ChannelSource>, io: IoConfig) -> Self {
        Self {
            source,
            io,
            slots: RwLock::new(Vec::new()),
            discovery: Mutex::new(()),
        }
    }

    /// Enumerate channels and reconcile them with what we already know.
    /// Returns the live endpoints in ordinal order.
    pub async fn discover(&self) -> Result<Vec<EndpointInfo>> {
        let _discovery = self.discovery.lock().await;
        let channels = self.source.enumerate().await?;

        let mut slots = self.slots.write().await;
        let mut seen = HashSet::new();
        for channel in channels {
            let key = channel.key();
            if !seen.insert(key.clone()) {
                debug!("{key} enumerated twice, ignoring the duplicate");
                continue;
            }
            match slots.iter_mut().find(|slot| slot.info.key == key) {
                Some(slot) if slot.info.live => {}
                Some(slot) => {
                    info!("{} ({}) is back", slot.info.name, slot.info.id);
                    slot.info.live = true;
                    slot.info.name = channel.name();
                    slot.handle = Arc::new(Mutex::new(Handle::new(channel)));
                }
                None => {
                    let ordinal = slots.len() + 1;
                    let info = EndpointInfo {
                        id: EndpointId(ordinal as u32),
                        ordinal,
                        key,
                        name: channel.name(),
                        kind: channel.kind(),
                        live: true,
                    };
                    info!("found {} as display {}", info.name, info.ordinal);
                    slots.push(Slot {
                        info,
                        handle: Arc::new(Mutex::new(Handle::new(channel))),
                    });
                }
            }
        }

        for slot in slots.iter_mut() {
            if slot.info.live && !seen.contains(&slot.info.key) {
                info!("{} ({}) is gone", slot.info.name, slot.info.id);
                slot.info.live = false;
            }
        }

        Ok(slots
            .iter()
            .filter(|slot| slot.info.live)
            .map(|slot| slot.info.clone())
            .collect())
    }

    /// Every endpoint seen this session, dead ones included.
    pub async fn endpoints(&self) -> Vec<EndpointInfo> {
        self.slots
            .read()
            .await
            .iter()
            .map(|slot| slot.info.clone())
            .collect()
    }

    pub async fn live_endpoints(&self) -> Vec<EndpointInfo> {
        self.slots
            .read()
            .await
            .iter()
            .filter(|slot| slot.info.live)
            .map(|slot| slot.info.clone())
            .collect()
    }

    pub async fn info(&self, id: EndpointId) -> Option<EndpointInfo> {
        self.slots
            .read()
            .await
            .iter()
            .find(|slot| slot.info.id == id)
            .map(|slot| slot.info.clone())
    }

    /// Stop addressing an endpoint until the next discovery finds it again.
    pub async fn mark_dead(&self, id: EndpointId) {
        let mut slots = self.slots.write().await;
        if let Some(slot) = slots.iter_mut().find(|slot| slot.info.id == id) {
            if slot.info.live {
                info!("marking {} ({}) dead", slot.info.name, id);
            }
            slot.info.live = false;
        }
    }

    async fn handle(&self, id: EndpointId) -> Result<(String, Arc<Mutex<Handle>>)> {
        let slots = self.slots.read().await;
        match slots.iter().find(|slot| slot.info.id == id) {
            Some(slot) if slot.info.live => Ok((slot.info.name.clone(), slot.handle.clone())),
            Some(slot) => Err(DimmerError::EndpointUnavailable(slot.info.name.clone())),
            None => Err(DimmerError::EndpointUnavailable(id.to_string())),
        }
    }

    /// One operation under the endpoint's lock, bounded by the I/O deadline and
    /// retried with exponential backoff while the failure is transient.
    async fn transact(&self, id: EndpointId, op: Op) -> Result<Reply> {
        let (name, handle) = self.handle(id).await?;
        let mut attempt: u32 = 0;
        loop {
            let result = {
                let mut handle = handle.lock().await;
                with_deadline(self.io.timeout(), &name, handle.perform(op)).await
            };
            match result {
                Err(e @ DimmerError::TransientIo { .. }) if attempt < self.io.retries as u32 => {
                    let backoff = self.io.backoff(attempt);
                    debug!("{op:?} on {name} failed ({e}), retry {} in {backoff:?}", attempt + 1);
                    attempt += 1;
                    sleep(backoff).await;
                }
                result => return result,
            }
        }
    }

    pub async fn capabilities(&self, id: EndpointId) -> Result<Capabilities> {
        match self.transact(id, Op::Capabilities).await {
            Ok(Reply::Capabilities(capabilities)) => Ok(capabilities),
            Ok(_) => Err(DimmerError::Other("unexpected reply to a capability query".into())),
            Err(DimmerError::TransientIo { endpoint, reason }) => {
                debug!("capabilities of {endpoint}: {reason}");
                Err(DimmerError::EndpointUnavailable(endpoint))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn capability(&self, id: EndpointId, parameter: Parameter) -> Result<Capability> {
        let capabilities = self.capabilities(id).await?;
        match capabilities.get(&parameter) {
            Some(capability) => Ok(*capability),
            None => {
                let endpoint = self
                    .info(id)
                    .await
                    .map_or_else(|| id.to_string(), |info| info.name);
                Err(DimmerError::ParameterUnsupported {
                    endpoint,
                    parameter,
                })
            }
        }
    }

    pub async fn get(&self, id: EndpointId, parameter: Parameter) -> Result<u32> {
        self.capability(id, parameter).await?;
        match self.transact(id, Op::Get(parameter)).await? {
            Reply::Value(value) => Ok(value),
            _ => Err(DimmerError::Other("unexpected reply to a get".into())),
        }
    }

    /// Clamp `value` to the advertised range and write it. Returns the value
    /// actually written.
    pub async fn set(&self, id: EndpointId, parameter: Parameter, value: u32) -> Result<u32> {
        let value = self.capability(id, parameter).await?.clamp(value);
        self.transact(id, Op::Set(parameter, value)).await?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::endpoint::{ChannelKind, MemoryChannel, MemorySource};

    fn io() -> IoConfig {
        IoConfig {
            timeout_ms: 100,
            retries: 2,
            backoff_ms: 10,
        }
    }

    fn registry_with(channels: &[MemoryChannel]) -> EndpointRegistry {
        let source = MemorySource::new();
        for channel in channels {
            source.push(channel.clone());
        }
        EndpointRegistry::new(Box::new(source), io())
    }

    #[tokio::test]
    async fn discovery_assigns_ordinals_in_order() {
        let panel = MemoryChannel::new("panel", ChannelKind::Builtin);
        let external = MemoryChannel::new("external", ChannelKind::Hardware);
        let registry = registry_with(&[panel, external]);

        let live = registry.discover().await.unwrap();
        assert_eq!(live.len(), 2);
        assert_eq!((live[0].ordinal, live[0].name.as_str()), (1, "panel"));
        assert_eq!((live[1].ordinal, live[1].name.as_str()), (2, "external"));
        assert_eq!(live[0].kind, ChannelKind::Builtin);

        // Rediscovery is idempotent.
        assert_eq!(registry.discover().await.unwrap(), live);
    }

    #[tokio::test]
    async fn vanished_endpoints_are_kept_dead_and_revive_with_their_identity() {
        let panel = MemoryChannel::new("panel", ChannelKind::Builtin);
        let external = MemoryChannel::new("external", ChannelKind::Hardware);
        let source = MemorySource::new();
        source.push(panel.clone());
        source.push(external.clone());
        let registry = EndpointRegistry::new(Box::new(source.clone()), io());
        let first = registry.discover().await.unwrap();
        let external_id = first[1].id;

        external.set_connected(false);
        let live = registry.discover().await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(registry.endpoints().await.len(), 2);
        assert!(!registry.info(external_id).await.unwrap().live);
        assert!(matches!(
            registry.set(external_id, Parameter::Brightness, 10).await,
            Err(DimmerError::EndpointUnavailable(_))
        ));

        source.push(MemoryChannel::new("projector", ChannelKind::Hardware));
        external.set_connected(true);
        let live = registry.discover().await.unwrap();
        let ordinals: Vec<_> = live.iter().map(|info| (info.name.as_str(), info.ordinal)).collect();
        assert_eq!(ordinals, vec![("panel", 1), ("external", 2), ("projector", 3)]);
        assert_eq!(live[1].id, external_id);
    }

    #[tokio::test]
    async fn set_clamps_to_the_advertised_range() {
        let monitor = MemoryChannel::new("monitor", ChannelKind::Hardware).with_parameter(
            Parameter::Contrast,
            Capability {
                min: 0,
                max: 80,
                current: 40,
                step: 1,
            },
        );
        let registry = registry_with(&[monitor.clone()]);
        let id = registry.discover().await.unwrap()[0].id;

        assert_eq!(registry.set(id, Parameter::Contrast, 120).await.unwrap(), 80);
        assert_eq!(monitor.value(Parameter::Contrast), Some(80));
        assert_eq!(registry.get(id, Parameter::Contrast).await.unwrap(), 80);
        assert_eq!(
            registry.capabilities(id).await.unwrap()[&Parameter::Contrast].current,
            80
        );
    }

    #[tokio::test]
    async fn unsupported_parameters_are_reported() {
        let registry = registry_with(&[MemoryChannel::new("panel", ChannelKind::Builtin)]);
        let id = registry.discover().await.unwrap()[0].id;
        assert!(matches!(
            registry.set(id, Parameter::Sharpness, 3).await,
            Err(DimmerError::ParameterUnsupported { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_within_budget() {
        let monitor = MemoryChannel::new("monitor", ChannelKind::Hardware);
        let registry = registry_with(&[monitor.clone()]);
        let id = registry.discover().await.unwrap()[0].id;
        registry.capabilities(id).await.unwrap();

        monitor.fail_next(2);
        assert_eq!(registry.set(id, Parameter::Brightness, 70).await.unwrap(), 70);

        monitor.fail_next(3);
        assert!(matches!(
            registry.set(id, Parameter::Brightness, 20).await,
            Err(DimmerError::TransientIo { .. })
        ));
        assert_eq!(monitor.value(Parameter::Brightness), Some(70));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_endpoints_time_out() {
        let monitor =
            MemoryChannel::new("monitor", ChannelKind::Hardware).with_latency(Duration::from_secs(30));
        let registry = registry_with(&[monitor]);
        let id = registry.discover().await.unwrap()[0].id;

        let started = tokio::time::Instant::now();
        assert!(matches!(
            registry.capabilities(id).await,
            Err(DimmerError::EndpointUnavailable(_))
        ));
        // three attempts of 100ms plus 10ms and 20ms of backoff
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn independent_endpoints_are_not_serialized() {
        let latency = Duration::from_millis(60);
        let a = MemoryChannel::new("a", ChannelKind::Hardware).with_latency(latency);
        let b = MemoryChannel::new("b", ChannelKind::Hardware).with_latency(latency);
        let registry = registry_with(&[a, b]);
        let live = registry.discover().await.unwrap();
        for info in &live {
            registry.capabilities(info.id).await.unwrap();
        }

        let started = tokio::time::Instant::now();
        let (first, second) = tokio::join!(
            registry.set(live[0].id, Parameter::Brightness, 10),
            registry.set(live[1].id, Parameter::Brightness, 10),
        );
        first.unwrap();
        second.unwrap();
        assert!(started.elapsed() < latency * 2);
    }
}
