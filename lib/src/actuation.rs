//! Turns parameter targets into endpoint writes.
//!
//! Every command carries a [`Sequence`]. Per endpoint and parameter, a
//! command older than the last one applied is dropped, so a slow automatic
//! command can never overwrite a newer manual one. Automatic origins are
//! rate limited: a large change is applied in steps of at most
//! `actuation.max_step`, with the remainder kept pending until
//! [`Coordinator::advance_pending`] moves it along.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock as StdRwLock};

use futures::future::join_all;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::config::ActuationConfig;
use crate::endpoint::{EndpointId, EndpointRegistry, Parameter};
use crate::errors::*;

make_log_macro!(debug, "actuation");
make_log_macro!(warn, "actuation");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Commands addressed to all displays reach every live endpoint.
    #[default]
    Linked,
    /// Every display is addressed on its own.
    Unlinked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selector {
    Endpoint(EndpointId),
    /// Every live endpoint. Only valid in [`Mode::Linked`].
    AllLinked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterTarget {
    pub selector: Selector,
    pub parameter: Parameter,
    pub value: u32,
}

impl ParameterTarget {
    pub fn new(selector: Selector, parameter: Parameter, value: u32) -> Self {
        Self {
            selector,
            parameter,
            value,
        }
    }

    pub fn brightness(selector: Selector, value: u32) -> Self {
        Self::new(selector, Parameter::Brightness, value)
    }
}

/// Issue order of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sequence(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Manual,
    Auto,
    Schedule,
}

impl Origin {
    fn is_rate_limited(self) -> bool {
        !matches!(self, Origin::Manual)
    }
}

/// What happened to each endpoint a command addressed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Value written (or already in place) per endpoint.
    pub applied: Vec<(EndpointId, u32)>,
    /// Endpoints that have not reached the target yet, with that target.
    pub pending: Vec<(EndpointId, u32)>,
    /// Endpoints where a newer command had already been applied.
    pub stale: Vec<EndpointId>,
    pub unsupported: Vec<EndpointId>,
    pub failed: Vec<(EndpointId, String)>,
}

impl ApplyReport {
    pub fn any_applied(&self) -> bool {
        !self.applied.is_empty()
    }

    pub(crate) fn merge(&mut self, other: ApplyReport) {
        self.applied.extend(other.applied);
        self.pending.extend(other.pending);
        self.stale.extend(other.stale);
        self.unsupported.extend(other.unsupported);
        self.failed.extend(other.failed);
    }
}

enum Outcome {
    Applied { value: u32, pending: Option<u32> },
    Stale,
    Unsupported,
    Failed(DimmerError),
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    value: u32,
    seq: Sequence,
    origin: Origin,
}

#[derive(Debug, Default)]
struct Track {
    last_seq: Option<Sequence>,
    last_applied: Option<u32>,
    pending: Option<Pending>,
}

type EndpointTrack = HashMap<Parameter, Track>;

pub struct Coordinator {
    registry: Arc<EndpointRegistry>,
    mode: StdRwLock<Mode>,
    max_step: u32,
    next_seq: AtomicU64,
    tracks: StdMutex<HashMap<EndpointId, Arc<Mutex<EndpointTrack>>>>,
}

/// Move `current` towards `desired` by at most `max_step`, 0 meaning no limit.
pub fn limit_step(current: u32, desired: u32, max_step: u32) -> u32 {
    if max_step == 0 {
        desired
    } else if desired > current {
        desired.min(current.saturating_add(max_step))
    } else {
        desired.max(current.saturating_sub(max_step))
    }
}

impl Coordinator {
    pub fn new(registry: Arc<EndpointRegistry>, mode: Mode, config: &ActuationConfig) -> Self {
        Self {
            registry,
            mode: StdRwLock::new(mode),
            max_step: config.max_step,
            next_seq: AtomicU64::new(0),
            tracks: StdMutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    pub fn mode(&self) -> Mode {
        *self.mode.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_mode(&self, mode: Mode) {
        let mut current = self.mode.write().unwrap_or_else(PoisonError::into_inner);
        if *current != mode {
            debug!("mode {:?} -> {:?}", *current, mode);
            *current = mode;
        }
    }

    /// Reserve the next sequence number. Take it when the command is decided,
    /// not when it is applied.
    pub fn issue(&self) -> Sequence {
        Sequence(self.next_seq.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub async fn apply(&self, target: ParameterTarget, origin: Origin) -> Result<ApplyReport> {
        let seq = self.issue();
        self.apply_sequenced(target, seq, origin).await
    }

    pub async fn apply_sequenced(
        &self,
        target: ParameterTarget,
        seq: Sequence,
        origin: Origin,
    ) -> Result<ApplyReport> {
        let ids = self.expand(target.selector).await?;
        let outcomes = join_all(
            ids.iter()
                .map(|&id| self.apply_one(id, target.parameter, target.value, seq, origin)),
        )
        .await;
        Ok(Self::report(ids.into_iter().zip(outcomes)))
    }

    /// Take one more step towards every pending target.
    pub async fn advance_pending(&self) -> ApplyReport {
        let tracks: Vec<_> = self
            .tracks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, track)| (*id, track.clone()))
            .collect();

        let mut work = Vec::new();
        for (id, track) in tracks {
            let track = track.lock().await;
            for (parameter, state) in track.iter() {
                if let Some(pending) = state.pending {
                    work.push((id, *parameter, pending));
                }
            }
        }

        let mut report = ApplyReport::default();
        if work.is_empty() {
            return report;
        }
        let outcomes = join_all(work.iter().map(|(id, parameter, pending)| {
            self.apply_one(*id, *parameter, pending.value, pending.seq, pending.origin)
        }))
        .await;
        for ((id, _, _), outcome) in work.into_iter().zip(outcomes) {
            report.merge(Self::report([(id, outcome)]));
        }
        report
    }

    /// Drop every pending target issued by `origin`. Values already written
    /// stay in place.
    pub async fn cancel_pending(&self, origin: Origin) -> usize {
        let tracks: Vec<_> = self
            .tracks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut cancelled = 0;
        for track in tracks {
            let mut track = track.lock().await;
            for state in track.values_mut() {
                if state.pending.is_some_and(|pending| pending.origin == origin) {
                    state.pending = None;
                    cancelled += 1;
                }
            }
        }
        if cancelled > 0 {
            debug!("cancelled {cancelled} pending {origin:?} changes");
        }
        cancelled
    }

    pub fn has_pending(&self) -> bool {
        let tracks = self.tracks.lock().unwrap_or_else(PoisonError::into_inner);
        tracks.values().any(|track| {
            track
                .try_lock()
                .map_or(true, |track| track.values().any(|t| t.pending.is_some()))
        })
    }

    async fn expand(&self, selector: Selector) -> Result<Vec<EndpointId>> {
        match selector {
            Selector::Endpoint(id) => Ok(vec![id]),
            Selector::AllLinked => match self.mode() {
                Mode::Linked => Ok(self
                    .registry
                    .live_endpoints()
                    .await
                    .into_iter()
                    .map(|info| info.id)
                    .collect()),
                Mode::Unlinked => Err(DimmerError::InvalidTarget(
                    "all displays can only be addressed together in linked mode".into(),
                )),
            },
        }
    }

    fn track(&self, id: EndpointId) -> Arc<Mutex<EndpointTrack>> {
        self.tracks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id)
            .or_default()
            .clone()
    }

    fn forget(&self, id: EndpointId) {
        self.tracks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    async fn apply_one(
        &self,
        id: EndpointId,
        parameter: Parameter,
        value: u32,
        seq: Sequence,
        origin: Origin,
    ) -> Outcome {
        let track = self.track(id);
        let mut endpoint_track = track.lock().await;
        let state = endpoint_track.entry(parameter).or_default();

        if state.last_seq.is_some_and(|last| seq < last) {
            debug!("dropping stale {origin:?} command {seq:?} for {parameter} on {id}");
            return Outcome::Stale;
        }

        match self.step(state, id, parameter, value, seq, origin).await {
            Ok(outcome) => outcome,
            Err(DimmerError::ParameterUnsupported { .. }) => Outcome::Unsupported,
            Err(e) if e.is_endpoint_failure() => {
                warn!("{id}: {e}");
                drop(endpoint_track);
                self.forget(id);
                self.registry.mark_dead(id).await;
                Outcome::Failed(e)
            }
            Err(e) => {
                warn!("{id}: {e}");
                Outcome::Failed(e)
            }
        }
    }

    async fn step(
        &self,
        state: &mut Track,
        id: EndpointId,
        parameter: Parameter,
        value: u32,
        seq: Sequence,
        origin: Origin,
    ) -> Result<Outcome> {
        let desired = self.registry.capability(id, parameter).await?.clamp(value);
        let current = match state.last_applied {
            Some(current) => current,
            None => self.registry.get(id, parameter).await?,
        };

        let next = if origin.is_rate_limited() {
            limit_step(current, desired, self.max_step)
        } else {
            desired
        };

        let applied = if origin.is_rate_limited() && state.last_applied == Some(next) {
            next
        } else {
            debug!("{origin:?} {parameter} on {id}: {current} -> {next} (target {desired})");
            self.registry.set(id, parameter, next).await?
        };

        state.last_seq = Some(seq);
        state.last_applied = Some(applied);
        state.pending = (applied != desired).then_some(Pending {
            value: desired,
            seq,
            origin,
        });

        Ok(Outcome::Applied {
            value: applied,
            pending: state.pending.map(|pending| pending.value),
        })
    }

    fn report(outcomes: impl IntoIterator<Item = (EndpointId, Outcome)>) -> ApplyReport {
        let mut report = ApplyReport::default();
        for (id, outcome) in outcomes {
            match outcome {
                Outcome::Applied { value, pending } => {
                    report.applied.push((id, value));
                    if let Some(target) = pending {
                        report.pending.push((id, target));
                    }
                }
                Outcome::Stale => report.stale.push(id),
                Outcome::Unsupported => report.unsupported.push(id),
                Outcome::Failed(e) => report.failed.push((id, e.to_string())),
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IoConfig;
    use crate::endpoint::{ChannelKind, EndpointInfo, MemoryChannel, MemorySource};

    async fn setup(max_step: u32, channels: &[MemoryChannel]) -> (Coordinator, Vec<EndpointInfo>) {
        let source = MemorySource::new();
        for channel in channels {
            source.push(channel.clone());
        }
        let registry = Arc::new(EndpointRegistry::new(Box::new(source), IoConfig::default()));
        let live = registry.discover().await.unwrap();
        let config = ActuationConfig {
            max_step,
            ..ActuationConfig::default()
        };
        (Coordinator::new(registry, Mode::Linked, &config), live)
    }

    fn panel() -> MemoryChannel {
        MemoryChannel::new("panel", ChannelKind::Builtin)
    }

    fn monitor() -> MemoryChannel {
        MemoryChannel::new("monitor", ChannelKind::Hardware)
    }

    #[test]
    fn step_limit() {
        assert_eq!(limit_step(50, 80, 10), 60);
        assert_eq!(limit_step(50, 45, 10), 45);
        assert_eq!(limit_step(5, 0, 10), 0);
        assert_eq!(limit_step(50, 100, 0), 100);
    }

    #[tokio::test]
    async fn linked_commands_reach_every_endpoint() {
        let (a, b) = (panel(), monitor());
        let (coordinator, _) = setup(0, &[a.clone(), b.clone()]).await;

        let report = coordinator
            .apply(ParameterTarget::brightness(Selector::AllLinked, 70), Origin::Manual)
            .await
            .unwrap();
        assert_eq!(report.applied.len(), 2);
        assert_eq!(a.value(Parameter::Brightness), Some(70));
        assert_eq!(b.value(Parameter::Brightness), Some(70));
    }

    #[tokio::test]
    async fn unlinked_mode_rejects_all_linked() {
        let (a, b) = (panel(), monitor());
        let (coordinator, live) = setup(0, &[a.clone(), b.clone()]).await;
        coordinator.set_mode(Mode::Unlinked);

        assert!(matches!(
            coordinator
                .apply(ParameterTarget::brightness(Selector::AllLinked, 70), Origin::Manual)
                .await,
            Err(DimmerError::InvalidTarget(_))
        ));

        coordinator
            .apply(
                ParameterTarget::brightness(Selector::Endpoint(live[1].id), 20),
                Origin::Manual,
            )
            .await
            .unwrap();
        assert_eq!(a.value(Parameter::Brightness), Some(50));
        assert_eq!(b.value(Parameter::Brightness), Some(20));
    }

    #[tokio::test]
    async fn automatic_changes_are_stepped() {
        let a = panel();
        let (coordinator, live) = setup(10, &[a.clone()]).await;
        let target = ParameterTarget::brightness(Selector::Endpoint(live[0].id), 85);

        let report = coordinator.apply(target, Origin::Auto).await.unwrap();
        assert_eq!(report.applied, vec![(live[0].id, 60)]);
        assert_eq!(report.pending, vec![(live[0].id, 85)]);
        assert!(coordinator.has_pending());

        while coordinator.has_pending() {
            coordinator.advance_pending().await;
        }
        assert_eq!(a.value(Parameter::Brightness), Some(85));

        let written: Vec<u32> = a.writes().into_iter().map(|(_, v)| v).collect();
        assert_eq!(written, vec![60, 70, 80, 85]);
        let mut previous = 50;
        for value in written {
            assert!(value.abs_diff(previous) <= 10);
            previous = value;
        }
    }

    #[tokio::test]
    async fn manual_changes_are_instant() {
        let a = panel();
        let (coordinator, live) = setup(10, &[a.clone()]).await;
        coordinator
            .apply(
                ParameterTarget::brightness(Selector::Endpoint(live[0].id), 95),
                Origin::Manual,
            )
            .await
            .unwrap();
        assert_eq!(a.writes(), vec![(Parameter::Brightness, 95)]);
    }

    #[tokio::test]
    async fn manual_command_supersedes_pending_steps() {
        let a = panel();
        let (coordinator, live) = setup(10, &[a.clone()]).await;
        let selector = Selector::Endpoint(live[0].id);

        coordinator
            .apply(ParameterTarget::brightness(selector, 100), Origin::Auto)
            .await
            .unwrap();
        coordinator
            .apply(ParameterTarget::brightness(selector, 20), Origin::Manual)
            .await
            .unwrap();
        assert!(!coordinator.has_pending());
        coordinator.advance_pending().await;
        assert_eq!(a.value(Parameter::Brightness), Some(20));
    }

    #[tokio::test]
    async fn cancelling_an_origin_stops_its_steps() {
        let (a, b) = (panel(), monitor());
        let (coordinator, live) = setup(10, &[a.clone(), b.clone()]).await;

        coordinator
            .apply(ParameterTarget::brightness(Selector::Endpoint(live[0].id), 100), Origin::Auto)
            .await
            .unwrap();
        coordinator
            .apply(ParameterTarget::brightness(Selector::Endpoint(live[1].id), 90), Origin::Schedule)
            .await
            .unwrap();
        coordinator.advance_pending().await;
        assert_eq!(a.value(Parameter::Brightness), Some(70));

        assert_eq!(coordinator.cancel_pending(Origin::Auto).await, 1);
        while coordinator.has_pending() {
            coordinator.advance_pending().await;
        }
        assert_eq!(a.value(Parameter::Brightness), Some(70));
        assert_eq!(b.value(Parameter::Brightness), Some(90));
        assert_eq!(coordinator.cancel_pending(Origin::Auto).await, 0);
    }

    #[tokio::test]
    async fn repeated_automatic_commands_do_not_rewrite() {
        let a = panel();
        let (coordinator, live) = setup(10, &[a.clone()]).await;
        let target = ParameterTarget::brightness(Selector::Endpoint(live[0].id), 55);

        let first = coordinator.apply(target, Origin::Schedule).await.unwrap();
        let second = coordinator.apply(target, Origin::Schedule).await.unwrap();
        assert_eq!(first.applied, second.applied);
        assert_eq!(a.writes().len(), 1);
    }

    #[tokio::test]
    async fn older_commands_are_stale() {
        let a = panel();
        let (coordinator, live) = setup(0, &[a.clone()]).await;
        let target = |value| ParameterTarget::brightness(Selector::Endpoint(live[0].id), value);

        let older = coordinator.issue();
        let newer = coordinator.issue();
        coordinator
            .apply_sequenced(target(70), newer, Origin::Manual)
            .await
            .unwrap();
        let report = coordinator
            .apply_sequenced(target(30), older, Origin::Auto)
            .await
            .unwrap();
        assert_eq!(report.stale, vec![live[0].id]);
        assert_eq!(a.value(Parameter::Brightness), Some(70));
    }

    #[tokio::test]
    async fn failures_stay_with_their_endpoint() {
        let (a, b) = (panel(), monitor());
        let (coordinator, live) = setup(0, &[a.clone(), b.clone()]).await;
        b.set_connected(false);

        let report = coordinator
            .apply(ParameterTarget::brightness(Selector::AllLinked, 30), Origin::Manual)
            .await
            .unwrap();
        assert_eq!(report.applied, vec![(live[0].id, 30)]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, live[1].id);
        assert!(!coordinator.registry().info(live[1].id).await.unwrap().live);

        let report = coordinator
            .apply(ParameterTarget::brightness(Selector::AllLinked, 40), Origin::Manual)
            .await
            .unwrap();
        assert_eq!(report.applied, vec![(live[0].id, 40)]);
        assert!(report.failed.is_empty());
    }

    #[tokio::test]
    async fn unsupported_parameters_are_skipped() {
        let (a, b) = (
            panel(),
            monitor().with_parameter(
                Parameter::Contrast,
                crate::endpoint::Capability {
                    min: 0,
                    max: 100,
                    current: 50,
                    step: 1,
                },
            ),
        );
        let (coordinator, live) = setup(0, &[a, b.clone()]).await;

        let report = coordinator
            .apply(
                ParameterTarget::new(Selector::AllLinked, Parameter::Contrast, 65),
                Origin::Manual,
            )
            .await
            .unwrap();
        assert_eq!(report.unsupported, vec![live[0].id]);
        assert_eq!(report.applied, vec![(live[1].id, 65)]);
        assert_eq!(b.value(Parameter::Contrast), Some(65));
    }
}
