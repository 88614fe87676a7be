use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{Mutex, watch};
use tokio::time::MissedTickBehavior;

use crate::actuation::{
    ApplyReport, Coordinator, Mode, Origin, ParameterTarget, Selector, Sequence,
};
use crate::auto::{AmbientSample, AutoController, AutoState};
use crate::clock::Clock;
use crate::endpoint::EndpointId;
use crate::errors::*;
use crate::schedule::ScheduleEngine;
use crate::sensor::LightSensor;

make_log_macro!(debug, "runtime");
make_log_macro!(warn, "runtime");

/// State shared between the facade and the periodic drivers.
pub(crate) struct Shared {
    pub(crate) coordinator: Coordinator,
    pub(crate) auto: Mutex<AutoController>,
    pub(crate) schedule: Mutex<ScheduleEngine>,
    pub(crate) clock: Arc<dyn Clock>,
}

impl Shared {
    /// One auto-brightness step. Returns what was applied, if anything.
    pub(crate) async fn auto_tick(&self) -> Option<ApplyReport> {
        let mode = self.coordinator.mode();
        let endpoints = self.coordinator.registry().live_endpoints().await;

        let (selector, value, seq) = {
            let mut auto = self.auto.lock().await;
            if auto.state(endpoints.len()) == AutoState::Idle {
                return None;
            }
            let selector = AutoController::target_selector(mode, &endpoints)?;
            let value = auto.tick(mode)?;
            (selector, value, self.coordinator.issue())
        };

        let target = ParameterTarget::brightness(selector, value);
        match self
            .coordinator
            .apply_sequenced(target, seq, Origin::Auto)
            .await
        {
            Ok(report) => {
                if let Some(&(_, applied)) = report.applied.first() {
                    self.auto.lock().await.record_applied(mode, applied);
                }
                Some(report)
            }
            Err(e) => {
                warn!("auto brightness: {e}");
                None
            }
        }
    }

    /// Evaluate the schedule and apply every display whose target moved, or
    /// every display when `force` is set.
    pub(crate) async fn schedule_tick(&self, force: bool) -> ApplyReport {
        match self.schedule_plan(force).await {
            Some((targets, seq)) => self.apply_schedule(targets, seq).await,
            None => ApplyReport::default(),
        }
    }

    /// The schedule's targets for now, numbered when they are decided. `None`
    /// when there is nothing to apply. Auto brightness owns the displays while
    /// it is on, so the schedule waits.
    pub(crate) async fn schedule_plan(
        &self,
        force: bool,
    ) -> Option<(Vec<(EndpointId, u8)>, Sequence)> {
        if self.auto.lock().await.is_enabled() {
            debug!("schedule paused while auto brightness is on");
            return None;
        }
        let now = self.clock.now();
        let endpoints = self.coordinator.registry().live_endpoints().await;

        let mut schedule = self.schedule.lock().await;
        if !schedule.is_enabled() {
            return None;
        }
        let targets = schedule.changed_targets(&now, &endpoints, force);
        if targets.is_empty() {
            return None;
        }
        debug!("schedule at {now}: {targets:?}");
        Some((targets, self.coordinator.issue()))
    }

    pub(crate) async fn apply_schedule(
        &self,
        targets: Vec<(EndpointId, u8)>,
        seq: Sequence,
    ) -> ApplyReport {
        if self.coordinator.mode() == Mode::Linked {
            let distinct: BTreeSet<u8> = targets.iter().map(|(_, value)| *value).collect();
            if distinct.len() > 1 {
                warn!("link conflict: displays are linked but the schedule asks for {targets:?}");
            }
        }

        let results = join_all(targets.iter().map(|&(id, value)| {
            self.coordinator.apply_sequenced(
                ParameterTarget::brightness(Selector::Endpoint(id), value.into()),
                seq,
                Origin::Schedule,
            )
        }))
        .await;

        let mut report = ApplyReport::default();
        for result in results {
            match result {
                Ok(partial) => report.merge(partial),
                Err(e) => warn!("schedule: {e}"),
            }
        }
        if !report.failed.is_empty() {
            let mut schedule = self.schedule.lock().await;
            for (id, _) in &report.failed {
                schedule.forget_target(*id);
            }
        }
        report
    }

    pub(crate) async fn pump(&self) {
        let report = self.coordinator.advance_pending().await;
        if !report.failed.is_empty() {
            debug!("step pump: {:?}", report.failed);
        }
    }

    pub(crate) async fn poll_sensor(&self, sensor: &dyn LightSensor) {
        match sensor.read_lux().await {
            Ok(lux) => self.auto.lock().await.submit(AmbientSample::now(lux)),
            Err(e) => debug!("{}: {e}", sensor.name()),
        }
    }
}

/// Run `tick` every `period` until shutdown. While `enabled` is false the
/// loop sleeps without ticking.
pub(crate) async fn periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut enabled: Option<watch::Receiver<bool>>,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!("{name} loop started, every {period:?}");

    loop {
        if *shutdown.borrow_and_update() {
            break;
        }
        if let Some(flag) = enabled.as_mut() {
            if !*flag.borrow_and_update() {
                tokio::select! {
                    changed = flag.changed() => if changed.is_err() { break },
                    changed = shutdown.changed() => if changed.is_err() { break },
                }
                interval.reset();
                continue;
            }
        }
        tokio::select! {
            changed = flag_changed(&mut enabled) => if changed.is_err() { break },
            changed = shutdown.changed() => if changed.is_err() { break },
            _ = interval.tick() => tick().await,
        }
    }
    debug!("{name} loop stopped");
}

async fn flag_changed(
    flag: &mut Option<watch::Receiver<bool>>,
) -> Result<(), watch::error::RecvError> {
    match flag {
        Some(flag) => flag.changed().await,
        None => std::future::pending().await,
    }
}

#[cfg(feature = "watch")]
pub(crate) async fn hotplug(
    shared: Arc<Shared>,
    mut events: crate::watcher::Hotplug,
    mut shutdown: watch::Receiver<bool>,
) {
    use futures::StreamExt;

    loop {
        if *shutdown.borrow_and_update() {
            break;
        }
        let event = tokio::select! {
            event = events.rx.next() => event,
            changed = shutdown.changed() => match changed {
                Ok(()) => continue,
                Err(_) => break,
            },
        };
        let Some(event) = event else {
            debug!("hotplug watcher closed");
            break;
        };
        match event {
            Ok(event) if crate::watcher::is_hotplug(&event) => {
                debug!("{event:?}");
                match shared.coordinator.registry().discover().await {
                    Ok(live) => debug!("{} live endpoints after hotplug", live.len()),
                    Err(e) => warn!("rediscovery failed: {e}"),
                }
            }
            Ok(_) => {}
            Err(e) => warn!("{e}"),
        }
    }
}
