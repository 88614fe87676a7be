//! Ambient light to brightness.
//!
//! Samples arrive whenever the sensor feels like it. The controller keeps the
//! latest one and, on every tick, maps it through a [`LuxCurve`], smooths the
//! result exponentially and emits at most one rate-limited brightness command.

use std::collections::HashMap;

use serde::Deserialize;
use smart_default::SmartDefault;
use tokio::time::Instant;

use crate::actuation::{Mode, Selector, limit_step};
use crate::config::AutoConfig;
use crate::consts::BRIGHTNESS_RANGE;
use crate::endpoint::{ChannelKind, EndpointInfo, Parameter};
use crate::util::clamp_percent;

make_log_macro!(debug, "auto");

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AmbientSample {
    pub timestamp: Instant,
    pub lux: f64,
}

impl AmbientSample {
    pub fn now(lux: f64) -> Self {
        Self {
            timestamp: Instant::now(),
            lux,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurveKind {
    #[default]
    Linear,
    /// Closer to how the eye perceives light: dim rooms get most of the range.
    Logarithmic,
}

#[derive(Debug, Clone, PartialEq, Deserialize, SmartDefault)]
#[serde(default)]
#[serde(deny_unknown_fields)]
pub struct LuxCurve {
    pub kind: CurveKind,
    /// Illuminance at and above which `max_brightness` is used.
    #[default(800.0)]
    pub max_lux: f64,
    #[default(6)]
    pub min_brightness: u32,
    #[default(100)]
    pub max_brightness: u32,
}

impl LuxCurve {
    /// Brightness for `lux`, unrounded. Non-decreasing in `lux`.
    pub fn map(&self, lux: f64) -> f64 {
        let lux = if lux.is_nan() { 0.0 } else { lux.max(0.0) };
        let max_lux = self.max_lux.max(1.0);
        let ratio = match self.kind {
            CurveKind::Linear => lux / max_lux,
            CurveKind::Logarithmic => (lux + 1.0).log10() / (max_lux + 1.0).log10(),
        }
        .clamp(0.0, 1.0);

        let top = *BRIGHTNESS_RANGE.end();
        let low = self.min_brightness.min(self.max_brightness).min(top) as f64;
        let high = self.max_brightness.max(self.min_brightness).min(top) as f64;
        low + ratio * (high - low)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SmoothingState {
    pub smoothed: f64,
    pub last_applied: Option<u32>,
    pub last_applied_at: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoState {
    Idle,
    Active,
}

pub struct AutoController {
    config: AutoConfig,
    enabled: bool,
    latest: Option<AmbientSample>,
    smoothing: HashMap<(Mode, Parameter), SmoothingState>,
}

impl AutoController {
    pub fn new(config: AutoConfig) -> Self {
        Self {
            enabled: config.enabled,
            config,
            latest: None,
            smoothing: HashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Stopping discards all smoothing state; the next start begins fresh.
    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled && !enabled {
            debug!("stopped, discarding smoothing state");
            self.smoothing.clear();
        }
        self.enabled = enabled;
    }

    pub fn state(&self, live_endpoints: usize) -> AutoState {
        if self.enabled && live_endpoints > 0 {
            AutoState::Active
        } else {
            AutoState::Idle
        }
    }

    pub fn submit(&mut self, sample: AmbientSample) {
        if !sample.lux.is_finite() {
            debug!("ignoring sample of {} lux", sample.lux);
            return;
        }
        if self.latest.is_some_and(|latest| sample.timestamp < latest.timestamp) {
            debug!("ignoring out of order sample");
            return;
        }
        self.latest = Some(sample);
    }

    pub fn latest(&self) -> Option<AmbientSample> {
        self.latest
    }

    pub fn smoothing(&self, mode: Mode) -> Option<&SmoothingState> {
        self.smoothing.get(&(mode, Parameter::Brightness))
    }

    /// Advance the smoothing by one tick and return the brightness to command,
    /// or `None` when the change falls inside the dead band.
    pub fn tick(&mut self, mode: Mode) -> Option<u32> {
        if !self.enabled {
            return None;
        }
        let sample = self.latest?;
        let mapped = self.config.curve.map(sample.lux);
        let alpha = self.config.smoothing_factor;

        let state = self
            .smoothing
            .entry((mode, Parameter::Brightness))
            .and_modify(|state| state.smoothed += alpha * (mapped - state.smoothed))
            .or_insert_with(|| SmoothingState {
                smoothed: mapped,
                last_applied: None,
                last_applied_at: None,
            });

        let target = clamp_percent(state.smoothed);
        let Some(last) = state.last_applied else {
            return Some(target);
        };
        if target.abs_diff(last) < self.config.deadband.max(1) {
            return None;
        }
        Some(limit_step(last, target, self.config.max_step))
    }

    pub fn record_applied(&mut self, mode: Mode, value: u32) {
        if let Some(state) = self.smoothing.get_mut(&(mode, Parameter::Brightness)) {
            state.last_applied = Some(value);
            state.last_applied_at = Some(Instant::now());
        }
    }

    /// Where automatic commands go: everything when linked, otherwise the
    /// primary display.
    pub fn target_selector(mode: Mode, endpoints: &[EndpointInfo]) -> Option<Selector> {
        let mut live = endpoints.iter().filter(|info| info.live);
        match mode {
            Mode::Linked => live.next().map(|_| Selector::AllLinked),
            Mode::Unlinked => {
                let live: Vec<_> = live.collect();
                live.iter()
                    .find(|info| info.kind == ChannelKind::Builtin)
                    .or_else(|| live.iter().min_by_key(|info| info.ordinal))
                    .map(|info| Selector::Endpoint(info.id))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use proptest::prelude::*;

    use super::*;
    use crate::endpoint::EndpointId;

    fn controller() -> AutoController {
        AutoController::new(AutoConfig {
            enabled: true,
            ..AutoConfig::default()
        })
    }

    fn info(id: u32, kind: ChannelKind) -> EndpointInfo {
        EndpointInfo {
            id: EndpointId(id),
            ordinal: id as usize,
            key: format!("memory:{id}"),
            name: id.to_string(),
            kind,
            live: true,
        }
    }

    #[test]
    fn default_curve_endpoints() {
        let curve = LuxCurve::default();
        assert_eq!(curve.map(0.0), 6.0);
        assert_eq!(curve.map(800.0), 100.0);
        assert_eq!(curve.map(1e6), 100.0);
        assert_eq!(curve.map(f64::NAN), 6.0);
        assert_eq!(curve.map(-5.0), 6.0);
    }

    proptest! {
        #[test]
        fn curve_is_monotonic(a in 0.0f64..100_000.0, b in 0.0f64..100_000.0, linear in any::<bool>()) {
            let curve = LuxCurve {
                kind: if linear { CurveKind::Linear } else { CurveKind::Logarithmic },
                ..LuxCurve::default()
            };
            let (low, high) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(curve.map(low) <= curve.map(high));
            prop_assert!(clamp_percent(curve.map(low)) <= clamp_percent(curve.map(high)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sudden_brightness_rises_gradually() {
        let mut auto = AutoController::new(AutoConfig {
            enabled: true,
            smoothing_factor: 0.2,
            ..AutoConfig::default()
        });
        let mut commands = Vec::new();
        for lux in [10.0, 10.0, 10.0, 1000.0] {
            auto.submit(AmbientSample::now(lux));
            if let Some(value) = auto.tick(Mode::Linked) {
                auto.record_applied(Mode::Linked, value);
                commands.push(value);
            }
            tokio::time::advance(Duration::from_secs(1)).await;
        }
        // 10 lux settles around 7%, the jump to 1000 lux moves at most one step
        assert_eq!(commands, vec![7, 11]);

        for _ in 0..40 {
            if let Some(value) = auto.tick(Mode::Linked) {
                auto.record_applied(Mode::Linked, value);
                commands.push(value);
            }
        }
        for pair in commands.windows(2) {
            assert!(pair[1] > pair[0] && pair[1] - pair[0] <= 4, "{commands:?}");
        }
        let last = *commands.last().unwrap();
        assert!((97..=100).contains(&last), "{commands:?}");
    }

    #[test]
    fn small_changes_fall_in_the_dead_band() {
        let mut auto = controller();
        auto.submit(AmbientSample::now(100.0));
        let first = auto.tick(Mode::Linked).unwrap();
        auto.record_applied(Mode::Linked, first);
        auto.submit(AmbientSample::now(102.0));
        assert_eq!(auto.tick(Mode::Linked), None);
    }

    #[test]
    fn disabled_controller_is_idle_and_forgets() {
        let mut auto = controller();
        assert_eq!(auto.state(0), AutoState::Idle);
        assert_eq!(auto.state(1), AutoState::Active);

        auto.submit(AmbientSample::now(50.0));
        auto.tick(Mode::Linked);
        assert!(auto.smoothing(Mode::Linked).is_some());

        auto.set_enabled(false);
        assert_eq!(auto.state(1), AutoState::Idle);
        assert_eq!(auto.tick(Mode::Linked), None);
        assert!(auto.smoothing(Mode::Linked).is_none());
    }

    #[test]
    fn logarithmic_curve_favours_dim_rooms() {
        let curve = LuxCurve {
            kind: CurveKind::Logarithmic,
            ..LuxCurve::default()
        };
        assert_eq!(clamp_percent(curve.map(10.0)), 40);
        assert_eq!(curve.map(800.0), 100.0);
        assert!(curve.map(100.0) > LuxCurve::default().map(100.0));
    }

    #[test]
    fn modes_are_smoothed_separately() {
        let mut auto = controller();
        auto.submit(AmbientSample::now(10.0));
        auto.tick(Mode::Linked);
        auto.submit(AmbientSample::now(1000.0));
        assert_eq!(auto.tick(Mode::Unlinked), Some(100));
    }

    #[test]
    fn unlinked_targets_the_primary_display() {
        let external = info(1, ChannelKind::Hardware);
        let panel = info(2, ChannelKind::Builtin);
        let other = info(3, ChannelKind::Hardware);
        let all = vec![external.clone(), panel.clone(), other];

        assert_eq!(
            AutoController::target_selector(Mode::Linked, &all),
            Some(Selector::AllLinked)
        );
        assert_eq!(
            AutoController::target_selector(Mode::Unlinked, &all),
            Some(Selector::Endpoint(panel.id))
        );
        let no_panel = vec![info(3, ChannelKind::Hardware), external.clone()];
        assert_eq!(
            AutoController::target_selector(Mode::Unlinked, &no_panel),
            Some(Selector::Endpoint(external.id))
        );
        assert_eq!(AutoController::target_selector(Mode::Linked, &[]), None);
    }
}
