#![warn(clippy::match_same_arms)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![warn(clippy::unnecessary_wraps)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Control the brightness and picture parameters of every attached display,
//! by hand, from an ambient light sensor, or on a sunrise/sunset schedule.
//!
//! ```no_run
//! # async fn example() -> dimmer::Result<()> {
//! use dimmer::{DimmerBuilder, ParameterTarget, Selector};
//!
//! let dimmer = DimmerBuilder::new().build().await?;
//! dimmer
//!     .manual_apply(ParameterTarget::brightness(Selector::AllLinked, 40))
//!     .await?;
//! dimmer.shutdown().await;
//! # Ok(())
//! # }
//! ```

#[macro_use]
mod util;
mod actuation;
mod auto;
mod clock;
mod config;
mod consts;
pub mod endpoint;
mod errors;
mod runtime;
mod schedule;
mod sensor;
mod solar;
#[cfg(feature = "watch")]
mod watcher;

use std::sync::{Arc, Mutex as StdMutex, PoisonError};
#[cfg(feature = "watch")]
use std::time::Duration;

use regex::Regex;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

pub use crate::actuation::{
    ApplyReport, Coordinator, Mode, Origin, ParameterTarget, Selector, Sequence, limit_step,
};
pub use crate::auto::{AmbientSample, AutoController, AutoState, CurveKind, LuxCurve};
pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::config::{
    ActuationConfig, AutoConfig, DimmerConfig, EndpointConfig, IoConfig, ScheduleConfig,
};
pub use crate::endpoint::{
    Capabilities, Capability, ChannelKind, ChannelSource, EndpointId, EndpointInfo,
    EndpointRegistry, Parameter,
};
pub use crate::errors::{DimmerError, Result};
pub use crate::schedule::{
    Anchor, DayState, DisplayTarget, ResolvedEntry, ResolvedSchedule, ScheduleEngine,
    ScheduleRule, default_rules, resolve,
};
pub use crate::sensor::{IioLightSensor, LightSensor};
pub use crate::solar::{Location, LocationProvider, SunTimes, compute as sun_times};

use crate::endpoint::SystemSource;
use crate::runtime::{Shared, periodic};

make_log_macro!(debug, "dimmer");
make_log_macro!(info, "dimmer");

/// Used to construct [`Dimmer`]
pub struct DimmerBuilder {
    device_regex: String,
    config: Option<DimmerConfig>,
    source: Option<Box<dyn ChannelSource>>,
    clock: Option<Arc<dyn Clock>>,
    #[cfg(feature = "watch")]
    poll_interval: Duration,
}

impl Default for DimmerBuilder {
    fn default() -> Self {
        Self {
            device_regex: ".".into(),
            config: None,
            source: None,
            clock: None,
            #[cfg(feature = "watch")]
            poll_interval: Duration::from_secs(2),
        }
    }
}

impl DimmerBuilder {
    /// Create a new [`DimmerBuilder`].
    pub fn new() -> Self {
        DimmerBuilder::default()
    }

    /// Defaults to `"."` (matches all devices). Ignored with a custom source.
    pub fn with_device_regex(mut self, device_regex: &str) -> Self {
        self.device_regex = device_regex.into();
        self
    }

    /// Defaults to [`DimmerConfig::load()`].
    pub fn with_config(mut self, config: DimmerConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Defaults to the backlight and DDC/CI devices of this machine.
    pub fn with_source(mut self, source: impl ChannelSource + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Defaults to [`SystemClock`].
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    #[cfg(feature = "watch")]
    #[cfg_attr(docsrs, doc(cfg(feature = "watch")))]
    /// How often to look for displays coming and going. Default poll_interval
    /// is 2 seconds.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Discover the displays and start the background loops. Must be called
    /// within a tokio runtime.
    pub async fn build(self) -> Result<Dimmer> {
        let config = match self.config {
            Some(config) => config,
            None => DimmerConfig::load().await?,
        };
        #[cfg(feature = "watch")]
        let hotplug = self.source.is_none();
        let source: Box<dyn ChannelSource> = match self.source {
            Some(source) => source,
            None => Box::new(SystemSource::new(
                Regex::new(&self.device_regex)?,
                config.clone(),
            )),
        };
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let dimmer = Dimmer::new(config, source, clock).await?;

        #[cfg(feature = "watch")]
        {
            if hotplug {
                let events = watcher::hotplug_watcher(self.poll_interval, dimmer.config.ddc)?;
                let task = tokio::spawn(runtime::hotplug(
                    dimmer.shared.clone(),
                    events,
                    dimmer.shutdown.subscribe(),
                ));
                dimmer.track(task);
            }
        }

        Ok(dimmer)
    }
}

/// The display controller.
///
/// Owns the endpoints and three background loops: auto brightness, the
/// schedule, and the step pump that walks rate-limited changes to their
/// target. Dropping it stops the loops; [`shutdown`](Self::shutdown) also
/// waits for them.
pub struct Dimmer {
    shared: Arc<Shared>,
    config: DimmerConfig,
    auto_enabled: watch::Sender<bool>,
    schedule_enabled: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Dimmer {
    async fn new(
        config: DimmerConfig,
        source: Box<dyn ChannelSource>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let registry = Arc::new(EndpointRegistry::new(source, config.io.clone()));
        let live = registry.discover().await?;
        info!("{} displays found", live.len());

        let location = config.schedule.location()?;
        let mut schedule = ScheduleEngine::new(&config.schedule, location);
        schedule.set_local_zone(clock.follows_local_zone());
        let shared = Arc::new(Shared {
            coordinator: Coordinator::new(registry, config.mode, &config.actuation),
            auto: Mutex::new(AutoController::new(config.auto.clone())),
            schedule: Mutex::new(schedule),
            clock,
        });

        let (auto_enabled, _) = watch::channel(config.auto.enabled);
        let (schedule_enabled, _) = watch::channel(config.schedule.enabled);
        let (shutdown, _) = watch::channel(false);

        let dimmer = Self {
            shared,
            config,
            auto_enabled,
            schedule_enabled,
            shutdown,
            tasks: StdMutex::new(Vec::new()),
        };
        dimmer.spawn_loops();
        Ok(dimmer)
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }

    fn spawn_loops(&self) {
        let shared = self.shared.clone();
        self.track(tokio::spawn(periodic(
            "auto",
            self.config.auto.tick(),
            Some(self.auto_enabled.subscribe()),
            self.shutdown.subscribe(),
            move || {
                let shared = shared.clone();
                async move {
                    shared.auto_tick().await;
                }
            },
        )));

        let shared = self.shared.clone();
        self.track(tokio::spawn(periodic(
            "schedule",
            self.config.schedule.tick(),
            Some(self.schedule_enabled.subscribe()),
            self.shutdown.subscribe(),
            move || {
                let shared = shared.clone();
                async move {
                    shared.schedule_tick(false).await;
                }
            },
        )));

        let shared = self.shared.clone();
        self.track(tokio::spawn(periodic(
            "step pump",
            self.config.actuation.step_interval(),
            None,
            self.shutdown.subscribe(),
            move || {
                let shared = shared.clone();
                async move {
                    shared.pump().await;
                }
            },
        )));
    }

    /// Enumerate the displays again. Returns the live ones in ordinal order.
    pub async fn discover_endpoints(&self) -> Result<Vec<EndpointInfo>> {
        self.shared.coordinator.registry().discover().await
    }

    pub async fn live_endpoints(&self) -> Vec<EndpointInfo> {
        self.shared.coordinator.registry().live_endpoints().await
    }

    /// Every endpoint seen since start, including disconnected ones.
    pub async fn endpoints(&self) -> Vec<EndpointInfo> {
        self.shared.coordinator.registry().endpoints().await
    }

    pub async fn capabilities(&self, id: EndpointId) -> Result<Capabilities> {
        self.shared.coordinator.registry().capabilities(id).await
    }

    pub async fn get(&self, id: EndpointId, parameter: Parameter) -> Result<u32> {
        self.shared.coordinator.registry().get(id, parameter).await
    }

    pub fn set_mode(&self, mode: Mode) {
        self.shared.coordinator.set_mode(mode);
    }

    pub fn mode(&self) -> Mode {
        self.shared.coordinator.mode()
    }

    /// Apply a user command right away, without rate limiting. It wins over
    /// any automatic command issued before it.
    pub async fn manual_apply(&self, target: ParameterTarget) -> Result<ApplyReport> {
        self.shared.coordinator.apply(target, Origin::Manual).await
    }

    pub async fn set_auto_brightness_enabled(&self, enabled: bool) {
        self.shared.auto.lock().await.set_enabled(enabled);
        self.auto_enabled.send_replace(enabled);
        if !enabled {
            self.shared.coordinator.cancel_pending(Origin::Auto).await;
            self.shared.schedule.lock().await.forget_targets();
        }
        debug!("auto brightness {}", if enabled { "on" } else { "off" });
    }

    pub async fn auto_state(&self) -> AutoState {
        let live = self.live_endpoints().await.len();
        self.shared.auto.lock().await.state(live)
    }

    pub async fn submit_ambient_sample(&self, sample: AmbientSample) {
        self.shared.auto.lock().await.submit(sample);
    }

    /// Poll `sensor` every `auto.sensor_poll_ms` while auto brightness is on.
    pub fn attach_sensor(&self, sensor: impl LightSensor + 'static) {
        let shared = self.shared.clone();
        let sensor = Arc::new(sensor);
        debug!("attaching sensor {}", sensor.name());
        self.track(tokio::spawn(periodic(
            "sensor",
            self.config.auto.sensor_poll(),
            Some(self.auto_enabled.subscribe()),
            self.shutdown.subscribe(),
            move || {
                let shared = shared.clone();
                let sensor = sensor.clone();
                async move {
                    shared.poll_sensor(sensor.as_ref()).await;
                }
            },
        )));
    }

    /// Replace the schedule. `location` is needed for sunrise and sunset rules.
    pub async fn set_schedule(
        &self,
        rules: Vec<ScheduleRule>,
        location: Option<Location>,
        gradual: bool,
    ) {
        self.shared
            .schedule
            .lock()
            .await
            .set_schedule(rules, location, gradual);
    }

    pub async fn set_schedule_enabled(&self, enabled: bool) {
        self.shared.schedule.lock().await.set_enabled(enabled);
        self.schedule_enabled.send_replace(enabled);
        debug!("schedule {}", if enabled { "on" } else { "off" });
    }

    /// Evaluate the schedule now and apply it to every display it covers.
    /// Does nothing while the schedule is disabled.
    pub async fn apply_schedule_now(&self) -> ApplyReport {
        self.shared.schedule_tick(true).await
    }

    pub async fn schedule_state(&self) -> DayState {
        let now = self.shared.clock.now();
        self.shared.schedule.lock().await.state(&now)
    }

    pub async fn location(&self) -> Option<Location> {
        self.shared.schedule.lock().await.location()
    }

    /// Ask `provider` where we are. On failure the previous location is kept.
    pub async fn refresh_location(&self, provider: &dyn LocationProvider) -> Result<Location> {
        let location = provider.location()?;
        let location = Location::new(location.latitude, location.longitude)?;
        self.shared
            .schedule
            .lock()
            .await
            .set_location(Some(location));
        Ok(location)
    }

    /// Stop the background loops and wait for them to finish.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                debug!("{e}");
            }
        }
    }
}

impl Drop for Dimmer {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}
