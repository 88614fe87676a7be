//! Declarative brightness schedules.
//!
//! Rules are anchored to sunrise, sunset or a fixed wall-clock time, shifted
//! by an offset in minutes. Once per day (or when the location changes) they
//! are resolved into concrete instants for yesterday, today and tomorrow, so
//! every moment of today has an entry on each side of it.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, FixedOffset, Local, NaiveDate, NaiveTime, TimeZone};
use serde::{Deserialize, Deserializer};

use crate::config::ScheduleConfig;
use crate::endpoint::{EndpointId, EndpointInfo};
use crate::errors::*;
use crate::solar::{self, Location};

make_log_macro!(debug, "schedule");
make_log_macro!(warn, "schedule");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum Anchor {
    Sunrise,
    Sunset,
    Fixed(NaiveTime),
}

impl FromStr for Anchor {
    type Err = DimmerError;

    /// `"sunrise"`, `"sunset"` or a 24-hour `"HH:MM"`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("sunrise") {
            Ok(Anchor::Sunrise)
        } else if s.eq_ignore_ascii_case("sunset") {
            Ok(Anchor::Sunset)
        } else {
            NaiveTime::parse_from_str(s, "%H:%M")
                .map(Anchor::Fixed)
                .map_err(|_| DimmerError::InvalidTime(s.to_string()))
        }
    }
}

impl TryFrom<String> for Anchor {
    type Error = DimmerError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl fmt::Display for Anchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Anchor::Sunrise => f.write_str("sunrise"),
            Anchor::Sunset => f.write_str("sunset"),
            Anchor::Fixed(time) => write!(f, "{}", time.format("%H:%M")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayTarget {
    Display1,
    Display2,
    #[default]
    Both,
}

impl DisplayTarget {
    /// Whether a rule with this target applies to the display at `ordinal`.
    pub fn covers(self, ordinal: usize) -> bool {
        match self {
            DisplayTarget::Display1 => ordinal == 1,
            DisplayTarget::Display2 => ordinal == 2,
            DisplayTarget::Both => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleRule {
    pub anchor: Anchor,
    #[serde(default)]
    pub offset_minutes: i32,
    /// Brightness in percent.
    #[serde(deserialize_with = "deserialize_target_value")]
    pub target_value: u8,
    #[serde(default)]
    pub display: DisplayTarget,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

fn deserialize_target_value<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    let value: u8 = Deserialize::deserialize(deserializer)?;
    if value > 100 {
        return Err(serde::de::Error::invalid_value(
            serde::de::Unexpected::Unsigned(value.into()),
            &"a percentage from 0 to 100",
        ));
    }
    Ok(value)
}

impl ScheduleRule {
    pub fn new(anchor: Anchor, offset_minutes: i32, target_value: u8, display: DisplayTarget) -> Self {
        Self {
            anchor,
            offset_minutes,
            target_value: target_value.min(100),
            display,
            enabled: true,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Dim gradually around sunrise and sunset.
pub fn default_rules() -> Vec<ScheduleRule> {
    [
        (Anchor::Sunrise, -60, 50),
        (Anchor::Sunrise, -30, 75),
        (Anchor::Sunrise, 0, 100),
        (Anchor::Sunset, 0, 100),
        (Anchor::Sunset, 30, 75),
        (Anchor::Sunset, 60, 50),
    ]
    .into_iter()
    .map(|(anchor, offset, value)| ScheduleRule::new(anchor, offset, value, DisplayTarget::Both))
    .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedEntry<Tz: TimeZone> {
    pub at: DateTime<Tz>,
    pub display: DisplayTarget,
    pub value: u8,
    /// Position of the rule in its list. Breaks ties between equal instants.
    pub order: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSchedule<Tz: TimeZone> {
    pub day: NaiveDate,
    pub location: Option<Location>,
    /// Sorted by instant, then declaration order.
    pub entries: Vec<ResolvedEntry<Tz>>,
}

/// Resolve `rules` around `day`. Solar rules that cannot be placed (no
/// location, polar day or night) are left out; fixed-time rules never are.
pub fn resolve<Tz: TimeZone>(
    rules: &[ScheduleRule],
    day: NaiveDate,
    location: Option<Location>,
    tz: &Tz,
) -> ResolvedSchedule<Tz> {
    let mut entries = Vec::new();
    for date in [day.pred_opt(), Some(day), day.succ_opt()].into_iter().flatten() {
        let sun = match location {
            Some(location) => match solar::compute(date, location, tz) {
                Ok(sun) => Some(sun),
                Err(e) => {
                    warn!("{e}, skipping solar rules");
                    None
                }
            },
            None => None,
        };

        for (order, rule) in rules.iter().enumerate().filter(|(_, rule)| rule.enabled) {
            let anchor = match rule.anchor {
                Anchor::Sunrise => sun.as_ref().map(|sun| sun.sunrise.clone()),
                Anchor::Sunset => sun.as_ref().map(|sun| sun.sunset.clone()),
                Anchor::Fixed(time) => tz.from_local_datetime(&date.and_time(time)).earliest(),
            };
            let Some(anchor) = anchor else {
                debug!("{} on {date} cannot be placed", rule.anchor);
                continue;
            };
            entries.push(ResolvedEntry {
                at: anchor + Duration::minutes(rule.offset_minutes.into()),
                display: rule.display,
                value: rule.target_value,
                order,
            });
        }
    }
    entries.sort_by(|a, b| a.at.cmp(&b.at).then(a.order.cmp(&b.order)));

    ResolvedSchedule {
        day,
        location,
        entries,
    }
}

impl<Tz: TimeZone> ResolvedSchedule<Tz> {
    /// The same instants, each in the offset it had in `Tz`.
    pub fn fixed_offset(self) -> ResolvedSchedule<FixedOffset> {
        ResolvedSchedule {
            day: self.day,
            location: self.location,
            entries: self
                .entries
                .into_iter()
                .map(|entry| ResolvedEntry {
                    at: entry.at.fixed_offset(),
                    display: entry.display,
                    value: entry.value,
                    order: entry.order,
                })
                .collect(),
        }
    }

    /// Entries that apply to the display at `ordinal`, with entries at the
    /// same instant collapsed to the one declared last.
    fn entries_for(&self, ordinal: usize) -> Vec<&ResolvedEntry<Tz>> {
        let mut entries: Vec<&ResolvedEntry<Tz>> = Vec::new();
        for entry in self.entries.iter().filter(|e| e.display.covers(ordinal)) {
            match entries.last_mut() {
                Some(last) if last.at == entry.at => *last = entry,
                _ => entries.push(entry),
            }
        }
        entries
    }

    /// Target for the display at `ordinal` at `now`, `None` if no rule
    /// covers it.
    pub fn evaluate(&self, now: &DateTime<Tz>, ordinal: usize, gradual: bool) -> Option<u8> {
        let entries = self.entries_for(ordinal);
        let first = entries.first()?;

        let index = entries.partition_point(|entry| entry.at <= *now);
        if index == 0 {
            return Some(first.value);
        }
        let previous = entries[index - 1];
        let Some(next) = entries.get(index).filter(|_| gradual && previous.at != *now) else {
            return Some(previous.value);
        };

        let span = (next.at.timestamp_millis() - previous.at.timestamp_millis()) as f64;
        let elapsed = (now.timestamp_millis() - previous.at.timestamp_millis()) as f64;
        let ratio = if span > 0.0 {
            (elapsed / span).clamp(0.0, 1.0)
        } else {
            1.0
        };
        let value = f64::from(previous.value) + (f64::from(next.value) - f64::from(previous.value)) * ratio;
        Some(value.round().clamp(0.0, 100.0) as u8)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayState {
    /// Today's schedule has not been built yet.
    Unresolved,
    /// Some of today's entries are still ahead.
    Resolved,
    /// Every entry of today has passed.
    Exhausted,
}

pub struct ScheduleEngine {
    rules: Vec<ScheduleRule>,
    location: Option<Location>,
    gradual: bool,
    enabled: bool,
    /// Resolve in the system time zone instead of the clock's offset.
    local_zone: bool,
    resolved: Option<ResolvedSchedule<FixedOffset>>,
    last_targets: HashMap<EndpointId, u8>,
}

impl ScheduleEngine {
    pub fn new(config: &ScheduleConfig, location: Option<Location>) -> Self {
        Self {
            rules: config.rules.clone(),
            location,
            gradual: config.gradual,
            enabled: config.enabled,
            local_zone: false,
            resolved: None,
            last_targets: HashMap::new(),
        }
    }

    pub fn set_schedule(&mut self, rules: Vec<ScheduleRule>, location: Option<Location>, gradual: bool) {
        self.rules = rules;
        self.location = location;
        self.gradual = gradual;
        self.invalidate();
    }

    pub fn set_location(&mut self, location: Option<Location>) {
        if self.location != location {
            debug!("location changed to {location:?}");
            self.location = location;
            self.invalidate();
        }
    }

    pub fn set_local_zone(&mut self, local_zone: bool) {
        if self.local_zone != local_zone {
            self.local_zone = local_zone;
            self.invalidate();
        }
    }

    pub fn location(&self) -> Option<Location> {
        self.location
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.last_targets.clear();
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn invalidate(&mut self) {
        self.resolved = None;
        self.last_targets.clear();
    }

    fn is_current(&self, now: &DateTime<FixedOffset>) -> bool {
        self.resolved.as_ref().is_some_and(|resolved| {
            resolved.day == now.date_naive()
                && resolved.location == self.location
                && (self.local_zone
                    || resolved
                        .entries
                        .first()
                        .is_none_or(|entry| entry.at.offset() == now.offset()))
        })
    }

    pub fn state(&self, now: &DateTime<FixedOffset>) -> DayState {
        match &self.resolved {
            Some(resolved) if self.is_current(now) => {
                let day = now.date_naive();
                let ahead = resolved
                    .entries
                    .iter()
                    .any(|entry| entry.at.date_naive() == day && entry.at > *now);
                if ahead {
                    DayState::Resolved
                } else {
                    DayState::Exhausted
                }
            }
            _ => DayState::Unresolved,
        }
    }

    /// The schedule for `now`'s day, resolving it first if needed.
    pub fn resolved(&mut self, now: &DateTime<FixedOffset>) -> &ResolvedSchedule<FixedOffset> {
        if !self.is_current(now) {
            let day = now.date_naive();
            let resolved = if self.local_zone {
                resolve(&self.rules, day, self.location, &Local).fixed_offset()
            } else {
                resolve(&self.rules, day, self.location, &now.timezone())
            };
            debug!("resolved {} entries for {day}", resolved.entries.len());
            self.resolved = Some(resolved);
        }
        self.resolved.get_or_insert_with(|| ResolvedSchedule {
            day: now.date_naive(),
            location: None,
            entries: Vec::new(),
        })
    }

    /// Brightness target of every live endpoint covered by a rule.
    pub fn targets(&mut self, now: &DateTime<FixedOffset>, endpoints: &[EndpointInfo]) -> Vec<(EndpointId, u8)> {
        let gradual = self.gradual;
        let resolved = self.resolved(now);
        endpoints
            .iter()
            .filter(|info| info.live)
            .filter_map(|info| {
                resolved
                    .evaluate(now, info.ordinal, gradual)
                    .map(|value| (info.id, value))
            })
            .collect()
    }

    /// Like [`targets`](Self::targets), but only the endpoints whose target
    /// moved since the last call, or all of them when `force` is set.
    pub fn changed_targets(
        &mut self,
        now: &DateTime<FixedOffset>,
        endpoints: &[EndpointInfo],
        force: bool,
    ) -> Vec<(EndpointId, u8)> {
        let targets = self.targets(now, endpoints);
        targets
            .into_iter()
            .filter(|(id, value)| {
                let previous = self.last_targets.insert(*id, *value);
                force || previous != Some(*value)
            })
            .collect()
    }

    /// Make the next evaluation apply `id` again even if its target holds.
    pub fn forget_target(&mut self, id: EndpointId) {
        self.last_targets.remove(&id);
    }

    /// Make the next evaluation apply every display again.
    pub fn forget_targets(&mut self) {
        self.last_targets.clear();
    }
}
