//! Sunrise and sunset times.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use sunrise::{Coordinates, SolarDay, SolarEvent};

use crate::consts::*;
use crate::errors::*;

/// A point on the earth in decimal degrees, north and east positive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self> {
        if !LATITUDE_RANGE.contains(&latitude) || !LONGITUDE_RANGE.contains(&longitude) {
            return Err(DimmerError::InvalidLocation {
                latitude,
                longitude,
            });
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }
}

/// Anything that can tell where we are.
pub trait LocationProvider: Send + Sync {
    /// Fails with [`DimmerError::LocationUnavailable`] when it cannot.
    fn location(&self) -> Result<Location>;
}

impl LocationProvider for Location {
    fn location(&self) -> Result<Location> {
        Ok(*self)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SunTimes<Tz: TimeZone> {
    pub sunrise: DateTime<Tz>,
    pub sunset: DateTime<Tz>,
}

/// Sunrise and sunset of `date` at `location`, expressed in `tz`.
///
/// Fails with [`DimmerError::NoSolarEvent`] during polar day or night.
pub fn compute<Tz: TimeZone>(date: NaiveDate, location: Location, tz: &Tz) -> Result<SunTimes<Tz>> {
    let coordinates = Coordinates::new(location.latitude, location.longitude).ok_or(
        DimmerError::InvalidLocation {
            latitude: location.latitude,
            longitude: location.longitude,
        },
    )?;
    let solar_day = SolarDay::new(coordinates, date);
    let sunrise = solar_day.event_time(SolarEvent::Sunrise);
    let sunset = solar_day.event_time(SolarEvent::Sunset);

    if !crosses_horizon(date, sunrise, sunset) {
        return Err(DimmerError::NoSolarEvent(date));
    }
    Ok(SunTimes {
        sunrise: sunrise.with_timezone(tz),
        sunset: sunset.with_timezone(tz),
    })
}

/// A sun that never crosses the horizon has no hour angle, so the computed
/// events either fall outside the day or span no daylight or a full day.
fn crosses_horizon(date: NaiveDate, sunrise: DateTime<Utc>, sunset: DateTime<Utc>) -> bool {
    let midnight = Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN));
    let window = (midnight - Duration::days(1))..(midnight + Duration::days(2));
    let daylight = sunset - sunrise;
    window.contains(&sunrise)
        && window.contains(&sunset)
        && daylight > Duration::zero()
        && daylight < Duration::hours(24) - Duration::minutes(1)
}

#[cfg(test)]
mod tests {
    use chrono::FixedOffset;
    use proptest::prelude::*;

    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn at<Tz: TimeZone>(tz: &Tz, y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Tz> {
        tz.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[track_caller]
    fn assert_near<Tz: TimeZone>(actual: &DateTime<Tz>, expected: &DateTime<Tz>)
    where
        Tz::Offset: std::fmt::Display,
    {
        let difference = (actual.clone() - expected.clone()).num_seconds().abs();
        assert!(difference <= 300, "{actual} is not close to {expected}");
    }

    #[test]
    fn london_midsummer() {
        let london = Location::new(51.5074, -0.1278).unwrap();
        let times = compute(date(2024, 6, 21), london, &Utc).unwrap();
        assert_near(&times.sunrise, &at(&Utc, 2024, 6, 21, 3, 43));
        assert_near(&times.sunset, &at(&Utc, 2024, 6, 21, 20, 21));
    }

    #[test]
    fn new_york_equinox_in_local_time() {
        let edt = FixedOffset::west_opt(4 * 3600).unwrap();
        let nyc = Location::new(40.7128, -74.006).unwrap();
        let times = compute(date(2024, 3, 20), nyc, &edt).unwrap();
        assert_near(&times.sunrise, &at(&edt, 2024, 3, 20, 6, 58));
        assert_near(&times.sunset, &at(&edt, 2024, 3, 20, 19, 8));
    }

    #[test]
    fn sunset_past_utc_midnight() {
        let edt = FixedOffset::west_opt(4 * 3600).unwrap();
        let location = Location::new(40.0, -74.0).unwrap();
        let times = compute(date(2024, 6, 21), location, &edt).unwrap();
        assert_near(&times.sunrise, &at(&edt, 2024, 6, 21, 5, 27));
        assert_near(&times.sunset, &at(&edt, 2024, 6, 21, 20, 28));
    }

    #[test]
    fn tokyo_winter() {
        let jst = FixedOffset::east_opt(9 * 3600).unwrap();
        let tokyo = Location::new(35.6762, 139.6503).unwrap();
        let times = compute(date(2024, 1, 15), tokyo, &jst).unwrap();
        assert_near(&times.sunrise, &at(&jst, 2024, 1, 15, 6, 50));
        assert_near(&times.sunset, &at(&jst, 2024, 1, 15, 16, 50));
    }

    #[test]
    fn polar_day_and_night_have_no_events() {
        let svalbard = Location::new(78.22, 15.65).unwrap();
        for day in [date(2024, 12, 21), date(2024, 6, 21)] {
            assert!(matches!(
                compute(day, svalbard, &Utc),
                Err(DimmerError::NoSolarEvent(d)) if d == day
            ));
        }
    }

    #[test]
    fn locations_are_validated() {
        assert!(matches!(
            Location::new(91.0, 0.0),
            Err(DimmerError::InvalidLocation { .. })
        ));
        assert!(Location::new(0.0, -180.5).is_err());
        assert!(Location::new(-90.0, 180.0).is_ok());
    }

    proptest! {
        #[test]
        fn sunrise_precedes_sunset(
            latitude in -60.0f64..=60.0,
            longitude in -180.0f64..=180.0,
            ordinal in 1u32..=365,
        ) {
            let day = NaiveDate::from_yo_opt(2024, ordinal).unwrap();
            let location = Location::new(latitude, longitude).unwrap();
            let times = compute(day, location, &Utc).unwrap();
            prop_assert!(times.sunrise < times.sunset);
            prop_assert!(times.sunset - times.sunrise < Duration::hours(24));
        }
    }
}
