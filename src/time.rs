//! Time instants and durations.
//!
//! An instant is kept as an integer Modified Julian Day plus seconds into
//! that day, in the scale it was written in. Differences between scales
//! with a fixed relation to TAI (UTC via the leap second table, TT, GPS)
//! are taken in TAI; any other pair of scales must match.

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use crate::{Error, Quantity, Result, Unit};

const SECONDS_PER_DAY: f64 = 86400.0;
const DAYS_PER_YEAR: f64 = 365.25;
const MJD_UNIX_EPOCH: i64 = 40587;
const JD_MJD_OFFSET: f64 = 2_400_000.5;

/// TAI - UTC in seconds, from the MJD at which each value took effect.
const LEAP_SECONDS: &[(i64, f64)] = &[
    (41317, 10.0),
    (41499, 11.0),
    (41683, 12.0),
    (42048, 13.0),
    (42413, 14.0),
    (42778, 15.0),
    (43144, 16.0),
    (43509, 17.0),
    (43874, 18.0),
    (44239, 19.0),
    (44786, 20.0),
    (45151, 21.0),
    (45516, 22.0),
    (46247, 23.0),
    (47161, 24.0),
    (47892, 25.0),
    (48257, 26.0),
    (48804, 27.0),
    (49169, 28.0),
    (49534, 29.0),
    (50083, 30.0),
    (50630, 31.0),
    (51179, 32.0),
    (53736, 33.0),
    (54832, 34.0),
    (56109, 35.0),
    (57204, 36.0),
    (57754, 37.0),
];

/// Time reference scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TimeScale {
    #[default]
    Utc,
    Tai,
    Tt,
    Tdb,
    Tcg,
    Tcb,
    Ut1,
    Gps,
    Local,
}

impl TimeScale {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Utc => "utc",
            Self::Tai => "tai",
            Self::Tt => "tt",
            Self::Tdb => "tdb",
            Self::Tcg => "tcg",
            Self::Tcb => "tcb",
            Self::Ut1 => "ut1",
            Self::Gps => "gps",
            Self::Local => "local",
        }
    }
}

impl fmt::Display for TimeScale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Representation the instant was written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TimeFormat {
    #[default]
    Isot,
    Iso,
    Mjd,
    Jd,
    Unix,
}

impl TimeFormat {
    fn as_str(self) -> &'static str {
        match self {
            Self::Isot => "isot",
            Self::Iso => "iso",
            Self::Mjd => "mjd",
            Self::Jd => "jd",
            Self::Unix => "unix",
        }
    }
}

/// Unit for expressing a [TimeDelta].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
    /// Julian years of 365.25 days.
    Years,
}

impl TimeUnit {
    fn seconds(self) -> f64 {
        match self {
            Self::Seconds => 1.0,
            Self::Minutes => 60.0,
            Self::Hours => 3600.0,
            Self::Days => SECONDS_PER_DAY,
            Self::Years => SECONDS_PER_DAY * DAYS_PER_YEAR,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            Self::Seconds => "s",
            Self::Minutes => "min",
            Self::Hours => "h",
            Self::Days => "d",
            Self::Years => "yr",
        }
    }
}

/// Elapsed time between two instants.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct TimeDelta {
    seconds: f64,
}

impl TimeDelta {
    pub fn from_seconds(seconds: f64) -> Self {
        Self { seconds }
    }

    pub fn to(self, unit: TimeUnit) -> f64 {
        self.seconds / unit.seconds()
    }

    pub fn to_quantity(self, unit: TimeUnit) -> Result<Quantity> {
        Ok(Quantity::scalar(self.to(unit), Unit::parse(unit.symbol())?))
    }
}

/// An instant in a named time scale.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeValue {
    mjd: i64,
    seconds: f64,
    scale: TimeScale,
    format: TimeFormat,
}

impl TimeValue {
    /// Instant from a Modified Julian Date.
    pub fn from_mjd(mjd: f64, scale: TimeScale) -> Self {
        let day = mjd.floor();
        Self {
            mjd: day as i64,
            seconds: (mjd - day) * SECONDS_PER_DAY,
            scale,
            format: TimeFormat::Mjd,
        }
    }

    /// Instant from an ISO 8601 string such as `2027-01-01T00:00:00.000`.
    pub fn from_iso(s: &str, scale: TimeScale) -> Result<Self> {
        let s = s.trim();
        let (dt, format) = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
            .iter()
            .zip([TimeFormat::Isot, TimeFormat::Iso])
            .find_map(|(f, fmt)| NaiveDateTime::parse_from_str(s, f).ok().map(|dt| (dt, fmt)))
            .or_else(|| {
                NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|dt| (dt, TimeFormat::Iso))
            })
            .ok_or_else(|| Error::format(format!("invalid ISO time {s:?}")))?;
        let time = dt.time();
        Ok(Self {
            mjd: (dt.date() - mjd_epoch()).num_days(),
            seconds: time.num_seconds_from_midnight() as f64 + time.nanosecond() as f64 * 1e-9,
            scale,
            format,
        })
    }

    pub fn scale(&self) -> TimeScale {
        self.scale
    }

    pub fn format(&self) -> TimeFormat {
        self.format
    }

    pub fn mjd(&self) -> f64 {
        self.mjd as f64 + self.seconds / SECONDS_PER_DAY
    }

    pub fn jd(&self) -> f64 {
        self.mjd() + JD_MJD_OFFSET
    }

    /// ISO 8601 rendering with millisecond precision.
    ///
    /// Instants outside the calendar range are rendered as `MJD <days>`.
    pub fn to_isot(&self) -> String {
        match self.to_datetime() {
            Some(dt) => dt.format("%Y-%m-%dT%H:%M:%S%.3f").to_string(),
            None => format!("MJD {}", self.mjd()),
        }
    }

    fn to_datetime(&self) -> Option<NaiveDateTime> {
        let millis = (self.seconds * 1e3).round() as i64;
        mjd_epoch()
            .and_time(chrono::NaiveTime::MIN)
            .checked_add_signed(chrono::TimeDelta::try_days(self.mjd)?)?
            .checked_add_signed(chrono::TimeDelta::try_milliseconds(millis)?)
    }

    /// Seconds to add to get TAI, for scales with a fixed relation to TAI.
    fn tai_offset(&self) -> Option<f64> {
        match self.scale {
            TimeScale::Tai => Some(0.0),
            TimeScale::Tt => Some(-32.184),
            TimeScale::Gps => Some(19.0),
            TimeScale::Utc => LEAP_SECONDS
                .iter()
                .rev()
                .find(|(start, _)| *start <= self.mjd)
                .map(|(_, dt)| *dt),
            _ => None,
        }
    }

    /// `self - earlier`.
    pub fn try_sub(&self, earlier: &TimeValue) -> Result<TimeDelta> {
        let raw = (self.mjd - earlier.mjd) as f64 * SECONDS_PER_DAY + (self.seconds - earlier.seconds);
        let seconds = match (self.tai_offset(), earlier.tai_offset()) {
            (Some(a), Some(b)) => raw + a - b,
            _ if self.scale == earlier.scale => raw,
            _ => {
                return Err(Error::IncompatibleScales {
                    left: self.scale.to_string(),
                    right: earlier.scale.to_string(),
                });
            }
        };
        Ok(TimeDelta::from_seconds(seconds))
    }

    /// Parse a `time/time` node: either an ISO string or a mapping
    /// with `value`, `format` and `scale`.
    pub(crate) fn from_yaml(value: &Value) -> Result<Self> {
        match value {
            Value::String(s) => Self::from_iso(s, TimeScale::Utc),
            Value::Mapping(map) => {
                let scale = match map.get("scale") {
                    Some(v) => serde_yaml::from_value(v.clone())?,
                    None => TimeScale::default(),
                };
                let inner = map
                    .get("value")
                    .ok_or_else(|| Error::format("time without value"))?;
                let format = match map.get("format") {
                    Some(Value::String(f)) if matches!(f.as_str(), "byear" | "jyear" | "decimalyear" | "cxcsec" | "gps") => {
                        return Err(Error::Unsupported(format!("time format {f}")));
                    }
                    Some(v) => Some(serde_yaml::from_value::<TimeFormat>(v.clone())?),
                    None => None,
                };
                let mut out = match (inner, format) {
                    (Value::String(s), _) => Self::from_iso(s, scale)?,
                    (Value::Number(n), f) => {
                        let n = n
                            .as_f64()
                            .ok_or_else(|| Error::format("time value is not a number"))?;
                        match f.unwrap_or(TimeFormat::Mjd) {
                            TimeFormat::Mjd => Self::from_mjd(n, scale),
                            TimeFormat::Jd => Self::from_mjd(n - JD_MJD_OFFSET, scale),
                            TimeFormat::Unix => Self::from_mjd(
                                MJD_UNIX_EPOCH as f64 + n / SECONDS_PER_DAY,
                                scale,
                            ),
                            iso => {
                                return Err(Error::format(format!(
                                    "numeric time value with format {}",
                                    iso.as_str()
                                )));
                            }
                        }
                    }
                    (other, _) => {
                        return Err(Error::Unsupported(format!("time value {other:?}")));
                    }
                };
                if let Some(f) = format {
                    out.format = f;
                }
                Ok(out)
            }
            other => Err(Error::format(format!("invalid time {other:?}"))),
        }
    }

    pub(crate) fn to_yaml(&self) -> Value {
        let value: Value = match self.format {
            TimeFormat::Isot => self.to_isot().into(),
            TimeFormat::Iso => self.to_isot().replacen('T', " ", 1).into(),
            TimeFormat::Mjd => self.mjd().into(),
            TimeFormat::Jd => self.jd().into(),
            TimeFormat::Unix => ((self.mjd() - MJD_UNIX_EPOCH as f64) * SECONDS_PER_DAY).into(),
        };
        if self.scale == TimeScale::Utc && self.format == TimeFormat::Isot {
            return value;
        }
        let mut map = Mapping::new();
        map.insert("value".into(), value);
        map.insert("format".into(), self.format.as_str().into());
        map.insert("scale".into(), self.scale.as_str().into());
        Value::Mapping(map)
    }
}

impl PartialOrd for TimeValue {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.try_sub(other).ok()?.seconds.partial_cmp(&0.0)
    }
}

impl fmt::Display for TimeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.to_isot(), self.scale)
    }
}

fn mjd_epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1858, 11, 17).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-6 * a.abs().max(1.0)
    }

    #[test]
    fn iso_and_mjd_agree() {
        let t = TimeValue::from_iso("2000-01-01T12:00:00.000", TimeScale::Tt).unwrap();
        assert!(close(t.mjd(), 51544.5));
        assert!(close(t.jd(), 2451545.0));
        assert_eq!(t.to_isot(), "2000-01-01T12:00:00.000");
        let d = TimeValue::from_iso("2020-02-29", TimeScale::Utc).unwrap();
        assert_eq!(d.format(), TimeFormat::Iso);
        assert!(close(d.mjd(), 58908.0));
    }

    #[test]
    fn far_instants_render_as_mjd() {
        let far = TimeValue::from_mjd(1.0e9, TimeScale::Tai);
        assert_eq!(far.to_isot(), "MJD 1000000000");
        assert_eq!(far.to_string(), "MJD 1000000000 (tai)");
        let node = crate::Node::time(TimeValue::from_mjd(-1.0e15, TimeScale::Utc));
        assert!(node.info().contains("MJD -1000000000000000"));
    }

    #[test]
    fn durations_convert_with_fixed_factors() {
        let t1 = TimeValue::from_iso("2027-03-01T00:00:00", TimeScale::Utc).unwrap();
        let t2 = TimeValue::from_iso("2027-03-11T06:00:00.5", TimeScale::Utc).unwrap();
        assert!(t1 < t2);
        let dt = t2.try_sub(&t1).unwrap();
        assert!(close(dt.to(TimeUnit::Seconds), dt.to(TimeUnit::Days) * 86400.0));
        assert!(close(dt.to(TimeUnit::Days), 10.25 + 0.5 / 86400.0));
        assert!(close(dt.to(TimeUnit::Years) * 365.25, dt.to(TimeUnit::Days)));
        let q = dt.to_quantity(TimeUnit::Hours).unwrap();
        assert_eq!(q.unit, Unit::parse("h").unwrap());
    }

    #[test]
    fn utc_differences_count_leap_seconds() {
        let before = TimeValue::from_iso("2016-12-31T23:59:59", TimeScale::Utc).unwrap();
        let after = TimeValue::from_iso("2017-01-01T00:00:00", TimeScale::Utc).unwrap();
        assert!(close(after.try_sub(&before).unwrap().to(TimeUnit::Seconds), 2.0));
    }

    #[test]
    fn mixes_scales_through_tai() {
        let tt = TimeValue::from_iso("2020-01-01T00:01:09.184", TimeScale::Tt).unwrap();
        let utc = TimeValue::from_iso("2020-01-01T00:00:00", TimeScale::Utc).unwrap();
        assert!(close(tt.try_sub(&utc).unwrap().to(TimeUnit::Seconds), 0.0));

        let tdb = TimeValue::from_mjd(60000.0, TimeScale::Tdb);
        let err = tdb.try_sub(&utc).unwrap_err();
        assert!(matches!(err, Error::IncompatibleScales { .. }));
        assert!(tdb.partial_cmp(&utc).is_none());
    }

    #[test]
    fn parses_yaml_forms() {
        let v: Value = serde_yaml::from_str("{value: 60000.5, format: mjd, scale: tai}").unwrap();
        let t = TimeValue::from_yaml(&v).unwrap();
        assert_eq!(t.scale(), TimeScale::Tai);
        assert!(close(t.mjd(), 60000.5));
        assert_eq!(TimeValue::from_yaml(&t.to_yaml()).unwrap(), t);

        let v: Value = "2027-01-01T00:00:00.000".into();
        let t = TimeValue::from_yaml(&v).unwrap();
        assert_eq!(t.to_yaml(), v);

        let v: Value = serde_yaml::from_str("{value: 0, format: unix}").unwrap();
        assert!(close(TimeValue::from_yaml(&v).unwrap().mjd(), 40587.0));

        let v: Value = serde_yaml::from_str("{value: 2020.5, format: jyear}").unwrap();
        assert!(matches!(TimeValue::from_yaml(&v), Err(Error::Unsupported(_))));
    }
}
