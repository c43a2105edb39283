use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::Frequency;

const DAY_SECS: i64 = 86_400;

/// Resample target.
///
/// Intraday periods are a whole number of seconds that divides a day, so
/// buckets tile each local day exactly. Days, weeks and months follow the
/// calendar instead.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Period {
    Intraday(u32),
    Day,
    Week,
    Month,
}

impl fmt::Debug for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Period({self})")
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Period::Intraday(s) if s % 3_600 == 0 => write!(f, "{}h", s / 3_600),
            Period::Intraday(s) if s % 60 == 0 => write!(f, "{}m", s / 60),
            Period::Intraday(s) => write!(f, "{s}s"),
            Period::Day => f.write_str("1d"),
            Period::Week => f.write_str("1w"),
            Period::Month => f.write_str("1M"),
        }
    }
}

impl Period {
    /// Maps a length in seconds onto a period. Month is recognized by its
    /// nominal length (31 days).
    pub fn from_seconds(secs: i64) -> Result<Self> {
        match secs {
            s if s == DAY_SECS => Ok(Period::Day),
            s if s == Frequency::Week.seconds() => Ok(Period::Week),
            s if s == Frequency::Month.seconds() => Ok(Period::Month),
            s if s > 0 && s < DAY_SECS && DAY_SECS % s == 0 => Ok(Period::Intraday(s as u32)),
            s => Err(Error::UnsupportedPeriod(format!("{s}s"))),
        }
    }

    /// Parses `<n><unit>` with unit `s`, `m`, `h`, `d`, `w` or `M` (month).
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidPeriod("empty period".into()));
        }
        let digits_end = s
            .char_indices()
            .find(|(_, ch)| !ch.is_ascii_digit())
            .map(|(i, _)| i)
            .unwrap_or(s.len());
        if digits_end == 0 {
            return Err(Error::InvalidPeriod(format!("missing number in {s:?}")));
        }
        let n: i64 = s[..digits_end]
            .parse()
            .map_err(|_| Error::InvalidPeriod(format!("invalid number in {s:?}")))?;
        if n <= 0 {
            return Err(Error::InvalidPeriod(format!("period must be > 0, got {s:?}")));
        }
        let unsupported = || Error::UnsupportedPeriod(s.to_string());
        match s[digits_end..].trim() {
            "s" => Self::from_seconds(n),
            "m" => Self::from_seconds(n.checked_mul(60).ok_or_else(unsupported)?),
            "h" => Self::from_seconds(n.checked_mul(3_600).ok_or_else(unsupported)?),
            "d" if n == 1 => Ok(Period::Day),
            "w" if n == 1 => Ok(Period::Week),
            "M" if n == 1 => Ok(Period::Month),
            "d" | "w" | "M" => Err(unsupported()),
            other => Err(Error::InvalidPeriod(format!(
                "unsupported unit {other:?} (use s/m/h/d/w/M)"
            ))),
        }
    }

    /// Nominal length in seconds (months count as 31 days).
    pub fn nominal_seconds(&self) -> i64 {
        match *self {
            Period::Intraday(s) => i64::from(s),
            Period::Day => DAY_SECS,
            Period::Week => Frequency::Week.seconds(),
            Period::Month => Frequency::Month.seconds(),
        }
    }

    /// Frequency tag for bars produced at this period.
    pub fn frequency(&self) -> Frequency {
        Frequency::from_seconds_floor(self.nominal_seconds())
    }
}

impl From<Frequency> for Period {
    fn from(f: Frequency) -> Self {
        match f {
            Frequency::Second => Period::Intraday(1),
            Frequency::Minute => Period::Intraday(60),
            Frequency::Hour => Period::Intraday(3_600),
            Frequency::Day => Period::Day,
            Frequency::Week => Period::Week,
            Frequency::Month => Period::Month,
        }
    }
}

impl FromStr for Period {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Period::parse(s)
    }
}

impl TryFrom<String> for Period {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Period::parse(&s)
    }
}

impl From<Period> for String {
    fn from(p: Period) -> Self {
        p.to_string()
    }
}
