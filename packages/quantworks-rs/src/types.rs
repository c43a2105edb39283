use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Clamps `low` down and `high` up so that `low <= min(open, close)` and
/// `max(open, close) <= high`. The range is never widened past open/close.
pub fn sanitize_ohlc(open: f64, high: f64, low: f64, close: f64) -> (f64, f64, f64, f64) {
    let mut high = high;
    let mut low = low;
    if low > open {
        low = open;
    }
    if low > close {
        low = close;
    }
    if high < open {
        high = open;
    }
    if high < close {
        high = close;
    }
    (open, high, low, close)
}

/// Bar interval tag. Used for display and consistency checks only, the
/// resampler takes an explicit [`crate::period::Period`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
}

impl Frequency {
    /// Nominal length in seconds. Months count as 31 days.
    pub const fn seconds(&self) -> i64 {
        match self {
            Frequency::Second => 1,
            Frequency::Minute => 60,
            Frequency::Hour => 3_600,
            Frequency::Day => 86_400,
            Frequency::Week => 604_800,
            Frequency::Month => 2_678_400,
        }
    }

    /// Coarsest tag whose nominal length doesn't exceed `secs`.
    pub fn from_seconds_floor(secs: i64) -> Self {
        [
            Frequency::Month,
            Frequency::Week,
            Frequency::Day,
            Frequency::Hour,
            Frequency::Minute,
        ]
        .into_iter()
        .find(|f| f.seconds() <= secs)
        .unwrap_or(Frequency::Second)
    }
}

/// Scalar carried in [`Bar::extra`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExtraValue {
    Float(f64),
    Text(String),
}

impl ExtraValue {
    /// Numeric if the text parses as a float, text otherwise.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().parse::<f64>() {
            Ok(v) => ExtraValue::Float(v),
            Err(_) => ExtraValue::Text(raw.to_string()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ExtraValue::Float(v) => Some(*v),
            ExtraValue::Text(_) => None,
        }
    }
}

/// One OHLCV record. Immutable once built; the OHLC quadruple is sanitized
/// on construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "BarFields")]
pub struct Bar {
    date_time: DateTime<Utc>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    adj_close: Option<f64>,
    frequency: Frequency,
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    extra: IndexMap<String, ExtraValue>,
}

#[derive(Deserialize)]
struct BarFields {
    date_time: DateTime<Utc>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    adj_close: Option<f64>,
    frequency: Frequency,
    #[serde(default)]
    extra: IndexMap<String, ExtraValue>,
}

impl From<BarFields> for Bar {
    fn from(f: BarFields) -> Self {
        Bar::with_extra(
            f.date_time,
            f.open,
            f.high,
            f.low,
            f.close,
            f.volume,
            f.adj_close,
            f.frequency,
            f.extra,
        )
    }
}

impl Bar {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        date_time: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
        adj_close: Option<f64>,
        frequency: Frequency,
    ) -> Self {
        Self::with_extra(
            date_time,
            open,
            high,
            low,
            close,
            volume,
            adj_close,
            frequency,
            IndexMap::new(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_extra(
        date_time: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
        adj_close: Option<f64>,
        frequency: Frequency,
        extra: IndexMap<String, ExtraValue>,
    ) -> Self {
        let (open, high, low, close) = sanitize_ohlc(open, high, low, close);
        Self {
            date_time,
            open,
            high,
            low,
            close,
            volume,
            adj_close,
            frequency,
            extra,
        }
    }

    pub fn date_time(&self) -> DateTime<Utc> {
        self.date_time
    }

    pub fn open(&self) -> f64 {
        self.open
    }

    pub fn high(&self) -> f64 {
        self.high
    }

    pub fn low(&self) -> f64 {
        self.low
    }

    pub fn close(&self) -> f64 {
        self.close
    }

    pub fn volume(&self) -> f64 {
        self.volume
    }

    pub fn adj_close(&self) -> Option<f64> {
        self.adj_close
    }

    pub fn frequency(&self) -> Frequency {
        self.frequency
    }

    pub fn extra(&self) -> &IndexMap<String, ExtraValue> {
        &self.extra
    }

    fn adjusted(&self, v: f64) -> Result<f64> {
        let adj = self.adj_close.ok_or(Error::NoAdjClose)?;
        Ok(adj * v / self.close)
    }

    pub fn adjusted_open(&self) -> Result<f64> {
        self.adjusted(self.open)
    }

    pub fn adjusted_high(&self) -> Result<f64> {
        self.adjusted(self.high)
    }

    pub fn adjusted_low(&self) -> Result<f64> {
        self.adjusted(self.low)
    }

    pub fn adjusted_close(&self) -> Result<f64> {
        self.adj_close.ok_or(Error::NoAdjClose)
    }

    /// Close, or adjusted close when `use_adjusted` is set.
    pub fn price(&self, use_adjusted: bool) -> Result<f64> {
        if use_adjusted {
            self.adjusted_close()
        } else {
            Ok(self.close)
        }
    }

    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }
}

/// Values of several keys sharing one datetime.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedValues<V> {
    date_time: DateTime<Utc>,
    values: IndexMap<String, V>,
}

impl<V> FeedValues<V> {
    pub fn new(date_time: DateTime<Utc>, values: IndexMap<String, V>) -> Self {
        Self { date_time, values }
    }

    pub fn date_time(&self) -> DateTime<Utc> {
        self.date_time
    }

    pub fn values(&self) -> &IndexMap<String, V> {
        &self.values
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.values.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_values(self) -> IndexMap<String, V> {
        self.values
    }
}

/// Bars for a set of instruments at the same datetime.
pub type Bars = FeedValues<Bar>;

impl FeedValues<Bar> {
    /// Groups bars keyed by instrument. All bars must share one datetime.
    pub fn from_bars(bars: IndexMap<String, Bar>) -> Result<Option<Self>> {
        let Some(first) = bars.values().next().map(Bar::date_time) else {
            return Ok(None);
        };
        if let Some(other) = bars.values().map(Bar::date_time).find(|dt| *dt != first) {
            return Err(Error::BarsNotInSync { first, other });
        }
        Ok(Some(Self::new(first, bars)))
    }

    pub fn instruments(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2011, 1, 3, h, m, 0).unwrap()
    }

    #[test]
    fn sanitize_clamps_to_open_close() {
        assert_eq!(sanitize_ohlc(10.0, 9.0, 11.0, 10.0), (10.0, 10.0, 10.0, 10.0));
        assert_eq!(sanitize_ohlc(10.0, 12.0, 9.0, 11.0), (10.0, 12.0, 9.0, 11.0));
        assert_eq!(sanitize_ohlc(10.0, 10.5, 10.5, 12.0), (10.0, 12.0, 10.0, 12.0));
    }

    #[test]
    fn bar_is_sanitized_on_construction() {
        let b = Bar::new(ts(9, 30), 10.0, 9.0, 11.0, 10.0, 100.0, None, Frequency::Minute);
        assert_eq!(b.high(), 10.0);
        assert_eq!(b.low(), 10.0);
        assert_eq!(b.open(), 10.0);
        assert_eq!(b.close(), 10.0);
    }

    #[test]
    fn adjusted_values_scale_by_adj_close() {
        let b = Bar::new(ts(0, 0), 10.0, 12.0, 8.0, 10.0, 1.0, Some(5.0), Frequency::Day);
        assert_eq!(b.adjusted_open().unwrap(), 5.0);
        assert_eq!(b.adjusted_high().unwrap(), 6.0);
        assert_eq!(b.adjusted_low().unwrap(), 4.0);
        assert_eq!(b.price(true).unwrap(), 5.0);
        assert_eq!(b.price(false).unwrap(), 10.0);
        assert_eq!(b.typical_price(), 10.0);

        let no_adj = Bar::new(ts(0, 0), 10.0, 12.0, 8.0, 10.0, 1.0, None, Frequency::Day);
        assert!(matches!(no_adj.adjusted_open(), Err(Error::NoAdjClose)));
    }

    #[test]
    fn deserialized_bar_is_sanitized() {
        let raw = r#"{"date_time":"2011-01-03T09:30:00Z","open":10.0,"high":9.0,"low":11.0,
            "close":10.0,"volume":1.0,"adj_close":null,"frequency":"minute"}"#;
        let b: Bar = serde_json::from_str(raw).unwrap();
        assert_eq!(b.high(), 10.0);
        assert_eq!(b.low(), 10.0);
        assert!(b.extra().is_empty());
    }

    #[test]
    fn bars_must_share_datetime() {
        let mut m = IndexMap::new();
        m.insert("a".to_string(), Bar::new(ts(9, 30), 1.0, 1.0, 1.0, 1.0, 1.0, None, Frequency::Minute));
        m.insert("b".to_string(), Bar::new(ts(9, 31), 1.0, 1.0, 1.0, 1.0, 1.0, None, Frequency::Minute));
        assert!(matches!(Bars::from_bars(m), Err(Error::BarsNotInSync { .. })));
        assert!(Bars::from_bars(IndexMap::new()).unwrap().is_none());
    }

    #[test]
    fn frequency_floor() {
        assert_eq!(Frequency::from_seconds_floor(300), Frequency::Minute);
        assert_eq!(Frequency::from_seconds_floor(4 * 3_600), Frequency::Hour);
        assert_eq!(Frequency::from_seconds_floor(86_400), Frequency::Day);
        assert_eq!(Frequency::from_seconds_floor(30), Frequency::Second);
    }

    #[test]
    fn extra_value_parse() {
        assert_eq!(ExtraValue::parse("1.5"), ExtraValue::Float(1.5));
        assert_eq!(ExtraValue::parse("abc"), ExtraValue::Text("abc".into()));
    }
}
