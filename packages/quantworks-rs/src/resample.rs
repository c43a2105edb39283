//! Calendar bucketing of series into coarser periods.
//!
//! Buckets are half-open `[beginning, ending)` ranges aligned in the
//! wall-clock time of a timezone. A bucket closes when a value outside it
//! arrives (`append`), when a later time proves it over (`check_now`), or on
//! demand (`push_last`).

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use chrono::{
    DateTime, Datelike, Days, LocalResult, Months, NaiveDate, NaiveDateTime, NaiveTime, Offset,
    TimeDelta, TimeZone, Timelike, Utc,
};
use chrono_tz::Tz;
use indexmap::IndexMap;
use tracing::debug;

use crate::bar_series::{BarDataSeries, SharedBarSeries};
use crate::error::{Error, Result};
use crate::event::{Event, SubscriptionId};
use crate::feed::bar_feed::BarFeed;
use crate::feed::{iter_feed, Feed};
use crate::period::Period;
use crate::series::{Entry, SequenceDataSeries, SeriesSink, SharedSeries};
use crate::types::{Bar, Bars, Frequency};

/// Half-open bucket `[beginning, ending)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Range<T: TimeZone> {
    beginning: DateTime<T>,
    ending: DateTime<T>,
}

impl<T: TimeZone> Range<T> {
    pub fn beginning(&self) -> &DateTime<T> {
        &self.beginning
    }

    pub fn ending(&self) -> &DateTime<T> {
        &self.ending
    }

    pub fn belongs<T2: TimeZone>(&self, t: &DateTime<T2>) -> bool {
        self.beginning <= *t && self.ending > *t
    }
}

/// Reads a wall-clock time in `tz`.
///
/// Ambiguous times take the offset of `prefer` when it is one of the two
/// candidates, else the earlier one. Times inside a gap are read with the
/// offset in effect before the gap.
fn localize<T: TimeZone>(
    tz: &T,
    naive: NaiveDateTime,
    prefer: Option<&DateTime<T>>,
) -> Result<DateTime<T>> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Ok(dt),
        LocalResult::Ambiguous(early, late) => {
            let take_late = prefer.is_some_and(|p| p.offset().fix() == late.offset().fix());
            Ok(if take_late { late } else { early })
        }
        LocalResult::None => {
            let before = tz
                .from_local_datetime(&(naive - TimeDelta::hours(GAP_LOOKBACK_HOURS)))
                .earliest()
                .ok_or(Error::NonexistentLocalTime(naive))?;
            Ok(from_offset(tz, naive, before.offset()))
        }
    }
}

const DAY_SECS: i64 = 86_400;

// Longer than any DST gap.
const GAP_LOOKBACK_HOURS: i64 = 3;

fn from_offset<T: TimeZone>(tz: &T, naive: NaiveDateTime, offset: &T::Offset) -> DateTime<T> {
    let shift = TimeDelta::seconds(i64::from(offset.fix().local_minus_utc()));
    tz.from_utc_datetime(&(naive - shift))
}

/// Bucket containing `t`, computed in `t`'s own timezone.
///
/// - intraday: floor to a multiple of the period since local midnight
/// - day: local midnight to the next one
/// - week: Monday 00:00 to the next Monday
/// - month: first of the month to the first of the next month
pub fn build_range<T: TimeZone>(t: &DateTime<T>, period: Period) -> Result<Range<T>> {
    let tz = t.timezone();
    let local = t.naive_local();
    let midnight = local.date().and_time(NaiveTime::MIN);
    let overflow = || Error::NonexistentLocalTime(local);
    match period {
        Period::Intraday(secs) => {
            let secs = i64::from(secs);
            if secs == 0 || DAY_SECS % secs != 0 {
                return Err(Error::UnsupportedPeriod(period.to_string()));
            }
            let since_midnight = i64::from(local.time().num_seconds_from_midnight());
            let start = midnight + TimeDelta::seconds(since_midnight - since_midnight % secs);
            let mut beginning = localize(&tz, start, Some(t))?;
            if beginning > *t {
                // bucket start fell in a gap that `t` is already past
                beginning = from_offset(&tz, start, t.offset());
            }
            let ending = localize(&tz, start + TimeDelta::seconds(secs), Some(&beginning))?;
            Ok(Range { beginning, ending })
        }
        Period::Day => {
            let next = midnight.checked_add_days(Days::new(1)).ok_or_else(overflow)?;
            Ok(Range {
                beginning: localize(&tz, midnight, None)?,
                ending: localize(&tz, next, None)?,
            })
        }
        Period::Week => {
            let back = u64::from(local.weekday().num_days_from_monday());
            let monday = midnight.checked_sub_days(Days::new(back)).ok_or_else(overflow)?;
            let next = monday.checked_add_days(Days::new(7)).ok_or_else(overflow)?;
            Ok(Range {
                beginning: localize(&tz, monday, None)?,
                ending: localize(&tz, next, None)?,
            })
        }
        Period::Month => {
            let first = NaiveDate::from_ymd_opt(local.year(), local.month(), 1)
                .ok_or_else(overflow)?
                .and_time(NaiveTime::MIN);
            let next = first.checked_add_months(Months::new(1)).ok_or_else(overflow)?;
            Ok(Range {
                beginning: localize(&tz, first, None)?,
                ending: localize(&tz, next, None)?,
            })
        }
    }
}

/// Folds the values of one bucket.
pub trait Grouper {
    type Value;
    type Output;

    fn add_value(&mut self, value: &Self::Value);

    /// Grouped result of the values added since the last take, stamped with
    /// the bucket start. `None` if nothing was added.
    fn take_grouped(&mut self, bucket_start: DateTime<Utc>) -> Option<Self::Output>;
}

#[derive(Debug, Clone, Copy)]
struct BarAcc {
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    adj_close: Option<f64>,
}

/// OHLCV fold: first open, max high, min low, last close, summed volume,
/// last present adjusted close.
#[derive(Debug, Clone)]
pub struct BarGrouper {
    frequency: Frequency,
    acc: Option<BarAcc>,
}

impl BarGrouper {
    /// `frequency` tags the grouped bars.
    pub fn new(frequency: Frequency) -> Self {
        Self {
            frequency,
            acc: None,
        }
    }
}

impl Grouper for BarGrouper {
    type Value = Bar;
    type Output = Bar;

    fn add_value(&mut self, bar: &Bar) {
        match &mut self.acc {
            None => {
                self.acc = Some(BarAcc {
                    open: bar.open(),
                    high: bar.high(),
                    low: bar.low(),
                    close: bar.close(),
                    volume: bar.volume(),
                    adj_close: bar.adj_close(),
                })
            }
            Some(acc) => {
                acc.high = acc.high.max(bar.high());
                acc.low = acc.low.min(bar.low());
                acc.close = bar.close();
                acc.volume += bar.volume();
                if bar.adj_close().is_some() {
                    acc.adj_close = bar.adj_close();
                }
            }
        }
    }

    fn take_grouped(&mut self, bucket_start: DateTime<Utc>) -> Option<Bar> {
        let acc = self.acc.take()?;
        Some(Bar::new(
            bucket_start,
            acc.open,
            acc.high,
            acc.low,
            acc.close,
            acc.volume,
            acc.adj_close,
            self.frequency,
        ))
    }
}

/// Collects raw values and reduces them with an aggregate function.
pub struct ValueGrouper<T, O> {
    values: Vec<T>,
    aggfun: Box<dyn FnMut(&[T]) -> O>,
}

impl<T, O> core::fmt::Debug for ValueGrouper<T, O> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ValueGrouper")
            .field("pending", &self.values.len())
            .finish_non_exhaustive()
    }
}

impl<T, O> ValueGrouper<T, O> {
    pub fn new(aggfun: impl FnMut(&[T]) -> O + 'static) -> Self {
        Self {
            values: Vec::new(),
            aggfun: Box::new(aggfun),
        }
    }
}

impl<T: Clone, O> Grouper for ValueGrouper<T, O> {
    type Value = T;
    type Output = O;

    fn add_value(&mut self, value: &T) {
        self.values.push(value.clone());
    }

    fn take_grouped(&mut self, _bucket_start: DateTime<Utc>) -> Option<O> {
        if self.values.is_empty() {
            return None;
        }
        let out = (self.aggfun)(&self.values);
        self.values.clear();
        Some(out)
    }
}

/// One [`BarGrouper`] per instrument. Instruments that show up mid-bucket
/// get their own grouper from then on.
#[derive(Debug, Clone)]
pub struct BarsGrouper {
    frequency: Frequency,
    groupers: IndexMap<String, BarGrouper>,
}

impl BarsGrouper {
    pub fn new(frequency: Frequency) -> Self {
        Self {
            frequency,
            groupers: IndexMap::new(),
        }
    }
}

impl Grouper for BarsGrouper {
    type Value = Bars;
    type Output = Bars;

    fn add_value(&mut self, bars: &Bars) {
        for (instrument, bar) in bars.values() {
            self.groupers
                .entry(instrument.clone())
                .or_insert_with(|| BarGrouper::new(self.frequency))
                .add_value(bar);
        }
    }

    fn take_grouped(&mut self, bucket_start: DateTime<Utc>) -> Option<Bars> {
        let grouped: IndexMap<String, Bar> = self
            .groupers
            .drain(..)
            .filter_map(|(instrument, mut g)| Some((instrument, g.take_grouped(bucket_start)?)))
            .collect();
        if grouped.is_empty() {
            return None;
        }
        Some(Bars::new(bucket_start, grouped))
    }
}

/// A completed bucket: its start (UTC) and the grouped value.
pub type Completed<O> = (DateTime<Utc>, O);

/// Buckets incoming values by period in a timezone and hands back each
/// bucket once it is closed.
#[derive(Debug)]
pub struct Resampler<G> {
    period: Period,
    tz: Tz,
    grouper: G,
    range: Option<Range<Tz>>,
}

impl<G: Grouper> Resampler<G> {
    pub fn new(period: Period, tz: Tz, grouper: G) -> Self {
        Self {
            period,
            tz,
            grouper,
            range: None,
        }
    }

    pub fn period(&self) -> Period {
        self.period
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// The open bucket, if any.
    pub fn current_range(&self) -> Option<&Range<Tz>> {
        self.range.as_ref()
    }

    pub fn is_idle(&self) -> bool {
        self.range.is_none()
    }

    /// Adds a value. If it falls outside the open bucket, that bucket is
    /// closed and returned, and a new one is opened for the value.
    pub fn append(
        &mut self,
        date_time: DateTime<Utc>,
        value: &G::Value,
    ) -> Result<Option<Completed<G::Output>>> {
        let belongs = self
            .range
            .as_ref()
            .is_some_and(|r| r.belongs(&date_time));
        let mut closed = None;
        if !belongs {
            let next = build_range(&date_time.with_timezone(&self.tz), self.period)?;
            closed = self.flush();
            self.range = Some(next);
        }
        self.grouper.add_value(value);
        Ok(closed)
    }

    /// Closes the open bucket even though no later value arrived.
    pub fn push_last(&mut self) -> Option<Completed<G::Output>> {
        self.flush()
    }

    /// Closes the open bucket if `now` is past it.
    pub fn check_now(&mut self, now: DateTime<Utc>) -> Option<Completed<G::Output>> {
        match &self.range {
            Some(r) if !r.belongs(&now) => self.flush(),
            _ => None,
        }
    }

    fn flush(&mut self) -> Option<Completed<G::Output>> {
        let range = self.range.take()?;
        let start = range.beginning().with_timezone(&Utc);
        debug!(period = %self.period, bucket = %start, "bucket closed");
        let grouped = self.grouper.take_grouped(start)?;
        Some((start, grouped))
    }
}

fn attach<V, G, S>(
    event: &Event<Entry<V>>,
    resampler: &Rc<RefCell<Resampler<G>>>,
    output: &Rc<RefCell<S>>,
) -> SubscriptionId
where
    V: 'static,
    G: Grouper<Value = V> + 'static,
    S: SeriesSink<G::Output> + 'static,
{
    let resampler = Rc::clone(resampler);
    let output = Rc::clone(output);
    event.subscribe(move |(dt, value): &Entry<V>| {
        let dt = (*dt).ok_or(Error::MissingDateTime)?;
        let closed = resampler.borrow_mut().append(dt, value)?;
        if let Some((start, grouped)) = closed {
            output.borrow_mut().push_dated(start, grouped)?;
        }
        Ok(())
    })
}

/// A series fed by resampling another one as values are appended to it.
///
/// The subscription on the source is removed on drop.
pub struct Resampled<G: Grouper, S> {
    resampler: Rc<RefCell<Resampler<G>>>,
    output: Rc<RefCell<S>>,
    detach: Option<Box<dyn FnOnce()>>,
}

pub type ResampledBarSeries = Resampled<BarGrouper, BarDataSeries>;
pub type ResampledSeries<T, O> = Resampled<ValueGrouper<T, O>, SequenceDataSeries<O>>;

impl<G: Grouper, S> core::fmt::Debug for Resampled<G, S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let r = self.resampler.borrow();
        f.debug_struct("Resampled")
            .field("period", &r.period())
            .field("timezone", &r.timezone())
            .finish_non_exhaustive()
    }
}

impl<G: Grouper, S: SeriesSink<G::Output>> Resampled<G, S> {
    pub fn output(&self) -> Rc<RefCell<S>> {
        Rc::clone(&self.output)
    }

    /// Flushes the open bucket into the output.
    pub fn push_last(&self) -> Result<()> {
        let closed = self.resampler.borrow_mut().push_last();
        self.emit(closed)
    }

    /// Flushes the open bucket into the output if `now` is past it.
    pub fn check_now(&self, now: DateTime<Utc>) -> Result<()> {
        let closed = self.resampler.borrow_mut().check_now(now);
        self.emit(closed)
    }

    fn emit(&self, closed: Option<Completed<G::Output>>) -> Result<()> {
        match closed {
            Some((start, grouped)) => self.output.borrow_mut().push_dated(start, grouped),
            None => Ok(()),
        }
    }
}

impl<G: Grouper, S> Drop for Resampled<G, S> {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Resampled<BarGrouper, BarDataSeries> {
    /// Resamples a bar series. `max_len` caps the output series.
    pub fn new(
        source: &SharedBarSeries,
        period: Period,
        tz: Tz,
        max_len: Option<usize>,
    ) -> Result<Self> {
        let resampler = Rc::new(RefCell::new(Resampler::new(
            period,
            tz,
            BarGrouper::new(period.frequency()),
        )));
        let output = BarDataSeries::shared(max_len)?;
        let id = attach(source.borrow().new_value_event(), &resampler, &output);
        let weak: Weak<RefCell<BarDataSeries>> = Rc::downgrade(source);
        Ok(Self {
            resampler,
            output,
            detach: Some(Box::new(move || {
                if let Some(src) = weak.upgrade() {
                    if let Ok(src) = src.try_borrow() {
                        src.new_value_event().unsubscribe(id);
                    }
                }
            })),
        })
    }

    pub fn len(&self) -> usize {
        self.output.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bars(&self) -> Vec<Bar> {
        self.output.borrow().bars().values()
    }
}

impl<T: Clone + 'static, O: 'static> Resampled<ValueGrouper<T, O>, SequenceDataSeries<O>> {
    /// Resamples a value series, reducing each bucket with `aggfun`.
    pub fn new(
        source: &SharedSeries<T>,
        period: Period,
        tz: Tz,
        max_len: Option<usize>,
        aggfun: impl FnMut(&[T]) -> O + 'static,
    ) -> Result<Self> {
        let resampler = Rc::new(RefCell::new(Resampler::new(
            period,
            tz,
            ValueGrouper::new(aggfun),
        )));
        let output = SequenceDataSeries::shared(max_len)?;
        let id = attach(source.borrow().new_value_event(), &resampler, &output);
        let weak = Rc::downgrade(source);
        Ok(Self {
            resampler,
            output,
            detach: Some(Box::new(move || {
                if let Some(src) = weak.upgrade() {
                    if let Ok(src) = src.try_borrow() {
                        src.new_value_event().unsubscribe(id);
                    }
                }
            })),
        })
    }

    pub fn len(&self) -> usize {
        self.output.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Replays a single-instrument bar feed and returns its bars resampled to
/// `period`, including the trailing partial bucket.
///
/// Fails before consuming anything unless exactly one instrument is
/// registered.
pub fn resample_bar_feed<F>(feed: &mut F, period: Period, tz: Tz) -> Result<Vec<Bar>>
where
    F: BarFeed + ?Sized,
{
    let instruments = feed.registered_instruments();
    let [instrument] = instruments.as_slice() else {
        return Err(Error::MultipleInstruments(instruments.len()));
    };
    let source = feed
        .data_series(instrument)
        .ok_or_else(|| Error::custom(format!("no series for {instrument}")))?;
    let resampled = ResampledBarSeries::new(&source, period, tz, None)?;
    debug!(%instrument, %period, "resampling bar feed");
    for values in iter_feed(feed)? {
        values?;
    }
    resampled.push_last()?;
    Ok(resampled.bars())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn check_range<T: TimeZone>(begin: DateTime<T>, end: DateTime<T>, offset: Duration, period: Period) {
        let r = build_range(&(begin.clone() + offset), period).unwrap();
        assert_eq!(r.beginning(), &begin);
        assert_eq!(r.ending(), &end);
        assert!(r.belongs(&begin));
        assert!(r.belongs(&(end.clone() - Duration::seconds(1))));
        assert!(!r.belongs(&end));
        assert!(!r.belongs(&(begin - Duration::seconds(1))));
    }

    #[test]
    fn intraday_ranges() {
        check_range(
            utc(2011, 1, 1, 1, 1, 0),
            utc(2011, 1, 1, 1, 2, 0),
            Duration::seconds(5),
            Period::Intraday(60),
        );
        check_range(
            utc(2011, 1, 1, 1, 0, 0),
            utc(2011, 1, 1, 1, 5, 0),
            Duration::seconds(120),
            Period::Intraday(300),
        );
        check_range(
            utc(2011, 1, 1, 16, 0, 0),
            utc(2011, 1, 1, 17, 0, 0),
            Duration::seconds(120),
            Period::Intraday(3_600),
        );
    }

    #[test]
    fn localized_ranges() {
        let ny = chrono_tz::America::New_York;
        let at = |d: u32, h: u32, m: u32| ny.with_ymd_and_hms(2011, 1, d, h, m, 0).unwrap();
        check_range(at(1, 1, 1), at(1, 1, 2), Duration::seconds(5), Period::Intraday(60));
        check_range(at(1, 16, 0), at(1, 17, 0), Duration::seconds(120), Period::Intraday(3_600));
        check_range(at(1, 0, 0), at(2, 0, 0), Duration::minutes(325), Period::Day);
        // 23:30 in New York is already the next day in UTC.
        let r = build_range(&at(3, 23, 30).with_timezone(&Utc), Period::Day).unwrap();
        assert_eq!(r.beginning(), &utc(2011, 1, 4, 0, 0, 0));
        let r = build_range(&at(3, 23, 30), Period::Day).unwrap();
        assert_eq!(r.beginning().with_timezone(&Utc), utc(2011, 1, 3, 5, 0, 0));
    }

    #[test]
    fn hourly_ranges_across_dst() {
        let ny = chrono_tz::America::New_York;
        let range = |h: u32, m: u32, d: u32, mo: u32| {
            let r = build_range(&utc(2011, mo, d, h, m, 0).with_timezone(&ny), Period::Intraday(3_600))
                .unwrap();
            (r.beginning().with_timezone(&Utc), r.ending().with_timezone(&Utc))
        };
        // 2011-11-06: 01:00-02:00 happens twice
        assert_eq!(range(5, 30, 6, 11), (utc(2011, 11, 6, 5, 0, 0), utc(2011, 11, 6, 7, 0, 0)));
        assert_eq!(range(6, 30, 6, 11), (utc(2011, 11, 6, 6, 0, 0), utc(2011, 11, 6, 7, 0, 0)));
        // 2011-03-13: 02:00-03:00 never happens
        assert_eq!(range(6, 30, 13, 3), (utc(2011, 3, 13, 6, 0, 0), utc(2011, 3, 13, 7, 0, 0)));
        assert_eq!(range(7, 30, 13, 3), (utc(2011, 3, 13, 7, 0, 0), utc(2011, 3, 13, 8, 0, 0)));
    }

    #[test]
    fn intraday_grid_must_divide_a_day() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 6, 10, 30, 0).unwrap();
        for secs in [0, 7 * 60, 2 * 86_400, 21 * 86_400] {
            assert!(matches!(
                build_range(&ts, Period::Intraday(secs)),
                Err(Error::UnsupportedPeriod(_))
            ));
        }
    }

    #[test]
    fn minute_bucket_holds_whole_minute() {
        let r = build_range(&utc(2011, 1, 3, 9, 30, 59), Period::Intraday(60)).unwrap();
        for s in 0..60 {
            assert!(r.belongs(&utc(2011, 1, 3, 9, 30, s)));
        }
        assert_eq!(r.ending(), &utc(2011, 1, 3, 9, 31, 0));
    }

    #[test]
    fn day_week_month_ranges() {
        let offset = Duration::hours(5) + Duration::minutes(25);
        check_range(utc(2011, 1, 1, 0, 0, 0), utc(2011, 1, 2, 0, 0, 0), offset, Period::Day);
        // 2011-01-05 is a Wednesday.
        let r = build_range(&utc(2011, 1, 5, 12, 0, 0), Period::Week).unwrap();
        assert_eq!(r.beginning(), &utc(2011, 1, 3, 0, 0, 0));
        assert_eq!(r.ending(), &utc(2011, 1, 10, 0, 0, 0));
        check_range(utc(2011, 1, 1, 0, 0, 0), utc(2011, 2, 1, 0, 0, 0), offset, Period::Month);
        check_range(utc(2011, 2, 1, 0, 0, 0), utc(2011, 3, 1, 0, 0, 0), offset, Period::Month);
        check_range(utc(2011, 12, 1, 0, 0, 0), utc(2012, 1, 1, 0, 0, 0), offset, Period::Month);

        let r = build_range(&utc(2011, 2, 15, 0, 0, 0), Period::Month).unwrap();
        assert_eq!(r.beginning(), &utc(2011, 2, 1, 0, 0, 0));
        assert_eq!(r.ending(), &utc(2011, 3, 1, 0, 0, 0));
        let r = build_range(&utc(2011, 12, 15, 0, 0, 0), Period::Month).unwrap();
        assert_eq!(r.beginning(), &utc(2011, 12, 1, 0, 0, 0));
        assert_eq!(r.ending(), &utc(2012, 1, 1, 0, 0, 0));
    }

    fn sec_bar(dt: DateTime<Utc>, o: f64, h: f64, l: f64, c: f64, v: f64, adj: f64) -> Bar {
        Bar::new(dt, o, h, l, c, v, Some(adj), Frequency::Second)
    }

    #[test]
    fn bar_grouper_folds_ohlcv() {
        let mut r = Resampler::new(Period::Intraday(60), Tz::UTC, BarGrouper::new(Frequency::Minute));
        let t = utc(2011, 1, 3, 9, 30, 0);
        let b1 = Bar::new(t, 10.0, 12.0, 9.0, 11.0, 5.0, None, Frequency::Second);
        let b2 = Bar::new(t + Duration::seconds(30), 11.0, 13.0, 10.0, 12.0, 7.0, None, Frequency::Second);
        assert!(r.append(b1.date_time(), &b1).unwrap().is_none());
        assert!(r.append(b2.date_time(), &b2).unwrap().is_none());
        let (start, bar) = r.push_last().unwrap();
        assert_eq!(start, t);
        assert_eq!(
            (bar.open(), bar.high(), bar.low(), bar.close(), bar.volume()),
            (10.0, 13.0, 9.0, 12.0, 12.0)
        );
        assert_eq!(bar.frequency(), Frequency::Minute);
        assert!(r.is_idle());
        assert!(r.push_last().is_none());
    }

    #[test]
    fn resampled_series_follow_source() {
        let bar_ds = BarDataSeries::shared(None).unwrap();
        let close = bar_ds.borrow().close_series();
        let sums = ResampledSeries::new(&close, Period::Intraday(60), Tz::UTC, None, |v: &[f64]| {
            v.iter().sum::<f64>()
        })
        .unwrap();
        let bars = ResampledBarSeries::new(&bar_ds, Period::Intraday(60), Tz::UTC, None).unwrap();

        for b in [
            sec_bar(utc(2011, 1, 1, 1, 1, 1), 2.1, 3.0, 1.0, 2.0, 10.0, 1.0),
            sec_bar(utc(2011, 1, 1, 1, 1, 2), 2.0, 3.0, 1.0, 2.3, 10.0, 2.0),
            sec_bar(utc(2011, 1, 1, 1, 2, 1), 2.0, 3.0, 1.0, 2.0, 10.0, 2.0),
        ] {
            bar_ds.borrow_mut().append(b).unwrap();
        }

        assert_eq!(bars.len(), 1);
        let first = bars.bars()[0].clone();
        assert_eq!(first.date_time(), utc(2011, 1, 1, 1, 1, 0));
        assert_eq!(
            (first.open(), first.high(), first.low(), first.close(), first.volume()),
            (2.1, 3.0, 1.0, 2.3, 20.0)
        );
        assert_eq!(first.adj_close(), Some(2.0));
        assert_eq!(*sums.output().borrow().get(-1).unwrap(), 2.0 + 2.3);

        bars.push_last().unwrap();
        assert_eq!(bars.len(), 2);
        let second = bars.bars()[1].clone();
        assert_eq!(second.date_time(), utc(2011, 1, 1, 1, 2, 0));
        assert_eq!((second.open(), second.close(), second.volume()), (2.0, 2.0, 10.0));
        assert_eq!(second.adj_close(), Some(2.0));

        sums.push_last().unwrap();
        assert_eq!(*sums.output().borrow().get(1).unwrap(), 2.0);
        assert_eq!(
            sums.output().borrow().date_time(1).unwrap(),
            Some(utc(2011, 1, 1, 1, 2, 0))
        );
    }

    #[test]
    fn check_now_flushes_closed_bucket() {
        let bar_ds = BarDataSeries::shared(None).unwrap();
        let resampled = ResampledBarSeries::new(&bar_ds, Period::Intraday(60), Tz::UTC, None).unwrap();
        let dt = utc(2014, 7, 7, 22, 46, 28) + Duration::milliseconds(10);
        let bar = Bar::new(dt, 2.1, 3.0, 1.0, 2.0, 10.0, Some(1.0), Frequency::Minute);
        bar_ds.borrow_mut().append(bar.clone()).unwrap();
        assert!(resampled.is_empty());

        resampled.check_now(dt + Duration::seconds(10)).unwrap();
        assert!(resampled.is_empty());
        resampled.check_now(dt + Duration::minutes(1)).unwrap();
        assert_eq!(resampled.len(), 1);
        let out = resampled.bars()[0].clone();
        assert_eq!(out.date_time(), utc(2014, 7, 7, 22, 46, 0));
        assert_eq!(
            (out.open(), out.high(), out.low(), out.close(), out.volume(), out.adj_close()),
            (bar.open(), bar.high(), bar.low(), bar.close(), bar.volume(), bar.adj_close())
        );
    }

    #[test]
    fn dropping_resampled_series_detaches() {
        let bar_ds = BarDataSeries::shared(None).unwrap();
        let resampled = ResampledBarSeries::new(&bar_ds, Period::Day, Tz::UTC, None).unwrap();
        assert_eq!(bar_ds.borrow().new_value_event().subscriber_count(), 1);
        drop(resampled);
        assert_eq!(bar_ds.borrow().new_value_event().subscriber_count(), 0);
    }

    #[test]
    fn undated_values_cannot_be_bucketed() {
        let ds = SequenceDataSeries::<f64>::shared(None).unwrap();
        let _r = ResampledSeries::new(&ds, Period::Day, Tz::UTC, None, |v: &[f64]| v.len()).unwrap();
        assert!(matches!(ds.borrow_mut().append(1.0), Err(Error::MissingDateTime)));
    }

    #[test]
    fn bars_grouper_keeps_instruments_apart() {
        let mut g = BarsGrouper::new(Frequency::Day);
        let t = utc(2011, 1, 3, 0, 0, 0);
        let mk = |c: f64| Bar::new(t, c, c, c, c, 1.0, None, Frequency::Minute);
        let mut first = IndexMap::new();
        first.insert("a".to_string(), mk(1.0));
        g.add_value(&Bars::new(t, first));
        let mut second = IndexMap::new();
        second.insert("a".to_string(), mk(2.0));
        second.insert("b".to_string(), mk(5.0));
        g.add_value(&Bars::new(t, second));
        let out = g.take_grouped(t).unwrap();
        assert_eq!(out.get("a").unwrap().close(), 2.0);
        assert_eq!(out.get("a").unwrap().volume(), 2.0);
        assert_eq!(out.get("b").unwrap().open(), 5.0);
        assert!(g.take_grouped(t).is_none());
    }
}
