//! Bar feeds: in-memory replay, bar filters, row parsing and resampling.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use indexmap::IndexMap;
use tracing::{debug, warn};

use super::{Feed, FeedCore};
use crate::bar_series::BarDataSeries;
use crate::config::{FeedConfig, ResampleConfig};
use crate::dispatcher::DispatcherHandle;
use crate::error::{Error, Result};
use crate::event::SubscriptionId;
use crate::period::Period;
use crate::resample::{BarsGrouper, Resampler};
use crate::subject::{DispatchPriority, Subject};
use crate::types::{Bar, Bars, ExtraValue, Frequency};

/// Bookkeeping every bar feed carries: its frequency, the bars of the last
/// dispatch and the last bar seen per instrument.
#[derive(Debug, Clone)]
pub struct BarFeedState {
    frequency: Frequency,
    current_bars: Option<Bars>,
    last_bars: IndexMap<String, Bar>,
    default_instrument: Option<String>,
}

impl BarFeedState {
    pub fn new(frequency: Frequency) -> Self {
        Self {
            frequency,
            current_bars: None,
            last_bars: IndexMap::new(),
            default_instrument: None,
        }
    }

    /// Accepts the next bars. Datetimes must strictly increase.
    pub fn record(&mut self, bars: &Bars) -> Result<()> {
        if let Some(current) = &self.current_bars {
            if current.date_time() >= bars.date_time() {
                return Err(Error::BarsOutOfOrder {
                    previous: current.date_time(),
                    current: bars.date_time(),
                });
            }
        }
        for (instrument, bar) in bars.values() {
            self.last_bars.insert(instrument.clone(), bar.clone());
        }
        self.current_bars = Some(bars.clone());
        Ok(())
    }

    pub fn reset(&mut self) {
        self.current_bars = None;
        self.last_bars.clear();
    }
}

/// A feed of [`Bars`], one [`BarDataSeries`] per instrument.
pub trait BarFeed: Feed<Value = Bar, Series = BarDataSeries> {
    fn bar_state(&self) -> &BarFeedState;

    fn bar_state_mut(&mut self) -> &mut BarFeedState;

    /// Next bars to dispatch, or `None` if nothing is available now.
    fn get_next_bars(&mut self) -> Result<Option<Bars>>;

    fn bars_have_adj_close(&self) -> bool;

    fn frequency(&self) -> Frequency {
        self.bar_state().frequency
    }

    /// Bars of the last dispatch.
    fn current_bars(&self) -> Option<&Bars> {
        self.bar_state().current_bars.as_ref()
    }

    fn current_date_time(&self) -> Option<DateTime<Utc>> {
        self.current_bars().map(Bars::date_time)
    }

    fn last_bar(&self, instrument: &str) -> Option<&Bar> {
        self.bar_state().last_bars.get(instrument)
    }

    fn registered_instruments(&self) -> Vec<String> {
        self.keys()
    }

    /// Last registered instrument.
    fn default_instrument(&self) -> Option<&str> {
        self.bar_state().default_instrument.as_deref()
    }

    fn register_instrument(&mut self, instrument: &str) -> Result<()> {
        self.register_data_series(instrument)?;
        self.bar_state_mut().default_instrument = Some(instrument.to_string());
        Ok(())
    }

    /// `get_next_bars` plus the ordering check. Feeds use this as their
    /// `get_next_values`.
    fn next_bars_checked(&mut self) -> Result<Option<Bars>> {
        let Some(bars) = self.get_next_bars()? else {
            return Ok(None);
        };
        self.bar_state_mut().record(&bars)?;
        Ok(Some(bars))
    }
}

/// Decides whether a loaded bar enters the feed.
pub trait BarFilter {
    fn include_bar(&self, bar: &Bar) -> bool;
}

impl<F: Fn(&Bar) -> bool> BarFilter for F {
    fn include_bar(&self, bar: &Bar) -> bool {
        self(bar)
    }
}

/// Drops bars strictly before `from` or strictly after `to`.
#[derive(Debug, Clone, Default)]
pub struct DateRangeFilter {
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
}

impl DateRangeFilter {
    pub fn new(from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Self {
        Self { from, to }
    }
}

impl BarFilter for DateRangeFilter {
    fn include_bar(&self, bar: &Bar) -> bool {
        let dt = bar.date_time();
        if self.to.is_some_and(|to| dt > to) {
            return false;
        }
        if self.from.is_some_and(|from| dt < from) {
            return false;
        }
        true
    }
}

/// US equities regular trading hours: Monday to Friday, 09:30 to 16:00
/// New York time, inside an optional date range.
#[derive(Debug, Clone)]
pub struct UsEquitiesRth {
    range: DateRangeFilter,
    open: NaiveTime,
    close: NaiveTime,
}

impl UsEquitiesRth {
    pub const TIMEZONE: Tz = chrono_tz::America::New_York;

    pub fn new(from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Self {
        Self {
            range: DateRangeFilter::new(from, to),
            open: NaiveTime::from_hms_opt(9, 30, 0).unwrap_or(NaiveTime::MIN),
            close: NaiveTime::from_hms_opt(16, 0, 0).unwrap_or(NaiveTime::MIN),
        }
    }
}

impl Default for UsEquitiesRth {
    fn default() -> Self {
        Self::new(None, None)
    }
}

impl BarFilter for UsEquitiesRth {
    fn include_bar(&self, bar: &Bar) -> bool {
        if !self.range.include_bar(bar) {
            return false;
        }
        let local = bar.date_time().with_timezone(&Self::TIMEZONE);
        if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
            return false;
        }
        let time = local.time();
        time >= self.open && time <= self.close
    }
}

/// One source record, column name to raw text.
pub type Row = IndexMap<String, String>;

/// Turns source rows into bars.
pub trait RowParser {
    fn parse_bar(&self, row: &Row) -> Result<Bar>;

    /// Column names, when the source has no header row.
    fn field_names(&self) -> Option<Vec<String>> {
        None
    }

    fn delimiter(&self) -> char {
        ','
    }
}

/// Column names used by [`ColumnRowParser`].
#[derive(Debug, Clone)]
pub struct ColumnNames {
    pub date_time: String,
    pub open: String,
    pub high: String,
    pub low: String,
    pub close: String,
    pub volume: String,
    pub adj_close: Option<String>,
}

impl Default for ColumnNames {
    fn default() -> Self {
        Self {
            date_time: "Date Time".into(),
            open: "Open".into(),
            high: "High".into(),
            low: "Low".into(),
            close: "Close".into(),
            volume: "Volume".into(),
            adj_close: Some("Adj Close".into()),
        }
    }
}

/// Parses rows with configurable column names. Datetimes are read with
/// `date_time_format` (a date-only value means midnight) in `timezone`.
/// Unknown columns become bar extras.
#[derive(Debug, Clone)]
pub struct ColumnRowParser {
    columns: ColumnNames,
    date_time_format: String,
    timezone: Tz,
    frequency: Frequency,
}

impl ColumnRowParser {
    pub fn new(frequency: Frequency) -> Self {
        Self {
            columns: ColumnNames::default(),
            date_time_format: "%Y-%m-%d %H:%M:%S".into(),
            timezone: Tz::UTC,
            frequency,
        }
    }

    pub fn with_columns(mut self, columns: ColumnNames) -> Self {
        self.columns = columns;
        self
    }

    pub fn with_date_time_format(mut self, format: impl Into<String>) -> Self {
        self.date_time_format = format.into();
        self
    }

    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    /// Stops reading the adjusted close column.
    pub fn without_adj_close(mut self) -> Self {
        self.columns.adj_close = None;
        self
    }

    fn field<'r>(&self, row: &'r Row, column: &str) -> Result<&'r str> {
        row.get(column)
            .map(|v| v.trim())
            .ok_or_else(|| Error::MalformedRow(format!("missing column {column:?}")))
    }

    fn number(&self, row: &Row, column: &str) -> Result<f64> {
        let raw = self.field(row, column)?;
        raw.parse()
            .map_err(|_| Error::MalformedRow(format!("{column}: {raw:?} is not a number")))
    }

    fn date_time(&self, raw: &str) -> Result<DateTime<Utc>> {
        let naive = NaiveDateTime::parse_from_str(raw, &self.date_time_format)
            .or_else(|_| {
                NaiveDate::parse_from_str(raw, &self.date_time_format)
                    .map(|d| d.and_time(NaiveTime::MIN))
            })
            .map_err(|e| Error::MalformedRow(format!("datetime {raw:?}: {e}")))?;
        let local = self
            .timezone
            .from_local_datetime(&naive)
            .earliest()
            .ok_or(Error::NonexistentLocalTime(naive))?;
        Ok(local.with_timezone(&Utc))
    }
}

impl RowParser for ColumnRowParser {
    fn parse_bar(&self, row: &Row) -> Result<Bar> {
        let c = &self.columns;
        let date_time = self.date_time(self.field(row, &c.date_time)?)?;
        let adj_close = match &c.adj_close {
            Some(col) => match row.get(col).map(|v| v.trim()) {
                Some(raw) if !raw.is_empty() => Some(self.number(row, col)?),
                _ => None,
            },
            None => None,
        };
        let known = [&c.date_time, &c.open, &c.high, &c.low, &c.close, &c.volume];
        let extra = row
            .iter()
            .filter(|(k, _)| !known.contains(k) && c.adj_close.as_ref() != Some(*k))
            .map(|(k, v)| (k.clone(), ExtraValue::parse(v)))
            .collect();
        Ok(Bar::with_extra(
            date_time,
            self.number(row, &c.open)?,
            self.number(row, &c.high)?,
            self.number(row, &c.low)?,
            self.number(row, &c.close)?,
            self.number(row, &c.volume)?,
            adj_close,
            self.frequency,
            extra,
        ))
    }

    fn field_names(&self) -> Option<Vec<String>> {
        let c = &self.columns;
        let mut names = vec![
            c.date_time.clone(),
            c.open.clone(),
            c.high.clone(),
            c.low.clone(),
            c.close.clone(),
            c.volume.clone(),
        ];
        names.extend(c.adj_close.clone());
        Some(names)
    }
}

/// Replays bars loaded up front.
///
/// Bars are kept sorted per instrument. Each dispatch emits the bars of
/// every instrument sharing the smallest pending datetime.
pub struct MemoryBarFeed {
    core: FeedCore<Bar, BarDataSeries>,
    state: BarFeedState,
    bars: IndexMap<String, Vec<Bar>>,
    next_pos: IndexMap<String, usize>,
    started: bool,
    curr_date_time: Option<DateTime<Utc>>,
    have_adj_close: bool,
    bar_filter: Option<Box<dyn BarFilter>>,
}

impl core::fmt::Debug for MemoryBarFeed {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemoryBarFeed")
            .field("frequency", &self.state.frequency)
            .field("instruments", &self.bars.keys().collect::<Vec<_>>())
            .field("started", &self.started)
            .field("have_adj_close", &self.have_adj_close)
            .finish_non_exhaustive()
    }
}

impl MemoryBarFeed {
    pub fn new(frequency: Frequency, max_len: Option<usize>) -> Result<Self> {
        Ok(Self {
            core: FeedCore::new(max_len)?,
            state: BarFeedState::new(frequency),
            bars: IndexMap::new(),
            next_pos: IndexMap::new(),
            started: false,
            curr_date_time: None,
            have_adj_close: false,
            bar_filter: None,
        })
    }

    pub fn from_config(config: &FeedConfig) -> Result<Self> {
        config.validate()?;
        Self::new(config.frequency, config.max_len)
    }

    pub fn set_bar_filter(&mut self, filter: impl BarFilter + 'static) {
        self.bar_filter = Some(Box::new(filter));
    }

    pub fn clear_bar_filter(&mut self) {
        self.bar_filter = None;
    }

    /// Loads bars for an instrument and registers it.
    ///
    /// Once a batch with adjusted closes was loaded, every later batch must
    /// carry them too. The check runs before anything is stored.
    pub fn add_bars_from_sequence(
        &mut self,
        instrument: &str,
        bars: impl IntoIterator<Item = Bar>,
    ) -> Result<()> {
        if self.started {
            return Err(Error::FeedStarted);
        }
        let bars: Vec<Bar> = bars.into_iter().collect();
        if !bars.is_empty() {
            let batch_has_adj = bars.iter().any(|b| b.adj_close().is_some());
            if batch_has_adj {
                self.have_adj_close = true;
            } else if self.have_adj_close {
                return Err(Error::AdjCloseMissing {
                    instrument: instrument.to_string(),
                });
            }
        }
        debug!(instrument, count = bars.len(), "bars loaded");
        let loaded = self.bars.entry(instrument.to_string()).or_default();
        loaded.extend(bars);
        loaded.sort_by_key(Bar::date_time);
        self.next_pos.entry(instrument.to_string()).or_insert(0);
        self.register_instrument(instrument)
    }

    /// Parses rows and loads the bars that pass the bar filter. With
    /// `skip_malformed`, rows that fail to parse are logged and skipped.
    pub fn add_bars_from_rows<P>(
        &mut self,
        instrument: &str,
        parser: &P,
        rows: impl IntoIterator<Item = Row>,
        skip_malformed: bool,
    ) -> Result<()>
    where
        P: RowParser + ?Sized,
    {
        let mut loaded = Vec::new();
        for (line, row) in rows.into_iter().enumerate() {
            let bar = match parser.parse_bar(&row) {
                Ok(bar) => bar,
                Err(err) if skip_malformed => {
                    warn!(instrument, line, error = %err, "skipping malformed row");
                    continue;
                }
                Err(err) => return Err(err),
            };
            if self.bar_filter.as_ref().map_or(true, |f| f.include_bar(&bar)) {
                loaded.push(bar);
            }
        }
        self.add_bars_from_sequence(instrument, loaded)
    }

    pub fn is_started(&self) -> bool {
        self.started
    }
}

impl Subject for MemoryBarFeed {
    fn start(&mut self) -> Result<()> {
        self.started = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    fn join(&mut self) -> Result<()> {
        Ok(())
    }

    fn eof(&self) -> bool {
        self.bars
            .iter()
            .all(|(instrument, bars)| self.next_pos.get(instrument).copied().unwrap_or(0) >= bars.len())
    }

    fn dispatch(&mut self) -> Result<bool> {
        self.dispatch_next()
    }

    fn peek_date_time(&self) -> Option<DateTime<Utc>> {
        self.bars
            .iter()
            .filter_map(|(instrument, bars)| {
                let pos = self.next_pos.get(instrument).copied().unwrap_or(0);
                bars.get(pos).map(Bar::date_time)
            })
            .min()
    }

    fn dispatch_priority(&self) -> DispatchPriority {
        DispatchPriority::BAR_FEED
    }
}

impl Feed for MemoryBarFeed {
    type Value = Bar;
    type Series = BarDataSeries;

    fn core(&self) -> &FeedCore<Bar, BarDataSeries> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FeedCore<Bar, BarDataSeries> {
        &mut self.core
    }

    fn get_next_values(&mut self) -> Result<Option<Bars>> {
        self.next_bars_checked()
    }

    fn create_data_series(&self, _key: &str, max_len: Option<usize>) -> Result<BarDataSeries> {
        BarDataSeries::new(max_len)
    }

    /// Rewinds to the first bar and clears every series.
    fn reset(&mut self) -> Result<()> {
        for pos in self.next_pos.values_mut() {
            *pos = 0;
        }
        self.curr_date_time = None;
        self.state.reset();
        self.reset_data_series()
    }
}

impl BarFeed for MemoryBarFeed {
    fn bar_state(&self) -> &BarFeedState {
        &self.state
    }

    fn bar_state_mut(&mut self) -> &mut BarFeedState {
        &mut self.state
    }

    fn get_next_bars(&mut self) -> Result<Option<Bars>> {
        let Some(smallest) = self.peek_date_time() else {
            return Ok(None);
        };
        let mut due = IndexMap::new();
        for (instrument, bars) in &self.bars {
            let Some(pos) = self.next_pos.get_mut(instrument) else {
                continue;
            };
            if let Some(bar) = bars.get(*pos).filter(|b| b.date_time() == smallest) {
                due.insert(instrument.clone(), bar.clone());
                *pos += 1;
            }
        }
        if self.curr_date_time == Some(smallest) {
            return Err(Error::DuplicateBars {
                instruments: due.keys().cloned().collect(),
                date_time: smallest,
            });
        }
        self.curr_date_time = Some(smallest);
        Ok(Some(Bars::new(smallest, due)))
    }

    fn bars_have_adj_close(&self) -> bool {
        self.have_adj_close
    }
}

struct Pending {
    resampler: Resampler<BarsGrouper>,
    queue: VecDeque<Bars>,
}

/// Bar feed built by resampling another bar feed as it is dispatched.
///
/// It is a realtime subject: it has no peek time and is dispatched every
/// round, emitting at most one completed bucket per round. Register the
/// source feed with the same dispatcher. Each round first closes the open
/// bucket if the dispatcher's clock has moved past it, so a quiet source
/// does not hold a bucket back while other feeds advance time. When the
/// source reaches eof the partial last bucket is emitted too.
pub struct ResampledBarFeed {
    core: FeedCore<Bar, BarDataSeries>,
    state: BarFeedState,
    source: Rc<RefCell<dyn BarFeed>>,
    pending: Rc<RefCell<Pending>>,
    subscription: SubscriptionId,
    dispatcher: Option<DispatcherHandle>,
}

impl core::fmt::Debug for ResampledBarFeed {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut d = f.debug_struct("ResampledBarFeed");
        if let Ok(pending) = self.pending.try_borrow() {
            d.field("period", &pending.resampler.period())
                .field("queued", &pending.queue.len());
        }
        d.finish_non_exhaustive()
    }
}

impl ResampledBarFeed {
    pub fn new<F>(source: Rc<RefCell<F>>, period: Period, tz: Tz, max_len: Option<usize>) -> Result<Self>
    where
        F: BarFeed + 'static,
    {
        let source: Rc<RefCell<dyn BarFeed>> = source;
        let pending = Rc::new(RefCell::new(Pending {
            resampler: Resampler::new(period, tz, BarsGrouper::new(period.frequency())),
            queue: VecDeque::new(),
        }));
        let instruments = source.borrow().registered_instruments();
        let subscription = {
            let pending = Rc::clone(&pending);
            source
                .borrow()
                .new_values_event()
                .subscribe(move |bars: &Bars| {
                    let mut p = pending.borrow_mut();
                    if let Some((_, grouped)) = p.resampler.append(bars.date_time(), bars)? {
                        p.queue.push_back(grouped);
                    }
                    Ok(())
                })
        };
        let mut feed = Self {
            core: FeedCore::new(max_len)?,
            state: BarFeedState::new(period.frequency()),
            source,
            pending,
            subscription,
            dispatcher: None,
        };
        for instrument in &instruments {
            feed.register_instrument(instrument)?;
        }
        debug!(%period, timezone = %tz, ?instruments, "resampled bar feed created");
        Ok(feed)
    }

    pub fn from_config<F>(source: Rc<RefCell<F>>, config: &ResampleConfig) -> Result<Self>
    where
        F: BarFeed + 'static,
    {
        config.validate()?;
        Self::new(source, config.period, config.tz()?, config.max_len)
    }

    /// Queues the open bucket if `now` is past it. Called with the
    /// dispatcher's clock on every dispatch; call it directly when driving
    /// the feed by hand.
    pub fn check_now(&mut self, now: DateTime<Utc>) {
        let mut p = self.pending.borrow_mut();
        if let Some((_, grouped)) = p.resampler.check_now(now) {
            p.queue.push_back(grouped);
        }
    }

    /// Current datetime of the dispatcher driving this feed, if any.
    pub fn dispatcher_date_time(&self) -> Option<DateTime<Utc>> {
        self.dispatcher.as_ref().and_then(DispatcherHandle::current_date_time)
    }

    fn source_eof(&self) -> bool {
        self.source.try_borrow().map(|s| s.eof()).unwrap_or(false)
    }
}

impl Drop for ResampledBarFeed {
    fn drop(&mut self) {
        if let Ok(source) = self.source.try_borrow() {
            source.new_values_event().unsubscribe(self.subscription);
        }
    }
}

impl Subject for ResampledBarFeed {
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    fn join(&mut self) -> Result<()> {
        Ok(())
    }

    fn eof(&self) -> bool {
        let p = self.pending.borrow();
        self.source_eof() && p.queue.is_empty() && p.resampler.is_idle()
    }

    fn dispatch(&mut self) -> Result<bool> {
        if let Some(now) = self.dispatcher_date_time() {
            self.check_now(now);
        }
        if self.source_eof() {
            let mut p = self.pending.borrow_mut();
            if let Some((_, grouped)) = p.resampler.push_last() {
                p.queue.push_back(grouped);
            }
        }
        self.dispatch_next()
    }

    fn peek_date_time(&self) -> Option<DateTime<Utc>> {
        None
    }

    fn dispatch_priority(&self) -> DispatchPriority {
        DispatchPriority::BAR_FEED
    }

    fn on_dispatcher_registered(&mut self, dispatcher: &DispatcherHandle) {
        self.dispatcher = Some(dispatcher.clone());
    }
}

impl Feed for ResampledBarFeed {
    type Value = Bar;
    type Series = BarDataSeries;

    fn core(&self) -> &FeedCore<Bar, BarDataSeries> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FeedCore<Bar, BarDataSeries> {
        &mut self.core
    }

    fn get_next_values(&mut self) -> Result<Option<Bars>> {
        self.next_bars_checked()
    }

    fn create_data_series(&self, _key: &str, max_len: Option<usize>) -> Result<BarDataSeries> {
        BarDataSeries::new(max_len)
    }
}

impl BarFeed for ResampledBarFeed {
    fn bar_state(&self) -> &BarFeedState {
        &self.state
    }

    fn bar_state_mut(&mut self) -> &mut BarFeedState {
        &mut self.state
    }

    fn get_next_bars(&mut self) -> Result<Option<Bars>> {
        Ok(self.pending.borrow_mut().queue.pop_front())
    }

    fn bars_have_adj_close(&self) -> bool {
        self.source
            .try_borrow()
            .map(|s| s.bars_have_adj_close())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2011, 1, 3, 14, 30, 0).unwrap()
    }

    fn bar(mins: i64, close: f64, adj: Option<f64>) -> Bar {
        Bar::new(
            t0() + Duration::minutes(mins),
            close,
            close + 0.5,
            close - 0.5,
            close,
            10.0,
            adj,
            Frequency::Minute,
        )
    }

    fn drain(feed: &mut MemoryBarFeed) -> Result<Vec<Bars>> {
        feed.start()?;
        let mut out = Vec::new();
        while !feed.eof() {
            if let Some(bars) = feed.get_next_values_and_update_data_series()? {
                out.push(bars);
            }
        }
        Ok(out)
    }

    #[test]
    fn bars_are_merged_by_datetime() {
        let mut feed = MemoryBarFeed::new(Frequency::Minute, None).unwrap();
        feed.add_bars_from_sequence("a", vec![bar(1, 2.0, None), bar(0, 1.0, None)])
            .unwrap();
        feed.add_bars_from_sequence("b", vec![bar(1, 20.0, None)]).unwrap();
        assert_eq!(feed.registered_instruments(), vec!["a", "b"]);
        assert_eq!(feed.default_instrument(), Some("b"));
        assert_eq!(feed.peek_date_time(), Some(t0()));

        let all = drain(&mut feed).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].instruments(), vec!["a"]);
        assert_eq!(all[1].instruments(), vec!["a", "b"]);
        assert_eq!(feed.last_bar("b").unwrap().close(), 20.0);
        assert_eq!(feed.current_date_time(), Some(t0() + Duration::minutes(1)));
        let a = feed.data_series("a").unwrap();
        assert_eq!(a.borrow().close_series().borrow().values(), vec![1.0, 2.0]);
    }

    #[test]
    fn cannot_add_after_start() {
        let mut feed = MemoryBarFeed::new(Frequency::Minute, None).unwrap();
        feed.add_bars_from_sequence("a", vec![bar(0, 1.0, None)]).unwrap();
        feed.start().unwrap();
        assert!(matches!(
            feed.add_bars_from_sequence("a", vec![bar(1, 1.0, None)]),
            Err(Error::FeedStarted)
        ));
    }

    #[test]
    fn duplicate_bars_fail_at_dispatch() {
        let mut feed = MemoryBarFeed::new(Frequency::Minute, None).unwrap();
        feed.add_bars_from_sequence("a", vec![bar(0, 1.0, None), bar(0, 2.0, None)])
            .unwrap();
        let err = drain(&mut feed).unwrap_err();
        assert!(matches!(err, Error::DuplicateBars { ref instruments, .. } if instruments == &["a"]));
    }

    #[test]
    fn adj_close_cannot_disappear() {
        let mut feed = MemoryBarFeed::new(Frequency::Minute, None).unwrap();
        feed.add_bars_from_sequence("a", vec![bar(0, 1.0, None)]).unwrap();
        assert!(!feed.bars_have_adj_close());
        feed.add_bars_from_sequence("b", vec![bar(0, 1.0, Some(0.5))]).unwrap();
        assert!(feed.bars_have_adj_close());
        let err = feed
            .add_bars_from_sequence("c", vec![bar(0, 1.0, None)])
            .unwrap_err();
        assert!(matches!(err, Error::AdjCloseMissing { ref instrument } if instrument == "c"));
        assert!(feed.data_series("c").is_none());
    }

    #[test]
    fn reset_rewinds() {
        let mut feed = MemoryBarFeed::new(Frequency::Minute, Some(10)).unwrap();
        feed.add_bars_from_sequence("a", (0..3).map(|i| bar(i, 1.0, None)))
            .unwrap();
        assert_eq!(drain(&mut feed).unwrap().len(), 3);
        feed.reset().unwrap();
        assert!(feed.data_series("a").unwrap().borrow().is_empty());
        assert!(feed.current_bars().is_none());
        assert_eq!(drain(&mut feed).unwrap().len(), 3);
    }

    fn row(pairs: &[(&str, &str)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn rows_are_parsed_filtered_and_skipped() {
        let parser = ColumnRowParser::new(Frequency::Day).with_date_time_format("%Y-%m-%d");
        let rows = vec![
            row(&[("Date Time", "2011-01-03"), ("Open", "1"), ("High", "2"), ("Low", "0.5"),
                ("Close", "1.5"), ("Volume", "100"), ("Adj Close", "1.4"), ("Note", "x")]),
            row(&[("Date Time", "garbage"), ("Open", "1"), ("High", "2"), ("Low", "0.5"),
                ("Close", "1.5"), ("Volume", "100"), ("Adj Close", "1.4")]),
            row(&[("Date Time", "2011-01-10"), ("Open", "1"), ("High", "2"), ("Low", "0.5"),
                ("Close", "1.5"), ("Volume", "100"), ("Adj Close", "")]),
        ];

        let mut strict = MemoryBarFeed::new(Frequency::Day, None).unwrap();
        assert!(matches!(
            strict.add_bars_from_rows("spy", &parser, rows.clone(), false),
            Err(Error::MalformedRow(_))
        ));

        let mut feed = MemoryBarFeed::new(Frequency::Day, None).unwrap();
        let cutoff = Utc.with_ymd_and_hms(2011, 1, 5, 0, 0, 0).unwrap();
        feed.set_bar_filter(DateRangeFilter::new(None, Some(cutoff)));
        feed.add_bars_from_rows("spy", &parser, rows, true).unwrap();
        let bars = drain(&mut feed).unwrap();
        assert_eq!(bars.len(), 1);
        let b = bars[0].get("spy").unwrap();
        assert_eq!(b.date_time(), Utc.with_ymd_and_hms(2011, 1, 3, 0, 0, 0).unwrap());
        assert_eq!(b.adj_close(), Some(1.4));
        assert_eq!(b.extra().get("Note"), Some(&ExtraValue::Text("x".into())));
    }

    #[test]
    fn custom_columns_without_adj_close() {
        let parser = ColumnRowParser::new(Frequency::Minute)
            .with_columns(ColumnNames {
                date_time: "ts".into(),
                open: "o".into(),
                high: "h".into(),
                low: "l".into(),
                close: "c".into(),
                volume: "v".into(),
                adj_close: Some("adj".into()),
            })
            .without_adj_close()
            .with_timezone(UsEquitiesRth::TIMEZONE);
        assert_eq!(parser.delimiter(), ',');
        assert_eq!(
            parser.field_names().unwrap(),
            vec!["ts", "o", "h", "l", "c", "v"]
        );
        let bar = parser
            .parse_bar(&row(&[("ts", "2011-01-03 09:30:00"), ("o", "1"), ("h", "2"), ("l", "1"),
                ("c", "2"), ("v", "7"), ("adj", "1.5")]))
            .unwrap();
        assert_eq!(bar.date_time(), t0());
        assert_eq!(bar.adj_close(), None);
        // ignored adj column is kept as an extra
        assert_eq!(bar.extra().get("adj"), Some(&ExtraValue::Float(1.5)));
        assert!(matches!(
            parser.parse_bar(&row(&[("ts", "2011-01-03 09:30:00"), ("o", "x")])),
            Err(Error::MalformedRow(_))
        ));
    }

    #[test]
    fn bar_filter_can_be_cleared() {
        let parser = ColumnRowParser::new(Frequency::Day).with_date_time_format("%Y-%m-%d");
        let rows = || {
            vec![row(&[("Date Time", "2011-01-08"), ("Open", "1"), ("High", "1"), ("Low", "1"),
                ("Close", "1"), ("Volume", "1")])]
        };
        let mut feed = MemoryBarFeed::new(Frequency::Day, None).unwrap();
        feed.set_bar_filter(|bar: &Bar| bar.close() > 5.0);
        feed.add_bars_from_rows("a", &parser, rows(), false).unwrap();
        feed.clear_bar_filter();
        feed.add_bars_from_rows("b", &parser, rows(), false).unwrap();
        let bars = drain(&mut feed).unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].instruments(), vec!["b"]);
    }

    #[test]
    fn rth_filter() {
        let rth = UsEquitiesRth::default();
        let at = |d: u32, h: u32, m: u32| {
            let dt = UsEquitiesRth::TIMEZONE
                .with_ymd_and_hms(2011, 1, d, h, m, 0)
                .unwrap()
                .with_timezone(&Utc);
            Bar::new(dt, 1.0, 1.0, 1.0, 1.0, 1.0, None, Frequency::Minute)
        };
        assert!(rth.include_bar(&at(3, 9, 30)));
        assert!(rth.include_bar(&at(3, 16, 0)));
        assert!(!rth.include_bar(&at(3, 9, 29)));
        assert!(!rth.include_bar(&at(3, 16, 1)));
        // 2011-01-08 is a Saturday.
        assert!(!rth.include_bar(&at(8, 12, 0)));
    }

    #[test]
    fn resampled_feed_queues_buckets() {
        let source = Rc::new(RefCell::new(MemoryBarFeed::new(Frequency::Minute, None).unwrap()));
        source
            .borrow_mut()
            .add_bars_from_sequence("a", (0..7).map(|i| bar(i, i as f64 + 1.0, None)))
            .unwrap();
        let mut resampled =
            ResampledBarFeed::new(Rc::clone(&source), Period::Intraday(300), Tz::UTC, None).unwrap();
        assert_eq!(resampled.registered_instruments(), vec!["a"]);
        assert_eq!(resampled.frequency(), Frequency::Minute);

        source.borrow_mut().start().unwrap();
        while !source.borrow().eof() {
            source.borrow_mut().dispatch().unwrap();
        }
        // 14:30..14:34 closed by the 14:35 bar; 14:35..14:36 still open.
        assert!(!resampled.eof());
        assert!(resampled.dispatch().unwrap());
        assert!(resampled.dispatch().unwrap());
        assert!(resampled.eof());
        assert!(!resampled.dispatch().unwrap());

        let out = resampled.data_series("a").unwrap();
        let out = out.borrow();
        assert_eq!(out.len(), 2);
        let first = out.get(0).unwrap();
        assert_eq!((first.open(), first.close(), first.volume()), (1.0, 5.0, 50.0));
        assert_eq!(out.get(1).unwrap().date_time(), t0() + Duration::minutes(5));
    }

    #[test]
    fn resampled_feed_check_now_by_hand() {
        let source = Rc::new(RefCell::new(MemoryBarFeed::new(Frequency::Minute, None).unwrap()));
        source
            .borrow_mut()
            .add_bars_from_sequence("a", (0..2).map(|i| bar(i, 1.0, None)))
            .unwrap();
        let mut resampled =
            ResampledBarFeed::new(Rc::clone(&source), Period::Intraday(300), Tz::UTC, None).unwrap();
        source.borrow_mut().start().unwrap();
        source.borrow_mut().dispatch().unwrap();

        resampled.check_now(t0() + Duration::minutes(1));
        assert!(!resampled.dispatch().unwrap());
        resampled.check_now(t0() + Duration::minutes(5));
        assert!(resampled.dispatch().unwrap());
        assert_eq!(resampled.data_series("a").unwrap().borrow().len(), 1);
    }
}
