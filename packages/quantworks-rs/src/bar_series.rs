use std::cell::RefCell;
use std::rc::Rc;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::event::Event;
use crate::series::{Entry, SequenceDataSeries, SeriesSink, SharedSeries};
use crate::types::Bar;

pub type SharedBarSeries = Rc<RefCell<BarDataSeries>>;

/// Price field of a bar, used to pick a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Open,
    High,
    Low,
    Close,
    Volume,
}

/// Bar series with one parallel column per price field.
///
/// Every column has the same cap as the bar series and receives a value on
/// each bar append, so index `i` lines up across all of them.
#[derive(Debug)]
pub struct BarDataSeries {
    bars: SequenceDataSeries<Bar>,
    open: SharedSeries<f64>,
    high: SharedSeries<f64>,
    low: SharedSeries<f64>,
    close: SharedSeries<f64>,
    volume: SharedSeries<f64>,
    adj_close: SharedSeries<Option<f64>>,
}

impl BarDataSeries {
    pub fn new(max_len: Option<usize>) -> Result<Self> {
        Ok(Self {
            bars: SequenceDataSeries::new(max_len)?,
            open: SequenceDataSeries::shared(max_len)?,
            high: SequenceDataSeries::shared(max_len)?,
            low: SequenceDataSeries::shared(max_len)?,
            close: SequenceDataSeries::shared(max_len)?,
            volume: SequenceDataSeries::shared(max_len)?,
            adj_close: SequenceDataSeries::shared(max_len)?,
        })
    }

    pub fn shared(max_len: Option<usize>) -> Result<SharedBarSeries> {
        Ok(Rc::new(RefCell::new(Self::new(max_len)?)))
    }

    #[inline]
    pub fn max_len(&self) -> Option<usize> {
        self.bars.max_len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bars.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// Stores the bar and its fields in every column before any new-value
    /// event fires, so the columns stay aligned even when a handler fails.
    /// Column events fire first and the bar event last. The first handler
    /// error is returned and the events after it are skipped.
    pub fn append(&mut self, bar: Bar) -> Result<()> {
        let dt = bar.date_time();
        let (mut open, mut high, mut low, mut close, mut volume, mut adj_close) = (
            self.open.borrow_mut(),
            self.high.borrow_mut(),
            self.low.borrow_mut(),
            self.close.borrow_mut(),
            self.volume.borrow_mut(),
            self.adj_close.borrow_mut(),
        );
        self.bars.check_order(dt)?;
        for col in [&open, &high, &low, &close, &volume] {
            col.check_order(dt)?;
        }
        adj_close.check_order(dt)?;

        open.store_silently(Some(dt), bar.open());
        high.store_silently(Some(dt), bar.high());
        low.store_silently(Some(dt), bar.low());
        close.store_silently(Some(dt), bar.close());
        volume.store_silently(Some(dt), bar.volume());
        adj_close.store_silently(Some(dt), bar.adj_close());
        self.bars.store_silently(Some(dt), bar);

        drop((open, high, low, close, volume, adj_close));

        // handlers may read the columns
        for col in [&self.open, &self.high, &self.low, &self.close, &self.volume] {
            col.borrow().emit_last()?;
        }
        self.adj_close.borrow().emit_last()?;
        self.bars.emit_last()
    }

    pub fn bars(&self) -> &SequenceDataSeries<Bar> {
        &self.bars
    }

    pub fn get(&self, index: isize) -> Result<&Bar> {
        self.bars.get(index)
    }

    pub fn last(&self) -> Option<&Bar> {
        self.bars.last()
    }

    pub fn date_times(&self) -> Vec<Option<DateTime<Utc>>> {
        self.bars.date_times()
    }

    pub fn new_value_event(&self) -> &Event<Entry<Bar>> {
        self.bars.new_value_event()
    }

    pub fn column(&self, field: Field) -> SharedSeries<f64> {
        let col = match field {
            Field::Open => &self.open,
            Field::High => &self.high,
            Field::Low => &self.low,
            Field::Close => &self.close,
            Field::Volume => &self.volume,
        };
        Rc::clone(col)
    }

    pub fn open_series(&self) -> SharedSeries<f64> {
        self.column(Field::Open)
    }

    pub fn high_series(&self) -> SharedSeries<f64> {
        self.column(Field::High)
    }

    pub fn low_series(&self) -> SharedSeries<f64> {
        self.column(Field::Low)
    }

    pub fn close_series(&self) -> SharedSeries<f64> {
        self.column(Field::Close)
    }

    pub fn volume_series(&self) -> SharedSeries<f64> {
        self.column(Field::Volume)
    }

    pub fn adj_close_series(&self) -> SharedSeries<Option<f64>> {
        Rc::clone(&self.adj_close)
    }

    /// Adjusted close column when `use_adjusted`, close column otherwise.
    pub fn price_series(&self, use_adjusted: bool) -> PriceSeries {
        if use_adjusted {
            PriceSeries::Adjusted(self.adj_close_series())
        } else {
            PriceSeries::Raw(self.close_series())
        }
    }
}

/// Either the close or the adjusted-close column of a [`BarDataSeries`].
#[derive(Debug, Clone)]
pub enum PriceSeries {
    Raw(SharedSeries<f64>),
    Adjusted(SharedSeries<Option<f64>>),
}

impl SeriesSink<Bar> for BarDataSeries {
    fn push_dated(&mut self, _date_time: DateTime<Utc>, value: Bar) -> Result<()> {
        self.append(value)
    }
}
