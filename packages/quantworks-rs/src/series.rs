use std::cell::RefCell;
use std::rc::Rc;

use chrono::{DateTime, Utc};

use crate::circular::CircularColumn;
use crate::error::{Error, Result};
use crate::event::Event;

/// Default cap for series created by feeds.
pub const DEFAULT_MAX_LEN: usize = 1024;

/// Validates a series cap. `None` means unbounded.
pub fn checked_max_len(max_len: Option<usize>) -> Result<Option<usize>> {
    match max_len {
        Some(0) => Err(Error::InvalidMaxLen(0)),
        other => Ok(other),
    }
}

/// A series shared between its owner (the feed that appends) and readers.
pub type SharedSeries<T> = Rc<RefCell<SequenceDataSeries<T>>>;

/// Entry stored by a series and published on append.
pub type Entry<T> = (Option<DateTime<Utc>>, T);

/// Something a feed can append dated values into.
pub trait SeriesSink<V> {
    fn push_dated(&mut self, date_time: DateTime<Utc>, value: V) -> Result<()>;
}

/// Append-only series with an optional cap.
///
/// - Once `max_len` values are held, each append evicts the oldest one.
/// - Dated appends must not go back in time.
/// - Indices are relative to the retained window; negative indices count
///   from the newest value (`-1` is the last one).
/// - `appended()` counts every value ever appended, so derived views can
///   tell how many values were evicted under them.
///
/// The new-value event fires after the value is stored. Handlers receive the
/// stored entry and must not borrow the series back.
#[derive(Debug)]
pub struct SequenceDataSeries<T> {
    entries: CircularColumn<Entry<T>>,
    appended: u64,
    last_date_time: Option<DateTime<Utc>>,
    new_value_event: Event<Entry<T>>,
}

impl<T> SequenceDataSeries<T> {
    pub fn new(max_len: Option<usize>) -> Result<Self> {
        let max_len = checked_max_len(max_len)?;
        Ok(Self {
            entries: CircularColumn::new(max_len),
            appended: 0,
            last_date_time: None,
            new_value_event: Event::new(),
        })
    }

    pub fn shared(max_len: Option<usize>) -> Result<SharedSeries<T>> {
        Ok(Rc::new(RefCell::new(Self::new(max_len)?)))
    }

    pub fn max_len(&self) -> Option<usize> {
        self.entries.capacity()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn appended(&self) -> u64 {
        self.appended
    }

    /// Absolute sequence number of the oldest retained value.
    pub fn first_seq(&self) -> u64 {
        self.appended - self.entries.len() as u64
    }

    pub fn new_value_event(&self) -> &Event<Entry<T>> {
        &self.new_value_event
    }

    /// Appends an undated value.
    pub fn append(&mut self, value: T) -> Result<()> {
        self.store_silently(None, value);
        self.emit_last()
    }

    pub fn append_with_date_time(&mut self, date_time: DateTime<Utc>, value: T) -> Result<()> {
        self.check_order(date_time)?;
        self.store_silently(Some(date_time), value);
        self.emit_last()
    }

    /// Fails if `date_time` is older than the last dated value.
    pub(crate) fn check_order(&self, date_time: DateTime<Utc>) -> Result<()> {
        match self.last_date_time {
            Some(last) if date_time < last => Err(Error::OutOfOrder {
                last,
                current: date_time,
            }),
            _ => Ok(()),
        }
    }

    /// Stores a value without notifying subscribers; pair with
    /// [`Self::emit_last`]. Dates must already be checked.
    pub(crate) fn store_silently(&mut self, date_time: Option<DateTime<Utc>>, value: T) {
        if date_time.is_some() {
            self.last_date_time = date_time;
        }
        self.entries.push((date_time, value));
        self.appended += 1;
    }

    /// Publishes the newest entry on the new-value event.
    pub(crate) fn emit_last(&self) -> Result<()> {
        match self.entries.last() {
            Some(entry) => self.new_value_event.emit(entry),
            None => Ok(()),
        }
    }

    fn normalize(&self, index: isize) -> Result<usize> {
        let len = self.entries.len();
        let resolved = if index < 0 {
            len as isize + index
        } else {
            index
        };
        if resolved < 0 || resolved as usize >= len {
            return Err(Error::IndexOutOfRange { index, len });
        }
        Ok(resolved as usize)
    }

    fn entry(&self, index: isize) -> Result<&Entry<T>> {
        let i = self.normalize(index)?;
        self.entries.get(i).ok_or(Error::IndexOutOfRange {
            index,
            len: self.entries.len(),
        })
    }

    pub fn get(&self, index: isize) -> Result<&T> {
        self.entry(index).map(|(_, v)| v)
    }

    pub fn last(&self) -> Option<&T> {
        self.entries.last().map(|(_, v)| v)
    }

    pub fn date_time(&self, index: isize) -> Result<Option<DateTime<Utc>>> {
        self.entry(index).map(|(dt, _)| *dt)
    }

    pub fn last_date_time(&self) -> Option<DateTime<Utc>> {
        self.last_date_time
    }

    pub fn date_times(&self) -> Vec<Option<DateTime<Utc>>> {
        self.entries.iter().map(|(dt, _)| *dt).collect()
    }

    /// Value by absolute sequence number, if still retained.
    pub fn get_seq(&self, seq: u64) -> Option<&T> {
        let offset = seq.checked_sub(self.first_seq())?;
        self.entries.get(offset as usize).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().map(|(_, v)| v)
    }
}

impl<T: Clone> SequenceDataSeries<T> {
    pub fn values(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }
}

impl<T> SeriesSink<T> for SequenceDataSeries<T> {
    fn push_dated(&mut self, date_time: DateTime<Utc>, value: T) -> Result<()> {
        self.append_with_date_time(date_time, value)
    }
}
