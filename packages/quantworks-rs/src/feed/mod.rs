//! Feeds: subjects that produce keyed values and keep one series per key.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use tracing::debug;

use crate::error::{Error, Result};
use crate::event::Event;
use crate::series::{checked_max_len, SequenceDataSeries, SeriesSink};
use crate::subject::Subject;

pub use crate::types::FeedValues;

pub mod bar_feed;

/// State shared by every feed: per-key series, the new-values event and the
/// cap applied to series it creates.
pub struct FeedCore<V, S> {
    series: IndexMap<String, Rc<RefCell<S>>>,
    new_values_event: Event<FeedValues<V>>,
    max_len: Option<usize>,
}

impl<V, S> core::fmt::Debug for FeedCore<V, S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FeedCore")
            .field("keys", &self.series.keys().collect::<Vec<_>>())
            .field("max_len", &self.max_len)
            .finish_non_exhaustive()
    }
}

impl<V, S> FeedCore<V, S> {
    pub fn new(max_len: Option<usize>) -> Result<Self> {
        Ok(Self {
            series: IndexMap::new(),
            new_values_event: Event::new(),
            max_len: checked_max_len(max_len)?,
        })
    }

    pub fn max_len(&self) -> Option<usize> {
        self.max_len
    }

    pub fn contains(&self, key: &str) -> bool {
        self.series.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<Rc<RefCell<S>>> {
        self.series.get(key).map(Rc::clone)
    }

    pub fn insert(&mut self, key: &str, series: S) {
        self.series
            .insert(key.to_string(), Rc::new(RefCell::new(series)));
    }

    pub fn keys(&self) -> Vec<String> {
        self.series.keys().cloned().collect()
    }

    fn clear(&mut self) {
        self.series.clear();
    }
}

/// A [`Subject`] that yields [`FeedValues`] and appends each value to the
/// series of its key (created on first sight).
pub trait Feed: Subject {
    type Value: Clone + 'static;
    type Series: SeriesSink<Self::Value> + 'static;

    fn core(&self) -> &FeedCore<Self::Value, Self::Series>;

    fn core_mut(&mut self) -> &mut FeedCore<Self::Value, Self::Series>;

    /// Next batch of values, or `None` when nothing is available now.
    fn get_next_values(&mut self) -> Result<Option<FeedValues<Self::Value>>>;

    fn create_data_series(&self, key: &str, max_len: Option<usize>) -> Result<Self::Series>;

    fn register_data_series(&mut self, key: &str) -> Result<()> {
        if !self.core().contains(key) {
            let series = self.create_data_series(key, self.core().max_len())?;
            self.core_mut().insert(key, series);
        }
        Ok(())
    }

    fn get_next_values_and_update_data_series(
        &mut self,
    ) -> Result<Option<FeedValues<Self::Value>>> {
        let Some(values) = self.get_next_values()? else {
            return Ok(None);
        };
        let dt = values.date_time();
        for (key, value) in values.values() {
            self.register_data_series(key)?;
            let series = self
                .core()
                .get(key)
                .ok_or_else(|| Error::custom(format!("no series for key {key}")))?;
            series.borrow_mut().push_dated(dt, value.clone())?;
        }
        Ok(Some(values))
    }

    /// Subject dispatch for feeds: update the series, then emit.
    fn dispatch_next(&mut self) -> Result<bool> {
        match self.get_next_values_and_update_data_series()? {
            Some(values) => {
                self.core().new_values_event.emit(&values)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn data_series(&self, key: &str) -> Option<Rc<RefCell<Self::Series>>> {
        self.core().get(key)
    }

    fn keys(&self) -> Vec<String> {
        self.core().keys()
    }

    fn new_values_event(&self) -> &Event<FeedValues<Self::Value>> {
        &self.core().new_values_event
    }

    fn reset(&mut self) -> Result<()> {
        self.reset_data_series()
    }

    /// Drops every series and creates an empty one for each known key.
    fn reset_data_series(&mut self) -> Result<()> {
        let keys = self.core().keys();
        self.core_mut().clear();
        for key in keys {
            self.register_data_series(&key)?;
        }
        Ok(())
    }
}

/// Pull-based cursor over a feed.
///
/// Created by [`iter_feed`], which starts the feed. The feed is stopped and
/// joined exactly once, when the iterator is exhausted or dropped.
pub struct FeedIterator<'a, F: Feed + ?Sized> {
    feed: &'a mut F,
    closed: bool,
}

pub fn iter_feed<F: Feed + ?Sized>(feed: &mut F) -> Result<FeedIterator<'_, F>> {
    feed.start()?;
    Ok(FeedIterator {
        feed,
        closed: false,
    })
}

impl<F: Feed + ?Sized> FeedIterator<'_, F> {
    /// Stops and joins the feed now, returning the first error.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let stopped = self.feed.stop();
        let joined = self.feed.join();
        stopped.and(joined)
    }
}

impl<F: Feed + ?Sized> Iterator for FeedIterator<'_, F> {
    type Item = Result<FeedValues<F::Value>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.closed {
            return None;
        }
        while !self.feed.eof() {
            match self.feed.get_next_values_and_update_data_series() {
                Ok(Some(values)) => return Some(Ok(values)),
                Ok(None) => continue,
                Err(err) => {
                    let _ = self.close();
                    return Some(Err(err));
                }
            }
        }
        match self.close() {
            Ok(()) => None,
            Err(err) => Some(Err(err)),
        }
    }
}

impl<F: Feed + ?Sized> Drop for FeedIterator<'_, F> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(error = %err, "feed cleanup failed");
        }
    }
}

/// In-memory feed of arbitrary keyed values.
pub struct MemoryFeed<V> {
    core: FeedCore<V, SequenceDataSeries<V>>,
    values: VecDeque<FeedValues<V>>,
}

impl<V> core::fmt::Debug for MemoryFeed<V> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemoryFeed")
            .field("core", &self.core)
            .field("pending", &self.values.len())
            .finish()
    }
}

impl<V: Clone + 'static> MemoryFeed<V> {
    pub fn new(max_len: Option<usize>) -> Result<Self> {
        Ok(Self {
            core: FeedCore::new(max_len)?,
            values: VecDeque::new(),
        })
    }

    /// Queues values in datetime order. Keys are registered right away.
    pub fn add_values(
        &mut self,
        values: impl IntoIterator<Item = (DateTime<Utc>, IndexMap<String, V>)>,
    ) -> Result<()> {
        let mut loaded: Vec<FeedValues<V>> = self.values.drain(..).collect();
        loaded.extend(values.into_iter().map(|(dt, v)| FeedValues::new(dt, v)));
        loaded.sort_by_key(FeedValues::date_time);
        let keys: Vec<String> = loaded
            .iter()
            .flat_map(|v| v.keys().map(str::to_string).collect::<Vec<_>>())
            .collect();
        for key in keys {
            self.register_data_series(&key)?;
        }
        debug!(pending = loaded.len(), "memory feed loaded");
        self.values = loaded.into();
        Ok(())
    }
}

impl<V: Clone + 'static> Subject for MemoryFeed<V> {
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
        self.values.is_empty()
    }

    fn dispatch(&mut self) -> Result<bool> {
        self.dispatch_next()
    }

    fn peek_date_time(&self) -> Option<DateTime<Utc>> {
        self.values.front().map(FeedValues::date_time)
    }
}

impl<V: Clone + 'static> Feed for MemoryFeed<V> {
    type Value = V;
    type Series = SequenceDataSeries<V>;

    fn core(&self) -> &FeedCore<V, Self::Series> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FeedCore<V, Self::Series> {
        &mut self.core
    }

    fn get_next_values(&mut self) -> Result<Option<FeedValues<V>>> {
        Ok(self.values.pop_front())
    }

    fn create_data_series(&self, _key: &str, max_len: Option<usize>) -> Result<Self::Series> {
        SequenceDataSeries::new(max_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::cell::Cell;

    fn t(i: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(i)
    }

    fn row(pairs: &[(&str, f64)]) -> IndexMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    /// Counts lifecycle calls.
    struct Counting {
        inner: MemoryFeed<f64>,
        stops: Rc<Cell<u32>>,
        joins: Rc<Cell<u32>>,
    }

    impl Subject for Counting {
        fn start(&mut self) -> Result<()> {
            self.inner.start()
        }
        fn stop(&mut self) -> Result<()> {
            self.stops.set(self.stops.get() + 1);
            Ok(())
        }
        fn join(&mut self) -> Result<()> {
            self.joins.set(self.joins.get() + 1);
            Ok(())
        }
        fn eof(&self) -> bool {
            self.inner.eof()
        }
        fn dispatch(&mut self) -> Result<bool> {
            self.dispatch_next()
        }
        fn peek_date_time(&self) -> Option<DateTime<Utc>> {
            self.inner.peek_date_time()
        }
    }

    impl Feed for Counting {
        type Value = f64;
        type Series = SequenceDataSeries<f64>;
        fn core(&self) -> &FeedCore<f64, Self::Series> {
            self.inner.core()
        }
        fn core_mut(&mut self) -> &mut FeedCore<f64, Self::Series> {
            self.inner.core_mut()
        }
        fn get_next_values(&mut self) -> Result<Option<FeedValues<f64>>> {
            self.inner.get_next_values()
        }
        fn create_data_series(&self, key: &str, max_len: Option<usize>) -> Result<Self::Series> {
            self.inner.create_data_series(key, max_len)
        }
    }

    fn counting(n: i64) -> Counting {
        let mut inner = MemoryFeed::new(None).unwrap();
        inner
            .add_values((0..n).map(|i| (t(i), row(&[("x", i as f64)]))))
            .unwrap();
        Counting {
            inner,
            stops: Rc::default(),
            joins: Rc::default(),
        }
    }

    #[test]
    fn values_land_in_per_key_series() {
        let mut feed = MemoryFeed::new(Some(2)).unwrap();
        feed.add_values(vec![
            (t(1), row(&[("a", 1.0), ("b", 10.0)])),
            (t(0), row(&[("a", 0.0)])),
            (t(2), row(&[("a", 2.0), ("c", 5.0)])),
        ])
        .unwrap();
        assert_eq!(feed.keys(), vec!["a", "b", "c"]);
        assert_eq!(feed.peek_date_time(), Some(t(0)));

        let seen = Rc::new(Cell::new(0));
        let s = Rc::clone(&seen);
        feed.new_values_event().subscribe(move |v: &FeedValues<f64>| {
            s.set(s.get() + v.len());
            Ok(())
        });
        while !feed.eof() {
            assert!(feed.dispatch().unwrap());
        }
        assert!(!feed.dispatch().unwrap());
        assert_eq!(seen.get(), 5);
        let a = feed.data_series("a").unwrap();
        assert_eq!(a.borrow().values(), vec![1.0, 2.0]);
        assert_eq!(feed.data_series("c").unwrap().borrow().len(), 1);

        feed.reset().unwrap();
        assert_eq!(feed.keys(), vec!["a", "b", "c"]);
        assert!(feed.data_series("a").unwrap().borrow().is_empty());
    }

    #[test]
    fn iterator_stops_and_joins_once_when_exhausted() {
        let mut feed = counting(3);
        let (stops, joins) = (Rc::clone(&feed.stops), Rc::clone(&feed.joins));
        let got: Vec<f64> = iter_feed(&mut feed)
            .unwrap()
            .map(|v| *v.unwrap().get("x").unwrap())
            .collect();
        assert_eq!(got, vec![0.0, 1.0, 2.0]);
        assert_eq!((stops.get(), joins.get()), (1, 1));
        assert_eq!(feed.data_series("x").unwrap().borrow().len(), 3);
    }

    #[test]
    fn iterator_cleans_up_on_early_drop() {
        let mut feed = counting(5);
        let (stops, joins) = (Rc::clone(&feed.stops), Rc::clone(&feed.joins));
        {
            let mut it = iter_feed(&mut feed).unwrap();
            assert!(it.next().unwrap().is_ok());
        }
        assert_eq!((stops.get(), joins.get()), (1, 1));
    }
}
