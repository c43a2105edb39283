//! Derived series computed over a trailing window of another series.
//!
//! A [`WindowedFilter`] follows its source through the source's new-value
//! event, so every output is computed once, when its value is appended.
//! Absent source values produce an absent output and leave the window
//! untouched. Present values enter the window, and once it holds
//! `window_size` values the reducer runs and its result is cached at that
//! position. An output is only exposed while every value of its window is
//! still retained by the source.

use std::cell::{Ref, RefCell};
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::rc::{Rc, Weak};

use tracing::trace;

use crate::circular::CircularColumn;
use crate::error::{Error, Result};
use crate::event::SubscriptionId;
use crate::series::{Entry, SequenceDataSeries, SharedSeries};

/// Computes one output from a full window (oldest value first).
pub trait WindowReducer {
    type Input: Clone;
    type Output: Clone;

    fn reduce(&mut self, window: &[Self::Input]) -> Option<Self::Output>;

    /// Called when the filter has to rebuild its window from the values the
    /// source still retains.
    fn reset(&mut self) {}
}

/// Cached output and the sequence number of the oldest window value.
type Cached<O> = Option<(O, u64)>;

struct WindowState<R: WindowReducer> {
    size: usize,
    reducer: R,
    window: VecDeque<R::Input>,
    window_seqs: VecDeque<u64>,
    // sequence number of the next source value
    next_seq: u64,
    outputs: CircularColumn<Cached<R::Output>>,
}

impl<R: WindowReducer> WindowState<R> {
    fn push(&mut self, value: Option<R::Input>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let output = value.and_then(|input| {
            self.window.push_back(input);
            self.window_seqs.push_back(seq);
            if self.window.len() > self.size {
                self.window.pop_front();
                self.window_seqs.pop_front();
            }
            if self.window.len() < self.size {
                return None;
            }
            let oldest = self.window_seqs.front().copied()?;
            self.reducer
                .reduce(self.window.make_contiguous())
                .map(|out| (out, oldest))
        });
        self.outputs.push(output);
    }

    /// Recomputes every output from the values `source` still holds.
    fn rebuild<T>(&mut self, source: &SequenceDataSeries<T>)
    where
        T: Clone + Into<Option<R::Input>>,
    {
        self.window.clear();
        self.window_seqs.clear();
        self.outputs.clear();
        self.reducer.reset();
        self.next_seq = source.first_seq();
        for value in source.iter() {
            self.push(value.clone().into());
        }
    }

    fn output_at(&self, seq: u64, first_retained: u64) -> Option<R::Output> {
        let back = usize::try_from(self.next_seq.checked_sub(seq)?).ok()?;
        let offset = self.outputs.len().checked_sub(back)?;
        let (out, oldest) = self.outputs.get(offset)?.as_ref()?;
        (*oldest >= first_retained).then(|| out.clone())
    }
}

pub struct WindowedFilter<T, R: WindowReducer> {
    source: SharedSeries<T>,
    state: Rc<RefCell<WindowState<R>>>,
    subscription: SubscriptionId,
}

impl<T, R: WindowReducer> core::fmt::Debug for WindowedFilter<T, R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut d = f.debug_struct("WindowedFilter");
        if let Ok(state) = self.state.try_borrow() {
            d.field("window_size", &state.size)
                .field("next_seq", &state.next_seq)
                .field("cached", &state.outputs.len());
        }
        d.finish_non_exhaustive()
    }
}

impl<T, R> WindowedFilter<T, R>
where
    T: Clone + Into<Option<R::Input>> + 'static,
    R: WindowReducer + 'static,
{
    /// Builds the filter, computing outputs for the values `source` already
    /// holds, and follows every later append.
    pub fn new(source: SharedSeries<T>, window_size: usize, reducer: R) -> Result<Self> {
        if window_size == 0 {
            return Err(Error::InvalidWindowSize(window_size));
        }
        let src = source.borrow();
        let mut state = WindowState {
            size: window_size,
            reducer,
            window: VecDeque::with_capacity(window_size + 1),
            window_seqs: VecDeque::with_capacity(window_size + 1),
            next_seq: src.first_seq(),
            outputs: CircularColumn::new(src.max_len()),
        };
        state.rebuild(&src);
        let state = Rc::new(RefCell::new(state));
        let weak: Weak<RefCell<WindowState<R>>> = Rc::downgrade(&state);
        let subscription = src.new_value_event().subscribe(move |(_, value): &Entry<T>| {
            // a missed value is picked up by `sync` on the next read
            if let Some(state) = weak.upgrade() {
                if let Ok(mut state) = state.try_borrow_mut() {
                    state.push(value.clone().into());
                }
            }
            Ok(())
        });
        drop(src);
        Ok(Self {
            source,
            state,
            subscription,
        })
    }
}

impl<T, R> WindowedFilter<T, R>
where
    T: Clone + Into<Option<R::Input>>,
    R: WindowReducer,
{
    pub fn window_size(&self) -> usize {
        self.state.borrow().size
    }

    pub fn data_series(&self) -> SharedSeries<T> {
        Rc::clone(&self.source)
    }

    pub fn reducer(&self) -> Ref<'_, R> {
        Ref::map(self.state.borrow(), |s| &s.reducer)
    }

    /// Same length as the source's retained window.
    pub fn len(&self) -> usize {
        self.source.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Only needed when an append was not seen, e.g. an earlier subscriber
    // of the source failed and aborted the event.
    fn sync(&self, src: &SequenceDataSeries<T>) {
        let mut state = self.state.borrow_mut();
        if state.next_seq != src.appended() {
            trace!(
                next_seq = state.next_seq,
                appended = src.appended(),
                "filter missed source values, rebuilding"
            );
            state.rebuild(src);
        }
    }

    /// Output at `index` of the source's retained window (negative counts
    /// from the end). `Ok(None)` means the position has no value, or its
    /// window reaches values the source no longer holds.
    pub fn get(&self, index: isize) -> Result<Option<R::Output>> {
        let src = self.source.borrow();
        self.sync(&src);
        let len = src.len();
        let resolved = if index < 0 {
            len as isize + index
        } else {
            index
        };
        if resolved < 0 || resolved as usize >= len {
            return Err(Error::IndexOutOfRange { index, len });
        }
        let first = src.first_seq();
        Ok(self.state.borrow().output_at(first + resolved as u64, first))
    }

    pub fn last(&self) -> Option<R::Output> {
        self.get(-1).ok().flatten()
    }

    pub fn values(&self) -> Vec<Option<R::Output>> {
        let src = self.source.borrow();
        self.sync(&src);
        let first = src.first_seq();
        let state = self.state.borrow();
        (first..src.appended())
            .map(|seq| state.output_at(seq, first))
            .collect()
    }
}

impl<T, R: WindowReducer> Drop for WindowedFilter<T, R> {
    fn drop(&mut self) {
        if let Ok(src) = self.source.try_borrow() {
            src.new_value_event().unsubscribe(self.subscription);
        }
    }
}

/// Adapts a closure into a [`WindowReducer`].
pub struct FnReducer<F, I, O> {
    f: F,
    _marker: PhantomData<fn(&[I]) -> O>,
}

impl<F, I, O> FnReducer<F, I, O>
where
    F: FnMut(&[I]) -> Option<O>,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

impl<F, I, O> core::fmt::Debug for FnReducer<F, I, O> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("FnReducer")
    }
}

impl<F, I, O> WindowReducer for FnReducer<F, I, O>
where
    F: FnMut(&[I]) -> Option<O>,
    I: Clone,
    O: Clone,
{
    type Input = I;
    type Output = O;

    fn reduce(&mut self, window: &[I]) -> Option<O> {
        (self.f)(window)
    }
}

/// Compounded return since the first present value. Window size 2.
#[derive(Debug, Clone, Default)]
pub struct CumulativeReturn {
    prev: f64,
}

impl CumulativeReturn {
    pub const WINDOW: usize = 2;

    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the filter over a price series.
    pub fn filter<T>(source: SharedSeries<T>) -> Result<WindowedFilter<T, Self>>
    where
        T: Clone + Into<Option<f64>> + 'static,
    {
        WindowedFilter::new(source, Self::WINDOW, Self::new())
    }
}

impl WindowReducer for CumulativeReturn {
    type Input = f64;
    type Output = f64;

    fn reduce(&mut self, window: &[f64]) -> Option<f64> {
        let [prev, last] = window else {
            return None;
        };
        let net = (last - prev) / prev;
        self.prev = (1.0 + self.prev) * (1.0 + net) - 1.0;
        Some(self.prev)
    }

    fn reset(&mut self) {
        self.prev = 0.0;
    }
}
