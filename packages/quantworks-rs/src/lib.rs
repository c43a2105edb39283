//! Event dispatching and time-series core for bar-based backtests.
//!
//! Subjects (feeds) are merged in time order by the [`dispatcher::Dispatcher`].
//! Feeds append what they dispatch to bounded series, which can be reduced
//! with windowed filters or resampled into coarser calendar periods.
//!
//! Everything is single-threaded: shared state is `Rc<RefCell<..>>` and
//! event handlers run synchronously on the dispatching thread.

mod types;
pub use types::*;

pub mod error;
pub use error::{Error, Result};

pub mod event;
pub mod circular;
pub mod series;
pub mod bar_series;
pub mod filter;
pub mod period;
pub mod resample;

pub mod subject;
pub mod dispatcher;
pub mod feed;
pub mod config;
