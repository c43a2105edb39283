//! Error types shared by every component of the crate.

use chrono::{DateTime, NaiveDateTime, Utc};
use thiserror::Error;

/// Main error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("datetime {current} precedes the last appended datetime {last}")]
    OutOfOrder {
        last: DateTime<Utc>,
        current: DateTime<Utc>,
    },

    #[error("index {index} out of range for series of length {len}")]
    IndexOutOfRange { index: isize, len: usize },

    #[error("only bar feeds with 1 instrument can be resampled (found {0})")]
    MultipleInstruments(usize),

    #[error("previous bars for {instrument} had adjusted close and these ones don't have")]
    AdjCloseMissing { instrument: String },

    #[error("duplicate bars found for {instruments:?} on {date_time}")]
    DuplicateBars {
        instruments: Vec<String>,
        date_time: DateTime<Utc>,
    },

    #[error("bar date times are not in order: previous was {previous}, current is {current}")]
    BarsOutOfOrder {
        previous: DateTime<Utc>,
        current: DateTime<Utc>,
    },

    #[error("bar date times are not in sync: {first} vs {other}")]
    BarsNotInSync {
        first: DateTime<Utc>,
        other: DateTime<Utc>,
    },

    #[error("can't add more bars once the feed started")]
    FeedStarted,

    #[error("unsupported resample period: {0}")]
    UnsupportedPeriod(String),

    #[error("invalid period: {0}")]
    InvalidPeriod(String),

    #[error("invalid max length: {0}")]
    InvalidMaxLen(usize),

    #[error("invalid window size: {0}")]
    InvalidWindowSize(usize),

    #[error("bar has no adjusted close")]
    NoAdjClose,

    #[error("malformed row: {0}")]
    MalformedRow(String),

    #[error("local time {0} does not exist in the target timezone")]
    NonexistentLocalTime(NaiveDateTime),

    #[error("value has no datetime, it can't be bucketed")]
    MissingDateTime,

    #[error("unknown timezone: {0}")]
    UnknownTimezone(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Custom(String),
}

impl Error {
    /// Error raised by user code (event handlers, subjects, row parsers).
    pub fn custom(msg: impl Into<String>) -> Self {
        Error::Custom(msg.into())
    }
}

/// Result type alias for fallible operations.
pub type Result<T> = std::result::Result<T, Error>;
