//! Serializable settings for building feeds.

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::period::Period;
use crate::series::{checked_max_len, DEFAULT_MAX_LEN};
use crate::types::Frequency;

fn default_max_len() -> Option<usize> {
    Some(DEFAULT_MAX_LEN)
}

/// Settings for a [`crate::feed::bar_feed::MemoryBarFeed`].
///
/// `max_len: null` means unbounded series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FeedConfig {
    pub frequency: Frequency,
    #[serde(default = "default_max_len")]
    pub max_len: Option<usize>,
}

impl FeedConfig {
    pub fn new(frequency: Frequency) -> Self {
        Self {
            frequency,
            max_len: default_max_len(),
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        checked_max_len(self.max_len).map(|_| ())
    }
}

/// Settings for a [`crate::feed::bar_feed::ResampledBarFeed`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResampleConfig {
    pub period: Period,
    /// IANA name, e.g. `"America/New_York"`.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_max_len")]
    pub max_len: Option<usize>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl ResampleConfig {
    pub fn new(period: Period) -> Self {
        Self {
            period,
            timezone: default_timezone(),
            max_len: default_max_len(),
        }
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn tz(&self) -> Result<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| Error::UnknownTimezone(self.timezone.clone()))
    }

    pub fn validate(&self) -> Result<()> {
        checked_max_len(self.max_len)?;
        self.tz().map(|_| ())
    }
}
