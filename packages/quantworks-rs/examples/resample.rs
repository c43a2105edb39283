use std::cell::RefCell;
use std::rc::Rc;

use chrono::{Duration, TimeZone, Utc};
use quantworks_rs::config::{FeedConfig, ResampleConfig};
use quantworks_rs::dispatcher::Dispatcher;
use quantworks_rs::feed::bar_feed::{MemoryBarFeed, ResampledBarFeed};
use quantworks_rs::feed::Feed;
use quantworks_rs::{Bar, Frequency};

// Minute bars resampled to 15 minute bars (New York time) while the
// dispatcher replays them.

fn main() -> quantworks_rs::Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let feed_config = FeedConfig::from_json_str(r#"{"frequency": "minute"}"#)?;
    let resample_config =
        ResampleConfig::from_json_str(r#"{"period": "15m", "timezone": "America/New_York"}"#)?;

    let start = Utc.with_ymd_and_hms(2024, 1, 2, 14, 30, 0).unwrap();
    let mut source = MemoryBarFeed::from_config(&feed_config)?;
    source.add_bars_from_sequence(
        "SPY",
        (0..390).map(|i| {
            let close = 470.0 + (i as f64 / 30.0).cos();
            Bar::new(
                start + Duration::minutes(i),
                close,
                close + 0.1,
                close - 0.1,
                close,
                500.0,
                None,
                Frequency::Minute,
            )
        }),
    )?;
    let source = Rc::new(RefCell::new(source));
    let resampled = Rc::new(RefCell::new(ResampledBarFeed::from_config(
        Rc::clone(&source),
        &resample_config,
    )?));

    resampled.borrow().new_values_event().subscribe(|bars| {
        for (instrument, bar) in bars.values() {
            println!(
                "{} {instrument} o={:.2} h={:.2} l={:.2} c={:.2} v={}",
                bar.date_time(),
                bar.open(),
                bar.high(),
                bar.low(),
                bar.close(),
                bar.volume()
            );
        }
        Ok(())
    });

    let mut dispatcher = Dispatcher::new();
    dispatcher.add_subject(source.clone());
    dispatcher.add_subject(resampled.clone());
    dispatcher.run()
}
