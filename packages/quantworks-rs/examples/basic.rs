use std::cell::RefCell;
use std::rc::Rc;

use chrono::{Duration, TimeZone, Utc};
use quantworks_rs::dispatcher::Dispatcher;
use quantworks_rs::feed::bar_feed::MemoryBarFeed;
use quantworks_rs::feed::Feed;
use quantworks_rs::filter::{CumulativeReturn, FnReducer, WindowedFilter};
use quantworks_rs::{Bar, Frequency};

// Two instruments replayed through a dispatcher, with a 20-bar SMA and the
// cumulative return computed over the close series.
// Try `RUST_LOG=quantworks_rs=debug cargo run --example basic`.

fn main() -> quantworks_rs::Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let start = Utc.with_ymd_and_hms(2024, 1, 2, 14, 30, 0).unwrap();
    let mut feed = MemoryBarFeed::new(Frequency::Minute, Some(256))?;
    for (instrument, base) in [("AAA", 100.0), ("BBB", 50.0)] {
        let bars = (0..200).map(|i| {
            let close = base + (i as f64 * 0.1).sin();
            Bar::new(
                start + Duration::minutes(i),
                close,
                close + 0.2,
                close - 0.2,
                close,
                1_000.0,
                None,
                Frequency::Minute,
            )
        });
        feed.add_bars_from_sequence(instrument, bars)?;
    }

    let series = feed
        .data_series("AAA")
        .ok_or_else(|| quantworks_rs::Error::custom("AAA not loaded"))?;
    let closes = series.borrow().close_series();
    let sma = WindowedFilter::new(
        Rc::clone(&closes),
        20,
        FnReducer::new(|w: &[f64]| Some(w.iter().sum::<f64>() / w.len() as f64)),
    )?;
    let cumret = CumulativeReturn::filter(Rc::clone(&closes))?;

    let feed = Rc::new(RefCell::new(feed));
    let mut dispatcher = Dispatcher::new();
    dispatcher.add_subject(feed.clone());
    dispatcher.run()?;

    println!("bars={}", closes.borrow().len());
    println!("sma_last={:?}", sma.last());
    println!("cumret_last={:?}", cumret.last());
    Ok(())
}
