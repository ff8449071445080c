//! Output records and their ordering clock.

use chrono::Utc;
use fleetci_core::protocol::{OutputLevel, OutputRecord, OutputType};
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic nanosecond stamps.
///
/// Wall-clock nanoseconds, bumped by one whenever the clock would not move
/// forward, so two lines in the same instant still get distinct, ordered values.
#[derive(Debug, Default)]
pub struct NanoClock {
    last: AtomicU64,
}

impl NanoClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        let wall = Utc::now()
            .timestamp_nanos_opt()
            .and_then(|n| u64::try_from(n).ok())
            .unwrap_or(0);
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let next = wall.max(last + 1);
            match self
                .last
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(current) => last = current,
            }
        }
    }

    /// Build a record stamped with the next tick.
    pub fn record(
        &self,
        output_type: OutputType,
        level: OutputLevel,
        message: String,
        source: &str,
    ) -> OutputRecord {
        OutputRecord {
            output_type,
            level,
            message,
            timestamp: Utc::now(),
            nanotime: self.next(),
            source: source.to_string(),
        }
    }
}
