//! Bandwidth cap for the fallback tree stream.
//!
//! Values follow the `rsync.bwlimit` pool key: a bare number is KiB/s, and
//! `K`/`M`/`G` suffixes may carry a `B` (decimal) or `iB` (binary) tail.
//! Empty or zero means unlimited.

use crate::error::{MigrationError, Result};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandwidthLimit {
    bytes_per_sec: u64,
}

impl BandwidthLimit {
    /// `None` for a zero rate.
    pub fn new(bytes_per_sec: u64) -> Option<Self> {
        (bytes_per_sec > 0).then_some(Self { bytes_per_sec })
    }

    pub fn bytes_per_sec(&self) -> u64 {
        self.bytes_per_sec
    }

    pub fn parse(value: &str) -> Result<Option<Self>> {
        let value = value.trim();
        if value.is_empty() {
            return Ok(None);
        }

        let invalid = || MigrationError::Validation(format!("Invalid rsync.bwlimit value {:?}", value));

        let split = value
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(value.len());
        let (number, suffix) = value.split_at(split);
        let number: f64 = number.parse().map_err(|_| invalid())?;

        let multiplier: u64 = match suffix.to_ascii_uppercase().as_str() {
            "" | "K" | "KIB" => 1 << 10,
            "B" => 1,
            "KB" => 1_000,
            "M" | "MIB" => 1 << 20,
            "MB" => 1_000_000,
            "G" | "GIB" => 1 << 30,
            "GB" => 1_000_000_000,
            _ => return Err(invalid()),
        };

        if !number.is_finite() {
            return Err(invalid());
        }
        Ok(Self::new((number * multiplier as f64) as u64))
    }
}

/// Paces a byte stream to an optional [`BandwidthLimit`].
#[derive(Debug)]
pub struct Throttle {
    limit: Option<BandwidthLimit>,
    started: Instant,
    sent: u64,
}

impl Throttle {
    pub fn new(limit: Option<BandwidthLimit>) -> Self {
        Self {
            limit,
            started: Instant::now(),
            sent: 0,
        }
    }

    /// Account for `bytes` about to be sent, sleeping first if the stream
    /// is ahead of the allowed rate.
    pub async fn consume(&mut self, bytes: u64) {
        let Some(limit) = self.limit else {
            return;
        };
        self.sent += bytes;

        let due = Duration::from_secs_f64(self.sent as f64 / limit.bytes_per_sec() as f64);
        let elapsed = self.started.elapsed();
        if due > elapsed {
            tokio::time::sleep(due - elapsed).await;
        }
    }
}
