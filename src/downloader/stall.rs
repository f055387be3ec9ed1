//! Stall detection for in-flight downloads.
//!
//! [`StallReader`] decorates a chunked byte stream with two independent
//! detectors rather than baking timeouts into the HTTP client, which would
//! lose the throughput-based one:
//!
//! 1. No-data timeout: no chunk arrives within the configured window.
//! 2. Low-throughput debounce: when the running average falls below the
//!    threshold speed, a one-shot deadline is armed. The deadline races the
//!    stream itself, so it fires even if no further byte ever arrives;
//!    recovering above the threshold disarms it.
//!
//! Once a stall is recorded it latches: every subsequent read returns the
//! same error.

use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::StallMonitorConfig;
use crate::{Error, Result};

enum Read {
    Cancelled,
    NoData,
    ThresholdElapsed,
    Chunk(Option<reqwest::Result<Bytes>>),
}

/// Placeholder deadline for the disarmed debounce branch; never polled.
fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(60 * 60 * 24)
}

pub struct StallReader<S> {
    inner: S,
    monitor: StallMonitorConfig,
    token: CancellationToken,
    started_at: Instant,
    total_bytes: u64,
    /// One-shot deadline, armed while throughput is below the threshold.
    /// Slow reads do not push it out; only recovery clears it.
    debounce_deadline: Option<Instant>,
    stall_cause: Option<String>,
}

impl<S> StallReader<S>
where
    S: Stream<Item = reqwest::Result<Bytes>> + Unpin,
{
    pub fn new(inner: S, monitor: StallMonitorConfig, token: CancellationToken) -> Self {
        Self {
            inner,
            monitor,
            token,
            started_at: Instant::now(),
            total_bytes: 0,
            debounce_deadline: None,
            stall_cause: None,
        }
    }

    /// Read the next chunk, racing both stall detectors against the stream.
    ///
    /// Returns `None` at end of stream. With monitoring disabled the wrapper
    /// is transparent apart from error conversion.
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes>> {
        if !self.monitor.enabled {
            return self
                .inner
                .next()
                .await
                .map(|chunk| chunk.map_err(Error::from));
        }

        if let Some(cause) = &self.stall_cause {
            return Some(Err(Error::Stall(cause.clone())));
        }

        let has_no_data_timeout = self.monitor.no_data_received_duration_ms > 0;
        let debounce_at = self.debounce_deadline;

        let read = tokio::select! {
            _ = self.token.cancelled() => Read::Cancelled,
            _ = tokio::time::sleep(self.monitor.no_data_received_duration()),
                if has_no_data_timeout => Read::NoData,
            _ = tokio::time::sleep_until(debounce_at.unwrap_or_else(far_future)),
                if debounce_at.is_some() => Read::ThresholdElapsed,
            chunk = self.inner.next() => Read::Chunk(chunk),
        };

        let chunk = match read {
            Read::Cancelled => return Some(Err(Error::Cancelled)),
            Read::NoData => {
                let cause = format!(
                    "no data received for {:?}",
                    self.monitor.no_data_received_duration()
                );
                return Some(Err(self.latch(cause)));
            }
            Read::ThresholdElapsed => {
                let cause = format!(
                    "average speed {:.0} B/s below threshold {} B/s for {:?}",
                    self.average_speed(),
                    self.monitor.threshold_speed,
                    self.monitor.threshold_duration(),
                );
                return Some(Err(self.latch(cause)));
            }
            Read::Chunk(chunk) => chunk,
        };

        let bytes = match chunk? {
            Ok(bytes) => bytes,
            Err(e) => return Some(Err(Error::from(e))),
        };

        self.total_bytes += bytes.len() as u64;
        if self.average_speed() < self.monitor.threshold_speed as f64 {
            self.debounce_deadline
                .get_or_insert_with(|| Instant::now() + self.monitor.threshold_duration());
        } else {
            self.debounce_deadline = None;
        }

        Some(Ok(bytes))
    }

    fn average_speed(&self) -> f64 {
        let elapsed = self.started_at.elapsed().as_secs_f64().max(0.001);
        self.total_bytes as f64 / elapsed
    }

    fn latch(&mut self, cause: String) -> Error {
        self.stall_cause = Some(cause.clone());
        Error::Stall(cause)
    }

    /// Total bytes read through this reader.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn is_stalled(&self) -> bool {
        self.stall_cause.is_some()
    }
}
