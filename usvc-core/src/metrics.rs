//! Per-connection traffic metrics and the reporters that consume them.
//!
//! One [`SessionMetrics`] record covers exactly one accepted connection. It is
//! created when the session starts and handed to the configured [`Reporter`]
//! once, when the session loop ends. When the reporter is disabled the
//! session skips collection entirely.
use std::time::{Duration, Instant};

use serde::{ser::SerializeStruct, Serialize, Serializer};
use tracing::{info, warn};

/// Opaque identifier of the underlying connection, the native descriptor on unix.
pub type ConnectionHandle = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionMetrics {
    pub connection_handle: ConnectionHandle,
    /// Completed request/response exchanges.
    pub request_count: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub start_time: Instant,
    pub end_time: Instant,
}

impl SessionMetrics {
    pub fn start(connection_handle: ConnectionHandle) -> Self {
        let now = Instant::now();
        Self {
            connection_handle,
            request_count: 0,
            bytes_read: 0,
            bytes_written: 0,
            start_time: now,
            end_time: now,
        }
    }

    /// Stamp the end of the session.
    pub fn finish(&mut self) {
        self.end_time = Instant::now().max(self.start_time);
    }

    #[inline]
    pub fn duration(&self) -> Duration {
        self.end_time.saturating_duration_since(self.start_time)
    }
}

impl Serialize for SessionMetrics {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut record = serializer.serialize_struct("SessionMetrics", 5)?;
        record.serialize_field("connection_handle", &self.connection_handle)?;
        record.serialize_field("request_count", &self.request_count)?;
        record.serialize_field("bytes_read", &self.bytes_read)?;
        record.serialize_field("bytes_written", &self.bytes_written)?;
        record.serialize_field("duration", &self.duration().as_secs_f64())?;
        record.end()
    }
}

/// Consumer of completed [`SessionMetrics`] records.
///
/// `()` is the absent reporter: it reports nothing and disables collection.
/// `Option<R>` turns a reporter on or off at run time.
pub trait Reporter {
    fn report(&self, metrics: &SessionMetrics);

    /// Whether sessions should collect metrics at all.
    #[inline]
    fn enabled(&self) -> bool {
        true
    }
}

impl Reporter for () {
    #[inline]
    fn report(&self, _metrics: &SessionMetrics) {}

    #[inline]
    fn enabled(&self) -> bool {
        false
    }
}

impl<R: Reporter> Reporter for Option<R> {
    #[inline]
    fn report(&self, metrics: &SessionMetrics) {
        if let Some(reporter) = self {
            reporter.report(metrics);
        }
    }

    #[inline]
    fn enabled(&self) -> bool {
        self.as_ref().is_some_and(|r| r.enabled())
    }
}

#[derive(Clone)]
pub struct ReporterFn<F> {
    f: F,
}

/// Use a closure as a [`Reporter`].
pub fn reporter_fn<F>(f: F) -> ReporterFn<F>
where
    F: Fn(&SessionMetrics),
{
    ReporterFn { f }
}

impl<F> Reporter for ReporterFn<F>
where
    F: Fn(&SessionMetrics),
{
    #[inline]
    fn report(&self, metrics: &SessionMetrics) {
        (self.f)(metrics)
    }
}

/// Emits every record as one JSON line on the `usvc::metrics` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn report(&self, metrics: &SessionMetrics) {
        match serde_json::to_string(metrics) {
            Ok(json) => info!(target: "usvc::metrics", "{json}"),
            Err(e) => warn!("serialize session metrics failed: {e}"),
        }
    }
}
