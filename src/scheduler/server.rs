//! Per-server calibration statistics.

use crate::scheduler::{average::RunningAverage, request::Request};

/// Outcome of completion accounting on a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    /// Every request dispatched in the current batch has completed; the
    /// server may rejoin an idle pool.
    Drained,
    /// The server still has outstanding work.
    Busy,
}

/// Calibration record for one downstream server.
///
/// `in_flight` counts dispatches in the current batch, `completed_in_batch`
/// the completions; both reset together when the batch drains.
/// `response_time` averages service durations in milliseconds over the
/// server's lifetime. `per_byte_rate` averages `service_time / size`, but
/// only over completions where the server was servicing that request alone
/// and the size was known, so the sample is never contaminated by queueing.
#[derive(Debug, Clone)]
pub struct ServerStatistic {
    name: String,
    in_flight: u32,
    completed_in_batch: u32,
    response_time: RunningAverage,
    per_byte_rate: RunningAverage,
}

impl ServerStatistic {
    pub(crate) fn new(name: String) -> Self {
        Self {
            name,
            in_flight: 0,
            completed_in_batch: 0,
            response_time: RunningAverage::new(),
            per_byte_rate: RunningAverage::new(),
        }
    }

    /// Opaque routing label the downstream understands.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Outstanding dispatched-not-completed requests.
    #[inline]
    pub const fn active(&self) -> u32 {
        self.in_flight - self.completed_in_batch
    }

    /// Mean service duration in milliseconds, if sampled.
    #[inline]
    pub fn response_time(&self) -> Option<f64> {
        self.response_time.query()
    }

    /// Mean milliseconds per declared byte, if sampled.
    #[inline]
    pub fn per_byte_rate(&self) -> Option<f64> {
        self.per_byte_rate.query()
    }

    /// True once at least one clean per-byte sample exists.
    #[inline]
    pub fn is_calibrated(&self) -> bool {
        self.per_byte_rate.valid()
    }

    /// Dispatch accounting: stamps the start time and takes the request
    /// into the current batch.
    pub(crate) fn process(&mut self, request: &mut Request, now: u64) {
        request.start(now);
        self.in_flight += 1;
    }

    /// Completion accounting. Records the service-time sample, and a
    /// per-byte sample when the batch held exactly this one sized request.
    /// Returns whether the batch drained.
    pub(crate) fn record(&mut self, request: &mut Request, now: u64) -> BatchStatus {
        request.complete(now);
        self.completed_in_batch += 1;

        if let Some(service_time) = request.service_time() {
            self.response_time.record(service_time as f64);

            // A clean sample: the server worked on this request alone.
            if self.in_flight == 1 && self.completed_in_batch == 1 && request.is_sized() {
                self.per_byte_rate
                    .record(service_time as f64 / request.size() as f64);
            }
        }

        match self.in_flight == self.completed_in_batch {
            true => {
                self.in_flight = 0;
                self.completed_in_batch = 0;
                BatchStatus::Drained
            }
            false => BatchStatus::Busy,
        }
    }
}
