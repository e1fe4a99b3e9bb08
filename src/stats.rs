//! Process-wide statistics accumulator.
//!
//! One aggregate per phase, each backed by an hdrhistogram plus the raw
//! max/sum/sample-count triple that the teardown summary log reports.
//! Values only ever accumulate; nothing is reset while the process lives.
//! The accumulator is owned by the server and passed by reference to
//! whichever component records a sample.

use hdrhistogram::Histogram;
use log::error;

/// max/sum/samples plus a histogram, for one measured phase
#[derive(Debug)]
pub struct PhaseAggregate {
    histogram: Histogram<u32>,
    max: u64,
    sum: u64,
    samples: u64,
}

impl PhaseAggregate {
    fn new() -> PhaseAggregate {
        PhaseAggregate {
            // 3 significant digits is plenty for microsecond timings
            histogram: Histogram::new(3).expect("histogram parameters are static"),
            max: 0,
            sum: 0,
            samples: 0,
        }
    }

    pub fn record(&mut self, value: u64) {
        if let Err(e) = self.histogram.record(value) {
            error!("could not record sample {}: {}", value, e);
        }
        if value > self.max {
            self.max = value;
        }
        self.sum += value;
        self.samples += 1;
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn sum(&self) -> u64 {
        self.sum
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn average(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.sum as f64 / self.samples as f64
        }
    }

    pub fn p99(&self) -> u64 {
        self.histogram.value_at_percentile(99.0)
    }
}

#[derive(Debug)]
pub struct Stats {
    /// time spent accepting and setting up one client, microseconds
    pub accept: PhaseAggregate,
    /// time spent in one client-socket read callback, microseconds
    pub client_read: PhaseAggregate,
    /// time spent in one target-socket read callback, microseconds
    pub target_read: PhaseAggregate,
    /// time spent in one resolver/connector step, microseconds
    pub resolve_connect: PhaseAggregate,
    /// parsed request size, bytes
    pub request_size: PhaseAggregate,
}

impl Stats {
    pub fn new() -> Stats {
        Stats {
            accept: PhaseAggregate::new(),
            client_read: PhaseAggregate::new(),
            target_read: PhaseAggregate::new(),
            resolve_connect: PhaseAggregate::new(),
            request_size: PhaseAggregate::new(),
        }
    }

    /// one-line summary logged on every connection teardown
    pub fn summary(&self) -> String {
        format!(
            "accept [{:.2}ms max, {:.2}ms avg, {:.2}ms p99] \
             client [{:.2}ms max, {:.2}ms avg, {:.2}ms p99] \
             target [{:.2}ms max, {:.2}ms avg, {:.2}ms p99] \
             resolve+connect [{:.2}ms max, {:.2}ms avg, {:.2}ms p99] \
             request_size [{}B max, {:.0}B avg, {}B p99]",
            self.accept.max() as f64 / 1000.0,
            self.accept.average() / 1000.0,
            self.accept.p99() as f64 / 1000.0,
            self.client_read.max() as f64 / 1000.0,
            self.client_read.average() / 1000.0,
            self.client_read.p99() as f64 / 1000.0,
            self.target_read.max() as f64 / 1000.0,
            self.target_read.average() / 1000.0,
            self.target_read.p99() as f64 / 1000.0,
            self.resolve_connect.max() as f64 / 1000.0,
            self.resolve_connect.average() / 1000.0,
            self.resolve_connect.p99() as f64 / 1000.0,
            self.request_size.max(),
            self.request_size.average(),
            self.request_size.p99(),
        )
    }
}

impl Default for Stats {
    fn default() -> Stats {
        Stats::new()
    }
}
