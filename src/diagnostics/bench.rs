//! Benchmark reports

use std::time::Duration;

/// Outcome of a multi-threaded key/value query run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueryBenchmark {
    pub threads: usize,
    pub queries: u64,
    /// Queries that found a checksum match
    pub hits: u64,
    pub elapsed: Duration,
}

impl QueryBenchmark {
    pub fn queries_per_second(&self) -> f64 {
        rate(self.queries, self.elapsed)
    }

    pub fn queries_per_second_per_thread(&self) -> f64 {
        self.queries_per_second() / self.threads.max(1) as f64
    }
}

/// Outcome of pulling from one or more append logs
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PullBenchmark {
    pub logs: usize,
    pub pulls_per_log: u64,
    pub elapsed: Duration,
}

impl PullBenchmark {
    pub fn total_pulls(&self) -> u64 {
        self.pulls_per_log * self.logs as u64
    }

    pub fn pulls_per_second(&self) -> f64 {
        rate(self.total_pulls(), self.elapsed)
    }
}

fn rate(count: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs == 0.0 {
        return 0.0;
    }
    count as f64 / secs
}
