// SPDX-License-Identifier: MIT OR Apache-2.0

//! Worker-count limits and inter-batch pacing for indexing.

use serde::Deserialize;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Requested worker count as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(from = "RawWorkerRequest")]
pub enum WorkerRequest {
    /// Half of the available CPUs, at least one.
    #[default]
    Auto,
    /// An explicit positive worker count.
    Count(usize),
    /// Anything else; resolves to `Auto` with a warning.
    Invalid(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawWorkerRequest {
    Number(i64),
    Text(String),
}

impl From<RawWorkerRequest> for WorkerRequest {
    fn from(raw: RawWorkerRequest) -> Self {
        match raw {
            RawWorkerRequest::Number(n) if n >= 1 => WorkerRequest::Count(n as usize),
            RawWorkerRequest::Number(n) => WorkerRequest::Invalid(n.to_string()),
            RawWorkerRequest::Text(text) => text.parse().unwrap_or(WorkerRequest::Auto),
        }
    }
}

impl FromStr for WorkerRequest {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim();
        if value.eq_ignore_ascii_case("auto") {
            return Ok(WorkerRequest::Auto);
        }
        Ok(match value.parse::<usize>() {
            Ok(n) if n >= 1 => WorkerRequest::Count(n),
            _ => WorkerRequest::Invalid(value.to_string()),
        })
    }
}

impl fmt::Display for WorkerRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerRequest::Auto => f.write_str("auto"),
            WorkerRequest::Count(n) => write!(f, "{}", n),
            WorkerRequest::Invalid(raw) => f.write_str(raw),
        }
    }
}

/// Computes safe concurrency limits and paces batches of work.
///
/// Read-only after construction, so one instance can be shared by every
/// worker.
#[derive(Debug, Clone)]
pub struct ResourceThrottle {
    max_workers: usize,
    batch_delay: Duration,
}

impl ResourceThrottle {
    /// Builds a throttle from the host CPU count.
    pub fn new(requested: &WorkerRequest, batch_delay: Duration) -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::with_cpu_count(cpus, requested, batch_delay)
    }

    /// Builds a throttle for an explicit CPU count.
    pub fn with_cpu_count(cpus: usize, requested: &WorkerRequest, batch_delay: Duration) -> Self {
        let auto = (cpus / 2).max(1);
        let max_workers = match requested {
            WorkerRequest::Auto => auto,
            WorkerRequest::Count(n) => (*n).clamp(1, cpus.max(1)),
            WorkerRequest::Invalid(raw) => {
                tracing::warn!("Invalid max_workers: {}, using auto", raw);
                auto
            }
        };

        tracing::debug!(
            "Throttle: batch delay {}ms, max workers {}",
            batch_delay.as_millis(),
            max_workers
        );

        Self {
            max_workers,
            batch_delay,
        }
    }

    /// Maximum number of concurrent workers.
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Worker count for a request, never above `max_workers`.
    pub fn worker_count(&self, requested: Option<usize>) -> usize {
        match requested {
            Some(n) => n.clamp(1, self.max_workers),
            None => self.max_workers,
        }
    }

    /// Delay applied after each unit of work.
    pub fn batch_delay(&self) -> Duration {
        self.batch_delay
    }

    /// Runs `work`, then sleeps for the batch delay unless `cancel` is set.
    ///
    /// A cancellation that arrives during the sleep cuts it short.
    pub async fn pace<F, T>(&self, work: F, cancel: &CancellationToken) -> T
    where
        F: Future<Output = T>,
    {
        let output = work.await;
        if !cancel.is_cancelled() && !self.batch_delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(self.batch_delay) => {}
            }
        }
        output
    }
}
