use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

/// How a pool picks the worker for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStrategy {
    /// Uniformly random live worker
    #[default]
    RandomWorker,
    /// Rotate through live workers
    RoundRobin,
    /// Live worker with the fewest requests in flight
    LeastLoaded,
}

impl DispatchStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            DispatchStrategy::RandomWorker => "random_worker",
            DispatchStrategy::RoundRobin => "round_robin",
            DispatchStrategy::LeastLoaded => "least_loaded",
        }
    }
}

impl fmt::Display for DispatchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DispatchStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "random_worker" | "random" => Ok(DispatchStrategy::RandomWorker),
            "round_robin" | "roundrobin" => Ok(DispatchStrategy::RoundRobin),
            "least_loaded" | "leastloaded" => Ok(DispatchStrategy::LeastLoaded),
            _ => anyhow::bail!(
                "unknown dispatch strategy: {} (expected random_worker, round_robin or least_loaded)",
                s
            ),
        }
    }
}

/// Picks among live workers
///
/// Callers pass the in-flight load of each live candidate and get back a
/// position in that slice.
#[derive(Debug, Default)]
pub struct Dispatcher {
    counter: AtomicUsize,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(&self, strategy: DispatchStrategy, loads: &[usize]) -> Option<usize> {
        if loads.is_empty() {
            return None;
        }

        match strategy {
            DispatchStrategy::RandomWorker => Some(rand::thread_rng().gen_range(0..loads.len())),
            DispatchStrategy::RoundRobin => {
                Some(self.counter.fetch_add(1, Ordering::Relaxed) % loads.len())
            }
            DispatchStrategy::LeastLoaded => loads
                .iter()
                .enumerate()
                .min_by_key(|(_, load)| **load)
                .map(|(idx, _)| idx),
        }
    }
}
