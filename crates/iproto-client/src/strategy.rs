//! Selection strategies.
//!
//! A strategy picks the index of the next candidate out of an ordered
//! sequence. Strategies never block and never see the candidates
//! themselves, so they cannot mutate them; pools filter the sequence down to
//! ready connections before asking.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;

use iproto_common::protocol::error::Error;

pub trait SelectionStrategy: Send + Sync + fmt::Debug {
    /// Index of the next candidate out of `len`, or `None` when `len` is 0.
    fn next_index(&self, len: usize) -> Option<usize>;
}

impl dyn SelectionStrategy {
    /// Picks the next element of `candidates`.
    pub fn next<'a, T>(&self, candidates: &'a [T]) -> Option<&'a T> {
        self.next_index(candidates.len())
            .and_then(|index| candidates.get(index))
    }
}

/// Round-robin over a shared cursor.
///
/// Every call takes a distinct cursor value, so concurrent callers spread
/// over the candidates instead of piling onto the same one.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SelectionStrategy for RoundRobin {
    fn next_index(&self, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        Some(self.cursor.fetch_add(1, Ordering::Relaxed) % len)
    }
}

/// Round-robin with one cursor per shard of calling threads.
///
/// Threads hash onto shards so that hot pools do not contend on a single
/// cursor. Each shard starts at its own offset; fairness across candidates
/// is approximate.
#[derive(Debug)]
pub struct ParallelRoundRobin {
    shards: Box<[AtomicUsize]>,
}

impl ParallelRoundRobin {
    pub fn new() -> Self {
        let shards = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self::with_shards(shards)
    }

    pub fn with_shards(shards: usize) -> Self {
        let shards = (0..shards.max(1)).map(AtomicUsize::new).collect();
        Self { shards }
    }

    fn shard(&self) -> &AtomicUsize {
        let mut hasher = DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        let index = hasher.finish() as usize % self.shards.len();
        &self.shards[index]
    }
}

impl Default for ParallelRoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionStrategy for ParallelRoundRobin {
    fn next_index(&self, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        Some(self.shard().fetch_add(1, Ordering::Relaxed) % len)
    }
}

/// Uniformly random choice.
#[derive(Debug, Default)]
pub struct Random;

impl SelectionStrategy for Random {
    fn next_index(&self, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        Some(rand::thread_rng().gen_range(0..len))
    }
}

/// Strategy choice as it appears in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategyKind {
    RoundRobin,
    ParallelRoundRobin,
    Random,
}

impl SelectionStrategyKind {
    pub fn build(self) -> Arc<dyn SelectionStrategy> {
        match self {
            SelectionStrategyKind::RoundRobin => Arc::new(RoundRobin::new()),
            SelectionStrategyKind::ParallelRoundRobin => Arc::new(ParallelRoundRobin::new()),
            SelectionStrategyKind::Random => Arc::new(Random),
        }
    }
}

impl FromStr for SelectionStrategyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round-robin" => Ok(SelectionStrategyKind::RoundRobin),
            "parallel-round-robin" => Ok(SelectionStrategyKind::ParallelRoundRobin),
            "random" => Ok(SelectionStrategyKind::Random),
            other => Err(Error::Config(format!(
                "unknown selection strategy '{}'",
                other
            ))),
        }
    }
}
