//! Lazily merged per-shard candidate streams.
//!
//! Every leaf term of a query becomes an [`IndexStream`] of shard ids in
//! ascending order. [`Union`] and [`Intersection`] combine child streams with
//! sorted merges. Each stream also reports a [`StreamContext`] describing
//! how far its shard membership can be trusted.

mod enumerator;
mod info;
mod init;
mod intersection;
mod scanner;
mod union;

pub use enumerator::{Granularity, HintEnumerator, ShardEnumerator};
pub use info::{Counts, IndexInfo, Matches};
pub use init::{Initialized, initialize_children};
pub use intersection::Intersection;
pub use scanner::{
    BatchedScan, CandidateIter, ScannerStream, TermCandidates, bounded_range_candidates,
};
pub use union::Union;

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::PlanError;
use crate::query::Node;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamContext {
    /// Not pulled from the store yet.
    Initialized,
    /// The index confirms at least one matching shard.
    Present,
    /// The index confirms there is none.
    Absent,
    /// Some children resolved against the index, some could not.
    Variable,
    /// Absorbed into a parent of the same kind.
    NoOp,
    /// Cannot be answered by the index; assumed present everywhere.
    Delayed,
}

impl fmt::Display for StreamContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamContext::Initialized => "INITIALIZED",
            StreamContext::Present => "PRESENT",
            StreamContext::Absent => "ABSENT",
            StreamContext::Variable => "VARIABLE",
            StreamContext::NoOp => "NO_OP",
            StreamContext::Delayed => "DELAYED",
        };
        f.write_str(name)
    }
}

/// A shard (or whole day) that may hold matches, with what is known about it.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardCandidate {
    pub shard: String,
    pub info: IndexInfo,
}

impl ShardCandidate {
    pub fn new(shard: impl Into<String>, info: IndexInfo) -> Self {
        Self {
            shard: shard.into(),
            info,
        }
    }
}

/// Peekable, forward-only stream of candidates in ascending shard order.
pub trait IndexStream: Send {
    fn context(&self) -> StreamContext;

    /// One-line description of this stream and its children for logs.
    fn context_debug(&self) -> String;

    fn current_node(&self) -> &Node;

    /// Resolve an `Initialized` stream against the store. Other streams
    /// are already resolved and ignore this.
    fn initialize(&mut self) {}

    fn peek(&mut self) -> Option<&ShardCandidate>;

    fn advance(&mut self) -> Option<ShardCandidate>;

    /// Move to the first candidate that does not precede `shard` and return
    /// its id, or `None` at the end.
    fn seek(&mut self, shard: &str) -> Option<String>;

    /// Candidate for exactly `reference`, supplied by a parent that already
    /// chose the shard. Streams without positions of their own answer with
    /// their deferred terms.
    fn next_with_context(&mut self, reference: &str) -> Option<ShardCandidate>;
}

pub type BoxedStream = Box<dyn IndexStream>;

impl fmt::Debug for dyn IndexStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.context_debug())
    }
}

/// First error raised by any stream of a planning run. Streams cannot return
/// errors mid-iteration, so they park them here and end early; the plan
/// iterator surfaces the error.
#[derive(Clone, Default)]
pub struct FirstError {
    slot: Arc<Mutex<Option<PlanError>>>,
}

impl FirstError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, error: PlanError) {
        let mut slot = self.slot.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    pub fn take(&self) -> Option<PlanError> {
        self.slot.lock().take()
    }

    pub fn is_set(&self) -> bool {
        self.slot.lock().is_some()
    }
}

/// Candidate for `reference` from a positioned stream: an exact hit is
/// consumed, a covering day is copied and kept.
pub(crate) fn candidate_at(stream: &mut dyn IndexStream, reference: &str) -> Option<ShardCandidate> {
    stream.seek(reference)?;
    let head = stream.peek()?;
    if head.shard == reference {
        stream.advance()
    } else if crate::shard::covers(&head.shard, reference) {
        Some(ShardCandidate::new(reference, head.info.clone()))
    } else {
        None
    }
}
