use std::collections::{BTreeMap, VecDeque};
use std::iter::Peekable;

use bytes::Bytes;
use crossbeam_channel::{Receiver, bounded};
use tracing::{debug, warn};

use super::{
    Counts, FirstError, IndexInfo, IndexStream, ShardCandidate, StreamContext, candidate_at,
};
use crate::codec::Serializable;
use crate::error::{PlanError, PlanResult};
use crate::pool::WorkerPool;
use crate::query::Node;
use crate::shard::{day_of, precedes};
use crate::store::layout::{UidList, shard_of};
use crate::store::{Key, Scanner, StoreResult};

pub type CandidateIter = Box<dyn Iterator<Item = ShardCandidate> + Send>;

type PendingScan = Box<dyn FnOnce() -> PlanResult<CandidateIter> + Send>;

/// Stream over a single term.
pub struct ScannerStream {
    node: Node,
    context: StreamContext,
    pending: Option<PendingScan>,
    source: Option<CandidateIter>,
    head: Option<ShardCandidate>,
    errors: FirstError,
}

impl ScannerStream {
    fn with_context(node: Node, context: StreamContext) -> Self {
        Self {
            node,
            context,
            pending: None,
            source: None,
            head: None,
            errors: FirstError::new(),
        }
    }

    /// A term whose store scan runs on the first [`IndexStream::initialize`].
    pub fn initialized<F>(node: Node, errors: FirstError, scan: F) -> Self
    where
        F: FnOnce() -> PlanResult<CandidateIter> + Send + 'static,
    {
        Self {
            pending: Some(Box::new(scan)),
            errors,
            ..Self::with_context(node, StreamContext::Initialized)
        }
    }

    /// Already-known candidates; `Absent` when there are none.
    pub fn with_data(node: Node, mut source: CandidateIter) -> Self {
        let head = source.next();
        let context = if head.is_some() {
            StreamContext::Present
        } else {
            StreamContext::Absent
        };
        Self {
            source: Some(source),
            head,
            ..Self::with_context(node, context)
        }
    }

    pub fn delayed(node: Node) -> Self {
        Self::with_context(node, StreamContext::Delayed)
    }

    pub fn no_data(node: Node) -> Self {
        Self::with_context(node, StreamContext::Absent)
    }

    pub fn no_op(node: Node) -> Self {
        Self::with_context(node, StreamContext::NoOp)
    }
}

impl IndexStream for ScannerStream {
    fn context(&self) -> StreamContext {
        self.context
    }

    fn context_debug(&self) -> String {
        format!("ScannerStream ({}): {}", self.context, self.node)
    }

    fn current_node(&self) -> &Node {
        &self.node
    }

    fn initialize(&mut self) {
        if self.context != StreamContext::Initialized {
            return;
        }
        let Some(scan) = self.pending.take() else {
            self.context = StreamContext::Absent;
            return;
        };
        match scan() {
            Ok(mut source) => {
                self.head = source.next();
                self.source = Some(source);
                self.context = if self.head.is_some() {
                    StreamContext::Present
                } else {
                    StreamContext::Absent
                };
            }
            Err(PlanError::Store(e)) => {
                warn!(node = %self.node, error = %e, "index lookup failed, deferring term");
                self.context = StreamContext::Delayed;
            }
            Err(e) => {
                self.errors.record(e);
                self.context = StreamContext::Absent;
            }
        }
        debug!(node = %self.node, context = %self.context, "initialized term stream");
    }

    fn peek(&mut self) -> Option<&ShardCandidate> {
        if self.context == StreamContext::Initialized {
            self.initialize();
        }
        self.head.as_ref()
    }

    fn advance(&mut self) -> Option<ShardCandidate> {
        if self.context == StreamContext::Initialized {
            self.initialize();
        }
        let current = self.head.take()?;
        self.head = self.source.as_mut().and_then(Iterator::next);
        Some(current)
    }

    fn seek(&mut self, shard: &str) -> Option<String> {
        while precedes(&self.peek()?.shard, shard) {
            self.advance();
        }
        self.head.as_ref().map(|head| head.shard.clone())
    }

    fn next_with_context(&mut self, reference: &str) -> Option<ShardCandidate> {
        match self.context {
            StreamContext::Delayed => Some(ShardCandidate::new(
                reference,
                IndexInfo::unknown(self.node.clone()),
            )),
            StreamContext::Present | StreamContext::Initialized => candidate_at(self, reference),
            _ => None,
        }
    }
}

struct Fetched {
    scanner: Box<dyn Scanner>,
    entries: StoreResult<Vec<(Key, Bytes)>>,
    exhausted: bool,
}

fn fetch(mut scanner: Box<dyn Scanner>, batch_size: usize) -> Fetched {
    let mut entries = Vec::with_capacity(batch_size);
    let mut exhausted = false;
    while entries.len() < batch_size {
        match scanner.next_entry() {
            Ok(Some(entry)) => entries.push(entry),
            Ok(None) => {
                exhausted = true;
                break;
            }
            Err(e) => {
                return Fetched {
                    scanner,
                    entries: Err(e),
                    exhausted: true,
                };
            }
        }
    }
    Fetched {
        scanner,
        entries: Ok(entries),
        exhausted,
    }
}

/// Store entries pulled in batches. The first batch is read by the caller
/// (already a worker); every later batch is prefetched on `pool` while the
/// previous one is consumed.
pub struct BatchedScan {
    buffer: VecDeque<(Key, Bytes)>,
    pending: Option<Receiver<Fetched>>,
    pool: WorkerPool,
    batch_size: usize,
    errors: FirstError,
}

impl BatchedScan {
    pub fn open(
        scanner: Box<dyn Scanner>,
        pool: WorkerPool,
        batch_size: usize,
        errors: FirstError,
    ) -> PlanResult<Self> {
        let batch_size = batch_size.max(1);
        let mut scan = Self {
            buffer: VecDeque::with_capacity(batch_size),
            pending: None,
            pool,
            batch_size,
            errors,
        };
        scan.accept(fetch(scanner, batch_size))?;
        Ok(scan)
    }

    fn accept(&mut self, fetched: Fetched) -> PlanResult<()> {
        self.buffer.extend(fetched.entries?);
        if !fetched.exhausted {
            self.request(fetched.scanner);
        }
        Ok(())
    }

    fn request(&mut self, scanner: Box<dyn Scanner>) {
        let (tx, rx) = bounded(1);
        let batch_size = self.batch_size;
        match self.pool.submit(move || {
            let _ = tx.send(fetch(scanner, batch_size));
        }) {
            Ok(()) => self.pending = Some(rx),
            Err(e) => debug!(error = %e, "stopping scan, batch pool closed"),
        }
    }
}

impl Iterator for BatchedScan {
    type Item = (Key, Bytes);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.buffer.pop_front() {
                return Some(entry);
            }
            let fetched = self.pending.take()?.recv().ok()?;
            if let Err(e) = self.accept(fetched) {
                self.errors.record(e);
                return None;
            }
        }
    }
}

fn decode_uids(value: &[u8], node: &Node, errors: &FirstError) -> Option<IndexInfo> {
    match UidList::from_bytes(value) {
        Ok(list) => {
            let counts = Counts::single(node, list.count);
            let info = if list.ignore {
                IndexInfo::unknown(node.clone())
            } else {
                IndexInfo::exact(list.uids, node.clone())
            };
            Some(info.with_counts(counts))
        }
        Err(e) => {
            errors.record(e.into());
            None
        }
    }
}

/// Shard index entries of one term turned into candidates, merging the
/// per-datatype entries of a shard.
pub struct TermCandidates {
    entries: Peekable<BatchedScan>,
    node: Node,
    errors: FirstError,
}

impl TermCandidates {
    pub fn new(entries: BatchedScan, node: Node, errors: FirstError) -> Self {
        Self {
            entries: entries.peekable(),
            node,
            errors,
        }
    }
}

impl Iterator for TermCandidates {
    type Item = ShardCandidate;

    fn next(&mut self) -> Option<ShardCandidate> {
        loop {
            let (key, value) = self.entries.next()?;
            let shard = shard_of(&key).to_string();
            let mut info = decode_uids(&value, &self.node, &self.errors)?;
            while self
                .entries
                .peek()
                .is_some_and(|(next, _)| shard_of(next) == shard)
            {
                let (_, value) = self.entries.next()?;
                let more = decode_uids(&value, &self.node, &self.errors)?;
                info = IndexInfo::union(vec![info, more], &[]);
            }
            if !info.is_empty() {
                return Some(ShardCandidate::new(shard, info));
            }
        }
    }
}

/// Candidates for a bounded range: every term between the bounds, merged per
/// shard and restricted to shards of `[begin_day, end_day]`. Range scans come
/// back in term order, so the whole result is gathered before streaming.
pub fn bounded_range_candidates(
    entries: impl Iterator<Item = (Key, Bytes)>,
    node: &Node,
    begin_day: &str,
    end_day: &str,
) -> PlanResult<CandidateIter> {
    let mut shards: BTreeMap<String, IndexInfo> = BTreeMap::new();
    for (key, value) in entries {
        let shard = shard_of(&key);
        let day = day_of(shard);
        if day < begin_day || day > end_day {
            continue;
        }
        let list = UidList::from_bytes(&value)?;
        let counts = Counts::single(node, list.count);
        let info = if list.ignore {
            IndexInfo::unknown(node.clone())
        } else {
            IndexInfo::exact(list.uids, node.clone())
        }
        .with_counts(counts);
        let merged = match shards.remove(shard) {
            Some(existing) => IndexInfo::union(vec![existing, info], &[]),
            None => info,
        };
        shards.insert(shard.to_string(), merged);
    }
    Ok(Box::new(
        shards
            .into_iter()
            .filter(|(_, info)| !info.is_empty())
            .map(|(shard, info)| ShardCandidate::new(shard, info)),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates(shards: &[&str]) -> CandidateIter {
        let node = Node::equals("A", "1");
        let items: Vec<ShardCandidate> = shards
            .iter()
            .map(|s| ShardCandidate::new(*s, IndexInfo::exact(["u1"], node.clone())))
            .collect();
        Box::new(items.into_iter())
    }

    #[test]
    fn test_with_data_contexts() {
        let present = ScannerStream::with_data(Node::equals("A", "1"), candidates(&["20240101_0"]));
        assert_eq!(present.context(), StreamContext::Present);
        let absent = ScannerStream::with_data(Node::equals("A", "1"), candidates(&[]));
        assert_eq!(absent.context(), StreamContext::Absent);
    }

    #[test]
    fn test_seek_is_day_aware() {
        let mut stream = ScannerStream::with_data(
            Node::equals("A", "1"),
            candidates(&["20240101_1", "20240102", "20240103_4"]),
        );
        assert_eq!(stream.seek("20240102_7").as_deref(), Some("20240102"));
        assert_eq!(stream.seek("20240102_9").as_deref(), Some("20240102"));
        assert_eq!(stream.seek("20240103_0").as_deref(), Some("20240103_4"));
        assert_eq!(stream.seek("20240104"), None);
    }

    #[test]
    fn test_next_with_context() {
        let mut delayed = ScannerStream::delayed(Node::regex("R", "x.*"));
        let candidate = delayed.next_with_context("20240101_2").unwrap();
        assert_eq!(candidate.shard, "20240101_2");
        assert_eq!(candidate.info.count(), None);

        let mut day = ScannerStream::with_data(Node::equals("A", "1"), candidates(&["20240101"]));
        assert_eq!(day.next_with_context("20240101_2").unwrap().shard, "20240101_2");
        assert_eq!(day.next_with_context("20240101_5").unwrap().shard, "20240101_5");
        assert!(day.next_with_context("20240102_0").is_none());

        assert!(ScannerStream::no_data(Node::False).next_with_context("20240101_0").is_none());
    }

    #[test]
    fn test_store_failure_degrades_to_delayed() {
        let errors = FirstError::new();
        let mut stream = ScannerStream::initialized(Node::equals("A", "1"), errors.clone(), || {
            Err(crate::store::StoreError::Unavailable("shardIndex".into()).into())
        });
        assert_eq!(stream.context(), StreamContext::Initialized);
        stream.initialize();
        assert_eq!(stream.context(), StreamContext::Delayed);
        assert!(!errors.is_set());
    }

    #[test]
    fn test_bounded_range_merges_terms_per_shard() {
        use crate::store::layout::shard_index_key;
        let node = Node::range("NUM", "1", "5");
        let entries = vec![
            (shard_index_key("1", "NUM", "20240102_0", "csv"), UidList::exact(["u1"]).to_bytes()),
            (shard_index_key("2", "NUM", "20240101_3", "csv"), UidList::exact(["u2"]).to_bytes()),
            (shard_index_key("2", "NUM", "20240102_0", "csv"), UidList::exact(["u3"]).to_bytes()),
            (shard_index_key("3", "NUM", "20231231_0", "csv"), UidList::exact(["u4"]).to_bytes()),
        ];
        let out: Vec<ShardCandidate> = bounded_range_candidates(
            entries.into_iter().map(|(k, v)| (k, Bytes::from(v))),
            &node,
            "20240101",
            "20240102",
        )
        .unwrap()
        .collect();
        let shards: Vec<&str> = out.iter().map(|c| c.shard.as_str()).collect();
        assert_eq!(shards, vec!["20240101_3", "20240102_0"]);
        assert_eq!(out[1].info.count(), Some(2));
    }
}
