//! Index lookups composed along the query tree.
//!
//! Every leaf becomes a [`ScannerStream`], every `And`/`Or` an
//! [`Intersection`]/[`Union`] over its children. The resulting top-level
//! stream is drained into [`QueryPlan`]s.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, trace};

use super::num_shards::NumShardCache;
use super::plan::QueryPlan;
use crate::config::PlanningConfig;
use crate::error::{PlanError, PlanResult};
use crate::pool::WorkerPool;
use crate::query::{DATATYPE_FIELD, Marker, Node, SHARD_DAY_HINT, depth, flatten, is_unfielded};
use crate::store::layout::term_range;
use crate::store::{DATATYPE_FILTER, Key, Range, Scanner};
use crate::stream::{
    BatchedScan, BoxedStream, CandidateIter, FirstError, Granularity, HintEnumerator, IndexStream,
    Initialized, Intersection, ScannerStream, ShardEnumerator, StreamContext, TermCandidates,
    Union, bounded_range_candidates, initialize_children,
};

/// Flattens the tree and rejects it when it is too deep to visit.
pub(crate) fn prepare(node: &Node, max_depth: usize) -> PlanResult<Node> {
    let flat = flatten(node);
    let found = depth(&flat, max_depth);
    if found > max_depth {
        return Err(PlanError::DepthExceeded {
            depth: found,
            max: max_depth,
        });
    }
    Ok(flat)
}

/// Where a node sits, so a child of the same kind can hand its streams
/// straight to the parent.
enum Parent<'a> {
    None,
    Union(&'a mut Vec<BoxedStream>),
    Intersection(&'a mut Vec<BoxedStream>),
}

pub struct RangeStream {
    config: Arc<PlanningConfig>,
    shards: Arc<NumShardCache>,
}

impl RangeStream {
    pub fn new(config: Arc<PlanningConfig>, shards: Arc<NumShardCache>) -> Self {
        Self { config, shards }
    }

    /// Builds the stream tree for `node` and returns its plans. Fatal
    /// planning errors are returned here; errors met while iterating come
    /// out of the iterator.
    pub fn stream_plans(&self, node: &Node) -> PlanResult<RangePlans> {
        let lookup = &self.config.settings().lookup;
        let tree = prepare(node, lookup.max_depth_threshold)?;

        let init_threads = lookup.num_index_lookup_threads.max(1);
        let init_pool = WorkerPool::new("index-lookup", init_threads, init_threads * 4)?;
        let stream_threads = (lookup.num_index_lookup_threads / 2).max(1);
        let stream_pool = match WorkerPool::new("index-batch", stream_threads, stream_threads * 4) {
            Ok(pool) => pool,
            Err(e) => {
                init_pool.shutdown_now();
                return Err(e);
            }
        };

        let errors = FirstError::new();
        let builder = TreeBuilder {
            config: &self.config,
            shards: &self.shards,
            errors: &errors,
            init_pool: &init_pool,
            stream_pool: &stream_pool,
        };
        let built = builder.build(&tree);
        init_pool.shutdown_now();
        let root = match built {
            Ok(root) => root,
            Err(e) => {
                stream_pool.shutdown_now();
                return Err(e);
            }
        };

        let context = root.context();
        debug!(stream = %root.context_debug(), "built index stream");
        let (root, context) = match context {
            StreamContext::Present => (Some(root), context),
            StreamContext::Variable if matches!(tree, Node::And { marker: None, .. }) => {
                debug!(node = %tree, "top-level intersection of variable terms, treating as present");
                (Some(root), StreamContext::Present)
            }
            StreamContext::Variable => {
                debug!(node = %tree, "top-level term cannot be resolved by the index, no plans");
                (None, StreamContext::Absent)
            }
            other => (None, other),
        };
        if root.is_none() {
            stream_pool.shutdown_now();
        }

        Ok(RangePlans {
            root,
            context,
            config: Arc::clone(&self.config),
            errors,
            stream_pool,
            done: false,
        })
    }
}

struct TreeBuilder<'a> {
    config: &'a Arc<PlanningConfig>,
    shards: &'a Arc<NumShardCache>,
    errors: &'a FirstError,
    init_pool: &'a WorkerPool,
    stream_pool: &'a WorkerPool,
}

impl TreeBuilder<'_> {
    fn build(&self, tree: &Node) -> PlanResult<BoxedStream> {
        let root = self.visit(tree, Parent::None)?;
        match initialize_children(vec![root], Some(self.init_pool), false)? {
            Initialized::All(mut ready) => ready
                .pop()
                .ok_or_else(|| PlanError::Internal("root stream was lost".into())),
            Initialized::ShortCircuit(root) => Ok(root),
        }
    }

    fn visit(&self, node: &Node, parent: Parent<'_>) -> PlanResult<BoxedStream> {
        let stream: BoxedStream = match node {
            Node::Equality { field, literal } => self.equality(node, field, literal.as_deref()),
            Node::Range { field, .. } | Node::Compare { field, .. } | Node::Regex { field, .. } => {
                if is_unfielded(field) {
                    no_data(node)
                } else {
                    delayed(node)
                }
            }
            Node::Not(_) | Node::Function { .. } | Node::True => delayed(node),
            Node::False => no_data(node),
            Node::Assignment { name, value } if name == SHARD_DAY_HINT => {
                let hinted = HintEnumerator::new(node.clone(), value, self.shards);
                Box::new(ScannerStream::with_data(node.clone(), Box::new(hinted)))
            }
            Node::Assignment { .. } => Box::new(ScannerStream::no_op(node.clone())),
            Node::And {
                children,
                marker: Some(marker),
            } => self.marked(node, *marker, children)?,
            Node::And {
                children,
                marker: None,
            } => return self.intersection(node, children, parent),
            Node::Or { children } => return self.union(node, children, parent),
        };
        Ok(stream)
    }

    fn equality(&self, node: &Node, field: &str, literal: Option<&str>) -> BoxedStream {
        if is_unfielded(field) {
            return no_data(node);
        }
        let Some(value) = literal else {
            return delayed(node);
        };
        if field == DATATYPE_FIELD {
            return delayed(node);
        }
        if !self.config.is_known_field(field) {
            trace!(field, "unknown field cannot match");
            return no_data(node);
        }
        if !self.config.is_indexed(field) {
            return delayed(node);
        }
        self.term(node, field, value)
    }

    fn marked(&self, node: &Node, marker: Marker, children: &[Node]) -> PlanResult<BoxedStream> {
        let stream: BoxedStream = match marker {
            Marker::ExceededTerm | Marker::Delayed | Marker::EvaluationOnly | Marker::IndexHole => {
                delayed(node)
            }
            Marker::Dropped => Box::new(ScannerStream::no_op(node.clone())),
            Marker::ExceededValue | Marker::ExceededOr => {
                if !self.config.settings().lookup.can_handle_exceeded_value_threshold
                    && let Some(field) = node.fields().into_iter().find(|f| self.config.is_index_only(f))
                {
                    return Err(PlanError::UnboundedIndexOnlyField(field.to_string()));
                }
                let days: Vec<String> = self.config.days().collect();
                let all = ShardEnumerator::new(node.clone(), days, Granularity::Shard, Arc::clone(self.shards));
                Box::new(ScannerStream::with_data(node.clone(), Box::new(all)))
            }
            Marker::BoundedRange => match children {
                [range @ Node::Range { field, .. }] if self.config.is_indexed(field) => {
                    self.bounded_range(node, range)
                }
                _ => delayed(node),
            },
        };
        Ok(stream)
    }

    fn union(&self, node: &Node, children: &[Node], parent: Parent<'_>) -> PlanResult<BoxedStream> {
        let mut streams = Vec::with_capacity(children.len());
        for child in children {
            let stream = self.visit(child, Parent::Union(&mut streams))?;
            if stream.context() != StreamContext::NoOp {
                streams.push(stream);
            }
        }
        if let Parent::Union(siblings) = parent {
            siblings.append(&mut streams);
            return Ok(Box::new(ScannerStream::no_op(node.clone())));
        }
        if streams.is_empty() {
            return Ok(no_data(node));
        }

        let union = Union::build(node.clone(), streams, Some(self.init_pool))?;
        let stream: BoxedStream = match union.context() {
            StreamContext::Absent => no_data(node),
            StreamContext::Delayed => delayed(node),
            _ => Box::new(union),
        };
        Ok(stream)
    }

    fn intersection(&self, node: &Node, children: &[Node], parent: Parent<'_>) -> PlanResult<BoxedStream> {
        let mut streams = Vec::with_capacity(children.len());
        for child in children {
            let stream = self.visit(child, Parent::Intersection(&mut streams))?;
            if stream.context() != StreamContext::NoOp {
                streams.push(stream);
            }
        }
        if let Parent::Intersection(siblings) = parent {
            siblings.append(&mut streams);
            return Ok(Box::new(ScannerStream::no_op(node.clone())));
        }
        if streams.is_empty() {
            return Ok(no_data(node));
        }

        let intersection = Intersection::build(node.clone(), streams, Some(self.init_pool))?;
        let stream: BoxedStream = match intersection.context() {
            StreamContext::Absent => no_data(node),
            _ => Box::new(intersection),
        };
        Ok(stream)
    }

    fn term(&self, node: &Node, field: &str, value: &str) -> BoxedStream {
        let config = Arc::clone(self.config);
        let range = term_range(value, field, &config.begin_day(), &config.end_day());
        let field = field.to_string();
        let term = node.clone();
        let pool = self.stream_pool.clone();
        let errors = self.errors.clone();

        Box::new(ScannerStream::initialized(node.clone(), self.errors.clone(), move || {
            let scanner = open_scanner(&config, &field, range)?;
            let batch_size = config.settings().lookup.max_index_batch_size;
            let entries = BatchedScan::open(scanner, pool, batch_size, errors.clone())?;
            Ok(Box::new(TermCandidates::new(entries, term, errors)) as CandidateIter)
        }))
    }

    fn bounded_range(&self, node: &Node, range: &Node) -> BoxedStream {
        let Node::Range {
            field,
            lower,
            upper,
            lower_inclusive,
            upper_inclusive,
        } = range
        else {
            return delayed(node);
        };
        let start = if *lower_inclusive {
            Key::row(lower.as_str())
        } else {
            Key::row(format!("{lower}\0"))
        };
        let end = if *upper_inclusive {
            Key::row(format!("{upper}\0"))
        } else {
            Key::row(upper.as_str())
        };
        let rows = Range::half_open(start, end);
        if rows.is_empty() {
            return no_data(node);
        }
        let config = Arc::clone(self.config);
        let field = field.clone();
        let marked = node.clone();
        let pool = self.stream_pool.clone();
        let errors = self.errors.clone();

        Box::new(ScannerStream::initialized(node.clone(), self.errors.clone(), move || {
            let scanner = open_scanner(&config, &field, rows)?;
            let batch_size = config.settings().lookup.max_index_batch_size;
            let entries = BatchedScan::open(scanner, pool, batch_size, errors)?;
            bounded_range_candidates(entries, &marked, &config.begin_day(), &config.end_day())
        }))
    }
}

/// Opens a shard index scanner restricted to `field` and the configured
/// datatypes.
fn open_scanner(config: &PlanningConfig, field: &str, range: Range) -> PlanResult<Box<dyn Scanner>> {
    let settings = config.settings();
    let mut scanner = config
        .store()
        .open_scanner(&settings.tables.shard_index, config.auths())?;
    scanner.set_range(range);
    scanner.fetch_column(field);
    if !settings.lookup.datatypes.is_empty() {
        let mut options = BTreeMap::new();
        options.insert("types".to_string(), settings.lookup.datatypes.join(","));
        scanner.add_server_side_filter(DATATYPE_FILTER, options)?;
    }
    Ok(scanner)
}

fn delayed(node: &Node) -> BoxedStream {
    Box::new(ScannerStream::delayed(node.clone()))
}

fn no_data(node: &Node) -> BoxedStream {
    Box::new(ScannerStream::no_data(node.clone()))
}

/// Plans drained from a built stream tree, in shard order.
pub struct RangePlans {
    root: Option<BoxedStream>,
    context: StreamContext,
    config: Arc<PlanningConfig>,
    errors: FirstError,
    stream_pool: WorkerPool,
    done: bool,
}

impl RangePlans {
    /// Context of the top-level stream. A top-level `Variable` union
    /// reports `Absent`, a `Variable` intersection `Present`.
    pub fn context(&self) -> StreamContext {
        self.context
    }

    /// Stops iteration and interrupts outstanding batch fetches.
    pub fn close(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        self.root = None;
        self.stream_pool.shutdown_now();
    }

    fn fail(&mut self, error: PlanError) -> Option<PlanResult<QueryPlan>> {
        self.close();
        Some(Err(error))
    }
}

impl Iterator for RangePlans {
    type Item = PlanResult<QueryPlan>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(error) = self.errors.take() {
                return self.fail(error);
            }
            if self.done {
                return None;
            }
            let Some(candidate) = self.root.as_mut().and_then(|root| root.advance()) else {
                if let Some(error) = self.errors.take() {
                    return self.fail(error);
                }
                self.close();
                return None;
            };
            match QueryPlan::from_candidate(candidate, &self.config) {
                Some(plan) => return Some(Ok(plan)),
                None => trace!("dropping plan without a scan range"),
            }
        }
    }
}

impl Drop for RangePlans {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::CompareOp;

    #[test]
    fn test_prepare_rejects_deep_trees() {
        let mut node = Node::equals("A", "1");
        for i in 0..10 {
            node = Node::not(Node::and(vec![node, Node::equals("B", i.to_string())]));
        }
        assert!(prepare(&node, 100).is_ok());
        match prepare(&node, 5) {
            Err(PlanError::DepthExceeded { depth, max }) => {
                assert_eq!(max, 5);
                assert!(depth > 5);
            }
            other => panic!("Expected DepthExceeded, got {:?}", other.map(|n| n.to_string())),
        }
    }

    #[test]
    fn test_prepare_flattens() {
        let node = Node::and(vec![
            Node::and(vec![Node::equals("A", "1"), Node::equals("B", "2")]),
            Node::compare("C", CompareOp::Gt, "3"),
        ]);
        let flat = prepare(&node, 10).unwrap();
        assert_eq!(flat.children().len(), 3);
    }
}
