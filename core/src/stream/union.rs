use tracing::debug;

use super::{
    BoxedStream, IndexInfo, IndexStream, Initialized, ShardCandidate, StreamContext,
    initialize_children,
};
use crate::error::PlanResult;
use crate::pool::WorkerPool;
use crate::query::Node;
use crate::shard::{covers, is_day, precedes};

/// Bag merge of the children of an `Or`.
///
/// Children that cannot be positioned (`Delayed` or `Variable`) are not
/// merged; their nodes ride along on every emitted candidate instead, which
/// makes the match set of that candidate unknown.
pub struct Union {
    node: Node,
    context: StreamContext,
    children: Vec<BoxedStream>,
    deferred: Vec<Node>,
    head: Option<ShardCandidate>,
}

impl Union {
    pub fn build(node: Node, children: Vec<BoxedStream>, pool: Option<&WorkerPool>) -> PlanResult<Self> {
        let ready = match initialize_children(children, pool, false)? {
            Initialized::All(ready) => ready,
            Initialized::ShortCircuit(child) => vec![child],
        };

        let mut positioned = Vec::with_capacity(ready.len());
        let mut deferred = Vec::new();
        for child in ready {
            match child.context() {
                StreamContext::Present | StreamContext::Initialized => positioned.push(child),
                StreamContext::Delayed | StreamContext::Variable => {
                    deferred.push(child.current_node().clone())
                }
                StreamContext::Absent | StreamContext::NoOp => {}
            }
        }

        let context = match (positioned.is_empty(), deferred.is_empty()) {
            (false, false) => StreamContext::Variable,
            (false, true) => StreamContext::Present,
            (true, false) => StreamContext::Delayed,
            (true, true) => StreamContext::Absent,
        };

        let mut union = Self {
            node,
            context,
            children: positioned,
            deferred,
            head: None,
        };
        union.head = union.next_candidate();
        debug!(stream = %union.context_debug(), "built union");
        Ok(union)
    }

    fn next_candidate(&mut self) -> Option<ShardCandidate> {
        let low = self
            .children
            .iter_mut()
            .filter_map(|child| child.peek().map(|c| c.shard.clone()))
            .min()?;

        let mut infos = Vec::new();
        for child in &mut self.children {
            while child
                .peek()
                .is_some_and(|c| c.shard == low || covers(&low, &c.shard))
            {
                if let Some(candidate) = child.advance() {
                    infos.push(candidate.info);
                }
                if !is_day(&low) {
                    break;
                }
            }
        }
        Some(ShardCandidate::new(low, IndexInfo::union(infos, &self.deferred)))
    }
}

impl IndexStream for Union {
    fn context(&self) -> StreamContext {
        self.context
    }

    fn context_debug(&self) -> String {
        let children: Vec<String> = self.children.iter().map(|c| c.context_debug()).collect();
        format!(
            "Union ({}): [{}] deferred {}",
            self.context,
            children.join(", "),
            self.deferred.len()
        )
    }

    fn current_node(&self) -> &Node {
        &self.node
    }

    fn peek(&mut self) -> Option<&ShardCandidate> {
        self.head.as_ref()
    }

    fn advance(&mut self) -> Option<ShardCandidate> {
        let current = self.head.take()?;
        self.head = self.next_candidate();
        Some(current)
    }

    fn seek(&mut self, shard: &str) -> Option<String> {
        if self.head.as_ref().is_some_and(|h| precedes(&h.shard, shard)) {
            for child in &mut self.children {
                child.seek(shard);
            }
            self.head = self.next_candidate();
        }
        self.head.as_ref().map(|h| h.shard.clone())
    }

    fn next_with_context(&mut self, reference: &str) -> Option<ShardCandidate> {
        match self.context {
            StreamContext::Present | StreamContext::Variable => {}
            StreamContext::Delayed => {
                return Some(ShardCandidate::new(
                    reference,
                    IndexInfo::union(Vec::new(), &self.deferred),
                ));
            }
            _ => return None,
        }

        let mut infos = Vec::new();
        let mut keep_head = false;
        if let Some(head) = self.head.take() {
            if head.shard == reference || covers(reference, &head.shard) {
                infos.push(head.info);
            } else if covers(&head.shard, reference) {
                infos.push(head.info.clone());
                self.head = Some(head);
                keep_head = true;
            } else if head.shard.as_str() > reference {
                self.head = Some(head);
                keep_head = true;
            }
        }

        if !keep_head {
            for child in &mut self.children {
                child.seek(reference);
                while let Some(head) = child.peek() {
                    if head.shard == reference || covers(reference, &head.shard) {
                        if let Some(candidate) = child.advance() {
                            infos.push(candidate.info);
                        }
                    } else {
                        if covers(&head.shard, reference) {
                            infos.push(head.info.clone());
                        }
                        break;
                    }
                }
            }
            self.head = self.next_candidate();
        }

        if infos.is_empty() && self.deferred.is_empty() {
            return None;
        }
        Some(ShardCandidate::new(reference, IndexInfo::union(infos, &self.deferred)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{CandidateIter, Matches, ScannerStream};
    use std::collections::BTreeSet;

    fn term(field: &str, shards: &[(&str, &[&str])]) -> BoxedStream {
        let node = Node::equals(field, "v");
        let items: Vec<ShardCandidate> = shards
            .iter()
            .map(|(shard, uids)| {
                ShardCandidate::new(*shard, IndexInfo::exact(uids.iter().copied(), node.clone()))
            })
            .collect();
        let iter: CandidateIter = Box::new(items.into_iter());
        Box::new(ScannerStream::with_data(node, iter))
    }

    fn drain(stream: &mut dyn IndexStream) -> Vec<String> {
        let mut shards = Vec::new();
        while let Some(candidate) = stream.advance() {
            shards.push(candidate.shard);
        }
        shards
    }

    fn or_node() -> Node {
        Node::or(vec![Node::equals("A", "v"), Node::equals("B", "v")])
    }

    #[test]
    fn test_union_is_sorted_set_union() {
        let mut union = Union::build(
            or_node(),
            vec![
                term("A", &[("20240101_1", &["u1"]), ("20240101_3", &["u2"])]),
                term("B", &[("20240101_2", &["u3"]), ("20240101_3", &["u4"])]),
            ],
            None,
        )
        .unwrap();
        assert_eq!(union.context(), StreamContext::Present);
        let first = union.advance().unwrap();
        assert_eq!(first.shard, "20240101_1");
        assert_eq!(union.advance().unwrap().shard, "20240101_2");
        let merged = union.advance().unwrap();
        assert_eq!(merged.shard, "20240101_3");
        let expected: BTreeSet<String> = ["u2", "u4"].iter().map(|s| s.to_string()).collect();
        assert_eq!(merged.info.matches(), &Matches::Exact(expected));
        assert!(union.advance().is_none());
    }

    #[test]
    fn test_day_absorbs_its_shards() {
        let mut union = Union::build(
            or_node(),
            vec![
                term("A", &[("20240101", &["u1"]), ("20240102_0", &["u2"])]),
                term("B", &[("20240101_4", &["u3"]), ("20240101_9", &["u4"])]),
            ],
            None,
        )
        .unwrap();
        assert_eq!(drain(&mut union), vec!["20240101", "20240102_0"]);
    }

    #[test]
    fn test_delayed_child_makes_union_variable() {
        let mut union = Union::build(
            or_node(),
            vec![
                term("A", &[("20240101_1", &["u1"])]),
                Box::new(ScannerStream::delayed(Node::regex("B", "x.*"))),
            ],
            None,
        )
        .unwrap();
        assert_eq!(union.context(), StreamContext::Variable);
        let candidate = union.advance().unwrap();
        assert_eq!(candidate.info.matches(), &Matches::Unknown);
        assert_eq!(candidate.info.node().to_string(), "(A == 'v' || B =~ 'x.*')");
    }

    #[test]
    fn test_absent_children_are_dropped() {
        let union = Union::build(
            or_node(),
            vec![term("A", &[]), Box::new(ScannerStream::no_op(Node::True))],
            None,
        )
        .unwrap();
        assert_eq!(union.context(), StreamContext::Absent);
    }

    #[test]
    fn test_next_with_context() {
        let mut union = Union::build(
            or_node(),
            vec![
                term("A", &[("20240101_1", &["u1"]), ("20240103_0", &["u2"])]),
                term("B", &[("20240102", &["u3"])]),
            ],
            None,
        )
        .unwrap();
        assert!(union.next_with_context("20240101_0").is_none());
        assert_eq!(union.next_with_context("20240101_1").unwrap().shard, "20240101_1");
        assert_eq!(union.next_with_context("20240102_5").unwrap().shard, "20240102_5");
        assert_eq!(union.next_with_context("20240102_7").unwrap().shard, "20240102_7");
        assert!(union.next_with_context("20240102_9").is_some());
        assert_eq!(union.next_with_context("20240103_0").unwrap().shard, "20240103_0");
        assert!(union.next_with_context("20240104_0").is_none());
    }
}
