use tracing::debug;

use super::{
    BoxedStream, IndexInfo, IndexStream, Initialized, ShardCandidate, StreamContext,
    candidate_at, initialize_children,
};
use crate::error::PlanResult;
use crate::pool::WorkerPool;
use crate::query::Node;
use crate::shard::{covers, precedes};

/// Sorted merge of the children of an `And`.
///
/// Positioned children drive the merge. `Variable` children are asked
/// for each agreed shard and veto it when they have nothing there; when
/// no child is positioned they drive the merge themselves. `Delayed`
/// children only contribute their nodes.
pub struct Intersection {
    node: Node,
    context: StreamContext,
    children: Vec<BoxedStream>,
    variable: Vec<BoxedStream>,
    deferred: Vec<Node>,
    head: Option<ShardCandidate>,
}

impl Intersection {
    pub fn build(node: Node, children: Vec<BoxedStream>, pool: Option<&WorkerPool>) -> PlanResult<Self> {
        let ready = match initialize_children(children, pool, true)? {
            Initialized::All(ready) => ready,
            Initialized::ShortCircuit(absent) => {
                debug!(node = %node, child = %absent.context_debug(), "intersection has an absent term");
                return Ok(Self::absent(node));
            }
        };

        let mut intersection = Self::absent(node);
        for child in ready {
            match child.context() {
                StreamContext::Present | StreamContext::Initialized => {
                    intersection.children.push(child)
                }
                StreamContext::Variable => intersection.variable.push(child),
                StreamContext::Delayed => intersection.deferred.push(child.current_node().clone()),
                StreamContext::Absent | StreamContext::NoOp => {}
            }
        }

        intersection.context = if !intersection.children.is_empty() {
            StreamContext::Present
        } else if !intersection.variable.is_empty() {
            StreamContext::Variable
        } else if !intersection.deferred.is_empty() {
            StreamContext::Delayed
        } else {
            StreamContext::Absent
        };

        if intersection.context == StreamContext::Variable {
            // Nothing else is positioned, so the variable children drive.
            intersection.children = std::mem::take(&mut intersection.variable);
        }
        if matches!(intersection.context, StreamContext::Present | StreamContext::Variable) {
            intersection.head = intersection.next_candidate();
        }
        debug!(stream = %intersection.context_debug(), "built intersection");
        Ok(intersection)
    }

    fn absent(node: Node) -> Self {
        Self {
            node,
            context: StreamContext::Absent,
            children: Vec::new(),
            variable: Vec::new(),
            deferred: Vec::new(),
            head: None,
        }
    }

    fn next_candidate(&mut self) -> Option<ShardCandidate> {
        if self.children.is_empty() {
            return None;
        }
        loop {
            let mut target: Option<String> = None;
            for child in &mut self.children {
                let shard = &child.peek()?.shard;
                if target.as_ref().is_none_or(|t| shard > t) {
                    target = Some(shard.clone());
                }
            }
            let target = target?;

            let mut aligned = true;
            for child in &mut self.children {
                let head = &child.peek()?.shard;
                if *head == target || covers(head, &target) {
                    continue;
                }
                aligned = false;
                child.seek(&target)?;
            }
            if !aligned {
                continue;
            }

            let mut infos = Vec::with_capacity(self.children.len() + self.variable.len());
            for child in &mut self.children {
                let head = child.peek()?;
                if head.shard == target {
                    infos.extend(child.advance().map(|c| c.info));
                } else {
                    infos.push(head.info.clone());
                }
            }

            let mut vetoed = false;
            for child in &mut self.variable {
                match child.next_with_context(&target) {
                    Some(candidate) => infos.push(candidate.info),
                    None => {
                        vetoed = true;
                        break;
                    }
                }
            }
            if vetoed {
                continue;
            }

            let info = IndexInfo::intersect(infos, &self.deferred);
            if info.is_empty() {
                continue;
            }
            return Some(ShardCandidate::new(target, info));
        }
    }
}

impl IndexStream for Intersection {
    fn context(&self) -> StreamContext {
        self.context
    }

    fn context_debug(&self) -> String {
        let children: Vec<String> = self
            .children
            .iter()
            .chain(self.variable.iter())
            .map(|c| c.context_debug())
            .collect();
        format!(
            "Intersection ({}): [{}] deferred {}",
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
            StreamContext::Present => candidate_at(self, reference),
            StreamContext::Variable | StreamContext::Delayed => Some(ShardCandidate::new(
                reference,
                IndexInfo::unknown(self.node.clone()),
            )),
            _ => None,
        }
    }
}
