use std::collections::{BTreeMap, BTreeSet};

use crate::query::Node;

/// Record identifiers known to match in a shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matches {
    /// Assumed non-empty, identifiers not known.
    Unknown,
    Exact(BTreeSet<String>),
}

/// Per-term and per-field record counts gathered from the index, used to
/// order terms by selectivity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Counts {
    pub terms: BTreeMap<String, u64>,
    pub fields: BTreeMap<String, u64>,
}

impl Counts {
    pub fn single(term: &Node, count: u64) -> Self {
        let mut counts = Counts::default();
        counts.terms.insert(term.to_string(), count);
        if let Some(field) = term.field() {
            counts.fields.insert(field.to_string(), count);
        }
        counts
    }

    pub fn merge(&mut self, other: &Counts) {
        for (term, count) in &other.terms {
            let total = self.terms.entry(term.clone()).or_default();
            *total = total.saturating_add(*count);
        }
        for (field, count) in &other.fields {
            let total = self.fields.entry(field.clone()).or_default();
            *total = total.saturating_add(*count);
        }
    }
}

/// What the index says about one shard, plus the query node that should be
/// evaluated there.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexInfo {
    matches: Matches,
    node: Node,
    counts: Counts,
}

impl IndexInfo {
    pub fn unknown(node: Node) -> Self {
        Self {
            matches: Matches::Unknown,
            node,
            counts: Counts::default(),
        }
    }

    pub fn exact<I, S>(uids: I, node: Node) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            matches: Matches::Exact(uids.into_iter().map(Into::into).collect()),
            node,
            counts: Counts::default(),
        }
    }

    pub fn with_counts(mut self, counts: Counts) -> Self {
        self.counts = counts;
        self
    }

    pub fn matches(&self) -> &Matches {
        &self.matches
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn counts(&self) -> &Counts {
        &self.counts
    }

    /// Exact number of matching records, `None` when unknown.
    pub fn count(&self) -> Option<usize> {
        match &self.matches {
            Matches::Exact(uids) => Some(uids.len()),
            Matches::Unknown => None,
        }
    }

    /// An exact match set that turned out empty: the shard cannot match.
    pub fn is_empty(&self) -> bool {
        matches!(&self.matches, Matches::Exact(uids) if uids.is_empty())
    }

    /// Same shard, every term required. Identifier sets intersect; any
    /// unknown side makes the result unknown. Deferred nodes are appended
    /// so the shard still evaluates them.
    pub fn intersect(infos: Vec<IndexInfo>, deferred: &[Node]) -> IndexInfo {
        let mut matches: Option<Matches> = None;
        let mut counts = Counts::default();
        let mut nodes = Vec::with_capacity(infos.len() + deferred.len());
        for info in infos {
            matches = Some(match (matches, info.matches) {
                (None, m) => m,
                (Some(Matches::Exact(left)), Matches::Exact(right)) => {
                    Matches::Exact(left.intersection(&right).cloned().collect())
                }
                _ => Matches::Unknown,
            });
            counts.merge(&info.counts);
            nodes.push(info.node);
        }
        if !deferred.is_empty() {
            matches = Some(Matches::Unknown);
        }
        nodes.extend(deferred.iter().cloned());
        IndexInfo {
            matches: matches.unwrap_or(Matches::Unknown),
            node: combine(nodes, Node::and, |n| matches!(n, Node::And { marker: None, .. })),
            counts,
        }
    }

    /// Same shard, any term suffices. Identifier sets union; any unknown
    /// side makes the result unknown.
    pub fn union(infos: Vec<IndexInfo>, deferred: &[Node]) -> IndexInfo {
        let mut matches: Option<Matches> = None;
        let mut counts = Counts::default();
        let mut nodes = Vec::with_capacity(infos.len() + deferred.len());
        for info in infos {
            matches = Some(match (matches, info.matches) {
                (None, m) => m,
                (Some(Matches::Exact(mut left)), Matches::Exact(right)) => {
                    left.extend(right);
                    Matches::Exact(left)
                }
                _ => Matches::Unknown,
            });
            counts.merge(&info.counts);
            nodes.push(info.node);
        }
        if !deferred.is_empty() {
            matches = Some(Matches::Unknown);
        }
        nodes.extend(deferred.iter().cloned());
        IndexInfo {
            matches: matches.unwrap_or(Matches::Unknown),
            node: combine(nodes, Node::or, |n| matches!(n, Node::Or { .. })),
            counts,
        }
    }
}

/// Joins nodes under one boolean parent, splicing same-kind children and
/// dropping repeats.
fn combine(nodes: Vec<Node>, build: fn(Vec<Node>) -> Node, same_kind: fn(&Node) -> bool) -> Node {
    let mut flat: Vec<Node> = Vec::with_capacity(nodes.len());
    for node in nodes {
        let parts = if same_kind(&node) {
            node.children().to_vec()
        } else {
            vec![node]
        };
        for part in parts {
            if !flat.contains(&part) {
                flat.push(part);
            }
        }
    }
    if flat.len() == 1 {
        flat.remove(0)
    } else {
        build(flat)
    }
}
