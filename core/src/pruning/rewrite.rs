use std::collections::HashSet;

use crate::bitmap::BitSetIndexEntry;
use crate::config::PlanningConfig;
use crate::planner::QueryPlan;
use crate::query::Node;

/// The query as it applies to one shard offset of a day, or `None` when
/// the bitmaps prove the shard cannot match.
///
/// `wanted` holds the rendered equality terms the day scan looked for. A
/// wanted term missing from the entry has no data that day. Terms that
/// were not looked up pass through for record evaluation.
pub fn prune_for_offset(
    node: &Node,
    entry: &BitSetIndexEntry,
    wanted: &HashSet<String>,
    offset: usize,
) -> Option<Node> {
    match node {
        Node::Equality { .. } => {
            let term = node.to_string();
            match entry.get(&term) {
                Some(bits) => bits.contains(offset).then(|| node.clone()),
                None if wanted.contains(&term) => None,
                None => Some(node.clone()),
            }
        }
        Node::False => None,
        Node::And {
            marker: Some(_), ..
        } => Some(node.clone()),
        Node::And {
            children,
            marker: None,
        } => {
            let mut kept = Vec::with_capacity(children.len());
            for child in children {
                if child.is_marked() {
                    kept.push(child.clone());
                } else {
                    kept.push(prune_for_offset(child, entry, wanted, offset)?);
                }
            }
            rebuild(kept, Node::and)
        }
        Node::Or { children } => {
            let kept = children
                .iter()
                .filter_map(|child| prune_for_offset(child, entry, wanted, offset))
                .collect();
            rebuild(kept, Node::or)
        }
        Node::Range { .. }
        | Node::Compare { .. }
        | Node::Regex { .. }
        | Node::Function { .. }
        | Node::Assignment { .. }
        | Node::Not(_)
        | Node::True => Some(node.clone()),
    }
}

fn rebuild(mut children: Vec<Node>, build: fn(Vec<Node>) -> Node) -> Option<Node> {
    match children.len() {
        0 => None,
        1 => children.pop(),
        _ => Some(build(children)),
    }
}

/// Plans for every offset of a day entry that survives rewriting, in
/// ascending offset order.
pub fn plans_for_entry(
    node: &Node,
    entry: &BitSetIndexEntry,
    wanted: &HashSet<String>,
    config: &PlanningConfig,
) -> Vec<QueryPlan> {
    if entry.is_empty() {
        return Vec::new();
    }
    let (min, max) = entry.offset_bounds();
    (min..=max)
        .filter_map(|offset| {
            let pruned = prune_for_offset(node, entry, wanted, offset)?;
            QueryPlan::for_shard(format!("{}_{offset}", entry.key()), pruned, config)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::ShardBitmap;
    use crate::query::Marker;

    fn entry(terms: &[(&Node, &[usize])]) -> BitSetIndexEntry {
        let mut entry = BitSetIndexEntry::new("20240101");
        for (node, bits) in terms {
            entry.insert(node.to_string(), bits.iter().copied().collect::<ShardBitmap>());
        }
        entry
    }

    fn wanted(nodes: &[&Node]) -> HashSet<String> {
        nodes.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_equality() {
        let a = Node::equals("A", "1");
        let e = entry(&[(&a, &[2, 5])]);
        let w = wanted(&[&a]);
        assert_eq!(prune_for_offset(&a, &e, &w, 2), Some(a.clone()));
        assert_eq!(prune_for_offset(&a, &e, &w, 3), None);

        let b = Node::equals("B", "2");
        assert_eq!(prune_for_offset(&b, &e, &w, 2), Some(b.clone()));
        assert_eq!(prune_for_offset(&b, &e, &wanted(&[&a, &b]), 2), None);
    }

    #[test]
    fn test_and_requires_every_term() {
        let a = Node::equals("A", "1");
        let b = Node::equals("B", "2");
        let e = entry(&[(&a, &[1, 2]), (&b, &[2, 3])]);
        let w = wanted(&[&a, &b]);
        let both = Node::and(vec![a.clone(), b.clone()]);
        assert_eq!(prune_for_offset(&both, &e, &w, 1), None);
        assert_eq!(prune_for_offset(&both, &e, &w, 2), Some(both.clone()));
    }

    #[test]
    fn test_or_keeps_matching_terms() {
        let a = Node::equals("A", "1");
        let b = Node::equals("B", "2");
        let e = entry(&[(&a, &[1, 2]), (&b, &[2, 3])]);
        let w = wanted(&[&a, &b]);
        let either = Node::or(vec![a.clone(), b.clone()]);
        assert_eq!(prune_for_offset(&either, &e, &w, 1), Some(a.clone()));
        assert_eq!(prune_for_offset(&either, &e, &w, 2), Some(either.clone()));
        assert_eq!(prune_for_offset(&either, &e, &w, 3), Some(b.clone()));
        assert_eq!(prune_for_offset(&either, &e, &w, 4), None);
    }

    #[test]
    fn test_markers_pass_through() {
        let a = Node::equals("A", "1");
        let delayed = Node::marked(Marker::Delayed, Node::equals("C", "3"));
        let e = entry(&[(&a, &[4])]);
        let w = wanted(&[&a]);
        let node = Node::and(vec![a.clone(), delayed.clone()]);
        assert_eq!(prune_for_offset(&node, &e, &w, 4), Some(node.clone()));
        assert_eq!(prune_for_offset(&node, &e, &w, 0), None);
        assert_eq!(prune_for_offset(&delayed, &e, &w, 0), Some(delayed.clone()));
        assert_eq!(prune_for_offset(&Node::False, &e, &w, 4), None);
    }

    #[test]
    fn test_nested_or_under_and() {
        let a = Node::equals("A", "1");
        let b = Node::equals("B", "2");
        let c = Node::equals("C", "3");
        let e = entry(&[(&a, &[0, 1]), (&b, &[1]), (&c, &[0])]);
        let w = wanted(&[&a, &b, &c]);
        let node = Node::and(vec![a.clone(), Node::or(vec![b.clone(), c.clone()])]);
        assert_eq!(prune_for_offset(&node, &e, &w, 0), Some(Node::and(vec![a.clone(), c])));
        assert_eq!(prune_for_offset(&node, &e, &w, 1), Some(Node::and(vec![a, b])));
    }
}
