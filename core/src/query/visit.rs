//! Whole-tree passes over the query AST.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use super::ast::{Node, is_unfielded};

/// Collapses redundant nesting: an unmarked `And` inside an `And` (or an
/// `Or` inside an `Or`) is spliced into its parent and single-child
/// `And`/`Or` nodes are replaced by the child. Marked nodes keep their
/// wrapper.
pub fn flatten(node: &Node) -> Node {
    match node {
        Node::And {
            children,
            marker: Some(marker),
        } => Node::And {
            children: children.iter().map(flatten).collect(),
            marker: Some(*marker),
        },
        Node::And {
            children,
            marker: None,
        } => {
            let mut flat = Vec::with_capacity(children.len());
            for child in children.iter().map(flatten) {
                match child {
                    Node::And {
                        children: nested,
                        marker: None,
                    } => flat.extend(nested),
                    other => flat.push(other),
                }
            }
            collapse(flat, Node::and)
        }
        Node::Or { children } => {
            let mut flat = Vec::with_capacity(children.len());
            for child in children.iter().map(flatten) {
                match child {
                    Node::Or { children: nested } => flat.extend(nested),
                    other => flat.push(other),
                }
            }
            collapse(flat, Node::or)
        }
        Node::Not(child) => Node::not(flatten(child)),
        leaf => leaf.clone(),
    }
}

fn collapse(mut children: Vec<Node>, build: fn(Vec<Node>) -> Node) -> Node {
    if children.len() == 1 {
        children.remove(0)
    } else {
        build(children)
    }
}

/// Depth of the tree, counting a leaf as 1. Stops looking once `limit` is
/// passed, so the result is at most `limit + 1`.
pub fn depth(node: &Node, limit: usize) -> usize {
    let mut deepest = 0;
    let mut stack = vec![(node, 1usize)];
    while let Some((node, level)) = stack.pop() {
        deepest = deepest.max(level);
        if deepest > limit {
            break;
        }
        stack.extend(node.children().iter().map(|child| (child, level + 1)));
    }
    deepest
}

/// Indexed equality terms, grouped value -> fields. Marked subtrees and
/// negations are not searched.
pub fn indexed_terms(node: &Node, indexed: &HashSet<String>) -> BTreeMap<String, BTreeSet<String>> {
    let mut terms: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut stack = vec![node];
    while let Some(node) = stack.pop() {
        match node {
            Node::Equality {
                field,
                literal: Some(literal),
            } if indexed.contains(field) && !is_unfielded(field) => {
                terms
                    .entry(literal.clone())
                    .or_default()
                    .insert(field.clone());
            }
            Node::And { marker: None, children } | Node::Or { children } => stack.extend(children),
            _ => {}
        }
    }
    terms
}

/// True when every clause is an indexed equality joined by plain `And`/`Or`.
pub fn all_indexed_equalities(node: &Node, indexed: &HashSet<String>) -> bool {
    match node {
        Node::Equality {
            field,
            literal: Some(_),
        } => indexed.contains(field) && !is_unfielded(field),
        Node::And {
            children,
            marker: None,
        }
        | Node::Or { children } => {
            !children.is_empty() && children.iter().all(|child| all_indexed_equalities(child, indexed))
        }
        _ => false,
    }
}

/// What a term's cost is looked up by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CostKey {
    /// The rendered term, `FIELD == 'value'`.
    Term,
    /// The bare field name.
    Field,
}

/// Reorders `And`/`Or` children so the cheapest (most selective) comes
/// first. Terms without a count sort last; ties keep their order.
pub fn order_by_cost(node: &Node, counts: &BTreeMap<String, u64>, key: CostKey) -> Node {
    match node {
        Node::And {
            children,
            marker: None,
        } => Node::and(sorted_children(children, counts, key)),
        Node::Or { children } => Node::or(sorted_children(children, counts, key)),
        other => other.clone(),
    }
}

fn sorted_children(children: &[Node], counts: &BTreeMap<String, u64>, key: CostKey) -> Vec<Node> {
    let mut ordered: Vec<(u64, Node)> = children
        .iter()
        .map(|child| {
            let child = order_by_cost(child, counts, key);
            (cost(&child, counts, key), child)
        })
        .collect();
    ordered.sort_by_key(|(cost, _)| *cost);
    ordered.into_iter().map(|(_, child)| child).collect()
}

fn cost(node: &Node, counts: &BTreeMap<String, u64>, key: CostKey) -> u64 {
    match node {
        Node::Equality { field, .. } => {
            let lookup = match key {
                CostKey::Term => counts.get(&node.to_string()),
                CostKey::Field => counts.get(field),
            };
            lookup.copied().unwrap_or(u64::MAX)
        }
        Node::And {
            children,
            marker: None,
        } => children
            .iter()
            .map(|child| cost(child, counts, key))
            .min()
            .unwrap_or(u64::MAX),
        Node::Or { children } => children
            .iter()
            .map(|child| cost(child, counts, key))
            .fold(0u64, u64::saturating_add),
        _ => u64::MAX,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ast::{ANY_FIELD, Marker};
    use pretty_assertions::assert_eq;

    fn indexed(fields: &[&str]) -> HashSet<String> {
        fields.iter().map(|f| f.to_string()).collect()
    }

    #[test]
    fn test_flatten_nested_same_kind() {
        let query = Node::and(vec![
            Node::equals("A", "1"),
            Node::and(vec![Node::equals("B", "2"), Node::and(vec![Node::equals("C", "3")])]),
            Node::or(vec![Node::or(vec![Node::equals("D", "4")]), Node::equals("E", "5")]),
        ]);
        let flat = flatten(&query);
        assert_eq!(
            flat.to_string(),
            "(A == '1' && B == '2' && C == '3' && (D == '4' || E == '5'))"
        );
    }

    #[test]
    fn test_flatten_keeps_marked_wrapper() {
        let query = Node::and(vec![
            Node::equals("A", "1"),
            Node::marked(Marker::Delayed, Node::and(vec![Node::and(vec![Node::equals("B", "2")])])),
        ]);
        match flatten(&query) {
            Node::And { children, marker: None } => {
                assert_eq!(children.len(), 2);
                assert_eq!(children[1].marker(), Some(Marker::Delayed));
                assert_eq!(children[1].children(), &[Node::equals("B", "2")]);
            }
            other => panic!("Expected and node, got {other}"),
        }
    }

    #[test]
    fn test_depth_limit() {
        let mut query = Node::equals("A", "1");
        for _ in 0..50 {
            query = Node::not(query);
        }
        assert_eq!(depth(&query, 100), 51);
        assert_eq!(depth(&query, 10), 11);
        assert_eq!(depth(&Node::True, 10), 1);
    }

    #[test]
    fn test_indexed_terms_skip_markers_and_negation() {
        let query = Node::and(vec![
            Node::equals("A", "x"),
            Node::equals("B", "x"),
            Node::equals("C", "y"),
            Node::equals(ANY_FIELD, "z"),
            Node::not(Node::equals("A", "neg")),
            Node::marked(Marker::ExceededValue, Node::equals("A", "marked")),
            Node::or(vec![Node::equals("A", "w")]),
        ]);
        let terms = indexed_terms(&query, &indexed(&["A", "B", ANY_FIELD]));
        let rendered: Vec<(String, Vec<String>)> = terms
            .into_iter()
            .map(|(value, fields)| (value, fields.into_iter().collect()))
            .collect();
        assert_eq!(
            rendered,
            vec![
                ("w".to_string(), vec!["A".to_string()]),
                ("x".to_string(), vec!["A".to_string(), "B".to_string()]),
            ]
        );
    }

    #[test]
    fn test_all_indexed_equalities() {
        let fields = indexed(&["A", "B"]);
        let good = Node::and(vec![
            Node::equals("A", "1"),
            Node::or(vec![Node::equals("B", "2"), Node::equals("A", "3")]),
        ]);
        assert!(all_indexed_equalities(&good, &fields));
        assert!(!all_indexed_equalities(
            &Node::or(vec![Node::equals("A", "1"), Node::equals("X", "2")]),
            &fields
        ));
        assert!(!all_indexed_equalities(
            &Node::and(vec![Node::equals("A", "1"), Node::regex("B", "2.*")]),
            &fields
        ));
        assert!(!all_indexed_equalities(&Node::and(vec![]), &fields));
    }

    #[test]
    fn test_order_by_term_cost() {
        let query = Node::and(vec![
            Node::equals("A", "common"),
            Node::regex("R", "x.*"),
            Node::equals("B", "rare"),
        ]);
        let counts = BTreeMap::from([
            ("A == 'common'".to_string(), 500u64),
            ("B == 'rare'".to_string(), 3u64),
        ]);
        assert_eq!(
            order_by_cost(&query, &counts, CostKey::Term).to_string(),
            "(B == 'rare' && A == 'common' && R =~ 'x.*')"
        );
    }

    #[test]
    fn test_order_by_field_cost() {
        let query = Node::or(vec![Node::equals("A", "1"), Node::equals("B", "2")]);
        let counts = BTreeMap::from([("A".to_string(), 10u64), ("B".to_string(), 2u64)]);
        assert_eq!(
            order_by_cost(&query, &counts, CostKey::Field).to_string(),
            "(B == '2' || A == '1')"
        );
    }
}
