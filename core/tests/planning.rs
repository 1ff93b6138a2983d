mod common;

use std::collections::BTreeSet;

use pretty_assertions::assert_eq;

use common::{Fixture, always_prune, collect, range_only, shards};
use shardplan_core::query::Marker;
use shardplan_core::{Node, PlanError, StreamContext};

fn set(shards: &[&str]) -> BTreeSet<String> {
    shards.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_single_term_plan() {
    let fixture = Fixture::new();
    fixture.ingest("20240101_3", "FIELD", "v1", &["u1", "u2"]);
    let planner = fixture.planner(range_only(), "20240101", "20240101", &["FIELD"]);

    let node = Node::equals("FIELD", "v1");
    let plans = collect(planner.plan(&node).unwrap());
    assert_eq!(shards(&plans), vec!["20240101_3"]);
    assert_eq!(plans[0].query_tree, node);
    assert_eq!(plans[0].query_string.as_deref(), Some("FIELD == 'v1'"));
    assert_eq!(plans[0].term_counts.get("FIELD == 'v1'"), Some(&2));
}

#[test]
fn test_and_intersects_shards() {
    let fixture = Fixture::new();
    for shard in ["20240101_1", "20240101_2", "20240101_3"] {
        fixture.ingest(shard, "FIELD1", "v1", &["u1"]);
    }
    for shard in ["20240101_2", "20240101_3", "20240101_4"] {
        fixture.ingest(shard, "FIELD2", "v2", &["u1"]);
    }
    let planner = fixture.planner(range_only(), "20240101", "20240101", &["FIELD1", "FIELD2"]);

    let node = Node::and(vec![Node::equals("FIELD1", "v1"), Node::equals("FIELD2", "v2")]);
    let plans = collect(planner.plan(&node).unwrap());
    assert_eq!(shards(&plans), vec!["20240101_2", "20240101_3"]);
    assert!(plans.iter().all(|plan| plan.query_tree == node));
}

#[test]
fn test_top_level_or_with_unindexed_term_is_empty() {
    let fixture = Fixture::new();
    fixture.ingest("20240101_0", "FIELD1", "v1", &["u1"]);
    let planner = fixture.planner(range_only(), "20240101", "20240101", &["FIELD1"]);

    let node = Node::or(vec![
        Node::equals("FIELD1", "v1"),
        Node::equals("someNonIndexedField", "x"),
    ]);
    let mut stream = planner.plan(&node).unwrap();
    assert_eq!(stream.context(), StreamContext::Absent);
    assert!(stream.next().is_none());
}

#[test]
fn test_nested_or_with_unindexed_term_still_plans() {
    let fixture = Fixture::new();
    fixture.ingest("20240101_1", "A", "1", &["u1"]);
    fixture.ingest("20240101_2", "A", "1", &["u2"]);
    fixture.ingest("20240101_2", "B", "2", &["u2"]);
    let planner = fixture.planner(range_only(), "20240101", "20240101", &["A", "B"]);

    let node = Node::and(vec![
        Node::equals("A", "1"),
        Node::or(vec![Node::equals("B", "2"), Node::equals("X", "3")]),
    ]);
    let stream = planner.plan(&node).unwrap();
    assert_eq!(stream.context(), StreamContext::Present);
    let plans = collect(stream);
    assert_eq!(shards(&plans), vec!["20240101_1", "20240101_2"]);
}

#[test]
fn test_top_level_and_of_variable_unions_plans() {
    let fixture = Fixture::new();
    fixture.ingest("20240101_1", "A", "1", &["u1"]);
    fixture.ingest("20240101_1", "B", "2", &["u1"]);
    fixture.ingest("20240101_2", "A", "1", &["u2"]);
    fixture.ingest("20240101_3", "B", "2", &["u3"]);
    let planner = fixture.planner(range_only(), "20240101", "20240101", &["A", "B"]);

    let node = Node::and(vec![
        Node::or(vec![Node::equals("A", "1"), Node::regex("X", "x.*")]),
        Node::or(vec![Node::equals("B", "2"), Node::regex("Y", "y.*")]),
    ]);
    let stream = planner.plan(&node).unwrap();
    assert_eq!(stream.context(), StreamContext::Present);
    let plans = collect(stream);
    assert_eq!(shards(&plans), vec!["20240101_1"]);
    let tree = plans[0].query_tree.to_string();
    assert!(tree.contains("X =~ 'x.*'") && tree.contains("Y =~ 'y.*'"), "{tree}");
}

#[test]
fn test_absent_child_empties_intersection() {
    let fixture = Fixture::new();
    fixture.ingest("20240101_0", "A", "1", &["u1"]);
    fixture.ingest("20240101_1", "A", "1", &["u2"]);
    let planner = fixture.planner(range_only(), "20240101", "20240101", &["A", "B"]);

    let node = Node::and(vec![Node::equals("A", "1"), Node::equals("B", "missing")]);
    let mut stream = planner.plan(&node).unwrap();
    assert_eq!(stream.context(), StreamContext::Absent);
    assert!(stream.next().is_none());
}

#[test]
fn test_and_or_match_set_algebra() {
    let days = ["20240101", "20240102", "20240103"];
    for seed in 1..6usize {
        let fixture = Fixture::new();
        let mut a = BTreeSet::new();
        let mut b = BTreeSet::new();
        for (d, day) in days.iter().enumerate() {
            for offset in 0..4usize {
                let shard = format!("{day}_{offset}");
                let k = d * 4 + offset;
                if (k * seed) % 3 != 0 {
                    fixture.ingest(&shard, "A", "x", &["u1"]);
                    a.insert(shard.clone());
                }
                if (k + seed) % 2 == 0 {
                    fixture.ingest(&shard, "B", "y", &["u1"]);
                    b.insert(shard);
                }
            }
        }
        let planner = fixture.planner(range_only(), "20240101", "20240103", &["A", "B"]);
        let both = Node::and(vec![Node::equals("A", "x"), Node::equals("B", "y")]);
        let either = Node::or(vec![Node::equals("A", "x"), Node::equals("B", "y")]);

        let and_shards: BTreeSet<String> = shards(&collect(planner.plan(&both).unwrap())).into_iter().collect();
        let or_shards: BTreeSet<String> = shards(&collect(planner.plan(&either).unwrap())).into_iter().collect();
        assert_eq!(and_shards, a.intersection(&b).cloned().collect::<BTreeSet<_>>(), "seed {seed}");
        assert_eq!(or_shards, a.union(&b).cloned().collect::<BTreeSet<_>>(), "seed {seed}");
    }
}

#[test]
fn test_plans_come_out_in_shard_order() {
    let fixture = Fixture::new();
    for shard in ["20240102_0", "20240101_10", "20240101_2", "20240103_1"] {
        fixture.ingest(shard, "A", "1", &["u1"]);
    }
    let planner = fixture.planner(range_only(), "20240101", "20240103", &["A"]);
    let plans = collect(planner.plan(&Node::equals("A", "1")).unwrap());
    let found = shards(&plans);
    let mut sorted = found.clone();
    sorted.sort();
    assert_eq!(found, sorted);
    assert_eq!(found.len(), 4);
}

#[test]
fn test_depth_limit_is_fatal() {
    let fixture = Fixture::new();
    let mut settings = range_only();
    settings.lookup.max_depth_threshold = 10;
    let planner = fixture.planner(settings, "20240101", "20240101", &["A"]);

    let mut node = Node::equals("A", "1");
    for _ in 0..20 {
        node = Node::not(node);
    }
    match planner.plan(&node) {
        Err(e @ PlanError::DepthExceeded { .. }) => assert!(e.is_fatal()),
        Err(e) => panic!("Expected DepthExceeded, got {e}"),
        Ok(_) => panic!("Expected DepthExceeded"),
    }
}

#[test]
fn test_unbounded_index_only_field_is_fatal() {
    let fixture = Fixture::new();
    fixture.ingest("20240101_0", "A", "1", &["u1"]);
    fixture.publish_shard_counts();
    let mut settings = range_only();
    settings.lookup.can_handle_exceeded_value_threshold = false;
    let config = shardplan_core::PlanningConfig::builder(fixture.store.clone())
        .settings(settings)
        .date_range("20240101", "20240101")
        .indexed_fields(["A"])
        .index_only_fields(["SECRET"])
        .build()
        .unwrap();
    let planner = shardplan_core::QueryPlanner::new(config);

    let node = Node::and(vec![
        Node::equals("A", "1"),
        Node::marked(Marker::ExceededValue, Node::regex("SECRET", "x.*")),
    ]);
    match planner.plan(&node) {
        Err(PlanError::UnboundedIndexOnlyField(field)) => assert_eq!(field, "SECRET"),
        Err(e) => panic!("Expected UnboundedIndexOnlyField, got {e}"),
        Ok(_) => panic!("Expected UnboundedIndexOnlyField"),
    }
}

#[test]
fn test_exceeded_value_next_to_prunable_term() {
    let fixture = Fixture::new();
    fixture.ingest("20240101_1", "A", "1", &["u1"]);
    fixture.ingest("20240101_3", "B", "z", &["u9"]);
    fixture.ingest("20240102_0", "A", "1", &["u2"]);
    fixture.ingest("20240220_1", "A", "1", &["u3"]);

    let exceeded = Node::marked(Marker::ExceededValue, Node::regex("C", "x.*"));
    let node = Node::and(vec![Node::equals("A", "1"), exceeded.clone()]);

    let planner = fixture.planner(always_prune(), "20240101", "20240229", &["A", "B", "C"]);
    assert!(!planner.uses_pruning(&node));
    let stream = planner.plan(&node).unwrap();
    assert!(!stream.is_pruned());
    let plans = collect(stream);
    assert_eq!(shards(&plans), vec!["20240101_1", "20240102_0", "20240220_1"]);
    assert!(plans.iter().all(|plan| plan.query_tree.to_string().contains("C =~ 'x.*'")));

    // The term alone prunes to the same shards.
    let pruned = planner.plan(&Node::equals("A", "1")).unwrap();
    assert!(pruned.is_pruned());
    let expected: BTreeSet<String> = shards(&collect(pruned)).into_iter().collect();
    assert_eq!(expected, set(&["20240101_1", "20240102_0", "20240220_1"]));
}

#[test]
fn test_shard_hint_restricts_plans() {
    let fixture = Fixture::new();
    fixture.ingest("20240101_1", "A", "1", &["u1"]);
    fixture.ingest("20240102_0", "A", "1", &["u2"]);
    fixture.ingest("20240102_1", "B", "2", &["u3"]);
    fixture.ingest("20240103_0", "A", "1", &["u3"]);
    let planner = fixture.planner(range_only(), "20240101", "20240103", &["A", "B"]);

    let node = Node::and(vec![Node::equals("A", "1"), Node::hint("20240101_1,20240102")]);
    let plans = collect(planner.plan(&node).unwrap());
    assert_eq!(shards(&plans), vec!["20240101_1", "20240102_0"]);
}

#[test]
fn test_unavailable_shard_index_defers_terms() {
    let fixture = Fixture::new();
    fixture.ingest("20240101_0", "A", "1", &["u1"]);
    fixture.ingest("20240101_1", "B", "2", &["u1"]);
    let planner = fixture.planner(range_only(), "20240101", "20240101", &["A", "B"]);
    fixture.store.set_unavailable(&fixture.settings.tables.shard_index, true);

    // Both terms defer, so nothing can be resolved at the top.
    let node = Node::and(vec![Node::equals("A", "1"), Node::equals("B", "2")]);
    let mut stream = planner.plan(&node).unwrap();
    assert!(stream.next().is_none());
}

#[test]
fn test_close_stops_range_plans() {
    let fixture = Fixture::new();
    for offset in 0..20 {
        fixture.ingest(&format!("20240101_{offset}"), "A", "1", &["u1"]);
    }
    let mut settings = range_only();
    settings.lookup.max_index_batch_size = 2;
    let planner = fixture.planner(settings, "20240101", "20240101", &["A"]);

    let mut stream = planner.plan(&Node::equals("A", "1")).unwrap();
    assert_eq!(stream.next().unwrap().unwrap().shard, "20240101_0");
    stream.close();
    assert!(stream.next().is_none());
}

#[test]
fn test_batched_scan_returns_every_shard() {
    let fixture = Fixture::new();
    let mut expected = Vec::new();
    for offset in 0..25 {
        let shard = format!("20240101_{offset}");
        fixture.ingest(&shard, "A", "1", &["u1"]);
        expected.push(shard);
    }
    expected.sort();
    let mut settings = range_only();
    settings.lookup.max_index_batch_size = 3;
    let planner = fixture.planner(settings, "20240101", "20240101", &["A"]);
    let plans = collect(planner.plan(&Node::equals("A", "1")).unwrap());
    assert_eq!(shards(&plans), expected);
}
