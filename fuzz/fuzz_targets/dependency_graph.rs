#![no_main]

use std::collections::BTreeSet;

use fabric_deploy::graph::DependencyGraph;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Each byte pair is an edge between two of at most 16 nodes.
    let mut graph = DependencyGraph::new();
    for pair in data.chunks_exact(2) {
        let from = format!("n{}", pair[0] % 16);
        let to = format!("n{}", pair[1] % 16);
        graph.add_dependency(&from, &to);
    }

    match graph.publish_order() {
        Ok(order) => {
            assert_eq!(order.len(), graph.len());
            let position = |name: &str| order.iter().position(|n| n == name);
            for name in &order {
                for dependent in graph.dependents_of(name) {
                    assert!(position(name) < position(dependent));
                }
            }
            let all: BTreeSet<String> = order.iter().cloned().collect();
            let mut reversed = graph.unpublish_order(&all).expect("acyclic");
            reversed.reverse();
            assert_eq!(reversed, order);
        }
        Err(_) => assert!(graph.unpublish_order(&BTreeSet::new()).is_err()),
    }
});
