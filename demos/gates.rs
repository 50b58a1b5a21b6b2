use std::sync::Arc;

use bplib::{BPState, FactorGraph, GateKind};
use ndarray::array;

fn main() {
    // A tiny two-level circuit: c = a AND b, e = c OR d.
    let mut graph = FactorGraph::new();
    let a = graph.add_variable(2).unwrap();
    let b = graph.add_variable(2).unwrap();
    let c = graph.add_variable(2).unwrap();
    let d = graph.add_variable(2).unwrap();
    let e = graph.add_variable(2).unwrap();
    graph.add_logical_factor(&[a, b, c], GateKind::And).unwrap();
    graph.add_logical_factor(&[c, d, e], GateKind::Or).unwrap();

    let mut state = BPState::new(Arc::new(graph)).unwrap();
    state.set_evidence(a, array![0.0, 4.0].view()).unwrap();
    state.set_evidence(b, array![0.0, 4.0].view()).unwrap();
    state.set_evidence(d, array![4.0, 0.0].view()).unwrap();
    state.run(10, 0.0).unwrap();

    for (var, belief) in state.beliefs().into_iter().enumerate() {
        println!("var {var}: {belief}");
    }
}
