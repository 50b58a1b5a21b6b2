use itertools::{izip, Itertools};
use ndarray::{Array1, Array2};
use thiserror::Error;

use crate::factor_graph::{FactorGraph, FactorKind, GateKind, StateVal};

#[derive(Debug, Clone, Error)]
pub enum WiringError {
    #[error("The logical wiring must have {expected} distinct factor indices, each with at least one parent edge, but has {got}.")]
    FactorIndicesCount { got: usize, expected: usize },
    #[error("The highest logical factor index must be {expected}, but is {got}.")]
    HighestFactorIndex { got: usize, expected: usize },
    #[error("The edge_states_offset must be 1 (for OR) or -1 (for AND), but is {0}.")]
    EdgeStatesOffset(isize),
}

/// Compiled representation of one enumeration factor: the global message
/// index ranges of its edges plus its configuration table.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub(crate) struct EnumFactorWiring {
    /// Global message index of state 0, for each connected edge.
    pub(crate) edge_state_starts: Vec<usize>,
    pub(crate) factor_configs: Array2<StateVal>,
    pub(crate) log_potentials: Array1<f64>,
}

/// Compiled representation of a batch of gate factors sharing one
/// `edge_states_offset`. Indices are message indices into the flat
/// edge-state arrays; each row of `parents_edge_states` is
/// `[factor_index, relevant_state_index]` and `children_edge_states` holds
/// one relevant-state index per factor.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LogicalWiring {
    pub(crate) edges_num_states: Vec<usize>,
    pub(crate) parents_edge_states: Array2<usize>,
    pub(crate) children_edge_states: Array1<usize>,
    pub(crate) edge_states_offset: isize,
    /// Parent-row range per factor, derived at construction.
    pub(crate) factor_parent_ranges: Vec<(usize, usize)>,
}

impl LogicalWiring {
    pub fn new(
        edges_num_states: Vec<usize>,
        parents_edge_states: Array2<usize>,
        children_edge_states: Array1<usize>,
        edge_states_offset: isize,
    ) -> Result<Self, WiringError> {
        if edge_states_offset != 1 && edge_states_offset != -1 {
            return Err(WiringError::EdgeStatesOffset(edge_states_offset));
        }
        let num_factors = children_edge_states.len();
        let mut rows: Vec<(usize, usize)> = parents_edge_states
            .outer_iter()
            .map(|row| (row[0], row[1]))
            .collect();
        rows.sort_by_key(|(factor, _)| *factor);
        let distinct = rows.iter().map(|(factor, _)| factor).dedup().count();
        if distinct != num_factors {
            return Err(WiringError::FactorIndicesCount {
                got: distinct,
                expected: num_factors,
            });
        }
        if let Some(&(highest, _)) = rows.last() {
            if highest != num_factors - 1 {
                return Err(WiringError::HighestFactorIndex {
                    got: highest,
                    expected: num_factors - 1,
                });
            }
        }
        // Rows are now grouped by factor; record each factor's span.
        let mut factor_parent_ranges = Vec::with_capacity(num_factors);
        let mut start = 0;
        for factor in 0..num_factors {
            let end = rows[start..]
                .iter()
                .position(|(f, _)| *f != factor)
                .map_or(rows.len(), |p| start + p);
            factor_parent_ranges.push((start, end));
            start = end;
        }
        let parents_edge_states = Array2::from_shape_fn((rows.len(), 2), |(i, j)| {
            if j == 0 {
                rows[i].0
            } else {
                rows[i].1
            }
        });
        Ok(Self {
            edges_num_states,
            parents_edge_states,
            children_edge_states,
            edge_states_offset,
            factor_parent_ranges,
        })
    }

    pub fn num_factors(&self) -> usize {
        self.children_edge_states.len()
    }
    pub fn edge_states_offset(&self) -> isize {
        self.edge_states_offset
    }
}

/// Locates a factor's kernel inputs inside the compiled wiring.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub(crate) enum FactorRef {
    Enumeration { idx: usize },
    Logical { wiring: usize, member: usize },
}

/// Flat, index-based compilation of a whole graph: per-edge message layout,
/// the edge-state to variable-state gather map, and per-kind factor batches.
/// Compiled once, shared read-only across runs.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct GraphWiring {
    pub(crate) num_var_states: usize,
    pub(crate) num_edge_states: usize,
    /// Global state index of state 0 of each variable.
    pub(crate) var_state_starts: Vec<usize>,
    /// Global message index of state 0 of each edge.
    pub(crate) edge_state_starts: Vec<usize>,
    pub(crate) edges_num_states: Vec<usize>,
    /// For every edge state, the global state index of the underlying
    /// variable state: the gather map of the variable-to-factor phase.
    pub(crate) var_states_for_edges: Vec<usize>,
    pub(crate) factor_refs: Vec<FactorRef>,
    /// Per factor: (first edge-state index, number of edge states).
    pub(crate) factor_edge_states: Vec<(usize, usize)>,
    pub(crate) enumeration: Vec<EnumFactorWiring>,
    pub(crate) logical: Vec<LogicalWiring>,
}

impl GraphWiring {
    pub(crate) fn compile(graph: &FactorGraph) -> Result<Self, WiringError> {
        let mut var_state_starts = Vec::with_capacity(graph.vars.len());
        let mut num_var_states = 0;
        for var in &graph.vars {
            var_state_starts.push(num_var_states);
            num_var_states += var.num_states();
        }

        let mut edge_state_starts = Vec::with_capacity(graph.edges.len());
        let mut edges_num_states = Vec::with_capacity(graph.edges.len());
        let mut var_states_for_edges = Vec::new();
        let mut num_edge_states = 0;
        for edge in &graph.edges {
            let num_states = graph.vars[edge.var].num_states();
            edge_state_starts.push(num_edge_states);
            edges_num_states.push(num_states);
            num_edge_states += num_states;
            var_states_for_edges
                .extend((0..num_states).map(|s| var_state_starts[edge.var] + s));
        }

        let mut factor_refs = Vec::with_capacity(graph.factors.len());
        let mut factor_edge_states = Vec::with_capacity(graph.factors.len());
        let mut enumeration = Vec::new();
        // One batch per gate kind present, in order of first appearance.
        let mut gates: Vec<GateKind> = Vec::new();
        let mut parent_rows: Vec<Vec<(usize, usize)>> = Vec::new();
        let mut child_entries: Vec<Vec<usize>> = Vec::new();
        for factor in &graph.factors {
            let first_edge = factor.edges.start;
            let states: usize = factor.edges.clone().map(|e| edges_num_states[e]).sum();
            factor_edge_states.push((edge_state_starts[first_edge], states));
            match &factor.kind {
                FactorKind::Enumeration(f) => {
                    factor_refs.push(FactorRef::Enumeration {
                        idx: enumeration.len(),
                    });
                    enumeration.push(EnumFactorWiring {
                        edge_state_starts: factor
                            .edges
                            .clone()
                            .map(|e| edge_state_starts[e])
                            .collect(),
                        factor_configs: f.factor_configs.clone(),
                        log_potentials: f.log_potentials.clone(),
                    });
                }
                FactorKind::Logical(f) => {
                    let batch = match gates.iter().position(|g| *g == f.gate) {
                        Some(b) => b,
                        None => {
                            gates.push(f.gate);
                            parent_rows.push(Vec::new());
                            child_entries.push(Vec::new());
                            gates.len() - 1
                        }
                    };
                    let member = child_entries[batch].len();
                    factor_refs.push(FactorRef::Logical {
                        wiring: batch,
                        member,
                    });
                    let relevant = f.gate.relevant_state();
                    for parent in 0..f.num_parents() {
                        let edge = first_edge + parent;
                        parent_rows[batch].push((member, edge_state_starts[edge] + relevant));
                    }
                    let child_edge = first_edge + f.num_parents();
                    child_entries[batch].push(edge_state_starts[child_edge] + relevant);
                }
            }
        }

        let mut logical = Vec::with_capacity(gates.len());
        for (gate, rows, children) in izip!(gates, parent_rows, child_entries) {
            let num_parent_edges = rows.len();
            let parents_edge_states = Array2::from_shape_fn((num_parent_edges, 2), |(i, j)| {
                if j == 0 {
                    rows[i].0
                } else {
                    rows[i].1
                }
            });
            logical.push(LogicalWiring::new(
                vec![2; num_parent_edges + children.len()],
                parents_edge_states,
                Array1::from_vec(children),
                gate.edge_states_offset(),
            )?);
        }

        Ok(Self {
            num_var_states,
            num_edge_states,
            var_state_starts,
            edge_state_starts,
            edges_num_states,
            var_states_for_edges,
            factor_refs,
            factor_edge_states,
            enumeration,
            logical,
        })
    }

    pub fn num_edge_states(&self) -> usize {
        self.num_edge_states
    }
    pub fn num_var_states(&self) -> usize {
        self.num_var_states
    }
    pub fn logical_wirings(&self) -> &[LogicalWiring] {
        &self.logical
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factor_graph::FactorGraph;
    use ndarray::array;

    #[test]
    fn compile_assigns_flat_indices() {
        let mut graph = FactorGraph::new();
        let a = graph.add_variable(2).unwrap();
        let b = graph.add_variable(2).unwrap();
        let c = graph.add_variable(2).unwrap();
        graph.add_logical_factor(&[a, b, c], GateKind::And).unwrap();
        let wiring = graph.wiring().unwrap();
        assert_eq!(wiring.num_var_states, 6);
        assert_eq!(wiring.num_edge_states, 6);
        assert_eq!(wiring.var_states_for_edges, vec![0, 1, 2, 3, 4, 5]);
        let lw = &wiring.logical[0];
        assert_eq!(lw.edge_states_offset, -1);
        // AND records the state-1 slot of each edge.
        assert_eq!(
            lw.parents_edge_states,
            array![[0usize, 1usize], [0, 3]]
        );
        assert_eq!(lw.children_edge_states, array![5usize]);
        assert_eq!(lw.factor_parent_ranges, vec![(0, 2)]);
    }

    #[test]
    fn shared_variable_edges_gather_same_states() {
        let mut graph = FactorGraph::new();
        let a = graph.add_variable(2).unwrap();
        let b = graph.add_variable(2).unwrap();
        let c = graph.add_variable(2).unwrap();
        graph.add_logical_factor(&[a, b], GateKind::Or).unwrap();
        graph.add_logical_factor(&[a, c], GateKind::Or).unwrap();
        let wiring = graph.wiring().unwrap();
        // Both factors' first edge reads variable a's states.
        assert_eq!(wiring.var_states_for_edges[0..2], [0, 1]);
        assert_eq!(wiring.var_states_for_edges[4..6], [0, 1]);
    }

    #[test]
    fn batches_group_by_gate_kind() {
        let mut graph = FactorGraph::new();
        let vars: Vec<_> = (0..6).map(|_| graph.add_variable(2).unwrap()).collect();
        graph
            .add_logical_factor(&[vars[0], vars[1]], GateKind::Or)
            .unwrap();
        graph
            .add_logical_factor(&[vars[2], vars[3]], GateKind::And)
            .unwrap();
        graph
            .add_logical_factor(&[vars[4], vars[5]], GateKind::Or)
            .unwrap();
        let wiring = graph.wiring().unwrap();
        assert_eq!(wiring.logical.len(), 2);
        assert_eq!(wiring.logical[0].num_factors(), 2);
        assert_eq!(wiring.logical[1].num_factors(), 1);
    }
}
