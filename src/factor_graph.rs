use std::sync::OnceLock;

use indexmap::IndexMap;
use itertools::{izip, Itertools};
use ndarray::{Array1, Array2};
use thiserror::Error;

use crate::wiring::{GraphWiring, WiringError};

pub type VarId = usize;
pub type FactorId = usize;
pub type EdgeId = usize;
pub type GroupId = usize;

/// Integer state of a discrete variable inside a configuration table.
pub type StateVal = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Variable {
    num_states: usize,
}

impl Variable {
    pub fn num_states(&self) -> usize {
        self.num_states
    }
}

/// The two supported deterministic gate kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum GateKind {
    Or,
    And,
}

impl GateKind {
    /// Offset to go from a variable's relevant state to its other state:
    /// +1 for OR, -1 for AND.
    pub fn edge_states_offset(self) -> isize {
        match self {
            GateKind::Or => 1,
            GateKind::And => -1,
        }
    }
    /// The state whose message slot the wiring records. Fixed by the offset
    /// arithmetic: `relevant + edge_states_offset` must be the other binary
    /// state, so OR uses state 0 and AND uses state 1.
    pub(crate) fn relevant_state(self) -> usize {
        match self {
            GateKind::Or => 0,
            GateKind::And => 1,
        }
    }
}

/// A factor given as an explicit table of valid joint configurations.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EnumerationFactor {
    pub(crate) variables: Vec<VarId>,
    pub(crate) factor_configs: Array2<StateVal>,
    pub(crate) log_potentials: Array1<f64>,
}

/// A deterministic gate factor: parents first, then exactly one child, all
/// variables binary.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LogicalFactor {
    pub(crate) variables: Vec<VarId>,
    pub(crate) gate: GateKind,
}

impl LogicalFactor {
    pub(crate) fn num_parents(&self) -> usize {
        self.variables.len() - 1
    }
}

/// Closed set of factor kinds; the BP engine dispatches by tag.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub(crate) enum FactorKind {
    Enumeration(EnumerationFactor),
    Logical(LogicalFactor),
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub(crate) struct Factor {
    pub(crate) kind: FactorKind,
    pub(crate) edges: std::ops::Range<EdgeId>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub(crate) struct Edge {
    pub(crate) var: VarId,
    pub(crate) factor: FactorId,
}

/// A homogeneous batch of gate factors sharing the same kind.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct FactorGroup {
    gate: GateKind,
    factor_ids: Vec<FactorId>,
    variables_for_factors: Vec<Vec<VarId>>,
    #[serde(skip)]
    variables_to_factors: OnceLock<IndexMap<Vec<VarId>, FactorId>>,
}

impl FactorGroup {
    pub fn gate(&self) -> GateKind {
        self.gate
    }
    pub fn factor_ids(&self) -> &[FactorId] {
        &self.factor_ids
    }
    /// Mapping from the set of connected variables (sorted) to the member
    /// factor. Built on first use, then memoized.
    pub fn variables_to_factors(&self) -> &IndexMap<Vec<VarId>, FactorId> {
        self.variables_to_factors.get_or_init(|| {
            izip!(&self.variables_for_factors, &self.factor_ids)
                .map(|(vars, factor_id)| {
                    let mut key = vars.clone();
                    key.sort_unstable();
                    (key, *factor_id)
                })
                .collect()
        })
    }
}

#[derive(Debug, Clone, Error)]
pub enum GraphBuildError {
    #[error("Variables must have at least one state.")]
    ZeroStates,
    #[error("No variable with id {0}.")]
    UnknownVar(VarId),
    #[error("Variable {0} appears more than once in the factor.")]
    RepeatedVar(VarId),
    #[error("A factor must connect at least one variable.")]
    NoVariables,
    #[error(
        "Number of variables {num_variables} doesn't match given configurations \
         with {num_columns} columns."
    )]
    VariableCountMismatch {
        num_variables: usize,
        num_columns: usize,
    },
    #[error("Expected {num_configs} log potentials, one per configuration, got {num_log_potentials}.")]
    LogPotentialsLength {
        num_configs: usize,
        num_log_potentials: usize,
    },
    #[error(
        "Invalid configuration for given variables: row {row} assigns state {state} \
         to variable {var} which has {num_states} states."
    )]
    InvalidConfiguration {
        row: usize,
        var: VarId,
        state: StateVal,
        num_states: usize,
    },
    #[error("At least one parent variable and one child variable is required.")]
    MissingParentOrChild,
    #[error("All variables should be binary, but variable {var} has {num_states} states.")]
    NonBinaryVar { var: VarId, num_states: usize },
    #[error("The graph wiring has already been compiled; build a new graph instead of mutating this one.")]
    Frozen,
}

/// A factor graph under construction or ready for inference.
///
/// Variables live in an arena owned by the graph; factors reference them by
/// id and never own them. All construction methods validate eagerly and leave
/// the graph unchanged on error.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct FactorGraph {
    pub(crate) vars: Vec<Variable>,
    pub(crate) factors: Vec<Factor>,
    pub(crate) edges: Vec<Edge>,
    pub(crate) groups: Vec<FactorGroup>,
    #[serde(skip)]
    wiring: OnceLock<GraphWiring>,
}

impl FactorGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_variables(&self) -> usize {
        self.vars.len()
    }
    pub fn num_factors(&self) -> usize {
        self.factors.len()
    }
    pub fn variable(&self, var: VarId) -> Option<&Variable> {
        self.vars.get(var)
    }
    pub fn group(&self, group: GroupId) -> Option<&FactorGroup> {
        self.groups.get(group)
    }

    pub fn add_variable(&mut self, num_states: usize) -> Result<VarId, GraphBuildError> {
        self.check_unfrozen()?;
        if num_states == 0 {
            return Err(GraphBuildError::ZeroStates);
        }
        self.vars.push(Variable { num_states });
        Ok(self.vars.len() - 1)
    }

    pub fn add_enumeration_factor(
        &mut self,
        variables: &[VarId],
        factor_configs: Array2<StateVal>,
        log_potentials: Array1<f64>,
    ) -> Result<FactorId, GraphBuildError> {
        self.check_unfrozen()?;
        self.check_factor_vars(variables)?;
        if factor_configs.ncols() != variables.len() {
            return Err(GraphBuildError::VariableCountMismatch {
                num_variables: variables.len(),
                num_columns: factor_configs.ncols(),
            });
        }
        if log_potentials.len() != factor_configs.nrows() {
            return Err(GraphBuildError::LogPotentialsLength {
                num_configs: factor_configs.nrows(),
                num_log_potentials: log_potentials.len(),
            });
        }
        for (row, config) in factor_configs.outer_iter().enumerate() {
            for (&var, &state) in izip!(variables, config) {
                let num_states = self.vars[var].num_states;
                if state as usize >= num_states {
                    return Err(GraphBuildError::InvalidConfiguration {
                        row,
                        var,
                        state,
                        num_states,
                    });
                }
            }
        }
        Ok(self.push_factor(
            variables,
            FactorKind::Enumeration(EnumerationFactor {
                variables: variables.to_vec(),
                factor_configs,
                log_potentials,
            }),
        ))
    }

    /// Adds a gate factor over `variables` given as (parents..., child).
    pub fn add_logical_factor(
        &mut self,
        variables: &[VarId],
        gate: GateKind,
    ) -> Result<FactorId, GraphBuildError> {
        self.check_unfrozen()?;
        if variables.len() < 2 {
            return Err(GraphBuildError::MissingParentOrChild);
        }
        self.check_factor_vars(variables)?;
        for &var in variables {
            let num_states = self.vars[var].num_states;
            if num_states != 2 {
                return Err(GraphBuildError::NonBinaryVar { var, num_states });
            }
        }
        Ok(self.push_factor(
            variables,
            FactorKind::Logical(LogicalFactor {
                variables: variables.to_vec(),
                gate,
            }),
        ))
    }

    /// Adds a homogeneous batch of gate factors, one per (parents..., child)
    /// variable list. On error no factor of the batch enters the graph.
    pub fn add_logical_factor_group(
        &mut self,
        gate: GateKind,
        variables_for_factors: Vec<Vec<VarId>>,
    ) -> Result<GroupId, GraphBuildError> {
        self.check_unfrozen()?;
        let (num_factors, num_edges) = (self.factors.len(), self.edges.len());
        let mut factor_ids = Vec::with_capacity(variables_for_factors.len());
        for variables in &variables_for_factors {
            match self.add_logical_factor(variables, gate) {
                Ok(factor_id) => factor_ids.push(factor_id),
                Err(e) => {
                    self.factors.truncate(num_factors);
                    self.edges.truncate(num_edges);
                    return Err(e);
                }
            }
        }
        self.groups.push(FactorGroup {
            gate,
            factor_ids,
            variables_for_factors,
            variables_to_factors: OnceLock::new(),
        });
        Ok(self.groups.len() - 1)
    }

    /// The compiled flat wiring, built on first use and cached for the
    /// lifetime of the graph.
    pub fn wiring(&self) -> Result<&GraphWiring, WiringError> {
        if let Some(wiring) = self.wiring.get() {
            return Ok(wiring);
        }
        let wiring = GraphWiring::compile(self)?;
        Ok(self.wiring.get_or_init(|| wiring))
    }

    fn check_unfrozen(&self) -> Result<(), GraphBuildError> {
        if self.wiring.get().is_some() {
            return Err(GraphBuildError::Frozen);
        }
        Ok(())
    }

    fn check_factor_vars(&self, variables: &[VarId]) -> Result<(), GraphBuildError> {
        if variables.is_empty() {
            return Err(GraphBuildError::NoVariables);
        }
        for &var in variables {
            if var >= self.vars.len() {
                return Err(GraphBuildError::UnknownVar(var));
            }
        }
        if !variables.iter().all_unique() {
            let repeated = variables
                .iter()
                .duplicates()
                .next()
                .copied()
                .unwrap_or(variables[0]);
            return Err(GraphBuildError::RepeatedVar(repeated));
        }
        Ok(())
    }

    fn push_factor(&mut self, variables: &[VarId], kind: FactorKind) -> FactorId {
        let factor_id = self.factors.len();
        let edge_start = self.edges.len();
        for &var in variables {
            self.edges.push(Edge {
                var,
                factor: factor_id,
            });
        }
        self.factors.push(Factor {
            kind,
            edges: edge_start..self.edges.len(),
        });
        factor_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn group_mapping_is_lazy_and_sorted() {
        let mut graph = FactorGraph::new();
        let vars: Vec<_> = (0..5).map(|_| graph.add_variable(2).unwrap()).collect();
        let group_id = graph
            .add_logical_factor_group(
                GateKind::And,
                vec![vec![vars[1], vars[0], vars[2]], vec![vars[3], vars[4]]],
            )
            .unwrap();
        let group = graph.group(group_id).unwrap();
        let mapping = group.variables_to_factors();
        assert_eq!(mapping.len(), 2);
        assert_eq!(mapping[&vec![vars[0], vars[1], vars[2]]], 0);
        assert_eq!(mapping[&vec![vars[3], vars[4]]], 1);
    }

    #[test]
    fn group_failure_leaves_graph_unchanged() {
        let mut graph = FactorGraph::new();
        let a = graph.add_variable(2).unwrap();
        let b = graph.add_variable(2).unwrap();
        let wide = graph.add_variable(3).unwrap();
        let err = graph
            .add_logical_factor_group(GateKind::Or, vec![vec![a, b], vec![a, wide]])
            .unwrap_err();
        assert!(matches!(err, GraphBuildError::NonBinaryVar { .. }));
        assert_eq!(graph.num_factors(), 0);
        assert_eq!(graph.edges.len(), 0);
    }

    #[test]
    fn frozen_graph_rejects_mutation() {
        let mut graph = FactorGraph::new();
        let a = graph.add_variable(2).unwrap();
        let b = graph.add_variable(2).unwrap();
        graph.add_logical_factor(&[a, b], GateKind::Or).unwrap();
        graph.wiring().unwrap();
        assert!(matches!(
            graph.add_variable(2),
            Err(GraphBuildError::Frozen)
        ));
    }

    #[test]
    fn enumeration_factor_validation() {
        let mut graph = FactorGraph::new();
        let var = graph.add_variable(3).unwrap();

        let err = graph
            .add_enumeration_factor(&[var], array![[1, 2]], array![0.0])
            .unwrap_err();
        assert!(matches!(
            err,
            GraphBuildError::VariableCountMismatch {
                num_variables: 1,
                num_columns: 2
            }
        ));

        let err = graph
            .add_enumeration_factor(&[var], array![[1]], array![0.0, 1.0])
            .unwrap_err();
        assert!(matches!(err, GraphBuildError::LogPotentialsLength { .. }));

        let err = graph
            .add_enumeration_factor(&[var], array![[10]], array![0.0])
            .unwrap_err();
        assert!(matches!(
            err,
            GraphBuildError::InvalidConfiguration { state: 10, .. }
        ));

        assert_eq!(graph.num_factors(), 0);
        graph
            .add_enumeration_factor(&[var], array![[0], [2]], array![0.0, -1.0])
            .unwrap();
        assert_eq!(graph.num_factors(), 1);
    }

    #[test]
    fn logical_factor_validation() {
        let mut graph = FactorGraph::new();
        let child = graph.add_variable(2).unwrap();
        let wrong_parent = graph.add_variable(3).unwrap();
        let parent = graph.add_variable(2).unwrap();

        let err = graph
            .add_logical_factor(&[child], GateKind::Or)
            .unwrap_err();
        assert!(matches!(err, GraphBuildError::MissingParentOrChild));

        let err = graph
            .add_logical_factor(&[wrong_parent, child], GateKind::Or)
            .unwrap_err();
        assert!(matches!(
            err,
            GraphBuildError::NonBinaryVar { num_states: 3, .. }
        ));

        let err = graph
            .add_logical_factor(&[parent, parent, child], GateKind::And)
            .unwrap_err();
        assert!(matches!(err, GraphBuildError::RepeatedVar(_)));

        graph.add_logical_factor(&[parent, child], GateKind::Or).unwrap();
    }
}
