use std::sync::Arc;

use itertools::izip;
use ndarray::{s, Array1, ArrayView1};
use rayon::prelude::*;
use thiserror::Error;

use crate::bp_compute::{combine2, logsubexp, normalize_max, split_blocks, TopTwo, NEG_INF};
use crate::factor_graph::{FactorGraph, VarId};
use crate::wiring::{EnumFactorWiring, FactorRef, LogicalWiring, WiringError};
use crate::Config;

#[derive(Debug, Clone, Error)]
pub enum BPError {
    #[error("No variable with id {0}.")]
    UnknownVar(VarId),
    #[error("Wrong evidence length for variable {var}: got {got}, expected {expected}.")]
    EvidenceLength {
        var: VarId,
        got: usize,
        expected: usize,
    },
    #[error("The number of iterations must be positive.")]
    ZeroIterations,
    #[error("The temperature must lie in [0, 1], got {0}.")]
    Temperature(f64),
    #[error("The damping factor must lie in [0, 1), got {0}.")]
    Damping(f64),
}

/// Message state of one BP run over a shared, immutable graph.
///
/// Messages and beliefs are log-domain scores over the flat edge-state and
/// variable-state layouts of the compiled wiring. Each run exclusively owns
/// its message arrays; the wiring is shared read-only between runs.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BPState {
    graph: Arc<FactorGraph>,
    /// Weight of the previous message when mixing in an update.
    damping: f64,
    evidence: Array1<f64>,
    msgs_from_var: Array1<f64>,
    msgs_to_var: Array1<f64>,
}

const WIRING_OK: &str = "graph-built wirings always compile";

impl BPState {
    /// Creates a run state with uniform (all-zero) messages and evidence,
    /// compiling and caching the graph's wiring if not done yet.
    pub fn new(graph: Arc<FactorGraph>) -> Result<Self, WiringError> {
        let wiring = graph.wiring()?;
        let num_var_states = wiring.num_var_states();
        let num_edge_states = wiring.num_edge_states();
        Ok(Self {
            damping: 0.5,
            evidence: Array1::zeros(num_var_states),
            msgs_from_var: Array1::zeros(num_edge_states),
            msgs_to_var: Array1::zeros(num_edge_states),
            graph,
        })
    }

    pub fn graph(&self) -> &Arc<FactorGraph> {
        &self.graph
    }
    pub fn damping(&self) -> f64 {
        self.damping
    }
    pub fn set_damping(&mut self, damping: f64) -> Result<(), BPError> {
        if !(0.0..1.0).contains(&damping) {
            return Err(BPError::Damping(damping));
        }
        self.damping = damping;
        Ok(())
    }

    /// Sets the additive log-domain evidence of one variable.
    pub fn set_evidence(&mut self, var: VarId, scores: ArrayView1<f64>) -> Result<(), BPError> {
        let num_states = self
            .graph
            .variable(var)
            .ok_or(BPError::UnknownVar(var))?
            .num_states();
        if scores.len() != num_states {
            return Err(BPError::EvidenceLength {
                var,
                got: scores.len(),
                expected: num_states,
            });
        }
        let start = self.graph.wiring().expect(WIRING_OK).var_state_starts[var];
        self.evidence
            .slice_mut(s![start..start + num_states])
            .assign(&scores);
        Ok(())
    }

    pub fn drop_evidence(&mut self, var: VarId) -> Result<(), BPError> {
        let num_states = self
            .graph
            .variable(var)
            .ok_or(BPError::UnknownVar(var))?
            .num_states();
        let start = self.graph.wiring().expect(WIRING_OK).var_state_starts[var];
        self.evidence
            .slice_mut(s![start..start + num_states])
            .fill(0.0);
        Ok(())
    }

    /// Runs `num_iters` full BP iterations at the given temperature
    /// (0 = max-product, 1 = sum-product). Iteration budgets compose: `run`
    /// may be called repeatedly on the same state.
    pub fn run(&mut self, num_iters: u32, temperature: f64) -> Result<(), BPError> {
        self.run_with_config(num_iters, temperature, &Config::no_progress())
    }

    pub fn run_with_config(
        &mut self,
        num_iters: u32,
        temperature: f64,
        config: &Config,
    ) -> Result<(), BPError> {
        if num_iters == 0 {
            return Err(BPError::ZeroIterations);
        }
        if !(0.0..=1.0).contains(&temperature) {
            return Err(BPError::Temperature(temperature));
        }
        crate::utils::with_progress(
            |it_cnt| {
                for _ in 0..num_iters {
                    self.propagate_vars();
                    self.propagate_factors(temperature);
                    it_cnt.inc(1);
                }
            },
            num_iters as u64,
            "bp iterations",
            config,
        );
        Ok(())
    }

    /// Current per-variable beliefs: evidence plus all incoming messages,
    /// shifted so each variable's maximum score is 0.
    pub fn beliefs(&self) -> Vec<Array1<f64>> {
        let wiring = self.graph.wiring().expect(WIRING_OK);
        let flat = self.flat_beliefs();
        self.graph
            .vars
            .iter()
            .enumerate()
            .map(|(var, v)| {
                let start = wiring.var_state_starts[var];
                let mut belief = flat.slice(s![start..start + v.num_states()]).to_owned();
                normalize_max(belief.as_slice_mut().expect("owned beliefs are contiguous"));
                belief
            })
            .collect()
    }

    pub fn messages_from_var(&self) -> ArrayView1<f64> {
        self.msgs_from_var.view()
    }
    pub fn messages_to_var(&self) -> ArrayView1<f64> {
        self.msgs_to_var.view()
    }

    fn flat_beliefs(&self) -> Array1<f64> {
        let wiring = self.graph.wiring().expect(WIRING_OK);
        let mut flat = self.evidence.clone();
        for (es, &vs) in wiring.var_states_for_edges.iter().enumerate() {
            flat[vs] += self.msgs_to_var[es];
        }
        flat
    }

    /// Variable-to-factor phase: per edge, the variable's total belief minus
    /// the message last received over that edge, damped against the previous
    /// round and max-normalized.
    fn propagate_vars(&mut self) {
        let wiring = self.graph.wiring().expect(WIRING_OK);
        let beliefs = self.flat_beliefs();
        let damping = self.damping;
        let msgs_to_var = self.msgs_to_var.as_slice().expect("messages are contiguous");
        let msgs_from_var = self
            .msgs_from_var
            .as_slice_mut()
            .expect("messages are contiguous");
        split_blocks(msgs_from_var, wiring.edges_num_states.iter().copied())
            .into_par_iter()
            .zip(wiring.edge_state_starts.par_iter())
            .for_each(|(block, &start)| {
                for (k, msg) in block.iter_mut().enumerate() {
                    let es = start + k;
                    let new = beliefs[wiring.var_states_for_edges[es]] - msgs_to_var[es];
                    *msg = damping * *msg + (1.0 - damping) * new;
                }
                normalize_max(block);
            });
    }

    /// Factor-to-variable phase: dispatch every factor to the kernel of its
    /// kind, then max-normalize each edge's outgoing block.
    fn propagate_factors(&mut self, temperature: f64) {
        let wiring = self.graph.wiring().expect(WIRING_OK);
        let msgs_from_var = self
            .msgs_from_var
            .as_slice()
            .expect("messages are contiguous");
        let blocks: Vec<Vec<f64>> = wiring
            .factor_refs
            .par_iter()
            .zip(wiring.factor_edge_states.par_iter())
            .map(|(factor_ref, &(start, len))| {
                let mut out = vec![NEG_INF; len];
                match *factor_ref {
                    FactorRef::Enumeration { idx } => enumeration_fac_to_var_messages(
                        &wiring.enumeration[idx],
                        msgs_from_var,
                        temperature,
                        start,
                        &mut out,
                    ),
                    FactorRef::Logical { wiring: w, member } => logical_fac_to_var_messages(
                        &wiring.logical[w],
                        member,
                        msgs_from_var,
                        temperature,
                        start,
                        &mut out,
                    ),
                }
                out
            })
            .collect();
        let msgs_to_var = self
            .msgs_to_var
            .as_slice_mut()
            .expect("messages are contiguous");
        let mut pos = 0;
        for block in &blocks {
            msgs_to_var[pos..pos + block.len()].copy_from_slice(block);
            pos += block.len();
        }
        split_blocks(msgs_to_var, wiring.edges_num_states.iter().copied())
            .into_par_iter()
            .for_each(normalize_max);
    }
}

/// Factor-to-variable messages of one enumeration factor: score every listed
/// configuration, then combine per (edge, state) with the edge's own incoming
/// message removed. States covered by no configuration score `NEG_INF`.
fn enumeration_fac_to_var_messages(
    wiring: &EnumFactorWiring,
    msgs_from_var: &[f64],
    temperature: f64,
    block_start: usize,
    out: &mut [f64],
) {
    let mut scores = Vec::with_capacity(wiring.log_potentials.len());
    for (config, &log_potential) in
        izip!(wiring.factor_configs.outer_iter(), &wiring.log_potentials)
    {
        let mut score = log_potential;
        for (&base, &state) in izip!(&wiring.edge_state_starts, config) {
            score += msgs_from_var[base + state as usize];
        }
        scores.push(score);
    }
    for (config, &score) in izip!(wiring.factor_configs.outer_iter(), &scores) {
        for (&base, &state) in izip!(&wiring.edge_state_starts, config) {
            let slot_global = base + state as usize;
            let value = score - msgs_from_var[slot_global];
            let slot = slot_global - block_start;
            if value > out[slot] {
                out[slot] = value;
            }
        }
    }
    if temperature > 0.0 {
        let maxes = out.to_vec();
        let mut sums = vec![0.0; out.len()];
        for (config, &score) in izip!(wiring.factor_configs.outer_iter(), &scores) {
            for (&base, &state) in izip!(&wiring.edge_state_starts, config) {
                let slot_global = base + state as usize;
                let value = score - msgs_from_var[slot_global];
                let slot = slot_global - block_start;
                sums[slot] += ((value - maxes[slot]) / temperature).exp();
            }
        }
        for (msg, (&max, &sum)) in izip!(out.iter_mut(), izip!(&maxes, &sums)) {
            *msg = if sum > 0.0 {
                max + temperature * sum.ln()
            } else {
                NEG_INF
            };
        }
    }
}

/// Factor-to-variable messages of one gate factor, in closed form.
///
/// The valid configurations are exactly the all-relevant assignment (every
/// parent and the child in its relevant state) and, with the child in its
/// other state, every parent assignment having at least one parent flipped.
/// The "at least one flipped" combine is the unconstrained per-parent total
/// with the all-relevant term removed: log-domain subtraction under
/// sum-product, a top-two single-flip margin scan under max-product. One
/// forward pass therefore answers every outgoing message.
fn logical_fac_to_var_messages(
    wiring: &LogicalWiring,
    member: usize,
    msgs_from_var: &[f64],
    temperature: f64,
    block_start: usize,
    out: &mut [f64],
) {
    let offset = wiring.edge_states_offset;
    let other = |relevant: usize| (relevant as isize + offset) as usize;
    let (row_start, row_end) = wiring.factor_parent_ranges[member];

    let child_relevant = wiring.children_edge_states[member];
    let child_rel = msgs_from_var[child_relevant];
    let child_oth = msgs_from_var[other(child_relevant)];

    let rows = wiring.parents_edge_states.slice(s![row_start..row_end, ..]);
    let mut relevant_msgs = Vec::with_capacity(row_end - row_start);
    let mut sum_relevant = 0.0;
    let mut total = 0.0;
    let mut top = TopTwo::new();
    for (i, row) in rows.outer_iter().enumerate() {
        let relevant = row[1];
        let a = msgs_from_var[relevant];
        let b = msgs_from_var[other(relevant)];
        let l = combine2(a, b, temperature);
        sum_relevant += a;
        total += l;
        if temperature == 0.0 {
            top.push(i, b - l);
        }
        relevant_msgs.push((a, l));
    }

    let flipped = if temperature == 0.0 {
        total + top.max()
    } else {
        logsubexp(total, sum_relevant, temperature)
    };
    out[child_relevant - block_start] = sum_relevant;
    out[other(child_relevant) - block_start] = flipped;

    for (i, row) in rows.outer_iter().enumerate() {
        let relevant = row[1];
        let (a, l) = relevant_msgs[i];
        // Same exclusion restricted to the other parents; forcing this
        // parent off its relevant state needs no exclusion at all.
        let flipped_rest = if temperature == 0.0 {
            (total - l) + top.max_excluding(i)
        } else {
            logsubexp(total - l, sum_relevant - a, temperature)
        };
        out[relevant - block_start] = combine2(
            child_rel + sum_relevant - a,
            child_oth + flipped_rest,
            temperature,
        );
        out[other(relevant) - block_start] = child_oth + (total - l);
    }
}
