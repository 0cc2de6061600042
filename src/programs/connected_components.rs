//! # Connected Components
//!
//! Workset connected components over a directed edge list: every vertex starts in its own
//! component (its id), and each superstep propagates the smallest component id seen along
//! the edges of the vertices that changed in the previous superstep.
//!
//! - head: workset `(vertex, component)` joined with edges `(source, target)` on the
//!   vertex, emitting `(target, component)` candidates
//! - intermediate: per-vertex minimum of the candidates
//! - solution-set join: keep a candidate only if it improves the stored component
//!
//! The odd/even generator produces a graph whose odd vertices all end in component 1 and
//! even vertices in component 2, which [`check_odd_even_result`] verifies.

use std::sync::Arc;

use crate::config::{ConfigurationError, IterationConfig};
use crate::error::Result;
use crate::execution::{
    Collector, FunctionContext, MatchFunction, ReduceFunction, SolutionSetJoinFunction, StageSpec,
};
use crate::record::{Key, Record};
use crate::runtime::{IterationJob, IterationProgram};

pub const SEED: u64 = 0xBADC0FFEEBEEF;
pub const NUM_VERTICES: usize = 1000;
pub const NUM_EDGES: usize = 10_000;

pub const PROGRAM_NAME: &str = "Connected Components";
pub const MIN_COMPONENT_STAGE: &str = "Find Min Component-ID";

const MAX_GENERATED: usize = 1_000_000;

/// Vertices `1..=count`, each a record with an empty payload
pub fn enumerate_vertices(count: usize) -> Result<Vec<Record>> {
    if count < 1 || count > MAX_GENERATED {
        return Err(ConfigurationError::invalid_value(
            "vertices",
            count.to_string(),
            format!("must be between 1 and {MAX_GENERATED}"),
        )
        .into());
    }
    Ok((1..=count as Key).map(|id| Record::new(id, vec![])).collect())
}

/// Directed edges that only connect vertices of equal parity
///
/// The first `vertices - 2` edges form the chains `i - 2 -> i`; the rest are drawn from a
/// generator seeded with `seed`, so the same arguments always yield the same edges.
pub fn random_odd_even_edges(edges: usize, vertices: usize, seed: u64) -> Result<Vec<Record>> {
    if vertices < 2 || vertices > MAX_GENERATED || edges < vertices || edges > MAX_GENERATED {
        return Err(ConfigurationError::invalid_value(
            "edges",
            format!("{edges} edges over {vertices} vertices"),
            "need 2 <= vertices <= edges <= 1000000",
        )
        .into());
    }

    let n = vertices as Key;
    let mut result: Vec<Record> = (3..=n).map(|i| Record::pair(i - 2, i)).collect();

    let mut rng = fastrand::Rng::with_seed(seed);
    let random_edges = edges - (vertices - 2);
    for _ in 0..random_edges {
        let parity = if rng.bool() { 1 } else { 0 };
        let source = same_parity(rng.i64(1..=n), parity);
        let target = same_parity(rng.i64(1..=n), parity);
        result.push(Record::pair(source, target));
    }
    Ok(result)
}

fn same_parity(vertex: Key, parity: Key) -> Key {
    if vertex % 2 == parity {
        return vertex;
    }
    match vertex - 1 {
        adjusted if adjusted < 1 => 2,
        adjusted => adjusted,
    }
}

/// Initial mapping: every vertex is its own component
#[derive(Debug, Clone, Copy, Default)]
pub struct IdDuplicator;

impl IdDuplicator {
    pub fn duplicate(&self, vertex: &Record) -> Record {
        Record::pair(vertex.key, vertex.key)
    }

    pub fn duplicate_all(&self, vertices: &[Record]) -> Vec<Record> {
        vertices.iter().map(|vertex| self.duplicate(vertex)).collect()
    }
}

fn component(record: &Record) -> anyhow::Result<Key> {
    record
        .long(0)
        .ok_or_else(|| anyhow::anyhow!("record {} carries no component id", record.key))
}

/// `(vertex, component) x (vertex, target) -> (target, component)`
#[derive(Debug, Clone, Copy, Default)]
pub struct NeighborWithComponentIdJoin;

impl MatchFunction for NeighborWithComponentIdJoin {
    fn join(
        &self,
        vertex_with_component: &Record,
        edge: &Record,
        _context: &FunctionContext,
        out: &mut Collector,
    ) -> anyhow::Result<()> {
        let target = edge
            .long(0)
            .ok_or_else(|| anyhow::anyhow!("edge from {} has no target", edge.key))?;
        out.collect(Record::pair(target, component(vertex_with_component)?));
        Ok(())
    }
}

/// Smallest candidate component per vertex
#[derive(Debug, Clone, Copy, Default)]
pub struct MinimumComponentIdReduce;

impl ReduceFunction for MinimumComponentIdReduce {
    fn reduce(
        &self,
        vertex: Key,
        candidates: Vec<Record>,
        _context: &FunctionContext,
        out: &mut Collector,
    ) -> anyhow::Result<()> {
        let mut minimum = None;
        for candidate in &candidates {
            let value = component(candidate)?;
            minimum = Some(minimum.map_or(value, |current: Key| current.min(value)));
        }
        if let Some(minimum) = minimum {
            out.collect(Record::pair(vertex, minimum));
        }
        Ok(())
    }
}

/// Emit the candidate when its component is strictly smaller than the stored one
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateComponentIdMatch;

impl SolutionSetJoinFunction for UpdateComponentIdMatch {
    fn join(
        &self,
        candidate: &Record,
        current: &Record,
        _context: &FunctionContext,
        out: &mut Collector,
    ) -> anyhow::Result<()> {
        if component(candidate)? < component(current)? {
            out.collect(candidate.clone());
        }
        Ok(())
    }
}

pub fn program() -> IterationProgram {
    IterationProgram::new(
        PROGRAM_NAME,
        Arc::new(NeighborWithComponentIdJoin),
        Arc::new(UpdateComponentIdMatch),
    )
    .with_intermediate(StageSpec::reduce(
        MIN_COMPONENT_STAGE,
        Arc::new(MinimumComponentIdReduce),
    ))
}

/// Job over the given vertices and edges; solution set and workset both start as
/// `(vertex, vertex)`.
pub fn job(config: IterationConfig, vertices: &[Record], edges: Vec<Record>) -> IterationJob {
    let initial = IdDuplicator.duplicate_all(vertices);
    IterationJob::new(config, program())
        .with_solution_set(initial.clone())
        .with_workset(initial)
        .with_invariant(edges)
}

/// The reference odd/even job: `NUM_VERTICES` vertices, `NUM_EDGES` edges, `SEED`
pub fn odd_even_job(config: IterationConfig) -> Result<IterationJob> {
    let vertices = enumerate_vertices(NUM_VERTICES)?;
    let edges = random_odd_even_edges(NUM_EDGES, NUM_VERTICES, SEED)?;
    Ok(job(config, &vertices, edges))
}

/// Every odd vertex must be in component 1 and every even vertex in component 2
pub fn check_odd_even_result(records: &[Record]) -> anyhow::Result<()> {
    for record in records {
        let component = component(record)?;
        let expected = if record.key % 2 == 0 { 2 } else { 1 };
        if component != expected {
            anyhow::bail!(
                "vertex {} is in component {component}, expected {expected}",
                record.key
            );
        }
    }
    Ok(())
}
