use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use itertools::Itertools;
use luminal::prelude::*;
use snafu::ensure;
use tracing::{debug, info, instrument, trace, warn};

use super::{matcher, rewrite, PassConfig, PassReport, PassState, RewriteRule, Site};
use crate::error::{Error, IterationLimitSnafu, NoProgressSnafu, Result};
use crate::graph::{Port, TupleGraph};

/// The type-transform pass as a luminal compiler.
///
/// Graph outputs are recovered from `to_retrieve`, in node order.
#[derive(Debug, Default, Clone)]
pub struct TypeTransform {
  pub config: PassConfig,
}

impl TypeTransform {
  pub fn new(config: PassConfig) -> Self {
    TypeTransform { config }
  }
}

impl Compiler for TypeTransform {
  type Output = Result<PassReport>;

  #[instrument(level = "debug", name = "compile", skip_all)]
  fn compile<T: ToIdsMut>(&self, graph: &mut Graph, _ids: T) -> Result<PassReport> {
    let outputs = graph
      .to_retrieve
      .iter()
      .map(|(node, (output, _))| Port::new(*node, *output))
      .sorted()
      .collect_vec();
    let mut g = TupleGraph {
      graph: std::mem::replace(graph, Graph::new()),
      outputs,
    };
    let report = run_pass(&mut g, &self.config);
    *graph = g.graph;
    report
  }
}

fn step(state: &mut PassState, next: PassState) {
  trace!("{} -> {}", state, next);
  *state = next;
}

fn producers(graph: &TupleGraph) -> Result<Vec<NodeIndex>> {
  let mut found = vec![];
  for node in graph.live_nodes()? {
    if graph.produces_tuple(node)? {
      found.push(node);
    }
  }
  Ok(found)
}

/// Tuple producer a node belongs to: itself, or the tuple an accessor reads.
fn owning_producer(graph: &TupleGraph, node: NodeIndex) -> Option<NodeIndex> {
  if !graph.contains(node) {
    return None;
  }
  if graph.produces_tuple(node).unwrap_or(false) {
    return Some(node);
  }
  graph.accessor_index(node)?;
  graph.inputs(node).first().map(|p| p.node)
}

fn push_front(worklist: &mut VecDeque<NodeIndex>, node: NodeIndex) {
  worklist.retain(|x| *x != node);
  worklist.push_front(node);
}

/// Every site through which `consumer` reads a tuple, directly or via accessors.
fn consumer_sites(graph: &TupleGraph, consumer: NodeIndex) -> Vec<Site> {
  graph
    .inputs(consumer)
    .into_iter()
    .enumerate()
    .filter_map(|(slot, port)| {
      owning_producer(graph, port.node).map(|p| (p, consumer, slot as u8))
    })
    .collect()
}

/// Candidate sites per tuple producer. The total is the potential every rewrite must lower.
#[derive(Debug, Default)]
struct Progress {
  sites: HashMap<NodeIndex, usize>,
  total: usize,
}

impl Progress {
  fn measure(graph: &TupleGraph, rule: RewriteRule) -> Result<Self> {
    let mut sites = HashMap::new();
    for producer in producers(graph)? {
      sites.insert(producer, matcher::site_count(graph, producer, rule)?);
    }
    let total = sites.values().sum();
    Ok(Progress { sites, total })
  }

  /// Recounts the `touched` producers and fails unless the total dropped.
  fn settle(
    &mut self,
    graph: &TupleGraph,
    rule: RewriteRule,
    touched: &BTreeSet<NodeIndex>,
  ) -> Result<usize> {
    let mut after = self.total;
    for &producer in touched {
      let now = if graph.contains(producer) {
        matcher::site_count(graph, producer, rule)?
      } else {
        0
      };
      let old = match now {
        0 => self.sites.remove(&producer),
        n => self.sites.insert(producer, n),
      };
      after = after + now - old.unwrap_or(0);
    }
    ensure!(
      after < self.total,
      NoProgressSnafu {
        before: self.total,
        after
      }
    );
    self.total = after;
    Ok(after)
  }
}

/// Runs the pass on `graph` until no motif is left.
///
/// On a fatal error the graph may be partially rewritten and must be discarded. See [`run_pass_checked`].
#[instrument(level = "debug", skip(graph))]
pub fn run_pass(graph: &mut TupleGraph, config: &PassConfig) -> Result<PassReport> {
  graph.validate()?;
  let rule = config.rule;
  let mut report = PassReport::start(graph, rule);
  // one rewrite or one skip per variadic consumer
  let limit = config.max_iterations.unwrap_or(graph.node_count());

  let mut worklist: VecDeque<NodeIndex> = producers(graph)?.into();
  if config.strict {
    for producer in &worklist {
      matcher::accessors(graph, *producer)?;
    }
  }

  let mut rejected: HashSet<NodeIndex> = HashSet::new();
  let mut skip: HashSet<Site> = HashSet::new();
  let mut progress = Progress::measure(graph, rule)?;
  let mut state = PassState::Scanning;
  debug!(
    "{} tuple producer(s), potential {}",
    worklist.len(),
    progress.total
  );

  loop {
    let Some(producer) = worklist.pop_front() else {
      // confirm with a full rescan
      for producer in producers(graph)? {
        if rejected.contains(&producer) {
          continue;
        }
        match matcher::find_match(graph, producer, rule, &skip) {
          Ok(Some(_)) => worklist.push_back(producer),
          Ok(None) => {}
          Err(Error::MalformedAccessPattern { .. }) if !config.strict => {
            worklist.push_back(producer)
          }
          Err(e) => return Err(e),
        }
      }
      if worklist.is_empty() {
        step(&mut state, PassState::Fixpoint);
        break;
      }
      continue;
    };
    if rejected.contains(&producer) || !graph.contains(producer) {
      continue;
    }

    let found = match matcher::find_match(graph, producer, rule, &skip) {
      Ok(found) => found,
      Err(e @ Error::MalformedAccessPattern { .. }) if !config.strict => {
        warn!("skipping %{}: {}", producer.index(), e);
        report.rejected.push(e.to_string());
        rejected.insert(producer);
        continue;
      }
      Err(e) => return Err(e),
    };
    let Some(m) = found else {
      continue;
    };
    step(&mut state, PassState::Matched);

    ensure!(report.iterations < limit, IterationLimitSnafu { limit });
    report.iterations += 1;

    step(&mut state, PassState::Rewriting);
    match rewrite::apply(graph, &m) {
      Ok(rw) => {
        let mut touched: BTreeSet<NodeIndex> = rw
          .affected
          .iter()
          .filter_map(|node| owning_producer(graph, *node))
          .collect();
        touched.insert(producer);
        let after = progress.settle(graph, rule, &touched)?;
        trace!("potential {}", after);
        if rw.rewritten {
          report.rewrites += 1;
        }
        for p in touched.into_iter().filter(|p| *p != producer) {
          push_front(&mut worklist, p);
        }
        push_front(&mut worklist, producer);
      }
      Err(e @ Error::UnsupportedMatchShape { .. }) => {
        debug!("skipping {}: {}", m, e);
        report.skipped.push(format!("{m}: {e}"));
        // a consumer with one unsupported site has no supported one
        skip.insert(m.site());
        skip.extend(consumer_sites(graph, m.consumer));
        push_front(&mut worklist, producer);
      }
      Err(e) => return Err(e),
    }
    step(&mut state, PassState::Scanning);
  }

  report.finish(graph, state);
  info!(
    "{} reached a fixpoint after {} iteration(s): {} rewrite(s), {} skipped, {} rejected",
    rule,
    report.iterations,
    report.rewrites,
    report.skipped.len(),
    report.rejected.len()
  );
  Ok(report)
}

/// Like [`run_pass`] but all-or-nothing: the pass runs on a copy that replaces `graph` only on success.
///
/// The copy is rebuilt, so node indices of the result are compacted.
pub fn run_pass_checked(graph: &mut TupleGraph, config: &PassConfig) -> Result<PassReport> {
  let mut work = graph.duplicate()?;
  let report = run_pass(&mut work, config)?;
  *graph = work;
  Ok(report)
}
