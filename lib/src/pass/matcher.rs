use std::collections::{BTreeMap, BTreeSet, HashSet};

use itertools::Itertools;
use luminal::prelude::NodeIndex;
use tracing::{instrument, trace};

use super::{Match, MatchForm, RewriteRule, Site};
use crate::error::{Error, MalformedAccessPatternSnafu, Result};
use crate::graph::TupleGraph;
use crate::ops::OpKind;

/// Canonical accessor of `producer` for every tuple index that has one.
///
/// Accessors sharing an index collapse onto the lowest node id when they feed the same consumers.
/// Otherwise the pattern is malformed.
pub fn accessors(graph: &TupleGraph, producer: NodeIndex) -> Result<BTreeMap<usize, NodeIndex>> {
  let by_index = graph
    .consumers(producer)
    .into_iter()
    .filter_map(|u| graph.accessor_index(u.consumer).map(|i| (i, u.consumer)))
    .into_group_map();

  let mut canonical = BTreeMap::new();
  for (index, mut group) in by_index.into_iter().sorted_by_key(|(i, _)| *i) {
    group.sort();
    group.dedup();
    let downstream = |acc: NodeIndex| {
      let users: BTreeSet<NodeIndex> = graph.consumers(acc).into_iter().map(|u| u.consumer).collect();
      (users, graph.is_output(acc))
    };
    let first = downstream(group[0]);
    for &other in &group[1..] {
      if downstream(other) != first {
        return MalformedAccessPatternSnafu { producer, index }.fail();
      }
    }
    canonical.insert(index, group[0]);
  }
  Ok(canonical)
}

/// Every match rooted at `producer`, ordered by `(slot, consumer)`.
pub fn candidates(graph: &TupleGraph, producer: NodeIndex, rule: RewriteRule) -> Result<Vec<Match>> {
  let kind = graph.kind(producer)?;
  if !kind.produces_tuple() {
    return Ok(vec![]);
  }
  let canonical = accessors(graph, producer)?;
  let arity = graph.output_arity(producer)?;

  let mut found = vec![];
  match rule {
    RewriteRule::InlineUnfold => {
      for u in graph.consumers(producer) {
        if !graph.kind(u.consumer)?.is_variadic() {
          continue;
        }
        let (form, accessors) = if kind == OpKind::MakeTuple {
          (MatchForm::Packed, vec![])
        } else {
          let accs = (0..arity).map(|i| canonical.get(&i).copied()).collect();
          (MatchForm::Unfolded, accs)
        };
        found.push(Match {
          rule,
          form,
          producer,
          consumer: u.consumer,
          slot: u.slot,
          accessors,
        });
      }
    }
    RewriteRule::FoldTuple => {
      if kind == OpKind::MakeTuple {
        return Ok(vec![]);
      }
      let Some(run) = (0..arity)
        .map(|i| canonical.get(&i).copied())
        .collect::<Option<Vec<NodeIndex>>>()
      else {
        return Ok(vec![]);
      };
      let users: BTreeSet<NodeIndex> = graph.consumers(run[0]).into_iter().map(|u| u.consumer).collect();
      for consumer in users {
        if !graph.kind(consumer)?.is_variadic() {
          continue;
        }
        let inputs = graph.inputs(consumer);
        for start in 0..inputs.len() {
          let hit = inputs[start..].len() >= arity
            && run
              .iter()
              .zip(&inputs[start..])
              .all(|(acc, port)| port.node == *acc);
          if hit {
            found.push(Match {
              rule,
              form: MatchForm::AccessorRun,
              producer,
              consumer,
              slot: start as u8,
              accessors: run.iter().copied().map(Some).collect(),
            });
          }
        }
      }
    }
  }
  found.sort_by_key(|m| (m.slot, m.consumer));
  Ok(found)
}

/// First match rooted at `producer` whose site is not in `skip`.
#[instrument(level = "trace", skip(graph, skip))]
pub fn find_match(
  graph: &TupleGraph,
  producer: NodeIndex,
  rule: RewriteRule,
  skip: &HashSet<Site>,
) -> Result<Option<Match>> {
  let found = candidates(graph, producer, rule)?
    .into_iter()
    .find(|m| !skip.contains(&m.site()));
  if let Some(m) = &found {
    trace!("matched {}", m);
  }
  Ok(found)
}

/// Number of candidate sites rooted at `producer`. Conflicting accessors count as zero.
pub fn site_count(graph: &TupleGraph, producer: NodeIndex, rule: RewriteRule) -> Result<usize> {
  match candidates(graph, producer, rule) {
    Ok(found) => Ok(found.len()),
    Err(Error::MalformedAccessPattern { .. }) => Ok(0),
    Err(e) => Err(e),
  }
}

/// Number of candidate sites in the whole graph.
pub fn potential(graph: &TupleGraph, rule: RewriteRule) -> Result<usize> {
  let mut total = 0;
  for producer in graph.live_nodes()? {
    total += site_count(graph, producer, rule)?;
  }
  Ok(total)
}
