use std::collections::BTreeSet;

use itertools::Itertools;
use luminal::prelude::NodeIndex;
use snafu::ensure;
use tracing::{debug, instrument};

use super::{Match, MatchForm};
use crate::error::{Result, UnsupportedMatchShapeSnafu};
use crate::graph::{Port, TupleGraph};
use crate::ops::{attrs, AttrValue, OpKind};

/// Outcome of applying one match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rewrite {
  pub rewritten: bool,
  /// Nodes whose wiring changed or that were created. Removed nodes are not listed.
  pub affected: BTreeSet<NodeIndex>,
}

/// Applies `m` to `graph`.
///
/// Every check runs before the first mutation, so an `UnsupportedMatchShape` error leaves the graph as it was.
#[instrument(level = "debug", skip_all, fields(site = %m))]
pub fn apply(graph: &mut TupleGraph, m: &Match) -> Result<Rewrite> {
  let inputs = check_site(graph, m)?;
  match m.form {
    MatchForm::Unfolded => unfold(graph, m),
    MatchForm::Packed => unpack(graph, m),
    MatchForm::AccessorRun => fold(graph, m, inputs.len()),
  }
}

/// Confirms the match still describes the graph and has a shape we can rewrite.
fn check_site(graph: &TupleGraph, m: &Match) -> Result<Vec<Port>> {
  let consumer = m.consumer;
  ensure!(
    graph.contains(consumer) && graph.contains(m.producer),
    UnsupportedMatchShapeSnafu {
      consumer,
      reason: "stale match: node no longer exists",
    }
  );
  let inputs = graph.inputs(consumer);
  let slot = m.slot as usize;
  match m.form {
    MatchForm::Packed | MatchForm::Unfolded => {
      ensure!(
        inputs.get(slot).map(|p| p.node) == Some(m.producer),
        UnsupportedMatchShapeSnafu {
          consumer,
          reason: format!("stale match: slot {slot} no longer reads the tuple"),
        }
      );
      ensure!(
        inputs.len() == 1,
        UnsupportedMatchShapeSnafu {
          consumer,
          reason: format!(
            "tuple input is interleaved with {} other input(s)",
            inputs.len() - 1
          ),
        }
      );
    }
    MatchForm::AccessorRun => {
      let run = m.accessors.iter().copied().collect::<Option<Vec<_>>>();
      let fresh = run.as_ref().is_some_and(|run| {
        run
          .iter()
          .enumerate()
          .all(|(i, acc)| inputs.get(slot + i).map(|p| p.node) == Some(*acc))
      });
      ensure!(
        fresh,
        UnsupportedMatchShapeSnafu {
          consumer,
          reason: "stale match: accessor run changed",
        }
      );
      ensure!(
        slot == 0 && m.accessors.len() == inputs.len(),
        UnsupportedMatchShapeSnafu {
          consumer,
          reason: format!(
            "accessor run covers {} of {} inputs",
            m.accessors.len(),
            inputs.len()
          ),
        }
      );
    }
  }
  Ok(inputs)
}

/// `V(P)` -> `V(P[0], .., P[k-1])`, reusing the accessors we already have.
fn unfold(graph: &mut TupleGraph, m: &Match) -> Result<Rewrite> {
  let arity = graph.output_arity(m.producer)?;
  ensure!(
    arity <= u8::MAX as usize,
    UnsupportedMatchShapeSnafu {
      consumer: m.consumer,
      reason: format!(
        "a tuple of {arity} elements does not fit in {} input slots",
        u8::MAX
      ),
    }
  );
  ensure!(
    m.accessors.len() == arity,
    UnsupportedMatchShapeSnafu {
      consumer: m.consumer,
      reason: format!("match lists {} accessors for a tuple of {arity}", m.accessors.len()),
    }
  );
  for (index, acc) in m.accessors.iter().enumerate() {
    if let Some(acc) = *acc {
      let live = graph.accessor_index(acc) == Some(index)
        && graph.inputs(acc).first().map(|p| p.node) == Some(m.producer);
      ensure!(
        live,
        UnsupportedMatchShapeSnafu {
          consumer: m.consumer,
          reason: format!("stale match: accessor {acc:?} no longer reads index {index}"),
        }
      );
    }
  }

  let mut affected = BTreeSet::from([m.consumer, m.producer]);
  merge_duplicates(graph, m, &mut affected)?;
  let mut elements = Vec::with_capacity(arity);
  for (index, acc) in m.accessors.iter().enumerate() {
    let acc = match acc {
      Some(acc) => *acc,
      None => graph.add_node(
        OpKind::TupleGetItem,
        &[m.producer.into()],
        attrs([("index", AttrValue::Int(index as i64))]),
      )?,
    };
    affected.insert(acc);
    elements.push(Port::from(acc));
  }
  graph.set_inputs(m.consumer, &elements)?;
  debug!(
    "unfolded %{} into {} accessor(s) for %{}",
    m.producer.index(),
    arity,
    m.consumer.index()
  );
  Ok(Rewrite {
    rewritten: true,
    affected,
  })
}

/// Folds accessors that repeat a canonical one into it.
///
/// The matcher only lets duplicates through when they feed the same consumers as the canonical
/// accessor. Once the canonical one gains a consumer that would no longer hold.
fn merge_duplicates(graph: &mut TupleGraph, m: &Match, affected: &mut BTreeSet<NodeIndex>) -> Result<()> {
  let duplicates = graph
    .consumers(m.producer)
    .into_iter()
    .filter_map(|u| {
      let index = graph.accessor_index(u.consumer)?;
      let canonical = m.accessors.get(index).copied().flatten()?;
      (canonical != u.consumer).then_some((u.consumer, canonical))
    })
    .unique()
    .collect_vec();
  for (duplicate, canonical) in duplicates {
    for u in graph.consumers(duplicate) {
      affected.insert(u.consumer);
    }
    graph.replace_uses(duplicate.into(), canonical.into())?;
    graph.remove_node(duplicate)?;
  }
  Ok(())
}

/// `V(MakeTuple(a, b, ..))` -> `V(a, b, ..)`.
fn unpack(graph: &mut TupleGraph, m: &Match) -> Result<Rewrite> {
  let items = graph.inputs(m.producer);
  graph.set_inputs(m.consumer, &items)?;
  let mut affected: BTreeSet<NodeIndex> = items.iter().map(|p| p.node).collect();
  affected.insert(m.consumer);
  if graph.consumers(m.producer).is_empty() && !graph.is_output(m.producer) {
    graph.remove_node(m.producer)?;
  } else {
    affected.insert(m.producer);
  }
  debug!(
    "unpacked %{} into %{}({})",
    m.producer.index(),
    m.consumer.index(),
    items.iter().join(", ")
  );
  Ok(Rewrite {
    rewritten: true,
    affected,
  })
}

/// `V(P[0], .., P[k-1])` -> `V(P)`, dropping accessors nothing reads any more.
fn fold(graph: &mut TupleGraph, m: &Match, covered: usize) -> Result<Rewrite> {
  graph.set_inputs(m.consumer, &[m.producer.into()])?;
  let mut affected = BTreeSet::from([m.consumer, m.producer]);
  for acc in m.accessors.iter().flatten().unique() {
    if graph.consumers(*acc).is_empty() && !graph.is_output(*acc) {
      graph.remove_node(*acc)?;
    } else {
      affected.insert(*acc);
    }
  }
  debug!(
    "folded {} accessor(s) of %{} into %{}",
    covered,
    m.producer.index(),
    m.consumer.index()
  );
  Ok(Rewrite {
    rewritten: true,
    affected,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::Error;
  use crate::pass::RewriteRule;
  use crate::trace::Tracer;

  fn unfolded(producer: NodeIndex, consumer: NodeIndex, accessors: Vec<Option<NodeIndex>>) -> Match {
    Match {
      rule: RewriteRule::InlineUnfold,
      form: MatchForm::Unfolded,
      producer,
      consumer,
      slot: 0,
      accessors,
    }
  }

  #[test]
  fn test_unfold_creates_missing_accessors() {
    let mut t = Tracer::new();
    let x = t.parameter("x").unwrap();
    let s = t.split(x, 1, 2).unwrap();
    let g1 = t.tuple_get_item(s, 1).unwrap();
    let sum = t.add_n(&[s]).unwrap();
    let out = t.concat(&[sum, g1], 0).unwrap();
    t.output(out).unwrap();
    let mut g = t.finish();

    let rw = apply(&mut g, &unfolded(s.node(), sum.node(), vec![None, Some(g1.node())])).unwrap();
    assert!(rw.rewritten);
    let inputs = g.inputs(sum.node());
    assert_eq!(inputs.len(), 2);
    assert_eq!(inputs[1], g1.port());
    assert_eq!(g.accessor_index(inputs[0].node), Some(0));
    assert!(rw.affected.contains(&inputs[0].node));
    g.validate().unwrap();
  }

  #[test]
  fn test_unpack_removes_unused_pack() {
    let mut t = Tracer::new();
    let a = t.parameter("a").unwrap();
    let b = t.parameter("b").unwrap();
    let packed = t.make_tuple(&[a, b]).unwrap();
    let sum = t.add_n(&[packed]).unwrap();
    t.output(sum).unwrap();
    let mut g = t.finish();

    let m = Match {
      rule: RewriteRule::InlineUnfold,
      form: MatchForm::Packed,
      producer: packed.node(),
      consumer: sum.node(),
      slot: 0,
      accessors: vec![],
    };
    apply(&mut g, &m).unwrap();
    assert!(!g.contains(packed.node()));
    assert_eq!(g.inputs(sum.node()), vec![a.port(), b.port()]);
    g.validate().unwrap();
  }

  #[test]
  fn test_fold_keeps_shared_accessors() {
    let mut t = Tracer::new();
    let x = t.parameter("x").unwrap();
    let s = t.split(x, 0, 2).unwrap();
    let a = t.tuple_get_item(s, 0).unwrap();
    let b = t.tuple_get_item(s, 1).unwrap();
    let sum = t.add_n(&[a, b]).unwrap();
    let out = t.add_n(&[sum, b]).unwrap();
    t.output(out).unwrap();
    let mut g = t.finish();

    let m = Match {
      rule: RewriteRule::FoldTuple,
      form: MatchForm::AccessorRun,
      producer: s.node(),
      consumer: sum.node(),
      slot: 0,
      accessors: vec![Some(a.node()), Some(b.node())],
    };
    apply(&mut g, &m).unwrap();
    assert_eq!(g.inputs(sum.node()), vec![s.port()]);
    assert!(!g.contains(a.node()));
    assert!(g.contains(b.node()));
    g.validate().unwrap();
  }

  #[test]
  fn test_interleaved_is_rejected_untouched() {
    let mut t = Tracer::new();
    let x = t.parameter("x").unwrap();
    let s = t.split(x, 0, 2).unwrap();
    let sum = t.add_n(&[x, s]).unwrap();
    t.output(sum).unwrap();
    let mut g = t.finish();
    let before = g.to_string();

    let mut m = unfolded(s.node(), sum.node(), vec![None, None]);
    m.slot = 1;
    assert!(matches!(
      apply(&mut g, &m),
      Err(Error::UnsupportedMatchShape { .. })
    ));
    assert_eq!(g.to_string(), before);
    assert_eq!(g.node_count(), 3);
  }

  #[test]
  fn test_oversized_unfold_is_rejected_untouched() {
    let mut t = Tracer::new();
    let x = t.parameter("x").unwrap();
    let s = t.split(x, 0, 300).unwrap();
    let sum = t.add_n(&[s]).unwrap();
    t.output(sum).unwrap();
    let mut g = t.finish();
    let before = g.to_string();

    let m = unfolded(s.node(), sum.node(), vec![None; 300]);
    assert!(matches!(
      apply(&mut g, &m),
      Err(Error::UnsupportedMatchShape { .. })
    ));
    assert_eq!(g.to_string(), before);
  }

  #[test]
  fn test_unfold_merges_duplicate_accessors() {
    let mut t = Tracer::new();
    let x = t.parameter("x").unwrap();
    let s = t.split(x, 0, 2).unwrap();
    let a = t.tuple_get_item(s, 0).unwrap();
    let a2 = t.tuple_get_item(s, 0).unwrap();
    let pair = t.add_n(&[a, a2]).unwrap();
    let whole = t.add_n(&[s]).unwrap();
    let out = t.add_n(&[pair, whole]).unwrap();
    t.output(out).unwrap();
    let mut g = t.finish();

    let m = unfolded(s.node(), whole.node(), vec![Some(a.node()), None]);
    apply(&mut g, &m).unwrap();
    assert!(!g.contains(a2.node()));
    assert_eq!(g.inputs(pair.node()), vec![a.port(), a.port()]);
    assert_eq!(g.inputs(whole.node())[0], a.port());
    crate::pass::matcher::accessors(&g, s.node()).unwrap();
    g.validate().unwrap();
  }

  #[test]
  fn test_stale_match_is_rejected() {
    let mut t = Tracer::new();
    let x = t.parameter("x").unwrap();
    let s = t.split(x, 0, 2).unwrap();
    let sum = t.add_n(&[s]).unwrap();
    t.output(sum).unwrap();
    let mut g = t.finish();

    let m = unfolded(s.node(), sum.node(), vec![None, None]);
    apply(&mut g, &m).unwrap();
    let edges = g.edge_count();
    assert!(matches!(
      apply(&mut g, &m),
      Err(Error::UnsupportedMatchShape { .. })
    ));
    assert_eq!(g.edge_count(), edges);
  }
}
