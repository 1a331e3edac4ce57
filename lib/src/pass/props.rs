use std::collections::HashMap;

use proptest::prelude::*;

use super::{run_pass, PassConfig, PassState, RewriteRule};
use crate::graph::TupleGraph;
use crate::oracle;
use crate::trace::{Tracer, Value};

/// One construction step: `(op, pick, width)`.
type Step = (u8, usize, usize);

fn steps() -> impl Strategy<Value = Vec<Step>> {
  prop::collection::vec((0u8..6, 0usize..1000, 1usize..4), 1..16)
}

fn rule() -> impl Strategy<Value = RewriteRule> {
  prop_oneof![Just(RewriteRule::InlineUnfold), Just(RewriteRule::FoldTuple)]
}

/// Builds a valid graph mixing packed tuples, whole-tuple reads and accessor runs.
/// Accessors are shared per tuple index, so the result never has conflicting accessors.
fn build(steps: &[Step]) -> TupleGraph {
  let mut t = Tracer::new();
  let mut scalars = vec![t.parameter("p0").unwrap(), t.parameter("p1").unwrap()];
  let mut tuples: Vec<(Value, usize)> = vec![];
  let mut accessors: HashMap<(Value, usize), Value> = HashMap::new();

  for &(op, pick, width) in steps {
    match op {
      0 => {
        let x = scalars[pick % scalars.len()];
        tuples.push((t.split(x, (pick % 3) as i64, width).unwrap(), width));
      }
      1 if !tuples.is_empty() => {
        let (tuple, _) = tuples[pick % tuples.len()];
        let v = if pick % 2 == 0 {
          t.add_n(&[tuple]).unwrap()
        } else {
          t.concat(&[tuple], 0).unwrap()
        };
        scalars.push(v);
      }
      2 if !tuples.is_empty() => {
        let (tuple, arity) = tuples[pick % tuples.len()];
        let run: Vec<Value> = (0..arity)
          .map(|i| {
            *accessors
              .entry((tuple, i))
              .or_insert_with(|| t.tuple_get_item(tuple, i).unwrap())
          })
          .collect();
        scalars.push(t.add_n(&run).unwrap());
      }
      3 => {
        let items: Vec<Value> = (0..width)
          .map(|i| scalars[(pick + i) % scalars.len()])
          .collect();
        let packed = t.make_tuple(&items).unwrap();
        scalars.push(t.add_n(&[packed]).unwrap());
      }
      4 if !tuples.is_empty() => {
        // the same tuple in several slots, next to a scalar half the time
        let (tuple, _) = tuples[pick % tuples.len()];
        let mut reads = vec![tuple; width + 1];
        if pick % 2 == 1 {
          reads.push(scalars[pick % scalars.len()]);
        }
        scalars.push(t.add_n(&reads).unwrap());
      }
      _ => {
        let a = scalars[pick % scalars.len()];
        let b = scalars[(pick / 2) % scalars.len()];
        scalars.push(t.add_n(&[a, b]).unwrap());
      }
    }
  }
  // keep every tuple live
  for (tuple, _) in tuples {
    scalars.push(t.add_n(&[tuple]).unwrap());
  }
  let out = t.concat(&scalars, 0).unwrap();
  t.output(out).unwrap();
  t.finish()
}

proptest! {
  #![proptest_config(ProptestConfig::with_cases(200))]

  #[test]
  fn prop_pass_terminates(steps in steps(), rule in rule()) {
    let mut g = build(&steps);
    let nodes = g.node_count();
    let report = run_pass(&mut g, &PassConfig { rule, ..Default::default() }).unwrap();
    prop_assert_eq!(report.state, PassState::Fixpoint);
    prop_assert!(report.iterations <= nodes);
    prop_assert!(g.validate().is_ok());
  }

  #[test]
  fn prop_pass_is_idempotent(steps in steps(), rule in rule()) {
    let config = PassConfig { rule, ..Default::default() };
    let mut once = build(&steps);
    run_pass(&mut once, &config).unwrap();
    let mut twice = once.duplicate().unwrap();
    let report = run_pass(&mut twice, &config).unwrap();
    prop_assert_eq!(report.rewrites, 0);
    prop_assert_eq!(report.nodes_before, report.nodes_after);
    let verdict = oracle::compare(&once, &twice);
    prop_assert!(verdict.is_ok(), "{}", verdict.unwrap_err());
  }

  #[test]
  fn prop_rules_round_trip(steps in steps()) {
    // folding then unfolding lands on the unfolded canonical form
    let unfold = PassConfig::default();
    let fold = PassConfig { rule: RewriteRule::FoldTuple, ..Default::default() };
    let mut direct = build(&steps);
    run_pass(&mut direct, &unfold).unwrap();
    let mut via_fold = build(&steps);
    run_pass(&mut via_fold, &fold).unwrap();
    run_pass(&mut via_fold, &unfold).unwrap();
    let verdict = oracle::compare(&direct, &via_fold);
    prop_assert!(verdict.is_ok(), "{}", verdict.unwrap_err());
  }

  #[test]
  fn prop_oracle_is_reflexive(steps in steps()) {
    let g = build(&steps);
    prop_assert!(oracle::structurally_equal(&g, &g));
    prop_assert!(oracle::structurally_equal(&g, &g.duplicate().unwrap()));
  }
}
