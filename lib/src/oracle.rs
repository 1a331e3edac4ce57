//! Structural equality of two graphs, independent of node ids.
//!
//! The walk starts at the ordered outputs of both graphs and pairs inputs slot by slot, building a
//! node bijection on the way. A pair already mapped elsewhere in either direction is a conflict.
use std::{collections::HashMap, fmt};

use itertools::Itertools;
use luminal::prelude::NodeIndex;

use crate::graph::TupleGraph;
use crate::ops::{Attrs, OpKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reason {
  OutputCount { left: usize, right: usize },
  Kind { left: OpKind, right: OpKind },
  Attrs { left: Attrs, right: Attrs },
  Arity { left: usize, right: usize },
  InputCount { left: usize, right: usize },
  OutputIndex { left: u8, right: u8 },
  /// The pair contradicts the bijection built so far.
  Conflict {
    left: NodeIndex,
    right: NodeIndex,
  },
  /// A node the walk never reached, on the left (`true`) or right graph.
  Unmatched { left_side: bool, node: NodeIndex },
  Unreadable { reason: String },
}

impl fmt::Display for Reason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Reason::OutputCount { left, right } => write!(f, "{left} vs {right} graph outputs"),
      Reason::Kind { left, right } => write!(f, "op kind {left} vs {right}"),
      Reason::Attrs { left, right } => write!(f, "attrs {left:?} vs {right:?}"),
      Reason::Arity { left, right } => write!(f, "output arity {left} vs {right}"),
      Reason::InputCount { left, right } => write!(f, "{left} vs {right} inputs"),
      Reason::OutputIndex { left, right } => write!(f, "reads output {left} vs {right}"),
      Reason::Conflict { left, right } => write!(
        f,
        "%{} is already paired differently than %{}",
        left.index(),
        right.index()
      ),
      Reason::Unmatched { left_side, node } => write!(
        f,
        "%{} of the {} graph has no counterpart",
        node.index(),
        if *left_side { "left" } else { "right" }
      ),
      Reason::Unreadable { reason } => write!(f, "{reason}"),
    }
  }
}

/// One difference, located by the path from a graph output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Difference {
  pub path: String,
  pub reason: Reason,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Mismatch {
  pub differences: Vec<Difference>,
}

impl fmt::Display for Mismatch {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(f, "graphs differ in {} place(s):", self.differences.len())?;
    for d in &self.differences {
      writeln!(f, "  - at {}: {}", d.path, d.reason)?;
    }
    Ok(())
  }
}

impl std::error::Error for Mismatch {}

pub fn structurally_equal(left: &TupleGraph, right: &TupleGraph) -> bool {
  compare(left, right).is_ok()
}

struct Walk<'g> {
  left: &'g TupleGraph,
  right: &'g TupleGraph,
  forward: HashMap<NodeIndex, NodeIndex>,
  backward: HashMap<NodeIndex, NodeIndex>,
  found: Vec<Difference>,
}

impl Walk<'_> {
  fn differ(&mut self, path: &str, reason: Reason) {
    self.found.push(Difference {
      path: path.to_string(),
      reason,
    });
  }

  /// Compares one pair and returns the input pairs still to visit.
  fn visit(&mut self, l: NodeIndex, r: NodeIndex, path: &str) -> Vec<(NodeIndex, NodeIndex, String)> {
    match (self.forward.get(&l), self.backward.get(&r)) {
      (Some(seen), _) if *seen == r => return vec![],
      (None, None) => {}
      _ => {
        self.differ(path, Reason::Conflict { left: l, right: r });
        return vec![];
      }
    }
    self.forward.insert(l, r);
    self.backward.insert(r, l);

    let (lk, rk) = match (self.left.kind(l), self.right.kind(r)) {
      (Ok(lk), Ok(rk)) => (lk, rk),
      (Err(e), _) | (_, Err(e)) => {
        self.differ(path, Reason::Unreadable { reason: e.to_string() });
        return vec![];
      }
    };
    let here = format!("{path} -> {lk}(%{}|%{})", l.index(), r.index());
    if lk != rk {
      self.differ(&here, Reason::Kind { left: lk, right: rk });
      return vec![];
    }
    match (self.left.attrs(l), self.right.attrs(r)) {
      (Ok(la), Ok(ra)) if la != ra => self.differ(&here, Reason::Attrs { left: la, right: ra }),
      (Ok(_), Ok(_)) => {}
      (Err(e), _) | (_, Err(e)) => self.differ(&here, Reason::Unreadable { reason: e.to_string() }),
    }
    if let (Ok(la), Ok(ra)) = (self.left.output_arity(l), self.right.output_arity(r)) {
      if la != ra {
        self.differ(&here, Reason::Arity { left: la, right: ra });
      }
    }

    let li = self.left.inputs(l);
    let ri = self.right.inputs(r);
    if li.len() != ri.len() {
      self.differ(
        &here,
        Reason::InputCount {
          left: li.len(),
          right: ri.len(),
        },
      );
      return vec![];
    }
    let mut next = vec![];
    for (slot, (lp, rp)) in li.iter().zip(&ri).enumerate() {
      let at = format!("{here} slot {slot}");
      if lp.output != rp.output {
        self.differ(
          &at,
          Reason::OutputIndex {
            left: lp.output,
            right: rp.output,
          },
        );
      }
      next.push((lp.node, rp.node, at));
    }
    next
  }
}

/// Checks `left` and `right` for a structure-preserving node bijection.
pub fn compare(left: &TupleGraph, right: &TupleGraph) -> Result<(), Mismatch> {
  let mut walk = Walk {
    left,
    right,
    forward: HashMap::new(),
    backward: HashMap::new(),
    found: vec![],
  };
  if left.outputs.len() != right.outputs.len() {
    walk.differ(
      "return",
      Reason::OutputCount {
        left: left.outputs.len(),
        right: right.outputs.len(),
      },
    );
  }

  let mut stack = vec![];
  for (i, (lp, rp)) in left.outputs.iter().zip(&right.outputs).enumerate().rev() {
    let path = format!("out[{i}]");
    if lp.output != rp.output {
      walk.differ(
        &path,
        Reason::OutputIndex {
          left: lp.output,
          right: rp.output,
        },
      );
    }
    stack.push((lp.node, rp.node, path));
  }
  while let Some((l, r, path)) = stack.pop() {
    let next = walk.visit(l, r, &path);
    stack.extend(next.into_iter().rev());
  }

  let unmatched_left = left
    .graph
    .graph
    .node_indices()
    .filter(|n| !walk.forward.contains_key(n))
    .sorted()
    .map(|node| Reason::Unmatched {
      left_side: true,
      node,
    });
  let unmatched_right = right
    .graph
    .graph
    .node_indices()
    .filter(|n| !walk.backward.contains_key(n))
    .sorted()
    .map(|node| Reason::Unmatched {
      left_side: false,
      node,
    });
  let unmatched = unmatched_left.chain(unmatched_right).collect_vec();
  for reason in unmatched {
    walk.differ("graph", reason);
  }

  if walk.found.is_empty() {
    Ok(())
  } else {
    Err(Mismatch {
      differences: walk.found,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::trace::Tracer;

  fn unfolded(axis: i64, reversed: bool) -> TupleGraph {
    let mut t = Tracer::new();
    let x = t.parameter("x").unwrap();
    let s = t.split(x, axis, 2).unwrap();
    // creation order changes the ids, not the structure
    let (a, b) = if reversed {
      let b = t.tuple_get_item(s, 1).unwrap();
      (t.tuple_get_item(s, 0).unwrap(), b)
    } else {
      let a = t.tuple_get_item(s, 0).unwrap();
      (a, t.tuple_get_item(s, 1).unwrap())
    };
    let sum = t.add_n(&[a, b]).unwrap();
    t.output(sum).unwrap();
    t.finish()
  }

  #[test]
  fn test_equal_up_to_ids() {
    let g = unfolded(1, false);
    assert!(structurally_equal(&g, &g));
    assert!(structurally_equal(&g, &unfolded(1, true)));
    assert!(structurally_equal(&g, &g.duplicate().unwrap()));
  }

  #[test]
  fn test_reports_attr_difference() {
    let err = compare(&unfolded(1, false), &unfolded(0, false)).unwrap_err();
    assert_eq!(err.differences.len(), 1);
    assert!(matches!(err.differences[0].reason, Reason::Attrs { .. }));
    let text = err.to_string();
    assert!(text.contains("graphs differ in 1 place(s)"));
    assert!(text.contains("out[0] -> AddN"));
  }

  #[test]
  fn test_reports_swapped_inputs_and_counts() {
    let mut t = Tracer::new();
    let x = t.parameter("x").unwrap();
    let s = t.split(x, 1, 2).unwrap();
    let a = t.tuple_get_item(s, 0).unwrap();
    let b = t.tuple_get_item(s, 1).unwrap();
    let sum = t.add_n(&[b, a]).unwrap();
    t.output(sum).unwrap();
    let swapped = t.finish();
    let err = compare(&unfolded(1, false), &swapped).unwrap_err();
    assert!(err.differences.iter().any(|d| matches!(d.reason, Reason::Attrs { .. })));

    let mut t = Tracer::new();
    let x = t.parameter("x").unwrap();
    let s = t.split(x, 1, 2).unwrap();
    let sum = t.add_n(&[s]).unwrap();
    t.output(sum).unwrap();
    let packed = t.finish();
    let err = compare(&unfolded(1, false), &packed).unwrap_err();
    assert!(matches!(
      err.differences[0].reason,
      Reason::InputCount { left: 2, right: 1 }
    ));
    assert!(err
      .differences
      .iter()
      .any(|d| matches!(d.reason, Reason::Unmatched { left_side: true, .. })));
  }

  #[test]
  fn test_reports_conflict() {
    // one parameter read twice vs two distinct parameters with the same name
    let mut t = Tracer::new();
    let x = t.parameter("x").unwrap();
    let sum = t.add_n(&[x, x]).unwrap();
    t.output(sum).unwrap();
    let shared = t.finish();

    let mut t = Tracer::new();
    let x = t.parameter("x").unwrap();
    let y = t.parameter("x").unwrap();
    let sum = t.add_n(&[x, y]).unwrap();
    t.output(sum).unwrap();
    let distinct = t.finish();

    let err = compare(&shared, &distinct).unwrap_err();
    assert!(err
      .differences
      .iter()
      .any(|d| matches!(d.reason, Reason::Conflict { .. })));
    assert!(!structurally_equal(&distinct, &shared));
  }
}
