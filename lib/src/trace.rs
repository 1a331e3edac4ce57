//! Graph construction in the style of a traced function body.
//!
//! ```ignore
//! let mut t = Tracer::new();
//! let x = t.parameter("x")?;
//! let res = t.split(x, 1, 2)?;
//! let res = t.add_n(&[res])?;
//! t.output(res)?;
//! let graph = t.finish();
//! ```
use itertools::Itertools;
use luminal::prelude::NodeIndex;

use crate::error::Result;
use crate::graph::{Port, TupleGraph};
use crate::ops::{attrs, AttrValue, Attrs, OpKind};

/// A traced value: one scalar output, or a whole tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Value {
  Scalar(Port),
  Tuple(NodeIndex),
}

impl Value {
  pub fn port(self) -> Port {
    match self {
      Value::Scalar(port) => port,
      Value::Tuple(node) => node.into(),
    }
  }

  pub fn node(self) -> NodeIndex {
    self.port().node
  }
}

#[derive(Debug, Default)]
pub struct Tracer {
  graph: TupleGraph,
}

impl Tracer {
  pub fn new() -> Self {
    Self::default()
  }

  fn push(&mut self, kind: OpKind, args: &[Value], attrs: Attrs) -> Result<Value> {
    let inputs = args.iter().map(|v| v.port()).collect_vec();
    let node = self.graph.add_node(kind, &inputs, attrs)?;
    Ok(if kind.produces_tuple() {
      Value::Tuple(node)
    } else {
      Value::Scalar(node.into())
    })
  }

  pub fn parameter(&mut self, name: &str) -> Result<Value> {
    self.push(OpKind::Parameter, &[], attrs([("name", name.into())]))
  }

  pub fn split(&mut self, x: Value, axis: i64, num_outputs: usize) -> Result<Value> {
    self.push(
      OpKind::Split,
      &[x],
      attrs([
        ("axis", AttrValue::Int(axis)),
        ("num_outputs", AttrValue::Int(num_outputs as i64)),
      ]),
    )
  }

  pub fn add_n(&mut self, args: &[Value]) -> Result<Value> {
    self.push(OpKind::AddN, args, Attrs::new())
  }

  pub fn concat(&mut self, args: &[Value], axis: i64) -> Result<Value> {
    self.push(OpKind::Concat, args, attrs([("axis", AttrValue::Int(axis))]))
  }

  pub fn tuple_get_item(&mut self, t: Value, index: usize) -> Result<Value> {
    self.push(
      OpKind::TupleGetItem,
      &[t],
      attrs([("index", AttrValue::Int(index as i64))]),
    )
  }

  pub fn make_tuple(&mut self, items: &[Value]) -> Result<Value> {
    self.push(OpKind::MakeTuple, items, Attrs::new())
  }

  /// Appends `value` to the graph's return values.
  pub fn output(&mut self, value: Value) -> Result<()> {
    self.graph.mark_output(value.port())
  }

  pub fn graph(&self) -> &TupleGraph {
    &self.graph
  }

  pub fn finish(self) -> TupleGraph {
    self.graph
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::Error;

  #[test]
  fn test_trace_values() {
    let mut t = Tracer::new();
    let x = t.parameter("x").unwrap();
    let s = t.split(x, 1, 2).unwrap();
    assert!(matches!(s, Value::Tuple(_)));
    let a = t.tuple_get_item(s, 0).unwrap();
    let b = t.tuple_get_item(s, 1).unwrap();
    let packed = t.make_tuple(&[a, b]).unwrap();
    let sum = t.add_n(&[packed]).unwrap();
    let cat = t.concat(&[sum, a], 0).unwrap();
    t.output(cat).unwrap();
    let g = t.finish();
    g.validate().unwrap();
    assert_eq!(g.node_count(), 7);
    assert_eq!(g.kind(sum.node()).unwrap(), OpKind::AddN);
    assert_eq!(g.inputs(cat.node()), vec![sum.port(), a.port()]);
  }

  #[test]
  fn test_trace_rejects_misuse() {
    let mut t = Tracer::new();
    let x = t.parameter("x").unwrap();
    assert!(matches!(
      t.tuple_get_item(x, 0),
      Err(Error::InvalidInputs { .. })
    ));
    assert!(matches!(t.add_n(&[]), Err(Error::InvalidInputs { .. })));
    let s = t.split(x, 0, 2).unwrap();
    assert!(matches!(t.make_tuple(&[s]), Err(Error::InvalidInputs { .. })));
    assert_eq!(t.graph().node_count(), 2);
  }
}
