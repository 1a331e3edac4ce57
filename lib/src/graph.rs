//! The dataflow graph the type-transform pass works on.
//!
//! Note: graph representation:
//!   The graph is a luminal `Graph`, a DAG whose node weights are boxed operators from `crate::ops`.
//!   An incoming `Dependency::Data` edge records:
//!     - `input_order`: the slot in the argument list of the target node
//!     - `output_order`: which output of the source node is read
//!     - `shape`: always the scalar tracker, shapes play no part in this pass
//!
//!   `Split` and `MakeTuple` nodes produce a tuple. An edge leaving them carries the whole tuple,
//!   single elements are read through `TupleGetItem` accessors.
//!   Graph outputs are kept in order next to the luminal graph and mirrored into `to_retrieve`.

use std::{
  collections::{BTreeSet, HashMap, HashSet, VecDeque},
  fmt,
};

use itertools::Itertools;
use luminal::{prelude::*, shape::Shape};
use luminal::prelude::petgraph::{
  self,
  stable_graph::EdgeIndex,
  visit::{EdgeRef, IntoEdgeReferences},
  Direction::{Incoming, Outgoing},
};
use snafu::ensure;
use tracing::{debug, instrument, trace};

use crate::error::{
  DanglingReferenceSnafu, InvalidGraphSnafu, InvalidInputsSnafu, InvalidPortSnafu, Result,
  TooManyInputsSnafu,
};
use crate::ops::{self, Attrs, OpKind};

/// One output of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Port {
  pub node: NodeIndex,
  pub output: u8,
}

impl Port {
  pub fn new(node: NodeIndex, output: u8) -> Self {
    Port { node, output }
  }
}

impl From<NodeIndex> for Port {
  fn from(node: NodeIndex) -> Self {
    Port { node, output: 0 }
  }
}

impl fmt::Display for Port {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "%{}:{}", self.node.index(), self.output)
  }
}

/// A consumer reading some output of a node at input `slot`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Use {
  pub consumer: NodeIndex,
  pub slot: u8,
  pub output: u8,
}

/// Incoming data edge, as `(edge, input slot, source port)`.
type InEdge = (EdgeIndex, u8, Port);

#[derive(Debug)]
pub struct TupleGraph {
  pub graph: Graph,
  /// Ordered return values of the graph.
  pub outputs: Vec<Port>,
}

impl Default for TupleGraph {
  fn default() -> Self {
    Self::new()
  }
}

impl TupleGraph {
  pub fn new() -> Self {
    TupleGraph {
      graph: Graph::new(),
      outputs: vec![],
    }
  }

  pub fn contains(&self, node: NodeIndex) -> bool {
    self.graph.graph.contains_node(node)
  }

  pub fn kind(&self, node: NodeIndex) -> Result<OpKind> {
    ops::kind_of(&self.graph, node)
  }

  pub fn attrs(&self, node: NodeIndex) -> Result<Attrs> {
    ops::attrs_of(&self.graph, node)
  }

  pub fn produces_tuple(&self, node: NodeIndex) -> Result<bool> {
    Ok(self.kind(node)?.produces_tuple())
  }

  /// Index attribute of an accessor node, `None` for any other node.
  pub fn accessor_index(&self, node: NodeIndex) -> Option<usize> {
    ops::op_as::<ops::TupleGetItem>(&self.graph, node).map(|op| op.index)
  }

  pub fn output_arity(&self, node: NodeIndex) -> Result<usize> {
    let arity = match self.kind(node)? {
      OpKind::Split => ops::op::<ops::Split>(&self.graph, node)?.num_outputs,
      OpKind::MakeTuple => self.incoming(node).len(),
      _ => 1,
    };
    Ok(arity)
  }

  pub fn node_count(&self) -> usize {
    self.graph.graph.node_count()
  }

  pub fn edge_count(&self) -> usize {
    self.graph.graph.edge_count()
  }

  fn incoming(&self, node: NodeIndex) -> Vec<InEdge> {
    self
      .graph
      .graph
      .edges_directed(node, Incoming)
      .filter_map(|e| {
        e.weight()
          .as_data()
          .map(|(slot, output, _)| (e.id(), slot, Port::new(e.source(), output)))
      })
      .sorted_by_key(|(_, slot, _)| *slot)
      .collect()
  }

  /// Inputs of `node` in slot order.
  pub fn inputs(&self, node: NodeIndex) -> Vec<Port> {
    self.incoming(node).into_iter().map(|(_, _, p)| p).collect()
  }

  /// Every data edge leaving `node`, ordered by consumer and slot.
  pub fn consumers(&self, node: NodeIndex) -> Vec<Use> {
    self
      .graph
      .graph
      .edges_directed(node, Outgoing)
      .filter_map(|e| {
        e.weight().as_data().map(|(slot, output, _)| Use {
          consumer: e.target(),
          slot,
          output,
        })
      })
      .sorted()
      .collect()
  }

  pub fn is_output(&self, node: NodeIndex) -> bool {
    self.outputs.iter().any(|p| p.node == node)
  }

  fn check_port(&self, port: Port) -> Result<()> {
    ensure!(
      self.contains(port.node),
      InvalidPortSnafu {
        node: port.node,
        output: port.output,
      }
    );
    // A tuple is consumed as a whole, its elements go through accessors.
    let limit = if self.produces_tuple(port.node)? {
      1
    } else {
      self.output_arity(port.node)?
    };
    ensure!(
      (port.output as usize) < limit,
      InvalidPortSnafu {
        node: port.node,
        output: port.output,
      }
    );
    Ok(())
  }

  /// Per-kind input rules, checked on construction and by `validate`.
  fn check_inputs(&self, kind: OpKind, attrs: &Attrs, inputs: &[Port]) -> Result<()> {
    let tuples = inputs
      .iter()
      .map(|p| self.produces_tuple(p.node))
      .collect::<Result<Vec<_>>>()?;
    let scalar_inputs = || tuples.iter().all(|t| !t);
    match kind {
      OpKind::Parameter => {
        ensure!(
          inputs.is_empty(),
          InvalidInputsSnafu {
            kind,
            reason: "a parameter takes no inputs",
          }
        )
      }
      OpKind::Split => {
        ensure!(
          inputs.len() == 1 && scalar_inputs(),
          InvalidInputsSnafu {
            kind,
            reason: "expects exactly one scalar input",
          }
        )
      }
      OpKind::TupleGetItem => {
        ensure!(
          inputs.len() == 1 && tuples[0],
          InvalidInputsSnafu {
            kind,
            reason: "expects exactly one tuple-producing input",
          }
        );
        let index = match attrs.get("index") {
          Some(ops::AttrValue::Int(i)) => *i as usize,
          _ => 0,
        };
        let arity = self.output_arity(inputs[0].node)?;
        ensure!(
          index < arity,
          InvalidInputsSnafu {
            kind,
            reason: format!("index {index} is out of range for a tuple of {arity}"),
          }
        );
      }
      OpKind::MakeTuple => {
        ensure!(
          !inputs.is_empty() && scalar_inputs(),
          InvalidInputsSnafu {
            kind,
            reason: "packs one or more scalar values",
          }
        )
      }
      OpKind::AddN | OpKind::Concat => {
        ensure!(
          !inputs.is_empty(),
          InvalidInputsSnafu {
            kind,
            reason: "expects at least one input",
          }
        )
      }
    }
    Ok(())
  }

  fn connect(&mut self, from: Port, to: NodeIndex, slot: u8) -> EdgeIndex {
    self.graph.graph.add_edge(
      from.node,
      to,
      Dependency::Data {
        input_order: slot,
        output_order: from.output,
        shape: R0::to_tracker(),
      },
    )
  }

  /// Appends a node reading `inputs` in order.
  #[instrument(level = "trace", skip(self, attrs))]
  pub fn add_node(&mut self, kind: OpKind, inputs: &[Port], attrs: Attrs) -> Result<NodeIndex> {
    let op = ops::instantiate(kind, &attrs)?;
    ensure!(
      inputs.len() <= u8::MAX as usize,
      InvalidInputsSnafu {
        kind,
        reason: format!("{} inputs do not fit in the slot range", inputs.len()),
      }
    );
    for port in inputs {
      self.check_port(*port)?;
    }
    self.check_inputs(kind, &attrs, inputs)?;
    let node = self.graph.graph.add_node(op);
    for (slot, port) in inputs.iter().enumerate() {
      self.connect(*port, node, slot as u8);
    }
    trace!("added {} as {:?}", kind, node);
    Ok(node)
  }

  /// Appends `port` to the ordered graph outputs.
  pub fn mark_output(&mut self, port: Port) -> Result<()> {
    self.check_port(port)?;
    self.outputs.push(port);
    self.sync_retrieve();
    Ok(())
  }

  fn sync_retrieve(&mut self) {
    self.graph.to_retrieve.clear();
    self.graph.no_delete.clear();
    for port in &self.outputs {
      self
        .graph
        .to_retrieve
        .insert(port.node, (port.output, R0::to_tracker()));
      self.graph.no_delete.insert(port.node);
    }
  }

  /// Points every use of `old` (consumer edges and graph outputs) at `new`, keeping input slots.
  #[instrument(level = "debug", skip(self))]
  pub fn replace_uses(&mut self, old: Port, new: Port) -> Result<usize> {
    self.check_port(new)?;
    let uses: Vec<(EdgeIndex, u8, NodeIndex)> = self
      .graph
      .graph
      .edges_directed(old.node, Outgoing)
      .filter_map(|e| {
        e.weight()
          .as_data()
          .filter(|(_, output, _)| *output == old.output)
          .map(|(slot, _, _)| (e.id(), slot, e.target()))
      })
      .collect();
    for (_, _, consumer) in &uses {
      ensure!(
        !petgraph::algo::has_path_connecting(&self.graph.graph, *consumer, new.node, None),
        InvalidGraphSnafu {
          reason: format!("rewiring {old} to {new} would create a cycle through {consumer:?}"),
        }
      );
    }
    for (edge, slot, consumer) in &uses {
      self.graph.graph.remove_edge(*edge);
      self.connect(new, *consumer, *slot);
    }
    let mut replaced = uses.len();
    for port in self.outputs.iter_mut().filter(|p| **p == old) {
      *port = new;
      replaced += 1;
    }
    self.sync_retrieve();
    debug!("replaced {} use(s) of {} with {}", replaced, old, new);
    Ok(replaced)
  }

  /// Replaces the whole input list of `node`. Checks everything before touching the graph.
  pub fn set_inputs(&mut self, node: NodeIndex, inputs: &[Port]) -> Result<()> {
    ensure!(inputs.len() <= u8::MAX as usize, TooManyInputsSnafu { node });
    for port in inputs {
      self.check_port(*port)?;
    }
    let old: Vec<EdgeIndex> = self.incoming(node).into_iter().map(|(e, _, _)| e).collect();
    for edge in old {
      self.graph.graph.remove_edge(edge);
    }
    for (slot, port) in inputs.iter().enumerate() {
      self.connect(*port, node, slot as u8);
    }
    Ok(())
  }

  /// Removes a node nothing refers to any more.
  pub fn remove_node(&mut self, node: NodeIndex) -> Result<()> {
    let uses = self.graph.graph.edges_directed(node, Outgoing).count()
      + self.outputs.iter().filter(|p| p.node == node).count();
    ensure!(uses == 0, DanglingReferenceSnafu { node, uses });
    self.graph.graph.remove_node(node);
    self.graph.no_delete.remove(&node);
    trace!("removed {:?}", node);
    Ok(())
  }

  /// Live nodes in topological order.
  pub fn live_nodes(&self) -> Result<Vec<NodeIndex>> {
    petgraph::algo::toposort(&self.graph.graph, None).map_err(|cycle| {
      InvalidGraphSnafu {
        reason: format!("cycle through {:?}", cycle.node_id()),
      }
      .build()
    })
  }

  fn reachable_from_outputs(&self) -> HashSet<NodeIndex> {
    let mut seen = HashSet::new();
    let mut queue: VecDeque<NodeIndex> = self.outputs.iter().map(|p| p.node).collect();
    while let Some(x) = queue.pop_front() {
      if seen.insert(x) {
        queue.extend(self.graph.graph.neighbors_directed(x, Incoming));
      }
    }
    seen
  }

  /// Removes nodes that no output depends on. Returns how many were removed.
  pub fn prune_dead(&mut self) -> Result<usize> {
    let live = self.reachable_from_outputs();
    let mut removed = 0;
    for node in self.live_nodes()?.into_iter().rev() {
      if !live.contains(&node) {
        self.remove_node(node)?;
        removed += 1;
      }
    }
    Ok(removed)
  }

  /// Checks the structural invariants of the graph.
  pub fn validate(&self) -> Result<()> {
    let order = self.live_nodes()?;
    for port in &self.outputs {
      self.check_port(*port)?;
    }
    for &node in &order {
      let kind = self.kind(node)?;
      let attrs = self.attrs(node)?;
      let incoming = self.incoming(node);
      for (i, (_, slot, port)) in incoming.iter().enumerate() {
        ensure!(
          *slot as usize == i,
          InvalidGraphSnafu {
            reason: format!("input slots of {node:?} are not dense"),
          }
        );
        self.check_port(*port)?;
      }
      let inputs: Vec<Port> = incoming.into_iter().map(|(_, _, p)| p).collect();
      self.check_inputs(kind, &attrs, &inputs)?;
    }
    let live = self.reachable_from_outputs();
    if let Some(dead) = order.iter().find(|n| !live.contains(n)) {
      return InvalidGraphSnafu {
        reason: format!("{dead:?} is not reachable from any output"),
      }
      .fail();
    }
    Ok(())
  }

  /// Rebuilds an independent copy of the graph. Node indices are compacted.
  pub fn duplicate(&self) -> Result<TupleGraph> {
    let mut g = Graph::new();
    let mut map: HashMap<NodeIndex, NodeIndex> = HashMap::new();
    for x in self.graph.graph.node_indices().sorted() {
      let op = ops::instantiate(self.kind(x)?, &self.attrs(x)?)?;
      map.insert(x, g.graph.add_node(op));
    }
    for e in self.graph.graph.edge_references() {
      g.graph
        .add_edge(map[&e.source()], map[&e.target()], e.weight().clone());
    }
    let mut copy = TupleGraph {
      graph: g,
      outputs: self
        .outputs
        .iter()
        .map(|p| Port::new(map[&p.node], p.output))
        .collect(),
    };
    copy.sync_retrieve();
    Ok(copy)
  }

  /// Nodes of the given kind, in index order.
  pub fn nodes_of(&self, kind: OpKind) -> BTreeSet<NodeIndex> {
    self
      .graph
      .graph
      .node_indices()
      .filter(|n| self.kind(*n).map(|k| k == kind).unwrap_or(false))
      .collect()
  }
}

impl fmt::Display for TupleGraph {
  /// One line per node in topological order, e.g. `%3 = AddN(%1:0, %2:0)`.
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let order = match self.live_nodes() {
      Ok(order) => order,
      Err(e) => return write!(f, "<{e}>"),
    };
    for node in order {
      let (Ok(kind), Ok(attrs)) = (self.kind(node), self.attrs(node)) else {
        writeln!(f, "%{} = <foreign>", node.index())?;
        continue;
      };
      write!(f, "%{} = {}", node.index(), kind)?;
      if !attrs.is_empty() {
        let a = attrs.iter().map(|(k, v)| format!("{k}={v}")).join(", ");
        write!(f, "[{a}]")?;
      }
      let args = self.inputs(node).iter().map(|p| p.to_string()).join(", ");
      writeln!(f, "({args})")?;
    }
    let outs = self.outputs.iter().map(|p| p.to_string()).join(", ");
    write!(f, "return ({outs})")
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::Error;
  use crate::ops::{attrs, AttrValue};

  fn split(axis: i64, n: i64) -> Attrs {
    attrs([
      ("axis", AttrValue::Int(axis)),
      ("num_outputs", AttrValue::Int(n)),
    ])
  }

  fn get(index: i64) -> Attrs {
    attrs([("index", AttrValue::Int(index))])
  }

  fn param(g: &mut TupleGraph, name: &str) -> NodeIndex {
    g.add_node(
      OpKind::Parameter,
      &[],
      attrs([("name", AttrValue::from(name))]),
    )
    .unwrap()
  }

  #[test]
  fn test_add_node_wires_slots_in_order() {
    let mut g = TupleGraph::new();
    let a = param(&mut g, "a");
    let b = param(&mut g, "b");
    let sum = g
      .add_node(OpKind::AddN, &[b.into(), a.into()], Attrs::new())
      .unwrap();
    assert_eq!(g.inputs(sum), vec![Port::from(b), Port::from(a)]);
    assert_eq!(g.consumers(a), vec![Use { consumer: sum, slot: 1, output: 0 }]);
  }

  #[test]
  fn test_add_node_rejects_bad_wiring() {
    let mut g = TupleGraph::new();
    let x = param(&mut g, "x");
    // accessor on a scalar
    assert!(matches!(
      g.add_node(OpKind::TupleGetItem, &[x.into()], get(0)),
      Err(Error::InvalidInputs { .. })
    ));
    let s = g.add_node(OpKind::Split, &[x.into()], split(0, 2)).unwrap();
    assert!(matches!(
      g.add_node(OpKind::TupleGetItem, &[s.into()], get(2)),
      Err(Error::InvalidInputs { .. })
    ));
    // elements of a tuple are not addressable by output index
    assert!(matches!(
      g.add_node(OpKind::AddN, &[Port::new(s, 1)], Attrs::new()),
      Err(Error::InvalidPort { .. })
    ));
    assert!(matches!(
      g.add_node(OpKind::Split, &[x.into()], split(0, 0)),
      Err(Error::InvalidAttribute { .. })
    ));
  }

  #[test]
  fn test_set_inputs_caps_slots() {
    let mut g = TupleGraph::new();
    let x = param(&mut g, "x");
    let sum = g.add_node(OpKind::AddN, &[x.into()], Attrs::new()).unwrap();
    let wide = vec![Port::from(x); 256];
    assert!(matches!(
      g.set_inputs(sum, &wide),
      Err(Error::TooManyInputs { node }) if node == sum
    ));
    assert_eq!(g.inputs(sum), vec![Port::from(x)]);
    g.set_inputs(sum, &wide[..255]).unwrap();
    assert_eq!(g.inputs(sum).len(), 255);
  }

  #[test]
  fn test_output_arity() {
    let mut g = TupleGraph::new();
    let x = param(&mut g, "x");
    let y = param(&mut g, "y");
    let s = g.add_node(OpKind::Split, &[x.into()], split(1, 3)).unwrap();
    let t = g
      .add_node(OpKind::MakeTuple, &[x.into(), y.into()], Attrs::new())
      .unwrap();
    assert_eq!(g.output_arity(s).unwrap(), 3);
    assert_eq!(g.output_arity(t).unwrap(), 2);
    assert_eq!(g.output_arity(x).unwrap(), 1);
  }

  #[test]
  fn test_replace_uses_keeps_slots_and_outputs() {
    let mut g = TupleGraph::new();
    let a = param(&mut g, "a");
    let b = param(&mut g, "b");
    let c = param(&mut g, "c");
    let sum = g
      .add_node(OpKind::AddN, &[a.into(), b.into(), a.into()], Attrs::new())
      .unwrap();
    g.mark_output(sum.into()).unwrap();
    g.mark_output(a.into()).unwrap();

    let n = g.replace_uses(a.into(), c.into()).unwrap();
    assert_eq!(n, 3);
    assert_eq!(g.inputs(sum), vec![c.into(), b.into(), c.into()]);
    assert_eq!(g.outputs, vec![sum.into(), c.into()]);
    assert!(g.consumers(a).is_empty());
  }

  #[test]
  fn test_replace_uses_refuses_cycle() {
    let mut g = TupleGraph::new();
    let a = param(&mut g, "a");
    let sum = g.add_node(OpKind::AddN, &[a.into()], Attrs::new()).unwrap();
    let sum2 = g.add_node(OpKind::AddN, &[sum.into()], Attrs::new()).unwrap();
    assert!(matches!(
      g.replace_uses(a.into(), sum2.into()),
      Err(Error::InvalidGraph { .. })
    ));
    assert_eq!(g.inputs(sum), vec![a.into()]);
  }

  #[test]
  fn test_remove_node_dangling() {
    let mut g = TupleGraph::new();
    let a = param(&mut g, "a");
    let sum = g.add_node(OpKind::AddN, &[a.into()], Attrs::new()).unwrap();
    g.mark_output(sum.into()).unwrap();
    assert!(matches!(
      g.remove_node(a),
      Err(Error::DanglingReference { uses: 1, .. })
    ));
    assert!(matches!(
      g.remove_node(sum),
      Err(Error::DanglingReference { .. })
    ));
    assert!(g.contains(a) && g.contains(sum));
  }

  #[test]
  fn test_validate_and_prune() {
    let mut g = TupleGraph::new();
    let x = param(&mut g, "x");
    let s = g.add_node(OpKind::Split, &[x.into()], split(0, 2)).unwrap();
    let g0 = g.add_node(OpKind::TupleGetItem, &[s.into()], get(0)).unwrap();
    let _unused = g.add_node(OpKind::TupleGetItem, &[s.into()], get(1)).unwrap();
    g.mark_output(g0.into()).unwrap();
    assert!(matches!(g.validate(), Err(Error::InvalidGraph { .. })));
    assert_eq!(g.prune_dead().unwrap(), 1);
    g.validate().unwrap();
  }

  #[test]
  fn test_duplicate_is_independent() {
    let mut g = TupleGraph::new();
    let x = param(&mut g, "x");
    let s = g.add_node(OpKind::Split, &[x.into()], split(1, 2)).unwrap();
    let sum = g.add_node(OpKind::AddN, &[s.into()], Attrs::new()).unwrap();
    g.mark_output(sum.into()).unwrap();

    let mut copy = g.duplicate().unwrap();
    copy.validate().unwrap();
    assert_eq!(copy.node_count(), 3);
    assert_eq!(copy.to_string(), g.to_string());

    let y = param(&mut copy, "y");
    copy.mark_output(y.into()).unwrap();
    assert_eq!(g.node_count(), 3);
    assert_eq!(g.outputs.len(), 1);
  }

  #[test]
  fn test_display() {
    let mut g = TupleGraph::new();
    let x = param(&mut g, "x");
    let s = g.add_node(OpKind::Split, &[x.into()], split(1, 2)).unwrap();
    g.mark_output(s.into()).unwrap();
    let text = g.to_string();
    assert!(text.contains("Split[axis=1, num_outputs=2](%0:0)"));
    assert!(text.ends_with("return (%1:0)"));
  }
}
