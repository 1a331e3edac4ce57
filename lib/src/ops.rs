//! Operators understood by the type-transform pass.
//!
//! Every operator is a luminal `Operator` so that it can live in a luminal graph,
//! but none of them is ever evaluated: the pass only rewrites the static graph.
//! Attributes are typed fields on the structs; `attrs_of` and `instantiate` go
//! between those fields and the generic `Attrs` map checked against `schema`.

use std::collections::BTreeMap;
use std::fmt;

use luminal::{
  op::{InputTensor, Operator},
  prelude::*,
};
use serde::Serialize;
use snafu::ensure;

use crate::error::{
  ForeignOperatorSnafu, InvalidAttributeSnafu, Result, UnknownOperatorSnafu,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum OpKind {
  /// Graph input.
  Parameter,
  /// Tensor split along an axis, yields `num_outputs` values.
  Split,
  /// Variadic sum.
  AddN,
  /// Variadic concatenation along an axis.
  Concat,
  /// Reads one element of a tuple-producing node.
  TupleGetItem,
  /// Packs its inputs into a tuple.
  MakeTuple,
}

impl OpKind {
  pub const ALL: [OpKind; 6] = [
    OpKind::Parameter,
    OpKind::Split,
    OpKind::AddN,
    OpKind::Concat,
    OpKind::TupleGetItem,
    OpKind::MakeTuple,
  ];

  pub fn name(self) -> &'static str {
    match self {
      OpKind::Parameter => "Parameter",
      OpKind::Split => "Split",
      OpKind::AddN => "AddN",
      OpKind::Concat => "Concat",
      OpKind::TupleGetItem => "TupleGetItem",
      OpKind::MakeTuple => "MakeTuple",
    }
  }

  pub fn from_name(name: &str) -> Result<Self> {
    OpKind::ALL
      .into_iter()
      .find(|k| k.name() == name)
      .ok_or_else(|| UnknownOperatorSnafu { name }.build())
  }

  /// Accepts a flattened, positional list of scalars or a single tuple.
  pub fn is_variadic(self) -> bool {
    matches!(self, OpKind::AddN | OpKind::Concat)
  }

  /// The node's value is a tuple; elements are read through accessors.
  pub fn produces_tuple(self) -> bool {
    matches!(self, OpKind::Split | OpKind::MakeTuple)
  }
}

impl fmt::Display for OpKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum AttrValue {
  Int(i64),
  Bool(bool),
  Str(String),
}

impl AttrValue {
  fn ty(&self) -> AttrType {
    match self {
      AttrValue::Int(_) => AttrType::Int,
      AttrValue::Bool(_) => AttrType::Bool,
      AttrValue::Str(_) => AttrType::Str,
    }
  }
}

impl fmt::Display for AttrValue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      AttrValue::Int(i) => write!(f, "{i}"),
      AttrValue::Bool(b) => write!(f, "{b}"),
      AttrValue::Str(s) => write!(f, "{s:?}"),
    }
  }
}

impl From<i64> for AttrValue {
  fn from(v: i64) -> Self {
    AttrValue::Int(v)
  }
}

impl From<bool> for AttrValue {
  fn from(v: bool) -> Self {
    AttrValue::Bool(v)
  }
}

impl From<&str> for AttrValue {
  fn from(v: &str) -> Self {
    AttrValue::Str(v.to_string())
  }
}

pub type Attrs = BTreeMap<String, AttrValue>;

/// Builds an attribute map from literal pairs.
pub fn attrs<const N: usize>(pairs: [(&str, AttrValue); N]) -> Attrs {
  pairs
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrType {
  Int,
  Bool,
  Str,
}

#[derive(Debug, Clone, Copy)]
pub struct AttrSpec {
  pub name: &'static str,
  pub ty: AttrType,
  pub required: bool,
  /// Lower bound for `Int` attributes.
  pub min: Option<i64>,
}

const fn int(name: &'static str, min: Option<i64>) -> AttrSpec {
  AttrSpec {
    name,
    ty: AttrType::Int,
    required: true,
    min,
  }
}

const PARAMETER_ATTRS: &[AttrSpec] = &[AttrSpec {
  name: "name",
  ty: AttrType::Str,
  required: true,
  min: None,
}];
const SPLIT_ATTRS: &[AttrSpec] = &[int("axis", None), int("num_outputs", Some(1))];
const CONCAT_ATTRS: &[AttrSpec] = &[int("axis", None)];
const TUPLE_GET_ITEM_ATTRS: &[AttrSpec] = &[int("index", Some(0))];

pub fn schema(kind: OpKind) -> &'static [AttrSpec] {
  match kind {
    OpKind::Parameter => PARAMETER_ATTRS,
    OpKind::Split => SPLIT_ATTRS,
    OpKind::Concat => CONCAT_ATTRS,
    OpKind::TupleGetItem => TUPLE_GET_ITEM_ATTRS,
    OpKind::AddN | OpKind::MakeTuple => &[],
  }
}

/// Checks `attrs` against the schema of `kind`.
pub fn validate(kind: OpKind, attrs: &Attrs) -> Result<()> {
  let specs = schema(kind);
  for (name, value) in attrs {
    let Some(spec) = specs.iter().find(|s| s.name == name) else {
      return InvalidAttributeSnafu {
        kind,
        attr: name.as_str(),
        reason: "not declared for this operator",
      }
      .fail();
    };
    ensure!(
      value.ty() == spec.ty,
      InvalidAttributeSnafu {
        kind,
        attr: name.as_str(),
        reason: format!("expected {:?}, got {value}", spec.ty),
      }
    );
    if let (AttrValue::Int(v), Some(min)) = (value, spec.min) {
      ensure!(
        *v >= min,
        InvalidAttributeSnafu {
          kind,
          attr: name.as_str(),
          reason: format!("{v} is below the minimum {min}"),
        }
      );
    }
  }
  for spec in specs.iter().filter(|s| s.required) {
    ensure!(
      attrs.contains_key(spec.name),
      InvalidAttributeSnafu {
        kind,
        attr: spec.name,
        reason: "missing",
      }
    );
  }
  Ok(())
}

fn get_int(attrs: &Attrs, name: &str) -> i64 {
  match attrs.get(name) {
    Some(AttrValue::Int(v)) => *v,
    _ => 0,
  }
}

/// Creates the luminal operator for `kind`. Attributes are validated first.
pub fn instantiate(kind: OpKind, attrs: &Attrs) -> Result<Box<dyn Operator>> {
  validate(kind, attrs)?;
  let op: Box<dyn Operator> = match kind {
    OpKind::Parameter => {
      let name = match attrs.get("name") {
        Some(AttrValue::Str(s)) => s.clone(),
        _ => String::new(),
      };
      Box::new(Parameter { name })
    }
    OpKind::Split => Box::new(Split {
      axis: get_int(attrs, "axis"),
      num_outputs: get_int(attrs, "num_outputs") as usize,
    }),
    OpKind::AddN => Box::new(AddN {}),
    OpKind::Concat => Box::new(Concat {
      axis: get_int(attrs, "axis"),
    }),
    OpKind::TupleGetItem => Box::new(TupleGetItem {
      index: get_int(attrs, "index") as usize,
    }),
    OpKind::MakeTuple => Box::new(MakeTuple {}),
  };
  Ok(op)
}

/// Recovers the kind of the operator stored at `node`.
pub fn kind_of(graph: &Graph, node: NodeIndex) -> Result<OpKind> {
  ensure!(
    graph.graph.contains_node(node),
    ForeignOperatorSnafu { node }
  );
  let kind = if graph.check_node_type::<Parameter>(node) {
    OpKind::Parameter
  } else if graph.check_node_type::<Split>(node) {
    OpKind::Split
  } else if graph.check_node_type::<AddN>(node) {
    OpKind::AddN
  } else if graph.check_node_type::<Concat>(node) {
    OpKind::Concat
  } else if graph.check_node_type::<TupleGetItem>(node) {
    OpKind::TupleGetItem
  } else if graph.check_node_type::<MakeTuple>(node) {
    OpKind::MakeTuple
  } else {
    return ForeignOperatorSnafu { node }.fail();
  };
  Ok(kind)
}

/// The operator at `node` as a `T`, if it is one.
pub fn op_as<T: Operator + 'static>(graph: &Graph, node: NodeIndex) -> Option<&T> {
  graph.graph.node_weight(node)?.as_any().downcast_ref::<T>()
}

pub(crate) fn op<T: Operator + 'static>(graph: &Graph, node: NodeIndex) -> Result<&T> {
  op_as(graph, node).ok_or_else(|| ForeignOperatorSnafu { node }.build())
}

/// Reads the typed fields of the operator at `node` back into an attribute map.
pub fn attrs_of(graph: &Graph, node: NodeIndex) -> Result<Attrs> {
  let a = match kind_of(graph, node)? {
    OpKind::Parameter => attrs([(
      "name",
      AttrValue::Str(op::<Parameter>(graph, node)?.name.clone()),
    )]),
    OpKind::Split => {
      let split = op::<Split>(graph, node)?;
      attrs([
        ("axis", AttrValue::Int(split.axis)),
        ("num_outputs", AttrValue::Int(split.num_outputs as i64)),
      ])
    }
    OpKind::Concat => attrs([("axis", AttrValue::Int(op::<Concat>(graph, node)?.axis))]),
    OpKind::TupleGetItem => attrs([(
      "index",
      AttrValue::Int(op::<TupleGetItem>(graph, node)?.index as i64),
    )]),
    OpKind::AddN | OpKind::MakeTuple => Attrs::new(),
  };
  Ok(a)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
  pub name: String,
}

impl Operator for Parameter {
  fn process(&mut self, _inp: Vec<(InputTensor, ShapeTracker)>) -> Vec<Tensor> {
    panic!("Parameter: the type-transform graph is never evaluated")
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
  pub axis: i64,
  pub num_outputs: usize,
}

impl Operator for Split {
  fn process(&mut self, _inp: Vec<(InputTensor, ShapeTracker)>) -> Vec<Tensor> {
    panic!("Split: the type-transform graph is never evaluated")
  }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AddN {}

impl Operator for AddN {
  fn process(&mut self, _inp: Vec<(InputTensor, ShapeTracker)>) -> Vec<Tensor> {
    panic!("AddN: the type-transform graph is never evaluated")
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Concat {
  pub axis: i64,
}

impl Operator for Concat {
  fn process(&mut self, _inp: Vec<(InputTensor, ShapeTracker)>) -> Vec<Tensor> {
    panic!("Concat: the type-transform graph is never evaluated")
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TupleGetItem {
  pub index: usize,
}

impl Operator for TupleGetItem {
  fn process(&mut self, _inp: Vec<(InputTensor, ShapeTracker)>) -> Vec<Tensor> {
    panic!("TupleGetItem: the type-transform graph is never evaluated")
  }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MakeTuple {}

impl Operator for MakeTuple {
  fn process(&mut self, _inp: Vec<(InputTensor, ShapeTracker)>) -> Vec<Tensor> {
    panic!("MakeTuple: the type-transform graph is never evaluated")
  }
}
