//! Named graphs for tests and the CLI.
//!
//! Tags follow `<case>/before` and `<case>/after` for before/after pairs. Standalone graphs have a
//! plain tag.
use std::collections::BTreeMap;

use tracing::debug;

use crate::error::{Result, UnknownFixtureSnafu};
use crate::graph::TupleGraph;
use crate::oracle::{self, Mismatch};
use crate::pass::{run_pass, PassConfig, PassReport, RewriteRule};
use crate::trace::Tracer;

#[derive(Debug, Default)]
pub struct FixtureRegistry {
  graphs: BTreeMap<String, TupleGraph>,
  /// Case name -> rule that turns `before` into `after`.
  cases: BTreeMap<String, RewriteRule>,
}

impl FixtureRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&mut self, tag: impl Into<String>, graph: TupleGraph) -> Option<TupleGraph> {
    self.graphs.insert(tag.into(), graph)
  }

  pub fn insert_case(&mut self, name: &str, rule: RewriteRule, before: TupleGraph, after: TupleGraph) {
    self.insert(format!("{name}/before"), before);
    self.insert(format!("{name}/after"), after);
    self.cases.insert(name.to_string(), rule);
  }

  pub fn tags(&self) -> impl Iterator<Item = &str> {
    self.graphs.keys().map(String::as_str)
  }

  pub fn cases(&self) -> impl Iterator<Item = (&str, RewriteRule)> {
    self.cases.iter().map(|(name, rule)| (name.as_str(), *rule))
  }

  pub fn get(&self, tag: &str) -> Result<&TupleGraph> {
    match self.graphs.get(tag) {
      Some(g) => Ok(g),
      None => UnknownFixtureSnafu { tag }.fail(),
    }
  }

  /// A fresh copy of the graph stored under `tag`.
  pub fn fetch(&self, tag: &str) -> Result<TupleGraph> {
    self.get(tag)?.duplicate()
  }

  /// Runs the case's rule on `<name>/before` and compares the result with `<name>/after`.
  pub fn check_case(&self, name: &str, strict: bool) -> Result<(PassReport, Result<(), Mismatch>)> {
    let Some(rule) = self.cases.get(name).copied() else {
      return UnknownFixtureSnafu { tag: name }.fail();
    };
    let mut graph = self.fetch(&format!("{name}/before"))?;
    let expected = self.get(&format!("{name}/after"))?;
    let config = PassConfig {
      rule,
      strict,
      max_iterations: None,
    };
    let report = run_pass(&mut graph, &config)?;
    let verdict = oracle::compare(&graph, expected);
    debug!("case {} checked: {}", name, verdict.is_ok());
    Ok((report, verdict))
  }
}

/// `x -> Split -> AddN(tuple) -> Split -> AddN(MakeTuple(get 0, get 1))`.
pub fn tuple_unfold_before() -> Result<TupleGraph> {
  let mut t = Tracer::new();
  let x = t.parameter("x")?;
  let res = t.split(x, 1, 2)?;
  let res = t.add_n(&[res])?;
  let res = t.split(res, 0, 2)?;
  let a = t.tuple_get_item(res, 0)?;
  let b = t.tuple_get_item(res, 1)?;
  let packed = t.make_tuple(&[a, b])?;
  let res = t.add_n(&[packed])?;
  t.output(res)?;
  Ok(t.finish())
}

/// Both variadic nodes read one accessor per element.
pub fn tuple_unfold_after() -> Result<TupleGraph> {
  let mut t = Tracer::new();
  let x = t.parameter("x")?;
  let res = t.split(x, 1, 2)?;
  let a = t.tuple_get_item(res, 0)?;
  let b = t.tuple_get_item(res, 1)?;
  let res = t.add_n(&[a, b])?;
  let res = t.split(res, 0, 2)?;
  let a = t.tuple_get_item(res, 0)?;
  let b = t.tuple_get_item(res, 1)?;
  let res = t.add_n(&[a, b])?;
  t.output(res)?;
  Ok(t.finish())
}

/// Accessor runs feeding `AddN` and `Concat`. Folding packs both back onto the split.
pub fn fold_tuple_before() -> Result<TupleGraph> {
  let mut t = Tracer::new();
  let x = t.parameter("x")?;
  let s = t.split(x, 0, 3)?;
  let a = t.tuple_get_item(s, 0)?;
  let b = t.tuple_get_item(s, 1)?;
  let c = t.tuple_get_item(s, 2)?;
  let sum = t.add_n(&[a, b, c])?;
  let cat = t.concat(&[a, b, c], 1)?;
  t.output(sum)?;
  t.output(cat)?;
  Ok(t.finish())
}

pub fn fold_tuple_after() -> Result<TupleGraph> {
  let mut t = Tracer::new();
  let x = t.parameter("x")?;
  let s = t.split(x, 0, 3)?;
  let sum = t.add_n(&[s])?;
  let cat = t.concat(&[s], 1)?;
  t.output(sum)?;
  t.output(cat)?;
  Ok(t.finish())
}

/// Tuples are only read through partial accessors, so neither rule applies.
pub fn no_motif() -> Result<TupleGraph> {
  let mut t = Tracer::new();
  let x = t.parameter("x")?;
  let y = t.parameter("y")?;
  let s = t.split(x, 0, 2)?;
  let a = t.tuple_get_item(s, 0)?;
  let sum = t.add_n(&[a, y])?;
  let cat = t.concat(&[sum, x], 0)?;
  t.output(cat)?;
  Ok(t.finish())
}

/// Two accessors claim index 0 and feed different consumers.
pub fn duplicate_index() -> Result<TupleGraph> {
  let mut t = Tracer::new();
  let x = t.parameter("x")?;
  let s = t.split(x, 0, 2)?;
  let a = t.tuple_get_item(s, 0)?;
  let a2 = t.tuple_get_item(s, 0)?;
  let left = t.add_n(&[a])?;
  let right = t.concat(&[a2], 0)?;
  let whole = t.add_n(&[s])?;
  let out = t.add_n(&[left, right, whole])?;
  t.output(out)?;
  Ok(t.finish())
}

/// A tuple read next to another input, which the rewrite does not handle.
pub fn interleaved() -> Result<TupleGraph> {
  let mut t = Tracer::new();
  let x = t.parameter("x")?;
  let s = t.split(x, 0, 2)?;
  let sum = t.add_n(&[x, s])?;
  t.output(sum)?;
  Ok(t.finish())
}

/// One tuple read whole through several slots of the same consumer.
pub fn repeated_tuple() -> Result<TupleGraph> {
  let mut t = Tracer::new();
  let x = t.parameter("x")?;
  let s = t.split(x, 0, 2)?;
  let sum = t.add_n(&[s, s, s, s])?;
  t.output(sum)?;
  Ok(t.finish())
}

/// Every fixture, built once.
pub fn suite() -> Result<FixtureRegistry> {
  let mut registry = FixtureRegistry::new();
  registry.insert_case(
    "tuple_unfold_to_tuple_unfold",
    RewriteRule::InlineUnfold,
    tuple_unfold_before()?,
    tuple_unfold_after()?,
  );
  registry.insert_case(
    "fold_tuple",
    RewriteRule::FoldTuple,
    fold_tuple_before()?,
    fold_tuple_after()?,
  );
  registry.insert("no_motif", no_motif()?);
  registry.insert("duplicate_index", duplicate_index()?);
  registry.insert("interleaved", interleaved()?);
  registry.insert("repeated_tuple", repeated_tuple()?);
  Ok(registry)
}
