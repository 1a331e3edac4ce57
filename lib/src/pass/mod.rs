//! The tuple type-transform pass.
//!
//! A variadic node (`AddN`, `Concat`) can read a tuple in two ways: as one packed argument
//! (`AddN(%split)`) or as one `TupleGetItem` accessor per element (`AddN(%get0, %get1)`).
//! The pass moves every such site to the form selected by [`RewriteRule`].
//!
//! - [`matcher`] finds motifs rooted at a tuple-producing node.
//! - [`rewrite`] applies one motif, validating before it mutates anything.
//! - [`driver`] runs the worklist to a fixpoint and wraps it as a luminal `Compiler`.
use std::{fmt, str::FromStr};

use luminal::prelude::NodeIndex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::graph::TupleGraph;

pub mod driver;
pub mod matcher;
pub mod rewrite;

#[cfg(test)]
mod props;

pub use driver::{run_pass, run_pass_checked, TypeTransform};

/// Direction of the rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RewriteRule {
  /// `V(P)` becomes `V(P[0], .., P[k-1])`.
  #[default]
  InlineUnfold,
  /// `V(P[0], .., P[k-1])` becomes `V(P)`.
  FoldTuple,
}

impl fmt::Display for RewriteRule {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RewriteRule::InlineUnfold => write!(f, "inline-unfold"),
      RewriteRule::FoldTuple => write!(f, "fold-tuple"),
    }
  }
}

impl FromStr for RewriteRule {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "inline-unfold" => Ok(RewriteRule::InlineUnfold),
      "fold-tuple" => Ok(RewriteRule::FoldTuple),
      other => Err(Error::UnknownRule {
        name: other.to_string(),
      }),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PassConfig {
  pub rule: RewriteRule,
  /// Reject conflicting accessors up front and fail the pass. When false they are skipped and reported.
  pub strict: bool,
  /// Defaults to `node_count + edge_count + 1` of the input graph.
  pub max_iterations: Option<usize>,
}

impl Default for PassConfig {
  fn default() -> Self {
    PassConfig {
      rule: RewriteRule::InlineUnfold,
      strict: true,
      max_iterations: None,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchForm {
  /// The consumer reads a `MakeTuple` pack.
  Packed,
  /// The consumer reads a `Split` (or other multi-output node) as a whole.
  Unfolded,
  /// The consumer reads one accessor per element, in index order.
  AccessorRun,
}

/// `(producer, consumer, slot)`: identifies a motif across rescans.
pub type Site = (NodeIndex, NodeIndex, u8);

/// One occurrence of the motif.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
  pub rule: RewriteRule,
  pub form: MatchForm,
  /// The tuple-producing root.
  pub producer: NodeIndex,
  /// The variadic node to rewire.
  pub consumer: NodeIndex,
  /// First input slot of `consumer` that takes part in the match.
  pub slot: u8,
  /// Canonical accessor per tuple index. Empty for `Packed`.
  pub accessors: Vec<Option<NodeIndex>>,
}

impl Match {
  pub fn site(&self) -> Site {
    (self.producer, self.consumer, self.slot)
  }
}

impl fmt::Display for Match {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{} {:?} at %{} <- %{} (slot {})",
      self.rule,
      self.form,
      self.consumer.index(),
      self.producer.index(),
      self.slot
    )
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PassState {
  #[default]
  Scanning,
  Matched,
  Rewriting,
  Fixpoint,
}

impl fmt::Display for PassState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Debug::fmt(self, f)
  }
}

/// Summary of one pass run, written as `report.json` by the CLI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassReport {
  pub rule: RewriteRule,
  pub iterations: usize,
  pub rewrites: usize,
  pub nodes_before: usize,
  pub nodes_after: usize,
  pub edges_before: usize,
  pub edges_after: usize,
  /// Producers left alone because of conflicting accessors (lenient mode only).
  pub rejected: Vec<String>,
  /// Matches the rewrite engine refused.
  pub skipped: Vec<String>,
  pub state: PassState,
}

impl PassReport {
  pub(crate) fn start(graph: &TupleGraph, rule: RewriteRule) -> Self {
    PassReport {
      rule,
      nodes_before: graph.node_count(),
      edges_before: graph.edge_count(),
      ..Default::default()
    }
  }

  pub(crate) fn finish(&mut self, graph: &TupleGraph, state: PassState) {
    self.nodes_after = graph.node_count();
    self.edges_after = graph.edge_count();
    self.state = state;
  }
}
