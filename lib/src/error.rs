//! Error types for graph construction and the type-transform pass.

use luminal::prelude::NodeIndex;
use snafu::Snafu;

use crate::ops::OpKind;

/// Result type for graph and pass operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
  /// Two accessors read the same tuple element but feed different consumers.
  #[snafu(display(
    "malformed access pattern: producer {producer:?} has conflicting accessors for index {index}"
  ))]
  MalformedAccessPattern { producer: NodeIndex, index: usize },

  /// A match reached the rewrite stage in a shape the rewrite cannot handle.
  #[snafu(display("unsupported match shape at consumer {consumer:?}: {reason}"))]
  UnsupportedMatchShape { consumer: NodeIndex, reason: String },

  /// Removal of a node that is still referenced.
  #[snafu(display("node {node:?} is still referenced by {uses} use(s)"))]
  DanglingReference { node: NodeIndex, uses: usize },

  #[snafu(display("invalid attribute `{attr}` for {kind:?}: {reason}"))]
  InvalidAttribute {
    kind: OpKind,
    attr: String,
    reason: String,
  },

  #[snafu(display("invalid inputs for {kind:?}: {reason}"))]
  InvalidInputs { kind: OpKind, reason: String },

  #[snafu(display("port {node:?}:{output} does not exist"))]
  InvalidPort { node: NodeIndex, output: u8 },

  #[snafu(display("node {node:?} would exceed {} inputs", u8::MAX))]
  TooManyInputs { node: NodeIndex },

  #[snafu(display("graph invariant violated: {reason}"))]
  InvalidGraph { reason: String },

  #[snafu(display("node {node:?} holds an operator unknown to this pass"))]
  ForeignOperator { node: NodeIndex },

  #[snafu(display("unknown operator `{name}`"))]
  UnknownOperator { name: String },

  #[snafu(display("unknown rewrite rule `{name}`, expected `inline-unfold` or `fold-tuple`"))]
  UnknownRule { name: String },

  /// A rewrite succeeded but did not lower the progress potential.
  #[snafu(display("rewrite made no progress: potential {before} -> {after}"))]
  NoProgress { before: usize, after: usize },

  #[snafu(display("pass did not reach a fixpoint within {limit} iterations"))]
  IterationLimit { limit: usize },

  #[snafu(display("unknown fixture `{tag}`"))]
  UnknownFixture { tag: String },

  #[snafu(display("I/O error on {path}: {source}"))]
  Io {
    path: String,
    source: std::io::Error,
  },

  #[snafu(display("serialization failed: {source}"))]
  Serialize { source: serde_json::Error },
}

impl Error {
  /// Errors the driver may recover from by skipping the offending motif.
  pub fn is_recoverable(&self) -> bool {
    matches!(
      self,
      Error::MalformedAccessPattern { .. } | Error::UnsupportedMatchShape { .. }
    )
  }
}
