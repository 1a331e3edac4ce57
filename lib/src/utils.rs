use serde::Serialize;
use std::{fs::File, io::Write, path::Path};

#[cfg(not(debug_assertions))]
use human_panic::setup_panic;
use luminal::prelude::petgraph::dot::Dot;
use petgraph_graphml::GraphMl;
use snafu::ResultExt;
use tracing::subscriber::{DefaultGuard, SetGlobalDefaultError};

#[cfg(debug_assertions)]
extern crate better_panic;

use crate::error::{IoSnafu, Result, SerializeSnafu};
use crate::graph::TupleGraph;

// [NOTE] tracing
//
// Pass entry points open spans with `#[instrument(level = "debug", skip(..))]`.
// Rewrites log at `debug`, state transitions at `trace`, the pass summary at `info`.

pub fn install_logger() -> Result<(), SetGlobalDefaultError> {
  let subscriber = tracing_subscriber::fmt()
    .compact()
    .with_max_level(tracing::Level::INFO)
    .finish();
  tracing::subscriber::set_global_default(subscriber)
}

pub fn init_logging() -> Result<(), SetGlobalDefaultError> {
  // Human Panic. Only enabled when *not* debugging.
  #[cfg(not(debug_assertions))]
  {
    setup_panic!();
  }

  // Better Panic. Only enabled *when* debugging.
  #[cfg(debug_assertions)]
  {
    better_panic::Settings::debug()
      .most_recent_first(false)
      .lineno_suffix(true)
      .verbosity(better_panic::Verbosity::Full)
      .install();
  }

  install_logger()?;

  Ok(())
}

/// Subscriber scoped to the calling test, printing through the test harness.
pub fn init_logging_tests() -> DefaultGuard {
  let subscriber = tracing_subscriber::fmt()
    .with_test_writer()
    .compact()
    .with_max_level(tracing::Level::DEBUG)
    .finish();
  tracing::subscriber::set_default(subscriber)
}

fn create(path: &Path) -> Result<File> {
  File::create(path).context(IoSnafu {
    path: path.display().to_string(),
  })
}

pub fn save_graphviz(path: &Path, graph: &TupleGraph) -> Result<()> {
  let dot = Dot::with_config(&graph.graph.graph, &[]);
  let mut file = create(path)?;
  write!(file, "{:?}", dot).context(IoSnafu {
    path: path.display().to_string(),
  })
}

pub fn save_graphml(path: &Path, graph: &TupleGraph) -> Result<()> {
  let graphml = GraphMl::new(&graph.graph.graph).pretty_print(true);
  let file = create(path)?;
  graphml.to_writer(file).context(IoSnafu {
    path: path.display().to_string(),
  })
}

pub fn serialize_to_file<T: Serialize>(path: &Path, obj: &T) -> Result<()> {
  let buff = serde_json::to_string_pretty(obj).context(SerializeSnafu)?;
  std::fs::write(path, buff).context(IoSnafu {
    path: path.display().to_string(),
  })
}
