//! Tuple unfolding type-transform pass over luminal graphs.
//!
//! Graphs are built with [`trace::Tracer`], rewritten by [`pass::run_pass`] (or the
//! [`pass::TypeTransform`] compiler) and compared with [`oracle::compare`].

pub mod error;
pub mod fixtures;
pub mod graph;
pub mod ops;
pub mod oracle;
pub mod pass;
pub mod trace;
pub mod utils;

pub use error::{Error, Result};
pub use graph::{Port, TupleGraph, Use};
pub use ops::{AttrValue, Attrs, OpKind};
pub use pass::{run_pass, run_pass_checked, PassConfig, PassReport, RewriteRule, TypeTransform};
