use serde::Deserialize;
use std::{error::Error, path::{Path, PathBuf}};

use tuplepass::{PassConfig, RewriteRule};

/// Settings of the `run` command.
/// Also defines the config file format (every field can be omitted).
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
  /// `inline-unfold` or `fold-tuple`
  pub rule: Option<RewriteRule>,
  /// Fail on conflicting accessors instead of skipping them
  pub strict: Option<bool>,
  pub max_iterations: Option<usize>,
  /// Directory for graph dumps and the report
  pub artifacts: Option<PathBuf>,
}

impl AppConfig {
  pub fn load(path: &Path) -> Result<Self, Box<dyn Error>> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&text)?)
  }

  // merge configs where the second overwrites the first
  pub fn merge(self, other: Self) -> Self {
    Self {
      rule: other.rule.or(self.rule),
      strict: other.strict.or(self.strict),
      max_iterations: other.max_iterations.or(self.max_iterations),
      artifacts: other.artifacts.or(self.artifacts),
    }
  }

  pub fn pass_config(&self) -> PassConfig {
    let defaults = PassConfig::default();
    PassConfig {
      rule: self.rule.unwrap_or(defaults.rule),
      strict: self.strict.unwrap_or(defaults.strict),
      max_iterations: self.max_iterations.or(defaults.max_iterations),
    }
  }
}
