use tuplepass::*;

use clap::{Parser, Subcommand};
use std::{error::Error, path::{Path, PathBuf}};
use tracing::info;

mod app_config;
use app_config::AppConfig;

#[derive(Parser)]
#[command(version, about = "Runs the tuple type-transform pass over named graphs")]
struct Cli {
  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Print the fixture tags and the checkable cases
  List,
  /// Run the pass over one fixture and print the report
  Run {
    #[arg(long)]
    fixture: String,
    #[arg(long)]
    rule: Option<RewriteRule>,
    /// Skip conflicting accessors instead of failing
    #[arg(long)]
    lenient: bool,
    /// Write graphviz, GraphML and report.json here
    #[arg(long, value_name = "DIR")]
    artifacts: Option<PathBuf>,
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
  },
  /// Run `<case>/before` and compare it with `<case>/after`
  Check {
    #[arg(long)]
    case: String,
    #[arg(long)]
    lenient: bool,
  },
}

fn dump(dir: &Path, stage: &str, graph: &TupleGraph) -> Result<(), Box<dyn Error>> {
  utils::save_graphviz(&dir.join(format!("{stage}.dot")), graph)?;
  utils::save_graphml(&dir.join(format!("{stage}.graphml")), graph)?;
  Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
  utils::init_logging()?;
  let args = Cli::parse();
  let registry = fixtures::suite()?;

  match args.command {
    Command::List => {
      for tag in registry.tags() {
        println!("{tag}");
      }
      for (name, rule) in registry.cases() {
        println!("case {name} ({rule})");
      }
    }
    Command::Run {
      fixture,
      rule,
      lenient,
      artifacts,
      config,
    } => {
      let mut app = AppConfig::default();
      if let Some(path) = config {
        app = app.merge(AppConfig::load(&path)?);
      }
      app = app.merge(AppConfig {
        rule,
        strict: lenient.then_some(false),
        max_iterations: None,
        artifacts,
      });
      info!("running {} with {:?}", fixture, app);

      let mut graph = registry.fetch(&fixture)?;
      if let Some(dir) = &app.artifacts {
        std::fs::create_dir_all(dir)?;
        dump(dir, "before", &graph)?;
      }
      let report = run_pass(&mut graph, &app.pass_config())?;
      if let Some(dir) = &app.artifacts {
        dump(dir, "after", &graph)?;
        utils::serialize_to_file(&dir.join("report.json"), &report)?;
      }
      println!("{graph}");
      print!("{}", serde_yaml::to_string(&report)?);
    }
    Command::Check { case, lenient } => {
      let (report, verdict) = registry.check_case(&case, !lenient)?;
      match verdict {
        Ok(()) => println!("{case}: ok after {} rewrite(s)", report.rewrites),
        Err(mismatch) => {
          eprintln!("{case}: {mismatch}");
          std::process::exit(1);
        }
      }
    }
  }
  Ok(())
}
