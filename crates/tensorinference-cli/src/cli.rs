//! CLI argument definitions using clap

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tensorinference::EliminationStrategy;

#[derive(Parser)]
#[command(name = "tensorinference")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file to use instead of the default search
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Don't load configuration file
    #[arg(long, global = true)]
    pub no_config: bool,

    /// Log level (RUST_LOG takes precedence)
    #[arg(long, global = true, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Output format
    #[arg(short = 'F', long, global = true, value_enum)]
    pub output_format: Option<OutputFormat>,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Partition function (probability of the evidence)
    Pr {
        #[command(flatten)]
        problem: ProblemArgs,
    },

    /// Marginal distribution of every variable
    Mar {
        #[command(flatten)]
        problem: ProblemArgs,

        /// Reference marginals (.uai.MAR) to compare against
        #[arg(long, value_name = "FILE")]
        mar: Option<PathBuf>,
    },

    /// Most probable assignment of all variables
    Map {
        #[command(flatten)]
        problem: ProblemArgs,
    },

    /// Most probable assignment of the query variables, summing out the rest
    Mmap {
        #[command(flatten)]
        problem: ProblemArgs,

        /// Query variables (0-based, comma separated)
        #[arg(short, long, value_delimiter = ',', required = true)]
        query: Vec<usize>,
    },

    /// Configuration file management
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Args, Debug, Clone)]
pub struct ProblemArgs {
    /// Model file in UAI format
    #[arg(value_name = "UAI")]
    pub uai: PathBuf,

    /// Evidence file (.uai.evid)
    #[arg(short, long, value_name = "FILE")]
    pub evidence: Option<PathBuf>,

    /// PACE tree decomposition (.td) giving the elimination order
    #[arg(long, value_name = "FILE")]
    pub td: Option<PathBuf>,

    /// Elimination heuristic for the contraction order
    #[arg(short, long, value_enum)]
    pub strategy: Option<StrategyArg>,

    /// Contract on a single thread
    #[arg(long)]
    pub serial: bool,

    /// Largest intermediate tensor allowed, in elements
    #[arg(long, value_name = "ELEMENTS")]
    pub max_tensor_size: Option<usize>,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show,
    /// Show configuration file path
    Path,
    /// Initialize default configuration file
    Init,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable summary
    Text,
    /// JSON report
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StrategyArg {
    MinFill,
    MinDegree,
    WeightedMinFill,
}

impl From<StrategyArg> for EliminationStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::MinFill => EliminationStrategy::MinFill,
            StrategyArg::MinDegree => EliminationStrategy::MinDegree,
            StrategyArg::WeightedMinFill => EliminationStrategy::WeightedMinFill,
        }
    }
}
