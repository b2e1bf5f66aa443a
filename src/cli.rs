// ABOUTME: Command-line surface of the agentry operator tool.
// ABOUTME: Parses global flags and subcommands into requests for the orchestrator.

use agentry_core::{
    AgentContext, Capability, FallbackPolicy, MergeStrategy, Selection, Strategy,
};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "agentry", version, about = "Run queries against pooled agent backends")]
pub struct Cli {
    /// Config file; defaults to $AGENTRY_CONFIG, ./agentry.toml, then the user config dir
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Record metrics and print a Prometheus snapshot on exit
    #[arg(long, global = true)]
    pub metrics: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List registered backends with pool figures
    Backends,
    /// Show the capabilities a backend declares
    Capabilities { id: String },
    /// Probe one backend, or every registered backend
    Health { id: Option<String> },
    /// Execute a query and print the response as JSON
    Run(RunArgs),
    /// Execute a query and print chunks as they arrive
    Stream(RunArgs),
    /// Run one query on several backends and merge the answers
    Compare(CompareArgs),
}

/// Caller identity passed through to backends
#[derive(Debug, Clone, Args)]
pub struct CallerArgs {
    #[arg(long, default_value = "local")]
    pub tenant: String,
    #[arg(long, default_value = "operator")]
    pub user: String,
    /// Session id; a fresh one is generated when omitted
    #[arg(long)]
    pub session: Option<String>,
    /// Per-call time limit in seconds
    #[arg(long)]
    pub timeout_secs: Option<u64>,
}

impl CallerArgs {
    pub fn context(&self) -> AgentContext {
        let session = self
            .session
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let ctx = AgentContext::new(&self.tenant, &self.user, session);
        match self.timeout_secs {
            Some(secs) => ctx.with_max_execution(Duration::from_secs(secs)),
            None => ctx,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Run on this backend
    #[arg(long, conflicts_with = "require")]
    pub backend: Option<String>,

    /// Pick a backend offering all of these capabilities
    #[arg(long, value_delimiter = ',', value_parser = parse_capability)]
    pub require: Vec<Capability>,

    /// Ranking used with --require (cost, latency, quality, balanced, round_robin)
    #[arg(long, default_value = "balanced", value_parser = parse_strategy)]
    pub strategy: Strategy,

    /// Backends to try, in order, when the first one fails
    #[arg(long, value_delimiter = ',')]
    pub fallback: Vec<String>,

    /// Disable fallback entirely
    #[arg(long, conflicts_with = "fallback")]
    pub no_fallback: bool,

    #[command(flatten)]
    pub caller: CallerArgs,

    pub query: String,
}

impl RunArgs {
    pub fn selection(&self) -> Selection {
        match &self.backend {
            Some(id) => Selection::manual(id),
            None => Selection::matching(self.require.iter().copied(), self.strategy),
        }
    }

    pub fn fallback(&self) -> FallbackPolicy {
        if self.no_fallback {
            FallbackPolicy::disabled()
        } else {
            FallbackPolicy::chain(self.fallback.iter().cloned())
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct CompareArgs {
    /// Backends to query side by side
    #[arg(long, value_delimiter = ',', required = true)]
    pub backends: Vec<String>,

    /// How to fold the answers (fastest, consensus, concatenate)
    #[arg(long, default_value = "fastest", value_parser = parse_merge)]
    pub merge: MergeStrategy,

    #[command(flatten)]
    pub caller: CallerArgs,

    pub query: String,
}

fn parse_capability(s: &str) -> Result<Capability, String> {
    s.parse()
}

fn parse_strategy(s: &str) -> Result<Strategy, String> {
    s.parse()
}

fn parse_merge(s: &str) -> Result<MergeStrategy, String> {
    s.parse()
}
