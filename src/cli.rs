use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// YAML file with curation settings (env overrides still apply).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Probe one URL and print the reachability report.
    Check(CheckArgs),
    /// Create a DRAFT attempt from a list of required components.
    Init(InitArgs),
    /// Run the curation worker for an attempt in the foreground.
    Curate(CurateArgs),
    /// Print the unresolved gaps of an attempt.
    Gaps(AttemptArgs),
    /// Print the Definition-of-Done report of an attempt.
    Dod(AttemptArgs),
    /// Ask the model whether each reachable source covers its component.
    Validate(ValidateArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchEngine {
    /// Returns no sources; useful for dry runs.
    Noop,
    /// OpenAI Responses API with the web search tool.
    Openai,
}

#[derive(Debug, Args)]
pub struct CheckArgs {
    /// URL or free-text reference to probe.
    #[arg(long)]
    pub url: String,
}

#[derive(Debug, Args)]
pub struct InitArgs {
    /// Directory holding attempt data.
    #[arg(long, default_value = "workspace-app")]
    pub data_dir: PathBuf,

    /// JSON array of `{lesson_id, lesson_title, component_name, is_critical}`.
    #[arg(long)]
    pub components: PathBuf,

    /// Course identifier (default: file stem of `--components`).
    #[arg(long)]
    pub course_id: Option<String>,

    /// Course title used in prompts.
    #[arg(long)]
    pub title: Option<String>,

    #[arg(long, value_enum, default_value_t = SearchEngine::Openai)]
    pub engine: SearchEngine,
}

#[derive(Debug, Args)]
pub struct AttemptArgs {
    #[arg(long, default_value = "workspace-app")]
    pub data_dir: PathBuf,

    #[arg(long)]
    pub attempt: String,
}

#[derive(Debug, Args)]
pub struct CurateArgs {
    #[command(flatten)]
    pub target: AttemptArgs,

    /// Override the engine stored with the attempt.
    #[arg(long, value_enum)]
    pub engine: Option<SearchEngine>,
}

#[derive(Debug, Args)]
pub struct ValidateArgs {
    #[command(flatten)]
    pub target: AttemptArgs,

    #[arg(long, value_enum)]
    pub engine: Option<SearchEngine>,

    /// Lease owner id (default: random).
    #[arg(long)]
    pub owner: Option<String>,
}
