use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use sieve_core::RuleKind;

#[derive(Parser)]
#[command(name = "sieve")]
#[command(author, version, about = "Classify page content against meaning rules with LLM backends", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Directory holding settings and the analysis cache
    #[arg(long, global = true, env = "SIEVE_DATA_DIR", default_value = ".sieve")]
    pub data_dir: PathBuf,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Parse rule strings and print their canonical form
    Validate {
        /// Rule strings to check
        rules: Vec<String>,

        /// Rule file (YAML list or one rule per line)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Analyze one text against a criteria phrase
    Analyze {
        /// Page text to classify
        text: String,

        #[arg(short, long)]
        criteria: String,

        #[arg(short, long, value_enum, default_value = "prompt")]
        kind: TextKindArg,
    },

    /// Analyze a screenshot file against a criteria phrase
    Image {
        /// PNG or JPEG file
        path: PathBuf,

        #[arg(short, long)]
        criteria: String,
    },

    /// Stream a batch request through the analyzer as NDJSON
    Stream {
        /// Request JSON: {"elements": [{id, text, selector, groundTruth?}], "url"?}
        request: PathBuf,

        /// Rule file (YAML list or one rule per line)
        #[arg(short, long)]
        rules: PathBuf,
    },

    /// Inspect or clear the analysis cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Show or change settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },

    /// List providers and what they support
    Providers,
}

#[derive(Subcommand)]
pub enum CacheAction {
    Stats,
    Clear,
}

#[derive(Subcommand)]
pub enum SettingsAction {
    /// Print settings with credentials redacted
    Show,

    /// Set one field; the value is parsed as JSON, falling back to a string
    Set { field: String, value: String },
}

/// Text rule kinds the `analyze` command can run.
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum TextKindArg {
    Embedding,
    Prompt,
}

impl From<TextKindArg> for RuleKind {
    fn from(arg: TextKindArg) -> Self {
        match arg {
            TextKindArg::Embedding => RuleKind::Embedding,
            TextKindArg::Prompt => RuleKind::Prompt,
        }
    }
}
