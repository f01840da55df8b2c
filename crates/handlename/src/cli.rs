use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use handlename_core::config::LogFormat;

#[derive(Parser, Debug)]
#[command(
    name = "hn",
    about = "Resolve channel handles and ids to display names",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to config file
    #[arg(long, global = true, env = "HANDLENAME_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Log output format (pretty, json)
    #[arg(long, global = true)]
    pub log_format: Option<LogFormat>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Resolve identities to display names
    Resolve(ResolveArgs),

    /// Extract a display name from a saved channel page
    Extract {
        /// HTML file to read (stdin when omitted)
        file: Option<PathBuf>,
    },

    /// Inspect or reset the persisted name cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Args, Debug)]
pub struct ResolveArgs {
    /// `@handle`, `handle`, or a `/@handle` or `/channel/<id>` link
    #[arg(required_unless_present = "channel")]
    pub identities: Vec<String>,

    /// Channel id to resolve (repeatable)
    #[arg(long = "channel", value_name = "ID")]
    pub channel: Vec<String>,

    /// Print results as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// List fresh cache entries
    Show {
        /// Print entries as JSON
        #[arg(long)]
        json: bool,
    },

    /// Remove every cache entry
    Clear,

    /// Print the cache file location
    Path,
}
