use clap::{Parser, Subcommand};

/// Pull request review server: annotated diffs, pending comments and plugins
#[derive(Parser, Debug, Clone)]
#[command(name = "crs", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<CliCommand>,

    /// Path to config file (default: ~/.config/crs.toml)
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Path to the SQLite database
    #[arg(long, global = true)]
    pub db: Option<String>,

    /// GitHub login used as the author of pending comments
    #[arg(long, global = true)]
    pub github_username: Option<String>,

    /// GitHub API base URL
    #[arg(long, global = true)]
    pub api_url: Option<String>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum CliCommand {
    /// Serve JSON-RPC requests on stdin/stdout (default)
    Serve,

    /// Print the annotated diff of a pull request
    Show {
        owner: String,
        repo: String,
        number: u64,

        /// Bypass the cache and refetch from GitHub
        #[arg(long)]
        sync: bool,
    },

    /// Inspect or run configured plugins
    Plugins {
        #[command(subcommand)]
        action: PluginsCommand,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum PluginsCommand {
    /// List configured plugins
    List,

    /// Run every plugin for a pull request and print the results
    Run {
        owner: String,
        repo: String,
        number: u64,
    },
}
