use std::collections::HashSet;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::cli::Cli;
use crate::error::{Error, Result};

pub const DEFAULT_TOKEN_ENV: &str = "CRS_GITHUB_TOKEN";
pub const DEFAULT_API_URL: &str = "https://api.github.com";

/// An external analysis command run per pull request.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PluginConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub include_diff: bool,
    #[serde(default)]
    pub include_comments: bool,
    #[serde(default)]
    pub include_headers: bool,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub github_username: Option<String>,
    pub token_env: Option<String>,
    pub api_url: Option<String>,
    pub db_path: Option<String>,
    pub excluded_authors: Option<Vec<String>>,
    pub plugins: Option<Vec<PluginConfig>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub github_username: String,
    pub token_env: String,
    pub api_url: String,
    pub db_path: PathBuf,
    pub excluded_authors: Vec<String>,
    pub plugins: Vec<PluginConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            github_username: String::new(),
            token_env: DEFAULT_TOKEN_ENV.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            db_path: default_db_path(),
            excluded_authors: default_excluded_authors(),
            plugins: Vec::new(),
        }
    }
}

impl Config {
    /// Load the config file named on the command line, or the default path.
    /// An explicitly named file must exist; a missing default file means
    /// built-in defaults.
    pub fn load(cli: &Cli) -> Result<Self> {
        let file_config = match &cli.config {
            Some(path) => {
                let path = Path::new(path);
                if !path.exists() {
                    return Err(Error::ConfigNotFound(path.to_path_buf()));
                }
                parse_config(&std::fs::read_to_string(path)?)?
            }
            None => match default_config_path() {
                Some(path) if path.exists() => parse_config(&std::fs::read_to_string(path)?)?,
                _ => ConfigFile::default(),
            },
        };

        Ok(merge(file_config, cli))
    }

    /// Compiled author exclusion patterns.
    pub fn excluded_author_patterns(&self) -> Result<Vec<Regex>> {
        self.excluded_authors
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    Error::ConfigValidation(format!("invalid excluded_authors pattern {p:?}: {e}"))
                })
            })
            .collect()
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

fn default_config_path() -> Option<PathBuf> {
    home_dir().map(|h| h.join(".config").join("crs.toml"))
}

fn default_db_path() -> PathBuf {
    home_dir()
        .map(|h| h.join(".config").join("crs").join("crs.db"))
        .unwrap_or_else(|| PathBuf::from("crs.db"))
}

/// Bot accounts whose comments are hidden by default.
pub fn default_excluded_authors() -> Vec<String> {
    vec!["advanced".to_string()]
}

/// Expand a leading `~/` to the home directory.
fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

pub fn parse_config(content: &str) -> Result<ConfigFile> {
    let config: ConfigFile = toml::from_str(content)?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &ConfigFile) -> Result<()> {
    if let Some(ref env) = config.token_env
        && env.trim().is_empty()
    {
        return Err(Error::ConfigValidation(
            "token_env must not be empty".to_string(),
        ));
    }
    if let Some(ref url) = config.api_url
        && !(url.starts_with("http://") || url.starts_with("https://"))
    {
        return Err(Error::ConfigValidation(format!(
            "api_url must be an http(s) URL, got: {url}"
        )));
    }
    for pattern in config.excluded_authors.iter().flatten() {
        if let Err(e) = Regex::new(pattern) {
            return Err(Error::ConfigValidation(format!(
                "invalid excluded_authors pattern {pattern:?}: {e}"
            )));
        }
    }

    let mut seen = HashSet::new();
    for plugin in config.plugins.iter().flatten() {
        if plugin.name.trim().is_empty() {
            return Err(Error::ConfigValidation(
                "plugin name must not be empty".to_string(),
            ));
        }
        if plugin.command.trim().is_empty() {
            return Err(Error::ConfigValidation(format!(
                "plugin '{}' has an empty command",
                plugin.name
            )));
        }
        if !seen.insert(plugin.name.as_str()) {
            return Err(Error::ConfigValidation(format!(
                "duplicate plugin name: {}",
                plugin.name
            )));
        }
    }
    Ok(())
}

pub fn merge(file: ConfigFile, cli: &Cli) -> Config {
    let defaults = Config::default();
    Config {
        github_username: cli
            .github_username
            .clone()
            .or(file.github_username)
            .unwrap_or(defaults.github_username),
        token_env: file.token_env.unwrap_or(defaults.token_env),
        api_url: cli
            .api_url
            .clone()
            .or(file.api_url)
            .unwrap_or(defaults.api_url),
        db_path: cli
            .db
            .as_deref()
            .or(file.db_path.as_deref())
            .map(expand_home)
            .unwrap_or(defaults.db_path),
        excluded_authors: file.excluded_authors.unwrap_or(defaults.excluded_authors),
        plugins: file.plugins.unwrap_or_default(),
    }
}
