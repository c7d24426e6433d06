use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use utils::serde::comma_separated;

/// This struct is used for both args and environment variables
/// the basic idea is that every env var can be overriden by a cli arg
/// and these override the config file
/// env vars follow the pattern of FANOUT_{UPPERCASE_ARG_NAME}
#[derive(Debug, Parser, Serialize, Deserialize, Default)]
#[command(version, about, long_about = None)]
#[serde(default)]
pub struct CliArgs {
    /// The home directory of the application, where the fanout.toml configuration file is stored
    /// if not provided here or in an env var, a series of default directories will be tried
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub home: Option<PathBuf>,

    /// The path to an optional dotenv file to try and load
    /// if not set, will be the current working directory's .env
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dotenv: Option<PathBuf>,

    /// The port to bind the server to.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u32>,

    /// The host to bind the server to
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Log level in the format of comma-separated tracing directives.
    #[arg(long, value_delimiter = ',')]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    #[serde(deserialize_with = "comma_separated")]
    pub log_level: Vec<String>,

    /// The directory to store all internal data files
    /// Default is /var/fanout
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<PathBuf>,

    /// The allowed cors origins
    #[arg(long, value_delimiter = ',')]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    #[serde(deserialize_with = "comma_separated")]
    pub cors_allowed_origins: Vec<String>,

    /// Path of the token database file (JSON or TOML)
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_path: Option<PathBuf>,

    /// Regex that every token must match. Empty string disables format checking
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_regex: Option<String>,
}

impl CliArgs {
    pub const ENV_VAR_PREFIX: &'static str = "FANOUT";

    pub fn home_dir(&self) -> Option<PathBuf> {
        self.home.clone()
    }

    pub fn dotenv_path(&self) -> Option<PathBuf> {
        self.dotenv.clone()
    }
}
