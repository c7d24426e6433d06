use anyhow::{bail, Context, Result};
use figment::providers::Format;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

use crate::args::CliArgs;

/// The fully parsed and validated config struct we use in the application
/// this is built up from the ConfigBuilder which can load from multiple sources (in order of preference):
///
/// 1. cli args
/// 2. environment variables
/// 3. config file
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// The port to bind the server to.
    /// Default is `8000`
    pub port: u32,
    /// The host to bind the server to
    /// Default is `localhost`
    pub host: String,
    /// The log-level to use, in the format of [tracing directives](https://docs.rs/tracing-subscriber/latest/tracing_subscriber/filter/struct.EnvFilter.html#directives).
    /// Default is `["info"]`
    pub log_level: Vec<String>,
    /// The directory to store all internal data files
    /// Default is `/var/fanout`
    pub data: PathBuf,
    /// The allowed cors origins
    /// Default is empty
    pub cors_allowed_origins: Vec<String>,

    /// Maximum byte length of a single request string
    pub max_message_size: usize,
    /// Maximum number of cached results per service
    pub max_database_size: usize,
    /// Seconds after which a cached result is discarded on read
    pub max_result_age: u64,
    /// Upper bound on how long any request may stay pending before the
    /// garbage collector reclaims its bookkeeping. Should exceed the run
    /// time of the slowest service
    pub max_service_run_time: u64,
    /// Seconds granted to a service `start` hook
    pub service_start_timeout: f64,
    /// Seconds granted to a service `shutdown` hook
    pub service_shutdown_timeout: f64,
    /// Supervisor sleep between idle cycles, in seconds
    pub terminator_idle_cycle: f64,
    /// Seconds granted to workers to react to a cooperative stop
    pub th_proc_response_time: f64,

    /// Path of the token database file (JSON or TOML)
    pub tokens_path: PathBuf,
    /// Regex that every token must match. Empty disables format checking
    pub token_regex: String,
    /// Whether to create a timestamped backup when the token file is rewritten
    pub tokens_backups: bool,

    /// Differentiate upper/lower case in service and group names
    pub key_sensitivity: bool,
    /// Do not inject one implicit group per service name
    pub disable_name_groups: bool,
    /// Do not inject the implicit `all` group
    pub disable_all_groups: bool,
    /// Reject the admin configuration endpoints wholesale
    pub disable_config_endpoints: bool,
    /// Every caller is treated as an authorized user. Testing only
    pub bypass_user_auth: bool,
    /// Every caller is treated as an admin. Testing only
    pub bypass_admin_auth: bool,

    /// Accept the token from the `token` header
    pub allow_header_token: bool,
    /// Accept the token from the `token` query parameter
    pub allow_parameter_token: bool,
    /// Accept the token from the `token` cookie
    pub allow_cookie_token: bool,
}

/// Default values for the config struct
/// these are only used to fill in holes after all the parsing and loading is done
impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8000,
            host: "localhost".to_string(),
            log_level: vec!["info".to_string()],
            data: PathBuf::from("/var/fanout"),
            cors_allowed_origins: Vec::new(),
            max_message_size: 64,
            max_database_size: 10_000,
            max_result_age: 1800,
            max_service_run_time: 120,
            service_start_timeout: 3.0,
            service_shutdown_timeout: 3.0,
            terminator_idle_cycle: 1.0,
            th_proc_response_time: 0.5,
            tokens_path: PathBuf::from("settings/tokens.json"),
            token_regex: "^[A-Za-z0-9]{10,}$".to_string(),
            tokens_backups: true,
            key_sensitivity: false,
            disable_name_groups: true,
            disable_all_groups: true,
            disable_config_endpoints: false,
            bypass_user_auth: false,
            bypass_admin_auth: false,
            allow_header_token: true,
            allow_parameter_token: true,
            allow_cookie_token: true,
        }
    }
}

impl Config {
    /// Bounds checking beyond what the type system gives us. Fatal at
    /// startup: a server with a nonsense supervision cadence or an
    /// unauthenticatable token setup must not come up at all.
    pub fn validate(&self) -> Result<()> {
        if self.port > 65535 {
            bail!("Invalid port: {}", self.port);
        }
        if self.max_database_size == 0 {
            bail!("max_database_size cannot be 0");
        }
        if self.max_service_run_time < 10 {
            bail!(
                "Invalid max_service_run_time: {} it cannot be less than 10",
                self.max_service_run_time
            );
        }
        if self.service_start_timeout < 1.0 || self.service_shutdown_timeout < 1.0 {
            bail!("service_start_timeout and service_shutdown_timeout cannot be less than 1");
        }
        if !(0.2..=60.0).contains(&self.terminator_idle_cycle) {
            bail!("terminator_idle_cycle cannot be lower than 0.2 or greater than 60");
        }
        if !(0.1..=10.0).contains(&self.th_proc_response_time) {
            bail!("th_proc_response_time cannot be lower than 0.1 or greater than 10");
        }
        if !self.token_regex.is_empty() {
            regex::Regex::new(&self.token_regex)
                .with_context(|| format!("Invalid token regex: {}", self.token_regex))?;
        }
        if !self.allow_header_token
            && !self.allow_parameter_token
            && !self.allow_cookie_token
            && !self.bypass_user_auth
        {
            bail!(
                "All token options (header, parameter, cookie) are false and auth bypass \
                 is not set. It would be impossible to authenticate"
            );
        }
        Ok(())
    }

    pub fn tracing_env_filter(&self) -> Result<tracing_subscriber::EnvFilter> {
        let mut filter = tracing_subscriber::EnvFilter::from_default_env();
        for directive in &self.log_level {
            match directive.parse() {
                Ok(directive) => filter = filter.add_directive(directive),
                Err(err) => bail!("{}: {}", err, directive),
            }
        }

        Ok(filter)
    }

    pub fn max_result_age(&self) -> Duration {
        Duration::from_secs(self.max_result_age)
    }

    pub fn max_service_run_time(&self) -> Duration {
        Duration::from_secs(self.max_service_run_time)
    }

    pub fn service_start_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.service_start_timeout)
    }

    pub fn service_shutdown_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.service_shutdown_timeout)
    }

    pub fn terminator_idle_cycle(&self) -> Duration {
        Duration::from_secs_f64(self.terminator_idle_cycle)
    }

    pub fn th_proc_response_time(&self) -> Duration {
        Duration::from_secs_f64(self.th_proc_response_time)
    }
}

/// The builder we use to build Config
#[derive(Debug)]
pub struct ConfigBuilder {
    pub cli_args: CliArgs,
}

impl ConfigBuilder {
    pub const FILENAME: &'static str = "fanout.toml";
    pub const DIRNAME: &'static str = "fanout";
    pub const HIDDEN_DIRNAME: &'static str = ".fanout";

    pub fn new(cli_args: CliArgs) -> Self {
        Self { cli_args }
    }

    // merges the cli and env vars
    // which has optional values, by default None (or empty)
    // and parses complex types from strings
    pub fn merge_cli_env_args(&self) -> Result<CliArgs> {
        let cli_args: CliArgs = figment::Figment::new()
            .merge(figment::providers::Env::prefixed(&format!(
                "{}_",
                CliArgs::ENV_VAR_PREFIX
            )))
            .merge(figment::providers::Serialized::defaults(&self.cli_args))
            .extract()?;

        Ok(cli_args)
    }

    pub fn build(self) -> Result<Config> {
        // try to load dotenv first, since it may affect env vars for filepaths
        let dotenv_path = self
            .cli_args
            .dotenv
            .clone()
            .unwrap_or(std::env::current_dir()?.join(".env"));

        if dotenv_path.exists() {
            if let Err(e) = dotenvy::from_path(dotenv_path) {
                bail!("Error loading dotenv file: {}", e);
            }
        }

        let cli_env_args = self.merge_cli_env_args()?;

        // then, our final config, which can have more complex types with easier TOML-like syntax
        // and also fills in defaults for required values at the end
        let config: Config = figment::Figment::new()
            .merge(figment::providers::Toml::file(Self::filepath(
                &cli_env_args,
            )?))
            .merge(figment::providers::Serialized::defaults(cli_env_args))
            .join(figment::providers::Serialized::defaults(Config::default()))
            .extract()?;

        let config = Config {
            data: shellexpand::tilde(&config.data.to_string_lossy())
                .to_string()
                .into(),
            ..config
        };
        config.validate()?;

        Ok(config)
    }

    /// finds the filepath through a series of fallbacks
    /// the argument is internally derived cli + env args
    pub fn filepath(cli_env_args: &CliArgs) -> Result<PathBuf> {
        let filepaths_to_try = Self::filepaths_to_try(cli_env_args);

        filepaths_to_try
            .iter()
            .find(|filename| filename.exists())
            .with_context(|| {
                format!(
                    "No config file found, try creating one of these: {:?}",
                    filepaths_to_try
                )
            })
            .cloned()
    }

    /// provides the list of filepaths to try for the config file
    /// the argument is internally from cli + env args
    pub fn filepaths_to_try(cli_env_args: &CliArgs) -> Vec<PathBuf> {
        // the paths returned will be tried in order of pushing
        let mut dirs = Vec::new();

        // explicit arg passed to the cli, e.g. --home /foo, or env var HOME="/foo"
        // this is used as the direct home directory, i.e. /foo/fanout.toml
        if let Some(dir) = cli_env_args.home.clone() {
            dirs.push(dir);
        }

        // next, check the current working directory, wherever the command is run from
        if let Ok(dir) = std::env::current_dir() {
            dirs.push(dir);
        }

        // the user's home directory directly, without polluting it: ~/.fanout/fanout.toml
        if let Some(dir) = dirs::home_dir().map(|dir| dir.join(Self::HIDDEN_DIRNAME)) {
            dirs.push(dir);
        }

        // the system config directory, e.g. ~/.config/fanout/fanout.toml on linux
        if let Some(dir) = dirs::config_dir().map(|dir| dir.join(Self::DIRNAME)) {
            dirs.push(dir);
        }

        // on macOS and windows the system config dir is elsewhere, so check
        // the XDG and ~/.config conventions explicitly too
        if let Some(dir) = std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .map(|dir| dir.join(Self::DIRNAME))
        {
            dirs.push(dir);
        }

        if let Some(dir) = dirs::home_dir().map(|dir| dir.join(".config").join(Self::DIRNAME)) {
            dirs.push(dir);
        }

        // Lastly, try /etc/fanout/fanout.toml
        dirs.push(PathBuf::from("/etc").join(Self::DIRNAME));

        // now we have a list of directories to check, we need to add the filename to each
        dirs.into_iter()
            .map(|dir| dir.join(Self::FILENAME))
            .collect()
    }
}
