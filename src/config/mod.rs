//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{collections::BTreeMap, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::application::probe::{DEFAULT_MAX_REDIRECTS, ProbeConfig};
use crate::cache::CacheConfig;
use crate::domain::SiteMap;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "i8gate";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8182;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 30;

/// Command-line arguments for the i8gate binary.
#[derive(Debug, Parser)]
#[command(
    name = "i8gate",
    version,
    about = "Authorization gate for gated image-server resources"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "I8GATE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the delegate HTTP service.
    Serve(Box<ServeArgs>),
    /// Print the upstream URL a resource identifier maps to, without probing.
    Resolve(ResolveArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Clone)]
pub struct ResolveArgs {
    /// Resource identifier as received from the image server.
    #[arg(value_name = "IDENTIFIER")]
    pub identifier: String,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the redirect hop budget of the upstream probe.
    #[arg(long = "probe-max-redirects", value_name = "COUNT")]
    pub probe_max_redirects: Option<u32>,

    /// Override the per-hop timeout of the upstream probe.
    #[arg(long = "probe-timeout-seconds", value_name = "SECONDS")]
    pub probe_timeout_seconds: Option<u64>,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub sites: SiteMap,
    pub cache: CacheConfig,
    pub probe: ProbeConfig,
    pub legacy: LegacySettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone, Default)]
pub struct LegacySettings {
    pub url_prefix: String,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: String, reason: String },
}

impl LoadError {
    fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("I8GATE").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Resolve(_)) | None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    sites: BTreeMap<String, String>,
    cache: RawCacheSettings,
    probe: RawProbeSettings,
    legacy: RawLegacySettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(max) = overrides.probe_max_redirects {
            self.probe.max_redirects = Some(max);
        }
        if let Some(seconds) = overrides.probe_timeout_seconds {
            self.probe.timeout_seconds = Some(seconds);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            sites,
            cache,
            probe,
            legacy,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let sites = build_sitemap(sites)?;
        let cache = build_cache_settings(cache)?;
        let probe = build_probe_settings(probe)?;
        let legacy = LegacySettings {
            url_prefix: legacy.url_prefix.unwrap_or_default(),
        };

        Ok(Self {
            server,
            logging,
            sites,
            cache,
            probe,
            legacy,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr =
        parse_socket_addr(&host, port).map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_sitemap(sites: BTreeMap<String, String>) -> Result<SiteMap, LoadError> {
    SiteMap::from_templates(sites)
        .map_err(|(site_id, err)| LoadError::invalid(format!("sites.{site_id}"), err.to_string()))
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheConfig, LoadError> {
    let defaults = CacheConfig::default();

    let credential_ttl_seconds = cache
        .credential_ttl_seconds
        .unwrap_or(defaults.credential_ttl_seconds);
    if credential_ttl_seconds == 0 {
        return Err(LoadError::invalid(
            "cache.credential_ttl_seconds",
            "must be greater than zero",
        ));
    }

    let resource_ttl_seconds = cache
        .resource_ttl_seconds
        .unwrap_or(defaults.resource_ttl_seconds);
    if resource_ttl_seconds == 0 {
        return Err(LoadError::invalid(
            "cache.resource_ttl_seconds",
            "must be greater than zero",
        ));
    }

    Ok(CacheConfig {
        credential_capacity: cache
            .credential_capacity
            .unwrap_or(defaults.credential_capacity),
        credential_ttl_seconds,
        resource_capacity: cache
            .resource_capacity
            .unwrap_or(defaults.resource_capacity),
        resource_ttl_seconds,
    })
}

fn build_probe_settings(probe: RawProbeSettings) -> Result<ProbeConfig, LoadError> {
    let max_redirects = probe.max_redirects.unwrap_or(DEFAULT_MAX_REDIRECTS);
    if max_redirects == 0 {
        return Err(LoadError::invalid(
            "probe.max_redirects",
            "must be greater than zero",
        ));
    }

    let timeout_seconds = probe.timeout_seconds.unwrap_or(DEFAULT_PROBE_TIMEOUT_SECS);
    if timeout_seconds == 0 {
        return Err(LoadError::invalid(
            "probe.timeout_seconds",
            "must be greater than zero",
        ));
    }

    let mut config = ProbeConfig {
        max_redirects,
        timeout: Duration::from_secs(timeout_seconds),
        ..ProbeConfig::default()
    };
    if let Some(user_agent) = probe.user_agent {
        let trimmed = user_agent.trim();
        if trimmed.is_empty() {
            return Err(LoadError::invalid(
                "probe.user_agent",
                "must not be empty",
            ));
        }
        config.user_agent = trimmed.to_string();
    }

    Ok(config)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    credential_capacity: Option<usize>,
    credential_ttl_seconds: Option<u64>,
    resource_capacity: Option<usize>,
    resource_ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawProbeSettings {
    max_redirects: Option<u32>,
    timeout_seconds: Option<u64>,
    user_agent: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLegacySettings {
    url_prefix: Option<String>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
