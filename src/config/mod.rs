//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{net::SocketAddr, num::NonZeroUsize, str::FromStr, time::Duration};

use axum::http::HeaderName;
use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::cache::default_routes;

mod cli;

pub use cli::{CliArgs, Command, ServeArgs, ServeOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "playcache";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_ADMIN_HOST: &str = "127.0.0.1";
const DEFAULT_PUBLIC_PORT: u16 = 3000;
const DEFAULT_ADMIN_PORT: u16 = 3001;
const DEFAULT_CACHE_MAX_ENTRIES: u64 = 1000;
const DEFAULT_CACHE_RESPONSE_MAX_ENTRIES: u64 = 500;
const DEFAULT_CACHE_TTL_SECS: u64 = 300;
const DEFAULT_CACHE_STALE_WHILE_REVALIDATE_SECS: u64 = 60;
const DEFAULT_CACHE_SWEEP_INTERVAL_MS: u64 = 30_000;
const DEFAULT_CACHE_BACKGROUND_INTERVAL_MS: u64 = 5000;
const DEFAULT_CACHE_INVALIDATION_DELAY_MS: u64 = 1000;
const DEFAULT_CACHE_LAZY_RETENTION_SECS: u64 = 300;
const DEFAULT_CACHE_QUEUE_LIMIT: u64 = 10_000;
const DEFAULT_CACHE_CONSUME_BATCH_LIMIT: u64 = 100;
const DEFAULT_CACHE_DEGRADED_UTILIZATION: f64 = 0.9;
const DEFAULT_CACHE_RESPONSE_BODY_LIMIT_BYTES: u64 = 1024 * 1024;
const DEFAULT_CACHE_FETCH_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_UPSTREAM_BASE_URL: &str = "http://127.0.0.1:8080/";
const DEFAULT_UPSTREAM_TIMEOUT_MS: u64 = 5000;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub upstream: UpstreamSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub public_addr: SocketAddr,
    pub admin_addr: SocketAddr,
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

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub enable_response_cache: bool,
    pub max_entries: NonZeroUsize,
    pub response_max_entries: NonZeroUsize,
    pub default_ttl: Duration,
    pub default_stale_while_revalidate: Option<Duration>,
    pub sweep_interval: Duration,
    pub background_invalidation_interval: Duration,
    pub invalidation_delay: Duration,
    pub lazy_retention: Duration,
    pub queue_limit: NonZeroUsize,
    pub consume_batch_limit: NonZeroUsize,
    pub degraded_utilization: f64,
    pub response_body_limit_bytes: usize,
    /// `None` lets fetches run without a deadline.
    pub fetch_timeout: Option<Duration>,
    pub routes: Vec<RouteSettings>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSettings {
    pub prefix: String,
    pub ttl_seconds: u64,
    pub stale_while_revalidate_seconds: Option<u64>,
    pub tags: Vec<String>,
    pub vary: Vec<String>,
    pub private: bool,
}

#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    pub base_url: Url,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
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

    builder = builder.add_source(Environment::with_prefix("PLAYCACHE").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::ShowConfig) | None => {
            raw.apply_serve_overrides(&ServeOverrides::default())
        }
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    upstream: RawUpstreamSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(host) = overrides.server_admin_host.as_ref() {
            self.server.admin_host = Some(host.clone());
        }
        if let Some(port) = overrides.public_port {
            self.server.public_port = Some(port);
        }
        if let Some(port) = overrides.admin_port {
            self.server.admin_port = Some(port);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(enabled) = overrides.cache_enabled {
            self.cache.enabled = Some(enabled);
        }
        if let Some(enabled) = overrides.cache_response_enabled {
            self.cache.enable_response_cache = Some(enabled);
        }
        if let Some(max) = overrides.cache_max_entries {
            self.cache.max_entries = Some(max);
        }
        if let Some(ttl) = overrides.cache_default_ttl_seconds {
            self.cache.default_ttl_seconds = Some(ttl);
        }
        if let Some(url) = overrides.upstream_base_url.as_ref() {
            self.upstream.base_url = Some(url.clone());
        }
        if let Some(timeout) = overrides.upstream_timeout_ms {
            self.upstream.timeout_ms = Some(timeout);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            cache,
            upstream,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let cache = build_cache_settings(cache)?;
        let upstream = build_upstream_settings(upstream)?;

        Ok(Self {
            server,
            logging,
            cache,
            upstream,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let admin_host = server
        .admin_host
        .unwrap_or_else(|| DEFAULT_ADMIN_HOST.to_string());

    let public_port = server.public_port.unwrap_or(DEFAULT_PUBLIC_PORT);
    if public_port == 0 {
        return Err(LoadError::invalid(
            "server.public_port",
            "port must be greater than zero",
        ));
    }

    let admin_port = server.admin_port.unwrap_or(DEFAULT_ADMIN_PORT);
    if admin_port == 0 {
        return Err(LoadError::invalid(
            "server.admin_port",
            "port must be greater than zero",
        ));
    }

    let public_addr = parse_socket_addr(&host, public_port)
        .map_err(|reason| LoadError::invalid("server.public_addr", reason))?;
    let admin_addr = parse_socket_addr(&admin_host, admin_port)
        .map_err(|reason| LoadError::invalid("server.admin_addr", reason))?;

    Ok(ServerSettings {
        public_addr,
        admin_addr,
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

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let default_ttl_secs = cache.default_ttl_seconds.unwrap_or(DEFAULT_CACHE_TTL_SECS);
    if default_ttl_secs == 0 {
        return Err(LoadError::invalid(
            "cache.default_ttl_seconds",
            "must be greater than zero",
        ));
    }

    let sweep_ms = cache
        .sweep_interval_ms
        .unwrap_or(DEFAULT_CACHE_SWEEP_INTERVAL_MS);
    if sweep_ms == 0 {
        return Err(LoadError::invalid(
            "cache.sweep_interval_ms",
            "must be greater than zero",
        ));
    }

    let background_ms = cache
        .background_invalidation_interval_ms
        .unwrap_or(DEFAULT_CACHE_BACKGROUND_INTERVAL_MS);
    if background_ms == 0 {
        return Err(LoadError::invalid(
            "cache.background_invalidation_interval_ms",
            "must be greater than zero",
        ));
    }

    let degraded_utilization = cache
        .degraded_utilization
        .unwrap_or(DEFAULT_CACHE_DEGRADED_UTILIZATION);
    if !(degraded_utilization > 0.0 && degraded_utilization <= 1.0) {
        return Err(LoadError::invalid(
            "cache.degraded_utilization",
            "must be within (0, 1]",
        ));
    }

    let body_limit = cache
        .response_body_limit_bytes
        .unwrap_or(DEFAULT_CACHE_RESPONSE_BODY_LIMIT_BYTES);
    let response_body_limit_bytes = non_zero_usize(body_limit, "cache.response_body_limit_bytes")?;

    let fetch_timeout = match cache
        .fetch_timeout_ms
        .unwrap_or(DEFAULT_CACHE_FETCH_TIMEOUT_MS)
    {
        0 => None,
        ms => Some(Duration::from_millis(ms)),
    };

    let routes = match cache.routes {
        Some(routes) => routes
            .into_iter()
            .map(build_route_settings)
            .collect::<Result<Vec<_>, _>>()?,
        None => default_routes()
            .into_iter()
            .map(|policy| RouteSettings {
                prefix: policy.prefix,
                ttl_seconds: policy.ttl_seconds,
                stale_while_revalidate_seconds: policy.stale_while_revalidate_seconds,
                tags: policy.tags,
                vary: policy.vary,
                private: policy.private,
            })
            .collect(),
    };

    Ok(CacheSettings {
        enabled: cache.enabled.unwrap_or(true),
        enable_response_cache: cache.enable_response_cache.unwrap_or(true),
        max_entries: non_zero_usize(
            cache.max_entries.unwrap_or(DEFAULT_CACHE_MAX_ENTRIES),
            "cache.max_entries",
        )?,
        response_max_entries: non_zero_usize(
            cache
                .response_max_entries
                .unwrap_or(DEFAULT_CACHE_RESPONSE_MAX_ENTRIES),
            "cache.response_max_entries",
        )?,
        default_ttl: Duration::from_secs(default_ttl_secs),
        default_stale_while_revalidate: match cache.default_stale_while_revalidate_seconds {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => Some(Duration::from_secs(DEFAULT_CACHE_STALE_WHILE_REVALIDATE_SECS)),
        },
        sweep_interval: Duration::from_millis(sweep_ms),
        background_invalidation_interval: Duration::from_millis(background_ms),
        invalidation_delay: Duration::from_millis(
            cache
                .invalidation_delay_ms
                .unwrap_or(DEFAULT_CACHE_INVALIDATION_DELAY_MS),
        ),
        lazy_retention: Duration::from_secs(
            cache
                .lazy_retention_seconds
                .unwrap_or(DEFAULT_CACHE_LAZY_RETENTION_SECS),
        ),
        queue_limit: non_zero_usize(
            cache.queue_limit.unwrap_or(DEFAULT_CACHE_QUEUE_LIMIT),
            "cache.queue_limit",
        )?,
        consume_batch_limit: non_zero_usize(
            cache
                .consume_batch_limit
                .unwrap_or(DEFAULT_CACHE_CONSUME_BATCH_LIMIT),
            "cache.consume_batch_limit",
        )?,
        degraded_utilization,
        response_body_limit_bytes: response_body_limit_bytes.get(),
        fetch_timeout,
        routes,
    })
}

fn build_route_settings(route: RawRouteSettings) -> Result<RouteSettings, LoadError> {
    let prefix = route
        .prefix
        .ok_or_else(|| LoadError::invalid("cache.routes.prefix", "prefix is required"))?;
    if !prefix.starts_with('/') {
        return Err(LoadError::invalid(
            "cache.routes.prefix",
            format!("`{prefix}` must start with `/`"),
        ));
    }

    let ttl_seconds = route.ttl_seconds.unwrap_or(DEFAULT_CACHE_TTL_SECS);
    if ttl_seconds == 0 {
        return Err(LoadError::invalid(
            "cache.routes.ttl_seconds",
            format!("route `{prefix}` must have a positive ttl"),
        ));
    }

    let vary = route
        .vary
        .into_iter()
        .map(|name| {
            HeaderName::from_bytes(name.as_bytes())
                .map(|header| header.as_str().to_string())
                .map_err(|err| {
                    LoadError::invalid("cache.routes.vary", format!("`{name}`: {err}"))
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(RouteSettings {
        prefix,
        ttl_seconds,
        stale_while_revalidate_seconds: route.stale_while_revalidate_seconds.filter(|s| *s > 0),
        tags: route.tags,
        vary,
        private: route.private,
    })
}

fn build_upstream_settings(upstream: RawUpstreamSettings) -> Result<UpstreamSettings, LoadError> {
    let raw_url = upstream
        .base_url
        .unwrap_or_else(|| DEFAULT_UPSTREAM_BASE_URL.to_string());
    let mut base_url = Url::parse(raw_url.trim())
        .map_err(|err| LoadError::invalid("upstream.base_url", format!("failed to parse: {err}")))?;
    if !matches!(base_url.scheme(), "http" | "https") {
        return Err(LoadError::invalid(
            "upstream.base_url",
            "scheme must be http or https",
        ));
    }
    if !base_url.path().ends_with('/') {
        let path = format!("{}/", base_url.path());
        base_url.set_path(&path);
    }

    let api_key = upstream.api_key.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    let timeout_ms = upstream.timeout_ms.unwrap_or(DEFAULT_UPSTREAM_TIMEOUT_MS);
    if timeout_ms == 0 {
        return Err(LoadError::invalid(
            "upstream.timeout_ms",
            "must be greater than zero",
        ));
    }

    Ok(UpstreamSettings {
        base_url,
        api_key,
        timeout: Duration::from_millis(timeout_ms),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    admin_host: Option<String>,
    public_port: Option<u16>,
    admin_port: Option<u16>,
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
    enabled: Option<bool>,
    enable_response_cache: Option<bool>,
    max_entries: Option<u64>,
    response_max_entries: Option<u64>,
    default_ttl_seconds: Option<u64>,
    default_stale_while_revalidate_seconds: Option<u64>,
    sweep_interval_ms: Option<u64>,
    background_invalidation_interval_ms: Option<u64>,
    invalidation_delay_ms: Option<u64>,
    lazy_retention_seconds: Option<u64>,
    queue_limit: Option<u64>,
    consume_batch_limit: Option<u64>,
    degraded_utilization: Option<f64>,
    response_body_limit_bytes: Option<u64>,
    fetch_timeout_ms: Option<u64>,
    routes: Option<Vec<RawRouteSettings>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRouteSettings {
    prefix: Option<String>,
    ttl_seconds: Option<u64>,
    stale_while_revalidate_seconds: Option<u64>,
    tags: Vec<String>,
    vary: Vec<String>,
    private: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawUpstreamSettings {
    base_url: Option<String>,
    api_key: Option<String>,
    timeout_ms: Option<u64>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_usize: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value_usize)
        .ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}
