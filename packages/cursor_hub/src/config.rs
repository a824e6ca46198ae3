use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

// =============================================================================
// Command line
// =============================================================================

#[derive(Parser, Debug, Clone)]
#[command(name = "cursor-hub")]
#[command(about = "Real-time shared cursor hub over WebSockets")]
pub struct Args {
    /// Run without SSL even if certificate paths are configured
    #[arg(long)]
    pub nossl: bool,

    /// Server port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(short = 'b', long)]
    pub host: Option<String>,

    /// Path to the TOML config file
    #[arg(short, long, default_value = "cursor-hub.toml")]
    pub config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub json_logs: bool,
}

// =============================================================================
// File config (figment-deserialized from defaults / TOML / env vars)
// =============================================================================
//
//   cursor-hub.toml:   [hub]
//                      tick_interval_ms = 500
//
//   env var:           CURSOR_HUB_HUB__TICK_INTERVAL_MS=500
//
// The unprefixed variables PORT, NOSSL, PRIVKEY_PATH and FULLCHAIN_PATH are
// also honoured and win over the file.

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub tls: TlsFileConfig,
    #[serde(default)]
    pub hub: HubFileConfig,
}

/// Listener settings (lives under `[server]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Certificate settings (lives under `[tls]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TlsFileConfig {
    #[serde(default = "default_tls_enabled")]
    pub enabled: bool,
    /// PEM certificate chain (FULLCHAIN_PATH)
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    /// PEM private key (PRIVKEY_PATH)
    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

impl Default for TlsFileConfig {
    fn default() -> Self {
        Self {
            enabled: default_tls_enabled(),
            cert_path: None,
            key_path: None,
        }
    }
}

/// Broadcast and connection tuning (lives under `[hub]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HubFileConfig {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
}

impl Default for HubFileConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            mailbox_capacity: default_mailbox_capacity(),
            read_timeout_secs: default_read_timeout_secs(),
            write_timeout_secs: default_write_timeout_secs(),
            ping_interval_secs: default_ping_interval_secs(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    9002
}
fn default_tls_enabled() -> bool {
    true
}
fn default_tick_interval_ms() -> u64 {
    1000
}
fn default_mailbox_capacity() -> usize {
    256
}
fn default_read_timeout_secs() -> u64 {
    60
}
fn default_write_timeout_secs() -> u64 {
    10
}
fn default_ping_interval_secs() -> u64 {
    54
}

/// Build a figment that layers: defaults → TOML file → CURSOR_HUB_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `CURSOR_HUB_SERVER__PORT=9100`  →  `server.port = 9100`
pub fn load_config(config_path: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_path))
        .merge(Env::prefixed("CURSOR_HUB_").split("__"))
}

/// Apply the unprefixed deployment variables on top of the file config.
///
/// `lookup` is normally `std::env::var(..).ok()`; an empty value counts as unset.
pub fn apply_legacy_env(fc: &mut FileConfig, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
    let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

    if get("NOSSL").is_some() {
        fc.tls.enabled = false;
    }
    if let Some(port) = get("PORT") {
        fc.server.port = port
            .parse()
            .map_err(|e| anyhow::anyhow!("PORT={port:?} is not a valid port: {e}"))?;
    }
    if let Some(path) = get("PRIVKEY_PATH") {
        fc.tls.key_path = Some(PathBuf::from(path));
    }
    if let Some(path) = get("FULLCHAIN_PATH") {
        fc.tls.cert_path = Some(PathBuf::from(path));
    }
    Ok(())
}

/// CLI flags have the final say.
pub fn apply_args(fc: &mut FileConfig, args: &Args) {
    if args.nossl {
        fc.tls.enabled = false;
    }
    if let Some(port) = args.port {
        fc.server.port = port;
    }
    if let Some(host) = &args.host {
        fc.server.host = host.clone();
    }
}

// =============================================================================
// Runtime config (derived from FileConfig)
// =============================================================================

/// Timing and capacity knobs for the hub core.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HubSettings {
    /// Period of the snapshot broadcast
    pub tick_interval: Duration,
    /// Undelivered messages a connection may hold before broadcasts are dropped
    pub mailbox_capacity: usize,
    /// Close a connection after this long without any inbound frame
    pub read_timeout: Duration,
    /// Deadline for each outbound frame
    pub write_timeout: Duration,
    /// Keepalive ping period, shorter than `read_timeout`
    pub ping_interval: Duration,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(default_tick_interval_ms()),
            mailbox_capacity: default_mailbox_capacity(),
            read_timeout: Duration::from_secs(default_read_timeout_secs()),
            write_timeout: Duration::from_secs(default_write_timeout_secs()),
            ping_interval: Duration::from_secs(default_ping_interval_secs()),
        }
    }
}

impl HubSettings {
    pub fn from_file(fc: &HubFileConfig) -> Result<Self> {
        let settings = Self {
            tick_interval: Duration::from_millis(fc.tick_interval_ms),
            mailbox_capacity: fc.mailbox_capacity,
            read_timeout: Duration::from_secs(fc.read_timeout_secs),
            write_timeout: Duration::from_secs(fc.write_timeout_secs),
            ping_interval: Duration::from_secs(fc.ping_interval_secs),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tick_interval.is_zero() {
            bail!("hub.tick_interval_ms must be greater than zero");
        }
        if self.mailbox_capacity == 0 {
            bail!("hub.mailbox_capacity must be greater than zero");
        }
        if self.write_timeout.is_zero() {
            bail!("hub.write_timeout_secs must be greater than zero");
        }
        if self.ping_interval.is_zero() || self.ping_interval >= self.read_timeout {
            bail!(
                "hub.ping_interval_secs ({:?}) must be non-zero and shorter than hub.read_timeout_secs ({:?})",
                self.ping_interval,
                self.read_timeout
            );
        }
        Ok(())
    }
}

/// Certificate chain and key used for `wss://`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Fully resolved server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    /// `None` means plain `ws://`
    pub tls: Option<TlsPaths>,
    pub hub: HubSettings,
}

impl ServerConfig {
    pub fn from_file(fc: &FileConfig) -> Result<Self> {
        let addr = format!("{}:{}", fc.server.host, fc.server.port)
            .parse::<SocketAddr>()
            .map_err(|e| {
                anyhow::anyhow!(
                    "invalid listen address {}:{}: {e}",
                    fc.server.host,
                    fc.server.port
                )
            })?;

        // TLS only when enabled and both files are named.
        let tls = match (&fc.tls.cert_path, &fc.tls.key_path) {
            (Some(cert), Some(key)) if fc.tls.enabled => Some(TlsPaths {
                cert_path: cert.clone(),
                key_path: key.clone(),
            }),
            _ => None,
        };
        if fc.tls.enabled && tls.is_none() {
            tracing::warn!("TLS enabled but certificate or key path is not set");
        }

        Ok(Self {
            addr,
            tls,
            hub: HubSettings::from_file(&fc.hub)?,
        })
    }
}

/// Resolve the configuration from every layer, lowest to highest precedence:
/// defaults, TOML file, `CURSOR_HUB_*`, legacy env vars, CLI flags.
pub fn resolve(args: &Args) -> Result<ServerConfig> {
    let mut fc: FileConfig = load_config(&args.config)
        .extract()
        .context("Failed to load configuration")?;
    apply_legacy_env(&mut fc, |key| std::env::var(key).ok())?;
    apply_args(&mut fc, args);
    ServerConfig::from_file(&fc)
}
