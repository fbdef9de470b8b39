//! Configuration model for tsbridge
//!
//! The canonical configuration value is assembled by a provider (TOML file or
//! container labels), overlaid with `TSBRIDGE_*` environment variables, run
//! through secret resolution, defaulting and normalization, and finally
//! validated. Downstream code never looks through to global defaults: after
//! `normalize()` every service carries fully resolved values.

use serde::de::{self, Deserializer};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use crate::errors::{Error, ErrorKind};

// Global defaults applied when the operator leaves a field unset.
pub const DEFAULT_READ_HEADER_TIMEOUT: StdDuration = StdDuration::from_secs(30);
pub const DEFAULT_WRITE_TIMEOUT: StdDuration = StdDuration::from_secs(30);
pub const DEFAULT_IDLE_TIMEOUT: StdDuration = StdDuration::from_secs(120);
pub const DEFAULT_SHUTDOWN_TIMEOUT: StdDuration = StdDuration::from_secs(15);
pub const DEFAULT_DIAL_TIMEOUT: StdDuration = StdDuration::from_secs(30);
pub const DEFAULT_KEEP_ALIVE_TIMEOUT: StdDuration = StdDuration::from_secs(30);
pub const DEFAULT_IDLE_CONN_TIMEOUT: StdDuration = StdDuration::from_secs(90);
pub const DEFAULT_TLS_HANDSHAKE_TIMEOUT: StdDuration = StdDuration::from_secs(10);
pub const DEFAULT_EXPECT_CONTINUE_TIMEOUT: StdDuration = StdDuration::from_secs(1);
pub const DEFAULT_METRICS_READ_HEADER_TIMEOUT: StdDuration = StdDuration::from_secs(5);
pub const DEFAULT_WHOIS_TIMEOUT: StdDuration = StdDuration::from_secs(5);
pub const DEFAULT_MAX_REQUEST_BODY_SIZE: i64 = 50 * 1024 * 1024;

/// Fallback environment variables for secrets and state.
pub const ENV_AUTH_KEY: &str = "TS_AUTHKEY";
pub const ENV_OAUTH_CLIENT_ID: &str = "TS_OAUTH_CLIENT_ID";
pub const ENV_OAUTH_CLIENT_SECRET: &str = "TS_OAUTH_CLIENT_SECRET";
pub const ENV_STATE_DIRECTORY: &str = "STATE_DIRECTORY";
pub const ENV_STATE_DIR: &str = "TSBRIDGE_STATE_DIR";

/// Prefix for environment-variable overrides of any config scalar.
const ENV_OVERRIDE_PREFIX: &str = "TSBRIDGE_";

/// A signed duration parsed from a humantime string such as `"30s"` or
/// `"500ms"`. The sign is kept because `-1ms` means "flush immediately" for
/// streaming responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Duration {
    nanos: i64,
}

impl Duration {
    pub const ZERO: Duration = Duration { nanos: 0 };

    pub fn from_std(d: StdDuration) -> Self {
        Self {
            nanos: d.as_nanos().min(i64::MAX as u128) as i64,
        }
    }

    pub fn from_millis(ms: i64) -> Self {
        Self {
            nanos: ms.saturating_mul(1_000_000),
        }
    }

    pub fn is_negative(&self) -> bool {
        self.nanos < 0
    }

    pub fn is_zero(&self) -> bool {
        self.nanos == 0
    }

    /// The non-negative std equivalent; `None` when the duration is negative.
    pub fn to_std(&self) -> Option<StdDuration> {
        if self.nanos < 0 {
            None
        } else {
            Some(StdDuration::from_nanos(self.nanos as u64))
        }
    }

    /// Std equivalent, clamping negatives to zero.
    pub fn std_or_zero(&self) -> StdDuration {
        self.to_std().unwrap_or(StdDuration::ZERO)
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err("empty duration".to_string());
        }
        let (negative, magnitude) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        let parsed = humantime::parse_duration(magnitude)
            .map_err(|e| format!("invalid duration {:?}: {}", s, e))?;
        let nanos = parsed.as_nanos().min(i64::MAX as u128) as i64;
        Ok(Self {
            nanos: if negative { -nanos } else { nanos },
        })
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nanos < 0 {
            write!(
                f,
                "-{}",
                humantime::format_duration(StdDuration::from_nanos(self.nanos.unsigned_abs()))
            )
        } else {
            write!(
                f,
                "{}",
                humantime::format_duration(StdDuration::from_nanos(self.nanos as u64))
            )
        }
    }
}

impl<'de> Deserialize<'de> for Duration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Duration::parse(&s).map_err(de::Error::custom)
    }
}

/// A byte count with optional unit suffix (`B`, `KB`, `MB`, `GB`, `TB`).
/// `-1` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteSize {
    bytes: i64,
}

impl ByteSize {
    pub fn from_bytes(bytes: i64) -> Self {
        Self { bytes }
    }

    pub fn bytes(&self) -> i64 {
        self.bytes
    }

    pub fn is_unlimited(&self) -> bool {
        self.bytes < 0
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err("empty byte size".to_string());
        }
        if let Ok(v) = trimmed.parse::<i64>() {
            return Ok(Self { bytes: v });
        }
        let upper = trimmed.to_ascii_uppercase();
        let (num, multiplier) = if let Some(n) = upper.strip_suffix("TB") {
            (n, 1024i64.pow(4))
        } else if let Some(n) = upper.strip_suffix("GB") {
            (n, 1024i64.pow(3))
        } else if let Some(n) = upper.strip_suffix("MB") {
            (n, 1024 * 1024)
        } else if let Some(n) = upper.strip_suffix("KB") {
            (n, 1024)
        } else if let Some(n) = upper.strip_suffix('B') {
            (n, 1)
        } else {
            return Err(format!("invalid byte size {:?}", s));
        };
        let value: f64 = num
            .trim()
            .parse()
            .map_err(|_| format!("invalid byte size {:?}", s))?;
        Ok(Self {
            bytes: (value * multiplier as f64) as i64,
        })
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(i64),
            Str(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Int(v) => Ok(ByteSize { bytes: v }),
            Raw::Str(s) => ByteSize::parse(&s).map_err(de::Error::custom),
        }
    }
}

/// TLS termination mode for a service listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// The mesh library provisions and renews the serving certificate
    #[default]
    Auto,
    /// Plain listener; the mesh overlay still encrypts transport
    Off,
}

impl TlsMode {
    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "auto" => Ok(TlsMode::Auto),
            "off" => Ok(TlsMode::Off),
            other => Err(format!(
                "invalid tls_mode {:?}: must be 'auto' or 'off'",
                other
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TlsMode::Auto => "auto",
            TlsMode::Off => "off",
        }
    }
}

/// Complete tsbridge configuration
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Config {
    /// Mesh authentication and node identity settings
    #[serde(default)]
    pub tailscale: Tailscale,

    /// Default settings applied to every service
    #[serde(default)]
    pub global: Global,

    /// Services to expose on the mesh
    #[serde(default)]
    pub services: Vec<Service>,
}

/// Mesh authentication configuration
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Tailscale {
    pub oauth_client_id: Option<String>,
    pub oauth_client_id_env: Option<String>,
    pub oauth_client_id_file: Option<String>,
    pub oauth_client_secret: Option<String>,
    pub oauth_client_secret_env: Option<String>,
    pub oauth_client_secret_file: Option<String>,
    /// Pre-shared auth key (alternative to the OAuth client pair)
    pub auth_key: Option<String>,
    pub auth_key_env: Option<String>,
    pub auth_key_file: Option<String>,
    /// Root directory for per-service node state
    pub state_dir: Option<PathBuf>,
    /// Env var naming the state root (resolved during loading)
    pub state_dir_env: Option<String>,
    /// Tags applied to services that don't declare their own
    #[serde(default)]
    pub default_tags: Vec<String>,
    /// Alternate control-plane URL
    pub control_url: Option<String>,
}

impl Tailscale {
    pub fn uses_oauth(&self) -> bool {
        self.oauth_client_id.is_some() || self.oauth_client_secret.is_some()
    }
}

// Secrets never reach the logs.
impl fmt::Display for Tailscale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| if v.is_some() { "[REDACTED]" } else { "" };
        writeln!(f, "tailscale:")?;
        writeln!(
            f,
            "  oauth_client_id: {}",
            self.oauth_client_id.as_deref().unwrap_or("")
        )?;
        writeln!(
            f,
            "  oauth_client_secret: {}",
            redact(&self.oauth_client_secret)
        )?;
        writeln!(f, "  auth_key: {}", redact(&self.auth_key))?;
        writeln!(
            f,
            "  state_dir: {}",
            self.state_dir
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        )?;
        writeln!(f, "  default_tags: {:?}", self.default_tags)?;
        if let Some(url) = &self.control_url {
            writeln!(f, "  control_url: {}", url)?;
        }
        Ok(())
    }
}

/// Global defaults for all services
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Global {
    pub flush_interval: Option<Duration>,
    pub access_log: Option<bool>,
    #[serde(default)]
    pub trusted_proxies: Vec<String>,
    /// Address for the Prometheus exposition server; metrics disabled if unset
    pub metrics_addr: Option<String>,
    pub response_header_timeout: Option<Duration>,
    pub shutdown_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    pub read_header_timeout: Option<Duration>,
    pub max_request_body_size: Option<ByteSize>,
    // Upstream transport timeouts. tls_handshake_timeout and
    // expect_continue_timeout have no effect on the plain-HTTP upstream
    // transport; they apply once an HTTPS upstream transport exists.
    pub dial_timeout: Option<Duration>,
    pub keep_alive_timeout: Option<Duration>,
    pub idle_conn_timeout: Option<Duration>,
    pub tls_handshake_timeout: Option<Duration>,
    pub expect_continue_timeout: Option<Duration>,
    pub metrics_read_header_timeout: Option<Duration>,
}

/// One service exposed as its own mesh node
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Service {
    /// Service name; doubles as the mesh hostname
    pub name: String,
    /// Backend address: `host:port`, `:port`, `[v6]:port` or `unix://<path>`
    pub backend_addr: String,
    /// Inject caller-identity headers resolved through the mesh
    pub whois_enabled: Option<bool>,
    pub whois_timeout: Option<Duration>,
    pub tls_mode: Option<TlsMode>,
    #[serde(default)]
    pub tags: Vec<String>,
    // Per-service overrides of the global defaults
    pub read_header_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    pub response_header_timeout: Option<Duration>,
    pub access_log: Option<bool>,
    pub max_request_body_size: Option<ByteSize>,
    /// Expose the node to the public internet through the mesh tunnel
    pub funnel_enabled: Option<bool>,
    /// Discard the node's enrollment at shutdown
    #[serde(default)]
    pub ephemeral: bool,
    pub flush_interval: Option<Duration>,
    /// Listener address override (defaults to `:443` or `:80` by TLS mode)
    pub listen_addr: Option<String>,
    // Header manipulation
    #[serde(default)]
    pub upstream_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub downstream_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub remove_upstream: Vec<String>,
    #[serde(default)]
    pub remove_downstream: Vec<String>,
}

impl Service {
    pub fn whois_enabled(&self) -> bool {
        self.whois_enabled.unwrap_or(true)
    }

    pub fn funnel_enabled(&self) -> bool {
        self.funnel_enabled.unwrap_or(false)
    }

    pub fn access_log_enabled(&self) -> bool {
        self.access_log.unwrap_or(true)
    }

    pub fn tls_mode(&self) -> TlsMode {
        self.tls_mode.unwrap_or_default()
    }
}

/// Deep equality for reconciliation. Unset collections and empty collections
/// compare equal by construction, so the derived comparison is exactly the
/// semantics the reconciler needs.
pub fn service_equal(a: &Service, b: &Service) -> bool {
    a == b
}

impl Config {
    /// Load a TOML file as the `file` provider would
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        Self::load_with_provider(path, "file")
    }

    /// Load a TOML file, overlay `TSBRIDGE_*` environment variables, then run
    /// the standard processing pipeline
    pub fn load_with_provider(path: impl AsRef<Path>, provider: &str) -> Result<Self, Error> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::wrap(
                ErrorKind::Config,
                format!("reading config file {}", path.display()),
                e,
            )
        })?;
        let mut value: toml::Value = toml::from_str(&content).map_err(|e| {
            Error::wrap(
                ErrorKind::Config,
                format!("parsing config file {}", path.display()),
                e,
            )
        })?;
        apply_env_overrides(&mut value, std::env::vars());
        let mut cfg: Config = value
            .try_into()
            .map_err(|e| Error::wrap(ErrorKind::Config, "decoding configuration", e))?;
        cfg.process(provider)?;
        Ok(cfg)
    }

    /// Resolve secrets, fill defaults, normalize, and validate
    pub fn process(&mut self, provider: &str) -> Result<(), Error> {
        self.resolve_secrets()?;
        self.set_defaults();
        self.normalize();
        self.validate(provider)
    }

    /// Resolve every secret from its configured source. Precedence per
    /// secret: direct value, file path, named env var, default env var. The
    /// indirect fields are cleared afterwards so inner components only ever
    /// see the direct value.
    pub fn resolve_secrets(&mut self) -> Result<(), Error> {
        resolve_secret(
            &mut self.tailscale.oauth_client_id,
            &mut self.tailscale.oauth_client_id_env,
            &mut self.tailscale.oauth_client_id_file,
            ENV_OAUTH_CLIENT_ID,
            "OAuth client ID",
        )?;
        resolve_secret(
            &mut self.tailscale.oauth_client_secret,
            &mut self.tailscale.oauth_client_secret_env,
            &mut self.tailscale.oauth_client_secret_file,
            ENV_OAUTH_CLIENT_SECRET,
            "OAuth client secret",
        )?;
        resolve_secret(
            &mut self.tailscale.auth_key,
            &mut self.tailscale.auth_key_env,
            &mut self.tailscale.auth_key_file,
            ENV_AUTH_KEY,
            "auth key",
        )?;

        // State dir indirection follows the same collapse-to-direct rule.
        if self.tailscale.state_dir.is_none() {
            if let Some(var) = self.tailscale.state_dir_env.take() {
                match std::env::var(&var) {
                    Ok(v) if !v.is_empty() => self.tailscale.state_dir = Some(PathBuf::from(v)),
                    _ => {
                        return Err(Error::config(format!(
                            "state_dir_env names {:?} but it is not set",
                            var
                        )))
                    }
                }
            }
        } else {
            self.tailscale.state_dir_env = None;
        }
        Ok(())
    }

    /// Fill unset durations and flags with their defaults
    pub fn set_defaults(&mut self) {
        let g = &mut self.global;
        g.read_header_timeout
            .get_or_insert(Duration::from_std(DEFAULT_READ_HEADER_TIMEOUT));
        g.write_timeout
            .get_or_insert(Duration::from_std(DEFAULT_WRITE_TIMEOUT));
        g.idle_timeout
            .get_or_insert(Duration::from_std(DEFAULT_IDLE_TIMEOUT));
        g.shutdown_timeout
            .get_or_insert(Duration::from_std(DEFAULT_SHUTDOWN_TIMEOUT));
        g.access_log.get_or_insert(true);
        g.max_request_body_size
            .get_or_insert(ByteSize::from_bytes(DEFAULT_MAX_REQUEST_BODY_SIZE));
        g.dial_timeout
            .get_or_insert(Duration::from_std(DEFAULT_DIAL_TIMEOUT));
        g.keep_alive_timeout
            .get_or_insert(Duration::from_std(DEFAULT_KEEP_ALIVE_TIMEOUT));
        g.idle_conn_timeout
            .get_or_insert(Duration::from_std(DEFAULT_IDLE_CONN_TIMEOUT));
        g.tls_handshake_timeout
            .get_or_insert(Duration::from_std(DEFAULT_TLS_HANDSHAKE_TIMEOUT));
        g.expect_continue_timeout
            .get_or_insert(Duration::from_std(DEFAULT_EXPECT_CONTINUE_TIMEOUT));
        g.metrics_read_header_timeout
            .get_or_insert(Duration::from_std(DEFAULT_METRICS_READ_HEADER_TIMEOUT));

        for svc in &mut self.services {
            svc.whois_enabled.get_or_insert(true);
            svc.whois_timeout
                .get_or_insert(Duration::from_std(DEFAULT_WHOIS_TIMEOUT));
            svc.tls_mode.get_or_insert(TlsMode::Auto);
        }
    }

    /// Copy global values into services that left them unset
    pub fn normalize(&mut self) {
        let g = self.global.clone();
        for svc in &mut self.services {
            if svc.read_header_timeout.is_none() {
                svc.read_header_timeout = g.read_header_timeout;
            }
            if svc.write_timeout.is_none() {
                svc.write_timeout = g.write_timeout;
            }
            if svc.idle_timeout.is_none() {
                svc.idle_timeout = g.idle_timeout;
            }
            if svc.response_header_timeout.is_none() {
                svc.response_header_timeout = g.response_header_timeout;
            }
            if svc.access_log.is_none() {
                svc.access_log = g.access_log;
            }
            if svc.flush_interval.is_none() {
                svc.flush_interval = g.flush_interval;
            }
            // Zero means "inherit" for the body cap; -1 alone disables it.
            if svc.max_request_body_size.map_or(true, |b| b.bytes() == 0) {
                svc.max_request_body_size = g.max_request_body_size;
            }
            if svc.tags.is_empty() && !self.tailscale.default_tags.is_empty() {
                svc.tags = self.tailscale.default_tags.clone();
            }
        }
    }

    /// Validate the configuration. The docker provider allows an empty
    /// service list at startup since services arrive through the stream.
    pub fn validate(&self, provider: &str) -> Result<(), Error> {
        self.validate_auth()?;
        self.validate_global()?;

        if self.services.is_empty() && provider != "docker" {
            return Err(Error::validation(
                "at least one service must be defined in the [[services]] array",
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for (i, svc) in self.services.iter().enumerate() {
            if svc.name.is_empty() {
                return Err(Error::validation(format!(
                    "service[{}]: service name is required",
                    i
                )));
            }
            if !seen.insert(svc.name.as_str()) {
                return Err(Error::validation(format!(
                    "duplicate service name: {:?}",
                    svc.name
                )));
            }
            self.validate_service(svc)
                .map_err(|e| Error::validation(format!("service {:?}: {}", svc.name, e)))?;
        }
        Ok(())
    }

    fn validate_auth(&self) -> Result<(), Error> {
        let ts = &self.tailscale;
        let has_auth_key = ts.auth_key.as_deref().is_some_and(|k| !k.is_empty());
        let has_id = ts.oauth_client_id.as_deref().is_some_and(|v| !v.is_empty());
        let has_secret = ts
            .oauth_client_secret
            .as_deref()
            .is_some_and(|v| !v.is_empty());

        if has_auth_key && (has_id || has_secret) {
            return Err(Error::validation(
                "cannot specify both OAuth and auth key credentials",
            ));
        }
        if has_auth_key {
            return Ok(());
        }
        if !has_id && !has_secret {
            return Err(Error::validation(
                "either auth key or OAuth credentials (client ID and secret) must be provided",
            ));
        }
        if !has_id {
            return Err(Error::validation("OAuth client ID must be provided"));
        }
        if !has_secret {
            return Err(Error::validation("OAuth client secret must be provided"));
        }
        Ok(())
    }

    fn validate_global(&self) -> Result<(), Error> {
        let g = &self.global;
        for (name, d) in [
            ("read_header_timeout", g.read_header_timeout),
            ("write_timeout", g.write_timeout),
            ("idle_timeout", g.idle_timeout),
            ("response_header_timeout", g.response_header_timeout),
        ] {
            if d.is_some_and(|d| d.is_negative()) {
                return Err(Error::validation(format!("{} cannot be negative", name)));
            }
        }
        match g.shutdown_timeout {
            Some(d) if d.is_negative() || d.is_zero() => {
                return Err(Error::validation("shutdown_timeout must be positive"));
            }
            _ => {}
        }

        if let Some(addr) = &g.metrics_addr {
            validate_listen_addr(addr).map_err(|e| {
                Error::validation(format!("invalid metrics address {:?}: {}", addr, e))
            })?;
        }

        for proxy in &g.trusted_proxies {
            parse_ip_or_cidr(proxy).map_err(|e| {
                Error::validation(format!("invalid trusted proxy {:?}: {}", proxy, e))
            })?;
        }
        Ok(())
    }

    fn validate_service(&self, svc: &Service) -> Result<(), String> {
        validate_backend_address(&svc.backend_addr)?;

        if svc.whois_enabled() && svc.whois_timeout.is_some_and(|d| d.is_negative()) {
            return Err("whois_timeout must be non-negative".to_string());
        }

        for (name, d) in [
            ("read_header_timeout", svc.read_header_timeout),
            ("write_timeout", svc.write_timeout),
            ("idle_timeout", svc.idle_timeout),
            ("response_header_timeout", svc.response_header_timeout),
        ] {
            if d.is_some_and(|d| d.is_negative()) {
                return Err(format!("{} must be non-negative", name));
            }
        }

        if let Some(addr) = &svc.listen_addr {
            validate_listen_addr(addr)
                .map_err(|e| format!("invalid listen_addr {:?}: {}", addr, e))?;
        }

        if self.tailscale.uses_oauth() && svc.tags.is_empty() {
            return Err(
                "service must have at least one tag when using OAuth authentication".to_string(),
            );
        }

        for (headers, label) in [
            (&svc.upstream_headers, "upstream_headers"),
            (&svc.downstream_headers, "downstream_headers"),
        ] {
            for (name, value) in headers {
                if !is_valid_header_name(name) {
                    return Err(format!("{}: invalid header name {:?}", label, name));
                }
                if !is_valid_header_value(value) {
                    return Err(format!("{}: invalid value for header {:?}", label, name));
                }
            }
        }
        for (names, label) in [
            (&svc.remove_upstream, "remove_upstream"),
            (&svc.remove_downstream, "remove_downstream"),
        ] {
            for name in names {
                if !is_valid_header_name(name) {
                    return Err(format!("{}: invalid header name {:?}", label, name));
                }
            }
        }
        Ok(())
    }
}

fn resolve_secret(
    direct: &mut Option<String>,
    env_name: &mut Option<String>,
    file: &mut Option<String>,
    fallback_env: &str,
    field: &str,
) -> Result<(), Error> {
    if direct.as_deref().is_some_and(|v| !v.is_empty()) {
        *env_name = None;
        *file = None;
        return Ok(());
    }

    if let Some(path) = file.take() {
        env_name.take();
        let value = std::fs::read_to_string(&path).map_err(|e| {
            Error::wrap(
                ErrorKind::Config,
                format!("reading {} from file {:?}", field, path),
                e,
            )
        })?;
        *direct = Some(value.trim().to_string());
        return Ok(());
    }

    if let Some(var) = env_name.take() {
        match std::env::var(&var) {
            Ok(v) if !v.is_empty() => {
                *direct = Some(v);
                return Ok(());
            }
            _ => {
                return Err(Error::config(format!(
                    "resolving {}: env var {:?} is not set",
                    field, var
                )))
            }
        }
    }

    if let Ok(v) = std::env::var(fallback_env) {
        if !v.is_empty() {
            *direct = Some(v);
        }
    }
    Ok(())
}

/// Overlay `TSBRIDGE_<SECTION>_<KEY>` environment variables onto the parsed
/// TOML tree. Only the first underscore separates section from key, matching
/// the flat two-level layout of the config file.
pub fn apply_env_overrides(value: &mut toml::Value, vars: impl Iterator<Item = (String, String)>) {
    for (key, raw) in vars {
        let Some(rest) = key.strip_prefix(ENV_OVERRIDE_PREFIX) else {
            continue;
        };
        // Reserved for the state-root fallback, not a config override.
        if rest.eq_ignore_ascii_case("STATE_DIR") {
            continue;
        }
        let lowered = rest.to_ascii_lowercase();
        let Some((section, field)) = lowered.split_once('_') else {
            continue;
        };
        let Some(table) = value.as_table_mut() else {
            continue;
        };
        let entry = table
            .entry(section.to_string())
            .or_insert_with(|| toml::Value::Table(Default::default()));
        if let Some(section_table) = entry.as_table_mut() {
            section_table.insert(field.to_string(), env_value_to_toml(field, &raw));
        }
    }
}

/// Fields that decode as arrays; a single env value still becomes a
/// one-element list for them.
const LIST_FIELDS: [&str; 5] = [
    "default_tags",
    "trusted_proxies",
    "tags",
    "remove_upstream",
    "remove_downstream",
];

fn env_value_to_toml(field: &str, raw: &str) -> toml::Value {
    if raw.contains(',') || LIST_FIELDS.contains(&field) {
        return toml::Value::Array(
            raw.split(',')
                .map(|s| toml::Value::String(s.trim().to_string()))
                .collect(),
        );
    }
    if let Ok(b) = raw.parse::<bool>() {
        return toml::Value::Boolean(b);
    }
    if let Ok(i) = raw.parse::<i64>() {
        return toml::Value::Integer(i);
    }
    toml::Value::String(raw.to_string())
}

/// Validate a backend address: `host:port`, `:port`, `[v6]:port`, or
/// `unix://<absolute path>` with no traversal segments.
pub fn validate_backend_address(addr: &str) -> Result<(), String> {
    if addr.is_empty() {
        return Err("backend address cannot be empty".to_string());
    }

    if let Some(path) = addr.strip_prefix("unix://") {
        if path.is_empty() {
            return Err("invalid unix socket address: missing path".to_string());
        }
        if !path.starts_with('/') {
            return Err("unix socket path must be absolute".to_string());
        }
        if path.split('/').any(|seg| seg == "..") {
            return Err("invalid unix socket path: traversal segment".to_string());
        }
        return Ok(());
    }
    if addr.starts_with("unix:") {
        return Err("unix socket path must start with unix://".to_string());
    }

    let (_host, port) = split_host_port(addr)?;
    validate_port(port)
}

/// Validate a listener address (metrics or per-service override); the host
/// part may be empty, a name, or an IP literal.
pub fn validate_listen_addr(addr: &str) -> Result<(), String> {
    let (_host, port) = split_host_port(addr)?;
    validate_port(port)
}

fn split_host_port(addr: &str) -> Result<(&str, &str), String> {
    if let Some(rest) = addr.strip_prefix('[') {
        let Some((host, port_part)) = rest.split_once(']') else {
            return Err("invalid backend address format: unterminated IPv6 literal".to_string());
        };
        let Some(port) = port_part.strip_prefix(':') else {
            return Err("invalid backend address format: missing port".to_string());
        };
        return Ok((host, port));
    }
    match addr.rsplit_once(':') {
        Some((host, port)) => Ok((host, port)),
        None => Err("invalid backend address format: missing port".to_string()),
    }
}

fn validate_port(port: &str) -> Result<(), String> {
    if port.is_empty() {
        return Err("invalid port: empty".to_string());
    }
    match port.parse::<i64>() {
        Ok(p) if (1..=65535).contains(&p) => Ok(()),
        Ok(_) => Err("port must be between 1 and 65535".to_string()),
        Err(_) => Err(format!("invalid port {:?}", port)),
    }
}

/// Check whether an IP belongs to a trusted proxy entry (single IP or CIDR)
pub fn ip_matches(entry: &str, ip: std::net::IpAddr) -> bool {
    match parse_ip_or_cidr(entry) {
        Ok((net, prefix)) => cidr_contains(net, prefix, ip),
        Err(_) => false,
    }
}

fn parse_ip_or_cidr(entry: &str) -> Result<(std::net::IpAddr, u8), String> {
    if let Some((ip_part, prefix_part)) = entry.split_once('/') {
        let ip: std::net::IpAddr = ip_part
            .parse()
            .map_err(|_| format!("invalid CIDR base address {:?}", ip_part))?;
        let prefix: u8 = prefix_part
            .parse()
            .map_err(|_| format!("invalid CIDR prefix {:?}", prefix_part))?;
        let max = match ip {
            std::net::IpAddr::V4(_) => 32,
            std::net::IpAddr::V6(_) => 128,
        };
        if prefix > max {
            return Err(format!("CIDR prefix {} out of range", prefix));
        }
        Ok((ip, prefix))
    } else {
        let ip: std::net::IpAddr = entry
            .parse()
            .map_err(|_| format!("invalid IP address {:?}", entry))?;
        let prefix = match ip {
            std::net::IpAddr::V4(_) => 32,
            std::net::IpAddr::V6(_) => 128,
        };
        Ok((ip, prefix))
    }
}

fn cidr_contains(net: std::net::IpAddr, prefix: u8, ip: std::net::IpAddr) -> bool {
    match (net, ip) {
        (std::net::IpAddr::V4(net), std::net::IpAddr::V4(ip)) => {
            let mask = if prefix == 0 {
                0
            } else {
                u32::MAX << (32 - prefix as u32)
            };
            (u32::from(net) & mask) == (u32::from(ip) & mask)
        }
        (std::net::IpAddr::V6(net), std::net::IpAddr::V6(ip)) => {
            let mask = if prefix == 0 {
                0
            } else {
                u128::MAX << (128 - prefix as u32)
            };
            (u128::from(net) & mask) == (u128::from(ip) & mask)
        }
        _ => false,
    }
}

/// RFC 7230 token check for header names
pub fn is_valid_header_name(name: &str) -> bool {
    !name.is_empty()
        && name.bytes().all(|b| {
            b.is_ascii_alphanumeric()
                || matches!(
                    b,
                    b'!' | b'#'
                        | b'$'
                        | b'%'
                        | b'&'
                        | b'\''
                        | b'*'
                        | b'+'
                        | b'-'
                        | b'.'
                        | b'^'
                        | b'_'
                        | b'`'
                        | b'|'
                        | b'~'
                )
        })
}

/// Header values must carry no control bytes (including CR, LF, NUL and DEL)
pub fn is_valid_header_value(value: &str) -> bool {
    value.bytes().all(|b| b >= 0x20 && b != 0x7f)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config(services: Vec<Service>) -> Config {
        let mut cfg = Config {
            tailscale: Tailscale {
                auth_key: Some("tskey-test".to_string()),
                ..Default::default()
            },
            services,
            ..Default::default()
        };
        cfg.set_defaults();
        cfg.normalize();
        cfg
    }

    fn svc(name: &str, backend: &str) -> Service {
        Service {
            name: name.to_string(),
            backend_addr: backend.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
[tailscale]
auth_key = "tskey-abc"

[[services]]
name = "api"
backend_addr = "127.0.0.1:8080"
"#;
        let mut cfg: Config = toml::from_str(toml).unwrap();
        cfg.process("file").unwrap();

        assert_eq!(cfg.services.len(), 1);
        assert_eq!(cfg.services[0].name, "api");
        assert_eq!(cfg.services[0].tls_mode(), TlsMode::Auto);
        assert!(cfg.services[0].whois_enabled());
        assert_eq!(
            cfg.global.read_header_timeout.unwrap().to_std().unwrap(),
            DEFAULT_READ_HEADER_TIMEOUT
        );
    }

    #[test]
    fn test_parse_full_service() {
        let toml = r#"
[tailscale]
auth_key = "tskey-abc"
default_tags = ["tag:proxy"]

[global]
metrics_addr = ":9090"
trusted_proxies = ["10.0.0.0/8", "192.168.1.5"]
max_request_body_size = "10MB"
flush_interval = "-1ms"

[[services]]
name = "web"
backend_addr = "localhost:3000"
tls_mode = "off"
funnel_enabled = false
ephemeral = true
whois_timeout = "2s"
upstream_headers = { "X-Custom" = "v" }
remove_downstream = ["Server"]
"#;
        let mut cfg: Config = toml::from_str(toml).unwrap();
        cfg.process("file").unwrap();

        let svc = &cfg.services[0];
        assert_eq!(svc.tls_mode(), TlsMode::Off);
        assert!(svc.ephemeral);
        assert!(svc.flush_interval.unwrap().is_negative());
        assert_eq!(svc.max_request_body_size.unwrap().bytes(), 10 * 1024 * 1024);
        assert_eq!(svc.tags, vec!["tag:proxy"]);
        assert_eq!(svc.upstream_headers.get("X-Custom").unwrap(), "v");
    }

    #[test]
    fn test_duration_parsing() {
        assert_eq!(
            Duration::parse("30s").unwrap().to_std().unwrap(),
            StdDuration::from_secs(30)
        );
        assert_eq!(
            Duration::parse("500ms").unwrap().to_std().unwrap(),
            StdDuration::from_millis(500)
        );
        assert!(Duration::parse("-1ms").unwrap().is_negative());
        assert!(Duration::parse("0s").unwrap().is_zero());
        assert!(Duration::parse("").is_err());
        assert!(Duration::parse("soon").is_err());
    }

    #[test]
    fn test_byte_size_parsing() {
        assert_eq!(ByteSize::parse("1024").unwrap().bytes(), 1024);
        assert_eq!(ByteSize::parse("1KB").unwrap().bytes(), 1024);
        assert_eq!(ByteSize::parse("10MB").unwrap().bytes(), 10 * 1024 * 1024);
        assert_eq!(ByteSize::parse("1GB").unwrap().bytes(), 1024 * 1024 * 1024);
        assert_eq!(ByteSize::parse("2TB").unwrap().bytes(), 2 * 1024i64.pow(4));
        assert!(ByteSize::parse("-1").unwrap().is_unlimited());
        assert!(ByteSize::parse("lots").is_err());
    }

    #[test]
    fn test_validate_requires_service_for_file_provider() {
        let cfg = base_config(vec![]);
        assert!(cfg.validate("file").is_err());
        assert!(cfg.validate("docker").is_ok());
    }

    #[test]
    fn test_validate_duplicate_names() {
        let cfg = base_config(vec![
            svc("api", "127.0.0.1:8080"),
            svc("api", "127.0.0.1:8081"),
        ]);
        let err = cfg.validate("file").unwrap_err();
        assert!(err.to_string().contains("duplicate service name"));
    }

    #[test]
    fn test_validate_auth_exactly_one_method() {
        let mut cfg = base_config(vec![svc("api", "127.0.0.1:8080")]);
        cfg.tailscale.oauth_client_id = Some("id".to_string());
        let err = cfg.validate("file").unwrap_err();
        assert!(err.to_string().contains("cannot specify both"));

        cfg.tailscale.auth_key = None;
        cfg.tailscale.oauth_client_secret = None;
        let err = cfg.validate("file").unwrap_err();
        assert!(err.to_string().contains("OAuth client secret"));

        cfg.tailscale.oauth_client_id = None;
        let err = cfg.validate("file").unwrap_err();
        assert!(err
            .to_string()
            .contains("either auth key or OAuth credentials"));
    }

    #[test]
    fn test_validate_oauth_requires_tags() {
        let mut cfg = Config {
            tailscale: Tailscale {
                oauth_client_id: Some("id".to_string()),
                oauth_client_secret: Some("secret".to_string()),
                ..Default::default()
            },
            services: vec![svc("api", "127.0.0.1:8080")],
            ..Default::default()
        };
        cfg.set_defaults();
        cfg.normalize();
        let err = cfg.validate("file").unwrap_err();
        assert!(err.to_string().contains("at least one tag"));

        // Default tags satisfy the requirement through normalization.
        cfg.tailscale.default_tags = vec!["tag:proxy".to_string()];
        cfg.normalize();
        assert!(cfg.validate("file").is_ok());
    }

    #[test]
    fn test_validate_shutdown_timeout_positive() {
        let mut cfg = base_config(vec![svc("api", "127.0.0.1:8080")]);
        cfg.global.shutdown_timeout = Some(Duration::ZERO);
        assert!(cfg.validate("file").is_err());

        cfg.global.shutdown_timeout = Some(Duration::parse("-5s").unwrap());
        assert!(cfg.validate("file").is_err());

        cfg.global.shutdown_timeout = Some(Duration::parse("5s").unwrap());
        assert!(cfg.validate("file").is_ok());
    }

    #[test]
    fn test_validate_trusted_proxies() {
        let mut cfg = base_config(vec![svc("api", "127.0.0.1:8080")]);
        cfg.global.trusted_proxies = vec!["10.0.0.0/8".to_string(), "::1".to_string()];
        assert!(cfg.validate("file").is_ok());

        cfg.global.trusted_proxies = vec!["not-an-ip".to_string()];
        assert!(cfg.validate("file").is_err());

        cfg.global.trusted_proxies = vec!["10.0.0.0/64".to_string()];
        assert!(cfg.validate("file").is_err());
    }

    #[test]
    fn test_validate_header_maps() {
        let mut bad_value = svc("api", "127.0.0.1:8080");
        bad_value
            .upstream_headers
            .insert("X-Bad".to_string(), "v\r\nX-Evil: 1".to_string());
        let cfg = base_config(vec![bad_value]);
        let err = cfg.validate("file").unwrap_err();
        assert!(err.to_string().contains("invalid value"));

        let mut bad_name = svc("api", "127.0.0.1:8080");
        bad_name
            .upstream_headers
            .insert("X Bad".to_string(), "v".to_string());
        let cfg = base_config(vec![bad_name]);
        let err = cfg.validate("file").unwrap_err();
        assert!(err.to_string().contains("invalid header name"));
    }

    #[test]
    fn test_backend_address_validation() {
        for valid in [
            "localhost:8080",
            "127.0.0.1:3000",
            "[::1]:8080",
            "api.example.com:443",
            "0.0.0.0:65535",
            "localhost:1",
            ":8080",
            "unix:///var/run/app.sock",
            "unix:///tmp/sockets/app.sock",
        ] {
            assert!(
                validate_backend_address(valid).is_ok(),
                "expected {:?} to be valid",
                valid
            );
        }

        for (invalid, fragment) in [
            ("", "cannot be empty"),
            ("localhost", "missing port"),
            (":", "invalid port"),
            ("localhost:0", "between 1 and 65535"),
            ("localhost:65536", "between 1 and 65535"),
            ("localhost:-1", "between 1 and 65535"),
            ("localhost:abc", "invalid port"),
            ("unix:/var/run/app.sock", "must start with unix://"),
            ("unix://../../../etc/passwd", "must be absolute"),
            ("unix://./socket", "must be absolute"),
            ("unix:///var/run/../../etc/passwd", "traversal"),
        ] {
            let err = validate_backend_address(invalid).unwrap_err();
            assert!(
                err.contains(fragment),
                "address {:?}: expected {:?} in {:?}",
                invalid,
                fragment,
                err
            );
        }
    }

    #[test]
    fn test_header_name_validation() {
        for valid in ["X-Custom-Header", "Authorization", "x-api-key", "X"] {
            assert!(is_valid_header_name(valid), "{:?}", valid);
        }
        for invalid in [
            "X-Custom Header",
            "X-Custom:Header",
            "X-Custom;Header",
            "X-Custom(Header)",
            "X-Custom\"Header\"",
            "",
            "   ",
            "X-Custom\nHeader",
            "X-Custom\tHeader",
            "X-Custom\x00Header",
        ] {
            assert!(!is_valid_header_name(invalid), "{:?}", invalid);
        }
    }

    #[test]
    fn test_header_value_validation() {
        for valid in [
            "simple-value",
            "Bearer token123",
            "application/json; charset=utf-8",
            "value1, value2",
            "",
        ] {
            assert!(is_valid_header_value(valid), "{:?}", valid);
        }
        for invalid in [
            "value\r\nX-Injected: bad",
            "value\ninjected",
            "value\rinjected",
            "value\x00null",
            "value\x07bell",
            "value\x7fdel",
            "value\ttab",
        ] {
            assert!(!is_valid_header_value(invalid), "{:?}", invalid);
        }
    }

    #[test]
    fn test_secret_resolution_direct_wins() {
        let mut cfg = Config {
            tailscale: Tailscale {
                auth_key: Some("direct".to_string()),
                auth_key_env: Some("TSBRIDGE_TEST_UNSET_VAR".to_string()),
                auth_key_file: Some("/nonexistent/file".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        cfg.resolve_secrets().unwrap();
        assert_eq!(cfg.tailscale.auth_key.as_deref(), Some("direct"));
        assert!(cfg.tailscale.auth_key_env.is_none());
        assert!(cfg.tailscale.auth_key_file.is_none());
    }

    #[test]
    fn test_secret_resolution_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authkey");
        std::fs::write(&path, "tskey-from-file\n").unwrap();

        let mut cfg = Config {
            tailscale: Tailscale {
                auth_key_file: Some(path.to_string_lossy().to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        cfg.resolve_secrets().unwrap();
        assert_eq!(cfg.tailscale.auth_key.as_deref(), Some("tskey-from-file"));
        assert!(cfg.tailscale.auth_key_file.is_none());
    }

    #[test]
    fn test_secret_resolution_from_named_env() {
        std::env::set_var("TSBRIDGE_TEST_SECRET_SRC", "tskey-from-env");
        let mut cfg = Config {
            tailscale: Tailscale {
                auth_key_env: Some("TSBRIDGE_TEST_SECRET_SRC".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        cfg.resolve_secrets().unwrap();
        assert_eq!(cfg.tailscale.auth_key.as_deref(), Some("tskey-from-env"));
        std::env::remove_var("TSBRIDGE_TEST_SECRET_SRC");
    }

    #[test]
    fn test_secret_resolution_missing_named_env_fails() {
        let mut cfg = Config {
            tailscale: Tailscale {
                auth_key_env: Some("TSBRIDGE_TEST_DEFINITELY_UNSET".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(cfg.resolve_secrets().is_err());
    }

    #[test]
    fn test_env_overrides_applied_to_tree() {
        let mut value: toml::Value = toml::from_str(
            r#"
[tailscale]
auth_key = "tskey"
"#,
        )
        .unwrap();
        let vars = vec![
            (
                "TSBRIDGE_GLOBAL_METRICS_ADDR".to_string(),
                ":9100".to_string(),
            ),
            (
                "TSBRIDGE_TAILSCALE_DEFAULT_TAGS".to_string(),
                "tag:a,tag:b".to_string(),
            ),
            ("UNRELATED_VAR".to_string(), "ignored".to_string()),
        ];
        apply_env_overrides(&mut value, vars.into_iter());

        let cfg: Config = value.try_into().unwrap();
        assert_eq!(cfg.global.metrics_addr.as_deref(), Some(":9100"));
        assert_eq!(cfg.tailscale.default_tags, vec!["tag:a", "tag:b"]);
        assert_eq!(cfg.tailscale.auth_key.as_deref(), Some("tskey"));
    }

    #[test]
    fn test_processing_pipeline_idempotent() {
        let mut cfg = Config {
            tailscale: Tailscale {
                auth_key: Some("tskey".to_string()),
                ..Default::default()
            },
            services: vec![svc("api", "127.0.0.1:8080")],
            ..Default::default()
        };
        cfg.process("file").unwrap();
        let once = cfg.clone();
        cfg.process("file").unwrap();
        assert_eq!(once, cfg);
    }

    #[test]
    fn test_normalize_copies_globals() {
        let mut cfg = Config {
            tailscale: Tailscale {
                auth_key: Some("tskey".to_string()),
                ..Default::default()
            },
            global: Global {
                flush_interval: Some(Duration::parse("-1ms").unwrap()),
                access_log: Some(false),
                ..Default::default()
            },
            services: vec![svc("api", "127.0.0.1:8080")],
            ..Default::default()
        };
        cfg.set_defaults();
        cfg.normalize();

        let s = &cfg.services[0];
        assert!(s.flush_interval.unwrap().is_negative());
        assert!(!s.access_log_enabled());
        assert_eq!(s.read_header_timeout, cfg.global.read_header_timeout);
        assert_eq!(
            s.max_request_body_size.unwrap().bytes(),
            DEFAULT_MAX_REQUEST_BODY_SIZE
        );
    }

    #[test]
    fn test_service_override_survives_normalize() {
        let mut override_svc = svc("api", "127.0.0.1:8080");
        override_svc.access_log = Some(true);
        override_svc.max_request_body_size = Some(ByteSize::from_bytes(-1));
        let mut cfg = Config {
            tailscale: Tailscale {
                auth_key: Some("tskey".to_string()),
                ..Default::default()
            },
            global: Global {
                access_log: Some(false),
                ..Default::default()
            },
            services: vec![override_svc],
            ..Default::default()
        };
        cfg.set_defaults();
        cfg.normalize();

        assert!(cfg.services[0].access_log_enabled());
        assert!(cfg.services[0].max_request_body_size.unwrap().is_unlimited());
    }

    #[test]
    fn test_service_equal_identical() {
        let a = svc("api", "127.0.0.1:8080");
        assert!(service_equal(&a, &a.clone()));
    }

    #[test]
    fn test_service_equal_symmetric() {
        let a = svc("api", "127.0.0.1:8080");
        let mut b = a.clone();
        b.backend_addr = "127.0.0.1:8081".to_string();
        assert_eq!(service_equal(&a, &b), service_equal(&b, &a));
        assert!(!service_equal(&a, &b));
    }

    #[test]
    fn test_service_equal_field_differences() {
        let base = svc("api", "127.0.0.1:8080");

        let mut other = base.clone();
        other.tls_mode = Some(TlsMode::Off);
        assert!(!service_equal(&base, &other));

        let mut other = base.clone();
        other.funnel_enabled = Some(false);
        assert!(!service_equal(&base, &other)); // unset vs explicit false differ

        let mut other = base.clone();
        other.ephemeral = true;
        assert!(!service_equal(&base, &other));

        let mut other = base.clone();
        other.tags = vec!["tag:a".to_string()];
        assert!(!service_equal(&base, &other));

        let mut other = base.clone();
        other
            .upstream_headers
            .insert("X-Custom".to_string(), "v".to_string());
        assert!(!service_equal(&base, &other));

        let mut other = base.clone();
        other.whois_timeout = Some(Duration::parse("10s").unwrap());
        assert!(!service_equal(&base, &other));
    }

    #[test]
    fn test_service_equal_empty_collections() {
        let a = svc("api", "127.0.0.1:8080");
        let mut b = a.clone();
        b.tags = Vec::new();
        b.upstream_headers = BTreeMap::new();
        assert!(service_equal(&a, &b));
    }

    #[test]
    fn test_ip_matches() {
        assert!(ip_matches("10.0.0.0/8", "10.1.2.3".parse().unwrap()));
        assert!(!ip_matches("10.0.0.0/8", "192.168.1.1".parse().unwrap()));
        assert!(ip_matches("192.168.1.5", "192.168.1.5".parse().unwrap()));
        assert!(!ip_matches("192.168.1.5", "192.168.1.6".parse().unwrap()));
        assert!(ip_matches("::1", "::1".parse().unwrap()));
        assert!(!ip_matches("10.0.0.0/8", "::1".parse().unwrap()));
    }

    #[test]
    fn test_tailscale_display_redacts_secrets() {
        let ts = Tailscale {
            auth_key: Some("tskey-supersecret".to_string()),
            oauth_client_secret: Some("oauth-secret".to_string()),
            ..Default::default()
        };
        let rendered = ts.to_string();
        assert!(!rendered.contains("supersecret"));
        assert!(!rendered.contains("oauth-secret"));
        assert!(rendered.contains("[REDACTED]"));
    }

    #[test]
    fn test_listen_addr_validation() {
        assert!(validate_listen_addr(":9090").is_ok());
        assert!(validate_listen_addr("127.0.0.1:9090").is_ok());
        assert!(validate_listen_addr("[::]:9090").is_ok());
        assert!(validate_listen_addr("9090").is_err());
        assert!(validate_listen_addr(":0").is_err());
    }
}
