//! Container-label configuration provider
//!
//! Translates labels on running containers into a [`Config`]: labels on the
//! manager container supply the `[tailscale]` and `[global]` sections, and
//! every other running container with `<prefix>.enabled=true` contributes
//! one service. Lifecycle events (start/stop/die/pause/unpause) are
//! debounced into whole-Config emissions. A container with malformed labels
//! is logged and skipped; the rest of the configuration still applies.

use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::models::ContainerSummary;
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration as StdDuration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::{self, ByteSize, Config, Duration, Service, TlsMode};
use crate::errors::{Error, ErrorKind};
use crate::provider::Provider;

/// Quiet period collapsing a burst of container events into one emission
const EVENT_DEBOUNCE: StdDuration = StdDuration::from_millis(500);

/// Configuration provider backed by the container runtime's label store
pub struct DockerProvider {
    client: Docker,
    label_prefix: String,
    last_config: Arc<StdMutex<Option<Config>>>,
}

impl DockerProvider {
    /// Connect to the container runtime.
    ///
    /// Connection priority: explicit endpoint, `DOCKER_HOST`, then the
    /// platform socket defaults.
    pub async fn new(endpoint: Option<&str>, label_prefix: &str) -> Result<Self, Error> {
        let client = if let Some(host) = endpoint {
            connect_to_host(host)?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            connect_to_host(&host)?
        } else {
            Docker::connect_with_socket_defaults().map_err(|e| {
                Error::wrap(ErrorKind::Resource, "connecting to container runtime", e)
            })?
        };

        client.ping().await.map_err(|e| {
            Error::wrap(
                ErrorKind::Resource,
                "container runtime is not responding",
                e,
            )
        })?;
        debug!("connected to container runtime");

        Ok(Self {
            client,
            label_prefix: label_prefix.to_string(),
            last_config: Arc::new(StdMutex::new(None)),
        })
    }
}

fn connect_to_host(host: &str) -> Result<Docker, Error> {
    if let Some(socket) = host.strip_prefix("unix://") {
        Docker::connect_with_socket(socket, 120, bollard::API_DEFAULT_VERSION).map_err(|e| {
            Error::wrap(
                ErrorKind::Resource,
                format!("connecting to unix socket {:?}", socket),
                e,
            )
        })
    } else if host.starts_with("tcp://") || host.starts_with("http://") {
        Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION).map_err(|e| {
            Error::wrap(
                ErrorKind::Resource,
                format!("connecting to endpoint {:?}", host),
                e,
            )
        })
    } else {
        Err(Error::validation(format!(
            "invalid container endpoint {:?}: expected unix:///path or tcp://host:port",
            host
        )))
    }
}

#[async_trait]
impl Provider for DockerProvider {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn load(&self) -> Result<Config, Error> {
        let cfg = build_config(&self.client, &self.label_prefix).await?;
        *self.last_config.lock().expect("config cache poisoned") = Some(cfg.clone());
        Ok(cfg)
    }

    async fn watch(&self) -> Result<mpsc::Receiver<Config>, Error> {
        let (tx, rx) = mpsc::channel(4);
        let client = self.client.clone();
        let prefix = self.label_prefix.clone();
        let last_config = Arc::clone(&self.last_config);

        tokio::spawn(async move {
            let mut filters = HashMap::new();
            filters.insert("type".to_string(), vec!["container".to_string()]);
            filters.insert(
                "event".to_string(),
                ["start", "stop", "die", "pause", "unpause"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            );
            let mut events = client.events(Some(EventsOptions {
                since: None,
                until: None,
                filters,
            }));

            let mut pending = false;
            let mut deadline = tokio::time::Instant::now();

            loop {
                tokio::select! {
                    maybe = events.next() => match maybe {
                        Some(Ok(event)) => {
                            debug!(action = ?event.action, "container event");
                            pending = true;
                            deadline = tokio::time::Instant::now() + EVENT_DEBOUNCE;
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "container event stream error");
                            tokio::time::sleep(StdDuration::from_secs(1)).await;
                        }
                        None => {
                            debug!("container event stream closed");
                            break;
                        }
                    },
                    _ = tokio::time::sleep_until(deadline), if pending => {
                        pending = false;
                        match build_config(&client, &prefix).await {
                            Ok(cfg) => {
                                let changed = {
                                    let mut last = last_config.lock().expect("config cache poisoned");
                                    if last.as_ref() == Some(&cfg) {
                                        false
                                    } else {
                                        *last = Some(cfg.clone());
                                        true
                                    }
                                };
                                if changed && tx.send(cfg).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "failed to rebuild config from container labels");
                            }
                        }
                    },
                    _ = tx.closed() => break,
                }
            }
            debug!("container label watch stopped");
        });

        Ok(rx)
    }
}

async fn build_config(client: &Docker, prefix: &str) -> Result<Config, Error> {
    let options = ListContainersOptions::<String> {
        all: false,
        ..Default::default()
    };
    let containers = client
        .list_containers(Some(options))
        .await
        .map_err(|e| Error::wrap(ErrorKind::Network, "listing containers", e))?;

    let mut cfg = Config::default();
    if let Some(manager) = find_manager_container(&containers, prefix) {
        if let Some(labels) = &manager.labels {
            parse_global_labels(labels, prefix, &mut cfg);
        }
    }

    for container in &containers {
        let labels = match &container.labels {
            Some(labels) => labels,
            None => continue,
        };
        let parser = LabelParser::new(labels, prefix);
        if parser.get_bool("enabled").ok().flatten() != Some(true) {
            continue;
        }
        match parse_service_config(container, prefix) {
            Ok(svc) => cfg.services.push(svc),
            Err(e) => {
                warn!(
                    container = %container_name(container),
                    error = %e,
                    "skipping container with invalid service labels"
                );
            }
        }
    }

    cfg.process("docker")?;
    Ok(cfg)
}

/// The manager container carries the `[tailscale]`/`[global]` labels. Inside
/// a container our hostname is the container id, which identifies us
/// directly; otherwise fall back to whichever container declares those
/// sections.
fn find_manager_container<'a>(
    containers: &'a [ContainerSummary],
    prefix: &str,
) -> Option<&'a ContainerSummary> {
    if let Ok(hostname) = std::env::var("HOSTNAME") {
        if !hostname.is_empty() {
            if let Some(own) = containers
                .iter()
                .find(|c| c.id.as_deref().is_some_and(|id| id.starts_with(&hostname)))
            {
                return Some(own);
            }
        }
    }
    let tailscale_prefix = format!("{}.tailscale.", prefix);
    let global_prefix = format!("{}.global.", prefix);
    containers.iter().find(|c| {
        c.labels.as_ref().is_some_and(|labels| {
            labels
                .keys()
                .any(|k| k.starts_with(&tailscale_prefix) || k.starts_with(&global_prefix))
        })
    })
}

fn container_name(container: &ContainerSummary) -> String {
    container
        .names
        .as_ref()
        .and_then(|names| names.first())
        .map(|n| n.trim_start_matches('/').to_string())
        .or_else(|| container.id.as_ref().map(|id| id.chars().take(12).collect()))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Typed access to `<prefix>.<key>` labels
struct LabelParser<'a> {
    labels: &'a HashMap<String, String>,
    prefix: &'a str,
}

impl<'a> LabelParser<'a> {
    fn new(labels: &'a HashMap<String, String>, prefix: &'a str) -> Self {
        Self { labels, prefix }
    }

    fn get(&self, key: &str) -> Option<&'a str> {
        self.labels
            .get(&format!("{}.{}", self.prefix, key))
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    fn get_string(&self, key: &str) -> Option<String> {
        self.get(key).map(String::from)
    }

    fn get_bool(&self, key: &str) -> Result<Option<bool>, String> {
        match self.get(key) {
            None => Ok(None),
            Some("true") | Some("1") => Ok(Some(true)),
            Some("false") | Some("0") => Ok(Some(false)),
            Some(other) => Err(format!("invalid boolean {:?} for {:?}", other, key)),
        }
    }

    fn get_duration(&self, key: &str) -> Result<Option<Duration>, String> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => Duration::parse(raw)
                .map(Some)
                .map_err(|e| format!("{}: {}", key, e)),
        }
    }

    fn get_byte_size(&self, key: &str) -> Result<Option<ByteSize>, String> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => ByteSize::parse(raw)
                .map(Some)
                .map_err(|e| format!("{}: {}", key, e)),
        }
    }

    fn get_string_list(&self, key: &str) -> Option<Vec<String>> {
        self.get(key).map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
    }

    /// Collect `<prefix>.<key>.<HeaderName>=<value>` entries. Entries with
    /// invalid names or control characters in the value are dropped, never
    /// substituted.
    fn get_headers(&self, key: &str) -> BTreeMap<String, String> {
        let header_prefix = format!("{}.{}.", self.prefix, key);
        let mut headers = BTreeMap::new();
        for (label, value) in self.labels {
            let Some(name) = label.strip_prefix(&header_prefix) else {
                continue;
            };
            if !config::is_valid_header_name(name) || !config::is_valid_header_value(value) {
                warn!(header = %name, "dropping label-derived header with invalid name or value");
                continue;
            }
            headers.insert(name.to_string(), value.clone());
        }
        headers
    }
}

fn parse_global_labels(labels: &HashMap<String, String>, prefix: &str, cfg: &mut Config) {
    let parser = LabelParser::new(labels, prefix);

    let ts = &mut cfg.tailscale;
    ts.oauth_client_id = parser.get_string("tailscale.oauth_client_id");
    ts.oauth_client_id_env = parser.get_string("tailscale.oauth_client_id_env");
    ts.oauth_client_id_file = parser.get_string("tailscale.oauth_client_id_file");
    ts.oauth_client_secret = parser.get_string("tailscale.oauth_client_secret");
    ts.oauth_client_secret_env = parser.get_string("tailscale.oauth_client_secret_env");
    ts.oauth_client_secret_file = parser.get_string("tailscale.oauth_client_secret_file");
    ts.auth_key = parser.get_string("tailscale.auth_key");
    ts.auth_key_env = parser.get_string("tailscale.auth_key_env");
    ts.auth_key_file = parser.get_string("tailscale.auth_key_file");
    ts.state_dir = parser.get_string("tailscale.state_dir").map(PathBuf::from);
    ts.state_dir_env = parser.get_string("tailscale.state_dir_env");
    if let Some(tags) = parser.get_string_list("tailscale.default_tags") {
        ts.default_tags = tags;
    }
    ts.control_url = parser.get_string("tailscale.control_url");

    let g = &mut cfg.global;
    g.metrics_addr = parser.get_string("global.metrics_addr");
    if let Some(list) = parser.get_string_list("global.trusted_proxies") {
        g.trusted_proxies = list;
    }
    for (key, slot) in [
        ("global.read_header_timeout", &mut g.read_header_timeout),
        ("global.write_timeout", &mut g.write_timeout),
        ("global.idle_timeout", &mut g.idle_timeout),
        ("global.shutdown_timeout", &mut g.shutdown_timeout),
        (
            "global.response_header_timeout",
            &mut g.response_header_timeout,
        ),
        ("global.flush_interval", &mut g.flush_interval),
        ("global.dial_timeout", &mut g.dial_timeout),
        ("global.keep_alive_timeout", &mut g.keep_alive_timeout),
        ("global.idle_conn_timeout", &mut g.idle_conn_timeout),
        ("global.tls_handshake_timeout", &mut g.tls_handshake_timeout),
        (
            "global.expect_continue_timeout",
            &mut g.expect_continue_timeout,
        ),
        (
            "global.metrics_read_header_timeout",
            &mut g.metrics_read_header_timeout,
        ),
    ] {
        match parser.get_duration(key) {
            Ok(Some(d)) => *slot = Some(d),
            Ok(None) => {}
            Err(e) => warn!(label = key, error = %e, "ignoring invalid duration label"),
        }
    }
    match parser.get_bool("global.access_log") {
        Ok(Some(v)) => g.access_log = Some(v),
        Ok(None) => {}
        Err(e) => warn!(error = %e, "ignoring invalid access_log label"),
    }
    match parser.get_byte_size("global.max_request_body_size") {
        Ok(Some(v)) => g.max_request_body_size = Some(v),
        Ok(None) => {}
        Err(e) => warn!(error = %e, "ignoring invalid max_request_body_size label"),
    }
}

fn parse_service_config(container: &ContainerSummary, prefix: &str) -> Result<Service, String> {
    let empty = HashMap::new();
    let labels = container.labels.as_ref().unwrap_or(&empty);
    let parser = LabelParser::new(labels, prefix);
    let fallback_name = container_name(container);

    let name = parser
        .get_string("service.name")
        .unwrap_or_else(|| fallback_name.clone());

    let backend_addr = resolve_backend_addr(&parser, container, &fallback_name)?;
    config::validate_backend_address(&backend_addr)?;

    let tls_mode = match parser.get("service.tls_mode") {
        Some(raw) => Some(TlsMode::parse(raw)?),
        None => None,
    };

    let mut svc = Service {
        name,
        backend_addr,
        whois_enabled: parser.get_bool("service.whois_enabled")?,
        whois_timeout: parser.get_duration("service.whois_timeout")?,
        tls_mode,
        tags: parser.get_string_list("service.tags").unwrap_or_default(),
        read_header_timeout: parser.get_duration("service.read_header_timeout")?,
        write_timeout: parser.get_duration("service.write_timeout")?,
        idle_timeout: parser.get_duration("service.idle_timeout")?,
        response_header_timeout: parser.get_duration("service.response_header_timeout")?,
        access_log: parser.get_bool("service.access_log")?,
        max_request_body_size: parser.get_byte_size("service.max_request_body_size")?,
        funnel_enabled: parser.get_bool("service.funnel_enabled")?,
        ephemeral: parser.get_bool("service.ephemeral")?.unwrap_or(false),
        flush_interval: parser.get_duration("service.flush_interval")?,
        listen_addr: parser.get_string("service.listen_addr"),
        upstream_headers: parser.get_headers("service.upstream_headers"),
        downstream_headers: parser.get_headers("service.downstream_headers"),
        remove_upstream: parser
            .get_string_list("service.remove_upstream")
            .unwrap_or_default(),
        remove_downstream: parser
            .get_string_list("service.remove_downstream")
            .unwrap_or_default(),
    };

    if let Some(addr) = &svc.listen_addr {
        config::validate_listen_addr(addr).map_err(|e| format!("listen_addr: {}", e))?;
    }
    svc.tags.retain(|t| !t.is_empty());
    Ok(svc)
}

/// Backend resolution order: explicit `backend_addr` label, then the
/// container name with the `port` label, then the container name with its
/// first exposed port.
fn resolve_backend_addr(
    parser: &LabelParser<'_>,
    container: &ContainerSummary,
    container_name: &str,
) -> Result<String, String> {
    if let Some(explicit) = parser.get_string("service.backend_addr") {
        return Ok(explicit);
    }
    if let Some(port) = parser.get("service.port") {
        port.parse::<u16>()
            .map_err(|_| format!("invalid port label {:?}", port))?;
        return Ok(format!("{}:{}", container_name, port));
    }
    if let Some(port) = container
        .ports
        .as_ref()
        .and_then(|ports| ports.first())
        .map(|p| p.private_port)
    {
        return Ok(format!("{}:{}", container_name, port));
    }
    Err("no backend address: set backend_addr, port, or expose a port".to_string())
}
