//! Mesh node lifecycle management
//!
//! One mesh node per service: the manager configures the node's hostname and
//! state directory, attaches an auth key only when the node has no persisted
//! identity, selects a listener by TLS mode and funnel setting, and launches
//! the certificate warm-up for auto-TLS listeners. Nodes are owned here;
//! request handlers borrow them through [`WhoisClient`] for identity lookups.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::SignatureScheme;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::config::{Service, Tailscale, TlsMode, ENV_STATE_DIR, ENV_STATE_DIRECTORY};
use crate::errors::{Error, ErrorKind};
use crate::metrics::Collector;
use crate::tsnet::{MeshListener, MeshServer, MeshServerFactory, WhoisIdentity};

/// Upper bound for the background certificate warm-up
pub const CERT_WARMUP_TIMEOUT: StdDuration = StdDuration::from_secs(60);
/// Grace period for the node to finish registering before warm-up probes it
const CERT_WARMUP_INITIAL_DELAY: StdDuration = StdDuration::from_secs(2);

/// Owns every running mesh node, keyed by service name
pub struct MeshManager {
    config: Tailscale,
    factory: MeshServerFactory,
    collector: Option<Arc<Collector>>,
    nodes: Mutex<HashMap<String, Arc<dyn MeshServer>>>,
}

impl MeshManager {
    /// Build a manager; the config must already have its secrets resolved
    pub fn new(config: Tailscale, factory: MeshServerFactory) -> Result<Self, Error> {
        let has_auth_key = config.auth_key.as_deref().is_some_and(|k| !k.is_empty());
        let has_oauth = config.oauth_client_id.as_deref().is_some_and(|v| !v.is_empty())
            && config
                .oauth_client_secret
                .as_deref()
                .is_some_and(|v| !v.is_empty());
        if !has_auth_key && !has_oauth {
            return Err(Error::config(
                "either auth key or OAuth credentials (client ID and secret) must be provided",
            ));
        }
        Ok(Self {
            config,
            factory,
            collector: None,
            nodes: Mutex::new(HashMap::new()),
        })
    }

    pub fn set_collector(&mut self, collector: Arc<Collector>) {
        self.collector = Some(collector);
    }

    /// State root resolution: explicit config, then the systemd-style
    /// `STATE_DIRECTORY`, then `TSBRIDGE_STATE_DIR`, then the platform data
    /// home.
    pub fn state_root(&self) -> PathBuf {
        if let Some(dir) = &self.config.state_dir {
            return dir.clone();
        }
        if let Ok(v) = std::env::var(ENV_STATE_DIRECTORY) {
            // systemd may pass several colon-separated directories
            let first = v.split(':').next().unwrap_or("");
            if !first.is_empty() {
                return PathBuf::from(first);
            }
        }
        if let Ok(v) = std::env::var(ENV_STATE_DIR) {
            if !v.is_empty() {
                return PathBuf::from(v);
            }
        }
        default_state_dir()
    }

    /// Start a node for the service and hand back its listener
    pub async fn listen(&self, svc: &Service) -> Result<Box<dyn MeshListener>, Error> {
        {
            let nodes = self.nodes.lock().await;
            if nodes.contains_key(&svc.name) {
                return Err(Error::internal(format!(
                    "node for service {:?} is already running",
                    svc.name
                )));
            }
        }

        let mut node = (self.factory)();
        node.set_hostname(&svc.name);
        node.set_ephemeral(svc.ephemeral);
        node.set_logger(Box::new(crate::tsnet::backend_log_adapter(&svc.name)));
        if let Some(url) = &self.config.control_url {
            node.set_control_url(url);
        }

        let state_dir = self.state_root().join(&svc.name);
        node.set_state_dir(&state_dir);

        // A node with persisted state re-uses its stored identity; attaching
        // a key would force re-enrollment.
        if !has_existing_state(&state_dir) {
            let key = self.resolve_auth_key(node.as_ref(), svc).await?;
            node.set_auth_key(&key);
        }

        node.start().await.map_err(|e| {
            Error::wrap(
                ErrorKind::Resource,
                format!("starting mesh node for service {:?}", svc.name),
                e,
            )
        })?;
        let node: Arc<dyn MeshServer> = Arc::from(node);

        let listener = if svc.funnel_enabled() {
            // Funnel terminates TLS inside the mesh library; no warm-up.
            let addr = svc.listen_addr.as_deref().unwrap_or(":443");
            node.listen_funnel(addr).await
        } else {
            match svc.tls_mode() {
                TlsMode::Auto => {
                    let addr = svc.listen_addr.as_deref().unwrap_or(":443");
                    let listener = node.listen_tls(addr).await;
                    if listener.is_ok() {
                        self.spawn_cert_warmup(Arc::clone(&node), svc.name.clone());
                    }
                    listener
                }
                TlsMode::Off => {
                    let addr = svc.listen_addr.as_deref().unwrap_or(":80");
                    node.listen(addr).await
                }
            }
        };

        let listener = match listener {
            Ok(l) => l,
            Err(e) => {
                let _ = node.close().await;
                return Err(Error::wrap(
                    ErrorKind::Resource,
                    format!("creating listener for service {:?}", svc.name),
                    e,
                ));
            }
        };

        self.nodes
            .lock()
            .await
            .insert(svc.name.clone(), Arc::clone(&node));
        debug!(service = %svc.name, state_dir = %state_dir.display(), "mesh node running");
        Ok(listener)
    }

    /// Fresh auth material for a node with an empty state directory
    async fn resolve_auth_key(&self, node: &dyn MeshServer, svc: &Service) -> Result<String, Error> {
        if let Some(key) = self.config.auth_key.as_deref() {
            if !key.is_empty() {
                return Ok(key.to_string());
            }
        }

        if svc.tags.is_empty() {
            return Err(Error::config(format!(
                "service {:?} needs at least one tag to mint an OAuth key",
                svc.name
            )));
        }
        match node.mint_service_key(&svc.tags, svc.ephemeral).await {
            Ok(key) => {
                if let Some(c) = &self.collector {
                    c.record_oauth_refresh("success");
                }
                info!(service = %svc.name, tags = ?svc.tags, "minted service auth key");
                Ok(key)
            }
            Err(e) => {
                if let Some(c) = &self.collector {
                    c.record_oauth_refresh("failure");
                }
                Err(Error::wrap(
                    ErrorKind::Config,
                    format!("resolving auth key for service {:?}", svc.name),
                    e,
                ))
            }
        }
    }

    /// Borrow a running node for identity queries
    pub async fn get_node(&self, name: &str) -> Option<Arc<dyn MeshServer>> {
        self.nodes.lock().await.get(name).cloned()
    }

    /// Close and forget the node for one service
    pub async fn close_node(&self, name: &str) -> Result<(), Error> {
        let node = self.nodes.lock().await.remove(name);
        match node {
            Some(node) => node.close().await.map_err(|e| {
                Error::wrap(
                    ErrorKind::Resource,
                    format!("closing mesh node for service {:?}", name),
                    e,
                )
            }),
            None => Ok(()),
        }
    }

    /// Close every node, joining errors
    pub async fn close(&self) -> Result<(), Error> {
        let nodes: Vec<(String, Arc<dyn MeshServer>)> =
            self.nodes.lock().await.drain().collect();

        let mut failures = Vec::new();
        for (name, node) in nodes {
            if let Err(e) = node.close().await {
                failures.push(format!("{}: {}", name, e));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::resource(format!(
                "closing mesh nodes: {}",
                failures.join("; ")
            )))
        }
    }

    fn spawn_cert_warmup(&self, node: Arc<dyn MeshServer>, service: String) {
        tokio::spawn(async move {
            let start = Instant::now();
            match tokio::time::timeout(CERT_WARMUP_TIMEOUT, prime_certificate(node, &service)).await
            {
                Ok(Ok(())) => {
                    debug!(service = %service, elapsed = ?start.elapsed(), "certificate warm-up complete")
                }
                Ok(Err(e)) => {
                    warn!(service = %service, error = %e, elapsed = ?start.elapsed(), "certificate warm-up failed")
                }
                Err(_) => {
                    warn!(service = %service, timeout = ?CERT_WARMUP_TIMEOUT, "certificate warm-up timed out")
                }
            }
        });
    }
}

/// Lookup handle capturing the service name plus the owning manager. The
/// manager retains ownership of the node and outlives every handler by
/// shutdown order.
#[derive(Clone)]
pub struct WhoisClient {
    manager: Arc<MeshManager>,
    service: String,
}

impl WhoisClient {
    pub fn new(manager: Arc<MeshManager>, service: impl Into<String>) -> Self {
        Self {
            manager,
            service: service.into(),
        }
    }

    pub async fn whois(&self, remote: SocketAddr) -> Result<Option<WhoisIdentity>, Error> {
        let node = self
            .manager
            .get_node(&self.service)
            .await
            .ok_or_else(|| Error::internal(format!("node {:?} is not running", self.service)))?;
        node.whois(remote).await
    }
}

fn default_state_dir() -> PathBuf {
    let data_home = std::env::var("XDG_DATA_HOME")
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".local/share")
        });
    data_home.join("tsbridge")
}

fn has_existing_state(dir: &std::path::Path) -> bool {
    match std::fs::read_dir(dir) {
        Ok(mut entries) => entries.next().is_some(),
        Err(_) => false,
    }
}

/// One HTTPS request to the node's own mesh IP with SNI set to its FQDN,
/// forcing the mesh library to provision the serving certificate before the
/// first real request pays that latency.
async fn prime_certificate(node: Arc<dyn MeshServer>, service: &str) -> Result<(), Error> {
    tokio::time::sleep(CERT_WARMUP_INITIAL_DELAY).await;

    let status = node.status().await?;
    let fqdn = status.fqdn.trim_end_matches('.').to_string();
    if fqdn.is_empty() {
        return Err(Error::internal("node has no DNS name"));
    }
    let ip = *status
        .mesh_ips
        .first()
        .ok_or_else(|| Error::internal("node has no mesh address"))?;

    info!(service = %service, ip = %ip, sni = %fqdn, "priming TLS certificate");

    let stream = TcpStream::connect((ip, 443))
        .await
        .map_err(|e| Error::wrap(ErrorKind::Network, "connecting for certificate warm-up", e))?;

    let tls_config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new()))
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(tls_config));
    let server_name = ServerName::try_from(fqdn.clone())
        .map_err(|e| Error::wrap(ErrorKind::Internal, "invalid SNI name", e))?;
    let mut tls = connector
        .connect(server_name, stream)
        .await
        .map_err(|e| Error::wrap(ErrorKind::Network, "TLS handshake for certificate warm-up", e))?;

    // The response content is irrelevant; the handshake already provisioned
    // the certificate.
    let request = format!(
        "GET / HTTP/1.1\r\nHost: {}\r\nUser-Agent: tsbridge-warmup\r\nConnection: close\r\n\r\n",
        fqdn
    );
    tls.write_all(request.as_bytes())
        .await
        .map_err(|e| Error::wrap(ErrorKind::Network, "writing warm-up request", e))?;
    let mut buf = [0u8; 512];
    let _ = tls.read(&mut buf).await;
    Ok(())
}

/// Certificate verifier for the warm-up client. The request targets our own
/// node over its mesh IP, so the chain cannot be validated against a public
/// root and is not worth validating.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl AcceptAnyServerCert {
    fn new() -> Self {
        Self {
            provider: Arc::new(rustls::crypto::aws_lc_rs::default_provider()),
        }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
