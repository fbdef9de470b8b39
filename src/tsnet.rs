//! Boundary to the mesh VPN library
//!
//! tsbridge drives mesh nodes through the [`MeshServer`] trait so the whole
//! lifecycle engine is independent of any particular control-plane binding.
//! Production deployments inject a factory for the real library; the bundled
//! [`LoopbackMesh`] backend binds on the loopback interface with
//! self-provisioned certificates, which keeps the binary usable standalone
//! and gives tests a fast in-process node.

use async_trait::async_trait;
use rcgen::{generate_simple_self_signed, CertifiedKey};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::errors::{Error, ErrorKind};

/// Identity of a mesh caller as resolved by the control plane
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WhoisIdentity {
    pub login_name: Option<String>,
    pub display_name: Option<String>,
    pub profile_pic_url: Option<String>,
    pub addresses: Vec<IpAddr>,
}

/// A node's registration status
#[derive(Debug, Clone)]
pub struct NodeStatus {
    /// Fully-qualified mesh DNS name, no trailing dot
    pub fqdn: String,
    /// Addresses assigned to the node on the mesh
    pub mesh_ips: Vec<IpAddr>,
}

/// Byte stream accepted from a mesh listener
pub trait MeshStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> MeshStream for T {}

pub type MeshConn = Box<dyn MeshStream>;

/// A listener handed out by a mesh node
#[async_trait]
pub trait MeshListener: Send + Sync {
    async fn accept(&self) -> std::io::Result<(MeshConn, SocketAddr)>;
    fn local_addr(&self) -> std::io::Result<SocketAddr>;
}

impl std::fmt::Debug for dyn MeshListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshListener").finish()
    }
}

/// Sink for the mesh library's printf-style log lines
pub type MeshLogger = Box<dyn Fn(&str) + Send + Sync>;

/// One in-process mesh node with its own identity and state directory
#[async_trait]
pub trait MeshServer: Send + Sync {
    fn set_hostname(&mut self, hostname: &str);
    fn set_ephemeral(&mut self, ephemeral: bool);
    fn set_state_dir(&mut self, dir: &Path);
    fn set_auth_key(&mut self, key: &str);
    fn set_control_url(&mut self, url: &str);
    fn set_logger(&mut self, logger: MeshLogger);

    /// Start the node; may block on first registration
    async fn start(&mut self) -> Result<(), Error>;

    /// Plain listener; transport security comes from the mesh overlay
    async fn listen(&self, addr: &str) -> Result<Box<dyn MeshListener>, Error>;

    /// Listener with certificates provisioned and renewed by the mesh
    async fn listen_tls(&self, addr: &str) -> Result<Box<dyn MeshListener>, Error>;

    /// Listener exposed to the public internet through the mesh tunnel
    async fn listen_funnel(&self, addr: &str) -> Result<Box<dyn MeshListener>, Error>;

    async fn status(&self) -> Result<NodeStatus, Error>;

    /// Resolve the caller behind a mesh socket address; `None` when the
    /// control plane has no identity for it
    async fn whois(&self, remote: SocketAddr) -> Result<Option<WhoisIdentity>, Error>;

    /// Mint a single-use, service-scoped auth key carrying the given tags.
    /// Only meaningful when the node's control-plane client is configured
    /// with an OAuth client pair.
    async fn mint_service_key(&self, tags: &[String], ephemeral: bool) -> Result<String, Error>;

    async fn close(&self) -> Result<(), Error>;
}

/// Creates fresh mesh nodes; one per service
pub type MeshServerFactory = Arc<dyn Fn() -> Box<dyn MeshServer> + Send + Sync>;

/// Factory for the bundled loopback backend
pub fn loopback_factory() -> MeshServerFactory {
    Arc::new(|| Box::new(LoopbackMesh::new()))
}

/// Mesh node backend bound to the loopback interface. Certificates are
/// self-provisioned with rcgen, whois has no identity data, and the funnel
/// mode degrades to a TLS listener.
pub struct LoopbackMesh {
    hostname: String,
    ephemeral: bool,
    state_dir: Option<PathBuf>,
    auth_key: Option<String>,
    control_url: Option<String>,
    logger: Option<MeshLogger>,
    started: std::sync::atomic::AtomicBool,
}

impl LoopbackMesh {
    pub fn new() -> Self {
        Self {
            hostname: String::new(),
            ephemeral: false,
            state_dir: None,
            auth_key: None,
            control_url: None,
            logger: None,
            started: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn log(&self, line: &str) {
        if let Some(logger) = &self.logger {
            logger(line);
        }
    }

    fn tls_acceptor(&self) -> Result<TlsAcceptor, Error> {
        let mut names = vec!["localhost".to_string(), "127.0.0.1".to_string()];
        if !self.hostname.is_empty() {
            names.push(self.hostname.clone());
            names.push(format!("{}.local", self.hostname));
        }
        let CertifiedKey { cert, key_pair } = generate_simple_self_signed(names)
            .map_err(|e| Error::wrap(ErrorKind::Resource, "generating node certificate", e))?;
        let cert_der = CertificateDer::from(cert.der().to_vec());
        let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
            .map_err(|e| Error::resource(format!("serializing node key: {}", e)))?;
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)
            .map_err(|e| Error::wrap(ErrorKind::Resource, "building TLS config", e))?;
        Ok(TlsAcceptor::from(Arc::new(config)))
    }

    async fn bind(&self, addr: &str) -> Result<TcpListener, Error> {
        let port = addr.rsplit(':').next().and_then(|p| p.parse::<u16>().ok());
        let requested = SocketAddr::from(([127, 0, 0, 1], port.unwrap_or(0)));
        match TcpListener::bind(requested).await {
            Ok(l) => Ok(l),
            Err(e) if port.is_some() => {
                // Privileged or occupied ports fall back to an ephemeral one
                // so unprivileged local runs still come up.
                debug!(hostname = %self.hostname, requested = %requested, error = %e,
                    "falling back to ephemeral port");
                TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
                    .await
                    .map_err(|e| Error::wrap(ErrorKind::Resource, "binding loopback listener", e))
            }
            Err(e) => Err(Error::wrap(
                ErrorKind::Resource,
                "binding loopback listener",
                e,
            )),
        }
    }
}

impl Default for LoopbackMesh {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MeshServer for LoopbackMesh {
    fn set_hostname(&mut self, hostname: &str) {
        self.hostname = hostname.to_string();
    }

    fn set_ephemeral(&mut self, ephemeral: bool) {
        self.ephemeral = ephemeral;
    }

    fn set_state_dir(&mut self, dir: &Path) {
        self.state_dir = Some(dir.to_path_buf());
    }

    fn set_auth_key(&mut self, key: &str) {
        self.auth_key = Some(key.to_string());
    }

    fn set_control_url(&mut self, url: &str) {
        self.control_url = Some(url.to_string());
    }

    fn set_logger(&mut self, logger: MeshLogger) {
        self.logger = Some(logger);
    }

    async fn start(&mut self) -> Result<(), Error> {
        if self.hostname.is_empty() {
            return Err(Error::config("node hostname is not set"));
        }
        self.log("starting loopback node");
        if let Some(dir) = &self.state_dir {
            std::fs::create_dir_all(dir)
                .map_err(|e| Error::wrap(ErrorKind::Resource, "creating state directory", e))?;
            let marker = dir.join("node.state");
            if !marker.exists() {
                std::fs::write(&marker, format!("hostname={}\n", self.hostname))
                    .map_err(|e| Error::wrap(ErrorKind::Resource, "writing node state", e))?;
            }
        }
        self.started
            .store(true, std::sync::atomic::Ordering::SeqCst);
        debug!(
            hostname = %self.hostname,
            ephemeral = self.ephemeral,
            authenticated = self.auth_key.is_some(),
            control_url = ?self.control_url,
            "loopback node started"
        );
        Ok(())
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn MeshListener>, Error> {
        let listener = self.bind(addr).await?;
        Ok(Box::new(PlainListener { inner: listener }))
    }

    async fn listen_tls(&self, addr: &str) -> Result<Box<dyn MeshListener>, Error> {
        let listener = self.bind(addr).await?;
        let acceptor = self.tls_acceptor()?;
        Ok(Box::new(TlsListener {
            inner: listener,
            acceptor,
        }))
    }

    async fn listen_funnel(&self, addr: &str) -> Result<Box<dyn MeshListener>, Error> {
        info!(hostname = %self.hostname, "loopback backend has no public tunnel; serving TLS locally");
        self.listen_tls(addr).await
    }

    async fn status(&self) -> Result<NodeStatus, Error> {
        if !self.started.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(Error::internal("node is not started"));
        }
        Ok(NodeStatus {
            fqdn: format!("{}.local", self.hostname),
            mesh_ips: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
        })
    }

    async fn whois(&self, _remote: SocketAddr) -> Result<Option<WhoisIdentity>, Error> {
        // No control plane, no identities.
        Ok(None)
    }

    async fn mint_service_key(&self, tags: &[String], ephemeral: bool) -> Result<String, Error> {
        debug!(hostname = %self.hostname, ?tags, ephemeral, "minting local auth key");
        Ok(format!("tskey-local-{}", uuid::Uuid::new_v4()))
    }

    async fn close(&self) -> Result<(), Error> {
        self.started
            .store(false, std::sync::atomic::Ordering::SeqCst);
        self.log("loopback node closed");
        debug!(hostname = %self.hostname, "loopback node closed");
        Ok(())
    }
}

struct PlainListener {
    inner: TcpListener,
}

#[async_trait]
impl MeshListener for PlainListener {
    async fn accept(&self) -> std::io::Result<(MeshConn, SocketAddr)> {
        let (stream, addr) = self.inner.accept().await?;
        Ok((Box::new(stream), addr))
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

struct TlsListener {
    inner: TcpListener,
    acceptor: TlsAcceptor,
}

#[async_trait]
impl MeshListener for TlsListener {
    async fn accept(&self) -> std::io::Result<(MeshConn, SocketAddr)> {
        let (stream, addr) = self.inner.accept().await?;
        let tls = self.acceptor.accept(stream).await?;
        Ok((Box::new(tls), addr))
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

/// Log level inferred from the content of a mesh-library log line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferredLevel {
    Debug,
    Warn,
    Error,
}

pub(crate) fn infer_level(line: &str) -> InferredLevel {
    let lowered = line.to_ascii_lowercase();
    if lowered.contains("error") || lowered.contains("fatal") || lowered.contains("panic") {
        InferredLevel::Error
    } else if lowered.contains("warn") {
        InferredLevel::Warn
    } else {
        InferredLevel::Debug
    }
}

/// Adapter for the mesh library's printf-style backend logs. Lines are
/// emitted as structured records tagged with the service and component;
/// level is inferred from the content.
pub fn backend_log_adapter(service: &str) -> impl Fn(&str) + Send + Sync + 'static {
    let service = service.to_string();
    move |line: &str| {
        let line = line.trim_end();
        if line.is_empty() {
            return;
        }
        match infer_level(line) {
            InferredLevel::Error => {
                error!(target: "tsnet", service = %service, component = "tsnet", "{}", line)
            }
            InferredLevel::Warn => {
                warn!(target: "tsnet", service = %service, component = "tsnet", "{}", line)
            }
            InferredLevel::Debug => {
                debug!(target: "tsnet", service = %service, component = "tsnet", "{}", line)
            }
        }
    }
}

/// Adapter for user-facing mesh-library lines (auth URLs and the like);
/// always emitted at info.
pub fn user_log_adapter(service: &str) -> impl Fn(&str) + Send + Sync + 'static {
    let service = service.to_string();
    move |line: &str| {
        let line = line.trim_end();
        if line.is_empty() {
            return;
        }
        info!(target: "tsnet", service = %service, component = "tsnet-user", "{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_loopback_start_creates_state_dir() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("api");

        let mut node = LoopbackMesh::new();
        node.set_hostname("api");
        node.set_state_dir(&state);
        node.start().await.unwrap();

        assert!(state.join("node.state").exists());
        node.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_loopback_start_requires_hostname() {
        let mut node = LoopbackMesh::new();
        assert!(node.start().await.is_err());
    }

    #[tokio::test]
    async fn test_loopback_plain_listener_round_trip() {
        let mut node = LoopbackMesh::new();
        node.set_hostname("echo");
        node.start().await.unwrap();

        let listener = node.listen(":0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"ping").await.unwrap();
            stream.shutdown().await.unwrap();
        });

        let (mut conn, peer) = listener.accept().await.unwrap();
        assert!(peer.ip().is_loopback());
        let mut buf = Vec::new();
        conn.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"ping");
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_loopback_status_reports_fqdn_and_ip() {
        let mut node = LoopbackMesh::new();
        node.set_hostname("api");
        node.start().await.unwrap();

        let status = node.status().await.unwrap();
        assert_eq!(status.fqdn, "api.local");
        assert_eq!(status.mesh_ips, vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]);
    }

    #[tokio::test]
    async fn test_loopback_status_requires_start() {
        let node = LoopbackMesh::new();
        assert!(node.status().await.is_err());
    }

    #[tokio::test]
    async fn test_loopback_whois_has_no_identity() {
        let mut node = LoopbackMesh::new();
        node.set_hostname("api");
        node.start().await.unwrap();
        let identity = node
            .whois("127.0.0.1:54321".parse().unwrap())
            .await
            .unwrap();
        assert!(identity.is_none());
    }

    #[tokio::test]
    async fn test_minted_keys_are_unique() {
        let node = LoopbackMesh::new();
        let a = node.mint_service_key(&[], false).await.unwrap();
        let b = node.mint_service_key(&[], false).await.unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with("tskey-local-"));
    }

    #[test]
    fn test_level_inference() {
        assert_eq!(infer_level("dialing derp region"), InferredLevel::Debug);
        assert_eq!(
            infer_level("control: connection failed with error"),
            InferredLevel::Error
        );
        assert_eq!(infer_level("WARN: clock skew detected"), InferredLevel::Warn);
        assert_eq!(infer_level("fatal: no route"), InferredLevel::Error);
    }
}
