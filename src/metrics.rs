//! Prometheus metrics collection and exposition for tsbridge
//!
//! The collector is an explicit dependency handed down by the supervisor;
//! nothing here is global. Exposition serves `GET /metrics` on the address
//! from `[global] metrics_addr`.

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use prometheus_client::encoding::{EncodeLabel, EncodeLabelSet, LabelSetEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::errors::{Error, ErrorKind};

const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Labels for request counters
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub service: String,
    pub status: String,
}

/// Labels for per-service histograms and gauges
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ServiceLabels {
    pub service: String,
}

/// Labels for OAuth refresh outcomes
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StatusLabels {
    pub status: String,
}

/// Labels for error counters. Encoded by hand so the label key can be the
/// reserved word `type`.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ErrorLabels {
    pub service: String,
    pub error_type: String,
}

impl EncodeLabelSet for ErrorLabels {
    fn encode(&self, mut encoder: LabelSetEncoder) -> Result<(), std::fmt::Error> {
        ("service", self.service.as_str()).encode(encoder.encode_label())?;
        ("type", self.error_type.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// All tsbridge metrics, registered against one registry
pub struct Collector {
    registry: Mutex<Registry>,
    requests_total: Family<RequestLabels, Counter>,
    errors_total: Family<ErrorLabels, Counter>,
    oauth_refresh_total: Family<StatusLabels, Counter>,
    request_duration_seconds: Family<ServiceLabels, Histogram>,
    whois_duration_seconds: Family<ServiceLabels, Histogram>,
    connections_active: Family<ServiceLabels, Gauge>,
    backend_health: Family<ServiceLabels, Gauge>,
    connection_pool_active: Family<ServiceLabels, Gauge>,
    connection_pool_idle: Family<ServiceLabels, Gauge>,
    connection_pool_wait: Family<ServiceLabels, Gauge>,
}

impl Collector {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "tsbridge_requests",
            "Total number of requests processed",
            requests_total.clone(),
        );

        let errors_total = Family::<ErrorLabels, Counter>::default();
        registry.register(
            "tsbridge_errors",
            "Total number of errors",
            errors_total.clone(),
        );

        let oauth_refresh_total = Family::<StatusLabels, Counter>::default();
        registry.register(
            "tsbridge_oauth_refresh",
            "Total number of OAuth token refreshes",
            oauth_refresh_total.clone(),
        );

        let request_duration_seconds = Family::<ServiceLabels, Histogram>::new_with_constructor(
            || Histogram::new(exponential_buckets(0.001, 2.0, 13)),
        );
        registry.register(
            "tsbridge_request_duration_seconds",
            "Request duration in seconds",
            request_duration_seconds.clone(),
        );

        let whois_duration_seconds = Family::<ServiceLabels, Histogram>::new_with_constructor(
            || Histogram::new(exponential_buckets(0.0001, 2.0, 13)),
        );
        registry.register(
            "tsbridge_whois_duration_seconds",
            "Identity lookup duration in seconds",
            whois_duration_seconds.clone(),
        );

        let connections_active = Family::<ServiceLabels, Gauge>::default();
        registry.register(
            "tsbridge_connections_active",
            "Number of active connections per service",
            connections_active.clone(),
        );

        let backend_health = Family::<ServiceLabels, Gauge>::default();
        registry.register(
            "tsbridge_backend_health",
            "Backend health status (1 = healthy, 0 = unhealthy)",
            backend_health.clone(),
        );

        let connection_pool_active = Family::<ServiceLabels, Gauge>::default();
        registry.register(
            "tsbridge_connection_pool_active",
            "Number of active connections in the pool",
            connection_pool_active.clone(),
        );

        let connection_pool_idle = Family::<ServiceLabels, Gauge>::default();
        registry.register(
            "tsbridge_connection_pool_idle",
            "Number of idle connections in the pool",
            connection_pool_idle.clone(),
        );

        let connection_pool_wait = Family::<ServiceLabels, Gauge>::default();
        registry.register(
            "tsbridge_connection_pool_wait",
            "Number of requests waiting for a pooled connection",
            connection_pool_wait.clone(),
        );

        Self {
            registry: Mutex::new(registry),
            requests_total,
            errors_total,
            oauth_refresh_total,
            request_duration_seconds,
            whois_duration_seconds,
            connections_active,
            backend_health,
            connection_pool_active,
            connection_pool_idle,
            connection_pool_wait,
        }
    }

    pub fn record_request(&self, service: &str, status: u16, duration: Duration) {
        self.requests_total
            .get_or_create(&RequestLabels {
                service: service.to_string(),
                status: status.to_string(),
            })
            .inc();
        self.request_duration_seconds
            .get_or_create(&ServiceLabels {
                service: service.to_string(),
            })
            .observe(duration.as_secs_f64());
    }

    pub fn record_error(&self, service: &str, error_type: &str) {
        self.errors_total
            .get_or_create(&ErrorLabels {
                service: service.to_string(),
                error_type: error_type.to_string(),
            })
            .inc();
    }

    pub fn record_oauth_refresh(&self, status: &str) {
        self.oauth_refresh_total
            .get_or_create(&StatusLabels {
                status: status.to_string(),
            })
            .inc();
    }

    pub fn record_whois_duration(&self, service: &str, duration: Duration) {
        self.whois_duration_seconds
            .get_or_create(&ServiceLabels {
                service: service.to_string(),
            })
            .observe(duration.as_secs_f64());
    }

    pub fn inc_connections(&self, service: &str) {
        self.connections_active
            .get_or_create(&ServiceLabels {
                service: service.to_string(),
            })
            .inc();
    }

    pub fn dec_connections(&self, service: &str) {
        self.connections_active
            .get_or_create(&ServiceLabels {
                service: service.to_string(),
            })
            .dec();
    }

    pub fn set_backend_health(&self, service: &str, healthy: bool) {
        self.backend_health
            .get_or_create(&ServiceLabels {
                service: service.to_string(),
            })
            .set(if healthy { 1 } else { 0 });
    }

    pub fn update_connection_pool(&self, service: &str, active: i64, idle: i64, wait: i64) {
        let labels = ServiceLabels {
            service: service.to_string(),
        };
        self.connection_pool_active.get_or_create(&labels).set(active);
        self.connection_pool_idle.get_or_create(&labels).set(idle);
        self.connection_pool_wait.get_or_create(&labels).set(wait);
    }

    /// Encode all metrics in the Prometheus text format
    pub fn encode(&self) -> Result<String, Error> {
        let registry = self
            .registry
            .lock()
            .map_err(|_| Error::internal("metrics registry mutex poisoned"))?;
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &registry)
            .map_err(|e| Error::wrap(ErrorKind::Internal, "encoding metrics", e))?;
        Ok(buffer)
    }
}

impl Default for Collector {
    fn default() -> Self {
        Self::new()
    }
}

/// Plain HTTP server exposing `GET /metrics`
pub struct MetricsServer {
    addr: String,
    collector: Arc<Collector>,
    read_header_timeout: Duration,
    local_addr: Option<SocketAddr>,
    shutdown_tx: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<()>>,
}

impl MetricsServer {
    pub fn new(addr: impl Into<String>, collector: Arc<Collector>, read_header_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            collector,
            read_header_timeout,
            local_addr: None,
            shutdown_tx: None,
            handle: None,
        }
    }

    /// Bind and start serving in the background
    pub async fn start(&mut self) -> Result<(), Error> {
        let bind_addr = if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
        };
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            Error::wrap(
                ErrorKind::Resource,
                format!("binding metrics listener on {}", bind_addr),
                e,
            )
        })?;
        self.local_addr = listener.local_addr().ok();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx);

        let collector = Arc::clone(&self.collector);
        let read_header_timeout = self.read_header_timeout;
        let mut shutdown = shutdown_rx;
        self.handle = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, _addr)) => {
                                let collector = Arc::clone(&collector);
                                tokio::spawn(async move {
                                    let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                                        let collector = Arc::clone(&collector);
                                        async move { serve_metrics(req, &collector) }
                                    });
                                    let conn = hyper::server::conn::http1::Builder::new()
                                        .timer(TokioTimer::new())
                                        .header_read_timeout(read_header_timeout)
                                        .serve_connection(TokioIo::new(stream), service);
                                    if let Err(e) = conn.await {
                                        debug!(error = %e, "metrics connection error");
                                    }
                                });
                            }
                            Err(e) => {
                                error!(error = %e, "metrics server accept failed");
                            }
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            debug!("metrics server shutting down");
                            break;
                        }
                    }
                }
            }
        }));

        Ok(())
    }

    /// The bound address once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Stop accepting and wait for the serve loop within the deadline
    pub async fn shutdown(&mut self, deadline: Duration) -> Result<(), Error> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.handle.take() {
            if tokio::time::timeout(deadline, handle).await.is_err() {
                return Err(Error::internal("metrics server did not stop in time"));
            }
        }
        Ok(())
    }
}

fn serve_metrics(
    req: Request<hyper::body::Incoming>,
    collector: &Collector,
) -> Result<Response<Full<Bytes>>, hyper::http::Error> {
    if req.uri().path() != "/metrics" {
        return Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from_static(b"not found\n")));
    }
    match collector.encode() {
        Ok(body) => Response::builder()
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, OPENMETRICS_CONTENT_TYPE)
            .body(Full::new(Bytes::from(body))),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Full::new(Bytes::from_static(b"encoding error\n")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_record_request_and_encode() {
        let collector = Collector::new();
        collector.record_request("api", 200, Duration::from_millis(5));
        collector.record_request("api", 502, Duration::from_millis(40));

        let encoded = collector.encode().unwrap();
        assert!(encoded.contains("tsbridge_requests_total"));
        assert!(encoded.contains("service=\"api\""));
        assert!(encoded.contains("status=\"502\""));
        assert!(encoded.contains("tsbridge_request_duration_seconds"));
    }

    #[test]
    fn test_error_labels_use_type_key() {
        let collector = Collector::new();
        collector.record_error("api", "panic");

        let encoded = collector.encode().unwrap();
        assert!(encoded.contains("tsbridge_errors_total"));
        assert!(encoded.contains("type=\"panic\""));
    }

    #[test]
    fn test_whois_duration_histogram() {
        let collector = Collector::new();
        collector.record_whois_duration("api", Duration::from_millis(2));

        let encoded = collector.encode().unwrap();
        assert!(encoded.contains("tsbridge_whois_duration_seconds"));
    }

    #[test]
    fn test_gauges() {
        let collector = Collector::new();
        collector.inc_connections("api");
        collector.inc_connections("api");
        collector.dec_connections("api");
        collector.set_backend_health("api", true);
        collector.update_connection_pool("api", 3, 2, 1);

        let encoded = collector.encode().unwrap();
        assert!(encoded.contains("tsbridge_connections_active"));
        assert!(encoded.contains("tsbridge_backend_health"));
        assert!(encoded.contains("tsbridge_connection_pool_active"));
    }

    #[test]
    fn test_oauth_refresh_counter() {
        let collector = Collector::new();
        collector.record_oauth_refresh("success");

        let encoded = collector.encode().unwrap();
        assert!(encoded.contains("tsbridge_oauth_refresh_total"));
        assert!(encoded.contains("status=\"success\""));
    }

    #[tokio::test]
    async fn test_metrics_server_serves_text_format() {
        let collector = Arc::new(Collector::new());
        collector.record_request("api", 200, Duration::from_millis(1));

        let mut server =
            MetricsServer::new("127.0.0.1:0", Arc::clone(&collector), Duration::from_secs(5));
        server.start().await.unwrap();
        let addr = server.local_addr().unwrap();

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: metrics\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("tsbridge_requests_total"));

        server.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_metrics_server_unknown_path() {
        let collector = Arc::new(Collector::new());
        let mut server =
            MetricsServer::new("127.0.0.1:0", collector, Duration::from_secs(5));
        server.start().await.unwrap();
        let addr = server.local_addr().unwrap();

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /other HTTP/1.1\r\nHost: metrics\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 404"));

        server.shutdown(Duration::from_secs(1)).await.unwrap();
    }
}
