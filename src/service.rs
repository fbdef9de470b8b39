//! Service registry
//!
//! Owns every running service: its spec, mesh listener serve loop and
//! lifecycle state. The registry is never on the request path, so one async
//! mutex over the map is enough. Updates are remove-then-add: nearly every
//! field change invalidates the listener or transport, and the state
//! directory is keyed by name, so mesh identity survives the pair.

use futures::FutureExt;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::server::graceful::GracefulShutdown;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration as StdDuration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{Global, Service};
use crate::errors::{Error, StartupAggregate};
use crate::mesh::MeshManager;
use crate::metrics::Collector;
use crate::proxy::{HandlerOptions, ServiceHandler, WhoisLookup};
use crate::tsnet::MeshListener;

/// Lifecycle of one running service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    New,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

/// Owning handle for one started service
pub struct RunningService {
    spec: Service,
    local_addr: Option<SocketAddr>,
    state: Arc<StdMutex<ServiceState>>,
    shutdown_tx: watch::Sender<bool>,
    serve_handle: JoinHandle<()>,
}

impl RunningService {
    pub fn spec(&self) -> &Service {
        &self.spec
    }

    pub fn state(&self) -> ServiceState {
        *self.state.lock().expect("state mutex poisoned")
    }
}

/// The set of currently-running services
pub struct Registry {
    mesh: Arc<MeshManager>,
    global: Global,
    metrics: Option<Arc<Collector>>,
    services: Mutex<HashMap<String, RunningService>>,
}

impl Registry {
    pub fn new(mesh: Arc<MeshManager>, global: Global) -> Self {
        Self {
            mesh,
            global,
            metrics: None,
            services: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_metrics(&mut self, collector: Arc<Collector>) {
        self.metrics = Some(collector);
    }

    /// Start one service: mesh listener, handler chain, serve loop. Any
    /// construction failure tears the node for this name back down.
    pub async fn add_service(&self, spec: Service) -> Result<(), Error> {
        {
            let services = self.services.lock().await;
            if services.contains_key(&spec.name) {
                return Err(Error::internal(format!(
                    "service {:?} is already running",
                    spec.name
                )));
            }
        }

        let state = Arc::new(StdMutex::new(ServiceState::Starting));

        let listener = self.mesh.listen(&spec).await?;
        let local_addr = listener.local_addr().ok();

        let whois = if spec.whois_enabled() {
            let client = crate::mesh::WhoisClient::new(Arc::clone(&self.mesh), &spec.name);
            let lookup: WhoisLookup = Arc::new(move |remote| {
                let client = client.clone();
                async move { client.whois(remote).await }.boxed()
            });
            Some(lookup)
        } else {
            None
        };

        let handler = match ServiceHandler::new(
            &spec,
            &self.global,
            HandlerOptions {
                whois,
                metrics: self.metrics.clone(),
            },
        ) {
            Ok(handler) => Arc::new(handler),
            Err(e) => {
                // The listener belongs to the node, so closing the node
                // releases both.
                drop(listener);
                let _ = self.mesh.close_node(&spec.name).await;
                return Err(e);
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let read_header_timeout = spec
            .read_header_timeout
            .and_then(|d| d.to_std())
            .filter(|d| !d.is_zero());

        let serve_handle = tokio::spawn(serve_loop(
            spec.name.clone(),
            listener,
            handler,
            read_header_timeout,
            shutdown_rx,
            Arc::clone(&state),
        ));

        *state.lock().expect("state mutex poisoned") = ServiceState::Running;
        info!(service = %spec.name, address = ?local_addr, "started service");

        self.services.lock().await.insert(
            spec.name.clone(),
            RunningService {
                spec,
                local_addr,
                state,
                shutdown_tx,
                serve_handle,
            },
        );
        Ok(())
    }

    /// Gracefully stop one service within the deadline, then close its node
    pub async fn remove_service(&self, name: &str, deadline: StdDuration) -> Result<(), Error> {
        let removed = self.services.lock().await.remove(name);
        let Some(svc) = removed else {
            return Err(Error::internal(format!(
                "service {:?} is not running",
                name
            )));
        };

        *svc.state.lock().expect("state mutex poisoned") = ServiceState::Stopping;
        let _ = svc.shutdown_tx.send(true);

        let mut handle = svc.serve_handle;
        let drained = tokio::time::timeout(deadline, &mut handle).await.is_ok();
        if !drained {
            warn!(service = %name, "graceful drain exceeded deadline; forcing close");
            handle.abort();
        }

        let close_result = self.mesh.close_node(name).await;
        *svc.state.lock().expect("state mutex poisoned") = ServiceState::Stopped;
        info!(service = %name, "stopped service");
        close_result
    }

    /// Remove-then-add with the same name; the state directory carries the
    /// mesh identity across the pair
    pub async fn update_service(&self, spec: Service, deadline: StdDuration) -> Result<(), Error> {
        self.remove_service(&spec.name, deadline).await?;
        self.add_service(spec).await
    }

    /// Start every spec, collecting per-service failures
    pub async fn start_all(&self, specs: &[Service]) -> Result<StartupAggregate, Error> {
        if specs.is_empty() {
            return Err(Error::internal("no services configured"));
        }
        let mut aggregate = StartupAggregate::new(specs.len());
        for spec in specs {
            let name = spec.name.clone();
            match self.add_service(spec.clone()).await {
                Ok(()) => aggregate.record_success(),
                Err(e) => {
                    error!(service = %name, error = %e, "failed to start service");
                    aggregate.record_failure(name, e);
                }
            }
        }
        Ok(aggregate)
    }

    /// Concurrent graceful shutdown of every service with one deadline
    pub async fn shutdown(&self, deadline: StdDuration) -> Result<(), Error> {
        let services: Vec<(String, RunningService)> =
            self.services.lock().await.drain().collect();

        let mut tasks = Vec::new();
        for (name, svc) in services {
            tasks.push(tokio::spawn(async move {
                *svc.state.lock().expect("state mutex poisoned") = ServiceState::Stopping;
                let _ = svc.shutdown_tx.send(true);
                let mut handle = svc.serve_handle;
                let drained = tokio::time::timeout(deadline, &mut handle).await.is_ok();
                if !drained {
                    handle.abort();
                }
                *svc.state.lock().expect("state mutex poisoned") = ServiceState::Stopped;
                if drained {
                    None
                } else {
                    Some(format!("service {:?} did not drain in time", name))
                }
            }));
        }

        let mut failures = Vec::new();
        for task in tasks {
            if let Ok(Some(msg)) = task.await {
                failures.push(msg);
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::internal(format!(
                "shutting down services: {}",
                failures.join("; ")
            )))
        }
    }

    /// Specs of everything currently running, sorted by name
    pub async fn specs(&self) -> Vec<Service> {
        let services = self.services.lock().await;
        let mut specs: Vec<Service> = services.values().map(|s| s.spec.clone()).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    pub async fn len(&self) -> usize {
        self.services.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.services.lock().await.is_empty()
    }

    pub async fn state(&self, name: &str) -> Option<ServiceState> {
        self.services.lock().await.get(name).map(|s| s.state())
    }

    /// Bound listener address, mainly for tests and status surfaces
    pub async fn local_addr(&self, name: &str) -> Option<SocketAddr> {
        self.services.lock().await.get(name).and_then(|s| s.local_addr)
    }
}

async fn serve_loop(
    name: String,
    listener: Box<dyn MeshListener>,
    handler: Arc<ServiceHandler>,
    read_header_timeout: Option<StdDuration>,
    mut shutdown_rx: watch::Receiver<bool>,
    state: Arc<StdMutex<ServiceState>>,
) {
    let graceful = GracefulShutdown::new();
    debug!(service = %name, address = ?listener.local_addr().ok(), "service listening");

    let mut failed = false;
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((conn, remote)) => {
                        let handler = Arc::clone(&handler);
                        let conn_name = name.clone();
                        let service = service_fn(move |req| {
                            let handler = Arc::clone(&handler);
                            async move { Ok::<_, Infallible>(handler.handle(req, remote).await) }
                        });
                        let mut builder = hyper::server::conn::http1::Builder::new();
                        builder.timer(TokioTimer::new());
                        if let Some(timeout) = read_header_timeout {
                            builder.header_read_timeout(timeout);
                        }
                        let conn_fut = builder.serve_connection(TokioIo::new(conn), service);
                        let watched = graceful.watch(conn_fut);
                        tokio::spawn(async move {
                            if let Err(e) = watched.await {
                                debug!(service = %conn_name, error = %e, "connection error");
                            }
                        });
                    }
                    Err(e) => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                        error!(service = %name, error = %e, "service serve error");
                        failed = true;
                        break;
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    // Drain in-flight connections before the loop task finishes; the caller
    // bounds this with its deadline.
    graceful.shutdown().await;

    if failed {
        *state.lock().expect("state mutex poisoned") = ServiceState::Failed;
    }
    debug!(service = %name, "serve loop exited");
}
