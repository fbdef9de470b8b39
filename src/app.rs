//! Application supervisor
//!
//! One instance per process. Start loads the initial configuration, brings
//! up the mesh manager, registry and metrics server, starts every service,
//! then consumes the provider's stream and reconciles the running set
//! against each new configuration. Reconciliations are serialized: the
//! stream is drained in order by a single task holding the applied-config
//! lock, and within one pass removes complete before updates before adds.

use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{service_equal, Config, Service, DEFAULT_SHUTDOWN_TIMEOUT};
use crate::errors::{Error, ReloadAction, ReloadAggregate};
use crate::mesh::MeshManager;
use crate::metrics::{Collector, MetricsServer};
use crate::provider::Provider;
use crate::service::Registry;
use crate::tsnet::{loopback_factory, MeshServerFactory};

/// Supervisor construction options
pub struct Options {
    pub provider: Arc<dyn Provider>,
    pub mesh_factory: MeshServerFactory,
}

enum AppState {
    Idle,
    Running(Running),
    Stopped,
}

struct Running {
    applied: Arc<Mutex<Config>>,
    mesh: Arc<MeshManager>,
    registry: Arc<Registry>,
    metrics_server: Option<MetricsServer>,
    watch_cancel: watch::Sender<bool>,
    watch_handle: JoinHandle<()>,
    shutdown_timeout: StdDuration,
}

/// The tsbridge supervisor
pub struct App {
    provider: Arc<dyn Provider>,
    mesh_factory: MeshServerFactory,
    state: Mutex<AppState>,
}

impl App {
    pub fn new(opts: Options) -> Self {
        Self {
            provider: opts.provider,
            mesh_factory: opts.mesh_factory,
            state: Mutex::new(AppState::Idle),
        }
    }

    /// Supervisor over the bundled loopback mesh backend
    pub fn with_provider(provider: Arc<dyn Provider>) -> Self {
        Self::new(Options {
            provider,
            mesh_factory: loopback_factory(),
        })
    }

    /// Load the initial configuration and bring everything up. Calling
    /// Start on an already-running supervisor is a no-op.
    pub async fn start(&self) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        if matches!(*state, AppState::Running(_)) {
            return Ok(());
        }

        let cfg = self.provider.load().await?;

        let collector = Arc::new(Collector::new());
        let mut mesh = MeshManager::new(cfg.tailscale.clone(), Arc::clone(&self.mesh_factory))?;
        mesh.set_collector(Arc::clone(&collector));
        let mesh = Arc::new(mesh);

        let mut registry = Registry::new(Arc::clone(&mesh), cfg.global.clone());
        registry.set_metrics(Arc::clone(&collector));
        let registry = Arc::new(registry);

        let shutdown_timeout = cfg
            .global
            .shutdown_timeout
            .and_then(|d| d.to_std())
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);

        let mut metrics_server = match &cfg.global.metrics_addr {
            Some(addr) => {
                let timeout = cfg
                    .global
                    .metrics_read_header_timeout
                    .and_then(|d| d.to_std())
                    .filter(|d| !d.is_zero())
                    .unwrap_or(crate::config::DEFAULT_METRICS_READ_HEADER_TIMEOUT);
                let mut server =
                    MetricsServer::new(addr.clone(), Arc::clone(&collector), timeout);
                server.start().await?;
                info!(address = ?server.local_addr(), "metrics server listening");
                Some(server)
            }
            None => None,
        };

        if cfg.services.is_empty() {
            // Only the docker provider validates with zero services; they
            // arrive later through the stream.
            info!("no services configured yet; waiting for provider updates");
        } else {
            let aggregate = match registry.start_all(&cfg.services).await {
                Ok(aggregate) => aggregate,
                Err(e) => {
                    if let Some(server) = metrics_server.as_mut() {
                        let _ = server.shutdown(shutdown_timeout).await;
                    }
                    let _ = mesh.close().await;
                    return Err(e);
                }
            };
            if aggregate.all_failed() {
                if let Some(server) = metrics_server.as_mut() {
                    let _ = server.shutdown(shutdown_timeout).await;
                }
                let _ = mesh.close().await;
                return Err(Error::resource(aggregate.to_string()));
            }
            if aggregate.has_failures() {
                warn!(
                    succeeded = aggregate.succeeded,
                    failed = aggregate.failed(),
                    "partial startup\n{}",
                    aggregate
                );
            } else {
                info!(services = aggregate.total, "all services started");
            }
        }

        // The applied view tracks registry ground truth, not the requested
        // config, so per-service failures are retried on the next reload.
        let mut applied = cfg.clone();
        applied.services = registry.specs().await;
        let applied = Arc::new(Mutex::new(applied));

        // Providers emit fully processed configurations, so the stream only
        // ever carries validated values.
        let mut stream = self.provider.watch().await?;
        let (watch_cancel, mut cancel_rx) = watch::channel(false);
        let watch_registry = Arc::clone(&registry);
        let watch_applied = Arc::clone(&applied);
        let watch_handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_rx.changed() => {
                        if *cancel_rx.borrow() {
                            break;
                        }
                    }
                    maybe = stream.recv() => match maybe {
                        Some(new_cfg) => {
                            let mut applied = watch_applied.lock().await;
                            let aggregate = reconcile(
                                &watch_registry,
                                &applied.services,
                                &new_cfg.services,
                                shutdown_timeout,
                            )
                            .await;
                            applied.services = watch_registry.specs().await;
                            if aggregate.has_failures() {
                                warn!("configuration reload finished with failures\n{}", aggregate);
                            } else {
                                info!(applied = aggregate.succeeded, "configuration reload applied");
                            }
                        }
                        None => {
                            debug!("configuration stream closed");
                            break;
                        }
                    }
                }
            }
        });

        *state = AppState::Running(Running {
            applied,
            mesh,
            registry,
            metrics_server,
            watch_cancel,
            watch_handle,
            shutdown_timeout,
        });
        Ok(())
    }

    /// Graceful teardown: cancel the config stream, stop the metrics server,
    /// drain every service, close every mesh node. All steps run
    /// best-effort; their errors are joined. Repeated calls are no-ops.
    pub async fn shutdown(&self) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        let running = match std::mem::replace(&mut *state, AppState::Stopped) {
            AppState::Running(running) => running,
            _ => return Ok(()),
        };
        drop(state);

        let mut failures = Vec::new();

        let _ = running.watch_cancel.send(true);
        let _ = running.watch_handle.await;

        if let Some(mut server) = running.metrics_server {
            if let Err(e) = server.shutdown(running.shutdown_timeout).await {
                failures.push(format!("metrics server: {}", e));
            }
        }
        if let Err(e) = running.registry.shutdown(running.shutdown_timeout).await {
            failures.push(format!("registry: {}", e));
        }
        if let Err(e) = running.mesh.close().await {
            failures.push(format!("mesh: {}", e));
        }

        if failures.is_empty() {
            info!("shutdown complete");
            Ok(())
        } else {
            Err(Error::internal(format!(
                "shutdown finished with errors: {}",
                failures.join("; ")
            )))
        }
    }

    /// Specs of the currently-running services
    pub async fn services(&self) -> Vec<Service> {
        match &*self.state.lock().await {
            AppState::Running(running) => running.registry.specs().await,
            _ => Vec::new(),
        }
    }

    /// The applied configuration, for status surfaces
    pub async fn applied_config(&self) -> Option<Config> {
        match &*self.state.lock().await {
            AppState::Running(running) => Some(running.applied.lock().await.clone()),
            _ => None,
        }
    }
}

/// Actions derived from one desired-vs-running comparison
#[derive(Debug, Default, PartialEq)]
pub(crate) struct ReconcilePlan {
    pub remove: Vec<String>,
    pub update: Vec<Service>,
    pub add: Vec<Service>,
}

/// Three-way diff by service name. A name appears in exactly one action:
/// removed when it left the config, updated when its spec changed, added
/// when it is new; equal specs produce no action.
pub(crate) fn diff_services(current: &[Service], desired: &[Service]) -> ReconcilePlan {
    let current_by_name: std::collections::BTreeMap<&str, &Service> =
        current.iter().map(|s| (s.name.as_str(), s)).collect();
    let desired_names: std::collections::BTreeSet<&str> =
        desired.iter().map(|s| s.name.as_str()).collect();

    let mut plan = ReconcilePlan::default();
    for svc in current {
        if !desired_names.contains(svc.name.as_str()) {
            plan.remove.push(svc.name.clone());
        }
    }
    for svc in desired {
        match current_by_name.get(svc.name.as_str()) {
            None => plan.add.push(svc.clone()),
            Some(existing) if !service_equal(existing, svc) => plan.update.push(svc.clone()),
            Some(_) => {}
        }
    }
    plan
}

/// Apply one configuration change: removes, then updates, then adds, so a
/// rename never collides with its old listener.
async fn reconcile(
    registry: &Registry,
    current: &[Service],
    desired: &[Service],
    deadline: StdDuration,
) -> ReloadAggregate {
    let plan = diff_services(current, desired);
    info!(
        remove = plan.remove.len(),
        update = plan.update.len(),
        add = plan.add.len(),
        "applying configuration change"
    );

    let mut aggregate = ReloadAggregate::new();

    for name in plan.remove {
        match registry.remove_service(&name, deadline).await {
            Ok(()) => aggregate.record_success(),
            Err(e) => aggregate.record_failure(ReloadAction::Remove, name, e),
        }
    }

    for spec in plan.update {
        // An update is remove-then-add; once the old instance is gone a
        // failure belongs to the add side, where the name is now absent.
        if let Err(e) = registry.remove_service(&spec.name, deadline).await {
            aggregate.record_failure(ReloadAction::Update, spec.name.clone(), e);
            continue;
        }
        let name = spec.name.clone();
        match registry.add_service(spec).await {
            Ok(()) => aggregate.record_success(),
            Err(e) => aggregate.record_failure(ReloadAction::Add, name, e),
        }
    }

    for spec in plan.add {
        let name = spec.name.clone();
        match registry.add_service(spec).await {
            Ok(()) => aggregate.record_success(),
            Err(e) => aggregate.record_failure(ReloadAction::Add, name, e),
        }
    }

    aggregate
}
