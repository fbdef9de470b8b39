//! Configuration providers
//!
//! A provider produces the initial [`Config`] and a stream of subsequent
//! Configs. The stream yields whole configurations (never diffs), is
//! single-consumer, and closes when either side goes away; the supervisor
//! cancels it by dropping the receiver. Providers are registered by name so
//! startup wiring stays declarative.

use async_trait::async_trait;
use notify::Watcher;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::Config;
use crate::errors::Error;

/// Quiet period before a file modification triggers a reload
const FILE_WATCH_DEBOUNCE: StdDuration = StdDuration::from_millis(250);

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Produce the initial configuration, fully processed and validated
    async fn load(&self) -> Result<Config, Error>;

    /// Produce subsequent configurations. Dropping the receiver cancels the
    /// stream; providers stop their background work when the first send
    /// fails.
    async fn watch(&self) -> Result<mpsc::Receiver<Config>, Error>;
}

impl std::fmt::Debug for dyn Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider").field("name", &self.name()).finish()
    }
}

/// Options shared by every provider factory
#[derive(Debug, Clone, Default)]
pub struct ProviderOptions {
    /// TOML file path (required by the file provider)
    pub config_path: Option<PathBuf>,
    /// Container runtime endpoint (docker provider)
    pub docker_endpoint: Option<String>,
    /// Label prefix for container-derived configuration
    pub label_prefix: String,
    /// Re-emit the file provider's config on file modification
    pub watch_file: bool,
}

pub type ProviderFactory =
    Arc<dyn Fn(&ProviderOptions) -> futures::future::BoxFuture<'static, Result<Arc<dyn Provider>, Error>> + Send + Sync>;

/// Name-keyed provider construction
#[derive(Default)]
pub struct ProviderRegistry {
    factories: HashMap<String, ProviderFactory>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, factory: ProviderFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub async fn create(
        &self,
        name: &str,
        opts: &ProviderOptions,
    ) -> Result<Arc<dyn Provider>, Error> {
        let factory = self.factories.get(name).ok_or_else(|| {
            Error::validation(format!(
                "unknown provider {:?} (registered: {:?})",
                name,
                self.factories.keys().collect::<Vec<_>>()
            ))
        })?;
        factory(opts).await
    }
}

/// Registry with the built-in providers wired up
pub fn default_registry() -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    registry.register(
        "file",
        Arc::new(|opts: &ProviderOptions| {
            let opts = opts.clone();
            Box::pin(async move {
                let path = opts.config_path.clone().ok_or_else(|| {
                    Error::validation("--config is required for the file provider")
                })?;
                Ok(Arc::new(FileProvider::new(path, opts.watch_file)) as Arc<dyn Provider>)
            })
        }),
    );
    registry.register(
        "docker",
        Arc::new(|opts: &ProviderOptions| {
            let opts = opts.clone();
            Box::pin(async move {
                let provider = crate::docker::DockerProvider::new(
                    opts.docker_endpoint.as_deref(),
                    &opts.label_prefix,
                )
                .await?;
                Ok(Arc::new(provider) as Arc<dyn Provider>)
            })
        }),
    );
    registry
}

/// Static TOML file provider. By default the configuration is immutable for
/// the process lifetime; with `watch_file` the file is re-read, re-validated
/// and re-emitted on modification events.
pub struct FileProvider {
    path: PathBuf,
    watch_file: bool,
}

impl FileProvider {
    pub fn new(path: PathBuf, watch_file: bool) -> Self {
        Self { path, watch_file }
    }
}

#[async_trait]
impl Provider for FileProvider {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn load(&self) -> Result<Config, Error> {
        Config::load_with_provider(&self.path, "file")
    }

    async fn watch(&self) -> Result<mpsc::Receiver<Config>, Error> {
        let (tx, rx) = mpsc::channel(4);
        if !self.watch_file {
            // Sender dropped: the stream is already closed.
            return Ok(rx);
        }

        let path = self.path.clone();
        let (event_tx, event_rx) = std::sync::mpsc::channel::<notify::Result<notify::Event>>();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = event_tx.send(res);
        })
        .map_err(|e| {
            Error::wrap(crate::errors::ErrorKind::Resource, "creating file watcher", e)
        })?;
        watcher
            .watch(&path, notify::RecursiveMode::NonRecursive)
            .map_err(|e| {
                Error::wrap(
                    crate::errors::ErrorKind::Resource,
                    format!("watching config file {}", path.display()),
                    e,
                )
            })?;

        tokio::task::spawn_blocking(move || {
            // The watcher lives inside this task; dropping it unhooks the
            // notification callback.
            let _watcher = watcher;
            loop {
                let event = match event_rx.recv() {
                    Ok(Ok(event)) => event,
                    Ok(Err(e)) => {
                        warn!(error = %e, "config file watch error");
                        continue;
                    }
                    Err(_) => break,
                };
                if !matches!(
                    event.kind,
                    notify::EventKind::Modify(_) | notify::EventKind::Create(_)
                ) {
                    continue;
                }
                // Editors produce bursts of events; settle before reloading.
                std::thread::sleep(FILE_WATCH_DEBOUNCE);
                while event_rx.try_recv().is_ok() {}

                match Config::load_with_provider(&path, "file") {
                    Ok(cfg) => {
                        debug!(path = %path.display(), "config file changed; emitting");
                        if tx.blocking_send(cfg).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "ignoring invalid config file change");
                    }
                }
            }
        });

        Ok(rx)
    }
}
