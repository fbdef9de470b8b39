//! Typed errors for tsbridge with aggregate start/reload reporting

use hyper::StatusCode;
use std::collections::BTreeMap;
use std::fmt;

/// Classification for tsbridge errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid user-supplied configuration values
    Validation,
    /// Configuration could not be loaded or assembled
    Config,
    /// Network-level failure talking to a backend or the control plane
    Network,
    /// A resource (listener, node, socket) could not be acquired
    Resource,
    /// Invariant violation inside tsbridge itself
    Internal,
}

impl ErrorKind {
    /// Default HTTP status when this error surfaces in a response
    pub fn http_status(&self) -> StatusCode {
        match self {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Network => StatusCode::BAD_GATEWAY,
            ErrorKind::Resource => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Config | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Config => "config",
            ErrorKind::Network => "network",
            ErrorKind::Resource => "resource",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tagged tsbridge error with an optional wrapped cause
#[derive(Debug, thiserror::Error)]
#[error("{kind} error: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn wrap(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Resource, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Default HTTP status for this error
    pub fn http_status(&self) -> StatusCode {
        self.kind.http_status()
    }
}

/// Marks an error as retryable and records how far the retry budget has run
#[derive(Debug, thiserror::Error)]
#[error("{source} (attempt {attempt}/{max_attempts})")]
pub struct Retryable {
    #[source]
    pub source: Error,
    pub attempt: u32,
    pub max_attempts: u32,
}

impl Retryable {
    pub fn new(source: Error, attempt: u32, max_attempts: u32) -> Self {
        Self {
            source,
            attempt,
            max_attempts,
        }
    }

    /// Whether another attempt is still allowed
    pub fn exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Outcome of starting a batch of services, keeping per-service failures
#[derive(Debug)]
pub struct StartupAggregate {
    pub total: usize,
    pub succeeded: usize,
    pub failures: BTreeMap<String, Error>,
}

impl StartupAggregate {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            succeeded: 0,
            failures: BTreeMap::new(),
        }
    }

    pub fn record_success(&mut self) {
        self.succeeded += 1;
    }

    pub fn record_failure(&mut self, name: impl Into<String>, err: Error) {
        self.failures.insert(name.into(), err);
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Every service failed and there was at least one to start
    pub fn all_failed(&self) -> bool {
        self.total > 0 && self.failed() == self.total
    }
}

impl fmt::Display for StartupAggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "started {}/{} services ({} failed)",
            self.succeeded,
            self.total,
            self.failed()
        )?;
        for (name, err) in &self.failures {
            write!(f, "\n  {}: {}", name, err)?;
        }
        Ok(())
    }
}

impl std::error::Error for StartupAggregate {}

/// Which reconcile action a reload failure belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadAction {
    Remove,
    Update,
    Add,
}

impl fmt::Display for ReloadAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReloadAction::Remove => "remove",
            ReloadAction::Update => "update",
            ReloadAction::Add => "add",
        })
    }
}

/// Outcome of one reconcile pass over a new configuration
#[derive(Debug, Default)]
pub struct ReloadAggregate {
    pub succeeded: usize,
    pub remove_failures: BTreeMap<String, Error>,
    pub update_failures: BTreeMap<String, Error>,
    pub add_failures: BTreeMap<String, Error>,
}

impl ReloadAggregate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&mut self) {
        self.succeeded += 1;
    }

    pub fn record_failure(&mut self, action: ReloadAction, name: impl Into<String>, err: Error) {
        let map = match action {
            ReloadAction::Remove => &mut self.remove_failures,
            ReloadAction::Update => &mut self.update_failures,
            ReloadAction::Add => &mut self.add_failures,
        };
        map.insert(name.into(), err);
    }

    pub fn failed(&self) -> usize {
        self.remove_failures.len() + self.update_failures.len() + self.add_failures.len()
    }

    pub fn has_failures(&self) -> bool {
        self.failed() > 0
    }

    /// Every attempted action failed and at least one was attempted
    pub fn all_failed(&self) -> bool {
        self.failed() > 0 && self.succeeded == 0
    }

    /// Collapse into an error when anything failed
    pub fn into_error(self) -> Option<Error> {
        if !self.has_failures() {
            return None;
        }
        Some(Error::internal(self.to_string()))
    }
}

impl fmt::Display for ReloadAggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "reload applied {} actions ({} failed)",
            self.succeeded,
            self.failed()
        )?;
        for (action, map) in [
            (ReloadAction::Remove, &self.remove_failures),
            (ReloadAction::Update, &self.update_failures),
            (ReloadAction::Add, &self.add_failures),
        ] {
            for (name, err) in map {
                write!(f, "\n  {} {}: {}", action, name, err)?;
            }
        }
        Ok(())
    }
}
