//! OS service lifecycle: the manager capability the daemon is driven through,
//! the static description it registers, and the controller mapping CLI actions
//! onto it.
//!
//! # Lifecycle invariants
//!
//! - Service state is owned by the manager; the controller only reads what
//!   [`ServiceManager::status`] reports.
//! - Every manager call is attempted exactly once; a failure ends the command.

pub mod controller;
pub mod systemd;

pub use controller::{Action, ServiceController};
pub use systemd::SystemdManager;

use std::fmt;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::Span;

/// State of the installed service as reported by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Unknown,
    Running,
    Stopped,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unknown => "StatusUnknown",
            Self::Running => "StatusRunning",
            Self::Stopped => "StatusStopped",
        })
    }
}

/// Errors produced by a service manager.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// The service has not been registered with the manager.
    #[error("service {0:?} is not installed")]
    NotInstalled(String),

    /// `install` found an existing registration.
    #[error("service {0:?} is already installed")]
    AlreadyInstalled(String),

    /// A manager command ran but reported failure.
    #[error("`{command}` failed ({status}): {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Restart behaviour after the daemon exits with a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Delay before each restart.
    pub delay: Duration,
    /// Window after which the failure count resets.
    pub reset_period: Duration,
}

/// Static description of the daemon handed to the service manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub name: String,
    pub display_name: String,
    pub description: String,
    /// Arguments the manager passes to the executable.
    pub arguments: Vec<String>,
    /// `None` disables restart on failure.
    pub restart: Option<RestartPolicy>,
    /// Start automatically at boot, but only once the network is up.
    pub delayed_auto_start: bool,
}

impl ServiceDescriptor {
    /// The vsock-proxy daemon: started in `daemon` mode, restarted 10s after a
    /// failure, delayed automatic start at boot.
    pub fn vsock_proxy() -> Self {
        Self {
            name: "vsock_proxy".into(),
            display_name: "Vsock Proxy".into(),
            description: "Vsock Proxy: TCP <-> VSOCK, Host <-> VM.".into(),
            arguments: vec!["-a".into(), "daemon".into()],
            restart: Some(RestartPolicy {
                delay: Duration::from_secs(10),
                reset_period: Duration::from_secs(10),
            }),
            delayed_auto_start: true,
        }
    }
}

/// Narrow capability over the platform service manager.
///
/// The controller only ever talks to this trait, so the lifecycle can be
/// exercised against an in-memory fake.
pub trait ServiceManager {
    /// Register the service described at construction time.
    fn install(&self) -> Result<(), ManagerError>;

    fn uninstall(&self) -> Result<(), ManagerError>;

    fn start(&self) -> Result<(), ManagerError>;

    fn stop(&self) -> Result<(), ManagerError>;

    fn restart(&self) -> Result<(), ManagerError>;

    fn status(&self) -> Result<ServiceState, ManagerError>;

    /// Resolves when the manager asks a supervised daemon to stop.
    ///
    /// This is the daemon-side half of supervision: the process runs its work
    /// until this future completes.
    fn stop_requested(&self) -> impl Future<Output = ()> + Send;

    /// Logger span for the supervised service.
    fn logger(&self) -> Span;
}
