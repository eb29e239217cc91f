//! [`ServiceManager`] backed by systemd.
//!
//! The unit file is rendered from the [`ServiceDescriptor`]; every lifecycle
//! call shells out to `systemctl`. Under supervision systemd stops the daemon
//! with SIGTERM, so [`ServiceManager::stop_requested`] waits for that signal.

use std::fs::{self, OpenOptions};
use std::future::Future;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tracing::{debug, info_span, Span};

use super::{ManagerError, ServiceDescriptor, ServiceManager, ServiceState};
use crate::signals;

/// Directory for locally installed system units.
pub const UNIT_DIR: &str = "/etc/systemd/system";

#[derive(Debug, Clone)]
pub struct SystemdManager {
    descriptor: ServiceDescriptor,
    unit_dir: PathBuf,
}

impl SystemdManager {
    pub fn new(descriptor: ServiceDescriptor) -> Self {
        Self {
            descriptor,
            unit_dir: PathBuf::from(UNIT_DIR),
        }
    }

    fn unit_name(&self) -> String {
        format!("{}.service", self.descriptor.name)
    }

    fn unit_path(&self) -> PathBuf {
        self.unit_dir.join(self.unit_name())
    }

    fn ensure_installed(&self) -> Result<(), ManagerError> {
        if self.unit_path().is_file() {
            Ok(())
        } else {
            Err(ManagerError::NotInstalled(self.descriptor.name.clone()))
        }
    }

    /// Run `systemctl <args>`, failing on a non-zero exit.
    fn systemctl(&self, args: &[&str]) -> Result<Output, ManagerError> {
        debug!(?args, "systemctl");
        let output = Command::new("systemctl").args(args).output()?;
        if !output.status.success() {
            return Err(ManagerError::Command {
                command: format!("systemctl {}", args.join(" ")),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }
}

impl ServiceManager for SystemdManager {
    fn install(&self) -> Result<(), ManagerError> {
        let path = self.unit_path();
        let executable = std::env::current_exe()?;
        let unit = render_unit(&self.descriptor, &executable);

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(ManagerError::AlreadyInstalled(self.descriptor.name.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(unit.as_bytes())?;

        self.systemctl(&["daemon-reload"])?;
        self.systemctl(&["enable", &self.unit_name()])?;
        Ok(())
    }

    fn uninstall(&self) -> Result<(), ManagerError> {
        self.ensure_installed()?;
        self.systemctl(&["disable", &self.unit_name()])?;
        fs::remove_file(self.unit_path())?;
        self.systemctl(&["daemon-reload"])?;
        Ok(())
    }

    fn start(&self) -> Result<(), ManagerError> {
        self.ensure_installed()?;
        self.systemctl(&["start", &self.unit_name()]).map(drop)
    }

    fn stop(&self) -> Result<(), ManagerError> {
        self.ensure_installed()?;
        self.systemctl(&["stop", &self.unit_name()]).map(drop)
    }

    fn restart(&self) -> Result<(), ManagerError> {
        self.ensure_installed()?;
        self.systemctl(&["restart", &self.unit_name()]).map(drop)
    }

    fn status(&self) -> Result<ServiceState, ManagerError> {
        self.ensure_installed()?;
        // `is-active` exits non-zero for anything but "active"; only stdout matters.
        let output = Command::new("systemctl")
            .args(["is-active", &self.unit_name()])
            .output()?;
        Ok(parse_is_active(&String::from_utf8_lossy(&output.stdout)))
    }

    fn stop_requested(&self) -> impl Future<Output = ()> + Send {
        signals::shutdown_signal()
    }

    fn logger(&self) -> Span {
        info_span!("service", name = %self.descriptor.name, manager = "systemd")
    }
}

fn parse_is_active(stdout: &str) -> ServiceState {
    match stdout.trim() {
        "active" | "reloading" | "deactivating" => ServiceState::Running,
        "inactive" | "failed" => ServiceState::Stopped,
        _ => ServiceState::Unknown,
    }
}

/// Render the unit file for `descriptor` running `executable`.
fn render_unit(descriptor: &ServiceDescriptor, executable: &Path) -> String {
    let mut exec_start = quote(&executable.to_string_lossy());
    for arg in &descriptor.arguments {
        exec_start.push(' ');
        exec_start.push_str(&quote(arg));
    }

    let mut unit_section = format!("Description={}\n", descriptor.description);
    if descriptor.delayed_auto_start {
        unit_section.push_str("Wants=network-online.target\nAfter=network-online.target\n");
    }
    let restart = match &descriptor.restart {
        Some(restart) => {
            unit_section.push_str(&format!(
                "StartLimitIntervalSec={}\n",
                restart.reset_period.as_secs()
            ));
            format!("Restart=on-failure\nRestartSec={}\n", restart.delay.as_secs())
        }
        None => "Restart=no\n".to_string(),
    };

    format!(
        r#"# {display_name}
[Unit]
{unit_section}
[Service]
ExecStart={exec_start}
{restart}
[Install]
WantedBy=multi-user.target
"#,
        display_name = descriptor.display_name,
    )
}

/// Quote one `ExecStart` word, escaping systemd's `%` specifiers and `$`
/// variable expansion.
fn quote(arg: &str) -> String {
    let escaped = arg.replace('%', "%%").replace('$', "$$");
    if arg.is_empty() || arg.contains(|c: char| c.is_whitespace() || c == '"' || c == '\\') {
        format!("\"{}\"", escaped.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        escaped
    }
}
