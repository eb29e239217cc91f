//! Command-line surface.

use clap::Parser;

use crate::service::Action;

/// Build time injected by the release pipeline, if any.
pub const BUILD_TIME: &str = match option_env!("VSOCK_PROXY_BUILD_TIME") {
    Some(t) => t,
    None => "",
};

/// Commit hash injected by the release pipeline, if any.
pub const BUILD_COMMIT: &str = match option_env!("VSOCK_PROXY_BUILD_COMMIT") {
    Some(c) => c,
    None => "",
};

const USAGE: &str = "\
Usage: vsock-proxy -c  Print current CID.
       vsock-proxy -a [start/restart/stop/status/install/uninstall]

  start      start the installed service
  restart    restart the installed service
  stop       stop the installed service
  status     print the service status
  install    install the service and start it
  uninstall  uninstall the service
  daemon     run under the service manager (used by the installed service)

Without -a the proxy runs in the foreground until interrupted.

Environment:
  VSOCK_INADDRS   comma-separated listen addresses (host:port or cid:port)
  VSOCK_OUTADDRS  comma-separated connect addresses, same length as VSOCK_INADDRS";

/// `-h` is handled here rather than by clap so it can print build metadata.
#[derive(Debug, Parser)]
#[command(name = "vsock-proxy", disable_help_flag = true, disable_version_flag = true)]
pub struct Cli {
    /// Lifecycle action; empty runs in the foreground.
    #[arg(short = 'a', value_name = "ACTION", default_value = "", value_parser = parse_action)]
    pub action: Action,

    /// Print the current vsock CID and exit.
    #[arg(short = 'c')]
    pub cid: bool,

    /// Print build metadata and usage and exit.
    #[arg(short = 'h')]
    pub help: bool,
}

fn parse_action(s: &str) -> Result<Action, String> {
    s.parse()
}

/// Text printed for `-h`.
pub fn help_text() -> String {
    format!("BuildTime: {BUILD_TIME} BuildCommit {BUILD_COMMIT}\n{USAGE}")
}
