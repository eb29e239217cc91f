//! Mapping of CLI actions onto the service manager, and the run loop shared by
//! foreground and daemon mode.

use std::fmt;
use std::future::Future;
use std::str::FromStr;

use anyhow::{Context, Result};
use common::tuple;
use tokio::time;
use tracing::{info, warn, Instrument};

use super::{ServiceManager, ServiceState};
use crate::config::Config;
use crate::context::ProcessContext;
use crate::proxy::Engine;
use crate::signals;

/// What the operator asked the process to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Start,
    Restart,
    Stop,
    Status,
    Install,
    Uninstall,
    /// Run under the service manager's supervision.
    Daemon,
    /// Run attached to the terminal until SIGINT/SIGTERM.
    Foreground,
}

impl Action {
    /// Whether a config file should be created when none exists yet.
    ///
    /// Interactive foreground runs never leave a file behind.
    pub fn persists_config(self) -> bool {
        self != Self::Foreground
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Restart => "restart",
            Self::Stop => "stop",
            Self::Status => "status",
            Self::Install => "install",
            Self::Uninstall => "uninstall",
            Self::Daemon => "daemon",
            Self::Foreground => "",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "start" => Self::Start,
            "restart" => Self::Restart,
            "stop" => Self::Stop,
            "status" => Self::Status,
            "install" => Self::Install,
            "uninstall" => Self::Uninstall,
            "daemon" => Self::Daemon,
            "" => Self::Foreground,
            other => {
                return Err(format!(
                    "unknown action {other:?} (expected start/restart/stop/status/install/uninstall/daemon)"
                ))
            }
        })
    }
}

/// Drives the daemon lifecycle through a [`ServiceManager`] and runs the
/// [`Engine`] when asked to run.
pub struct ServiceController<M, E> {
    manager: M,
    engine: E,
    ctx: ProcessContext,
    config: Config,
}

impl<M: ServiceManager, E: Engine> ServiceController<M, E> {
    pub fn new(manager: M, engine: E, ctx: ProcessContext, config: Config) -> Self {
        Self {
            manager,
            engine,
            ctx,
            config,
        }
    }

    /// Perform `action`. Returns only once the action is complete; for the two
    /// run modes that is after a stop request.
    ///
    /// # Errors
    ///
    /// Any manager failure, tuple construction failure, or engine failure.
    pub async fn dispatch(&self, action: Action) -> Result<()> {
        match action {
            Action::Start => self.start()?,
            Action::Restart => self.restart()?,
            Action::Stop => self.stop()?,
            Action::Uninstall => self.uninstall()?,
            Action::Install => {
                self.install()?;
                self.start()?;
            }
            Action::Status => {
                let state = self.status()?;
                println!("{state}");
            }
            Action::Daemon => self.daemon().await?,
            Action::Foreground => self.foreground().await?,
        }
        Ok(())
    }

    pub fn start(&self) -> Result<()> {
        self.manager.start().context("start")?;
        info!("start OK");
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        self.manager.stop().context("stop")?;
        info!("stop OK");
        Ok(())
    }

    pub fn restart(&self) -> Result<()> {
        self.manager.restart().context("restart")?;
        info!("restart OK");
        Ok(())
    }

    pub fn install(&self) -> Result<()> {
        self.manager.install().context("install")?;
        info!("install OK");
        Ok(())
    }

    pub fn uninstall(&self) -> Result<()> {
        self.manager.uninstall().context("uninstall")?;
        info!("uninstall OK");
        Ok(())
    }

    pub fn status(&self) -> Result<ServiceState> {
        let state = self.manager.status().context("status")?;
        info!(status = %state, "status");
        Ok(state)
    }

    /// Run under supervision until the manager requests a stop.
    pub async fn daemon(&self) -> Result<()> {
        let span = self.ctx.span().clone();
        self.run_until(self.manager.stop_requested())
            .instrument(span)
            .await
    }

    /// Run in the foreground until SIGINT or SIGTERM.
    pub async fn foreground(&self) -> Result<()> {
        let span = self.ctx.span().clone();
        self.run_until(signals::shutdown_signal())
            .instrument(span)
            .await
    }

    /// Build tuples, start the engine, and block until `stop` resolves or the
    /// engine exits on its own.
    ///
    /// After `stop`, the process context is cancelled and the engine gets the
    /// configured grace period to drain before it is abandoned.
    ///
    /// # Errors
    ///
    /// Returns an error if the address lists are invalid, or if the engine
    /// fails or panics.
    pub async fn run_until<S>(&self, stop: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        let tuples = tuple::build(&self.config.inaddrs, &self.config.outaddrs)?;
        for t in &tuples {
            info!(tuple = %t, "bridging");
        }

        let mut engine = tokio::spawn(self.engine.clone().serve(tuples, self.ctx.clone()));

        tokio::select! {
            () = stop => info!("stop requested"),
            joined = &mut engine => {
                joined.context("proxy engine panicked")?.context("proxy engine failed")?;
                warn!("proxy engine exited without a stop request");
                return Ok(());
            }
        }

        self.ctx.cancel();
        let grace = self.config.shutdown_grace();
        match time::timeout(grace, &mut engine).await {
            Ok(joined) => {
                joined.context("proxy engine panicked")?.context("proxy engine failed")?;
                info!("proxy engine stopped");
            }
            Err(_) => {
                warn!(grace_secs = grace.as_secs_f64(), "proxy engine did not drain in time; abandoning");
                engine.abort();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ManagerError;
    use common::{Address, Tuple};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::Notify;
    use tracing::Span;

    // -----------------------------------------------------------------------
    // Fakes
    // -----------------------------------------------------------------------

    #[derive(Default)]
    struct FakeState {
        installed: bool,
        running: bool,
        calls: Vec<&'static str>,
    }

    #[derive(Clone, Default)]
    struct FakeManager {
        state: Arc<Mutex<FakeState>>,
        stop: Arc<Notify>,
    }

    impl FakeManager {
        fn installed(running: bool) -> Self {
            let m = Self::default();
            {
                let mut s = m.state.lock().unwrap();
                s.installed = true;
                s.running = running;
            }
            m
        }

        fn calls(&self) -> Vec<&'static str> {
            self.state.lock().unwrap().calls.clone()
        }

        fn transition(&self, call: &'static str, running: bool) -> Result<(), ManagerError> {
            let mut s = self.state.lock().unwrap();
            s.calls.push(call);
            if !s.installed {
                return Err(ManagerError::NotInstalled("vsock_proxy".into()));
            }
            s.running = running;
            Ok(())
        }
    }

    impl ServiceManager for FakeManager {
        fn install(&self) -> Result<(), ManagerError> {
            let mut s = self.state.lock().unwrap();
            s.calls.push("install");
            if s.installed {
                return Err(ManagerError::AlreadyInstalled("vsock_proxy".into()));
            }
            s.installed = true;
            Ok(())
        }

        fn uninstall(&self) -> Result<(), ManagerError> {
            self.transition("uninstall", false)?;
            self.state.lock().unwrap().installed = false;
            Ok(())
        }

        fn start(&self) -> Result<(), ManagerError> {
            self.transition("start", true)
        }

        fn stop(&self) -> Result<(), ManagerError> {
            self.transition("stop", false)
        }

        fn restart(&self) -> Result<(), ManagerError> {
            self.transition("restart", true)
        }

        fn status(&self) -> Result<ServiceState, ManagerError> {
            let s = self.state.lock().unwrap();
            match (s.installed, s.running) {
                (false, _) => Err(ManagerError::NotInstalled("vsock_proxy".into())),
                (true, true) => Ok(ServiceState::Running),
                (true, false) => Ok(ServiceState::Stopped),
            }
        }

        fn stop_requested(&self) -> impl Future<Output = ()> + Send {
            let stop = self.stop.clone();
            async move { stop.notified().await }
        }

        fn logger(&self) -> Span {
            Span::none()
        }
    }

    #[derive(Clone, Copy)]
    enum Behaviour {
        /// Returns once cancelled.
        Cooperative,
        /// Ignores cancellation.
        Hung,
        /// Fails immediately.
        Failing,
    }

    #[derive(Clone)]
    struct FakeEngine {
        behaviour: Behaviour,
        served: Arc<Mutex<Vec<Vec<Tuple>>>>,
    }

    impl FakeEngine {
        fn new(behaviour: Behaviour) -> Self {
            Self {
                behaviour,
                served: Arc::default(),
            }
        }
    }

    impl Engine for FakeEngine {
        fn serve(
            self,
            tuples: Vec<Tuple>,
            ctx: ProcessContext,
        ) -> impl Future<Output = Result<()>> + Send + 'static {
            async move {
                self.served.lock().unwrap().push(tuples);
                match self.behaviour {
                    Behaviour::Cooperative => {
                        ctx.cancelled().await;
                        Ok(())
                    }
                    Behaviour::Hung => std::future::pending().await,
                    Behaviour::Failing => anyhow::bail!("listener exploded"),
                }
            }
        }
    }

    fn config(inaddrs: &str, outaddrs: &str) -> Config {
        Config {
            inaddrs: inaddrs.into(),
            outaddrs: outaddrs.into(),
            shutdown_grace_secs: 1,
            ..Config::default()
        }
    }

    fn controller(
        manager: FakeManager,
        engine: FakeEngine,
        cfg: Config,
    ) -> ServiceController<FakeManager, FakeEngine> {
        ServiceController::new(manager, engine, ProcessContext::new(Span::none()), cfg)
    }

    // -----------------------------------------------------------------------
    // Actions
    // -----------------------------------------------------------------------

    #[test]
    fn parses_every_action() {
        for action in [
            Action::Start,
            Action::Restart,
            Action::Stop,
            Action::Status,
            Action::Install,
            Action::Uninstall,
            Action::Daemon,
            Action::Foreground,
        ] {
            assert_eq!(action.as_str().parse::<Action>().unwrap(), action);
        }
        assert!("reload".parse::<Action>().is_err());
    }

    #[test]
    fn only_foreground_skips_persisting() {
        assert!(!Action::Foreground.persists_config());
        assert!(Action::Status.persists_config());
        assert!(Action::Daemon.persists_config());
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn stop_while_running_is_reported_stopped() {
        let manager = FakeManager::installed(true);
        let c = controller(manager.clone(), FakeEngine::new(Behaviour::Cooperative), config("", ""));

        assert_eq!(c.status().unwrap(), ServiceState::Running);
        c.dispatch(Action::Stop).await.unwrap();
        assert_eq!(c.status().unwrap(), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn install_registers_then_starts() {
        let manager = FakeManager::default();
        let c = controller(manager.clone(), FakeEngine::new(Behaviour::Cooperative), config("", ""));

        c.dispatch(Action::Install).await.unwrap();
        assert_eq!(manager.calls(), ["install", "start"]);
        assert_eq!(c.status().unwrap(), ServiceState::Running);
    }

    #[tokio::test]
    async fn failed_install_does_not_start() {
        let manager = FakeManager::installed(false);
        let c = controller(manager.clone(), FakeEngine::new(Behaviour::Cooperative), config("", ""));

        assert!(c.dispatch(Action::Install).await.is_err());
        assert_eq!(manager.calls(), ["install"]);
    }

    #[tokio::test]
    async fn manager_failures_are_fatal_without_retry() {
        let manager = FakeManager::default();
        let c = controller(manager.clone(), FakeEngine::new(Behaviour::Cooperative), config("", ""));

        let err = c.dispatch(Action::Start).await.unwrap_err();
        assert!(format!("{err:#}").contains("not installed"));
        assert_eq!(manager.calls(), ["start"]);
        assert!(c.dispatch(Action::Status).await.is_err());
    }

    #[tokio::test]
    async fn restart_and_uninstall() {
        let manager = FakeManager::installed(false);
        let c = controller(manager.clone(), FakeEngine::new(Behaviour::Cooperative), config("", ""));

        c.dispatch(Action::Restart).await.unwrap();
        assert_eq!(c.status().unwrap(), ServiceState::Running);
        c.dispatch(Action::Uninstall).await.unwrap();
        assert!(c.status().is_err());
    }

    // -----------------------------------------------------------------------
    // Run modes
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn stop_cancels_context_and_waits_for_engine() {
        let engine = FakeEngine::new(Behaviour::Cooperative);
        let c = controller(
            FakeManager::default(),
            engine.clone(),
            config("127.0.0.1:8080", "3:8080"),
        );

        c.run_until(async {}).await.unwrap();

        assert!(c.ctx.is_cancelled());
        let served = engine.served.lock().unwrap();
        assert_eq!(
            served[0],
            vec![Tuple {
                listen: Address::Network {
                    host: "127.0.0.1".into(),
                    port: 8080
                },
                connect: Address::Guest { cid: 3, port: 8080 },
            }]
        );
    }

    #[tokio::test]
    async fn daemon_returns_when_manager_requests_stop() {
        let manager = FakeManager::installed(true);
        let c = controller(
            manager.clone(),
            FakeEngine::new(Behaviour::Cooperative),
            config("127.0.0.1:8080", "3:8080"),
        );

        let stop = manager.stop.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(20)).await;
            stop.notify_one();
        });

        time::timeout(Duration::from_secs(5), c.dispatch(Action::Daemon))
            .await
            .expect("daemon should return after stop request")
            .unwrap();
        assert!(c.ctx.is_cancelled());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn foreground_returns_on_sigterm() {
        use tokio::signal::unix::{signal, SignalKind};

        // Keep a handler installed so SIGTERM never takes the test process down.
        let _guard = signal(SignalKind::terminate()).unwrap();

        let c = controller(
            FakeManager::default(),
            FakeEngine::new(Behaviour::Cooperative),
            config("127.0.0.1:8080", "3:8080"),
        );

        // A signal delivered before the foreground listener is armed is not
        // seen by it, so keep sending until the run returns.
        let pid = std::process::id().to_string();
        let sender = tokio::spawn(async move {
            loop {
                time::sleep(Duration::from_millis(20)).await;
                std::process::Command::new("kill")
                    .args(["-TERM", &pid])
                    .status()
                    .unwrap();
            }
        });

        let result = time::timeout(Duration::from_secs(5), c.dispatch(Action::Foreground)).await;
        sender.abort();

        result.expect("foreground should return after SIGTERM").unwrap();
        assert!(c.ctx.is_cancelled());
    }

    #[tokio::test]
    async fn hung_engine_is_abandoned_after_grace() {
        let c = controller(
            FakeManager::default(),
            FakeEngine::new(Behaviour::Hung),
            config("127.0.0.1:8080", "3:8080"),
        );
        assert_eq!(c.config.shutdown_grace(), Duration::from_secs(1));

        let started = std::time::Instant::now();
        time::timeout(Duration::from_secs(5), c.run_until(async {}))
            .await
            .expect("grace period should bound shutdown")
            .unwrap();
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn engine_failure_is_fatal() {
        let c = controller(
            FakeManager::default(),
            FakeEngine::new(Behaviour::Failing),
            config("127.0.0.1:8080", "3:8080"),
        );

        let err = c
            .run_until(std::future::pending::<()>())
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("listener exploded"));
    }

    #[tokio::test]
    async fn invalid_addresses_never_reach_engine() {
        let engine = FakeEngine::new(Behaviour::Cooperative);
        for (inaddrs, outaddrs) in [("", ""), ("a:1,b:2", "c:1"), ("abc", "3:8080")] {
            let c = controller(FakeManager::default(), engine.clone(), config(inaddrs, outaddrs));
            assert!(c.run_until(async {}).await.is_err());
        }
        assert!(engine.served.lock().unwrap().is_empty());
    }
}
