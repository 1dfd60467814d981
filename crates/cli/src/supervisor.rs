//! The supervisor: port ownership, daemon-respawn loop, reload-on-signal,
//! and graceful shutdown.
//!
//! Foreground mode owns the listening port directly. Daemon-supervisor mode
//! spawns a detached child running the actual server and respawns it on
//! exit until a stop intent is consumed.

use anyhow::{Context, bail};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::Duration;

use routecodex_config::{Loader, ResolvedConfig, routecodex_home};
use routecodex_core::event::EventBus;
use routecodex_credentials::CredentialStore;
use routecodex_gateway::{AppState, Engine};
use routecodex_snapshot::{SnapshotConfig, SnapshotSink};
use routecodex_tokend::{TokenDaemon, TokenDaemonConfig};

/// Grace period between shutdown request and force-kill.
const DRAIN_GRACE: Duration = Duration::from_millis(3_500);
/// Daemon respawn delay bounds.
const RESTART_DELAY_MIN_MS: u64 = 200;
const RESTART_DELAY_MAX_MS: u64 = 60_000;
const RESTART_DELAY_DEFAULT_MS: u64 = 1_200;

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub port: Option<u16>,
    pub config: Option<PathBuf>,
    pub exclusive: bool,
    pub daemon: bool,
    pub start_token_daemon: bool,
    pub start_guardian: bool,
    pub analysis_mode: bool,
}

pub async fn run(opts: SupervisorOptions) -> anyhow::Result<()> {
    let home = routecodex_home();
    let loader = Loader::with_home(home.clone());
    let mut resolved = loader
        .load(opts.config.as_deref())
        .context("config load failed")?;
    if let Some(port) = opts.port {
        resolved.http.port = port;
    }

    if opts.daemon && std::env::var("ROUTECODEX_SUPERVISED").is_err() {
        return daemon_supervise(&home, resolved.http.port, &opts).await;
    }

    run_foreground(loader, resolved, opts, home).await
}

/// Foreground server: the process that actually binds the port.
async fn run_foreground(
    loader: Loader,
    resolved: ResolvedConfig,
    opts: SupervisorOptions,
    home: PathBuf,
) -> anyhow::Result<()> {
    let port = resolved.http.port;
    acquire_port(&home, port, opts.exclusive)?;
    write_pid_file(&home, port).context("pid file write failed")?;

    let events = Arc::new(EventBus::default());
    let credentials = Arc::new(CredentialStore::new(events.clone()));
    credentials.load_profiles(&resolved.providers);

    let mut snapshot_config = SnapshotConfig::from_env(&home);
    if opts.analysis_mode {
        snapshot_config.enabled = true;
    }
    let snapshot = SnapshotSink::start(&snapshot_config).context("snapshot sink start failed")?;

    let health = Arc::new(routecodex_health::HealthTracker::new(
        Engine::health_policy_from_config(&resolved),
    ));
    let providers = resolved.providers.clone();
    let engine = Engine::build(resolved, health, 1)
        .map_err(|e| anyhow::anyhow!("engine build failed: {e}"))?;
    let (state, shutdown_rx) = AppState::new(engine, credentials.clone(), snapshot, events);

    // Dependent daemons.
    let daemons_enabled = std::env::var("ROUTECODEX_START_DAEMON")
        .map(|v| v != "0")
        .unwrap_or(true);
    let mut token_daemon = if opts.start_token_daemon && daemons_enabled {
        let mut daemon = TokenDaemon::new(
            TokenDaemonConfig::new(home.join("auth")),
            credentials.clone(),
        );
        daemon.start(&providers);
        Some(daemon)
    } else {
        None
    };
    let guardian = if opts.start_guardian && daemons_enabled {
        match routecodex_guardian::start(home.clone()).await {
            Ok(handle) => Some(handle),
            Err(err) => {
                // Guardian failures never prevent serving traffic.
                tracing::warn!(error = %err, "guardian daemon failed to start");
                None
            }
        }
    } else {
        None
    };

    spawn_signal_handlers(state.clone(), loader, opts.config.clone());

    // Subscribe before the server spawns so a shutdown requested during
    // startup is not missed.
    let mut events_rx = state.events.subscribe();
    let serve_state = state.clone();
    let mut server = tokio::spawn(async move {
        routecodex_gateway::serve(serve_state, shutdown_rx).await
    });
    let result = loop {
        tokio::select! {
            joined = &mut server => break joined,
            event = events_rx.recv() => {
                if let Ok(event) = event {
                    if matches!(*event, routecodex_core::event::ProxyEvent::ShutdownRequested { .. }) {
                        match tokio::time::timeout(DRAIN_GRACE, &mut server).await {
                            Ok(joined) => break joined,
                            Err(_) => {
                                tracing::warn!("drain grace expired, aborting in-flight requests");
                                server.abort();
                                break Ok(Ok(()));
                            }
                        }
                    }
                }
            }
        }
    };

    if let Some(daemon) = token_daemon.as_mut() {
        daemon.shutdown();
    }
    if let Some(handle) = guardian {
        handle.abort();
    }
    remove_pid_file(&home, port);

    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => bail!("server error: {err}"),
        Err(err) if err.is_cancelled() => Ok(()),
        Err(err) => bail!("server task panicked: {err}"),
    }
}

/// Daemon-supervisor mode: spawn a detached child running the actual server
/// and respawn it on exit until a stop intent is consumed.
async fn daemon_supervise(home: &Path, port: u16, opts: &SupervisorOptions) -> anyhow::Result<()> {
    // Clear any stale intent so a fresh start cannot immediately stop.
    consume_stop_intent(home, port);

    let exe = std::env::current_exe().context("cannot locate own binary")?;
    let delay = restart_delay();
    tracing::info!(port, delay_ms = delay.as_millis() as u64, "daemon supervisor starting");

    loop {
        let mut cmd = std::process::Command::new(&exe);
        cmd.arg("start").env("ROUTECODEX_SUPERVISED", "1");
        if let Some(port) = opts.port {
            cmd.args(["--port", &port.to_string()]);
        }
        if let Some(config) = &opts.config {
            cmd.args(["--config", &config.display().to_string()]);
        }
        if opts.exclusive {
            cmd.arg("--exclusive");
        }
        if !opts.start_token_daemon {
            cmd.arg("--no-token-daemon");
        }
        if !opts.start_guardian {
            cmd.arg("--no-guardian");
        }
        if opts.analysis_mode {
            cmd.args(["--mode", "analysis"]);
        }
        cmd.stdout(log_stdio(home, port)?);
        cmd.stderr(log_stdio(home, port)?);

        let mut child = cmd.spawn().context("failed to spawn server child")?;
        let child_pid = child.id();
        tracing::info!(child_pid, "server child running");

        let status = tokio::task::spawn_blocking(move || child.wait())
            .await
            .context("wait task failed")?
            .context("child wait failed")?;
        tracing::info!(code = status.code(), "server child exited");

        if consume_stop_intent(home, port) {
            tracing::info!("stop intent consumed, supervisor exiting");
            return Ok(());
        }
        tokio::time::sleep(delay).await;
    }
}

fn log_stdio(home: &Path, port: u16) -> anyhow::Result<std::process::Stdio> {
    let dir = home.join("logs");
    std::fs::create_dir_all(&dir)?;
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(format!("server-{port}.log")))?;
    Ok(file.into())
}

/// `ROUTECODEX_DAEMON_RESTART_DELAY_MS`, clamped to [200 ms, 60 s].
fn restart_delay() -> Duration {
    let ms = std::env::var("ROUTECODEX_DAEMON_RESTART_DELAY_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(RESTART_DELAY_DEFAULT_MS)
        .clamp(RESTART_DELAY_MIN_MS, RESTART_DELAY_MAX_MS);
    Duration::from_millis(ms)
}

// ── pid files & stop intent ─────────────────────────────────────────────────

pub fn pid_file(home: &Path, port: u16) -> PathBuf {
    home.join(format!("server-{port}.pid"))
}

pub fn stop_intent_file(home: &Path, port: u16) -> PathBuf {
    home.join(format!("server-{port}.stop"))
}

pub fn read_pid_file(home: &Path, port: u16) -> Option<u32> {
    std::fs::read_to_string(pid_file(home, port))
        .ok()?
        .trim()
        .parse()
        .ok()
}

fn write_pid_file(home: &Path, port: u16) -> std::io::Result<()> {
    std::fs::create_dir_all(home)?;
    std::fs::write(pid_file(home, port), std::process::id().to_string())
}

fn remove_pid_file(home: &Path, port: u16) {
    if read_pid_file(home, port) == Some(std::process::id()) {
        let _ = std::fs::remove_file(pid_file(home, port));
    }
}

/// Write the stop intent for `port`. The daemon supervisor consumes it after
/// the child exits.
pub fn write_stop_intent(home: &Path, port: u16) -> std::io::Result<()> {
    std::fs::create_dir_all(home)?;
    std::fs::write(
        stop_intent_file(home, port),
        chrono::Utc::now().to_rfc3339(),
    )
}

/// Consume the stop intent. Idempotent: the first call removes the file and
/// returns true; later calls find nothing.
pub fn consume_stop_intent(home: &Path, port: u16) -> bool {
    let path = stop_intent_file(home, port);
    match std::fs::remove_file(&path) {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "stop intent removal failed");
            false
        }
    }
}

/// Take ownership of the port: a managed sibling (tracked by our pid file)
/// may be killed under `--exclusive`/`--restart`; an unknown listener is
/// never touched.
fn acquire_port(home: &Path, port: u16, exclusive: bool) -> anyhow::Result<()> {
    let Some(pid) = read_pid_file(home, port) else {
        return Ok(());
    };
    if pid == std::process::id() || !process_alive(pid) {
        let _ = std::fs::remove_file(pid_file(home, port));
        return Ok(());
    }
    if !exclusive {
        bail!("port {port} is held by managed server pid {pid}; use --exclusive or --restart");
    }
    tracing::info!(pid, port, "killing managed sibling to take the port");
    kill_process(pid)?;
    // Give it a moment to release the socket.
    std::thread::sleep(std::time::Duration::from_millis(300));
    let _ = std::fs::remove_file(pid_file(home, port));
    Ok(())
}

pub fn process_alive(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        Path::new(&format!("/proc/{pid}")).exists()
    }
    #[cfg(not(target_os = "linux"))]
    {
        std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }
}

fn kill_process(pid: u32) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        let status = std::process::Command::new("kill")
            .arg(pid.to_string())
            .status()
            .context("kill invocation failed")?;
        if !status.success() {
            bail!("failed to signal pid {pid}");
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        bail!("killing sibling processes is unsupported on this platform (pid {pid})");
    }
}

/// Wire SIGUSR2 (reload) and SIGINT/SIGTERM (drain). On non-unix targets
/// only Ctrl-C is available and reload reports unsupported.
fn spawn_signal_handlers(
    state: routecodex_gateway::SharedState,
    loader: Loader,
    config_path: Option<PathBuf>,
) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let reload_state = state.clone();
        tokio::spawn(async move {
            let Ok(mut usr2) = signal(SignalKind::user_defined2()) else {
                tracing::warn!("SIGUSR2 handler unavailable, reload disabled");
                return;
            };
            while usr2.recv().await.is_some() {
                tracing::info!("SIGUSR2 received, reloading configuration");
                match loader.load(config_path.as_deref()) {
                    Ok(config) => match reload_state.install_engine(config) {
                        Ok(generation) => {
                            tracing::info!(generation, "reload complete");
                        }
                        Err(err) => {
                            // Old engine stays in effect.
                            tracing::error!(error = %err, "reload rejected, keeping old config");
                        }
                    },
                    Err(err) => {
                        tracing::error!(error = %err, "reload rejected, keeping old config");
                    }
                }
            }
        });

        let term_state = state.clone();
        tokio::spawn(async move {
            let Ok(mut term) = signal(SignalKind::terminate()) else {
                return;
            };
            term.recv().await;
            tracing::info!("SIGTERM received, draining");
            term_state.request_shutdown();
        });
    }
    #[cfg(not(unix))]
    {
        let _ = (loader, config_path);
        tracing::warn!("signal-based reload is unsupported on this platform");
    }

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, draining");
            state.request_shutdown();
        }
    });
}
