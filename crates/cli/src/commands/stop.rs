//! `routecodex stop` — stop a running proxy.
//!
//! Writes the stop intent (so a daemon supervisor does not respawn), then
//! asks the server to drain via `POST /shutdown`. The stop password, when
//! configured, is enforced on this path and on the HTTP path alike — the
//! request simply carries it. If the HTTP call fails the managed pid is
//! signaled directly.

use anyhow::{Context, bail};

use crate::supervisor;
use routecodex_config::{Loader, routecodex_home};

pub async fn run(port: Option<u16>, password: Option<String>) -> anyhow::Result<()> {
    let home = routecodex_home();
    let port = match port {
        Some(p) => p,
        None => Loader::with_home(home.clone())
            .load(None)
            .map(|c| c.http.port)
            .unwrap_or(5555),
    };

    let password = password.or_else(|| std::env::var("ROUTECODEX_STOP_PASSWORD").ok());

    supervisor::write_stop_intent(&home, port).context("stop intent write failed")?;

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(5))
        .build()?;
    let mut request = client.post(format!("http://127.0.0.1:{port}/shutdown"));
    if let Some(password) = &password {
        request = request.header("x-rcc-stop-password", password);
    }

    match request.send().await {
        Ok(response) if response.status().is_success() => {
            println!("server on port {port} is draining");
            Ok(())
        }
        Ok(response) if response.status() == reqwest::StatusCode::FORBIDDEN => {
            bail!("server refused shutdown: stop password required (set ROUTECODEX_STOP_PASSWORD)")
        }
        other => {
            if let Err(err) = &other {
                tracing::debug!(error = %err, "shutdown endpoint unreachable");
            }
            // Fall back to signaling the managed pid.
            match supervisor::read_pid_file(&home, port) {
                Some(pid) if supervisor::process_alive(pid) => {
                    signal_pid(pid)?;
                    println!("sent termination signal to pid {pid}");
                    Ok(())
                }
                Some(_) | None => bail!("no reachable server on port {port}"),
            }
        }
    }
}

fn signal_pid(pid: u32) -> anyhow::Result<()> {
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
        bail!("signaling processes is unsupported on this platform (pid {pid})")
    }
}
