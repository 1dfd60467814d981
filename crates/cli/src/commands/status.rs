//! `routecodex status` — show server liveness and target health.

use anyhow::Context;

use crate::supervisor;
use routecodex_config::{Loader, routecodex_home};

pub async fn run(port: Option<u16>) -> anyhow::Result<()> {
    let home = routecodex_home();
    let port = match port {
        Some(p) => p,
        None => Loader::with_home(home.clone())
            .load(None)
            .map(|c| c.http.port)
            .unwrap_or(5555),
    };

    match supervisor::read_pid_file(&home, port) {
        Some(pid) if supervisor::process_alive(pid) => {
            println!("server: running (pid {pid}, port {port})");
        }
        Some(pid) => println!("server: stale pid file ({pid}), not running"),
        None => println!("server: no pid file for port {port}"),
    }

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(3))
        .build()?;
    let health: serde_json::Value = client
        .get(format!("http://127.0.0.1:{port}/health"))
        .send()
        .await
        .context("health endpoint unreachable")?
        .json()
        .await
        .context("health response unparseable")?;

    println!(
        "health: {} (uptime {}s, generation {}, {} pipelines)",
        health["status"].as_str().unwrap_or("unknown"),
        health["uptimeSecs"],
        health["generation"],
        health["pipelines"],
    );
    if let (Some(tracked), Some(banned)) = (
        health["targetsTracked"].as_u64(),
        health["targetsBanned"].as_u64(),
    ) {
        println!("targets: {tracked} tracked, {banned} banned");
    }

    Ok(())
}
