#![forbid(unsafe_code)]

mod config;
mod session;

use std::io::Write as _;

use anyhow::Context as _;
use tracing_subscriber::EnvFilter;
use wst_net_bridge::SocketApi;

use crate::config::{Command, Config};
use crate::session::Session;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load();

    let filter = match &config.log_level {
        Some(level) => EnvFilter::try_new(level).ok(),
        None => EnvFilter::try_from_default_env().ok(),
    }
    .unwrap_or_else(|| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let session = Session::connect(&config.remote).await?;
    tokio::time::timeout(config.ready_timeout, session.context().await_ready())
        .await
        .context("tunnel did not deliver a network configuration")?;

    let api = SocketApi::new(session.context().clone());
    let res = tokio::select! {
        res = run(&api, config.command) => res,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted");
            Ok(())
        }
    };

    session.shutdown();
    res
}

async fn run(api: &SocketApi, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Get { target, path } => http_get(api, target, &path).await,
        Command::Udp { target, payload } => udp_exchange(api, target, payload).await,
    }
}

async fn http_get(api: &SocketApi, target: String, path: &str) -> anyhow::Result<()> {
    let id = api.socket_named("ip4", "tcp").await?;
    api.connect(id, target.clone())
        .await
        .with_context(|| format!("connect to {target}"))?;
    tracing::info!(%id, %target, "connected");

    let request = format!("GET {path} HTTP/1.0\r\nHost: {target}\r\n\r\n");
    api.send(id, vec![request.into_bytes()], None).await?;

    let mut stdout = std::io::stdout();
    loop {
        let received = api.recv(id, vec![vec![0; 4096]]).await?;
        if received.len == 0 {
            break;
        }
        stdout.write_all(&received.buffers[0][..received.len])?;
    }
    stdout.flush()?;

    api.close(id).await?;
    Ok(())
}

async fn udp_exchange(api: &SocketApi, target: String, payload: String) -> anyhow::Result<()> {
    let id = api.socket_named("ip4", "udp").await?;
    let sent = api
        .send(id, vec![payload.into_bytes()], Some(target.clone()))
        .await?;
    tracing::info!(%id, %target, sent, "datagram sent");

    let received = api.recv(id, vec![vec![0; 65535]]).await?;
    let from = received
        .remote
        .map_or_else(|| "unknown".to_string(), |addr| addr.to_string());
    println!(
        "{} bytes from {from}: {}",
        received.len,
        String::from_utf8_lossy(&received.buffers[0][..received.len])
    );

    api.close(id).await?;
    Ok(())
}
