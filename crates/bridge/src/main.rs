mod adapters;
mod audio;
mod browser;
mod config;
mod error;
mod events;
mod rtc;
mod tls;
mod upstream;
mod web;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use crate::events::EventStore;
use crate::web::AppState;

fn parse_args() -> (PathBuf, Option<u16>) {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = PathBuf::from("./config/voicebridge.toml");
    let mut port_override = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    port_override = args[i + 1].parse().ok();
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }

    (config_path, port_override)
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let (config_path, port_override) = parse_args();

    let mut cfg = config::load_config(&config_path)?;
    if let Some(p) = port_override {
        cfg.server.port = p;
    }

    let issues = cfg.validate();
    let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
    for issue in &issues {
        if issue.starts_with("ERROR:") {
            tracing::error!("{}", issue);
        } else {
            tracing::warn!("{}", issue);
        }
    }
    if has_errors {
        tracing::error!(
            "Configuration has {} issue(s). Fix the ERROR(s) above and restart.",
            issues.len()
        );
        std::process::exit(1);
    }

    let bind_addr: SocketAddr = format!("{}:{}", cfg.server.bind, cfg.server.port)
        .parse()
        .context("invalid bind address")?;

    let tls_acceptor = tls::build_acceptor(cfg.server.tls_cert.as_deref(), cfg.server.tls_key.as_deref())?;

    let event_store: events::SharedEventStore = Arc::new(EventStore::new());
    let state = Arc::new(AppState::new(cfg, event_store));

    let app = web::build_router(Arc::clone(&state));

    let scheme = if tls_acceptor.is_some() { "https" } else { "http" };
    tracing::info!("===========================================");
    tracing::info!("  voicebridge realtime voice bridge v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("  Listening on {scheme}://{bind_addr}");
    tracing::info!("===========================================");

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind to {bind_addr}"))?;

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    match tls_acceptor {
        Some(acceptor) => {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        let (stream, peer_addr) = match result {
                            Ok(conn) => conn,
                            Err(e) => {
                                tracing::warn!("failed to accept TCP connection: {e}");
                                continue;
                            }
                        };

                        let acceptor = acceptor.clone();
                        let app = app.clone();

                        tokio::spawn(async move {
                            let tls_stream = match tokio::time::timeout(
                                std::time::Duration::from_secs(10),
                                acceptor.accept(stream),
                            )
                            .await
                            {
                                Ok(Ok(s)) => s,
                                Ok(Err(e)) => {
                                    tracing::debug!(%peer_addr, "TLS handshake failed: {e}");
                                    return;
                                }
                                Err(_) => {
                                    tracing::debug!(%peer_addr, "TLS handshake timed out");
                                    return;
                                }
                            };

                            let io = hyper_util::rt::TokioIo::new(tls_stream);
                            let hyper_service = hyper_util::service::TowerToHyperService::new(app);
                            let builder = hyper_util::server::conn::auto::Builder::new(
                                hyper_util::rt::TokioExecutor::new(),
                            );
                            if let Err(e) = builder.serve_connection_with_upgrades(io, hyper_service).await {
                                tracing::debug!(%peer_addr, "connection error: {e}");
                            }
                        });
                    }
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("received SIGINT, shutting down");
                        break;
                    }
                    _ = sigterm.recv() => {
                        tracing::info!("received SIGTERM, shutting down");
                        break;
                    }
                }
            }
        }
        None => {
            tracing::info!("server.tls_cert/tls_key not both set; serving plain HTTP");
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("received SIGINT, shutting down");
                    }
                    _ = sigterm.recv() => {
                        tracing::info!("received SIGTERM, shutting down");
                    }
                }
            });
            server.await.context("server error")?;
        }
    }

    let open_conversations = state.conversations.read().await.len();
    tracing::info!(
        open_conversations,
        "voicebridge shut down; in-flight conversations are not torn down by process exit"
    );

    Ok(())
}
