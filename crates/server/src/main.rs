mod channel;
mod cli;
mod config;
mod fanout;
mod ingress;
mod latch;
mod manager;
mod peer;
mod stream;
mod web;

use std::future::IntoFuture;
use std::sync::Arc;

use anyhow::{Context, Result};
use rtpcast_protocol::close_code;
use tokio::net::TcpListener;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::manager::PeerRegistry;
use crate::stream::Stream;
use crate::web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::parse_args()?;

    // -l sets the default level; RUST_LOG still wins when present
    let default_filter = cli::log_filter(&args.log_level)?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let mut config = config::load_config(args.config.as_deref())?;
    cli::apply_overrides(&mut config, &args);

    if let Err(issues) = config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                tracing::error!("{issue}");
            } else {
                tracing::warn!("{issue}");
            }
        }
        if has_errors {
            anyhow::bail!("configuration has fatal issues, fix the ERROR(s) above");
        }
    }

    // One stream per ingress address, bound up front: a bad address is a
    // startup failure, not something to limp along without.
    let mut streams = Vec::with_capacity(config.ingress.addrs.len());
    for addr in &config.ingress.addrs {
        let (stream, mut errors) = Stream::bind(
            addr,
            config.ingress.mtu,
            config.peer.queue_capacity,
            config.peer.codec.clone(),
        )
        .await?;
        let stream = Arc::new(stream);

        // An ingress read failure closes that stream only; peers and the
        // other streams keep running.
        let watched = Arc::clone(&stream);
        tokio::spawn(async move {
            if let Some(e) = errors.recv().await {
                tracing::error!(stream = %watched.key(), "ingress failed, stream is down: {e}");
                watched.close();
            }
        });

        streams.push(stream);
    }

    let state = Arc::new(AppState {
        registry: PeerRegistry::new(config.server.max_peers),
        streams: streams.clone(),
        config: config.clone(),
    });

    let app = web::build_router(Arc::clone(&state))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    let listener = TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind))?;

    tracing::info!(
        bind = %config.server.bind,
        streams = streams.len(),
        max_peers = config.server.max_peers,
        "rtpcast relay ready"
    );

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;

    tokio::select! {
        result = axum::serve(listener, app).into_future() => {
            result.context("server error")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }

    // Graceful teardown: every peer gets a close frame, bounded by the
    // disconnect timeout, then the ingress sockets go down.
    let peers = state.registry.drain();
    tracing::info!(count = peers.len(), "closing peers");
    for handle in &peers {
        handle.close(close_code::GOING_AWAY, "server shutting down");
    }
    let deadline = config.channel.disconnect_timeout();
    for handle in peers {
        if tokio::time::timeout(deadline, handle.done()).await.is_err() {
            tracing::warn!(id = %handle.id(), "peer did not close before the deadline");
        }
    }

    for stream in &streams {
        stream.close();
    }

    tracing::info!("rtpcast relay shut down cleanly");
    Ok(())
}
