mod app;
mod auth;
mod config;
mod host_keys;

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use config::{Config, LogFormat};
use eyre::Context;
use skiff_format::numbers;
use skiff_protocol::{SessionEvent, SshStatus};
use skiff_tokio::server::{Error, ServerConnection, ServerListener};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, info_span, Instrument};
use tracing_subscriber::EnvFilter;

use crate::auth::Authorizer;
use crate::host_keys::FileHostKeys;

#[derive(clap::Parser)]
pub struct Args {
    /// The path to the config file
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args = Args::parse();

    let config = Config::load(&args)?;

    setup_tracing(&config);

    let host_keys = skiff_tokio::load_host_keys(&FileHostKeys::new(config.host_keys.clone()))
        .await
        .wrap_err("loading host keys")?;

    let authorizer = Arc::new(Authorizer::new(config.users, config.auth.password_login)?);

    let transport_config = skiff_transport::server::ServerConfig {
        server_identification: config.server.identification.clone(),
        host_keys,
        rekey_threshold: config.server.rekey_threshold_bytes,
    };

    let addr: SocketAddr = SocketAddr::new(config.net.ip, config.net.port);
    info!(%addr, "Starting server");

    let listener = TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("trying to listen on {addr}"))?;

    let mut listener = ServerListener::new(
        listener,
        authorizer.server_auth(config.auth.banner.clone()),
        transport_config,
    )
    .with_inactivity_timeout(Duration::from_secs(config.server.inactivity_timeout_secs));

    loop {
        let conn = match listener.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                error!(?err, "Failed to accept connection");
                continue;
            }
        };

        let span = info_span!("connection", addr = %conn.peer_addr());
        tokio::spawn(handle_connection(conn).instrument(span));
    }
}

async fn handle_connection(mut conn: ServerConnection<TcpStream>) {
    info!("Received a new connection");

    conn.session_mut().subscribe(|event| match event {
        SessionEvent::KeysExchanged(info) => debug!(
            kex = %info.negotiated.kex.name(),
            host_key = %info.negotiated.host_key,
            "Keys exchanged"
        ),
        SessionEvent::ServiceRegistered(name) => debug!(%name, "Service started"),
        SessionEvent::Authenticated(args) => info!(
            user = %args.username,
            method = %args.method().name(),
            "User logged in"
        ),
        SessionEvent::Disconnected => debug!("Session ended"),
    });

    loop {
        match conn.progress().await {
            Ok(()) => {}
            Err(Error::SshStatus(SshStatus::Disconnect)) => break,
            Err(Error::SshStatus(SshStatus::PeerError { reason, message })) => {
                info!(
                    reason = %numbers::disconnect_reason_to_string(reason),
                    %message,
                    "Closing connection after client error"
                );
                break;
            }
            Err(Error::Timeout(timeout)) => {
                info!(?timeout, "Connection timed out");
                break;
            }
            Err(err) => {
                error!(?err, "error handling connection");
                break;
            }
        }

        while let Some(channel) = conn.next_new_channel() {
            tokio::spawn(
                async move {
                    if let Err(err) = app::run(channel).await {
                        debug!(?err, "Channel ended");
                    }
                }
                .in_current_span(),
            );
        }
    }

    info!("Finished connection");
}

fn setup_tracing(config: &Config) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    match config.log_format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(env_filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init(),
    }
}
