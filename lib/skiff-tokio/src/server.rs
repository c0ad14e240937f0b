use std::{
    collections::{HashMap, HashSet, VecDeque},
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    time::Duration,
};

use eyre::{eyre, OptionExt, WrapErr};
use futures::future::BoxFuture;
use skiff_connection::{ChannelNumber, ChannelOperation};
use skiff_protocol::{
    auth::{AuthConfig, AuthOption, ServerRequest, UserAuthArgs},
    ChannelUpdateKind, Session, SshStatus, ThreadRngRand,
};
use skiff_transport::server::ServerConfig;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tracing::{debug, info};

use crate::{Channel, ChannelState};

pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

pub struct ServerListener {
    listener: TcpListener,
    auth: ServerAuth,
    transport_config: ServerConfig,
    inactivity_timeout: Duration,
}

pub struct ServerConnection<S> {
    stream: Pin<Box<S>>,
    peer_addr: SocketAddr,
    buf: [u8; 1024],
    inactivity_timeout: Duration,

    session: Session,
    operations_send: tokio::sync::mpsc::Sender<Operation>,
    operations_recv: tokio::sync::mpsc::Receiver<Operation>,

    /// Cloned and passed on to channels.
    channel_ops_send: tokio::sync::mpsc::Sender<ChannelOperation>,
    channel_ops_recv: tokio::sync::mpsc::Receiver<ChannelOperation>,

    channels: HashMap<ChannelNumber, ChannelState>,

    /// New channels opened by the peer.
    new_channels: VecDeque<Channel>,

    auth: ServerAuth,
}

enum Operation {
    VerifyPassword(eyre::Result<()>),
    VerifyPubkey(eyre::Result<()>),
}

pub type AuthVerifier =
    Arc<dyn Fn(UserAuthArgs) -> BoxFuture<'static, eyre::Result<()>> + Send + Sync>;

/// Authorizers for the authentication methods the server offers.
/// A method is offered if its authorizer is set, `Ok(())` accepts the attempt.
#[derive(Clone)]
pub struct ServerAuth {
    pub verify_password: Option<AuthVerifier>,
    /// Only called for keys whose signature has already been verified,
    /// or to check whether a key would be accepted at all.
    pub verify_pubkey: Option<AuthVerifier>,
    /// Sent before the first authentication reply.
    pub banner: Option<String>,
}
/// Runs an authorizer in its own task. A panicking authorizer rejects the attempt.
fn spawn_verifier(
    verify: AuthVerifier,
    args: UserAuthArgs,
    send: tokio::sync::mpsc::Sender<Operation>,
    operation: fn(eyre::Result<()>) -> Operation,
) {
    tokio::spawn(async move {
        let result = match tokio::spawn(verify(args)).await {
            Ok(result) => result,
            Err(err) => Err(eyre!("authorizer failed: {err}")),
        };
        let _ = send.send(operation(result)).await;
    });
}

fn _assert_send_sync() {
    fn send<T: Send + Sync>() {}
    send::<ServerAuth>();
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The connection is over, either orderly or because the client misbehaved.
    #[error("{0}")]
    SshStatus(SshStatus),
    #[error("connection was inactive for {0:?}")]
    Timeout(Duration),
    #[error("no authentication method configured")]
    NoAuthMethods,
    #[error("{0:#}")]
    ServerError(eyre::Report),
}
impl From<eyre::Report> for Error {
    fn from(value: eyre::Report) -> Self {
        Self::ServerError(value)
    }
}

impl ServerListener {
    pub fn new(listener: TcpListener, auth: ServerAuth, transport_config: ServerConfig) -> Self {
        Self {
            listener,
            auth,
            transport_config,
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
        }
    }

    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    pub async fn accept(&mut self) -> eyre::Result<ServerConnection<TcpStream>> {
        let (conn, peer_addr) = self.listener.accept().await?;

        let conn = ServerConnection::new(
            conn,
            peer_addr,
            self.auth.clone(),
            self.transport_config.clone(),
        )?;
        Ok(conn.with_inactivity_timeout(self.inactivity_timeout))
    }
}

impl<S: AsyncRead + AsyncWrite> ServerConnection<S> {
    pub fn new(
        stream: S,
        peer_addr: SocketAddr,
        auth: ServerAuth,
        transport_config: ServerConfig,
    ) -> Result<Self, Error> {
        let (operations_send, operations_recv) = tokio::sync::mpsc::channel(15);
        let (channel_ops_send, channel_ops_recv) = tokio::sync::mpsc::channel(15);

        let mut options = HashSet::new();
        if auth.verify_password.is_some() {
            options.insert(AuthOption::Password);
        }
        if auth.verify_pubkey.is_some() {
            options.insert(AuthOption::PublicKey);
        }
        if options.is_empty() {
            return Err(Error::NoAuthMethods);
        }

        let session = Session::new(
            skiff_transport::server::ServerConnection::new(ThreadRngRand, transport_config),
            AuthConfig {
                options,
                banner: auth.banner.clone(),
            },
        );

        Ok(Self {
            stream: Box::pin(stream),
            peer_addr,
            buf: [0; 1024],
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            session,
            operations_send,
            operations_recv,
            channel_ops_send,
            channel_ops_recv,
            channels: HashMap::new(),
            new_channels: VecDeque::new(),
            auth,
        })
    }

    /// A read or write that makes no progress for this long ends the connection.
    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// Executes one loop iteration of the main loop.
    /// Returns [`SshStatus::Disconnect`] once the connection has ended orderly.
    // IMPORTANT: no operations on this struct should ever block the main loop, except this one.
    pub async fn progress(&mut self) -> Result<(), Error> {
        while let Some(req) = self.session.next_auth_request() {
            let send = self.operations_send.clone();
            match req {
                ServerRequest::VerifyPassword(args) => {
                    let verify = self
                        .auth
                        .verify_password
                        .clone()
                        .ok_or_eyre("password auth not supported")?;
                    spawn_verifier(verify, args, send, Operation::VerifyPassword);
                }
                ServerRequest::VerifyPubkey(args) => {
                    let verify = self
                        .auth
                        .verify_pubkey
                        .clone()
                        .ok_or_eyre("pubkey auth not supported")?;
                    spawn_verifier(verify, args, send, Operation::VerifyPubkey);
                }
            }
        }

        while let Some(update) = self.session.next_channel_update() {
            match update.kind {
                ChannelUpdateKind::Open(kind) => {
                    let (updates_send, updates_recv) = tokio::sync::mpsc::unbounded_channel();
                    let (writable_send, writable_recv) = tokio::sync::watch::channel(true);

                    let old = self.channels.insert(
                        update.number,
                        ChannelState {
                            updates_send,
                            writable: writable_send,
                        },
                    );
                    if old.is_some() {
                        return Err(Error::ServerError(eyre!(
                            "attemping to open channel twice: {}",
                            update.number
                        )));
                    }

                    self.new_channels.push_back(Channel {
                        number: update.number,
                        updates_recv,
                        ops_send: self.channel_ops_send.clone(),
                        writable: writable_recv,
                        kind,
                    });
                }
                kind => {
                    let closed = matches!(kind, ChannelUpdateKind::Closed);
                    let channel = self
                        .channels
                        .get(&update.number)
                        .ok_or_eyre("unknown channel")?;
                    // The channel handle may already be gone.
                    let _ = channel.updates_send.send(kind);
                    if closed {
                        self.channels.remove(&update.number);
                    }
                }
            }
        }

        // Make sure that we send all queued messages before going into the select, waiting for things to happen.
        self.send_off_data().await?;

        if self.session.is_closed() {
            return Err(Error::SshStatus(SshStatus::Disconnect));
        }

        tokio::select! {
            read = self.stream.read(&mut self.buf) => {
                let read = read.wrap_err("reading from connection")?;
                if read == 0 {
                    info!("Did not read any bytes from TCP stream, EOF");
                    return Err(Error::SshStatus(SshStatus::Disconnect));
                }
                if let Err(err) = self.session.recv_bytes(&self.buf[..read]) {
                    // Flushes the DISCONNECT queued for protocol errors.
                    let _ = self.send_off_data().await;
                    return Err(Error::SshStatus(err));
                }
            }
            channel_op = self.channel_ops_recv.recv() => {
                if let Some(channel_op) = channel_op {
                    self.session.do_operation(channel_op);
                }
            }
            op = self.operations_recv.recv() => {
                match op {
                    Some(Operation::VerifyPassword(result)) => {
                        if let Err(err) = &result {
                            debug!(?err, "Password rejected");
                        }
                        self.session.auth_result(result.is_ok());
                    }
                    Some(Operation::VerifyPubkey(result)) => {
                        if let Err(err) = &result {
                            debug!(?err, "Public key rejected");
                        }
                        self.session.auth_result(result.is_ok());
                    }
                    None => {}
                }
                self.send_off_data().await?;
            }
            _ = tokio::time::sleep(self.inactivity_timeout) => {
                info!(timeout = ?self.inactivity_timeout, "Closing inactive connection");
                return Err(Error::Timeout(self.inactivity_timeout));
            }
        }

        Ok(())
    }

    /// Sends a DISCONNECT, the next call to [`Self::progress`] reports the end of the connection.
    pub async fn disconnect(&mut self, reason_code: u32, description: &str) -> Result<(), Error> {
        self.session.disconnect(reason_code, description);
        self.send_off_data().await
    }

    async fn send_off_data(&mut self) -> Result<(), Error> {
        self.session.progress();
        while let Some(msg) = self.session.next_msg_to_send() {
            tokio::time::timeout(self.inactivity_timeout, self.stream.write_all(&msg.to_bytes()))
                .await
                .map_err(|_| Error::Timeout(self.inactivity_timeout))?
                .wrap_err("writing response")?;
        }
        self.update_writable();
        Ok(())
    }

    fn update_writable(&mut self) {
        let Some(state) = self.session.channels() else {
            return;
        };
        for (number, channel) in &self.channels {
            let writable = !state.is_blocked(*number);
            channel.writable.send_if_modified(|current| {
                let changed = *current != writable;
                *current = writable;
                changed
            });
        }
    }

    pub fn next_new_channel(&mut self) -> Option<Channel> {
        self.new_channels.pop_front()
    }
}
