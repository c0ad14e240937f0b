pub mod server;

use std::collections::HashMap;

use eyre::{eyre, OptionExt, Result, WrapErr};
use futures::future::BoxFuture;
use skiff_connection::{ChannelNumber, ChannelOpenKind, ChannelOperation, ChannelOperationKind};
use skiff_keys::host_keys::HostKeySet;
use skiff_protocol::ChannelUpdateKind;
use tracing::info;

/// A channel opened by the client.
pub struct Channel {
    number: ChannelNumber,
    updates_recv: tokio::sync::mpsc::UnboundedReceiver<ChannelUpdateKind>,
    ops_send: tokio::sync::mpsc::Sender<ChannelOperation>,
    /// `false` while data is waiting for the client's window.
    writable: tokio::sync::watch::Receiver<bool>,
    kind: ChannelOpenKind,
}

impl Channel {
    /// Sending data waits until earlier data has fit into the client's window.
    pub async fn send(&mut self, op: ChannelOperationKind) -> Result<()> {
        if matches!(
            op,
            ChannelOperationKind::Data(_) | ChannelOperationKind::ExtendedData(..)
        ) {
            self.writable
                .wait_for(|writable| *writable)
                .await
                .map_err(|_| eyre!("connection has been closed"))?;
        }
        self.ops_send
            .send(self.number.construct_op(op))
            .await
            .map_err(Into::into)
    }

    pub async fn next_update(&mut self) -> Result<ChannelUpdateKind> {
        self.updates_recv
            .recv()
            .await
            .ok_or_eyre("channel has been closed")
    }

    pub fn number(&self) -> ChannelNumber {
        self.number
    }

    pub fn kind(&self) -> &ChannelOpenKind {
        &self.kind
    }
}

struct ChannelState {
    updates_send: tokio::sync::mpsc::UnboundedSender<ChannelUpdateKind>,
    writable: tokio::sync::watch::Sender<bool>,
}

/// Hands out host keys as a map of algorithm name to base64 encoded private key.
pub trait HostKeyProvider: Send + Sync {
    fn host_keys(&self) -> BoxFuture<'_, Result<HashMap<String, String>>>;
}

pub async fn load_host_keys(provider: &dyn HostKeyProvider) -> Result<HostKeySet> {
    let keys = provider
        .host_keys()
        .await
        .wrap_err("fetching host keys")?;
    let set = HostKeySet::from_base64_map(&keys)?;
    if set.is_empty() {
        return Err(eyre!("no host keys found"));
    }
    for alg in set.algorithms() {
        info!(%alg, "Loaded host key");
    }
    Ok(set)
}
