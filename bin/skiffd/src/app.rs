//! A tiny application behind session channels: everything sent to a shell is echoed back.

use eyre::Result;
use skiff_connection::{ChannelOpenKind, ChannelOperationKind, Command};
use skiff_format::numbers;
use skiff_protocol::ChannelUpdateKind;
use skiff_tokio::Channel;
use skiff_transport::message::ChannelRequestKind;
use tracing::{debug, info};

pub async fn run(mut channel: Channel) -> Result<()> {
    if !matches!(channel.kind(), ChannelOpenKind::Session) {
        debug!(number = %channel.number(), "Closing forwarding channel, forwarding is not supported");
        channel.send(ChannelOperationKind::Close).await?;
        return Ok(());
    }

    let mut pty = false;
    loop {
        match channel.next_update().await? {
            ChannelUpdateKind::CommandOpened { command, pty: terminal } => {
                info!(number = %channel.number(), command = %command.name(), pty = %terminal.is_some(), "Command started");
                pty = terminal.is_some();
                match command {
                    Command::Shell => {
                        channel
                            .send(ChannelOperationKind::Data(
                                b"welcome to skiff, everything you type is sent back\r\n".to_vec(),
                            ))
                            .await?;
                    }
                    Command::Exec(mut command) => {
                        command.push(b'\n');
                        channel.send(ChannelOperationKind::Data(command)).await?;
                        exit(&mut channel, 0).await?;
                    }
                    Command::Subsystem(name) => {
                        channel
                            .send(ChannelOperationKind::ExtendedData(
                                numbers::SSH_EXTENDED_DATA_STDERR,
                                format!("unknown subsystem: {name}\n").into_bytes(),
                            ))
                            .await?;
                        exit(&mut channel, 1).await?;
                    }
                }
            }
            ChannelUpdateKind::Data { data } => {
                let data = if pty { translate_newlines(&data) } else { data };
                channel.send(ChannelOperationKind::Data(data)).await?;
            }
            ChannelUpdateKind::Eof => exit(&mut channel, 0).await?,
            ChannelUpdateKind::Closed => return Ok(()),
            _ => {}
        }
    }
}

async fn exit(channel: &mut Channel, status: u32) -> Result<()> {
    channel
        .send(ChannelOperationKind::Request(ChannelRequestKind::ExitStatus {
            status,
        }))
        .await?;
    channel.send(ChannelOperationKind::Eof).await?;
    channel.send(ChannelOperationKind::Close).await
}

/// Terminals send a lone carriage return for enter.
fn translate_newlines(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &b in data {
        if b == b'\r' {
            out.extend_from_slice(b"\r\n");
        } else {
            out.push(b);
        }
    }
    out
}
