//! The connection protocol, multiplexing channels over one transport.
//! <https://datatracker.ietf.org/doc/html/rfc4254>

use std::collections::{HashMap, VecDeque};
use std::fmt;

use skiff_format::numbers;
use skiff_transport::message::{
    ChannelClose, ChannelData, ChannelEof, ChannelExtendedData, ChannelFailure, ChannelOpen,
    ChannelOpenConfirmation, ChannelOpenFailure, ChannelRequest, ChannelRequestKind,
    ChannelSuccess, ChannelWindowAdjust, Message, RequestFailure,
};
use skiff_transport::{peer_error, Result};
use tracing::{debug, trace, warn};

pub use skiff_transport::message::{ChannelOpenKind, TcpForward};

/// The window we give the peer. It is topped up again once less than half of it is left.
pub const LOCAL_WINDOW_SIZE: u32 = 32768 * 32;
pub const LOCAL_MAX_PACKET_SIZE: u32 = 32768;
/// Opening more channels than this fails with `SSH_OPEN_RESOURCE_SHORTAGE`.
pub const MAX_CHANNELS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelNumber(pub u32);

impl fmt::Display for ChannelNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ChannelNumber {
    pub fn construct_op(self, kind: ChannelOperationKind) -> ChannelOperation {
        ChannelOperation { number: self, kind }
    }
}

/// The terminal requested with `pty-req`, kept up to date by `window-change`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Terminal {
    pub term: String,
    pub width_chars: u32,
    pub height_rows: u32,
    pub width_px: u32,
    pub height_px: u32,
    /// Encoded terminal modes.
    /// <https://datatracker.ietf.org/doc/html/rfc4254#section-8>
    pub modes: Vec<u8>,
}

impl Default for Terminal {
    fn default() -> Self {
        Self {
            term: "vt100".to_owned(),
            width_chars: 80,
            height_rows: 25,
            width_px: 640,
            height_px: 480,
            modes: Vec::new(),
        }
    }
}

/// What a session channel runs. Only one of these is allowed per channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Shell,
    Exec(Vec<u8>),
    Subsystem(String),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Shell => "shell",
            Self::Exec(_) => "exec",
            Self::Subsystem(_) => "subsystem",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelUpdate {
    pub number: ChannelNumber,
    pub kind: ChannelUpdateKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelUpdateKind {
    /// The peer opened a channel. Forwarding channels carry their addresses.
    Open(ChannelOpenKind),
    PtyRequested(Terminal),
    EnvReceived {
        name: String,
        value: Vec<u8>,
    },
    CommandOpened {
        command: Command,
        pty: Option<Terminal>,
    },
    WindowChanged(Terminal),
    Data {
        data: Vec<u8>,
    },
    ExtendedData {
        code: u32,
        data: Vec<u8>,
    },
    Eof,
    Closed,
    /// A request we did not accept, already answered with a failure if the peer wanted a reply.
    RequestRejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOperation {
    pub number: ChannelNumber,
    pub kind: ChannelOperationKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOperationKind {
    Data(Vec<u8>),
    ExtendedData(u32, Vec<u8>),
    Eof,
    /// A request without a reply, like `exit-status`.
    Request(ChannelRequestKind),
    Close,
}

struct Channel {
    peer_channel: u32,
    kind: ChannelOpenKind,
    /// Bytes the peer may still send us.
    our_window: u32,
    /// Bytes we may still send to the peer.
    peer_window: u32,
    peer_max_packet_size: u32,
    /// Operations waiting for the peer to grow its window, in order.
    pending: VecDeque<ChannelOperationKind>,

    peer_eof: bool,
    we_eof: bool,
    /// Whether our side has sent a close. The channel is removed once the peer's close arrives.
    we_closed: bool,

    terminal: Option<Terminal>,
    command: Option<Command>,
}

enum Reply {
    Success(Option<ChannelUpdateKind>),
    /// Vendor requests we know but do nothing for.
    Failure,
    Reject(String),
    Ignore,
}

impl Channel {
    fn start_command(&mut self, command: Command) -> Reply {
        if let Some(existing) = &self.command {
            warn!(
                existing = %existing.name(),
                requested = %command.name(),
                "Channel already runs a command"
            );
            return Reply::Reject(command.name().to_owned());
        }
        self.command = Some(command.clone());
        Reply::Success(Some(ChannelUpdateKind::CommandOpened {
            command,
            pty: self.terminal.clone(),
        }))
    }

    fn data_message(&self, code: Option<u32>, data: Vec<u8>) -> Message {
        match code {
            None => ChannelData {
                recipient_channel: self.peer_channel,
                data,
            }
            .into(),
            Some(data_type_code) => ChannelExtendedData {
                recipient_channel: self.peer_channel,
                data_type_code,
                data,
            }
            .into(),
        }
    }
}

/// The server side channel state of a connection.
pub struct ChannelsState {
    messages_to_send: VecDeque<Message>,
    channel_updates: VecDeque<ChannelUpdate>,
    channels: HashMap<ChannelNumber, Channel>,
    next_channel_id: u32,
}

impl ChannelsState {
    pub fn new() -> Self {
        Self {
            messages_to_send: VecDeque::new(),
            channel_updates: VecDeque::new(),
            channels: HashMap::new(),
            next_channel_id: 0,
        }
    }

    pub fn recv_message(&mut self, msg: Message) -> Result<()> {
        match msg {
            // <https://datatracker.ietf.org/doc/html/rfc4254#section-4>
            Message::GlobalRequest(req) => {
                debug!(request_name = %req.request_name, want_reply = %req.want_reply, "Received global request");
                if req.want_reply {
                    self.queue(RequestFailure {});
                }
            }
            Message::ChannelOpen(open) => self.recv_open(open)?,
            // <https://datatracker.ietf.org/doc/html/rfc4254#section-5.2>
            Message::ChannelWindowAdjust(adjust) => {
                let channel = self.channel(adjust.recipient_channel)?;
                channel.peer_window = channel.peer_window.saturating_add(adjust.bytes_to_add);
                trace!(
                    channel = %adjust.recipient_channel,
                    bytes_to_add = %adjust.bytes_to_add,
                    window = %channel.peer_window,
                    "Peer adjusted window"
                );
                self.flush_channel(ChannelNumber(adjust.recipient_channel));
            }
            Message::ChannelData(data) => {
                self.recv_data(data.recipient_channel, None, data.data)?
            }
            Message::ChannelExtendedData(data) => self.recv_data(
                data.recipient_channel,
                Some(data.data_type_code),
                data.data,
            )?,
            // <https://datatracker.ietf.org/doc/html/rfc4254#section-5.3>
            Message::ChannelEof(eof) => {
                let channel = self.channel(eof.recipient_channel)?;
                channel.peer_eof = true;
                debug!(channel = %eof.recipient_channel, "Received EOF");
                self.push_update(ChannelNumber(eof.recipient_channel), ChannelUpdateKind::Eof);
            }
            Message::ChannelClose(close) => {
                let number = ChannelNumber(close.recipient_channel);
                let Some(channel) = self.channels.remove(&number) else {
                    return Err(peer_error!("unknown channel: {number}"));
                };
                if !channel.we_closed {
                    self.queue(ChannelClose {
                        recipient_channel: channel.peer_channel,
                    });
                }
                debug!(%number, "Channel has been closed");
                self.push_update(number, ChannelUpdateKind::Closed);
            }
            Message::ChannelRequest(req) => self.recv_request(req)?,
            // We never send requests that want a reply.
            Message::ChannelSuccess(_) | Message::ChannelFailure(_) => {
                debug!("Ignoring unexpected channel request reply");
            }
            msg => {
                return Err(peer_error!(
                    "unexpected message in the connection protocol: {}",
                    numbers::packet_type_to_string(msg.message_type())
                ))
            }
        }
        Ok(())
    }

    // <https://datatracker.ietf.org/doc/html/rfc4254#section-5.1>
    fn recv_open(&mut self, open: ChannelOpen) -> Result<()> {
        let Some(kind) = open.parse_kind()? else {
            debug!(channel_type = %open.channel_type, "Rejecting unknown channel type");
            self.queue(ChannelOpenFailure {
                recipient_channel: open.sender_channel,
                reason_code: numbers::SSH_OPEN_UNKNOWN_CHANNEL_TYPE,
                description: format!("unknown channel type: {}", open.channel_type),
                language_tag: String::new(),
            });
            return Ok(());
        };

        // No data could ever be sent on such a channel.
        if open.maximum_packet_size == 0 {
            warn!(peer_channel = %open.sender_channel, "Rejecting channel with a maximum packet size of zero");
            self.queue(ChannelOpenFailure {
                recipient_channel: open.sender_channel,
                reason_code: numbers::SSH_OPEN_ADMINISTRATIVELY_PROHIBITED,
                description: "maximum packet size must not be zero".to_owned(),
                language_tag: String::new(),
            });
            return Ok(());
        }

        if self.channels.len() >= MAX_CHANNELS {
            warn!(limit = %MAX_CHANNELS, "Too many open channels, rejecting");
            self.queue(ChannelOpenFailure {
                recipient_channel: open.sender_channel,
                reason_code: numbers::SSH_OPEN_RESOURCE_SHORTAGE,
                description: "too many open channels".to_owned(),
                language_tag: String::new(),
            });
            return Ok(());
        }

        while self.channels.contains_key(&ChannelNumber(self.next_channel_id)) {
            self.next_channel_id = self.next_channel_id.wrapping_add(1);
        }
        let number = ChannelNumber(self.next_channel_id);
        self.next_channel_id = self.next_channel_id.wrapping_add(1);

        self.channels.insert(
            number,
            Channel {
                peer_channel: open.sender_channel,
                kind: kind.clone(),
                our_window: LOCAL_WINDOW_SIZE,
                peer_window: open.initial_window_size,
                peer_max_packet_size: open.maximum_packet_size,
                pending: VecDeque::new(),
                peer_eof: false,
                we_eof: false,
                we_closed: false,
                terminal: None,
                command: None,
            },
        );

        self.queue(ChannelOpenConfirmation {
            recipient_channel: open.sender_channel,
            sender_channel: number.0,
            initial_window_size: LOCAL_WINDOW_SIZE,
            maximum_packet_size: LOCAL_MAX_PACKET_SIZE,
            type_data: Vec::new(),
        });

        debug!(
            %number,
            channel_type = %kind.name(),
            peer_channel = %open.sender_channel,
            "Opened channel"
        );
        self.push_update(number, ChannelUpdateKind::Open(kind));
        Ok(())
    }

    fn recv_data(&mut self, number: u32, code: Option<u32>, data: Vec<u8>) -> Result<()> {
        let channel = self.channel(number)?;
        if channel.peer_eof {
            return Err(peer_error!("data on channel {number} after EOF"));
        }
        if data.len() > LOCAL_MAX_PACKET_SIZE as usize {
            return Err(peer_error!(
                "data packet of {} bytes on channel {number} exceeds the maximum packet size",
                data.len()
            ));
        }
        let len = data.len() as u32;
        if len > channel.our_window {
            return Err(peer_error!("peer exceeded the window of channel {number}"));
        }
        channel.our_window -= len;

        if channel.our_window < LOCAL_WINDOW_SIZE / 2 {
            let bytes_to_add = LOCAL_WINDOW_SIZE - channel.our_window;
            channel.our_window = LOCAL_WINDOW_SIZE;
            let recipient_channel = channel.peer_channel;
            self.queue(ChannelWindowAdjust {
                recipient_channel,
                bytes_to_add,
            });
        }

        let kind = match code {
            None => ChannelUpdateKind::Data { data },
            Some(code) => ChannelUpdateKind::ExtendedData { code, data },
        };
        self.push_update(ChannelNumber(number), kind);
        Ok(())
    }

    // <https://datatracker.ietf.org/doc/html/rfc4254#section-6>
    fn recv_request(&mut self, req: ChannelRequest) -> Result<()> {
        let number = ChannelNumber(req.recipient_channel);
        let want_reply = req.want_reply;
        let kind = req.parse_kind()?;

        let channel = self.channel(req.recipient_channel)?;
        let peer_channel = channel.peer_channel;
        if channel.we_closed {
            debug!(%number, request_type = %req.request_type, "Ignoring request on closing channel");
            return Ok(());
        }

        debug!(%number, request_type = %req.request_type, %want_reply, "Received channel request");

        let is_session = channel.kind == ChannelOpenKind::Session;
        let reply = match kind {
            ChannelRequestKind::PtyReq {
                term,
                width_chars,
                height_rows,
                width_px,
                height_px,
                term_modes,
            } if is_session => {
                let terminal = Terminal {
                    term,
                    width_chars,
                    height_rows,
                    width_px,
                    height_px,
                    modes: term_modes,
                };
                channel.terminal = Some(terminal.clone());
                Reply::Success(Some(ChannelUpdateKind::PtyRequested(terminal)))
            }
            ChannelRequestKind::Env { name, value } if is_session => {
                Reply::Success(Some(ChannelUpdateKind::EnvReceived { name, value }))
            }
            ChannelRequestKind::Shell if is_session => channel.start_command(Command::Shell),
            ChannelRequestKind::Exec { command } if is_session => {
                channel.start_command(Command::Exec(command))
            }
            ChannelRequestKind::Subsystem { name } if is_session => {
                channel.start_command(Command::Subsystem(name))
            }
            ChannelRequestKind::WindowChange {
                width_chars,
                height_rows,
                width_px,
                height_px,
            } if is_session => {
                let terminal = channel.terminal.get_or_insert_with(Terminal::default);
                terminal.width_chars = width_chars;
                terminal.height_rows = height_rows;
                terminal.width_px = width_px;
                terminal.height_px = height_px;
                Reply::Success(Some(ChannelUpdateKind::WindowChanged(terminal.clone())))
            }
            ChannelRequestKind::Other { request_type, .. } => match request_type.as_str() {
                // <https://tartarus.org/~simon/putty-snapshots/htmldoc/AppendixF.html>
                "simple@putty.projects.tartarus.org" => Reply::Success(None),
                "winadj@putty.projects.tartarus.org"
                | "keepalive@openssh.com"
                | "auth-agent-req@openssh.com" => Reply::Failure,
                "eow@openssh.com" => Reply::Ignore,
                _ => Reply::Reject(request_type.clone()),
            },
            kind => Reply::Reject(kind.name().to_owned()),
        };

        match reply {
            Reply::Success(update) => {
                if want_reply {
                    self.queue(ChannelSuccess {
                        recipient_channel: peer_channel,
                    });
                }
                if let Some(update) = update {
                    self.push_update(number, update);
                }
            }
            Reply::Failure => {
                if want_reply {
                    self.queue(ChannelFailure {
                        recipient_channel: peer_channel,
                    });
                }
            }
            Reply::Reject(request_type) => {
                warn!(%number, %request_type, "Rejected channel request");
                if want_reply {
                    self.queue(ChannelFailure {
                        recipient_channel: peer_channel,
                    });
                }
                self.push_update(number, ChannelUpdateKind::RequestRejected(request_type));
            }
            Reply::Ignore => {}
        }
        Ok(())
    }

    /// Queues an operation from the local side.
    /// Data is held back while the peer's window is exhausted, later operations wait behind it.
    pub fn do_operation(&mut self, op: ChannelOperation) {
        let Some(channel) = self.channels.get_mut(&op.number) else {
            debug!(number = %op.number, "Dropping operation on closed channel");
            return;
        };
        if channel.we_closed {
            debug!(number = %op.number, "Dropping operation after close");
            return;
        }
        channel.pending.push_back(op.kind);
        self.flush_channel(op.number);
    }

    fn flush_channel(&mut self, number: ChannelNumber) {
        let Some(channel) = self.channels.get_mut(&number) else {
            return;
        };

        while let Some(op) = channel.pending.pop_front() {
            let (code, data) = match op {
                ChannelOperationKind::Data(data) => (None, data),
                ChannelOperationKind::ExtendedData(code, data) => (Some(code), data),
                ChannelOperationKind::Eof => {
                    if !channel.we_eof {
                        channel.we_eof = true;
                        self.messages_to_send.push_back(
                            ChannelEof {
                                recipient_channel: channel.peer_channel,
                            }
                            .into(),
                        );
                    }
                    continue;
                }
                ChannelOperationKind::Request(kind) => {
                    self.messages_to_send
                        .push_back(ChannelRequest::new(channel.peer_channel, false, &kind).into());
                    continue;
                }
                ChannelOperationKind::Close => {
                    channel.we_closed = true;
                    channel.pending.clear();
                    self.messages_to_send.push_back(
                        ChannelClose {
                            recipient_channel: channel.peer_channel,
                        }
                        .into(),
                    );
                    debug!(%number, "Closing channel");
                    return;
                }
            };

            if channel.we_eof {
                debug!(%number, "Dropping data after EOF");
                continue;
            }

            let mut offset = 0;
            while offset < data.len() {
                let allowed = channel.peer_window.min(channel.peer_max_packet_size) as usize;
                if allowed == 0 {
                    break;
                }
                let end = data.len().min(offset + allowed);
                channel.peer_window -= (end - offset) as u32;
                let msg = channel.data_message(code, data[offset..end].to_vec());
                self.messages_to_send.push_back(msg);
                offset = end;
            }

            if offset < data.len() {
                let rest = data[offset..].to_vec();
                trace!(%number, waiting = %rest.len(), "Peer window exhausted");
                channel.pending.push_front(match code {
                    None => ChannelOperationKind::Data(rest),
                    Some(code) => ChannelOperationKind::ExtendedData(code, rest),
                });
                return;
            }
        }
    }

    /// Closes every channel, used when the connection is torn down.
    pub fn close_all(&mut self) {
        let mut numbers = self.channels.keys().copied().collect::<Vec<_>>();
        numbers.sort();
        for number in numbers {
            let Some(channel) = self.channels.remove(&number) else {
                continue;
            };
            if !channel.we_closed {
                self.queue(ChannelClose {
                    recipient_channel: channel.peer_channel,
                });
            }
            self.push_update(number, ChannelUpdateKind::Closed);
        }
    }

    pub fn next_msg_to_send(&mut self) -> Option<Message> {
        self.messages_to_send.pop_front()
    }

    pub fn next_channel_update(&mut self) -> Option<ChannelUpdate> {
        self.channel_updates.pop_front()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Whether operations on this channel are waiting for the peer's window.
    pub fn is_blocked(&self, number: ChannelNumber) -> bool {
        self.channels
            .get(&number)
            .is_some_and(|channel| !channel.pending.is_empty())
    }

    pub fn peer_window(&self, number: ChannelNumber) -> Option<u32> {
        self.channels.get(&number).map(|channel| channel.peer_window)
    }

    fn queue(&mut self, msg: impl Into<Message>) {
        self.messages_to_send.push_back(msg.into());
    }

    fn push_update(&mut self, number: ChannelNumber, kind: ChannelUpdateKind) {
        self.channel_updates
            .push_back(ChannelUpdate { number, kind });
    }

    fn channel(&mut self, number: u32) -> Result<&mut Channel> {
        self.channels
            .get_mut(&ChannelNumber(number))
            .ok_or_else(|| peer_error!("unknown channel: {number}"))
    }
}
