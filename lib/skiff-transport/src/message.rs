//! Typed SSH messages.
//!
//! Every message type is a struct that knows how to decode itself from a payload
//! (after the message type byte) and encode itself back. [`Message`] is the tagged union
//! over all of them, decoded through a table indexed by the message type byte.

use skiff_format::numbers;
use skiff_format::{NameList, ParseError, Reader, Writer};

pub trait SshMessage: Sized {
    const TYPE: u8;

    /// Decodes the fields, the message type byte has already been consumed.
    fn decode(r: &mut Reader<'_>) -> skiff_format::Result<Self>;
    fn encode_fields(&self, w: &mut Writer);

    /// Writes the message type byte followed by the fields.
    fn encode(&self, w: &mut Writer) {
        w.u8(Self::TYPE);
        self.encode_fields(w);
    }

    fn to_payload(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.encode(&mut w);
        w.finish()
    }
}

fn read_name_list(r: &mut Reader<'_>) -> skiff_format::Result<Vec<String>> {
    Ok(r.name_list()?.to_vec())
}

fn write_name_list(w: &mut Writer, list: &[String]) {
    w.name_list(NameList::multi(&list.join(",")));
}

fn read_rest(r: &mut Reader<'_>) -> skiff_format::Result<Vec<u8>> {
    let len = r.remaining().len();
    Ok(r.slice(len)?.to_vec())
}

/// Declares message structs with their fields, read and written in declaration order.
macro_rules! message_structs {
    ($(
        $(#[$meta:meta])*
        struct $name:ident = $msg_type:ident {
            $($field:ident: $ty:ty => $read:ident / $write:ident),* $(,)?
        }
    )*) => {$(
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name {
            $(pub $field: $ty,)*
        }

        impl SshMessage for $name {
            const TYPE: u8 = numbers::$msg_type;

            #[allow(unused_variables)]
            fn decode(r: &mut Reader<'_>) -> skiff_format::Result<Self> {
                Ok(Self {
                    $($field: codec::$read(r)?,)*
                })
            }

            #[allow(unused_variables)]
            fn encode_fields(&self, w: &mut Writer) {
                $(codec::$write(w, &self.$field);)*
            }
        }
    )*};
}

/// Field codecs for the struct macro, named after the RFC 4251 data types.
mod codec {
    use skiff_format::{Reader, Result, Writer};

    pub(super) fn u32(r: &mut Reader<'_>) -> Result<u32> {
        r.u32()
    }
    pub(super) fn w_u32(w: &mut Writer, v: &u32) {
        w.u32(*v);
    }
    pub(super) fn bool(r: &mut Reader<'_>) -> Result<bool> {
        r.bool()
    }
    pub(super) fn w_bool(w: &mut Writer, v: &bool) {
        w.bool(*v);
    }
    pub(super) fn string(r: &mut Reader<'_>) -> Result<Vec<u8>> {
        Ok(r.string()?.to_vec())
    }
    pub(super) fn w_string(w: &mut Writer, v: &[u8]) {
        w.string(v);
    }
    pub(super) fn utf8(r: &mut Reader<'_>) -> Result<String> {
        Ok(r.utf8_string()?.to_owned())
    }
    pub(super) fn ascii(r: &mut Reader<'_>) -> Result<String> {
        Ok(r.ascii_string()?.to_owned())
    }
    pub(super) fn w_str(w: &mut Writer, v: &str) {
        w.string(v.as_bytes());
    }
    pub(super) fn mpint(r: &mut Reader<'_>) -> Result<Vec<u8>> {
        Ok(r.mpint()?.to_vec())
    }
    pub(super) fn w_mpint(w: &mut Writer, v: &[u8]) {
        w.mpint(v);
    }
    pub(super) fn name_list(r: &mut Reader<'_>) -> Result<Vec<String>> {
        super::read_name_list(r)
    }
    pub(super) fn w_name_list(w: &mut Writer, v: &[String]) {
        super::write_name_list(w, v);
    }
    pub(super) fn rest(r: &mut Reader<'_>) -> Result<Vec<u8>> {
        super::read_rest(r)
    }
    pub(super) fn w_raw(w: &mut Writer, v: &[u8]) {
        w.raw(v);
    }
}

message_structs! {
    // <https://datatracker.ietf.org/doc/html/rfc4253#section-11>
    struct Disconnect = SSH_MSG_DISCONNECT {
        reason_code: u32 => u32 / w_u32,
        description: String => utf8 / w_str,
        language_tag: String => ascii / w_str,
    }
    struct Ignore = SSH_MSG_IGNORE {
        data: Vec<u8> => string / w_string,
    }
    struct Unimplemented = SSH_MSG_UNIMPLEMENTED {
        sequence_number: u32 => u32 / w_u32,
    }
    struct DebugMessage = SSH_MSG_DEBUG {
        always_display: bool => bool / w_bool,
        message: String => utf8 / w_str,
        language_tag: String => ascii / w_str,
    }
    struct ServiceRequest = SSH_MSG_SERVICE_REQUEST {
        service_name: String => ascii / w_str,
    }
    struct ServiceAccept = SSH_MSG_SERVICE_ACCEPT {
        service_name: String => ascii / w_str,
    }
    struct NewKeys = SSH_MSG_NEWKEYS {}
    // <https://datatracker.ietf.org/doc/html/rfc4253#section-8>
    struct KexdhInit = SSH_MSG_KEXDH_INIT {
        e: Vec<u8> => mpint / w_mpint,
    }
    struct KexdhReply = SSH_MSG_KEXDH_REPLY {
        host_key: Vec<u8> => string / w_string,
        f: Vec<u8> => mpint / w_mpint,
        signature: Vec<u8> => string / w_string,
    }

    // <https://datatracker.ietf.org/doc/html/rfc4252#section-5>
    /// The method specific fields are kept raw, see [`UserauthRequest::method`].
    struct UserauthRequest = SSH_MSG_USERAUTH_REQUEST {
        username: String => utf8 / w_str,
        service_name: String => ascii / w_str,
        method_name: String => ascii / w_str,
        method_data: Vec<u8> => rest / w_raw,
    }
    struct UserauthFailure = SSH_MSG_USERAUTH_FAILURE {
        methods: Vec<String> => name_list / w_name_list,
        partial_success: bool => bool / w_bool,
    }
    struct UserauthSuccess = SSH_MSG_USERAUTH_SUCCESS {}
    struct UserauthBanner = SSH_MSG_USERAUTH_BANNER {
        message: String => utf8 / w_str,
        language_tag: String => ascii / w_str,
    }
    struct UserauthPkOk = SSH_MSG_USERAUTH_PK_OK {
        algorithm: String => ascii / w_str,
        key_blob: Vec<u8> => string / w_string,
    }

    // <https://datatracker.ietf.org/doc/html/rfc4254>
    struct GlobalRequest = SSH_MSG_GLOBAL_REQUEST {
        request_name: String => ascii / w_str,
        want_reply: bool => bool / w_bool,
        data: Vec<u8> => rest / w_raw,
    }
    struct RequestSuccess = SSH_MSG_REQUEST_SUCCESS {
        data: Vec<u8> => rest / w_raw,
    }
    struct RequestFailure = SSH_MSG_REQUEST_FAILURE {}
    /// The channel type specific fields are kept raw, see [`ChannelOpen::parse_kind`].
    struct ChannelOpen = SSH_MSG_CHANNEL_OPEN {
        channel_type: String => ascii / w_str,
        sender_channel: u32 => u32 / w_u32,
        initial_window_size: u32 => u32 / w_u32,
        maximum_packet_size: u32 => u32 / w_u32,
        type_data: Vec<u8> => rest / w_raw,
    }
    struct ChannelOpenConfirmation = SSH_MSG_CHANNEL_OPEN_CONFIRMATION {
        recipient_channel: u32 => u32 / w_u32,
        sender_channel: u32 => u32 / w_u32,
        initial_window_size: u32 => u32 / w_u32,
        maximum_packet_size: u32 => u32 / w_u32,
        type_data: Vec<u8> => rest / w_raw,
    }
    struct ChannelOpenFailure = SSH_MSG_CHANNEL_OPEN_FAILURE {
        recipient_channel: u32 => u32 / w_u32,
        reason_code: u32 => u32 / w_u32,
        description: String => utf8 / w_str,
        language_tag: String => ascii / w_str,
    }
    struct ChannelWindowAdjust = SSH_MSG_CHANNEL_WINDOW_ADJUST {
        recipient_channel: u32 => u32 / w_u32,
        bytes_to_add: u32 => u32 / w_u32,
    }
    struct ChannelData = SSH_MSG_CHANNEL_DATA {
        recipient_channel: u32 => u32 / w_u32,
        data: Vec<u8> => string / w_string,
    }
    struct ChannelExtendedData = SSH_MSG_CHANNEL_EXTENDED_DATA {
        recipient_channel: u32 => u32 / w_u32,
        data_type_code: u32 => u32 / w_u32,
        data: Vec<u8> => string / w_string,
    }
    struct ChannelEof = SSH_MSG_CHANNEL_EOF {
        recipient_channel: u32 => u32 / w_u32,
    }
    struct ChannelClose = SSH_MSG_CHANNEL_CLOSE {
        recipient_channel: u32 => u32 / w_u32,
    }
    /// The request specific fields are kept raw, see [`ChannelRequest::parse_kind`].
    struct ChannelRequest = SSH_MSG_CHANNEL_REQUEST {
        recipient_channel: u32 => u32 / w_u32,
        request_type: String => ascii / w_str,
        want_reply: bool => bool / w_bool,
        data: Vec<u8> => rest / w_raw,
    }
    struct ChannelSuccess = SSH_MSG_CHANNEL_SUCCESS {
        recipient_channel: u32 => u32 / w_u32,
    }
    struct ChannelFailure = SSH_MSG_CHANNEL_FAILURE {
        recipient_channel: u32 => u32 / w_u32,
    }
}

/// <https://datatracker.ietf.org/doc/html/rfc4253#section-7.1>
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    pub cookie: [u8; 16],
    pub kex_algorithms: Vec<String>,
    pub server_host_key_algorithms: Vec<String>,
    pub encryption_algorithms_client_to_server: Vec<String>,
    pub encryption_algorithms_server_to_client: Vec<String>,
    pub mac_algorithms_client_to_server: Vec<String>,
    pub mac_algorithms_server_to_client: Vec<String>,
    pub compression_algorithms_client_to_server: Vec<String>,
    pub compression_algorithms_server_to_client: Vec<String>,
    pub languages_client_to_server: Vec<String>,
    pub languages_server_to_client: Vec<String>,
    pub first_kex_packet_follows: bool,
    pub reserved: u32,
}

impl SshMessage for KexInit {
    const TYPE: u8 = numbers::SSH_MSG_KEXINIT;

    fn decode(r: &mut Reader<'_>) -> skiff_format::Result<Self> {
        Ok(Self {
            cookie: r.array()?,
            kex_algorithms: read_name_list(r)?,
            server_host_key_algorithms: read_name_list(r)?,
            encryption_algorithms_client_to_server: read_name_list(r)?,
            encryption_algorithms_server_to_client: read_name_list(r)?,
            mac_algorithms_client_to_server: read_name_list(r)?,
            mac_algorithms_server_to_client: read_name_list(r)?,
            compression_algorithms_client_to_server: read_name_list(r)?,
            compression_algorithms_server_to_client: read_name_list(r)?,
            languages_client_to_server: read_name_list(r)?,
            languages_server_to_client: read_name_list(r)?,
            first_kex_packet_follows: r.bool()?,
            reserved: r.u32()?,
        })
    }

    fn encode_fields(&self, w: &mut Writer) {
        w.array(self.cookie);
        write_name_list(w, &self.kex_algorithms);
        write_name_list(w, &self.server_host_key_algorithms);
        write_name_list(w, &self.encryption_algorithms_client_to_server);
        write_name_list(w, &self.encryption_algorithms_server_to_client);
        write_name_list(w, &self.mac_algorithms_client_to_server);
        write_name_list(w, &self.mac_algorithms_server_to_client);
        write_name_list(w, &self.compression_algorithms_client_to_server);
        write_name_list(w, &self.compression_algorithms_server_to_client);
        write_name_list(w, &self.languages_client_to_server);
        write_name_list(w, &self.languages_server_to_client);
        w.bool(self.first_kex_packet_follows);
        w.u32(self.reserved);
    }
}

/// A message type we do not know.
/// It is answered with `SSH_MSG_UNIMPLEMENTED` carrying its sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownMessage {
    pub message_type: u8,
    pub sequence_number: u32,
}

type DecodeFn = fn(&mut Reader<'_>) -> skiff_format::Result<Message>;

fn decode_as<M: SshMessage + Into<Message>>(r: &mut Reader<'_>) -> skiff_format::Result<Message> {
    M::decode(r).map(Into::into)
}

macro_rules! messages {
    ($($variant:ident,)*) => {
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub enum Message {
            $($variant($variant),)*
            Unknown(UnknownMessage),
        }

        $(
            impl From<$variant> for Message {
                fn from(msg: $variant) -> Self {
                    Self::$variant(msg)
                }
            }
        )*

        impl Message {
            pub fn message_type(&self) -> u8 {
                match self {
                    $(Self::$variant(_) => <$variant as SshMessage>::TYPE,)*
                    Self::Unknown(msg) => msg.message_type,
                }
            }

            /// The encoded payload including the message type byte.
            /// Unknown messages have no payload of their own and encode as just their type byte.
            pub fn to_payload(&self) -> Vec<u8> {
                match self {
                    $(Self::$variant(msg) => msg.to_payload(),)*
                    Self::Unknown(msg) => vec![msg.message_type],
                }
            }
        }

        static DECODERS: [Option<DecodeFn>; 256] = {
            let mut table: [Option<DecodeFn>; 256] = [None; 256];
            $(
                table[<$variant as SshMessage>::TYPE as usize] = Some(decode_as::<$variant> as DecodeFn);
            )*
            table
        };
    };
}

messages! {
    Disconnect,
    Ignore,
    Unimplemented,
    DebugMessage,
    ServiceRequest,
    ServiceAccept,
    KexInit,
    NewKeys,
    KexdhInit,
    KexdhReply,
    UserauthRequest,
    UserauthFailure,
    UserauthSuccess,
    UserauthBanner,
    UserauthPkOk,
    GlobalRequest,
    RequestSuccess,
    RequestFailure,
    ChannelOpen,
    ChannelOpenConfirmation,
    ChannelOpenFailure,
    ChannelWindowAdjust,
    ChannelData,
    ChannelExtendedData,
    ChannelEof,
    ChannelClose,
    ChannelRequest,
    ChannelSuccess,
    ChannelFailure,
}

impl Message {
    /// Decodes a full payload (starting with the message type byte).
    /// Types without a decoder become [`Message::Unknown`], trailing bytes after a known message are an error.
    pub fn decode(payload: &[u8], sequence_number: u32) -> skiff_format::Result<Self> {
        let Some((&message_type, rest)) = payload.split_first() else {
            return Err(ParseError(format!("empty payload")));
        };
        let Some(decode) = DECODERS[message_type as usize] else {
            return Ok(Self::Unknown(UnknownMessage {
                message_type,
                sequence_number,
            }));
        };
        let mut r = Reader::new(rest);
        let msg = decode(&mut r)?;
        r.finish()?;
        Ok(msg)
    }
}

// ----- Two-phase decodes

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    None,
    Password {
        password: String,
        new_password: Option<String>,
    },
    PublicKey {
        algorithm: String,
        key_blob: Vec<u8>,
        signature: Option<Vec<u8>>,
    },
    Other,
}

impl UserauthRequest {
    pub fn method(&self) -> skiff_format::Result<AuthMethod> {
        let mut r = Reader::new(&self.method_data);
        let method = match self.method_name.as_str() {
            "none" => AuthMethod::None,
            // <https://datatracker.ietf.org/doc/html/rfc4252#section-8>
            "password" => {
                let change = r.bool()?;
                let password = r.utf8_string()?.to_owned();
                let new_password = if change {
                    Some(r.utf8_string()?.to_owned())
                } else {
                    None
                };
                AuthMethod::Password {
                    password,
                    new_password,
                }
            }
            // <https://datatracker.ietf.org/doc/html/rfc4252#section-7>
            "publickey" => {
                let has_signature = r.bool()?;
                let algorithm = r.ascii_string()?.to_owned();
                let key_blob = r.string()?.to_vec();
                let signature = if has_signature {
                    Some(r.string()?.to_vec())
                } else {
                    None
                };
                AuthMethod::PublicKey {
                    algorithm,
                    key_blob,
                    signature,
                }
            }
            _ => return Ok(AuthMethod::Other),
        };
        r.finish()?;
        Ok(method)
    }

    pub fn none(username: &str, service_name: &str) -> Self {
        Self {
            username: username.to_owned(),
            service_name: service_name.to_owned(),
            method_name: "none".to_owned(),
            method_data: Vec::new(),
        }
    }

    pub fn password(username: &str, service_name: &str, password: &str) -> Self {
        let mut w = Writer::new();
        w.bool(false);
        w.string(password);
        Self {
            username: username.to_owned(),
            service_name: service_name.to_owned(),
            method_name: "password".to_owned(),
            method_data: w.finish(),
        }
    }

    pub fn public_key(
        username: &str,
        service_name: &str,
        algorithm: &str,
        key_blob: &[u8],
        signature: Option<&[u8]>,
    ) -> Self {
        let mut w = Writer::new();
        w.bool(signature.is_some());
        w.string(algorithm);
        w.string(key_blob);
        if let Some(signature) = signature {
            w.string(signature);
        }
        Self {
            username: username.to_owned(),
            service_name: service_name.to_owned(),
            method_name: "publickey".to_owned(),
            method_data: w.finish(),
        }
    }
}

/// The addresses of a `direct-tcpip` or `forwarded-tcpip` channel.
/// <https://datatracker.ietf.org/doc/html/rfc4254#section-7.2>
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpForward {
    /// The host to connect to, or the address that was connected for `forwarded-tcpip`.
    pub address: String,
    pub port: u32,
    pub originator_address: String,
    pub originator_port: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOpenKind {
    Session,
    DirectTcpip(TcpForward),
    ForwardedTcpip(TcpForward),
}

impl ChannelOpenKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::DirectTcpip(_) => "direct-tcpip",
            Self::ForwardedTcpip(_) => "forwarded-tcpip",
        }
    }
}

impl ChannelOpen {
    /// Parses the channel type specific data, `None` for channel types we don't know.
    pub fn parse_kind(&self) -> skiff_format::Result<Option<ChannelOpenKind>> {
        fn forward(r: &mut Reader<'_>) -> skiff_format::Result<TcpForward> {
            Ok(TcpForward {
                address: r.utf8_string()?.to_owned(),
                port: r.u32()?,
                originator_address: r.utf8_string()?.to_owned(),
                originator_port: r.u32()?,
            })
        }

        let mut r = Reader::new(&self.type_data);
        let kind = match self.channel_type.as_str() {
            "session" => ChannelOpenKind::Session,
            "direct-tcpip" => ChannelOpenKind::DirectTcpip(forward(&mut r)?),
            "forwarded-tcpip" => ChannelOpenKind::ForwardedTcpip(forward(&mut r)?),
            _ => return Ok(None),
        };
        r.finish()?;
        Ok(Some(kind))
    }

    pub fn new(
        kind: &ChannelOpenKind,
        sender_channel: u32,
        initial_window_size: u32,
        maximum_packet_size: u32,
    ) -> Self {
        let mut w = Writer::new();
        match kind {
            ChannelOpenKind::Session => {}
            ChannelOpenKind::DirectTcpip(forward) | ChannelOpenKind::ForwardedTcpip(forward) => {
                w.string(&forward.address);
                w.u32(forward.port);
                w.string(&forward.originator_address);
                w.u32(forward.originator_port);
            }
        }
        Self {
            channel_type: kind.name().to_owned(),
            sender_channel,
            initial_window_size,
            maximum_packet_size,
            type_data: w.finish(),
        }
    }
}

/// <https://datatracker.ietf.org/doc/html/rfc4254#section-6>
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequestKind {
    PtyReq {
        term: String,
        width_chars: u32,
        height_rows: u32,
        width_px: u32,
        height_px: u32,
        term_modes: Vec<u8>,
    },
    Env {
        name: String,
        value: Vec<u8>,
    },
    Shell,
    Exec {
        command: Vec<u8>,
    },
    Subsystem {
        name: String,
    },
    WindowChange {
        width_chars: u32,
        height_rows: u32,
        width_px: u32,
        height_px: u32,
    },
    ExitStatus {
        status: u32,
    },
    /// Anything else, including vendor extensions.
    Other {
        request_type: String,
        data: Vec<u8>,
    },
}

impl ChannelRequestKind {
    pub fn name(&self) -> &str {
        match self {
            Self::PtyReq { .. } => "pty-req",
            Self::Env { .. } => "env",
            Self::Shell => "shell",
            Self::Exec { .. } => "exec",
            Self::Subsystem { .. } => "subsystem",
            Self::WindowChange { .. } => "window-change",
            Self::ExitStatus { .. } => "exit-status",
            Self::Other { request_type, .. } => request_type,
        }
    }
}

impl ChannelRequest {
    /// The second decoding phase, keyed by `request_type`.
    pub fn parse_kind(&self) -> skiff_format::Result<ChannelRequestKind> {
        let mut r = Reader::new(&self.data);
        let kind = match self.request_type.as_str() {
            "pty-req" => ChannelRequestKind::PtyReq {
                term: r.utf8_string()?.to_owned(),
                width_chars: r.u32()?,
                height_rows: r.u32()?,
                width_px: r.u32()?,
                height_px: r.u32()?,
                term_modes: r.string()?.to_vec(),
            },
            "env" => ChannelRequestKind::Env {
                name: r.utf8_string()?.to_owned(),
                value: r.string()?.to_vec(),
            },
            "shell" => ChannelRequestKind::Shell,
            "exec" => ChannelRequestKind::Exec {
                command: r.string()?.to_vec(),
            },
            "subsystem" => ChannelRequestKind::Subsystem {
                name: r.utf8_string()?.to_owned(),
            },
            "window-change" => ChannelRequestKind::WindowChange {
                width_chars: r.u32()?,
                height_rows: r.u32()?,
                width_px: r.u32()?,
                height_px: r.u32()?,
            },
            "exit-status" => ChannelRequestKind::ExitStatus { status: r.u32()? },
            _ => {
                return Ok(ChannelRequestKind::Other {
                    request_type: self.request_type.clone(),
                    data: self.data.clone(),
                })
            }
        };
        r.finish()?;
        Ok(kind)
    }

    pub fn new(recipient_channel: u32, want_reply: bool, kind: &ChannelRequestKind) -> Self {
        let mut w = Writer::new();
        match kind {
            ChannelRequestKind::PtyReq {
                term,
                width_chars,
                height_rows,
                width_px,
                height_px,
                term_modes,
            } => {
                w.string(term);
                w.u32(*width_chars);
                w.u32(*height_rows);
                w.u32(*width_px);
                w.u32(*height_px);
                w.string(term_modes);
            }
            ChannelRequestKind::Env { name, value } => {
                w.string(name);
                w.string(value);
            }
            ChannelRequestKind::Shell => {}
            ChannelRequestKind::Exec { command } => w.string(command),
            ChannelRequestKind::Subsystem { name } => w.string(name),
            ChannelRequestKind::WindowChange {
                width_chars,
                height_rows,
                width_px,
                height_px,
            } => {
                w.u32(*width_chars);
                w.u32(*height_rows);
                w.u32(*width_px);
                w.u32(*height_px);
            }
            ChannelRequestKind::ExitStatus { status } => w.u32(*status),
            ChannelRequestKind::Other { data, .. } => w.raw(data),
        }
        Self {
            recipient_channel,
            request_type: kind.name().to_owned(),
            want_reply,
            data: w.finish(),
        }
    }
}
