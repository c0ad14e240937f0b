use std::collections::VecDeque;

use skiff_format::numbers;
use skiff_keys::host_keys::HostKeySet;
use tracing::{debug, info, trace};

use crate::crypto::{self, Negotiated, SessionKeys, Tunnel};
use crate::message::{
    Disconnect, KexInit, KexdhInit, KexdhReply, Message, NewKeys, SshMessage, Unimplemented,
};
use crate::packet::{Packet, PacketTransport, ProtocolIdentParser};
use crate::{disconnect_error, peer_error, Msg, Result, SshRng, SshStatus};

pub const DEFAULT_SERVER_IDENTIFICATION: &str = "SSH-2.0-skiff_0.1";
/// Re-exchange keys after this many bytes in both directions.
pub const DEFAULT_REKEY_THRESHOLD: u64 = 512 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Sent without the line ending, which is added when sending.
    pub server_identification: String,
    pub host_keys: HostKeySet,
    pub rekey_threshold: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_identification: DEFAULT_SERVER_IDENTIFICATION.to_owned(),
            host_keys: HostKeySet::default(),
            rekey_threshold: DEFAULT_REKEY_THRESHOLD,
        }
    }
}

impl ServerConfig {
    pub fn new(host_keys: HostKeySet) -> Self {
        Self {
            host_keys,
            ..Self::default()
        }
    }
}

/// Something the layer above the transport has to look at.
#[derive(Debug)]
pub enum TransportEvent {
    /// NEWKEYS has been received, the new keys are active in both directions.
    KeysExchanged(KeyExchangeInfo),
    /// A message for a service (anything that is not handled by the transport itself).
    Message(Message),
}

#[derive(Debug, Clone)]
pub struct KeyExchangeInfo {
    /// The peer's KEXINIT, with all the algorithms it offered.
    pub peer_kexinit: KexInit,
    pub negotiated: Negotiated,
    pub exchange_hash: Vec<u8>,
}

enum Phase {
    VersionExchange { ident_parser: ProtocolIdentParser },
    /// The first key exchange has not completed yet.
    Unkeyed,
    Keyed,
    Closed,
}

/// Exists exactly while a key exchange is running.
struct ExchangeContext {
    server_kexinit: KexInit,
    server_kexinit_payload: Vec<u8>,
    state: ExchangeState,
}

enum ExchangeState {
    AwaitingKexInit,
    AwaitingDhInit {
        client_kexinit_payload: Vec<u8>,
        peer_kexinit: KexInit,
        negotiated: Negotiated,
    },
    AwaitingNewKeys {
        incoming: Tunnel,
        info: KeyExchangeInfo,
    },
}

/// The server side of the transport protocol.
/// <https://datatracker.ietf.org/doc/html/rfc4253>
pub struct ServerConnection {
    phase: Phase,
    packet_transport: PacketTransport,
    rng: Box<dyn SshRng + Send + Sync>,
    config: ServerConfig,

    client_identification: Vec<u8>,
    /// The exchange hash of the first key exchange.
    session_id: Option<Vec<u8>>,
    negotiated: Option<Negotiated>,
    exchange: Option<ExchangeContext>,
    ignore_next_kex_packet: bool,

    /// Payloads held back while a key exchange is running.
    deferred: VecDeque<Vec<u8>>,
    events: VecDeque<TransportEvent>,
}

impl ServerConnection {
    /// The identification is queued for sending right away.
    pub fn new(rng: impl SshRng + Send + Sync + 'static, config: ServerConfig) -> Self {
        let mut packet_transport = PacketTransport::new();
        let mut ident = config.server_identification.clone().into_bytes();
        ident.extend_from_slice(b"\r\n");
        packet_transport.queue_send_protocol_info(ident);

        Self {
            phase: Phase::VersionExchange {
                ident_parser: ProtocolIdentParser::new(),
            },
            packet_transport,
            rng: Box::new(rng),
            config,

            client_identification: Vec::new(),
            session_id: None,
            negotiated: None,
            exchange: None,
            ignore_next_kex_packet: false,

            deferred: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    pub fn recv_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        match &mut self.phase {
            Phase::Closed => return Ok(()),
            Phase::VersionExchange { ident_parser } => {
                let Some((ident, rest)) = ident_parser.recv_bytes(bytes)? else {
                    return Ok(());
                };
                self.client_identification = ident;
                self.phase = Phase::Unkeyed;
                // The first key exchange starts right after the version exchange.
                self.start_exchange();
                self.packet_transport.recv_bytes(&rest);
            }
            Phase::Unkeyed | Phase::Keyed => self.packet_transport.recv_bytes(bytes),
        }

        while let Some((seq_nr, packet)) = self.packet_transport.recv_next_packet()? {
            self.handle_packet(seq_nr, packet)?;
            if let Phase::Closed = self.phase {
                return Ok(());
            }
        }

        self.consider_rekey();
        Ok(())
    }

    fn handle_packet(&mut self, seq_nr: u32, packet: Packet) -> Result<()> {
        let msg = Message::decode(&packet.payload, seq_nr)?;

        if self.ignore_next_kex_packet && matches!(msg.message_type(), 30..=49) {
            // <https://datatracker.ietf.org/doc/html/rfc4253#section-7>
            debug!("Ignoring wrongly guessed key exchange packet");
            self.ignore_next_kex_packet = false;
            return Ok(());
        }

        match msg {
            Message::Disconnect(disconnect) => {
                // <https://datatracker.ietf.org/doc/html/rfc4253#section-11.1>
                let reason_string = numbers::disconnect_reason_to_string(disconnect.reason_code);
                debug!(
                    reason = %disconnect.reason_code,
                    %reason_string,
                    description = %disconnect.description,
                    "Client disconnecting"
                );
                self.phase = Phase::Closed;
                return Err(SshStatus::Disconnect);
            }
            Message::Ignore(_) => {}
            Message::DebugMessage(debug_msg) => {
                if debug_msg.always_display {
                    info!(msg = %debug_msg.message, "Received debug message (SSH_MSG_DEBUG)");
                } else {
                    debug!(msg = %debug_msg.message, "Received debug message (SSH_MSG_DEBUG)");
                }
            }
            Message::Unimplemented(unimplemented) => {
                debug!(seq_nr = %unimplemented.sequence_number, "Peer did not implement a message");
            }
            Message::Unknown(unknown) => {
                debug!(
                    packet_type = %unknown.message_type,
                    "Received unknown message, replying with SSH_MSG_UNIMPLEMENTED"
                );
                self.queue_payload(
                    Unimplemented {
                        sequence_number: unknown.sequence_number,
                    }
                    .to_payload(),
                );
            }
            Message::KexInit(kexinit) => self.handle_kexinit(packet.payload, kexinit)?,
            Message::KexdhInit(dh_init) => self.handle_dh_init(dh_init)?,
            Message::NewKeys(_) => self.handle_new_keys()?,
            Message::KexdhReply(_) => {
                return Err(peer_error!("client sent SSH_MSG_KEXDH_REPLY"));
            }
            msg => {
                if !matches!(self.phase, Phase::Keyed) {
                    return Err(peer_error!(
                        "unexpected {} before the first key exchange",
                        numbers::packet_type_to_string(msg.message_type())
                    ));
                }
                self.events.push_back(TransportEvent::Message(msg));
            }
        }
        Ok(())
    }

    /// Sends our KEXINIT and opens the gate for higher level messages.
    fn start_exchange(&mut self) {
        let mut cookie = [0; 16];
        self.rng.fill_bytes(&mut cookie);
        let server_kexinit =
            crypto::supported_kexinit(cookie, &self.config.host_keys.algorithms());
        let server_kexinit_payload = server_kexinit.to_payload();

        debug!("Starting key exchange");
        self.queue_payload(server_kexinit_payload.clone());
        self.exchange = Some(ExchangeContext {
            server_kexinit,
            server_kexinit_payload,
            state: ExchangeState::AwaitingKexInit,
        });
    }

    fn handle_kexinit(&mut self, payload: Vec<u8>, peer_kexinit: KexInit) -> Result<()> {
        if self.exchange.is_none() {
            debug!("Client initiated key re-exchange");
            self.start_exchange();
        }
        let Some(exchange) = &mut self.exchange else {
            unreachable!("exchange has just been started");
        };
        if !matches!(exchange.state, ExchangeState::AwaitingKexInit) {
            return Err(peer_error!("unexpected SSH_MSG_KEXINIT during key exchange"));
        }

        let negotiated = Negotiated::from_kexinits(&exchange.server_kexinit, &peer_kexinit)?;
        debug!(
            kex = %negotiated.kex.name(),
            host_key = %negotiated.host_key,
            encryption_c2s = %negotiated.encryption_client_to_server.name(),
            encryption_s2c = %negotiated.encryption_server_to_client.name(),
            mac_c2s = %negotiated.mac_client_to_server.name(),
            mac_s2c = %negotiated.mac_server_to_client.name(),
            "Negotiated algorithms"
        );

        if peer_kexinit.first_kex_packet_follows && negotiated.client_guess_was_wrong(&peer_kexinit)
        {
            self.ignore_next_kex_packet = true;
        }

        exchange.state = ExchangeState::AwaitingDhInit {
            client_kexinit_payload: payload,
            peer_kexinit,
            negotiated,
        };
        Ok(())
    }

    fn handle_dh_init(&mut self, dh_init: KexdhInit) -> Result<()> {
        let Some(ExchangeContext {
            server_kexinit_payload,
            state:
                ExchangeState::AwaitingDhInit {
                    client_kexinit_payload,
                    peer_kexinit,
                    negotiated,
                },
            ..
        }) = &self.exchange
        else {
            return Err(peer_error!("unexpected SSH_MSG_KEXDH_INIT"));
        };
        let negotiated = *negotiated;

        let Some(host_key) = self.config.host_keys.get(negotiated.host_key) else {
            return Err(disconnect_error!(
                numbers::SSH_DISCONNECT_KEY_EXCHANGE_FAILED,
                "no host key for {}",
                negotiated.host_key
            ));
        };

        let dh = negotiated.kex.create_exchange(&mut *self.rng);
        let f = dh.public_value().to_vec();
        let shared_secret = dh.decrypt_exchange(&dh_init.e)?;

        let host_key_blob = host_key.public_key().to_wire_encoding();
        let server_identification = self.config.server_identification.as_bytes();
        let h = crypto::exchange_hash(
            &negotiated.kex,
            &self.client_identification,
            server_identification,
            client_kexinit_payload,
            server_kexinit_payload,
            &host_key_blob,
            &dh_init.e,
            &f,
            &shared_secret,
        );
        let signature = host_key.sign(negotiated.host_key, &h).map_err(|err| {
            disconnect_error!(
                numbers::SSH_DISCONNECT_KEY_EXCHANGE_FAILED,
                "failed to sign exchange hash: {err}"
            )
        })?;

        let session_id = self.session_id.get_or_insert_with(|| h.clone()).clone();
        let keys = SessionKeys::derive(&negotiated, &shared_secret, &h, &session_id);
        let (outgoing, incoming) = Tunnel::server_pair(&negotiated, &keys)?;

        let info = KeyExchangeInfo {
            peer_kexinit: peer_kexinit.clone(),
            negotiated,
            exchange_hash: h,
        };

        self.queue_payload(
            KexdhReply {
                host_key: host_key_blob,
                f,
                signature: signature.to_wire_encoding(),
            }
            .to_payload(),
        );
        self.queue_payload(NewKeys {}.to_payload());
        self.packet_transport.set_outgoing(outgoing);

        if let Some(exchange) = &mut self.exchange {
            exchange.state = ExchangeState::AwaitingNewKeys { incoming, info };
        }
        Ok(())
    }

    fn handle_new_keys(&mut self) -> Result<()> {
        let Some(ExchangeContext {
            state: ExchangeState::AwaitingNewKeys { incoming, info },
            ..
        }) = self.exchange.take()
        else {
            return Err(peer_error!("unexpected SSH_MSG_NEWKEYS"));
        };

        self.packet_transport.set_incoming(incoming);
        self.packet_transport.reset_byte_counters();
        self.negotiated = Some(info.negotiated);
        self.phase = Phase::Keyed;
        debug!("Key exchange complete");

        let deferred = std::mem::take(&mut self.deferred);
        if !deferred.is_empty() {
            trace!(count = %deferred.len(), "Flushing messages held back during key exchange");
        }
        for payload in deferred {
            self.packet_transport.queue_packet(payload, &mut *self.rng);
        }

        self.events.push_back(TransportEvent::KeysExchanged(info));
        Ok(())
    }

    fn consider_rekey(&mut self) {
        if matches!(self.phase, Phase::Keyed)
            && self.exchange.is_none()
            && self.packet_transport.bytes_transferred() > self.config.rekey_threshold
        {
            debug!(
                bytes = %self.packet_transport.bytes_transferred(),
                "Re-exchange threshold reached"
            );
            self.start_exchange();
        }
    }

    fn queue_payload(&mut self, payload: Vec<u8>) {
        self.packet_transport.queue_packet(payload, &mut *self.rng);
    }

    /// Sends a message to the client.
    /// Messages above the transport layer are held back while a key exchange is running
    /// and sent in order once it has completed.
    pub fn send_message(&mut self, msg: impl Into<Message>) {
        if let Phase::Closed = self.phase {
            return;
        }
        let msg = msg.into();
        let payload = msg.to_payload();
        if !numbers::is_transport_message(msg.message_type())
            && (self.exchange.is_some() || !matches!(self.phase, Phase::Keyed))
        {
            trace!(
                packet_type = %msg.message_type(),
                "Holding back message during key exchange"
            );
            self.deferred.push_back(payload);
            return;
        }
        self.queue_payload(payload);
        self.consider_rekey();
    }

    /// Sends a DISCONNECT and stops processing input.
    pub fn disconnect(&mut self, reason_code: u32, description: &str) {
        if let Phase::Closed = self.phase {
            return;
        }
        self.queue_payload(
            Disconnect {
                reason_code,
                description: description.to_owned(),
                language_tag: String::new(),
            }
            .to_payload(),
        );
        self.phase = Phase::Closed;
    }

    pub fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.pop_front()
    }

    pub fn next_msg_to_send(&mut self) -> Option<Msg> {
        self.packet_transport.next_msg_to_send()
    }

    pub fn session_id(&self) -> Option<&[u8]> {
        self.session_id.as_deref()
    }

    /// The active algorithms, after the first key exchange.
    pub fn negotiated(&self) -> Option<&Negotiated> {
        self.negotiated.as_ref()
    }

    pub fn is_exchanging(&self) -> bool {
        self.exchange.is_some()
    }

    pub fn is_keyed(&self) -> bool {
        matches!(self.phase, Phase::Keyed)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.phase, Phase::Closed)
    }

    /// The client's identification string, without the line ending.
    pub fn client_identification(&self) -> &[u8] {
        &self.client_identification
    }
}

#[cfg(test)]
mod tests {
    use skiff_format::numbers;
    use skiff_keys::HostKeyAlgorithm;

    use super::{ServerConfig, ServerConnection, TransportEvent};
    use crate::crypto::{self, kex, supported_kexinit};
    use crate::message::{
        ChannelData, ChannelEof, Ignore, Message, ServiceAccept, ServiceRequest, SshMessage,
    };
    use crate::packet::MsgKind;
    use crate::testing::{pump, test_host_keys, TestClient, TestRng};

    fn server() -> ServerConnection {
        ServerConnection::new(TestRng::new(1), ServerConfig::new(test_host_keys()))
    }

    fn client_prefs() -> crate::message::KexInit {
        supported_kexinit([0; 16], &HostKeyAlgorithm::ALL)
    }

    fn handshake(server: &mut ServerConnection, client: &mut TestClient) {
        pump(server, client).unwrap();
        assert!(server.is_keyed());
        assert!(!client.is_exchanging());
    }

    fn received_messages(server: &mut ServerConnection) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Some(event) = server.next_event() {
            if let TransportEvent::Message(msg) = event {
                messages.push(msg);
            }
        }
        messages
    }

    #[test]
    fn identification_sent_immediately() {
        let mut server = server();
        let msg = server.next_msg_to_send().unwrap();
        assert_eq!(msg.0, MsgKind::ProtocolIdent(b"SSH-2.0-skiff_0.1\r\n".to_vec()));
        assert!(server.next_msg_to_send().is_none());
    }

    #[test]
    fn kexinit_after_version_exchange() {
        let mut server = server();
        server.next_msg_to_send().unwrap();
        server.recv_bytes(b"SSH-2.0-").unwrap();
        assert!(server.next_msg_to_send().is_none());
        server.recv_bytes(b"OpenSSH_9.7\r\n").unwrap();
        let msg = server.next_msg_to_send().unwrap();
        assert!(matches!(msg.0, MsgKind::Packet(_)));
        assert!(server.is_exchanging());
        assert_eq!(server.client_identification(), b"SSH-2.0-OpenSSH_9.7");
    }

    #[test]
    fn handshake_all_combinations() {
        let host_keys = test_host_keys();
        for kex in crypto::KEX_ALGORITHMS {
            for host_key in HostKeyAlgorithm::ALL {
                for encryption in crypto::ENCRYPTION_ALGORITHMS {
                    for mac in crypto::MAC_ALGORITHMS {
                        // The larger groups are slow, only pair them with one set of the rest.
                        if kex != kex::DH_GROUP1_SHA1
                            && (host_key != HostKeyAlgorithm::RsaSha2_256
                                || encryption != crypto::cipher::AES256_CTR
                                || mac != crypto::mac::HMAC_SHA2_256)
                        {
                            continue;
                        }

                        let mut prefs = client_prefs();
                        prefs.kex_algorithms = vec![kex.name().to_owned()];
                        prefs.server_host_key_algorithms = vec![host_key.name().to_owned()];
                        prefs.encryption_algorithms_client_to_server =
                            vec![encryption.name().to_owned()];
                        prefs.encryption_algorithms_server_to_client =
                            vec![encryption.name().to_owned()];
                        prefs.mac_algorithms_client_to_server = vec![mac.name().to_owned()];
                        prefs.mac_algorithms_server_to_client = vec![mac.name().to_owned()];

                        let mut server = ServerConnection::new(
                            TestRng::new(2),
                            ServerConfig::new(host_keys.clone()),
                        );
                        let mut client = TestClient::new(TestRng::new(3), prefs);
                        handshake(&mut server, &mut client);

                        let server_algs = server.negotiated().unwrap();
                        assert_eq!(Some(server_algs), client.negotiated());
                        assert_eq!(server_algs.kex, kex);
                        assert_eq!(server_algs.host_key, host_key);
                        assert_eq!(server_algs.encryption_client_to_server, encryption);
                        assert_eq!(server_algs.mac_server_to_client, mac);
                        assert_eq!(server.session_id(), client.session_id());

                        let Some(TransportEvent::KeysExchanged(info)) = server.next_event()
                        else {
                            panic!("no key exchange event");
                        };
                        assert_eq!(client.exchange_hashes(), [info.exchange_hash]);

                        // Traffic flows both ways with the new keys.
                        client.send(ServiceRequest {
                            service_name: "ssh-userauth".to_owned(),
                        });
                        pump(&mut server, &mut client).unwrap();
                        assert_eq!(
                            received_messages(&mut server),
                            vec![Message::ServiceRequest(ServiceRequest {
                                service_name: "ssh-userauth".to_owned()
                            })]
                        );
                        server.send_message(ServiceAccept {
                            service_name: "ssh-userauth".to_owned(),
                        });
                        pump(&mut server, &mut client).unwrap();
                        assert!(matches!(
                            client.next_message(),
                            Some(Message::ServiceAccept(_))
                        ));
                    }
                }
            }
        }
    }

    #[test]
    fn client_kex_preference_wins() {
        let mut prefs = client_prefs();
        prefs.kex_algorithms = vec!["diffie-hellman-group14-sha256".to_owned()];
        let mut server = server();
        let mut client = TestClient::new(TestRng::new(4), prefs);
        handshake(&mut server, &mut client);
        assert_eq!(server.negotiated().unwrap().kex, kex::DH_GROUP14_SHA256);

        let Some(TransportEvent::KeysExchanged(info)) = server.next_event() else {
            panic!("no key exchange event");
        };
        assert_eq!(info.peer_kexinit.kex_algorithms, ["diffie-hellman-group14-sha256"]);
    }

    #[test]
    fn no_common_algorithm_fails() {
        let mut prefs = client_prefs();
        prefs.encryption_algorithms_client_to_server = vec!["aes128-gcm@openssh.com".to_owned()];
        let mut server = server();
        let mut client = TestClient::new(TestRng::new(5), prefs);
        let err = pump(&mut server, &mut client).unwrap_err();
        assert_eq!(
            err.disconnect_reason(),
            Some(numbers::SSH_DISCONNECT_KEY_EXCHANGE_FAILED)
        );
    }

    #[test]
    fn messages_before_keys_are_rejected() {
        let mut server = server();
        let mut client = TestClient::new(TestRng::new(6), client_prefs());
        client.send_raw_payload(
            ServiceRequest {
                service_name: "ssh-userauth".to_owned(),
            }
            .to_payload(),
        );
        let err = pump(&mut server, &mut client).unwrap_err();
        assert_eq!(
            err.disconnect_reason(),
            Some(numbers::SSH_DISCONNECT_PROTOCOL_ERROR)
        );
    }

    #[test]
    fn unknown_message_gets_unimplemented() {
        let mut server = server();
        let mut client = TestClient::new(TestRng::new(7), client_prefs());
        handshake(&mut server, &mut client);

        client.send_raw_payload(vec![200, 1, 2, 3]);
        let seq_nr = client.last_sent_sequence_number();
        pump(&mut server, &mut client).unwrap();

        let Some(Message::Unimplemented(unimplemented)) = client.next_message() else {
            panic!("expected SSH_MSG_UNIMPLEMENTED");
        };
        assert_eq!(unimplemented.sequence_number, seq_nr);
        assert!(received_messages(&mut server).is_empty());
    }

    #[test]
    fn ignore_and_debug_consumed() {
        let mut server = server();
        let mut client = TestClient::new(TestRng::new(8), client_prefs());
        handshake(&mut server, &mut client);
        client.send(Ignore { data: vec![1; 10] });
        pump(&mut server, &mut client).unwrap();
        assert!(received_messages(&mut server).is_empty());
    }

    #[test]
    fn client_disconnect() {
        let mut server = server();
        let mut client = TestClient::new(TestRng::new(9), client_prefs());
        handshake(&mut server, &mut client);
        client.send(crate::message::Disconnect {
            reason_code: numbers::SSH_DISCONNECT_BY_APPLICATION,
            description: "bye".to_owned(),
            language_tag: String::new(),
        });
        let err = pump(&mut server, &mut client).unwrap_err();
        assert!(matches!(err, crate::SshStatus::Disconnect));
        assert!(server.is_closed());
    }

    #[test]
    fn mac_failure_disconnects() {
        let mut server = server();
        let mut client = TestClient::new(TestRng::new(10), client_prefs());
        handshake(&mut server, &mut client);

        client.send(Ignore { data: vec![0; 32] });
        let mut bytes = client.next_msg_to_send().unwrap().to_bytes();
        let last = bytes.len() - 1;
        bytes[last] ^= 1;
        let err = server.recv_bytes(&bytes).unwrap_err();
        assert_eq!(
            err.disconnect_reason(),
            Some(numbers::SSH_DISCONNECT_MAC_ERROR)
        );
    }

    #[test]
    fn client_initiated_rekey_defers_messages() {
        let mut server = server();
        let mut client = TestClient::new(TestRng::new(11), client_prefs());
        handshake(&mut server, &mut client);
        server.next_event();

        client.start_rekey();
        client.flush_to(&mut server).unwrap();
        assert!(server.is_exchanging());

        // Held back until the exchange completes.
        for i in 0..3 {
            server.send_message(ChannelData {
                recipient_channel: 0,
                data: vec![i],
            });
        }
        server.send_message(ChannelEof {
            recipient_channel: 0,
        });

        pump(&mut server, &mut client).unwrap();
        assert!(!server.is_exchanging());
        assert_eq!(client.exchange_hashes().len(), 2);
        assert_ne!(client.exchange_hashes()[0], client.exchange_hashes()[1]);
        assert_eq!(server.session_id(), Some(&*client.exchange_hashes()[0]));

        let mut received = Vec::new();
        while let Some(msg) = client.next_message() {
            received.push(msg);
        }
        assert_eq!(
            received,
            vec![
                Message::ChannelData(ChannelData {
                    recipient_channel: 0,
                    data: vec![0]
                }),
                Message::ChannelData(ChannelData {
                    recipient_channel: 0,
                    data: vec![1]
                }),
                Message::ChannelData(ChannelData {
                    recipient_channel: 0,
                    data: vec![2]
                }),
                Message::ChannelEof(ChannelEof {
                    recipient_channel: 0
                }),
            ]
        );
        // The client saw no channel traffic while the keys were changing.
        assert!(client.messages_during_exchange().is_empty());
    }

    #[test]
    fn rekey_after_threshold() {
        let mut config = ServerConfig::new(test_host_keys());
        config.rekey_threshold = 4096;
        let mut server = ServerConnection::new(TestRng::new(12), config);
        let mut client = TestClient::new(TestRng::new(13), client_prefs());
        handshake(&mut server, &mut client);
        server.next_event();
        assert!(!server.is_exchanging());

        let mut sent = Vec::new();
        for i in 0..20_u8 {
            let msg = ChannelData {
                recipient_channel: 0,
                data: vec![i; 512],
            };
            sent.push(Message::ChannelData(msg.clone()));
            server.send_message(msg);
        }
        // The server started an exchange on its own and held back the rest.
        assert!(server.is_exchanging());

        pump(&mut server, &mut client).unwrap();
        assert!(!server.is_exchanging());
        assert_eq!(client.exchange_hashes().len(), 2);
        assert!(matches!(
            server.next_event(),
            Some(TransportEvent::KeysExchanged(_))
        ));

        let mut received = Vec::new();
        while let Some(msg) = client.next_message() {
            received.push(msg);
        }
        assert_eq!(received, sent);
        assert!(client.messages_during_exchange().is_empty());
    }

    #[test]
    fn wrong_guess_is_ignored() {
        let mut prefs = client_prefs();
        prefs.first_kex_packet_follows = true;
        // The server has no key for the client's first host key algorithm.
        prefs.server_host_key_algorithms = vec!["rsa-sha2-512".to_owned(), "ssh-dss".to_owned()];
        let mut host_keys = skiff_keys::host_keys::HostKeySet::new();
        host_keys
            .insert(
                HostKeyAlgorithm::SshDss,
                test_host_keys()
                    .get(HostKeyAlgorithm::SshDss)
                    .unwrap()
                    .clone(),
            )
            .unwrap();
        let mut server = ServerConnection::new(TestRng::new(14), ServerConfig::new(host_keys));
        let mut client = TestClient::new(TestRng::new(15), prefs);
        client.send_guessed_kex_packet();
        handshake(&mut server, &mut client);
        assert_eq!(server.negotiated().unwrap().host_key, HostKeyAlgorithm::SshDss);
    }
}
