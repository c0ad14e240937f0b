//! An in-process SSH client for driving a server in tests.

use std::collections::VecDeque;

use skiff_format::numbers;
use skiff_keys::host_keys::HostKeySet;
use skiff_keys::private::PrivateKey;
use skiff_keys::public::PublicKey;
use skiff_keys::{HostKeyAlgorithm, KeyType};

use crate::crypto::{self, DhExchange, Negotiated, SessionKeys, Tunnel};
use crate::message::{KexInit, KexdhInit, Message, NewKeys, SshMessage};
use crate::packet::{PacketTransport, ProtocolIdentParser};
use crate::server::ServerConnection;
use crate::{disconnect_error, peer_error, Msg, Result, SshRng};

pub const CLIENT_IDENTIFICATION: &str = "SSH-2.0-skiff_test";

const HOST_RSA: &str = include_str!("../../skiff-keys/testdata/host_rsa.b64");
const HOST_DSS: &str = include_str!("../../skiff-keys/testdata/host_dss.b64");
const USER_RSA: &str = include_str!("../../skiff-keys/testdata/user_rsa.b64");

/// A deterministic xorshift generator. Not random in any useful sense.
pub struct TestRng(u64);

impl TestRng {
    pub fn new(seed: u64) -> Self {
        Self(seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1)
    }
}

impl SshRng for TestRng {
    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(8) {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            chunk.copy_from_slice(&self.0.to_le_bytes()[..chunk.len()]);
        }
    }
}

/// One RSA key for both RSA algorithms and one DSA key.
pub fn test_host_keys() -> HostKeySet {
    let rsa = PrivateKey::from_base64(KeyType::Rsa, HOST_RSA).expect("invalid test RSA key");
    let dss = PrivateKey::from_base64(KeyType::Dss, HOST_DSS).expect("invalid test DSA key");
    let mut set = HostKeySet::new();
    for (alg, key) in [
        (HostKeyAlgorithm::RsaSha2_256, rsa.clone()),
        (HostKeyAlgorithm::RsaSha2_512, rsa),
        (HostKeyAlgorithm::SshDss, dss),
    ] {
        set.insert(alg, key).expect("invalid test host key set");
    }
    set
}

/// A key to authenticate users with.
pub fn user_key() -> PrivateKey {
    PrivateKey::from_base64(KeyType::Rsa, USER_RSA).expect("invalid test user key")
}

/// One side of a connection in tests.
pub trait Endpoint {
    fn recv_bytes(&mut self, bytes: &[u8]) -> Result<()>;
    fn next_msg_to_send(&mut self) -> Option<Msg>;
}

impl Endpoint for ServerConnection {
    fn recv_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        ServerConnection::recv_bytes(self, bytes)
    }
    fn next_msg_to_send(&mut self) -> Option<Msg> {
        ServerConnection::next_msg_to_send(self)
    }
}

impl Endpoint for TestClient {
    fn recv_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        TestClient::recv_bytes(self, bytes)
    }
    fn next_msg_to_send(&mut self) -> Option<Msg> {
        TestClient::next_msg_to_send(self)
    }
}

/// Moves bytes back and forth until neither side has anything left to send.
pub fn pump(server: &mut impl Endpoint, client: &mut TestClient) -> Result<()> {
    loop {
        let mut progress = false;
        while let Some(msg) = server.next_msg_to_send() {
            client.recv_bytes(&msg.to_bytes())?;
            progress = true;
        }
        while let Some(msg) = client.next_msg_to_send() {
            server.recv_bytes(&msg.to_bytes())?;
            progress = true;
        }
        if !progress {
            return Ok(());
        }
    }
}

struct ClientExchange {
    client_kexinit_payload: Vec<u8>,
    state: ClientExchangeState,
}

enum ClientExchangeState {
    AwaitingKexInit,
    AwaitingDhReply {
        server_kexinit_payload: Vec<u8>,
        negotiated: Negotiated,
        dh: DhExchange,
        e: Vec<u8>,
    },
    AwaitingNewKeys {
        incoming: Tunnel,
        negotiated: Negotiated,
    },
}

/// The client side of the transport, sending its identification and KEXINIT right away.
pub struct TestClient {
    rng: TestRng,
    packet_transport: PacketTransport,
    ident_parser: Option<ProtocolIdentParser>,
    server_identification: Vec<u8>,
    preferences: KexInit,

    exchange: Option<ClientExchange>,
    session_id: Option<Vec<u8>>,
    exchange_hashes: Vec<Vec<u8>>,
    negotiated: Option<Negotiated>,
    server_host_key: Option<PublicKey>,

    deferred: VecDeque<Vec<u8>>,
    received: VecDeque<Message>,
    received_during_exchange: Vec<Message>,
}

impl TestClient {
    /// `preferences` are the algorithm lists offered in our KEXINIT.
    pub fn new(rng: TestRng, preferences: KexInit) -> Self {
        let mut packet_transport = PacketTransport::new();
        packet_transport.queue_send_protocol_info(format!("{CLIENT_IDENTIFICATION}\r\n").into_bytes());

        let mut client = Self {
            rng,
            packet_transport,
            ident_parser: Some(ProtocolIdentParser::new()),
            server_identification: Vec::new(),
            preferences,

            exchange: None,
            session_id: None,
            exchange_hashes: Vec::new(),
            negotiated: None,
            server_host_key: None,

            deferred: VecDeque::new(),
            received: VecDeque::new(),
            received_during_exchange: Vec::new(),
        };
        client.start_exchange();
        client
    }

    /// A client offering everything the server supports.
    pub fn with_defaults(seed: u64) -> Self {
        Self::new(
            TestRng::new(seed),
            crypto::supported_kexinit([0; 16], &HostKeyAlgorithm::ALL),
        )
    }

    fn start_exchange(&mut self) {
        self.rng.fill_bytes(&mut self.preferences.cookie);
        let payload = self.preferences.to_payload();
        self.queue_payload(payload.clone());
        self.exchange = Some(ClientExchange {
            client_kexinit_payload: payload,
            state: ClientExchangeState::AwaitingKexInit,
        });
    }

    /// Starts a key re-exchange from the client side.
    pub fn start_rekey(&mut self) {
        if self.exchange.is_none() {
            self.start_exchange();
        }
    }

    fn queue_payload(&mut self, payload: Vec<u8>) {
        self.packet_transport.queue_packet(payload, &mut self.rng);
    }

    pub fn recv_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        if let Some(ident_parser) = &mut self.ident_parser {
            let Some((ident, rest)) = ident_parser.recv_bytes(bytes)? else {
                return Ok(());
            };
            self.server_identification = ident;
            self.ident_parser = None;
            self.packet_transport.recv_bytes(&rest);
        } else {
            self.packet_transport.recv_bytes(bytes);
        }

        while let Some((seq_nr, packet)) = self.packet_transport.recv_next_packet()? {
            let msg = Message::decode(&packet.payload, seq_nr)?;
            match msg {
                Message::KexInit(server_kexinit) => {
                    self.handle_kexinit(packet.payload, &server_kexinit)?
                }
                Message::KexdhReply(reply) => self.handle_dh_reply(reply)?,
                Message::NewKeys(_) => self.handle_new_keys()?,
                msg => {
                    if self.exchange.is_some() && !numbers::is_transport_message(msg.message_type())
                    {
                        self.received_during_exchange.push(msg.clone());
                    }
                    self.received.push_back(msg);
                }
            }
        }
        Ok(())
    }

    fn handle_kexinit(&mut self, payload: Vec<u8>, server_kexinit: &KexInit) -> Result<()> {
        if self.exchange.is_none() {
            self.start_exchange();
        }
        let negotiated = Negotiated::from_kexinits(server_kexinit, &self.preferences)?;
        let dh = negotiated.kex.create_exchange(&mut self.rng);
        let e = dh.public_value().to_vec();
        self.queue_payload(KexdhInit { e: e.clone() }.to_payload());

        let Some(exchange) = &mut self.exchange else {
            return Err(peer_error!("no key exchange running"));
        };
        exchange.state = ClientExchangeState::AwaitingDhReply {
            server_kexinit_payload: payload,
            negotiated,
            dh,
            e,
        };
        Ok(())
    }

    fn handle_dh_reply(&mut self, reply: crate::message::KexdhReply) -> Result<()> {
        let Some(ClientExchange {
            client_kexinit_payload,
            state:
                ClientExchangeState::AwaitingDhReply {
                    server_kexinit_payload,
                    negotiated,
                    dh,
                    e,
                },
        }) = self.exchange.take()
        else {
            return Err(peer_error!("unexpected SSH_MSG_KEXDH_REPLY"));
        };

        let host_key = PublicKey::from_wire_encoding(&reply.host_key)?;
        let shared_secret = dh.decrypt_exchange(&reply.f)?;
        let h = crypto::exchange_hash(
            &negotiated.kex,
            CLIENT_IDENTIFICATION.as_bytes(),
            &self.server_identification,
            &client_kexinit_payload,
            &server_kexinit_payload,
            &reply.host_key,
            &e,
            &reply.f,
            &shared_secret,
        );
        if !host_key.verify_signature(negotiated.host_key, &h, &reply.signature) {
            return Err(disconnect_error!(
                numbers::SSH_DISCONNECT_HOST_KEY_NOT_VERIFIABLE,
                "invalid signature of the exchange hash"
            ));
        }

        let session_id = self.session_id.get_or_insert_with(|| h.clone()).clone();
        let keys = SessionKeys::derive(&negotiated, &shared_secret, &h, &session_id);
        let (outgoing, incoming) = Tunnel::client_pair(&negotiated, &keys)?;

        self.queue_payload(NewKeys {}.to_payload());
        self.packet_transport.set_outgoing(outgoing);
        self.exchange_hashes.push(h);
        self.server_host_key = Some(host_key);

        self.exchange = Some(ClientExchange {
            client_kexinit_payload,
            state: ClientExchangeState::AwaitingNewKeys {
                incoming,
                negotiated,
            },
        });
        Ok(())
    }

    fn handle_new_keys(&mut self) -> Result<()> {
        let Some(ClientExchange {
            state: ClientExchangeState::AwaitingNewKeys {
                incoming,
                negotiated,
            },
            ..
        }) = self.exchange.take()
        else {
            return Err(peer_error!("unexpected SSH_MSG_NEWKEYS"));
        };

        self.packet_transport.set_incoming(incoming);
        self.packet_transport.reset_byte_counters();
        self.negotiated = Some(negotiated);

        for payload in std::mem::take(&mut self.deferred) {
            self.queue_payload(payload);
        }
        Ok(())
    }

    /// Sends a message, holding it back during key exchange like a real client would.
    pub fn send(&mut self, msg: impl Into<Message>) {
        let msg = msg.into();
        let payload = msg.to_payload();
        if !numbers::is_transport_message(msg.message_type())
            && (self.exchange.is_some() || self.negotiated.is_none())
        {
            self.deferred.push_back(payload);
        } else {
            self.queue_payload(payload);
        }
    }

    /// Sends a payload right away, whatever state the connection is in.
    pub fn send_raw_payload(&mut self, payload: Vec<u8>) {
        self.queue_payload(payload);
    }

    /// Sends a key exchange packet as if we guessed the server's algorithms.
    pub fn send_guessed_kex_packet(&mut self) {
        self.queue_payload(KexdhInit { e: vec![2] }.to_payload());
    }

    pub fn last_sent_sequence_number(&self) -> u32 {
        self.packet_transport.next_send_sequence_number().wrapping_sub(1)
    }

    /// Sends everything queued to `endpoint` without looking at the reply.
    pub fn flush_to(&mut self, endpoint: &mut impl Endpoint) -> Result<()> {
        while let Some(msg) = self.next_msg_to_send() {
            endpoint.recv_bytes(&msg.to_bytes())?;
        }
        Ok(())
    }

    pub fn next_msg_to_send(&mut self) -> Option<Msg> {
        self.packet_transport.next_msg_to_send()
    }

    /// The next message that was not handled by the key exchange.
    pub fn next_message(&mut self) -> Option<Message> {
        self.received.pop_front()
    }

    /// Messages above the transport layer that arrived while keys were being exchanged.
    pub fn messages_during_exchange(&self) -> &[Message] {
        &self.received_during_exchange
    }

    pub fn session_id(&self) -> Option<&[u8]> {
        self.session_id.as_deref()
    }

    pub fn exchange_hashes(&self) -> &[Vec<u8>] {
        &self.exchange_hashes
    }

    pub fn negotiated(&self) -> Option<&Negotiated> {
        self.negotiated.as_ref()
    }

    pub fn is_exchanging(&self) -> bool {
        self.exchange.is_some()
    }

    pub fn server_host_key(&self) -> Option<&PublicKey> {
        self.server_host_key.as_ref()
    }
}
