//! An SSH server session: the transport with the authentication and connection services on top.

pub mod auth;

use std::any::Any;
use std::collections::HashMap;

pub use skiff_connection as connection;
use skiff_connection::ChannelsState;
pub use skiff_connection::{ChannelOperation, ChannelUpdate, ChannelUpdateKind};
use skiff_format::numbers;
pub use skiff_transport as transport;
use skiff_transport::message::{Message, ServiceAccept};
use skiff_transport::server::{KeyExchangeInfo, ServerConnection, TransportEvent};
use skiff_transport::{disconnect_error, peer_error};
pub use skiff_transport::{Result, SshStatus};
use tracing::{debug, info};

use auth::{AuthConfig, ServerAuth, ServerRequest, UserAuthArgs};

pub const USERAUTH_SERVICE: &str = "ssh-userauth";
pub const CONNECTION_SERVICE: &str = "ssh-connection";

pub struct ThreadRngRand;
impl transport::SshRng for ThreadRngRand {
    fn fill_bytes(&mut self, dest: &mut [u8]) {
        use rand::RngCore;
        rand::thread_rng().fill_bytes(dest);
    }
}

/// Things that happen to a session, passed to every observer in the order they subscribed.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    KeysExchanged(KeyExchangeInfo),
    ServiceRegistered(&'static str),
    Authenticated(UserAuthArgs),
    Disconnected,
}

pub type Observer = Box<dyn FnMut(&SessionEvent) + Send>;

pub struct Session {
    transport: ServerConnection,
    auth_config: AuthConfig,
    auth: Option<ServerAuth>,
    connection: Option<ChannelsState>,
    identity: Option<UserAuthArgs>,

    observers: Vec<Observer>,
    variables: HashMap<String, Box<dyn Any + Send + Sync>>,
    disconnected: bool,
}

impl Session {
    pub fn new(transport: ServerConnection, auth_config: AuthConfig) -> Self {
        Self {
            transport,
            auth_config,
            auth: None,
            connection: None,
            identity: None,

            observers: Vec::new(),
            variables: HashMap::new(),
            disconnected: false,
        }
    }

    /// Feeds bytes from the client.
    /// After an error the session is over, the caller should send a disconnect for [`SshStatus::PeerError`].
    pub fn recv_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let result = self
            .transport
            .recv_bytes(bytes)
            .and_then(|()| self.process_events());
        if let Err(err) = result {
            if let SshStatus::PeerError { reason, message } = &err {
                self.transport.disconnect(*reason, message);
            }
            self.shut_down();
            return Err(err);
        }
        Ok(())
    }

    fn process_events(&mut self) -> Result<()> {
        while let Some(event) = self.transport.next_event() {
            match event {
                TransportEvent::KeysExchanged(info) => {
                    self.notify(&SessionEvent::KeysExchanged(info))
                }
                TransportEvent::Message(msg) => self.dispatch(msg)?,
            }
            self.progress();
        }
        Ok(())
    }

    fn dispatch(&mut self, msg: Message) -> Result<()> {
        let packet_type = msg.message_type();
        match msg {
            Message::ServiceRequest(req) => self.register_service(&req.service_name),
            msg if numbers::is_userauth_message(packet_type) => {
                match &mut self.auth {
                    Some(auth) => auth.recv_message(msg)?,
                    None => debug!(%packet_type, "Dropping authentication message, service not registered"),
                }
                self.check_authenticated();
                Ok(())
            }
            msg if numbers::is_connection_message(packet_type) => {
                match &mut self.connection {
                    Some(connection) => connection.recv_message(msg)?,
                    None => debug!(%packet_type, "Dropping connection message, service not registered"),
                }
                Ok(())
            }
            _ => Err(peer_error!(
                "unexpected message: {}",
                numbers::packet_type_to_string(packet_type)
            )),
        }
    }

    // <https://datatracker.ietf.org/doc/html/rfc4253#section-10>
    fn register_service(&mut self, name: &str) -> Result<()> {
        match name {
            USERAUTH_SERVICE => {
                if self.auth.is_none() {
                    let Some(session_id) = self.transport.session_id() else {
                        return Err(peer_error!("service request before key exchange"));
                    };
                    self.auth = Some(ServerAuth::new(
                        session_id.to_vec(),
                        self.auth_config.clone(),
                    ));
                    self.notify(&SessionEvent::ServiceRegistered(USERAUTH_SERVICE));
                }
            }
            CONNECTION_SERVICE if self.identity.is_some() => self.register_connection(),
            _ => {
                return Err(disconnect_error!(
                    numbers::SSH_DISCONNECT_SERVICE_NOT_AVAILABLE,
                    "service not available: {name}"
                ))
            }
        }
        debug!(service = %name, "Accepted service request");
        self.transport.send_message(ServiceAccept {
            service_name: name.to_owned(),
        });
        Ok(())
    }

    fn register_connection(&mut self) {
        if self.connection.is_none() {
            self.connection = Some(ChannelsState::new());
            self.notify(&SessionEvent::ServiceRegistered(CONNECTION_SERVICE));
        }
    }

    fn check_authenticated(&mut self) {
        if self.identity.is_some() {
            return;
        }
        let Some(args) = self.auth.as_ref().and_then(|auth| auth.authenticated()) else {
            return;
        };
        let args = args.clone();
        info!(username = %args.username, method = %args.method().name(), "Connection authenticated");
        self.identity = Some(args.clone());
        // The success message must go out before anything from the connection service.
        self.progress();
        self.register_connection();
        self.notify(&SessionEvent::Authenticated(args));
    }

    /// Moves messages produced by the services to the transport.
    pub fn progress(&mut self) {
        if let Some(auth) = &mut self.auth {
            while let Some(msg) = auth.next_msg_to_send() {
                self.transport.send_message(msg);
            }
        }
        if let Some(connection) = &mut self.connection {
            while let Some(msg) = connection.next_msg_to_send() {
                self.transport.send_message(msg);
            }
        }
    }

    fn notify(&mut self, event: &SessionEvent) {
        for observer in &mut self.observers {
            observer(event);
        }
    }

    fn shut_down(&mut self) {
        if self.disconnected {
            return;
        }
        self.disconnected = true;
        if let Some(connection) = &mut self.connection {
            connection.close_all();
            // Nothing can be sent anymore, the updates still tell the channel owners.
            while connection.next_msg_to_send().is_some() {}
        }
        info!("Session disconnected");
        self.notify(&SessionEvent::Disconnected);
    }

    /// Sends a DISCONNECT and closes every channel.
    pub fn disconnect(&mut self, reason_code: u32, description: &str) {
        self.transport.disconnect(reason_code, description);
        self.shut_down();
    }

    /// Registers an observer for [`SessionEvent`]s.
    pub fn subscribe(&mut self, observer: impl FnMut(&SessionEvent) + Send + 'static) {
        self.observers.push(Box::new(observer));
    }

    pub fn next_msg_to_send(&mut self) -> Option<transport::Msg> {
        self.transport.next_msg_to_send()
    }

    pub fn next_auth_request(&mut self) -> Option<ServerRequest> {
        self.auth.as_mut().and_then(|auth| auth.next_server_request())
    }

    /// Answers the last request from [`Self::next_auth_request`].
    pub fn auth_result(&mut self, accepted: bool) {
        if let Some(auth) = &mut self.auth {
            auth.verification_result(accepted);
        }
        self.check_authenticated();
        self.progress();
    }

    pub fn next_channel_update(&mut self) -> Option<ChannelUpdate> {
        self.connection
            .as_mut()
            .and_then(|connection| connection.next_channel_update())
    }

    pub fn do_operation(&mut self, op: ChannelOperation) {
        match &mut self.connection {
            Some(connection) => {
                connection.do_operation(op);
                self.progress();
            }
            None => debug!(number = %op.number, "Dropping channel operation without connection service"),
        }
    }

    pub fn channels(&mut self) -> Option<&mut ChannelsState> {
        self.connection.as_mut()
    }

    /// The authenticated user, once authentication succeeded.
    pub fn identity(&self) -> Option<&UserAuthArgs> {
        self.identity.as_ref()
    }

    pub fn session_id(&self) -> Option<&[u8]> {
        self.transport.session_id()
    }

    pub fn transport(&self) -> &ServerConnection {
        &self.transport
    }

    pub fn is_closed(&self) -> bool {
        self.disconnected
    }

    pub fn set_variable<T: Any + Send + Sync>(&mut self, name: &str, value: T) {
        self.variables.insert(name.to_owned(), Box::new(value));
    }

    /// `None` if the variable is not set or has another type.
    pub fn variable<T: Any + Send + Sync>(&self, name: &str) -> Option<&T> {
        self.variables.get(name)?.downcast_ref()
    }

    pub fn remove_variable(&mut self, name: &str) -> bool {
        self.variables.remove(name).is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use skiff_connection::{ChannelOperationKind, Command, Terminal};
    use skiff_format::numbers;
    use skiff_keys::signature::signature_data;
    use skiff_keys::HostKeyAlgorithm;
    use skiff_transport::message::{
        ChannelData, ChannelOpen, ChannelOpenKind, ChannelRequest, ChannelRequestKind, Message,
        ServiceRequest, UserauthRequest,
    };
    use skiff_transport::server::{ServerConfig, ServerConnection};
    use skiff_transport::testing::{pump, test_host_keys, user_key, Endpoint, TestClient, TestRng};
    use skiff_transport::Msg;

    use super::*;
    use crate::auth::{AuthConfig, Credential};

    impl Endpoint for Session {
        fn recv_bytes(&mut self, bytes: &[u8]) -> Result<()> {
            Session::recv_bytes(self, bytes)
        }
        fn next_msg_to_send(&mut self) -> Option<Msg> {
            Session::next_msg_to_send(self)
        }
    }

    fn connect(config: AuthConfig) -> (Session, TestClient) {
        let transport = ServerConnection::new(TestRng::new(1), ServerConfig::new(test_host_keys()));
        let mut session = Session::new(transport, config);
        let mut client = TestClient::with_defaults(2);
        pump(&mut session, &mut client).unwrap();
        assert!(session.session_id().is_some());
        (session, client)
    }

    fn received(client: &mut TestClient) -> Vec<Message> {
        std::iter::from_fn(|| client.next_message()).collect()
    }

    fn request_userauth(session: &mut Session, client: &mut TestClient) {
        client.send(ServiceRequest {
            service_name: USERAUTH_SERVICE.to_owned(),
        });
        pump(session, client).unwrap();
        assert_eq!(
            received(client),
            vec![Message::ServiceAccept(ServiceAccept {
                service_name: USERAUTH_SERVICE.to_owned()
            })]
        );
    }

    fn log_in(session: &mut Session, client: &mut TestClient) {
        request_userauth(session, client);
        client.send(UserauthRequest::password("alice", CONNECTION_SERVICE, "secret"));
        pump(session, client).unwrap();
        let Some(ServerRequest::VerifyPassword(args)) = session.next_auth_request() else {
            panic!("expected password check");
        };
        assert_eq!(args.credential, Credential::Password("secret".to_owned()));
        session.auth_result(true);
        pump(session, client).unwrap();
        assert!(matches!(
            received(client).as_slice(),
            [Message::UserauthSuccess(_)]
        ));
    }

    fn signed_publickey_request(client: &TestClient, username: &str) -> UserauthRequest {
        let key = user_key();
        let blob = key.public_key().to_wire_encoding();
        let alg = HostKeyAlgorithm::RsaSha2_256;
        let data = signature_data(
            client.session_id().unwrap(),
            username,
            CONNECTION_SERVICE,
            alg.name(),
            &blob,
        );
        let signature = key.sign(alg, &data).unwrap().to_wire_encoding();
        UserauthRequest::public_key(username, CONNECTION_SERVICE, alg.name(), &blob, Some(&signature))
    }

    #[test]
    fn rejected_public_key_keeps_connection_open() {
        let (mut session, mut client) = connect(AuthConfig::default());
        request_userauth(&mut session, &mut client);

        client.send(signed_publickey_request(&client, "bob"));
        pump(&mut session, &mut client).unwrap();

        let Some(ServerRequest::VerifyPubkey(args)) = session.next_auth_request() else {
            panic!("expected public key check");
        };
        assert_eq!(args.username, "bob");
        assert_eq!(args.session_id, session.session_id().unwrap());
        session.auth_result(false);
        pump(&mut session, &mut client).unwrap();

        let msgs = received(&mut client);
        let [Message::UserauthFailure(failure)] = msgs.as_slice() else {
            panic!("expected failure");
        };
        assert_eq!(failure.methods, vec!["publickey", "password"]);
        assert!(!failure.partial_success);
        assert!(session.identity().is_none());
        assert!(!session.is_closed());

        // The client may try again.
        client.send(signed_publickey_request(&client, "bob"));
        pump(&mut session, &mut client).unwrap();
        assert!(session.next_auth_request().is_some());
        session.auth_result(true);
        pump(&mut session, &mut client).unwrap();
        assert!(matches!(
            received(&mut client).as_slice(),
            [Message::UserauthSuccess(_)]
        ));
        assert_eq!(session.identity().unwrap().username, "bob");
    }

    #[test]
    fn pty_and_shell() {
        let (mut session, mut client) = connect(AuthConfig::default());
        log_in(&mut session, &mut client);

        client.send(ChannelOpen::new(&ChannelOpenKind::Session, 3, 1 << 20, 32768));
        client.send(ChannelRequest::new(
            0,
            true,
            &ChannelRequestKind::PtyReq {
                term: "xterm".to_owned(),
                width_chars: 132,
                height_rows: 43,
                width_px: 0,
                height_px: 0,
                term_modes: vec![0],
            },
        ));
        client.send(ChannelRequest::new(0, true, &ChannelRequestKind::Shell));
        pump(&mut session, &mut client).unwrap();

        let msgs = received(&mut client);
        assert!(matches!(
            msgs.as_slice(),
            [
                Message::ChannelOpenConfirmation(_),
                Message::ChannelSuccess(first),
                Message::ChannelSuccess(second),
            ] if first.recipient_channel == 3 && second.recipient_channel == 3
        ));

        let updates = std::iter::from_fn(|| session.next_channel_update())
            .map(|update| update.kind)
            .collect::<Vec<_>>();
        let terminal = Terminal {
            term: "xterm".to_owned(),
            width_chars: 132,
            height_rows: 43,
            width_px: 0,
            height_px: 0,
            modes: vec![0],
        };
        assert_eq!(
            updates,
            vec![
                ChannelUpdateKind::Open(ChannelOpenKind::Session),
                ChannelUpdateKind::PtyRequested(terminal.clone()),
                ChannelUpdateKind::CommandOpened {
                    command: Command::Shell,
                    pty: Some(terminal),
                },
            ]
        );
    }

    #[test]
    fn channel_data_roundtrip() {
        let (mut session, mut client) = connect(AuthConfig::default());
        log_in(&mut session, &mut client);

        client.send(ChannelOpen::new(&ChannelOpenKind::Session, 3, 1 << 20, 32768));
        client.send(ChannelData {
            recipient_channel: 0,
            data: b"ping".to_vec(),
        });
        pump(&mut session, &mut client).unwrap();
        received(&mut client);

        let number = session.next_channel_update().unwrap().number;
        assert_eq!(
            session.next_channel_update().unwrap().kind,
            ChannelUpdateKind::Data {
                data: b"ping".to_vec()
            }
        );

        session.do_operation(number.construct_op(ChannelOperationKind::Data(b"pong".to_vec())));
        pump(&mut session, &mut client).unwrap();
        assert_eq!(
            received(&mut client),
            vec![Message::ChannelData(ChannelData {
                recipient_channel: 3,
                data: b"pong".to_vec(),
            })]
        );
    }

    #[test]
    fn connection_messages_dropped_before_auth() {
        let (mut session, mut client) = connect(AuthConfig::default());
        request_userauth(&mut session, &mut client);
        client.send(ChannelOpen::new(&ChannelOpenKind::Session, 3, 1 << 20, 32768));
        pump(&mut session, &mut client).unwrap();
        assert!(received(&mut client).is_empty());
        assert!(session.next_channel_update().is_none());
    }

    #[test]
    fn connection_service_requires_authentication() {
        let (mut session, mut client) = connect(AuthConfig::default());
        client.send(ServiceRequest {
            service_name: CONNECTION_SERVICE.to_owned(),
        });
        let err = pump(&mut session, &mut client).unwrap_err();
        assert_eq!(
            err.disconnect_reason(),
            Some(numbers::SSH_DISCONNECT_SERVICE_NOT_AVAILABLE)
        );
        assert!(session.is_closed());
    }

    #[test]
    fn unknown_service() {
        let (mut session, mut client) = connect(AuthConfig::default());
        client.send(ServiceRequest {
            service_name: "ssh-telepathy".to_owned(),
        });
        let err = pump(&mut session, &mut client).unwrap_err();
        assert_eq!(
            err.disconnect_reason(),
            Some(numbers::SSH_DISCONNECT_SERVICE_NOT_AVAILABLE)
        );
    }

    #[test]
    fn repeated_service_request_is_accepted_again() {
        let (mut session, mut client) = connect(AuthConfig::default());
        let events = Arc::new(Mutex::new(Vec::new()));
        let events2 = events.clone();
        session.subscribe(move |event| {
            if let SessionEvent::ServiceRegistered(name) = event {
                events2.lock().unwrap().push(*name);
            }
        });
        request_userauth(&mut session, &mut client);
        request_userauth(&mut session, &mut client);
        assert_eq!(*events.lock().unwrap(), vec![USERAUTH_SERVICE]);
    }

    #[test]
    fn observers_run_in_order() {
        let (mut session, mut client) = connect(AuthConfig::default());
        let log = Arc::new(Mutex::new(Vec::new()));
        for id in 0..2 {
            let log = log.clone();
            session.subscribe(move |event| {
                let name = match event {
                    SessionEvent::KeysExchanged(_) => "keys",
                    SessionEvent::ServiceRegistered(name) => *name,
                    SessionEvent::Authenticated(_) => "authenticated",
                    SessionEvent::Disconnected => "disconnected",
                };
                log.lock().unwrap().push(format!("{id}:{name}"));
            });
        }

        log_in(&mut session, &mut client);
        client.start_rekey();
        pump(&mut session, &mut client).unwrap();
        session.disconnect(numbers::SSH_DISCONNECT_BY_APPLICATION, "bye");

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "0:ssh-userauth",
                "1:ssh-userauth",
                "0:ssh-connection",
                "1:ssh-connection",
                "0:authenticated",
                "1:authenticated",
                "0:keys",
                "1:keys",
                "0:disconnected",
                "1:disconnected",
            ]
        );
    }

    #[test]
    fn disconnect_closes_channels() {
        let (mut session, mut client) = connect(AuthConfig::default());
        log_in(&mut session, &mut client);
        client.send(ChannelOpen::new(&ChannelOpenKind::Session, 3, 1 << 20, 32768));
        pump(&mut session, &mut client).unwrap();
        let number = session.next_channel_update().unwrap().number;

        session.disconnect(numbers::SSH_DISCONNECT_BY_APPLICATION, "bye");
        let closed = session.next_channel_update().unwrap();
        assert_eq!(closed.number, number);
        assert_eq!(closed.kind, ChannelUpdateKind::Closed);
        assert!(session.is_closed());
    }

    #[test]
    fn variables() {
        let (mut session, _client) = connect(AuthConfig::default());
        session.set_variable("home", "/home/alice".to_owned());
        session.set_variable("uid", 1000u32);
        assert_eq!(session.variable::<String>("home").map(String::as_str), Some("/home/alice"));
        assert_eq!(session.variable::<u32>("uid"), Some(&1000));
        assert_eq!(session.variable::<u64>("uid"), None);
        assert!(session.remove_variable("uid"));
        assert_eq!(session.variable::<u32>("uid"), None);
    }
}
