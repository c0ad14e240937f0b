//! The server side of the authentication protocol.
//! <https://datatracker.ietf.org/doc/html/rfc4252>

use std::collections::{HashSet, VecDeque};

use skiff_keys::public::PublicKey;
use skiff_keys::signature::signature_data;
use skiff_keys::HostKeyAlgorithm;
use skiff_transport::message::{
    AuthMethod, Message, UserauthBanner, UserauthFailure, UserauthPkOk, UserauthRequest,
    UserauthSuccess,
};
use skiff_transport::{peer_error, Result};
use tracing::{debug, info};

use crate::CONNECTION_SERVICE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthOption {
    PublicKey,
    Password,
}

impl AuthOption {
    pub fn name(self) -> &'static str {
        match self {
            Self::PublicKey => "publickey",
            Self::Password => "password",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub options: HashSet<AuthOption>,
    /// Sent once, before the first reply to an authentication request.
    pub banner: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            options: HashSet::from([AuthOption::PublicKey, AuthOption::Password]),
            banner: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Password(String),
    PublicKey {
        algorithm: HostKeyAlgorithm,
        key_blob: Vec<u8>,
        /// MD5 fingerprint of the key.
        fingerprint: String,
    },
}

/// One authentication attempt, handed to the authorizer.
/// A successful one stays around as the identity of the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAuthArgs {
    pub username: String,
    pub credential: Credential,
    pub session_id: Vec<u8>,
}

impl UserAuthArgs {
    pub fn method(&self) -> AuthOption {
        match self.credential {
            Credential::Password(_) => AuthOption::Password,
            Credential::PublicKey { .. } => AuthOption::PublicKey,
        }
    }
}

/// A decision the authorizer has to make, answered with [`ServerAuth::verification_result`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerRequest {
    VerifyPassword(UserAuthArgs),
    /// Either a signature has been verified already, or the client asks whether the key would be acceptable.
    VerifyPubkey(UserAuthArgs),
}

struct PendingCheck {
    args: UserAuthArgs,
    /// A public key query without a signature, answered with PK_OK.
    is_query: bool,
}

pub struct ServerAuth {
    config: AuthConfig,
    session_id: Vec<u8>,
    banner_sent: bool,
    messages_to_send: VecDeque<Message>,
    server_requests: VecDeque<ServerRequest>,
    pending: Option<PendingCheck>,
    /// Requests that arrived while the authorizer was deciding, answered in order.
    deferred: VecDeque<(UserauthRequest, AuthMethod)>,
    authenticated: Option<UserAuthArgs>,
}

impl ServerAuth {
    pub fn new(session_id: Vec<u8>, config: AuthConfig) -> Self {
        Self {
            config,
            session_id,
            banner_sent: false,
            messages_to_send: VecDeque::new(),
            server_requests: VecDeque::new(),
            pending: None,
            deferred: VecDeque::new(),
            authenticated: None,
        }
    }

    pub fn recv_message(&mut self, msg: Message) -> Result<()> {
        let Message::UserauthRequest(req) = msg else {
            return Err(peer_error!(
                "unexpected message in the authentication protocol: {}",
                skiff_format::numbers::packet_type_to_string(msg.message_type())
            ));
        };
        if self.authenticated.is_some() {
            // <https://datatracker.ietf.org/doc/html/rfc4252#section-5.1>
            debug!("Ignoring authentication request after success");
            return Ok(());
        }
        let method = req.method()?;
        if self.pending.is_some() {
            // <https://datatracker.ietf.org/doc/html/rfc4252#section-5>
            debug!("Deferring authentication request until the current one is decided");
            self.deferred.push_back((req, method));
            return Ok(());
        }
        self.process_request(req, method);
        Ok(())
    }

    fn process_request(&mut self, req: UserauthRequest, method: AuthMethod) {
        self.send_banner();

        if req.method_name != "none" {
            info!(
                username = %req.username,
                service_name = %req.service_name,
                method_name = %req.method_name,
                "User trying to authenticate"
            );
        }

        if req.service_name != CONNECTION_SERVICE {
            debug!(service_name = %req.service_name, "Authentication for unknown service");
            self.send_failure();
            return;
        }

        match method {
            AuthMethod::Password {
                password,
                new_password: None,
            } if self.config.options.contains(&AuthOption::Password) => {
                let args = self.args(&req, Credential::Password(password));
                self.pending = Some(PendingCheck {
                    args: args.clone(),
                    is_query: false,
                });
                self.server_requests
                    .push_back(ServerRequest::VerifyPassword(args));
            }
            AuthMethod::PublicKey {
                algorithm,
                key_blob,
                signature,
            } if self.config.options.contains(&AuthOption::PublicKey) => {
                self.recv_public_key(&req, &algorithm, key_blob, signature)
            }
            _ => self.send_failure(),
        }
    }

    // <https://datatracker.ietf.org/doc/html/rfc4252#section-7>
    fn recv_public_key(
        &mut self,
        req: &UserauthRequest,
        algorithm_name: &str,
        key_blob: Vec<u8>,
        signature: Option<Vec<u8>>,
    ) {
        let Some(algorithm) = HostKeyAlgorithm::from_name(algorithm_name) else {
            debug!(algorithm = %algorithm_name, "Unsupported public key algorithm");
            self.send_failure();
            return;
        };
        let public_key = match PublicKey::from_wire_encoding(&key_blob) {
            Ok(key) if key.key_type() == algorithm.key_type() => key,
            Ok(_) => {
                debug!(%algorithm, "Public key does not match the algorithm");
                self.send_failure();
                return;
            }
            Err(err) => {
                debug!(%err, "Invalid public key");
                self.send_failure();
                return;
            }
        };

        let is_query = match &signature {
            None => true,
            Some(signature) => {
                let data = signature_data(
                    &self.session_id,
                    &req.username,
                    &req.service_name,
                    algorithm_name,
                    &key_blob,
                );
                if !public_key.verify_signature(algorithm, &data, signature) {
                    debug!(username = %req.username, "Invalid public key signature");
                    self.send_failure();
                    return;
                }
                false
            }
        };

        let args = self.args(
            req,
            Credential::PublicKey {
                algorithm,
                key_blob,
                fingerprint: public_key.fingerprint(),
            },
        );
        self.pending = Some(PendingCheck {
            args: args.clone(),
            is_query,
        });
        self.server_requests
            .push_back(ServerRequest::VerifyPubkey(args));
    }

    /// The authorizer's answer to the last [`ServerRequest`].
    /// Requests received in the meantime are processed afterwards.
    pub fn verification_result(&mut self, accepted: bool) {
        let Some(PendingCheck { args, is_query }) = self.pending.take() else {
            debug!("Verification result without a pending request");
            return;
        };
        self.reply_to_check(args, is_query, accepted);

        while self.pending.is_none() {
            let Some((req, method)) = self.deferred.pop_front() else {
                break;
            };
            if self.authenticated.is_some() {
                debug!("Ignoring authentication request after success");
                continue;
            }
            self.process_request(req, method);
        }
    }

    fn reply_to_check(&mut self, args: UserAuthArgs, is_query: bool, accepted: bool) {
        if !accepted {
            info!(username = %args.username, method = %args.method().name(), "Failed authentication");
            self.send_failure();
            return;
        }

        match (&args.credential, is_query) {
            (
                Credential::PublicKey {
                    algorithm,
                    key_blob,
                    ..
                },
                true,
            ) => {
                debug!(username = %args.username, "Public key is acceptable");
                self.queue(UserauthPkOk {
                    algorithm: algorithm.name().to_owned(),
                    key_blob: key_blob.clone(),
                });
            }
            _ => {
                info!(username = %args.username, method = %args.method().name(), "Successful authentication");
                self.queue(UserauthSuccess {});
                self.authenticated = Some(args);
            }
        }
    }

    fn args(&self, req: &UserauthRequest, credential: Credential) -> UserAuthArgs {
        UserAuthArgs {
            username: req.username.clone(),
            credential,
            session_id: self.session_id.clone(),
        }
    }

    fn send_banner(&mut self) {
        if self.banner_sent {
            return;
        }
        self.banner_sent = true;
        if let Some(banner) = self.config.banner.clone() {
            self.queue(UserauthBanner {
                message: banner,
                language_tag: String::new(),
            });
        }
    }

    fn send_failure(&mut self) {
        let methods = [AuthOption::PublicKey, AuthOption::Password]
            .into_iter()
            .filter(|option| self.config.options.contains(option))
            .map(|option| option.name().to_owned())
            .collect();
        self.queue(UserauthFailure {
            methods,
            partial_success: false,
        });
    }

    fn queue(&mut self, msg: impl Into<Message>) {
        self.messages_to_send.push_back(msg.into());
    }

    pub fn next_msg_to_send(&mut self) -> Option<Message> {
        self.messages_to_send.pop_front()
    }

    pub fn next_server_request(&mut self) -> Option<ServerRequest> {
        self.server_requests.pop_front()
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.is_some()
    }

    pub fn authenticated(&self) -> Option<&UserAuthArgs> {
        self.authenticated.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use skiff_keys::signature::signature_data;
    use skiff_keys::HostKeyAlgorithm;
    use skiff_transport::message::{Message, UserauthFailure, UserauthRequest};
    use skiff_transport::testing::user_key;

    use super::*;

    const SESSION_ID: &[u8] = &[0xab; 32];

    fn auth(config: AuthConfig) -> ServerAuth {
        ServerAuth::new(SESSION_ID.to_vec(), config)
    }

    fn sent(auth: &mut ServerAuth) -> Vec<Message> {
        std::iter::from_fn(|| auth.next_msg_to_send()).collect()
    }

    fn failure(methods: &[&str]) -> Message {
        Message::UserauthFailure(UserauthFailure {
            methods: methods.iter().map(|m| m.to_string()).collect(),
            partial_success: false,
        })
    }

    fn signed_request(username: &str, algorithm: HostKeyAlgorithm) -> UserauthRequest {
        let key = user_key();
        let blob = key.public_key().to_wire_encoding();
        let data = signature_data(SESSION_ID, username, "ssh-connection", algorithm.name(), &blob);
        let signature = key.sign(algorithm, &data).unwrap().to_wire_encoding();
        UserauthRequest::public_key(
            username,
            "ssh-connection",
            algorithm.name(),
            &blob,
            Some(&signature),
        )
    }

    #[test]
    fn none_lists_methods() {
        let mut auth = auth(AuthConfig::default());
        auth.recv_message(UserauthRequest::none("alice", "ssh-connection").into())
            .unwrap();
        assert_eq!(sent(&mut auth), vec![failure(&["publickey", "password"])]);
        assert!(auth.next_server_request().is_none());
    }

    #[test]
    fn failure_lists_only_configured_methods() {
        let mut auth = auth(AuthConfig {
            options: HashSet::from([AuthOption::Password]),
            banner: None,
        });
        auth.recv_message(signed_request("alice", HostKeyAlgorithm::RsaSha2_256).into())
            .unwrap();
        assert_eq!(sent(&mut auth), vec![failure(&["password"])]);
        assert!(auth.next_server_request().is_none());
    }

    #[test]
    fn banner_sent_once() {
        let mut auth = auth(AuthConfig {
            banner: Some("welcome\r\n".to_owned()),
            ..AuthConfig::default()
        });
        auth.recv_message(UserauthRequest::none("alice", "ssh-connection").into())
            .unwrap();
        auth.recv_message(UserauthRequest::none("alice", "ssh-connection").into())
            .unwrap();
        let msgs = sent(&mut auth);
        assert_eq!(msgs.len(), 3);
        assert!(matches!(&msgs[0], Message::UserauthBanner(banner) if banner.message == "welcome\r\n"));
        assert_eq!(msgs[1], failure(&["publickey", "password"]));
        assert_eq!(msgs[2], failure(&["publickey", "password"]));
    }

    #[test]
    fn password_accepted() {
        let mut auth = auth(AuthConfig::default());
        auth.recv_message(UserauthRequest::password("alice", "ssh-connection", "hunter2").into())
            .unwrap();
        assert!(sent(&mut auth).is_empty());

        let Some(ServerRequest::VerifyPassword(args)) = auth.next_server_request() else {
            panic!("expected password verification");
        };
        assert_eq!(args.username, "alice");
        assert_eq!(args.credential, Credential::Password("hunter2".to_owned()));
        assert_eq!(args.session_id, SESSION_ID);

        auth.verification_result(true);
        assert_eq!(sent(&mut auth), vec![Message::UserauthSuccess(UserauthSuccess {})]);
        assert_eq!(auth.authenticated(), Some(&args));
    }

    #[test]
    fn password_rejected_allows_retry() {
        let mut auth = auth(AuthConfig::default());
        auth.recv_message(UserauthRequest::password("alice", "ssh-connection", "wrong").into())
            .unwrap();
        auth.next_server_request().unwrap();
        auth.verification_result(false);
        assert_eq!(sent(&mut auth), vec![failure(&["publickey", "password"])]);
        assert!(!auth.is_authenticated());

        auth.recv_message(UserauthRequest::password("alice", "ssh-connection", "right").into())
            .unwrap();
        auth.next_server_request().unwrap();
        auth.verification_result(true);
        assert!(auth.is_authenticated());
    }

    #[test]
    fn public_key_signature_verified_before_authorizer() {
        for algorithm in [HostKeyAlgorithm::RsaSha2_256, HostKeyAlgorithm::RsaSha2_512] {
            let mut auth = auth(AuthConfig::default());
            auth.recv_message(signed_request("bob", algorithm).into())
                .unwrap();
            let Some(ServerRequest::VerifyPubkey(args)) = auth.next_server_request() else {
                panic!("expected public key verification");
            };
            let Credential::PublicKey {
                algorithm: found,
                fingerprint,
                ..
            } = &args.credential
            else {
                panic!("expected public key credential");
            };
            assert_eq!(*found, algorithm);
            assert_eq!(fingerprint, &user_key().public_key().fingerprint());

            auth.verification_result(true);
            assert_eq!(sent(&mut auth), vec![Message::UserauthSuccess(UserauthSuccess {})]);
        }
    }

    #[test]
    fn bad_signature_looks_like_rejection() {
        let mut auth = auth(AuthConfig::default());
        // Signed for a different user than the one in the request.
        let good = signed_request("bob", HostKeyAlgorithm::RsaSha2_256);
        let AuthMethod::PublicKey {
            key_blob,
            signature,
            ..
        } = good.method().unwrap()
        else {
            unreachable!()
        };
        let forged = UserauthRequest::public_key(
            "root",
            "ssh-connection",
            "rsa-sha2-256",
            &key_blob,
            signature.as_deref(),
        );
        auth.recv_message(forged.into()).unwrap();
        assert!(auth.next_server_request().is_none());
        let bad_signature_reply = sent(&mut auth);

        let mut auth2 = self::auth(AuthConfig::default());
        auth2
            .recv_message(signed_request("root", HostKeyAlgorithm::RsaSha2_256).into())
            .unwrap();
        auth2.next_server_request().unwrap();
        auth2.verification_result(false);
        assert_eq!(bad_signature_reply, sent(&mut auth2));
    }

    #[test]
    fn public_key_query_asks_authorizer() {
        let key = user_key();
        let blob = key.public_key().to_wire_encoding();
        let mut auth = auth(AuthConfig::default());
        auth.recv_message(
            UserauthRequest::public_key("bob", "ssh-connection", "rsa-sha2-512", &blob, None)
                .into(),
        )
        .unwrap();
        assert!(matches!(
            auth.next_server_request(),
            Some(ServerRequest::VerifyPubkey(_))
        ));
        auth.verification_result(true);
        assert_eq!(
            sent(&mut auth),
            vec![Message::UserauthPkOk(UserauthPkOk {
                algorithm: "rsa-sha2-512".to_owned(),
                key_blob: blob,
            })]
        );
        assert!(!auth.is_authenticated());
    }

    #[test]
    fn key_must_match_algorithm() {
        let key = user_key();
        let blob = key.public_key().to_wire_encoding();
        let mut auth = auth(AuthConfig::default());
        auth.recv_message(
            UserauthRequest::public_key("bob", "ssh-connection", "ssh-dss", &blob, None).into(),
        )
        .unwrap();
        assert!(auth.next_server_request().is_none());
        assert_eq!(sent(&mut auth), vec![failure(&["publickey", "password"])]);
    }

    #[test]
    fn unknown_method_and_service_fail() {
        let mut auth = auth(AuthConfig::default());
        auth.recv_message(
            UserauthRequest {
                username: "alice".to_owned(),
                service_name: "ssh-connection".to_owned(),
                method_name: "keyboard-interactive".to_owned(),
                method_data: Vec::new(),
            }
            .into(),
        )
        .unwrap();
        auth.recv_message(UserauthRequest::password("alice", "sftp-only", "pw").into())
            .unwrap();
        assert_eq!(sent(&mut auth).len(), 2);
        assert!(auth.next_server_request().is_none());
    }

    #[test]
    fn pipelined_requests_answered_in_order() {
        let mut auth = auth(AuthConfig::default());
        auth.recv_message(UserauthRequest::password("alice", "ssh-connection", "a").into())
            .unwrap();
        auth.recv_message(UserauthRequest::none("alice", "ssh-connection").into())
            .unwrap();
        auth.recv_message(UserauthRequest::password("alice", "ssh-connection", "b").into())
            .unwrap();
        assert!(sent(&mut auth).is_empty());

        let Some(ServerRequest::VerifyPassword(first)) = auth.next_server_request() else {
            panic!("expected password verification");
        };
        assert_eq!(first.credential, Credential::Password("a".to_owned()));
        assert!(auth.next_server_request().is_none());

        auth.verification_result(false);
        assert_eq!(
            sent(&mut auth),
            vec![failure(&["publickey", "password"]), failure(&["publickey", "password"])]
        );

        let Some(ServerRequest::VerifyPassword(second)) = auth.next_server_request() else {
            panic!("expected password verification");
        };
        assert_eq!(second.credential, Credential::Password("b".to_owned()));
        auth.verification_result(true);
        assert_eq!(sent(&mut auth), vec![Message::UserauthSuccess(UserauthSuccess {})]);
    }

    #[test]
    fn pipelined_requests_after_success_ignored() {
        let mut auth = auth(AuthConfig::default());
        auth.recv_message(UserauthRequest::password("alice", "ssh-connection", "a").into())
            .unwrap();
        auth.recv_message(UserauthRequest::password("mallory", "ssh-connection", "b").into())
            .unwrap();
        auth.next_server_request().unwrap();
        auth.verification_result(true);
        assert_eq!(sent(&mut auth), vec![Message::UserauthSuccess(UserauthSuccess {})]);
        assert!(auth.next_server_request().is_none());
        assert_eq!(auth.authenticated().unwrap().username, "alice");
    }
}
