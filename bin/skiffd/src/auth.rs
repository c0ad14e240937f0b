use std::{collections::HashMap, sync::Arc};

use eyre::{bail, OptionExt, Result, WrapErr};
use futures::FutureExt;
use secrecy::{ExposeSecret, SecretString};
use skiff_keys::public::PublicKey;
use skiff_protocol::auth::{Credential, UserAuthArgs};
use skiff_tokio::server::{AuthVerifier, ServerAuth};
use tracing::{debug, info};

use crate::config::UserConfig;

struct User {
    password: Option<SecretString>,
    authorized_keys: Vec<PublicKey>,
}

/// Decides authentication attempts from the users in the config file.
pub struct Authorizer {
    users: HashMap<String, User>,
    password_login: bool,
}

impl Authorizer {
    pub fn new(users: HashMap<String, UserConfig>, password_login: bool) -> Result<Self> {
        let users = users
            .into_iter()
            .map(|(name, user)| {
                let authorized_keys = user
                    .authorized_keys
                    .iter()
                    .map(|line| line.parse::<PublicKey>())
                    .collect::<Result<Vec<_>, _>>()
                    .wrap_err_with(|| format!("invalid authorized key for user {name}"))?;
                Ok((
                    name,
                    User {
                        password: user.password,
                        authorized_keys,
                    },
                ))
            })
            .collect::<Result<HashMap<_, _>>>()?;

        Ok(Self {
            users,
            password_login,
        })
    }

    /// Public keys are always offered, passwords only if enabled.
    pub fn server_auth(self: Arc<Self>, banner: Option<String>) -> ServerAuth {
        let password_auth = self.clone();
        let pubkey_auth = self.clone();
        let verify_password: Option<AuthVerifier> = if self.password_login {
            Some(Arc::new(move |args: UserAuthArgs| {
                let auth = password_auth.clone();
                async move { auth.verify_password(args).await }.boxed()
            }))
        } else {
            None
        };
        ServerAuth {
            verify_password,
            verify_pubkey: Some(Arc::new(move |args: UserAuthArgs| {
                let auth = pubkey_auth.clone();
                async move { auth.verify_pubkey(args).await }.boxed()
            })),
            banner,
        }
    }

    pub async fn verify_password(&self, args: UserAuthArgs) -> Result<()> {
        let Credential::Password(password) = &args.credential else {
            bail!("not a password");
        };
        let user = self.users.get(&args.username).ok_or_eyre("unknown user")?;
        let Some(expected) = &user.password else {
            bail!("user has no password");
        };
        if expected.expose_secret() != password {
            bail!("wrong password");
        }
        info!(user = %args.username, "Password accepted");
        Ok(())
    }

    pub async fn verify_pubkey(&self, args: UserAuthArgs) -> Result<()> {
        let Credential::PublicKey {
            key_blob,
            fingerprint,
            ..
        } = &args.credential
        else {
            bail!("not a public key");
        };
        let user = self.users.get(&args.username).ok_or_eyre("unknown user")?;
        let key = PublicKey::from_wire_encoding(key_blob)?;
        if !user.authorized_keys.contains(&key) {
            debug!(user = %args.username, %fingerprint, "Key is not authorized");
            bail!("key {fingerprint} is not authorized");
        }
        Ok(())
    }
}
