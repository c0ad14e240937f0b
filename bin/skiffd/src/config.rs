use eyre::{Context, Result};
use secrecy::SecretString;
use serde::Deserialize;
use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr},
    path::PathBuf,
};

use crate::Args;

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_info")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default)]
    pub net: NetConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    /// Algorithm name (`rsa-sha2-256`, `rsa-sha2-512`, `ssh-dss`) to a file with the base64 encoded key.
    pub host_keys: HashMap<String, PathBuf>,
    #[serde(default)]
    pub users: HashMap<String, UserConfig>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetConfig {
    #[serde(default = "addr_default")]
    pub ip: IpAddr,
    #[serde(default = "port_default")]
    pub port: u16,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            ip: addr_default(),
            port: port_default(),
        }
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// The identification string sent to clients, `SSH-2.0-...`.
    #[serde(default = "identification_default")]
    pub identification: String,
    #[serde(default = "inactivity_timeout_default")]
    pub inactivity_timeout_secs: u64,
    #[serde(default = "rekey_threshold_default")]
    pub rekey_threshold_bytes: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            identification: identification_default(),
            inactivity_timeout_secs: inactivity_timeout_default(),
            rekey_threshold_bytes: rekey_threshold_default(),
        }
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    pub banner: Option<String>,
    #[serde(default = "default_true")]
    pub password_login: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            banner: None,
            password_login: true,
        }
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserConfig {
    pub password: Option<SecretString>,
    /// Public keys in the `ssh-rsa AAAA... comment` format.
    #[serde(default)]
    pub authorized_keys: Vec<String>,
}

impl Config {
    pub fn load(args: &Args) -> Result<Self> {
        let path = std::env::var("SKIFFD_CONFIG")
            .map(PathBuf::from)
            .or(args.config.clone().ok_or(std::env::VarError::NotPresent))
            .unwrap_or_else(|_| PathBuf::from("skiffd.toml"));

        let content = std::fs::read_to_string(&path).wrap_err_with(|| {
            format!("failed to open config file '{}', refusing to start. you can change the config file path with the --config arg or the SKIFFD_CONFIG environment variable", path.display())
        })?;

        Self::parse(&content).wrap_err_with(|| format!("invalid config file '{}'", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }
}

fn default_info() -> String {
    "info".to_owned()
}

fn default_true() -> bool {
    true
}

fn addr_default() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn port_default() -> u16 {
    22
}

fn identification_default() -> String {
    skiff_transport::server::DEFAULT_SERVER_IDENTIFICATION.to_owned()
}

fn inactivity_timeout_default() -> u64 {
    skiff_tokio::server::DEFAULT_INACTIVITY_TIMEOUT.as_secs()
}

fn rekey_threshold_default() -> u64 {
    skiff_transport::server::DEFAULT_REKEY_THRESHOLD
}
