//! Host key and public key primitives: RSA and DSA.

pub mod host_keys;
pub mod private;
pub mod public;
pub mod signature;

use std::fmt::Display;
use std::str::FromStr;

use sha2::Digest;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unsupported key algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("invalid base64 key material")]
    InvalidBase64(#[from] base64::DecodeError),
    #[error("invalid {key_type} key: {message}")]
    InvalidKey {
        key_type: KeyType,
        message: String,
    },
    #[error("algorithm {algorithm} cannot be used with a {key_type} key")]
    KeyTypeMismatch {
        algorithm: HostKeyAlgorithm,
        key_type: KeyType,
    },
    #[error("signature algorithm mismatch: expected {expected}, found {found}")]
    SignatureAlgorithmMismatch {
        expected: HostKeyAlgorithm,
        found: String,
    },
    #[error("signing failed: {0}")]
    Signing(String),
    #[error(transparent)]
    Format(#[from] skiff_format::ParseError),
}

/// The kind of key material, independent of the hash used for signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    Rsa,
    Dss,
}

impl KeyType {
    /// The name used in public key blobs.
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::Rsa => "ssh-rsa",
            Self::Dss => "ssh-dss",
        }
    }
}

impl Display for KeyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// A signature algorithm as negotiated in KEXINIT and used in public key authentication.
/// <https://datatracker.ietf.org/doc/html/rfc8332>
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostKeyAlgorithm {
    RsaSha2_256,
    RsaSha2_512,
    SshDss,
}

impl HostKeyAlgorithm {
    /// In order of preference.
    pub const ALL: [Self; 3] = [Self::RsaSha2_256, Self::RsaSha2_512, Self::SshDss];

    pub fn name(self) -> &'static str {
        match self {
            Self::RsaSha2_256 => "rsa-sha2-256",
            Self::RsaSha2_512 => "rsa-sha2-512",
            Self::SshDss => "ssh-dss",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|alg| alg.name() == name)
    }

    pub fn key_type(self) -> KeyType {
        match self {
            Self::RsaSha2_256 | Self::RsaSha2_512 => KeyType::Rsa,
            Self::SshDss => KeyType::Dss,
        }
    }

    /// Hashes a message the way this algorithm does before signing.
    pub fn hash(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::RsaSha2_256 => sha2::Sha256::digest(data).to_vec(),
            Self::RsaSha2_512 => sha2::Sha512::digest(data).to_vec(),
            Self::SshDss => sha1::Sha1::digest(data).to_vec(),
        }
    }
}

impl Display for HostKeyAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HostKeyAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| Error::UnsupportedAlgorithm(s.to_owned()))
    }
}

#[cfg(test)]
pub(crate) mod test_keys {
    use crate::{private::PrivateKey, KeyType};

    pub const HOST_RSA: &str = include_str!("../testdata/host_rsa.b64");
    pub const USER_RSA: &str = include_str!("../testdata/user_rsa.b64");
    pub const HOST_DSS: &str = include_str!("../testdata/host_dss.b64");

    pub fn rsa() -> PrivateKey {
        PrivateKey::from_base64(KeyType::Rsa, HOST_RSA).unwrap()
    }

    pub fn other_rsa() -> PrivateKey {
        PrivateKey::from_base64(KeyType::Rsa, USER_RSA).unwrap()
    }

    pub fn dss() -> PrivateKey {
        PrivateKey::from_base64(KeyType::Dss, HOST_DSS).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn algorithm_names() {
        for alg in HostKeyAlgorithm::ALL {
            assert_eq!(HostKeyAlgorithm::from_name(alg.name()), Some(alg));
        }
        assert_eq!(HostKeyAlgorithm::from_name("ssh-ed25519"), None);
        assert!("ssh-rsa".parse::<HostKeyAlgorithm>().is_err());
        assert_eq!(HostKeyAlgorithm::RsaSha2_512.key_type(), KeyType::Rsa);
        assert_eq!(HostKeyAlgorithm::SshDss.hash(b"").len(), 20);
    }
}
