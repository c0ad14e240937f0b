//! Operations on SSH public keys.

use std::fmt::Display;
use std::str::FromStr;

use base64::Engine;
use dsa::signature::hazmat::PrehashVerifier;
use md5::{Digest, Md5};
use rsa::traits::PublicKeyParts;
use tracing::debug;

use skiff_format::{ParseError, Reader, Writer};

use crate::{Error, HostKeyAlgorithm, KeyType};

#[derive(Debug, Clone)]
pub enum PublicKey {
    Rsa { public_key: rsa::RsaPublicKey },
    Dss { public_key: dsa::VerifyingKey },
}

impl PublicKey {
    /// Parses an SSH public key from its wire encoding as specified in
    /// RFC4253 section 6.6.
    pub fn from_wire_encoding(bytes: &[u8]) -> skiff_format::Result<Self> {
        let mut p = Reader::new(bytes);
        let alg = p.utf8_string()?;

        let k = match alg {
            "ssh-rsa" => {
                let e = p.mpint()?;
                let n = p.mpint()?;
                let public_key = rsa::RsaPublicKey::new(
                    rsa::BigUint::from_bytes_be(n),
                    rsa::BigUint::from_bytes_be(e),
                )
                .map_err(|err| ParseError(format!("invalid RSA public key: {err}")))?;
                Self::Rsa { public_key }
            }
            "ssh-dss" => {
                let mut int = || p.mpint().map(dsa::BigUint::from_bytes_be);
                let (p_, q, g, y) = (int()?, int()?, int()?, int()?);
                let components = dsa::Components::from_components(p_, q, g)
                    .map_err(|_| ParseError(format!("invalid DSA parameters")))?;
                let public_key = dsa::VerifyingKey::from_components(components, y)
                    .map_err(|_| ParseError(format!("invalid DSA public key")))?;
                Self::Dss { public_key }
            }
            _ => return Err(ParseError(format!("unsupported key type: {alg}"))),
        };
        p.finish()?;
        Ok(k)
    }

    pub fn to_wire_encoding(&self) -> Vec<u8> {
        let mut p = Writer::new();
        p.string(self.key_type().wire_name());
        match self {
            Self::Rsa { public_key } => {
                p.mpint(&public_key.e().to_bytes_be());
                p.mpint(&public_key.n().to_bytes_be());
            }
            Self::Dss { public_key } => {
                let components = public_key.components();
                p.mpint(&components.p().to_bytes_be());
                p.mpint(&components.q().to_bytes_be());
                p.mpint(&components.g().to_bytes_be());
                p.mpint(&public_key.y().to_bytes_be());
            }
        }
        p.finish()
    }

    pub fn key_type(&self) -> KeyType {
        match self {
            Self::Rsa { .. } => KeyType::Rsa,
            Self::Dss { .. } => KeyType::Dss,
        }
    }

    /// Verifies a signature blob (`string algorithm || string signature`) over `data`.
    /// A blob tagged with a different algorithm than `algorithm` never verifies.
    pub fn verify_signature(&self, algorithm: HostKeyAlgorithm, data: &[u8], signature: &[u8]) -> bool {
        self.verify_hash(algorithm, &algorithm.hash(data), signature)
    }

    /// Like [`Self::verify_signature`], but over an already computed hash of the message.
    pub fn verify_hash(&self, algorithm: HostKeyAlgorithm, hash: &[u8], signature: &[u8]) -> bool {
        if algorithm.key_type() != self.key_type() {
            debug!(%algorithm, key_type = %self.key_type(), "Signature algorithm does not match key type");
            return false;
        }
        let mut s = Reader::new(signature);
        let Ok(alg) = s.utf8_string() else {
            return false;
        };
        if alg != algorithm.name() {
            debug!(expected = %algorithm, found = %alg, "Signature algorithm mismatch");
            return false;
        }
        let Ok(raw) = s.string() else {
            return false;
        };

        match self {
            Self::Rsa { public_key } => {
                let scheme = match algorithm {
                    HostKeyAlgorithm::RsaSha2_256 => rsa::Pkcs1v15Sign::new::<sha2::Sha256>(),
                    HostKeyAlgorithm::RsaSha2_512 => rsa::Pkcs1v15Sign::new::<sha2::Sha512>(),
                    HostKeyAlgorithm::SshDss => return false,
                };
                // Some implementations strip leading zeroes from the signature.
                let size = public_key.size();
                if raw.len() > size {
                    return false;
                }
                let mut padded = vec![0; size - raw.len()];
                padded.extend_from_slice(raw);
                public_key.verify(scheme, hash, &padded).is_ok()
            }
            Self::Dss { public_key } => {
                // <https://datatracker.ietf.org/doc/html/rfc4253#section-6.6>
                // r and s as 160-bit unsigned integers, without lengths or padding.
                if raw.len() != 40 {
                    debug!(len = %raw.len(), "Invalid ssh-dss signature length");
                    return false;
                }
                let (r, s) = raw.split_at(20);
                let Ok(signature) = dsa::Signature::from_components(
                    dsa::BigUint::from_bytes_be(r),
                    dsa::BigUint::from_bytes_be(s),
                ) else {
                    return false;
                };
                public_key.verify_prehash(hash, &signature).is_ok()
            }
        }
    }

    /// The MD5 fingerprint as colon separated hex, like `16:27:ac:...`.
    pub fn fingerprint(&self) -> String {
        let digest = Md5::digest(self.to_wire_encoding());
        digest
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":")
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.to_wire_encoding() == other.to_wire_encoding()
    }
}
impl Eq for PublicKey {}

impl Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let encoded_pubkey = base64::prelude::BASE64_STANDARD.encode(self.to_wire_encoding());
        write!(f, "{} {encoded_pubkey}", self.key_type())
    }
}

/// Parses the OpenSSH one-line format: `ssh-rsa AAAA... [comment]`.
impl FromStr for PublicKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        let (Some(alg), Some(data)) = (parts.next(), parts.next()) else {
            return Err(Error::Format(ParseError(format!("missing public key data"))));
        };
        let blob = base64::prelude::BASE64_STANDARD.decode(data)?;
        let key = Self::from_wire_encoding(&blob)?;
        if key.key_type().wire_name() != alg {
            return Err(Error::UnsupportedAlgorithm(alg.to_owned()));
        }
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use crate::test_keys;
    use crate::{HostKeyAlgorithm, KeyType};

    use super::PublicKey;

    #[test]
    fn wire_encoding_roundtrip() {
        for key in [test_keys::rsa(), test_keys::dss()] {
            let public = key.public_key();
            let encoded = public.to_wire_encoding();
            let decoded = PublicKey::from_wire_encoding(&encoded).unwrap();
            assert_eq!(public, decoded);
        }
    }

    #[test]
    fn rsa_blob_uses_ssh_rsa_name() {
        let encoded = test_keys::rsa().public_key().to_wire_encoding();
        assert_eq!(&encoded[4..11], b"ssh-rsa");
    }

    #[test]
    fn trailing_data_rejected() {
        let mut encoded = test_keys::dss().public_key().to_wire_encoding();
        encoded.push(0);
        assert!(PublicKey::from_wire_encoding(&encoded).is_err());
    }

    #[test]
    fn fingerprint_format() {
        let fingerprint = test_keys::rsa().public_key().fingerprint();
        assert_eq!(fingerprint.len(), 16 * 3 - 1);
        assert_eq!(fingerprint.split(':').count(), 16);
    }

    #[test]
    fn openssh_line_roundtrip() {
        let public = test_keys::dss().public_key();
        let line = format!("{public} some comment");
        let parsed = line.parse::<PublicKey>().unwrap();
        assert_eq!(parsed, public);
        assert_eq!(parsed.key_type(), KeyType::Dss);
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let data = b"data";
        let signature = test_keys::rsa()
            .sign(HostKeyAlgorithm::RsaSha2_256, data)
            .unwrap()
            .to_wire_encoding();
        let other = test_keys::other_rsa().public_key();
        assert!(!other.verify_signature(HostKeyAlgorithm::RsaSha2_256, data, &signature));
    }
}
