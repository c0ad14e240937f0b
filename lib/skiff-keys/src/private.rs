use std::fmt::Debug;

use base64::Engine;
use dsa::signature::hazmat::PrehashSigner;
use rand_core::CryptoRngCore;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey};

use crate::public::PublicKey;
use crate::signature::Signature;
use crate::{Error, HostKeyAlgorithm, KeyType};

/// Size of a DSA signature component for the 160 bit subgroup.
const DSS_COMPONENT_LEN: usize = 20;
const RSA_GENERATED_BITS: usize = 3072;

/// A private key.
/// RSA keys are stored as PKCS#1 DER, DSA keys as PKCS#8 DER.
#[derive(Clone)]
pub enum PrivateKey {
    Rsa { private_key: Box<rsa::RsaPrivateKey> },
    Dss { private_key: dsa::SigningKey },
}

impl Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKey")
            .field("public_key", &format_args!("{}", self.public_key()))
            .finish_non_exhaustive()
    }
}

impl PrivateKey {
    pub fn import(key_type: KeyType, der: &[u8]) -> Result<Self, Error> {
        let invalid = |message: String| Error::InvalidKey { key_type, message };
        match key_type {
            KeyType::Rsa => {
                let private_key = rsa::RsaPrivateKey::from_pkcs1_der(der)
                    .map_err(|err| invalid(err.to_string()))?;
                private_key
                    .validate()
                    .map_err(|err| invalid(err.to_string()))?;
                Ok(Self::Rsa {
                    private_key: Box::new(private_key),
                })
            }
            KeyType::Dss => {
                let private_key = dsa::SigningKey::from_pkcs8_der(der)
                    .map_err(|err| invalid(err.to_string()))?;
                Ok(Self::Dss { private_key })
            }
        }
    }

    /// Imports base64 encoded DER, ignoring surrounding whitespace.
    pub fn from_base64(key_type: KeyType, encoded: &str) -> Result<Self, Error> {
        let der = base64::prelude::BASE64_STANDARD.decode(encoded.trim())?;
        Self::import(key_type, &der)
    }

    pub fn export(&self) -> Result<Vec<u8>, Error> {
        let invalid = |message: String| Error::InvalidKey {
            key_type: self.key_type(),
            message,
        };
        let document = match self {
            Self::Rsa { private_key } => private_key
                .to_pkcs1_der()
                .map_err(|err| invalid(err.to_string()))?,
            Self::Dss { private_key } => private_key
                .to_pkcs8_der()
                .map_err(|err| invalid(err.to_string()))?,
        };
        Ok(document.as_bytes().to_vec())
    }

    pub fn to_base64(&self) -> Result<String, Error> {
        Ok(base64::prelude::BASE64_STANDARD.encode(self.export()?))
    }

    pub fn generate(key_type: KeyType, rng: &mut impl CryptoRngCore) -> Result<Self, Error> {
        match key_type {
            KeyType::Rsa => {
                let private_key = rsa::RsaPrivateKey::new(rng, RSA_GENERATED_BITS).map_err(|err| {
                    Error::InvalidKey {
                        key_type,
                        message: err.to_string(),
                    }
                })?;
                Ok(Self::Rsa {
                    private_key: Box::new(private_key),
                })
            }
            KeyType::Dss => {
                // ssh-dss signs SHA-1 hashes, which only fit the 1024/160 parameters.
                #[allow(deprecated)]
                let components = dsa::Components::generate(rng, dsa::KeySize::DSA_1024_160);
                let private_key = dsa::SigningKey::generate(rng, components);
                Ok(Self::Dss { private_key })
            }
        }
    }

    pub fn key_type(&self) -> KeyType {
        match self {
            Self::Rsa { .. } => KeyType::Rsa,
            Self::Dss { .. } => KeyType::Dss,
        }
    }

    pub fn public_key(&self) -> PublicKey {
        match self {
            Self::Rsa { private_key } => PublicKey::Rsa {
                public_key: private_key.to_public_key(),
            },
            Self::Dss { private_key } => PublicKey::Dss {
                public_key: private_key.verifying_key().clone(),
            },
        }
    }

    pub fn sign(&self, algorithm: HostKeyAlgorithm, data: &[u8]) -> Result<Signature, Error> {
        self.sign_hash(algorithm, &algorithm.hash(data))
    }

    /// Signs an already computed hash of the message.
    /// The hash must have been produced by `algorithm`'s hash function.
    pub fn sign_hash(&self, algorithm: HostKeyAlgorithm, hash: &[u8]) -> Result<Signature, Error> {
        if algorithm.key_type() != self.key_type() {
            return Err(Error::KeyTypeMismatch {
                algorithm,
                key_type: self.key_type(),
            });
        }

        let blob = match self {
            Self::Rsa { private_key } => {
                let scheme = match algorithm {
                    HostKeyAlgorithm::RsaSha2_256 => rsa::Pkcs1v15Sign::new::<sha2::Sha256>(),
                    _ => rsa::Pkcs1v15Sign::new::<sha2::Sha512>(),
                };
                private_key
                    .sign(scheme, hash)
                    .map_err(|err| Error::Signing(err.to_string()))?
            }
            Self::Dss { private_key } => {
                // <https://datatracker.ietf.org/doc/html/rfc4253#section-6.6>
                let signature: dsa::Signature = private_key
                    .sign_prehash(hash)
                    .map_err(|err| Error::Signing(err.to_string()))?;

                let mut blob = Vec::with_capacity(DSS_COMPONENT_LEN * 2);
                for int in [signature.r(), signature.s()] {
                    let bytes = int.to_bytes_be();
                    if bytes.len() > DSS_COMPONENT_LEN {
                        return Err(Error::Signing(format!("DSA signature component too large")));
                    }
                    blob.resize(blob.len() + DSS_COMPONENT_LEN - bytes.len(), 0);
                    blob.extend_from_slice(&bytes);
                }
                blob
            }
        };

        Ok(Signature { algorithm, blob })
    }
}
