use std::collections::HashMap;

use thiserror::Error;

use crate::private::PrivateKey;
use crate::{HostKeyAlgorithm, KeyType};

/// The host keys of a server, one per signature algorithm.
/// A single RSA key can be registered for both `rsa-sha2-256` and `rsa-sha2-512`.
#[derive(Debug, Default, Clone)]
pub struct HostKeySet {
    keys: Vec<(HostKeyAlgorithm, PrivateKey)>,
}

#[derive(Debug, Error)]
pub enum HostKeyError {
    #[error("another host key with algorithm {alg} has already been loaded")]
    DuplicateHostKeyAlgorithm { alg: HostKeyAlgorithm },
    #[error("host key for {alg} must be a {expected} key, found {found}")]
    WrongKeyType {
        alg: HostKeyAlgorithm,
        expected: KeyType,
        found: KeyType,
    },
    #[error("failed to load host key for {alg}: {source}")]
    Load {
        alg: String,
        #[source]
        source: crate::Error,
    },
}

impl HostKeySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, alg: HostKeyAlgorithm, key: PrivateKey) -> Result<(), HostKeyError> {
        if alg.key_type() != key.key_type() {
            return Err(HostKeyError::WrongKeyType {
                alg,
                expected: alg.key_type(),
                found: key.key_type(),
            });
        }
        if self.get(alg).is_some() {
            return Err(HostKeyError::DuplicateHostKeyAlgorithm { alg });
        }

        self.keys.push((alg, key));
        Ok(())
    }

    /// Loads keys from a map of algorithm name to base64 encoded DER, as a key provider hands them out.
    pub fn from_base64_map(map: &HashMap<String, String>) -> Result<Self, HostKeyError> {
        let mut set = Self::new();
        for (name, encoded) in map {
            let alg = name
                .parse::<HostKeyAlgorithm>()
                .map_err(|source| HostKeyError::Load {
                    alg: name.clone(),
                    source,
                })?;
            let key = PrivateKey::from_base64(alg.key_type(), encoded).map_err(|source| {
                HostKeyError::Load {
                    alg: name.clone(),
                    source,
                }
            })?;
            set.insert(alg, key)?;
        }
        Ok(set)
    }

    pub fn get(&self, alg: HostKeyAlgorithm) -> Option<&PrivateKey> {
        self.keys
            .iter()
            .find(|(key_alg, _)| *key_alg == alg)
            .map(|(_, key)| key)
    }

    /// The algorithms we have keys for, in order of preference.
    pub fn algorithms(&self) -> Vec<HostKeyAlgorithm> {
        HostKeyAlgorithm::ALL
            .into_iter()
            .filter(|alg| self.get(*alg).is_some())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
