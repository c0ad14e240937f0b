//! Message authentication codes over `sequence_number || unencrypted_packet`.
//! <https://datatracker.ietf.org/doc/html/rfc4253#section-6.4>

use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha512};
use skiff_format::numbers;

use crate::{disconnect_error, Result};

pub trait Integrity: Send + Sync {
    fn compute(&self, sequence_number: u32, data: &[u8]) -> Vec<u8>;
    /// Compares in constant time.
    fn verify(&self, sequence_number: u32, data: &[u8], tag: &[u8]) -> bool;
}

#[derive(Clone, Copy)]
pub struct MacAlgorithm {
    name: &'static str,
    pub key_size: usize,
    pub digest_len: usize,
    new: fn(key: &[u8]) -> Result<Box<dyn Integrity>>,
}

impl std::fmt::Debug for MacAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name)
    }
}

impl PartialEq for MacAlgorithm {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}
impl Eq for MacAlgorithm {}

impl MacAlgorithm {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn new_integrity(&self, key: &[u8]) -> Result<Box<dyn Integrity>> {
        (self.new)(key)
    }
}

/// <https://datatracker.ietf.org/doc/html/rfc6668>
pub const HMAC_SHA2_256: MacAlgorithm = MacAlgorithm {
    name: "hmac-sha2-256",
    key_size: 32,
    digest_len: 32,
    new: |key| HmacIntegrity::<Hmac<Sha256>>::new_boxed(key),
};

pub const HMAC_SHA2_512: MacAlgorithm = MacAlgorithm {
    name: "hmac-sha2-512",
    key_size: 64,
    digest_len: 64,
    new: |key| HmacIntegrity::<Hmac<Sha512>>::new_boxed(key),
};

/// Holds the keyed state, cloned for every packet.
struct HmacIntegrity<M>(M);

impl<M: Mac + KeyInit + Clone + Send + Sync + 'static> HmacIntegrity<M> {
    fn new_boxed(key: &[u8]) -> Result<Box<dyn Integrity>> {
        let mac = <M as Mac>::new_from_slice(key).map_err(|_| {
            disconnect_error!(
                numbers::SSH_DISCONNECT_KEY_EXCHANGE_FAILED,
                "invalid MAC key length: {}",
                key.len()
            )
        })?;
        Ok(Box::new(Self(mac)))
    }

    fn keyed(&self, sequence_number: u32, data: &[u8]) -> M {
        let mut mac = self.0.clone();
        mac.update(&sequence_number.to_be_bytes());
        mac.update(data);
        mac
    }
}

impl<M: Mac + KeyInit + Clone + Send + Sync + 'static> Integrity for HmacIntegrity<M> {
    fn compute(&self, sequence_number: u32, data: &[u8]) -> Vec<u8> {
        self.keyed(sequence_number, data)
            .finalize()
            .into_bytes()
            .to_vec()
    }

    fn verify(&self, sequence_number: u32, data: &[u8], tag: &[u8]) -> bool {
        self.keyed(sequence_number, data).verify_slice(tag).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::{HMAC_SHA2_256, HMAC_SHA2_512};

    const DATA: &[u8] = b"what do ya want for nothing?";

    #[test]
    fn sequence_number_is_authenticated() {
        let mac = HMAC_SHA2_256.new_integrity(b"Jefe").unwrap();
        let tag = mac.compute(5, DATA);
        assert_eq!(
            tag,
            hex!("c7eea84f5904a3249d7790ea7303f8a15c43494a3d3c9f7b9b087ec263b81fe8")
        );
        assert!(mac.verify(5, DATA, &tag));
        assert!(!mac.verify(6, DATA, &tag));
    }

    #[test]
    fn sha512() {
        let mac = HMAC_SHA2_512.new_integrity(b"Jefe").unwrap();
        let tag = mac.compute(5, DATA);
        assert_eq!(tag.len(), HMAC_SHA2_512.digest_len);
        assert_eq!(
            tag,
            hex!(
                "00271734953bf9d5b659c2d1c1fc200ae0c16e013f524c52a53ad1b69fbcc05e"
                "d3603c85929b8fe5c15b13bb3a3ce77095ea1df91d1bd4bde7a2738aef8962b2"
            )
        );
    }

    #[test]
    fn tampered_data_rejected() {
        let mac = HMAC_SHA2_512.new_integrity(&[1; 64]).unwrap();
        let tag = mac.compute(0, DATA);
        assert!(!mac.verify(0, b"what do ya want for something?", &tag));
        assert!(!mac.verify(0, DATA, &tag[..32]));
    }
}
