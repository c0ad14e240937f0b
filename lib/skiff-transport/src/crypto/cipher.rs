//! Block ciphers for the packet encryption.
//! <https://datatracker.ietf.org/doc/html/rfc4253#section-6.3>

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher};
use aes::Aes256;
use skiff_format::numbers;

use crate::{disconnect_error, Result};

/// A keyed cipher state for one direction.
/// The state carries over between calls, the whole stream of packets is one continuous ciphertext.
pub trait Transform: Send + Sync {
    /// Encrypts or decrypts `data` in place. The length must be a multiple of the block size.
    fn apply(&mut self, data: &mut [u8]);
}

#[derive(Clone, Copy)]
pub struct EncryptionAlgorithm {
    name: &'static str,
    pub key_size: usize,
    pub iv_size: usize,
    pub block_size: usize,
    encryptor: fn(key: &[u8], iv: &[u8]) -> Result<Box<dyn Transform>>,
    decryptor: fn(key: &[u8], iv: &[u8]) -> Result<Box<dyn Transform>>,
}

impl std::fmt::Debug for EncryptionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name)
    }
}

impl PartialEq for EncryptionAlgorithm {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}
impl Eq for EncryptionAlgorithm {}

impl EncryptionAlgorithm {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn encryptor(&self, key: &[u8], iv: &[u8]) -> Result<Box<dyn Transform>> {
        (self.encryptor)(key, iv)
    }

    pub fn decryptor(&self, key: &[u8], iv: &[u8]) -> Result<Box<dyn Transform>> {
        (self.decryptor)(key, iv)
    }
}

fn invalid_key_material(name: &str) -> crate::SshStatus {
    disconnect_error!(
        numbers::SSH_DISCONNECT_KEY_EXCHANGE_FAILED,
        "invalid key material for {name}"
    )
}

/// <https://datatracker.ietf.org/doc/html/rfc4344#section-4>
pub const AES256_CTR: EncryptionAlgorithm = EncryptionAlgorithm {
    name: "aes256-ctr",
    key_size: 32,
    iv_size: 16,
    block_size: 16,
    // Counter mode is symmetric.
    encryptor: Aes256Ctr::new_boxed,
    decryptor: Aes256Ctr::new_boxed,
};

pub const AES256_CBC: EncryptionAlgorithm = EncryptionAlgorithm {
    name: "aes256-cbc",
    key_size: 32,
    iv_size: 16,
    block_size: 16,
    encryptor: |key, iv| {
        let cipher = cbc::Encryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(|_| invalid_key_material("aes256-cbc"))?;
        Ok(Box::new(Aes256CbcEncrypt(cipher)))
    },
    decryptor: |key, iv| {
        let cipher = cbc::Decryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(|_| invalid_key_material("aes256-cbc"))?;
        Ok(Box::new(Aes256CbcDecrypt(cipher)))
    },
};

struct Aes256Ctr(ctr::Ctr128BE<Aes256>);

impl Aes256Ctr {
    fn new_boxed(key: &[u8], iv: &[u8]) -> Result<Box<dyn Transform>> {
        let cipher = ctr::Ctr128BE::<Aes256>::new_from_slices(key, iv)
            .map_err(|_| invalid_key_material("aes256-ctr"))?;
        Ok(Box::new(Self(cipher)))
    }
}

impl Transform for Aes256Ctr {
    fn apply(&mut self, data: &mut [u8]) {
        self.0.apply_keystream(data);
    }
}

struct Aes256CbcEncrypt(cbc::Encryptor<Aes256>);

impl Transform for Aes256CbcEncrypt {
    fn apply(&mut self, data: &mut [u8]) {
        debug_assert_eq!(data.len() % 16, 0);
        for block in data.chunks_exact_mut(16) {
            self.0.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
    }
}

struct Aes256CbcDecrypt(cbc::Decryptor<Aes256>);

impl Transform for Aes256CbcDecrypt {
    fn apply(&mut self, data: &mut [u8]) {
        debug_assert_eq!(data.len() % 16, 0);
        for block in data.chunks_exact_mut(16) {
            self.0.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
    }
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::{AES256_CBC, AES256_CTR};

    const KEY: [u8; 32] = [7; 32];
    const IV: [u8; 16] = [3; 16];

    #[test]
    fn split_calls_match_one_call() {
        for alg in [AES256_CTR, AES256_CBC] {
            let plaintext = [0x42_u8; 64];

            let mut whole = plaintext;
            alg.encryptor(&KEY, &IV).unwrap().apply(&mut whole);
            assert_ne!(whole, plaintext);

            let mut split = plaintext;
            let mut enc = alg.encryptor(&KEY, &IV).unwrap();
            enc.apply(&mut split[..16]);
            enc.apply(&mut split[16..]);
            assert_eq!(whole, split, "{alg:?}");

            let mut dec = alg.decryptor(&KEY, &IV).unwrap();
            dec.apply(&mut split[..16]);
            dec.apply(&mut split[16..]);
            assert_eq!(split, plaintext, "{alg:?}");
        }
    }

    // F.5.5 CTR-AES256.Encrypt from NIST SP 800-38A.
    #[test]
    fn ctr_known_answer() {
        let key = hex!("603deb1015ca71be2b73aef0857d7781 1f352c073b6108d72d9810a30914dff4");
        let iv = hex!("f0f1f2f3f4f5f6f7f8f9fafbfcfdfeff");
        let mut block = hex!("6bc1bee22e409f96e93d7e117393172a");
        AES256_CTR.encryptor(&key, &iv).unwrap().apply(&mut block);
        assert_eq!(block, hex!("601ec313775789a5b7a7f504bbf3d228"));
    }

    // F.2.5 CBC-AES256.Encrypt from NIST SP 800-38A.
    #[test]
    fn cbc_known_answer() {
        let key = hex!("603deb1015ca71be2b73aef0857d7781 1f352c073b6108d72d9810a30914dff4");
        let iv = hex!("000102030405060708090a0b0c0d0e0f");
        let mut block = hex!("6bc1bee22e409f96e93d7e117393172a");
        AES256_CBC.encryptor(&key, &iv).unwrap().apply(&mut block);
        assert_eq!(block, hex!("f58c4c04d6e5f1ba779eabfb5f7bfbd6"));
    }

    #[test]
    fn wrong_key_length() {
        assert!(AES256_CTR.encryptor(&[0; 16], &IV).is_err());
        assert!(AES256_CBC.decryptor(&KEY, &[0; 8]).is_err());
    }
}
