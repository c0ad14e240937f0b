pub mod cipher;
pub mod kex;
pub mod mac;

use skiff_format::{numbers, Writer};
use skiff_keys::HostKeyAlgorithm;

use crate::message::KexInit;
use crate::{disconnect_error, Result};

pub use cipher::{EncryptionAlgorithm, Transform};
pub use kex::{DhExchange, KexAlgorithm, KexHash};
pub use mac::{Integrity, MacAlgorithm};

pub trait AlgorithmName {
    fn name(&self) -> &'static str;
}

impl AlgorithmName for KexAlgorithm {
    fn name(&self) -> &'static str {
        KexAlgorithm::name(self)
    }
}
impl AlgorithmName for EncryptionAlgorithm {
    fn name(&self) -> &'static str {
        EncryptionAlgorithm::name(self)
    }
}
impl AlgorithmName for MacAlgorithm {
    fn name(&self) -> &'static str {
        MacAlgorithm::name(self)
    }
}
impl AlgorithmName for CompressionAlgorithm {
    fn name(&self) -> &'static str {
        self.name
    }
}
impl AlgorithmName for HostKeyAlgorithm {
    fn name(&self) -> &'static str {
        HostKeyAlgorithm::name(*self)
    }
}

/// Only `none` is supported, payloads pass through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionAlgorithm {
    name: &'static str,
}

pub const COMPRESSION_NONE: CompressionAlgorithm = CompressionAlgorithm { name: "none" };

/// All registries are in order of preference.
pub const KEX_ALGORITHMS: [KexAlgorithm; 5] = [
    kex::DH_GROUP18_SHA512,
    kex::DH_GROUP16_SHA512,
    kex::DH_GROUP14_SHA256,
    kex::DH_GROUP14_SHA1,
    kex::DH_GROUP1_SHA1,
];
pub const ENCRYPTION_ALGORITHMS: [EncryptionAlgorithm; 2] = [cipher::AES256_CTR, cipher::AES256_CBC];
pub const MAC_ALGORITHMS: [MacAlgorithm; 2] = [mac::HMAC_SHA2_256, mac::HMAC_SHA2_512];
pub const COMPRESSION_ALGORITHMS: [CompressionAlgorithm; 1] = [COMPRESSION_NONE];

fn names<T: AlgorithmName>(algs: &[T]) -> Vec<String> {
    algs.iter().map(|alg| alg.name().to_owned()).collect()
}

fn lookup<T: AlgorithmName + Copy>(table: &[T], name: &str) -> Result<T> {
    table
        .iter()
        .find(|alg| alg.name() == name)
        .copied()
        .ok_or_else(|| {
            disconnect_error!(
                numbers::SSH_DISCONNECT_KEY_EXCHANGE_FAILED,
                "negotiated unsupported algorithm {name}"
            )
        })
}

/// A KEXINIT offering everything we support, with the given host key algorithms.
pub fn supported_kexinit(cookie: [u8; 16], host_key_algorithms: &[HostKeyAlgorithm]) -> KexInit {
    KexInit {
        cookie,
        kex_algorithms: names(&KEX_ALGORITHMS),
        server_host_key_algorithms: names(host_key_algorithms),
        encryption_algorithms_client_to_server: names(&ENCRYPTION_ALGORITHMS),
        encryption_algorithms_server_to_client: names(&ENCRYPTION_ALGORITHMS),
        mac_algorithms_client_to_server: names(&MAC_ALGORITHMS),
        mac_algorithms_server_to_client: names(&MAC_ALGORITHMS),
        compression_algorithms_client_to_server: names(&COMPRESSION_ALGORITHMS),
        compression_algorithms_server_to_client: names(&COMPRESSION_ALGORITHMS),
        languages_client_to_server: Vec::new(),
        languages_server_to_client: Vec::new(),
        first_kex_packet_follows: false,
        reserved: 0,
    }
}

/// The first algorithm on the client's list that the server also supports.
/// <https://datatracker.ietf.org/doc/html/rfc4253#section-7.1>
pub fn choose_algorithm<'c, S: AsRef<str>, C: AsRef<str>>(
    server: &[S],
    client: &'c [C],
) -> Result<&'c str> {
    client
        .iter()
        .map(AsRef::as_ref)
        .find(|client_alg| server.iter().any(|server_alg| server_alg.as_ref() == *client_alg))
        .ok_or_else(|| {
            let server = server.iter().map(AsRef::as_ref).collect::<Vec<_>>().join(",");
            let client = client.iter().map(AsRef::as_ref).collect::<Vec<_>>().join(",");
            disconnect_error!(
                numbers::SSH_DISCONNECT_KEY_EXCHANGE_FAILED,
                "no matching algorithm: we support {server:?}, peer supports {client:?}"
            )
        })
}

fn negotiate<'c>(what: &str, server: &[String], client: &'c [String]) -> Result<&'c str> {
    choose_algorithm(server, client).map_err(|err| match err {
        crate::SshStatus::PeerError { reason, message } => crate::SshStatus::PeerError {
            reason,
            message: format!("{what}: {message}"),
        },
        other => other,
    })
}

/// The outcome of algorithm negotiation for one key exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub kex: KexAlgorithm,
    pub host_key: HostKeyAlgorithm,
    pub encryption_client_to_server: EncryptionAlgorithm,
    pub encryption_server_to_client: EncryptionAlgorithm,
    pub mac_client_to_server: MacAlgorithm,
    pub mac_server_to_client: MacAlgorithm,
    pub compression_client_to_server: CompressionAlgorithm,
    pub compression_server_to_client: CompressionAlgorithm,
}

impl Negotiated {
    /// Languages are not negotiated.
    pub fn from_kexinits(server: &KexInit, client: &KexInit) -> Result<Self> {
        let kex = negotiate("key exchange", &server.kex_algorithms, &client.kex_algorithms)?;
        let host_key = negotiate(
            "host key",
            &server.server_host_key_algorithms,
            &client.server_host_key_algorithms,
        )?;
        let host_key = HostKeyAlgorithm::from_name(host_key).ok_or_else(|| {
            disconnect_error!(
                numbers::SSH_DISCONNECT_KEY_EXCHANGE_FAILED,
                "negotiated unsupported host key algorithm {host_key}"
            )
        })?;

        let encryption_c2s = negotiate(
            "encryption client to server",
            &server.encryption_algorithms_client_to_server,
            &client.encryption_algorithms_client_to_server,
        )?;
        let encryption_s2c = negotiate(
            "encryption server to client",
            &server.encryption_algorithms_server_to_client,
            &client.encryption_algorithms_server_to_client,
        )?;
        let mac_c2s = negotiate(
            "mac client to server",
            &server.mac_algorithms_client_to_server,
            &client.mac_algorithms_client_to_server,
        )?;
        let mac_s2c = negotiate(
            "mac server to client",
            &server.mac_algorithms_server_to_client,
            &client.mac_algorithms_server_to_client,
        )?;
        let compression_c2s = negotiate(
            "compression client to server",
            &server.compression_algorithms_client_to_server,
            &client.compression_algorithms_client_to_server,
        )?;
        let compression_s2c = negotiate(
            "compression server to client",
            &server.compression_algorithms_server_to_client,
            &client.compression_algorithms_server_to_client,
        )?;

        Ok(Self {
            kex: lookup(&KEX_ALGORITHMS, kex)?,
            host_key,
            encryption_client_to_server: lookup(&ENCRYPTION_ALGORITHMS, encryption_c2s)?,
            encryption_server_to_client: lookup(&ENCRYPTION_ALGORITHMS, encryption_s2c)?,
            mac_client_to_server: lookup(&MAC_ALGORITHMS, mac_c2s)?,
            mac_server_to_client: lookup(&MAC_ALGORITHMS, mac_s2c)?,
            compression_client_to_server: lookup(&COMPRESSION_ALGORITHMS, compression_c2s)?,
            compression_server_to_client: lookup(&COMPRESSION_ALGORITHMS, compression_s2c)?,
        })
    }

    /// Whether a key exchange packet the client sent optimistically has to be ignored.
    /// <https://datatracker.ietf.org/doc/html/rfc4253#section-7>
    pub fn client_guess_was_wrong(&self, client: &KexInit) -> bool {
        client.kex_algorithms.first().map(String::as_str) != Some(self.kex.name())
            || client.server_host_key_algorithms.first().map(String::as_str)
                != Some(self.host_key.name())
    }
}

/// Computes the exchange hash H.
/// The identification strings are passed without their line ending.
/// <https://datatracker.ietf.org/doc/html/rfc4253#section-8>
pub fn exchange_hash(
    kex: &KexAlgorithm,
    client_ident: &[u8],
    server_ident: &[u8],
    client_kexinit: &[u8],
    server_kexinit: &[u8],
    server_host_key: &[u8],
    e: &[u8],
    f: &[u8],
    shared_secret: &[u8],
) -> Vec<u8> {
    let mut w = Writer::new();
    w.string(client_ident); // V_C
    w.string(server_ident); // V_S
    w.string(client_kexinit); // I_C
    w.string(server_kexinit); // I_S
    w.string(server_host_key); // K_S
    w.mpint(e);
    w.mpint(f);
    w.mpint(shared_secret); // K
    kex.compute_hash(&w.finish())
}

/// Derive a key from the shared secret K and exchange hash H.
/// <https://datatracker.ietf.org/doc/html/rfc4253#section-7.2>
pub fn derive_key(
    hash: KexHash,
    shared_secret: &[u8],
    h: &[u8],
    letter: u8,
    session_id: &[u8],
    key_size: usize,
) -> Vec<u8> {
    let mut prefix = Writer::new();
    prefix.mpint(shared_secret);
    prefix.raw(h);
    let prefix = prefix.finish();

    let mut first = prefix.clone();
    first.push(letter);
    first.extend_from_slice(session_id);
    let mut output = hash.digest(&first);

    while output.len() < key_size {
        let mut next = prefix.clone();
        next.extend_from_slice(&output);
        output.extend_from_slice(&hash.digest(&next));
    }

    output.truncate(key_size);
    output
}

/// Keys for one direction of the connection.
pub struct DirectionKeys {
    pub iv: Vec<u8>,
    pub encryption_key: Vec<u8>,
    pub integrity_key: Vec<u8>,
}

pub struct SessionKeys {
    pub client_to_server: DirectionKeys,
    pub server_to_client: DirectionKeys,
}

impl SessionKeys {
    pub fn derive(
        negotiated: &Negotiated,
        shared_secret: &[u8],
        h: &[u8],
        session_id: &[u8],
    ) -> Self {
        let hash = negotiated.kex.hash();
        let derive = |letter: u8, size: usize| derive_key(hash, shared_secret, h, letter, session_id, size);

        let enc_c2s = negotiated.encryption_client_to_server;
        let enc_s2c = negotiated.encryption_server_to_client;

        Self {
            client_to_server: DirectionKeys {
                iv: derive(b'A', enc_c2s.iv_size),
                encryption_key: derive(b'C', enc_c2s.key_size),
                integrity_key: derive(b'E', negotiated.mac_client_to_server.key_size),
            },
            server_to_client: DirectionKeys {
                iv: derive(b'B', enc_s2c.iv_size),
                encryption_key: derive(b'D', enc_s2c.key_size),
                integrity_key: derive(b'F', negotiated.mac_server_to_client.key_size),
            },
        }
    }
}

/// The keyed cipher and MAC state of one direction.
pub struct Tunnel {
    pub(crate) cipher: Box<dyn Transform>,
    pub(crate) integrity: Box<dyn Integrity>,
    pub(crate) block_size: usize,
    pub(crate) mac_len: usize,
}

impl Tunnel {
    pub fn encrypting(
        encryption: EncryptionAlgorithm,
        mac: MacAlgorithm,
        keys: &DirectionKeys,
    ) -> Result<Self> {
        Ok(Self {
            cipher: encryption.encryptor(&keys.encryption_key, &keys.iv)?,
            integrity: mac.new_integrity(&keys.integrity_key)?,
            block_size: encryption.block_size,
            mac_len: mac.digest_len,
        })
    }

    pub fn decrypting(
        encryption: EncryptionAlgorithm,
        mac: MacAlgorithm,
        keys: &DirectionKeys,
    ) -> Result<Self> {
        Ok(Self {
            cipher: encryption.decryptor(&keys.encryption_key, &keys.iv)?,
            integrity: mac.new_integrity(&keys.integrity_key)?,
            block_size: encryption.block_size,
            mac_len: mac.digest_len,
        })
    }

    /// The tunnels for what the server sends and what it receives.
    pub fn server_pair(negotiated: &Negotiated, keys: &SessionKeys) -> Result<(Self, Self)> {
        let outgoing = Self::encrypting(
            negotiated.encryption_server_to_client,
            negotiated.mac_server_to_client,
            &keys.server_to_client,
        )?;
        let incoming = Self::decrypting(
            negotiated.encryption_client_to_server,
            negotiated.mac_client_to_server,
            &keys.client_to_server,
        )?;
        Ok((outgoing, incoming))
    }

    /// The tunnels for what a client sends and what it receives.
    pub fn client_pair(negotiated: &Negotiated, keys: &SessionKeys) -> Result<(Self, Self)> {
        let outgoing = Self::encrypting(
            negotiated.encryption_client_to_server,
            negotiated.mac_client_to_server,
            &keys.client_to_server,
        )?;
        let incoming = Self::decrypting(
            negotiated.encryption_server_to_client,
            negotiated.mac_server_to_client,
            &keys.server_to_client,
        )?;
        Ok((outgoing, incoming))
    }
}

#[cfg(test)]
mod tests {
    use skiff_keys::HostKeyAlgorithm;

    use super::*;

    fn client_kexinit() -> KexInit {
        supported_kexinit([1; 16], &HostKeyAlgorithm::ALL)
    }

    #[test]
    fn client_preference_wins() {
        let server = ["c2", "c1"];
        assert_eq!(choose_algorithm(&server, &["c1", "c2"]).unwrap(), "c1");
        assert_eq!(choose_algorithm(&server, &["c2", "c1"]).unwrap(), "c2");
        assert_eq!(choose_algorithm(&server, &["x", "c1"]).unwrap(), "c1");
    }

    #[test]
    fn no_common_algorithm() {
        let err = choose_algorithm(&["a"], &["b", "c"]).unwrap_err();
        assert_eq!(
            err.disconnect_reason(),
            Some(numbers::SSH_DISCONNECT_KEY_EXCHANGE_FAILED)
        );
        assert!(choose_algorithm::<&str, &str>(&["a"], &[]).is_err());
    }

    #[test]
    fn negotiate_defaults() {
        let server = supported_kexinit([0; 16], &[HostKeyAlgorithm::SshDss]);
        let negotiated = Negotiated::from_kexinits(&server, &client_kexinit()).unwrap();
        assert_eq!(negotiated.kex, kex::DH_GROUP18_SHA512);
        assert_eq!(negotiated.host_key, HostKeyAlgorithm::SshDss);
        assert_eq!(negotiated.encryption_client_to_server, cipher::AES256_CTR);
        assert_eq!(negotiated.mac_server_to_client, mac::HMAC_SHA2_256);
        assert_eq!(negotiated.compression_client_to_server, COMPRESSION_NONE);
    }

    #[test]
    fn directions_negotiated_independently() {
        let server = supported_kexinit([0; 16], &HostKeyAlgorithm::ALL);
        let mut client = client_kexinit();
        client.encryption_algorithms_server_to_client = vec!["aes256-cbc".to_owned()];
        client.mac_algorithms_client_to_server =
            vec!["hmac-md5".to_owned(), "hmac-sha2-512".to_owned()];
        let negotiated = Negotiated::from_kexinits(&server, &client).unwrap();
        assert_eq!(negotiated.encryption_client_to_server, cipher::AES256_CTR);
        assert_eq!(negotiated.encryption_server_to_client, cipher::AES256_CBC);
        assert_eq!(negotiated.mac_client_to_server, mac::HMAC_SHA2_512);
        assert_eq!(negotiated.mac_server_to_client, mac::HMAC_SHA2_256);
    }

    #[test]
    fn missing_host_key_algorithm() {
        let server = supported_kexinit([0; 16], &[HostKeyAlgorithm::SshDss]);
        let mut client = client_kexinit();
        client.server_host_key_algorithms = vec!["rsa-sha2-512".to_owned()];
        let err = Negotiated::from_kexinits(&server, &client).unwrap_err();
        assert!(err.to_string().contains("host key"), "{err}");
    }

    #[test]
    fn wrong_guess() {
        let server = supported_kexinit([0; 16], &[HostKeyAlgorithm::SshDss]);
        let mut client = client_kexinit();
        client.server_host_key_algorithms = vec!["ssh-dss".to_owned()];
        let negotiated = Negotiated::from_kexinits(&server, &client).unwrap();
        assert!(!negotiated.client_guess_was_wrong(&client));

        client.kex_algorithms.rotate_left(1);
        let negotiated = Negotiated::from_kexinits(&server, &client).unwrap();
        assert!(!negotiated.client_guess_was_wrong(&client));

        let server = supported_kexinit([0; 16], &[HostKeyAlgorithm::SshDss]);
        let client = client_kexinit();
        let negotiated = Negotiated::from_kexinits(&server, &client).unwrap();
        assert!(negotiated.client_guess_was_wrong(&client));
    }

    #[test]
    fn derive_key_extends_output() {
        let k = [0x80, 1, 2, 3];
        let h = [9; 20];
        let short = derive_key(KexHash::Sha1, &k, &h, b'C', &h, 20);
        let long = derive_key(KexHash::Sha1, &k, &h, b'C', &h, 64);
        assert_eq!(long.len(), 64);
        assert_eq!(&long[..20], short);

        // K2 = HASH(K || H || K1)
        let mut w = Writer::new();
        w.mpint(&k);
        w.raw(&h);
        w.raw(&short);
        assert_eq!(&long[20..40], KexHash::Sha1.digest(&w.finish()));

        let other_letter = derive_key(KexHash::Sha1, &k, &h, b'D', &h, 20);
        assert_ne!(short, other_letter);
    }

    #[test]
    fn session_key_sizes() {
        let server = supported_kexinit([0; 16], &HostKeyAlgorithm::ALL);
        let mut client = client_kexinit();
        client.mac_algorithms_server_to_client = vec!["hmac-sha2-512".to_owned()];
        let negotiated = Negotiated::from_kexinits(&server, &client).unwrap();
        let keys = SessionKeys::derive(&negotiated, &[1, 2, 3], &[4; 64], &[5; 64]);
        assert_eq!(keys.client_to_server.iv.len(), 16);
        assert_eq!(keys.client_to_server.encryption_key.len(), 32);
        assert_eq!(keys.client_to_server.integrity_key.len(), 32);
        assert_eq!(keys.server_to_client.integrity_key.len(), 64);
        assert_ne!(keys.client_to_server.iv, keys.server_to_client.iv);
    }
}
