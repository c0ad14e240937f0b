//! Finite field Diffie-Hellman over the MODP groups.
//! <https://datatracker.ietf.org/doc/html/rfc4253#section-8>

use hex_literal::hex;
use num_bigint::BigUint;
use sha2::Digest;
use skiff_format::numbers;

use crate::{disconnect_error, Result, SshRng};

/// Size of the private exponent, twice the security level of the largest group.
const SECRET_LEN: usize = 64;

/// The hash bound to a key exchange method, used for the exchange hash and key derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexHash {
    Sha1,
    Sha256,
    Sha512,
}

impl KexHash {
    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha1 => sha1::Sha1::digest(data).to_vec(),
            Self::Sha256 => sha2::Sha256::digest(data).to_vec(),
            Self::Sha512 => sha2::Sha512::digest(data).to_vec(),
        }
    }

    pub fn output_size(self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
            Self::Sha512 => 64,
        }
    }
}

#[derive(Clone, Copy)]
pub struct KexAlgorithm {
    name: &'static str,
    hash: KexHash,
    prime: &'static [u8],
}

impl std::fmt::Debug for KexAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name)
    }
}

impl PartialEq for KexAlgorithm {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}
impl Eq for KexAlgorithm {}

impl KexAlgorithm {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn hash(&self) -> KexHash {
        self.hash
    }

    /// Applies the hash bound to this method.
    pub fn compute_hash(&self, data: &[u8]) -> Vec<u8> {
        self.hash.digest(data)
    }

    /// Picks a fresh private exponent and computes our public value.
    pub fn create_exchange(&self, rng: &mut dyn SshRng) -> DhExchange {
        let prime = BigUint::from_bytes_be(self.prime);

        let mut secret = [0; SECRET_LEN];
        rng.fill_bytes(&mut secret);
        let mut x = BigUint::from_bytes_be(&secret);
        if x < BigUint::from(2_u32) {
            x += 2_u32;
        }

        let public = BigUint::from(GENERATOR).modpow(&x, &prime).to_bytes_be();

        DhExchange { prime, x, public }
    }
}

/// One side of a running exchange.
pub struct DhExchange {
    prime: BigUint,
    x: BigUint,
    public: Vec<u8>,
}

impl DhExchange {
    /// Our public value, `e` for the client and `f` for the server.
    pub fn public_value(&self) -> &[u8] {
        &self.public
    }

    /// Computes the shared secret K from the peer's public value.
    /// Values outside of `[2, p-2]` are rejected.
    pub fn decrypt_exchange(self, peer_value: &[u8]) -> Result<Vec<u8>> {
        let peer = BigUint::from_bytes_be(peer_value);
        let one = BigUint::from(1_u32);
        if peer <= one || peer >= &self.prime - &one {
            return Err(disconnect_error!(
                numbers::SSH_DISCONNECT_KEY_EXCHANGE_FAILED,
                "peer sent an invalid Diffie-Hellman value"
            ));
        }
        Ok(peer.modpow(&self.x, &self.prime).to_bytes_be())
    }
}

const GENERATOR: u32 = 2;

pub const DH_GROUP18_SHA512: KexAlgorithm = KexAlgorithm {
    name: "diffie-hellman-group18-sha512",
    hash: KexHash::Sha512,
    prime: &GROUP18_PRIME,
};
pub const DH_GROUP16_SHA512: KexAlgorithm = KexAlgorithm {
    name: "diffie-hellman-group16-sha512",
    hash: KexHash::Sha512,
    prime: &GROUP16_PRIME,
};
pub const DH_GROUP14_SHA256: KexAlgorithm = KexAlgorithm {
    name: "diffie-hellman-group14-sha256",
    hash: KexHash::Sha256,
    prime: &GROUP14_PRIME,
};
pub const DH_GROUP14_SHA1: KexAlgorithm = KexAlgorithm {
    name: "diffie-hellman-group14-sha1",
    hash: KexHash::Sha1,
    prime: &GROUP14_PRIME,
};
pub const DH_GROUP1_SHA1: KexAlgorithm = KexAlgorithm {
    name: "diffie-hellman-group1-sha1",
    hash: KexHash::Sha1,
    prime: &GROUP1_PRIME,
};

/// Oakley group 2, 1024 bit.
/// <https://datatracker.ietf.org/doc/html/rfc2409#section-6.2>
const GROUP1_PRIME: [u8; 128] = hex!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74"
    "020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437"
    "4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED"
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381FFFFFFFFFFFFFFFF"
);

/// <https://datatracker.ietf.org/doc/html/rfc3526#section-3>
const GROUP14_PRIME: [u8; 256] = hex!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74"
    "020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437"
    "4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED"
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05"
    "98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB"
    "9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B"
    "E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718"
    "3995497CEA956AE515D2261898FA051015728E5A8AACAA68FFFFFFFFFFFFFFFF"
);

/// <https://datatracker.ietf.org/doc/html/rfc3526#section-5>
const GROUP16_PRIME: [u8; 512] = hex!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74"
    "020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437"
    "4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED"
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05"
    "98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB"
    "9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B"
    "E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718"
    "3995497CEA956AE515D2261898FA051015728E5A8AAAC42DAD33170D04507A33"
    "A85521ABDF1CBA64ECFB850458DBEF0A8AEA71575D060C7DB3970F85A6E1E4C7"
    "ABF5AE8CDB0933D71E8C94E04A25619DCEE3D2261AD2EE6BF12FFA06D98A0864"
    "D87602733EC86A64521F2B18177B200CBBE117577A615D6C770988C0BAD946E2"
    "08E24FA074E5AB3143DB5BFCE0FD108E4B82D120A92108011A723C12A787E6D7"
    "88719A10BDBA5B2699C327186AF4E23C1A946834B6150BDA2583E9CA2AD44CE8"
    "DBBBC2DB04DE8EF92E8EFC141FBECAA6287C59474E6BC05D99B2964FA090C3A2"
    "233BA186515BE7ED1F612970CEE2D7AFB81BDD762170481CD0069127D5B05AA9"
    "93B4EA988D8FDDC186FFB7DC90A6C08F4DF435C934063199FFFFFFFFFFFFFFFF"
);

/// <https://datatracker.ietf.org/doc/html/rfc3526#section-7>
const GROUP18_PRIME: [u8; 1024] = hex!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74"
    "020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437"
    "4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED"
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05"
    "98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB"
    "9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B"
    "E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718"
    "3995497CEA956AE515D2261898FA051015728E5A8AAAC42DAD33170D04507A33"
    "A85521ABDF1CBA64ECFB850458DBEF0A8AEA71575D060C7DB3970F85A6E1E4C7"
    "ABF5AE8CDB0933D71E8C94E04A25619DCEE3D2261AD2EE6BF12FFA06D98A0864"
    "D87602733EC86A64521F2B18177B200CBBE117577A615D6C770988C0BAD946E2"
    "08E24FA074E5AB3143DB5BFCE0FD108E4B82D120A92108011A723C12A787E6D7"
    "88719A10BDBA5B2699C327186AF4E23C1A946834B6150BDA2583E9CA2AD44CE8"
    "DBBBC2DB04DE8EF92E8EFC141FBECAA6287C59474E6BC05D99B2964FA090C3A2"
    "233BA186515BE7ED1F612970CEE2D7AFB81BDD762170481CD0069127D5B05AA9"
    "93B4EA988D8FDDC186FFB7DC90A6C08F4DF435C93402849236C3FAB4D27C7026"
    "C1D4DCB2602646DEC9751E763DBA37BDF8FF9406AD9E530EE5DB382F413001AE"
    "B06A53ED9027D831179727B0865A8918DA3EDBEBCF9B14ED44CE6CBACED4BB1B"
    "DB7F1447E6CC254B332051512BD7AF426FB8F401378CD2BF5983CA01C64B92EC"
    "F032EA15D1721D03F482D7CE6E74FEF6D55E702F46980C82B5A84031900B1C9E"
    "59E7C97FBEC7E8F323A97A7E36CC88BE0F1D45B7FF585AC54BD407B22B4154AA"
    "CC8F6D7EBF48E1D814CC5ED20F8037E0A79715EEF29BE32806A1D58BB7C5DA76"
    "F550AA3D8A1FBFF0EB19CCB1A313D55CDA56C9EC2EF29632387FE8D76E3C0468"
    "043E8F663F4860EE12BF2D5B0B7474D6E694F91E6DBE115974A3926F12FEE5E4"
    "38777CB6A932DF8CD8BEC4D073B931BA3BC832B68D9DD300741FA7BF8AFC47ED"
    "2576F6936BA424663AAB639C5AE4F5683423B4742BF1C978238F16CBE39D652D"
    "E3FDB8BEFC848AD922222E04A4037C0713EB57A81A23F0C73473FC646CEA306B"
    "4BCBC8862F8385DDFA9D4B7FA2C087E879683303ED5BDD3A062B3CF5B3A278A6"
    "6D2A13F83F44F82DDF310EE074AB6A364597E899A0255DC164F31CC50846851D"
    "F9AB48195DED7EA1B1D510BD7EE74D73FAF36BC31ECFA268359046F4EB879F92"
    "4009438B481C6CD7889A002ED5EE382BC9190DA6FC026E479558E4475677E9AA"
    "9E3050E2765694DFC81F56E880B96E7160C980DD98EDD3DFFFFFFFFFFFFFFFFF"
);
