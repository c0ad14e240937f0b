use skiff_format::{numbers, Reader, Writer};

use crate::{Error, HostKeyAlgorithm};

/// The data a client signs for public key authentication.
/// <https://datatracker.ietf.org/doc/html/rfc4252#section-7>
pub fn signature_data(
    session_id: &[u8],
    username: &str,
    service_name: &str,
    algorithm: &str,
    key_blob: &[u8],
) -> Vec<u8> {
    let mut s = Writer::new();

    s.string(session_id);
    s.u8(numbers::SSH_MSG_USERAUTH_REQUEST);
    s.string(username);
    s.string(service_name);
    s.string("publickey");
    s.bool(true);
    s.string(algorithm);
    s.string(key_blob);

    s.finish()
}

/// A signature produced by one of our host key algorithms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub algorithm: HostKeyAlgorithm,
    /// The raw signature, without the algorithm name.
    pub blob: Vec<u8>,
}

impl Signature {
    pub fn to_wire_encoding(&self) -> Vec<u8> {
        let mut data = Writer::new();
        data.string(self.algorithm.name());
        data.string(&self.blob);
        data.finish()
    }

    /// Parses `string algorithm || string blob`, requiring the algorithm to be `expected`.
    pub fn from_wire_encoding(expected: HostKeyAlgorithm, bytes: &[u8]) -> Result<Self, Error> {
        let mut r = Reader::new(bytes);
        let found = r.utf8_string()?;
        if found != expected.name() {
            return Err(Error::SignatureAlgorithmMismatch {
                expected,
                found: found.to_owned(),
            });
        }
        let blob = r.string()?.to_vec();
        r.finish()?;
        Ok(Self {
            algorithm: expected,
            blob,
        })
    }
}
