pub mod numbers;

use core::str;
use std::fmt::{Debug, Display};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError(pub String);
impl Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
impl std::error::Error for ParseError {}

pub type Result<T, E = ParseError> = std::result::Result<T, E>;

/// Upper bound for a single length-prefixed field.
/// Packets themselves are bounded by the transport long before this.
const MAX_FIELD_LEN: usize = 1 << 20;

/// A cursor over the SSH wire format.
/// <https://datatracker.ietf.org/doc/html/rfc4251#section-5>
#[derive(Clone)]
pub struct Reader<'a>(&'a [u8]);

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self(data)
    }

    pub fn remaining(&self) -> &'a [u8] {
        self.0
    }

    pub fn has_data(&self) -> bool {
        !self.0.is_empty()
    }

    pub fn u8(&mut self) -> Result<u8> {
        let arr = self.array::<1>()?;
        Ok(arr[0])
    }

    pub fn u32(&mut self) -> Result<u32> {
        let arr = self.array()?;
        Ok(u32::from_be_bytes(arr))
    }

    pub fn u64(&mut self) -> Result<u64> {
        let arr = self.array()?;
        Ok(u64::from_be_bytes(arr))
    }

    pub fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let Some((head, rest)) = self.0.split_first_chunk::<N>() else {
            return Err(ParseError(format!(
                "packet too short, expected {N} but found {}",
                self.0.len()
            )));
        };
        self.0 = rest;
        Ok(*head)
    }

    pub fn slice(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > MAX_FIELD_LEN {
            return Err(ParseError(format!("bytes too long: {len}")));
        }
        if self.0.len() < len {
            return Err(ParseError(format!(
                "packet too short, expected {len} but found {}",
                self.0.len()
            )));
        }
        let (result, rest) = self.0.split_at(len);
        self.0 = rest;
        Ok(result)
    }

    /// Any nonzero byte is true.
    pub fn bool(&mut self) -> Result<bool> {
        Ok(self.u8()? != 0)
    }

    pub fn name_list(&mut self) -> Result<NameList<'a>> {
        let list = self.ascii_string()?;
        Ok(NameList(list))
    }

    /// Reads an mpint as an unsigned magnitude.
    /// All mpints in this protocol (DH values, RSA and DSA parameters) are non-negative.
    pub fn mpint(&mut self) -> Result<&'a [u8]> {
        let s = self.string()?;

        if s.first().is_some_and(|&b| b & 0x80 != 0) {
            return Err(ParseError(format!("negative mpint")));
        }

        Ok(strip_leading_zeroes(s))
    }

    pub fn string(&mut self) -> Result<&'a [u8]> {
        let len = self.u32()?;
        let len = usize::try_from(len).map_err(|_| ParseError(format!("bytes too long: {len}")))?;
        self.slice(len)
    }

    pub fn utf8_string(&mut self) -> Result<&'a str> {
        let s = self.string()?;
        let Ok(s) = str::from_utf8(s) else {
            return Err(ParseError(format!("string is invalid UTF-8")));
        };
        Ok(s)
    }

    pub fn ascii_string(&mut self) -> Result<&'a str> {
        let s = self.string()?;
        if !s.is_ascii() {
            return Err(ParseError(format!("string is not ASCII")));
        }
        // ASCII is always valid UTF-8.
        str::from_utf8(s).map_err(|_| ParseError(format!("string is not ASCII")))
    }

    /// Fails if there are trailing bytes.
    pub fn finish(&self) -> Result<()> {
        if self.has_data() {
            return Err(ParseError(format!(
                "{} trailing bytes after message",
                self.0.len()
            )));
        }
        Ok(())
    }
}

/// A writer for the SSH wire format.
#[derive(Default)]
pub struct Writer(Vec<u8>);

impl Writer {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn u8(&mut self, v: u8) {
        self.raw(&[v]);
    }

    pub fn u32(&mut self, v: u32) {
        self.raw(&u32::to_be_bytes(v));
    }

    pub fn u64(&mut self, v: u64) {
        self.raw(&u64::to_be_bytes(v));
    }

    pub fn raw(&mut self, v: &[u8]) {
        self.0.extend_from_slice(v);
    }

    pub fn array<const N: usize>(&mut self, arr: [u8; N]) {
        self.raw(&arr);
    }

    pub fn name_list(&mut self, list: NameList<'_>) {
        self.string(list.0.as_bytes());
    }

    /// Writes an unsigned big-endian magnitude as an mpint.
    pub fn mpint(&mut self, magnitude: &[u8]) {
        let (bytes, pad_zero) = fixup_mpint(magnitude);
        let len = bytes.len() + (pad_zero as usize);
        self.u32(len as u32);
        if pad_zero {
            self.u8(0);
        }
        self.raw(bytes);
    }

    /// # Panics
    /// If the data is longer than `u32::MAX`, which the protocol cannot express.
    pub fn string(&mut self, data: impl AsRef<[u8]>) {
        let data = data.as_ref();
        let len = u32::try_from(data.len()).expect("string longer than u32::MAX");
        self.u32(len);
        self.raw(data);
    }

    pub fn bool(&mut self, v: bool) {
        self.u8(v as u8);
    }

    pub fn current_length(&self) -> usize {
        self.0.len()
    }

    pub fn finish(self) -> Vec<u8> {
        self.0
    }
}

/// Returns the significant bytes of the magnitude,
/// and whether a leading 0 needs to be added to keep it positive.
/// Zero is encoded as the empty string.
pub fn fixup_mpint(int_encoded: &[u8]) -> (&[u8], bool) {
    let int_encoded = strip_leading_zeroes(int_encoded);
    // If the first high bit is set, pad it with a zero.
    let pad_zero = int_encoded.first().is_some_and(|&b| b & 0b1000_0000 != 0);
    (int_encoded, pad_zero)
}

fn strip_leading_zeroes(mut bytes: &[u8]) -> &[u8] {
    while let [0, rest @ ..] = bytes {
        bytes = rest;
    }
    bytes
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct NameList<'a>(pub &'a str);

impl<'a> NameList<'a> {
    /// A list with a single name, which must not contain a comma.
    pub fn one(item: &'a str) -> Self {
        debug_assert!(
            !item.contains(','),
            "tried creating name list with comma in item: {item}"
        );
        Self(item)
    }
    pub fn multi(items: &'a str) -> Self {
        Self(items)
    }
    pub fn none() -> NameList<'static> {
        NameList("")
    }
    pub fn contains(&self, name: &str) -> bool {
        self.iter().any(|n| n == name)
    }
    pub fn iter(&self) -> impl Iterator<Item = &'a str> {
        self.0.split(',').filter(|name| !name.is_empty())
    }
    pub fn to_vec(&self) -> Vec<String> {
        self.iter().map(ToOwned::to_owned).collect()
    }
}

impl Debug for NameList<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&self.0, f)
    }
}
