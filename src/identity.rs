//! 160-bit DHT identifiers and the XOR distance metric.

use rand::RngCore;
use std::fmt;

/// A 160-bit DHT identifier (node ID or content/info-hash ID).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Id([u8; 20]);

impl Id {
    pub const LEN: usize = 20;

    pub fn new(bytes: [u8; 20]) -> Id {
        Id(bytes)
    }

    /// Generates a random ID from a cryptographically strong source.
    pub fn random() -> Id {
        let mut bytes = [0u8; 20];
        rand::thread_rng().fill_bytes(&mut bytes);
        Id(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Parses a 40-character hex string into an `Id`.
    pub fn from_hex(hex: &str) -> Result<Id, IdError> {
        if hex.len() != 40 {
            return Err(IdError::BadLength(hex.len()));
        }
        let mut bytes = [0u8; 20];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let s = std::str::from_utf8(chunk).map_err(|_| IdError::BadHex)?;
            bytes[i] = u8::from_str_radix(s, 16).map_err(|_| IdError::BadHex)?;
        }
        Ok(Id(bytes))
    }
}

impl TryFrom<&[u8]> for Id {
    type Error = IdError;

    fn try_from(slice: &[u8]) -> Result<Id, IdError> {
        if slice.len() != 20 {
            return Err(IdError::BadLength(slice.len()));
        }
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(slice);
        Ok(Id(bytes))
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self.to_hex())
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdError {
    BadLength(usize),
    BadHex,
    /// Raised by `bucket_index` when asked about distance to oneself.
    SameId,
}

impl fmt::Display for IdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdError::BadLength(n) => write!(f, "identifier must be 20 bytes, got {n}"),
            IdError::BadHex => write!(f, "identifier is not valid hex"),
            IdError::SameId => write!(f, "distance/bucket index is undefined for identical ids"),
        }
    }
}

impl std::error::Error for IdError {}

/// A 160-bit unsigned magnitude, used as the result of [`distance`]. Stored
/// big-endian so that byte-wise `Ord` matches numeric order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct U160([u8; 20]);

impl U160 {
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Position of the highest set bit, 0-indexed from the LSB, or `None`
    /// if the value is zero.
    pub fn bit_length(&self) -> Option<usize> {
        for (byte_index, &byte) in self.0.iter().enumerate() {
            if byte != 0 {
                // `self.0` is big-endian, so the least significant byte is
                // at the last index; convert to a 0-indexed-from-LSB bit position.
                let bit_in_byte = 7 - byte.leading_zeros() as usize;
                let bytes_from_lsb = self.0.len() - 1 - byte_index;
                return Some(bytes_from_lsb * 8 + bit_in_byte);
            }
        }
        None
    }
}

/// XOR distance between two identifiers, interpreted as a big-endian integer.
pub fn distance(a: &Id, b: &Id) -> U160 {
    let mut out = [0u8; 20];
    for i in 0..20 {
        out[i] = a.0[i] ^ b.0[i];
    }
    U160(out)
}

/// `floor(log2(distance(local, other)))`, in range 0..159. 0 = nearest
/// possible distinct id (single bit differs at the LSB), 159 = farthest
/// (top bit differs). Undefined — and rejected — when `local == other`.
pub fn bucket_index(local: &Id, other: &Id) -> Result<usize, IdError> {
    let d = distance(local, other);
    d.bit_length().ok_or(IdError::SameId)
}
