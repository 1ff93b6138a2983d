//! Compact binary encoding for index values.
//!
//! Everything written to or read from the index tables goes through the
//! [`Serializable`] trait: strings and byte blobs are length-prefixed with an
//! unsigned LEB128 varint, counts are varints.

mod varint;

pub use varint::{decode_varint, encode_varint, varint_size};

use thiserror::Error;

pub type CodecResult<T> = Result<T, CodecError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("truncated input: expected {expected} more bytes for {what}, found {found}")]
    Truncated {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("incomplete varint")]
    IncompleteVarint,

    #[error("varint too long")]
    VarintOverflow,

    #[error("length {0} does not fit in memory")]
    LengthOverflow(u64),

    #[error("invalid utf-8 in string field")]
    InvalidUtf8,

    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),

    #[error("term '{0}' appears twice in one entry")]
    DuplicateTerm(String),
}

/// Types with a stable, self-delimiting byte encoding.
pub trait Serializable: Sized {
    /// Serialize this value, appending bytes to the buffer.
    fn serialize(&self, buf: &mut Vec<u8>);

    /// Deserialize from bytes, returning (value, bytes_consumed).
    fn deserialize(buf: &[u8]) -> CodecResult<(Self, usize)>;

    /// Get the serialized size in bytes without actually serializing.
    fn serialized_size(&self) -> usize;

    /// Serialize into a fresh buffer.
    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.serialized_size());
        self.serialize(&mut buf);
        buf
    }

    /// Deserialize a value that must occupy the whole buffer.
    fn from_bytes(buf: &[u8]) -> CodecResult<Self> {
        let (value, consumed) = Self::deserialize(buf)?;
        if consumed != buf.len() {
            return Err(CodecError::TrailingBytes(buf.len() - consumed));
        }
        Ok(value)
    }
}

/// Reads a varint length prefix and checks the payload is actually present.
pub(crate) fn read_length_prefixed<'a>(
    buf: &'a [u8],
    what: &'static str,
) -> CodecResult<(&'a [u8], usize)> {
    let (len, header) = decode_varint(buf)?;
    let len = usize::try_from(len).map_err(|_| CodecError::LengthOverflow(len))?;
    let rest = &buf[header..];
    if rest.len() < len {
        return Err(CodecError::Truncated {
            what,
            expected: len,
            found: rest.len(),
        });
    }
    Ok((&rest[..len], header + len))
}

impl Serializable for String {
    fn serialize(&self, buf: &mut Vec<u8>) {
        encode_varint(self.len() as u64, buf);
        buf.extend_from_slice(self.as_bytes());
    }

    fn deserialize(buf: &[u8]) -> CodecResult<(Self, usize)> {
        let (bytes, consumed) = read_length_prefixed(buf, "string")?;
        let s = std::str::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)?;
        Ok((s.to_string(), consumed))
    }

    fn serialized_size(&self) -> usize {
        varint_size(self.len() as u64) + self.len()
    }
}

impl Serializable for Vec<u8> {
    fn serialize(&self, buf: &mut Vec<u8>) {
        encode_varint(self.len() as u64, buf);
        buf.extend_from_slice(self);
    }

    fn deserialize(buf: &[u8]) -> CodecResult<(Self, usize)> {
        let (bytes, consumed) = read_length_prefixed(buf, "byte array")?;
        Ok((bytes.to_vec(), consumed))
    }

    fn serialized_size(&self) -> usize {
        varint_size(self.len() as u64) + self.len()
    }
}

impl Serializable for u64 {
    fn serialize(&self, buf: &mut Vec<u8>) {
        encode_varint(*self, buf);
    }

    fn deserialize(buf: &[u8]) -> CodecResult<(Self, usize)> {
        decode_varint(buf)
    }

    fn serialized_size(&self) -> usize {
        varint_size(*self)
    }
}

impl Serializable for bool {
    fn serialize(&self, buf: &mut Vec<u8>) {
        buf.push(u8::from(*self));
    }

    fn deserialize(buf: &[u8]) -> CodecResult<(Self, usize)> {
        match buf.first() {
            Some(b) => Ok((*b != 0, 1)),
            None => Err(CodecError::Truncated {
                what: "bool",
                expected: 1,
                found: 0,
            }),
        }
    }

    fn serialized_size(&self) -> usize {
        1
    }
}
