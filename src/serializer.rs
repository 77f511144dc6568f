//! Pluggable key and value codecs.
//!
//! The engine stores opaque `K` and `V` types; everything it needs to know
//! about them comes through a [`Serializer`]: a byte encoding that reads
//! back exactly as many bytes as it wrote, and (for keys) a total order.
//! Two reference implementations are bundled for 64-bit integers and UTF-8
//! strings.

use crate::buffer::BufferHandler;
use crate::error::{Error, Result};
use std::cmp::Ordering;

/// Encode/decode contract for one stored type.
///
/// `compare` supplies the total order the tree is built on; the engine
/// derives the key comparator from the key serializer. `compare_opt`
/// extends it with the convention used for tie-breaking: two absent
/// operands are equal, and an absent operand sorts greater than any
/// present one.
pub trait Serializer<T>: Send + Sync {
    /// Appends the encoding of `value` to `out`.
    fn serialize(&self, value: &T, out: &mut Vec<u8>);

    /// Reads one value back, consuming exactly the bytes `serialize` wrote.
    fn deserialize(&self, input: &mut BufferHandler) -> Result<T>;

    /// Total order over present values.
    fn compare(&self, a: &T, b: &T) -> Ordering;

    /// Total order extended to absent operands: absent sorts greater.
    fn compare_opt(&self, a: Option<&T>, b: Option<&T>) -> Ordering {
        match (a, b) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => self.compare(a, b),
        }
    }
}

/// Big-endian `i64` codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct LongSerializer;

impl Serializer<i64> for LongSerializer {
    fn serialize(&self, value: &i64, out: &mut Vec<u8>) {
        out.extend_from_slice(&value.to_be_bytes());
    }

    fn deserialize(&self, input: &mut BufferHandler) -> Result<i64> {
        let bytes = input.read(8)?;
        let array: [u8; 8] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| Error::Corruption("truncated i64".to_string()))?;
        Ok(i64::from_be_bytes(array))
    }

    fn compare(&self, a: &i64, b: &i64) -> Ordering {
        a.cmp(b)
    }
}

/// Length-prefixed UTF-8 string codec: a big-endian `u32` byte length
/// followed by the bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringSerializer;

impl Serializer<String> for StringSerializer {
    fn serialize(&self, value: &String, out: &mut Vec<u8>) {
        let bytes = value.as_bytes();
        out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        out.extend_from_slice(bytes);
    }

    fn deserialize(&self, input: &mut BufferHandler) -> Result<String> {
        let len_bytes = input.read(4)?;
        let array: [u8; 4] = len_bytes
            .as_slice()
            .try_into()
            .map_err(|_| Error::Corruption("truncated string length".to_string()))?;
        let len = u32::from_be_bytes(array) as usize;
        let bytes = input.read(len).map_err(|e| match e {
            // A length prefix with no payload is never a clean boundary.
            Error::EndOfInput => Error::Corruption(format!(
                "string payload truncated: expected {} bytes",
                len
            )),
            other => other,
        })?;
        String::from_utf8(bytes)
            .map_err(|e| Error::Corruption(format!("invalid UTF-8 in string: {}", e)))
    }

    fn compare(&self, a: &String, b: &String) -> Ordering {
        a.cmp(b)
    }
}
