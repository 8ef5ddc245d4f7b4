// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Typed message layer over the core's opaque payloads.
//!
//! The core moves `(bytes, type name)` pairs and never inspects the bytes;
//! this trait is where bytes and types meet. Implementations must be
//! symmetric: `decode(encode(m)) == m`.

use crate::error::{Error, Result};

/// A message that can cross the fabric.
pub trait Message: Sized + Send + Sync + 'static {
    /// Type tag carried next to the payload on the wire.
    const TYPE_NAME: &'static str;

    /// Serialize into an owned byte buffer.
    fn encode(&self) -> Result<Vec<u8>>;

    /// Deserialize from wire bytes.
    fn decode(bytes: &[u8]) -> Result<Self>;
}

/// Metadata handed to subscription callbacks alongside the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageInfo {
    /// Fully scoped topic the message was published on.
    pub topic: String,
    /// Type tag of the payload.
    pub msg_type: String,
}

impl Message for String {
    const TYPE_NAME: &'static str = "string";

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(self.as_bytes().to_vec())
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::Deserialization(format!("invalid utf-8: {}", e)))
    }
}

impl Message for Vec<u8> {
    const TYPE_NAME: &'static str = "bytes";

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(self.clone())
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bytes.to_vec())
    }
}

macro_rules! numeric_message {
    ($ty:ty, $name:literal, $width:literal) => {
        impl Message for $ty {
            const TYPE_NAME: &'static str = $name;

            fn encode(&self) -> Result<Vec<u8>> {
                Ok(self.to_le_bytes().to_vec())
            }

            fn decode(bytes: &[u8]) -> Result<Self> {
                let arr: [u8; $width] = bytes.try_into().map_err(|_| {
                    Error::Deserialization(format!(
                        "expected {} bytes for {}, got {}",
                        $width,
                        $name,
                        bytes.len()
                    ))
                })?;
                Ok(<$ty>::from_le_bytes(arr))
            }
        }
    };
}

numeric_message!(i32, "int32", 4);
numeric_message!(i64, "int64", 8);
numeric_message!(u32, "uint32", 4);
numeric_message!(u64, "uint64", 8);
numeric_message!(f32, "float32", 4);
numeric_message!(f64, "float64", 8);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_roundtrip() {
        let s = "hello fabric".to_string();
        let bytes = s.encode().unwrap();
        assert_eq!(String::decode(&bytes).unwrap(), s);
    }

    #[test]
    fn string_rejects_bad_utf8() {
        assert!(String::decode(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn numeric_roundtrip() {
        let n: i64 = -42;
        assert_eq!(i64::decode(&n.encode().unwrap()).unwrap(), n);
        let x: f64 = 2.5;
        assert_eq!(f64::decode(&x.encode().unwrap()).unwrap(), x);
    }

    #[test]
    fn numeric_rejects_wrong_width() {
        assert!(u32::decode(&[1, 2, 3]).is_err());
    }

    #[test]
    fn type_names_are_distinct() {
        let names = [
            String::TYPE_NAME,
            Vec::<u8>::TYPE_NAME,
            i32::TYPE_NAME,
            i64::TYPE_NAME,
            u32::TYPE_NAME,
            u64::TYPE_NAME,
            f32::TYPE_NAME,
            f64::TYPE_NAME,
        ];
        for (i, a) in names.iter().enumerate() {
            for b in &names[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
