//! Framed, authenticated byte-stream channels.
//!
//! Every message travels as a single frame:
//!
//! ```text
//! [payload length: u32 LE][uncompressed length: u32 LE][payload]
//! ```
//!
//! An uncompressed length of zero means the payload is stored as is.
//! Payloads are written out in chunks of [`CHUNK_SIZE`] bytes, and the
//! reading side loops until all the declared bytes have arrived.

use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_repr::*;

use crate::{Error, Result};

mod auth;
mod tcp;

pub use auth::{Hello, Secret};
pub use tcp::{Channel, Listener};

/// Size of the segments large payloads are written in.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Size of the frame header in bytes.
pub const HEADER_SIZE: usize = 8;

#[derive(Copy, Clone, Debug)]
pub struct SocketConfig {
    /// Encoding scheme used by the socket
    pub encoding: Encoding,
    /// Decides which outgoing payloads get compressed
    pub compression: CompressionPolicy,
    /// Limit on establishing a single connection
    pub connect_timeout: Duration,
    /// Limit on waiting for the accept/reject reply during handshake
    pub handshake_timeout: Duration,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            encoding: Encoding::Bincode,
            compression: CompressionPolicy::LargerThan(CHUNK_SIZE),
            connect_timeout: Duration::from_secs(3),
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

/// List of possible formats for encoding data sent over the network.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize_repr, Serialize_repr)]
#[repr(u8)]
pub enum Encoding {
    /// Fast binary format, useful for communicating directly between Rust apps
    Bincode,
    /// Binary format with implementations in many different languages
    MsgPack,
    /// Very common but more verbose format
    Json,
}

impl FromStr for Encoding {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        let e = match s.to_lowercase().as_str() {
            "bincode" | "bin" => Self::Bincode,
            #[cfg(feature = "msgpack_encoding")]
            "msgpack" | "messagepack" | "rmp" => Self::MsgPack,
            #[cfg(feature = "json_encoding")]
            "json" => Self::Json,
            _ => {
                return Err(Error::Other(format!(
                    "failed parsing encoding from string: {}",
                    s
                )))
            }
        };
        Ok(e)
    }
}

impl Display for Encoding {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bincode => write!(f, "bincode"),
            Self::MsgPack => write!(f, "msgpack"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Defines which payloads get compressed before being sent out.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CompressionPolicy {
    Nothing,
    Everything,
    /// Compress payloads larger than the given number of bytes
    LargerThan(usize),
}

impl CompressionPolicy {
    pub fn should_compress(&self, len: usize) -> bool {
        if !cfg!(feature = "lz4") {
            return false;
        }
        match self {
            CompressionPolicy::Nothing => false,
            CompressionPolicy::Everything => true,
            CompressionPolicy::LargerThan(n) => len > *n,
        }
    }
}

impl Display for CompressionPolicy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Nothing => write!(f, "none"),
            Self::Everything => write!(f, "all"),
            Self::LargerThan(n) => write!(f, "only_larger_than:{}", n),
        }
    }
}

impl FromStr for CompressionPolicy {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        let policy = match s.to_lowercase().as_str() {
            "none" | "nothing" | "off" => Self::Nothing,
            "all" | "everything" | "on" => Self::Everything,
            other => match other.strip_prefix("only_larger_than:") {
                Some(n) => Self::LargerThan(n.parse()?),
                None => {
                    return Err(Error::Other(format!(
                        "failed parsing compression policy from string: {}",
                        s
                    )))
                }
            },
        };
        Ok(policy)
    }
}

/// Packs serializable object to bytes based on selected encoding.
pub(crate) fn pack<S: Serialize>(obj: &S, encoding: &Encoding) -> Result<Vec<u8>> {
    let packed: Vec<u8> = match encoding {
        Encoding::Bincode => bincode::serialize(obj)?,
        Encoding::MsgPack => {
            #[cfg(not(feature = "msgpack_encoding"))]
            return Err(Error::Other(
                "msgpack encoding requires the msgpack_encoding crate feature".to_string(),
            ));
            #[cfg(feature = "msgpack_encoding")]
            {
                rmp_serde::to_vec(obj)?
            }
        }
        Encoding::Json => {
            #[cfg(not(feature = "json_encoding"))]
            return Err(Error::Other(
                "json encoding requires the json_encoding crate feature".to_string(),
            ));
            #[cfg(feature = "json_encoding")]
            {
                serde_json::to_vec(obj)?
            }
        }
    };
    Ok(packed)
}

/// Unpacks object from bytes based on selected encoding.
pub(crate) fn unpack<D: DeserializeOwned>(bytes: &[u8], encoding: &Encoding) -> Result<D> {
    let unpacked = match encoding {
        Encoding::Bincode => bincode::deserialize(bytes)?,
        Encoding::MsgPack => {
            #[cfg(not(feature = "msgpack_encoding"))]
            return Err(Error::Other(
                "msgpack encoding requires the msgpack_encoding crate feature".to_string(),
            ));
            #[cfg(feature = "msgpack_encoding")]
            {
                rmp_serde::from_read_ref(bytes)?
            }
        }
        Encoding::Json => {
            #[cfg(not(feature = "json_encoding"))]
            return Err(Error::Other(
                "json encoding requires the json_encoding crate feature".to_string(),
            ));
            #[cfg(feature = "json_encoding")]
            {
                serde_json::from_slice(bytes)?
            }
        }
    };
    Ok(unpacked)
}

/// Compress bytes using lz4.
#[cfg(feature = "lz4")]
pub(crate) fn compress(bytes: &[u8]) -> Result<Vec<u8>> {
    let compressed = lz4::block::compress(bytes, None, false)?;
    Ok(compressed)
}

#[cfg(feature = "lz4")]
pub(crate) fn decompress(bytes: &[u8], uncompressed_size: u32) -> Result<Vec<u8>> {
    let decompressed = lz4::block::decompress(bytes, Some(uncompressed_size as i32))?;
    Ok(decompressed)
}

#[cfg(not(feature = "lz4"))]
pub(crate) fn compress(_bytes: &[u8]) -> Result<Vec<u8>> {
    Err(Error::Other(
        "compression requires the lz4 crate feature".to_string(),
    ))
}

#[cfg(not(feature = "lz4"))]
pub(crate) fn decompress(_bytes: &[u8], _uncompressed_size: u32) -> Result<Vec<u8>> {
    Err(Error::Other(
        "received compressed frame but the lz4 crate feature is not enabled".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compression_policy_parse() {
        assert_eq!(
            "none".parse::<CompressionPolicy>().unwrap(),
            CompressionPolicy::Nothing
        );
        assert_eq!(
            "only_larger_than:1024".parse::<CompressionPolicy>().unwrap(),
            CompressionPolicy::LargerThan(1024)
        );
        assert!("sometimes".parse::<CompressionPolicy>().is_err());
        assert!(!CompressionPolicy::LargerThan(10).should_compress(10));
    }

    #[cfg(feature = "lz4")]
    #[test]
    fn lz4_block_round_trip() {
        let bytes = vec![42u8; 100_000];
        let compressed = compress(&bytes).unwrap();
        assert!(compressed.len() < bytes.len());
        assert_eq!(decompress(&compressed, bytes.len() as u32).unwrap(), bytes);
    }
}
