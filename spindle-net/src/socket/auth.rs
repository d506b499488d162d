use std::convert::TryFrom;
use std::fmt;

/// Shared secret used to authenticate connections.
///
/// Only the digest of the secret ever travels over the network.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret {
    digest: blake3::Hash,
}

impl Secret {
    pub fn new(secret: &str) -> Self {
        Self {
            digest: blake3::hash(secret.as_bytes()),
        }
    }

    pub fn digest(&self) -> &[u8; 32] {
        self.digest.as_bytes()
    }

    /// Compares a received digest with our own in constant time.
    pub fn matches(&self, digest: &[u8]) -> bool {
        match <[u8; 32]>::try_from(digest) {
            Ok(bytes) => blake3::Hash::from(bytes) == self.digest,
            Err(_) => false,
        }
    }
}

impl Default for Secret {
    fn default() -> Self {
        Self::new("")
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret(..)")
    }
}

/// First frame sent by the connecting side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    #[serde(with = "serde_bytes")]
    pub digest: Vec<u8>,
    /// Name the client wants to be known by, defaults to its address
    pub identity: Option<String>,
}

/// Reply byte accepting the handshake.
pub(crate) const ACCEPT: u8 = 1;
/// Reply byte rejecting the handshake.
pub(crate) const REJECT: u8 = 0;

#[test]
fn secret_matching() {
    let secret = Secret::new("swordfish");
    assert!(secret.matches(Secret::new("swordfish").digest()));
    assert!(!secret.matches(Secret::new("sw0rdfish").digest()));
    assert!(!secret.matches(&[0u8; 16]));
    let mut longer = secret.digest().to_vec();
    longer.push(0);
    assert!(!secret.matches(&longer));
}
