//! Keys that identify data in the network.
//!
//! Two disjoint families of keys exist and each is served by its own scheduler:
//! - [ContentKey]: addressed directly by the digest of the content.
//! - [SubspaceKey]: addressed by a long-lived identity and a name within that identity's subspace.

use commonware_cryptography::sha256::{hash, Digest};
use std::fmt;

/// The family a [Key] belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Family {
    /// Keys derived from the digest of the content.
    Content,
    /// Keys bound to an identity.
    Subspace,
}

impl Family {
    /// Every known family.
    pub const ALL: [Family; 2] = [Family::Content, Family::Subspace];
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::Content => write!(f, "content"),
            Family::Subspace => write!(f, "subspace"),
        }
    }
}

/// A key addressed by the digest of the content it refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentKey {
    digest: Digest,
}

impl ContentKey {
    /// Create a key from a known content digest.
    pub fn new(digest: Digest) -> Self {
        Self { digest }
    }

    /// Derive the key of some content.
    pub fn from_data(data: &[u8]) -> Self {
        Self::new(hash(data))
    }

    /// Returns the content digest.
    pub fn digest(&self) -> &Digest {
        &self.digest
    }
}

/// A key bound to an identity rather than to content.
///
/// The data behind a subspace key can change over time (as long as the
/// identity signs it), so it is verified and scheduled separately from
/// content keys.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubspaceKey {
    identity: Digest,
    name: String,
}

impl SubspaceKey {
    /// Create a key for `name` in the subspace of `identity` (the digest of a public key).
    pub fn new(identity: Digest, name: impl Into<String>) -> Self {
        Self {
            identity,
            name: name.into(),
        }
    }

    /// Returns the digest of the identity that owns the subspace.
    pub fn identity(&self) -> &Digest {
        &self.identity
    }

    /// Returns the name of the document within the subspace.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the digest used to route requests for this key.
    pub fn routing(&self) -> Digest {
        let name = hash(self.name.as_bytes());
        let mut preimage = Vec::with_capacity(self.identity.len() + name.len());
        preimage.extend_from_slice(&self.identity);
        preimage.extend_from_slice(&name);
        hash(&preimage)
    }
}

/// A key identifying data that can be fetched.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Key {
    Content(ContentKey),
    Subspace(SubspaceKey),
}

impl Key {
    /// Returns the family of the key.
    pub fn family(&self) -> Family {
        match self {
            Key::Content(_) => Family::Content,
            Key::Subspace(_) => Family::Subspace,
        }
    }

    /// Returns the digest used to route requests for this key.
    pub fn routing(&self) -> Digest {
        match self {
            Key::Content(key) => *key.digest(),
            Key::Subspace(key) => key.routing(),
        }
    }
}

impl From<ContentKey> for Key {
    fn from(key: ContentKey) -> Self {
        Key::Content(key)
    }
}

impl From<SubspaceKey> for Key {
    fn from(key: SubspaceKey) -> Self {
        Key::Subspace(key)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Content(key) => write!(f, "content:{}", key.digest),
            Key::Subspace(key) => write!(f, "subspace:{}/{}", key.identity, key.name),
        }
    }
}
