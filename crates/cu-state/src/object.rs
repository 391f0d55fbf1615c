//! Git object ids and local object hashing.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::error::StateError;

/// Hex id of a git object (commit, tree, or blob).
///
/// Always 40 lowercase hex characters. The null id (all zeros) is used by
/// ref updates to mean "must not exist yet".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectId(String);

impl ObjectId {
    /// The all-zero id.
    pub fn null() -> Self {
        ObjectId("0".repeat(40))
    }

    pub fn is_null(&self) -> bool {
        self.0.bytes().all(|b| b == b'0')
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 8 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..8]
    }

    /// Hash raw object content the way git does: `"<kind> <len>\0" + data`.
    pub fn hash_object(kind: &str, data: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(format!("{kind} {}\0", data.len()).as_bytes());
        hasher.update(data);
        ObjectId(hex::encode(hasher.finalize()))
    }

    /// Id git assigns to a blob holding `data`.
    pub fn for_blob(data: &[u8]) -> Self {
        Self::hash_object("blob", data)
    }
}

impl TryFrom<String> for ObjectId {
    type Error = StateError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 40 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StateError::InvalidObjectId(s));
        }
        Ok(ObjectId(s.to_ascii_lowercase()))
    }
}

impl std::str::FromStr for ObjectId {
    type Err = StateError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ObjectId::try_from(s.trim().to_string())
    }
}

impl From<ObjectId> for String {
    fn from(id: ObjectId) -> Self {
        id.0
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
