use serde::{Deserialize, Serialize};
use std::{fmt::Display, ops::Deref};

/// Opaque identifier for embedding records and uploaded images.
///
/// Freshly generated ids are ULIDs, so they sort by creation time and only
/// contain ASCII alphanumerics (safe to embed in file names).
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Eid(String);

impl Display for Eid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Deref for Eid {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<&str> for Eid {
    fn from(fr: &str) -> Self {
        Eid(fr.to_string())
    }
}

impl From<String> for Eid {
    fn from(fr: String) -> Self {
        Eid(fr)
    }
}

impl From<Eid> for String {
    fn from(fr: Eid) -> Self {
        fr.0
    }
}

impl Eid {
    #[inline]
    pub fn new() -> Eid {
        Eid(rusty_ulid::generate_ulid_string())
    }

    /// Placeholder for records that have not been inserted yet.
    pub fn unassigned() -> Eid {
        Eid(String::new())
    }

    pub fn is_unassigned(&self) -> bool {
        self.0.is_empty()
    }
}

/// Ids accepted from clients: ASCII alphanumerics, at most 64 chars.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= 64 && id.bytes().all(|b| b.is_ascii_alphanumeric())
}
