//! Gmail label lookup entries

use serde::{Deserialize, Serialize};

/// Gmail label ID, either a system name like `INBOX` or a user `Label_N`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelId(pub String);

impl LabelId {
    /// Label discovered when none is given
    pub const INBOX: &'static str = "INBOX";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for LabelId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for LabelId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

/// Label ID to display name mapping, as cached in the tracking store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub id: LabelId,
    pub name: String,
}

impl Label {
    pub fn new(id: impl Into<LabelId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}
