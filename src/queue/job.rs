use serde::{Deserialize, Serialize};

/// Id the queue returns when nothing is pending.
pub const NO_JOB_ID: &str = "none";

/// Opaque job identifier assigned by the remote queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for the "no job pending" sentinel (`"none"` or empty).
    pub fn is_none(&self) -> bool {
        self.0.is_empty() || self.0 == NO_JOB_ID
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// One unit of untrusted source code fetched from the queue.
///
/// Accepts both `{id, sourceText}` and the older `{_id, js}` field names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    #[serde(alias = "_id")]
    pub id: JobId,
    #[serde(rename = "sourceText", alias = "js", default)]
    pub source_text: String,
}

impl Job {
    pub fn new(id: impl Into<String>, source_text: impl Into<String>) -> Self {
        Self {
            id: JobId::new(id),
            source_text: source_text.into(),
        }
    }

    /// The sentinel returned by an empty queue.
    pub fn none() -> Self {
        Self::new(NO_JOB_ID, "")
    }

    pub fn is_pending(&self) -> bool {
        !self.id.is_none()
    }
}
