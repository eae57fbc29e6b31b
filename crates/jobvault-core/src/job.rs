//! Job record types persisted by the store.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::file::FileId;

/// Opaque identifier of a stored job.
///
/// Assigned by the store at creation time and never changed afterwards. The
/// string form is backend specific.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Wrap a backend-assigned identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Resource requirements of a job. Opaque to the store.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Requirements {
    /// Memory in bytes.
    pub memory: u64,

    /// Number of cores (may be fractional).
    pub cores: f64,

    /// Scratch disk in bytes.
    pub disk: u64,

    /// Whether the job may run on preemptable nodes.
    pub preemptable: bool,
}

impl Default for Requirements {
    fn default() -> Self {
        Self {
            memory: 2 * 1024 * 1024 * 1024,
            cores: 1.0,
            disk: 2 * 1024 * 1024 * 1024,
            preemptable: false,
        }
    }
}

impl Requirements {
    /// Create requirements from explicit values.
    pub fn new(memory: u64, cores: f64, disk: u64, preemptable: bool) -> Self {
        Self {
            memory,
            cores,
            disk,
            preemptable,
        }
    }
}

/// Reference to a successor job, as held in a parent's `stack`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRef {
    /// ID of the referenced job.
    pub id: JobId,

    /// Command of the referenced job at the time the reference was taken.
    pub command: String,

    /// Requirements of the referenced job.
    pub requirements: Requirements,

    /// Job name.
    pub name: String,

    /// Unit name.
    pub unit_name: Option<String>,

    /// Number of predecessors the referenced job waits for.
    pub predecessor_number: u32,
}

/// A job to be created. The store assigns its ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobNode {
    /// Opaque command payload.
    pub command: String,

    /// Resource requirements.
    pub requirements: Requirements,

    /// Human-readable job name.
    pub name: String,

    /// Human-readable unit name.
    pub unit_name: Option<String>,

    /// Number of predecessors this job waits for.
    pub predecessor_number: u32,
}

impl JobNode {
    /// Create a job node with the given command and requirements.
    pub fn new(command: impl Into<String>, requirements: Requirements) -> Self {
        Self {
            command: command.into(),
            requirements,
            name: String::new(),
            unit_name: None,
            predecessor_number: 0,
        }
    }

    /// Set the job name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the unit name.
    pub fn with_unit_name(mut self, unit_name: impl Into<String>) -> Self {
        self.unit_name = Some(unit_name.into());
        self
    }

    /// Set the predecessor count.
    pub fn with_predecessor_number(mut self, n: u32) -> Self {
        self.predecessor_number = n;
        self
    }
}

/// Default retry budget for a freshly created job.
pub const DEFAULT_RETRY_COUNT: u32 = 1;

/// A persisted node of the job graph.
///
/// Two descriptions are equal iff every field is equal, including the ID and
/// the open attribute map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescription {
    /// Store-assigned identifier.
    pub id: JobId,

    /// Opaque command payload.
    pub command: String,

    /// Resource requirements.
    pub requirements: Requirements,

    /// Human-readable job name.
    pub name: String,

    /// Human-readable unit name.
    pub unit_name: Option<String>,

    /// Batches of successor jobs, scheduled batch by batch.
    pub stack: Vec<Vec<JobRef>>,

    /// Number of predecessors this job waits for.
    pub predecessor_number: u32,

    /// Predecessors observed as finished.
    pub predecessors_finished: BTreeSet<JobId>,

    /// Files staged for deletion by the two-phase update.
    pub files_to_delete: Vec<FileId>,

    /// File holding this job's log output.
    pub log_file_id: Option<FileId>,

    /// Engine-managed retry counter.
    pub remaining_retry_count: u32,

    /// Arbitrary caller-attached attributes, persisted unchanged.
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl JobDescription {
    /// Build the stored form of a node under a freshly assigned ID.
    pub fn from_node(id: JobId, node: JobNode) -> Self {
        Self {
            id,
            command: node.command,
            requirements: node.requirements,
            name: node.name,
            unit_name: node.unit_name,
            stack: Vec::new(),
            predecessor_number: node.predecessor_number,
            predecessors_finished: BTreeSet::new(),
            files_to_delete: Vec::new(),
            log_file_id: None,
            remaining_retry_count: DEFAULT_RETRY_COUNT,
            attributes: BTreeMap::new(),
        }
    }

    /// Take a reference to this job for a parent's stack.
    pub fn to_ref(&self) -> JobRef {
        JobRef {
            id: self.id.clone(),
            command: self.command.clone(),
            requirements: self.requirements,
            name: self.name.clone(),
            unit_name: self.unit_name.clone(),
            predecessor_number: self.predecessor_number,
        }
    }

    /// Append a batch of successors to the stack.
    pub fn push_successors(&mut self, batch: impl IntoIterator<Item = JobRef>) {
        self.stack.push(batch.into_iter().collect());
    }

    /// IDs of every job referenced from the stack.
    pub fn successor_ids(&self) -> impl Iterator<Item = &JobId> {
        self.stack.iter().flatten().map(|r| &r.id)
    }

    /// Set an attribute.
    pub fn set_attribute(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.attributes.insert(key.into(), value);
    }

    /// Get an attribute.
    pub fn attribute(&self, key: &str) -> Option<&serde_json::Value> {
        self.attributes.get(key)
    }

    /// Whether the two-phase update has deletions pending.
    pub fn has_staged_deletions(&self) -> bool {
        !self.files_to_delete.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> JobNode {
        JobNode::new("parent1", Requirements::new(12, 34.0, 35, true))
            .with_name("test1")
            .with_unit_name("onParent")
    }

    #[test]
    fn test_from_node_defaults() {
        let job = JobDescription::from_node(JobId::new("j-1"), node());
        assert_eq!(job.command, "parent1");
        assert_eq!(job.requirements.memory, 12);
        assert_eq!(job.requirements.cores, 34.0);
        assert_eq!(job.requirements.disk, 35);
        assert!(job.requirements.preemptable);
        assert!(job.stack.is_empty());
        assert!(job.predecessors_finished.is_empty());
        assert!(job.log_file_id.is_none());
        assert!(!job.has_staged_deletions());
    }

    #[test]
    fn test_equality_includes_id_and_attributes() {
        let a = JobDescription::from_node(JobId::new("j-1"), node());
        let mut b = a.clone();
        assert_eq!(a, b);

        b.set_attribute("foo", serde_json::json!("bar"));
        assert_ne!(a, b);

        let c = JobDescription::from_node(JobId::new("j-2"), node());
        assert_ne!(a, c);
    }

    #[test]
    fn test_serde_roundtrip_keeps_attributes() {
        let mut job = JobDescription::from_node(JobId::new("j-1"), node());
        let child = JobDescription::from_node(JobId::new("j-2"), node());
        job.push_successors([child.to_ref()]);
        job.set_attribute("blob", serde_json::json!([1, 2, 3]));
        job.predecessors_finished.insert(JobId::new("j-0"));

        let json = serde_json::to_string(&job).unwrap();
        let back: JobDescription = serde_json::from_str(&json).unwrap();
        assert_eq!(job, back);
        assert_eq!(back.successor_ids().collect::<Vec<_>>(), vec![&child.id]);
    }
}
