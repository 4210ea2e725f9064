use crate::status::Status;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Renders an optional identifier for a topic segment; unknown values render
/// as `@` rather than being omitted, so topic depth is always fixed.
fn seg<T: std::fmt::Display>(value: &Option<T>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "@".to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Push = 0,
    Mr = 1,
    Manual = 2,
}

impl EventType {
    pub fn topic_word(self) -> &'static str {
        match self {
            EventType::Push => "push",
            EventType::Mr => "mr",
            EventType::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Store-assigned; a freshly parsed webhook payload has none yet.
    #[serde(default)]
    pub id: u64,
    pub project: String,
    pub event_type: EventType,
    pub clone_url: String,
    pub target_branch: String,
    /// For `Push`, the new (`after`) commit; for `Mr`/`Manual`, the sole
    /// revision to check out. Paired with `before` below for `Push`'s
    /// changeset comparison.
    pub revision: String,
    pub user: String,
    pub reason: String,
    pub mr_id: Option<u64>,
    pub mr_clone_url: Option<String>,
    pub mr_branch: Option<String>,
    /// `Push`-only: the prior commit the changeset is compared against.
    /// Supplied by the (out-of-scope) webhook receiver; unused for other
    /// event types.
    #[serde(default)]
    pub before: Option<String>,
    /// Always `NEW` for a freshly parsed webhook payload, which supplies no
    /// status of its own.
    #[serde(default)]
    pub status: Status,
}

impl Event {
    /// `events/<status>/<project>/<type>/<target>/<id>`
    pub fn topic(&self) -> String {
        format!(
            "events/{status}/{project}/{ty}/{target}/{id}",
            status = self.status.topic_word(),
            project = self.project,
            ty = self.event_type.topic_word(),
            target = self.target_branch,
            id = self.id,
        )
    }

    pub fn to_mqtt(&self) -> (String, Vec<u8>) {
        (self.topic(), serde_json::to_vec(self).expect("Event is always serializable"))
    }

    pub fn from_mqtt(payload: &[u8]) -> Result<Self, crate::ModelError> {
        serde_json::from_slice(payload).map_err(Into::into)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: u64,
    pub event_id: u64,
    pub project: String,
    pub event_type: EventType,
    pub target_branch: String,
    pub builder: Option<String>,
    pub arch: String,
    pub status: Status,
    pub tasks: Vec<Task>,
}

impl Job {
    /// `jobs/<status>/<project>/<type>/<target>/<event-id>/<builder>/<arch>/<id>`
    pub fn topic(&self) -> String {
        format!(
            "jobs/{status}/{project}/{ty}/{target}/{event_id}/{builder}/{arch}/{id}",
            status = self.status.topic_word(),
            project = self.project,
            ty = self.event_type.topic_word(),
            target = self.target_branch,
            event_id = self.event_id,
            builder = seg(&self.builder),
            arch = self.arch,
            id = self.id,
        )
    }

    pub fn to_mqtt(&self) -> (String, Vec<u8>) {
        (self.topic(), serde_json::to_vec(self).expect("Job is always serializable"))
    }

    pub fn from_mqtt(payload: &[u8]) -> Result<Self, crate::ModelError> {
        serde_json::from_slice(payload).map_err(Into::into)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: u64,
    pub job_id: u64,
    pub project: String,
    pub event_type: EventType,
    pub target_branch: String,
    pub event_id: u64,
    pub builder: Option<String>,
    pub arch: String,
    pub repo: String,
    pub pkg: String,
    pub maintainer: Option<String>,
    pub status: Status,
    pub tail: Option<String>,
}

impl Task {
    /// `tasks/<status>/<project>/<type>/<target>/<event-id>/<builder>/<arch>/<repo>/<pkg>/<id>`
    pub fn topic(&self) -> String {
        format!(
            "tasks/{status}/{project}/{ty}/{target}/{event_id}/{builder}/{arch}/{repo}/{pkg}/{id}",
            status = self.status.topic_word(),
            project = self.project,
            ty = self.event_type.topic_word(),
            target = self.target_branch,
            event_id = self.event_id,
            builder = seg(&self.builder),
            arch = self.arch,
            repo = self.repo,
            pkg = self.pkg,
            id = self.id,
        )
    }

    pub fn to_mqtt(&self) -> (String, Vec<u8>) {
        (self.topic(), serde_json::to_vec(self).expect("Task is always serializable"))
    }

    pub fn from_mqtt(payload: &[u8]) -> Result<Self, crate::ModelError> {
        serde_json::from_slice(payload).map_err(Into::into)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Arch {
    pub idle: bool,
    pub curr_jobs: u32,
    pub prev_job: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Builder {
    pub name: String,
    pub arches: BTreeMap<String, Arch>,
}

impl Builder {
    /// `builders/<name>`
    pub fn topic(&self) -> String {
        format!("builders/{}", self.name)
    }

    pub fn to_mqtt(&self) -> (String, Vec<u8>) {
        (self.topic(), serde_json::to_vec(self).expect("Builder is always serializable"))
    }

    pub fn from_mqtt(payload: &[u8]) -> Result<Self, crate::ModelError> {
        serde_json::from_slice(payload).map_err(Into::into)
    }

    /// The retained last-will payload: every arch marked offline (not idle,
    /// no in-flight jobs). Registered at broker-connect time so an observed
    /// disconnect is indistinguishable from a graceful shutdown.
    pub fn last_will(&self) -> (String, Vec<u8>) {
        let offline = Builder {
            name: self.name.clone(),
            arches: self
                .arches
                .keys()
                .map(|a| {
                    (
                        a.clone(),
                        Arch {
                            idle: false,
                            curr_jobs: 0,
                            prev_job: None,
                        },
                    )
                })
                .collect(),
        };
        offline.to_mqtt()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_job() -> Job {
        Job {
            id: 42,
            event_id: 7,
            project: "core".into(),
            event_type: EventType::Push,
            target_branch: "3.18-stable".into(),
            builder: None,
            arch: "x86_64".into(),
            status: Status::NEW,
            tasks: Vec::new(),
        }
    }

    #[test]
    fn unknown_builder_renders_as_at_sign() {
        let job = sample_job();
        assert!(job.topic().contains("/@/"));
    }

    #[test]
    fn topic_round_trips_through_mqtt_payload() {
        let job = sample_job();
        let (_, payload) = job.to_mqtt();
        let decoded = Job::from_mqtt(&payload).unwrap();
        assert_eq!(decoded.topic(), job.topic());
    }

    #[test]
    fn topic_changes_when_status_changes() {
        let mut job = sample_job();
        let before = job.topic();
        job.status = Status::START;
        assert_ne!(before, job.topic());
    }
}
