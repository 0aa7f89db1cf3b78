//! Sync job configuration and status.

use crate::error::{ModelError, ModelResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// String options handed to a plugin's `init`.
pub type Options = BTreeMap<String, String>;

/// Name of a registry or config-center product.
///
/// Any string is accepted; the associated constants name the products the
/// engine knows about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentType(String);

impl ComponentType {
    /// Nacos.
    pub const NACOS: &'static str = "nacos";
    /// ZooKeeper.
    pub const ZOOKEEPER: &'static str = "zookeeper";
    /// Dubbo.
    pub const DUBBO: &'static str = "dubbo";
    /// Polaris Mesh.
    pub const POLARIS_MESH: &'static str = "polarismesh";
    /// Eureka.
    pub const EUREKA: &'static str = "eureka";
    /// Consul.
    pub const CONSUL: &'static str = "consul";
    /// Apollo.
    pub const APOLLO: &'static str = "apollo";
    /// The in-process registry.
    pub const MEMORY: &'static str = "memory";

    /// Well-known component names.
    pub const KNOWN: [&'static str; 8] = [
        Self::NACOS,
        Self::ZOOKEEPER,
        Self::DUBBO,
        Self::POLARIS_MESH,
        Self::EUREKA,
        Self::CONSUL,
        Self::APOLLO,
        Self::MEMORY,
    ];

    /// Creates a component type.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The component name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if this is one of [`KNOWN`](Self::KNOWN).
    pub fn is_known(&self) -> bool {
        Self::KNOWN.contains(&self.0.as_str())
    }
}

impl fmt::Display for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ComponentType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Family of a sync job. Also selects the sink's run mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    /// Services and instances.
    Discovery,
    /// Configuration files.
    Config,
}

impl JobType {
    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Discovery => "discovery",
            JobType::Config => "config",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable description of one sync job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConf {
    /// Unique job id.
    pub id: String,
    /// Job family.
    pub job_type: JobType,
    /// Runtime options of the job itself.
    #[serde(default)]
    pub job_options: Options,
    /// Source component.
    pub source: ComponentType,
    /// Options for the source reader.
    #[serde(default)]
    pub source_options: Options,
    /// Destination component.
    pub dest: ComponentType,
    /// Options for the destination writer.
    #[serde(default)]
    pub dest_options: Options,
}

impl JobConf {
    /// Creates a job conf without options.
    pub fn new(
        id: impl Into<String>,
        job_type: JobType,
        source: impl Into<String>,
        dest: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            job_type,
            job_options: Options::new(),
            source: ComponentType::new(source),
            source_options: Options::new(),
            dest: ComponentType::new(dest),
            dest_options: Options::new(),
        }
    }

    /// Adds a job option.
    pub fn with_job_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.job_options.insert(key.into(), value.into());
        self
    }

    /// Adds a source option.
    pub fn with_source_option(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.source_options.insert(key.into(), value.into());
        self
    }

    /// Adds a destination option.
    pub fn with_dest_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.dest_options.insert(key.into(), value.into());
        self
    }

    /// Checks that the conf names a job and both endpoints.
    pub fn validate(&self) -> ModelResult<()> {
        if self.id.trim().is_empty() {
            return Err(ModelError::InvalidJobConf("id must not be empty".into()));
        }
        if self.source.as_str().is_empty() {
            return Err(ModelError::InvalidJobConf(format!(
                "job {}: source must not be empty",
                self.id
            )));
        }
        if self.dest.as_str().is_empty() {
            return Err(ModelError::InvalidJobConf(format!(
                "job {}: dest must not be empty",
                self.id
            )));
        }
        Ok(())
    }

    /// Parses a JSON array of job confs and validates each one.
    pub fn parse_list(json: &str) -> ModelResult<Vec<JobConf>> {
        let confs: Vec<JobConf> = serde_json::from_str(json)?;
        for conf in &confs {
            conf.validate()?;
        }
        Ok(confs)
    }
}

/// Runtime status of a job.
///
/// ```text
/// Pending -> Building -> Running -> Stopped
///    |          |          |
///    +----------+----------+------> Crash
/// ```
///
/// `Pending` and `Building` may also move straight to `Stopped`. `Stopped`
/// and `Crash` are terminal. `Unknown` is only reported for ids that are not
/// registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    /// Not registered.
    Unknown,
    /// Waiting to be scheduled.
    Pending,
    /// Executor bound, collaborators being initialized.
    Building,
    /// Main loop started.
    Running,
    /// Cancellation requested.
    Stopped,
    /// Unrecoverable failure.
    Crash,
}

impl JobStatus {
    /// Numeric status code.
    pub fn code(&self) -> i32 {
        match self {
            JobStatus::Unknown => -1,
            JobStatus::Running => 200000,
            JobStatus::Pending => 200003,
            JobStatus::Building => 200006,
            JobStatus::Stopped => 500009,
            JobStatus::Crash => 500012,
        }
    }

    /// Inverse of [`code`](Self::code).
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(JobStatus::Unknown),
            200000 => Some(JobStatus::Running),
            200003 => Some(JobStatus::Pending),
            200006 => Some(JobStatus::Building),
            500009 => Some(JobStatus::Stopped),
            500012 => Some(JobStatus::Crash),
            _ => None,
        }
    }

    /// Returns true for `Stopped` and `Crash`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Stopped | JobStatus::Crash)
    }

    /// Returns true if the state machine allows `self -> next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Building)
                | (Pending, Stopped)
                | (Pending, Crash)
                | (Building, Running)
                | (Building, Stopped)
                | (Building, Crash)
                | (Running, Stopped)
                | (Running, Crash)
        )
    }

    /// Validates `self -> next`.
    pub fn transition(&self, next: JobStatus) -> ModelResult<JobStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(ModelError::InvalidTransition {
                from: *self,
                to: next,
            })
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL: [JobStatus; 6] = [
        JobStatus::Unknown,
        JobStatus::Pending,
        JobStatus::Building,
        JobStatus::Running,
        JobStatus::Stopped,
        JobStatus::Crash,
    ];

    #[test]
    fn happy_path() {
        let status = JobStatus::Pending
            .transition(JobStatus::Building)
            .and_then(|s| s.transition(JobStatus::Running))
            .and_then(|s| s.transition(JobStatus::Stopped))
            .unwrap();
        assert!(status.is_terminal());
    }

    #[test]
    fn terminal_states_have_no_exit() {
        for from in [JobStatus::Stopped, JobStatus::Crash] {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn unknown_never_transitions() {
        for to in ALL {
            assert!(!JobStatus::Unknown.can_transition_to(to));
        }
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Unknown));
    }

    #[test]
    fn codes() {
        assert_eq!(JobStatus::Running.code(), 200000);
        assert_eq!(JobStatus::Crash.code(), 500012);
        for status in ALL {
            assert_eq!(JobStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(JobStatus::from_code(7), None);
    }

    #[test]
    fn parse_job_list() {
        let json = r#"[
            {"id": "a", "job_type": "discovery", "source": "nacos", "dest": "polarismesh",
             "source_options": {"address": "127.0.0.1:8848"}},
            {"id": "b", "job_type": "config", "source": "apollo", "dest": "memory"}
        ]"#;
        let confs = JobConf::parse_list(json).unwrap();
        assert_eq!(confs.len(), 2);
        assert_eq!(confs[0].job_type, JobType::Discovery);
        assert_eq!(confs[0].source_options["address"], "127.0.0.1:8848");
        assert!(confs[0].source.is_known());
        assert_eq!(confs[1].dest.as_str(), ComponentType::MEMORY);
    }

    #[test]
    fn empty_id_rejected() {
        let json = r#"[{"id": " ", "job_type": "config", "source": "a", "dest": "b"}]"#;
        assert!(matches!(
            JobConf::parse_list(json),
            Err(ModelError::InvalidJobConf(_))
        ));
    }

    fn status() -> impl Strategy<Value = JobStatus> {
        prop::sample::select(ALL.to_vec())
    }

    proptest! {
        #[test]
        fn walks_never_leave_terminal(steps in prop::collection::vec(status(), 0..20)) {
            let mut current = JobStatus::Pending;
            let mut terminal_seen = false;
            for next in steps {
                if let Ok(moved) = current.transition(next) {
                    prop_assert!(!terminal_seen);
                    current = moved;
                }
                terminal_seen |= current.is_terminal();
            }
        }
    }
}
