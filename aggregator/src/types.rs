//! Registration records and their conditions.
//!
//! A record binds one `group/version` to a backend network target, or to the
//! gateway itself when no backend is set ("local"). Its name is always
//! `<version>.<group>`; the legacy group has an empty name, giving `v1.`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub const MAX_GROUP_PRIORITY: i32 = 20000;
pub const MAX_VERSION_PRIORITY: i32 = 1000;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("record name {name:?} must be {expected:?}")]
    InvalidName { name: String, expected: String },

    #[error("invalid version {0:?}")]
    InvalidVersion(String),

    #[error("invalid group {0:?}")]
    InvalidGroup(String),

    #[error("group priority minimum {0} must be in 1..={MAX_GROUP_PRIORITY}")]
    GroupPriorityOutOfRange(i32),

    #[error("version priority {0} must be in 1..={MAX_VERSION_PRIORITY}")]
    VersionPriorityOutOfRange(i32),

    #[error("backend namespace and name must not be empty")]
    EmptyBackendName,

    #[error("insecure_skip_tls_verify and ca_bundle cannot both be set")]
    ConflictingTls,

    #[error("duplicate entry: {0}")]
    Duplicate(String),

    #[error("worker count must be at least 1")]
    NoWorkers,

    #[error("timeout must be at least 1 second")]
    InvalidTimeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupVersion {
    pub group: String,
    pub version: String,
}

impl GroupVersion {
    pub fn new(group: impl Into<String>, version: impl Into<String>) -> Self {
        GroupVersion {
            group: group.into(),
            version: version.into(),
        }
    }

    /// Record name for this group version.
    pub fn record_name(&self) -> String {
        format!("{}.{}", self.version, self.group)
    }

    /// Parses a record name back into a group version. The version is the part
    /// before the first dot.
    pub fn from_record_name(name: &str) -> Option<Self> {
        let (version, group) = name.split_once('.')?;
        if version.is_empty() {
            return None;
        }
        Some(GroupVersion::new(group, version))
    }

    /// `group/version`, or just `version` for the legacy group.
    pub fn as_path_segment(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Server path serving this group version (`/apis/g/v` or `/api/v`).
    pub fn api_path(&self) -> String {
        if self.group.is_empty() {
            format!("/api/{}", self.version)
        } else {
            format!("/apis/{}/{}", self.group, self.version)
        }
    }
}

impl std::fmt::Display for GroupVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_path_segment())
    }
}

/// Reference to the network target serving a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendRef {
    pub namespace: String,
    pub name: String,
    #[serde(default = "default_backend_port")]
    pub port: u16,
}

fn default_backend_port() -> u16 {
    443
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationSpec {
    pub group: String,
    pub version: String,
    /// Absent for records served by the gateway itself.
    #[serde(default)]
    pub backend: Option<BackendRef>,
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
    /// PEM encoded CA bundle used to verify the backend's serving certificate.
    #[serde(default)]
    pub ca_bundle: Option<String>,
    pub group_priority_minimum: i32,
    pub version_priority: i32,
}

impl RegistrationSpec {
    pub fn group_version(&self) -> GroupVersion {
        GroupVersion::new(&self.group, &self.version)
    }

    pub fn is_local(&self) -> bool {
        self.backend.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionType {
    Available,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub r#type: ConditionType,
    pub status: ConditionStatus,
    pub last_transition_time: DateTime<Utc>,
    pub reason: String,
    pub message: String,
}

impl Condition {
    pub fn new(
        r#type: ConditionType,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Condition {
            r#type,
            status,
            last_transition_time: Utc::now(),
            reason: reason.into(),
            message: message.into(),
        }
    }

    /// Equal in everything but the transition time.
    pub fn same_state(&self, other: &Condition) -> bool {
        self.r#type == other.r#type
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistrationStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl RegistrationStatus {
    pub fn get_condition(&self, r#type: ConditionType) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.r#type == r#type)
    }

    /// Sets a condition, keeping at most one per type. The transition time only
    /// moves when the status value changes.
    pub fn set_condition(&mut self, mut condition: Condition) {
        match self
            .conditions
            .iter_mut()
            .find(|c| c.r#type == condition.r#type)
        {
            Some(existing) => {
                if existing.status == condition.status {
                    condition.last_transition_time = existing.last_transition_time;
                }
                *existing = condition;
            }
            None => self.conditions.push(condition),
        }
    }

    /// Compares conditions ignoring transition times.
    pub fn same_state(&self, other: &RegistrationStatus) -> bool {
        self.conditions.len() == other.conditions.len()
            && self.conditions.iter().all(|c| {
                other
                    .get_condition(c.r#type)
                    .is_some_and(|o| o.same_state(c))
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationRecord {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Assigned by the store; bumped on every write.
    #[serde(default)]
    pub resource_version: u64,
    pub spec: RegistrationSpec,
    #[serde(default)]
    pub status: RegistrationStatus,
}

impl RegistrationRecord {
    /// Builds a record whose name is derived from its group and version.
    pub fn new(spec: RegistrationSpec) -> Self {
        RegistrationRecord {
            name: spec.group_version().record_name(),
            labels: BTreeMap::new(),
            resource_version: 0,
            spec,
            status: RegistrationStatus::default(),
        }
    }

    pub fn group_version(&self) -> GroupVersion {
        self.spec.group_version()
    }

    pub fn is_local(&self) -> bool {
        self.spec.is_local()
    }

    pub fn is_available(&self) -> bool {
        self.status
            .get_condition(ConditionType::Available)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }

    /// Rejects malformed records before they can enter the live state.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let spec = &self.spec;

        if !is_dns1035_label(&spec.version) {
            return Err(ValidationError::InvalidVersion(spec.version.clone()));
        }
        if !spec.group.is_empty() && !is_dns1123_subdomain(&spec.group) {
            return Err(ValidationError::InvalidGroup(spec.group.clone()));
        }

        let expected = spec.group_version().record_name();
        if self.name != expected {
            return Err(ValidationError::InvalidName {
                name: self.name.clone(),
                expected,
            });
        }

        if !(1..=MAX_GROUP_PRIORITY).contains(&spec.group_priority_minimum) {
            return Err(ValidationError::GroupPriorityOutOfRange(
                spec.group_priority_minimum,
            ));
        }
        if !(1..=MAX_VERSION_PRIORITY).contains(&spec.version_priority) {
            return Err(ValidationError::VersionPriorityOutOfRange(
                spec.version_priority,
            ));
        }

        if let Some(backend) = &spec.backend {
            if backend.namespace.is_empty() || backend.name.is_empty() {
                return Err(ValidationError::EmptyBackendName);
            }
            if backend.port == 0 {
                return Err(ValidationError::InvalidPort);
            }
        }

        if spec.insecure_skip_tls_verify && spec.ca_bundle.as_ref().is_some_and(|c| !c.is_empty())
        {
            return Err(ValidationError::ConflictingTls);
        }

        Ok(())
    }
}

fn is_dns1035_label(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 63
        && s.starts_with(|c: char| c.is_ascii_lowercase())
        && !s.ends_with('-')
        && s
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

fn is_dns1123_subdomain(s: &str) -> bool {
    s.len() <= 253
        && s.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && label.starts_with(|c: char| c.is_ascii_alphanumeric())
                && label.ends_with(|c: char| c.is_ascii_alphanumeric())
                && label
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        })
}
