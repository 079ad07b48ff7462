//! Step descriptors received from the controller.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::VariableStore;

const DEFAULT_TIMEOUT_SECONDS: u64 = 1800;

/// Mount point of a data volume inside its seeding container.
pub const VOLUME_SEED_TARGET: &str = "/target";

/// Errors describing a malformed step descriptor.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StepSpecError {
    #[error("Step {step_id} declares more than one runtime container")]
    MultipleRuntimes { step_id: String },

    #[error("Step {step_id} has an invalid timeout: {timeout_seconds}")]
    InvalidTimeout { step_id: String, timeout_seconds: u64 },

    #[error("Step {step_id} container #{index} has no image")]
    MissingImage { step_id: String, index: usize },

    #[error("Malformed volume record '{record}': {reason}")]
    MalformedVolume { record: String, reason: String },
}

impl StepSpecError {
    /// Create a malformed volume error.
    pub fn malformed_volume(record: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedVolume {
            record: record.into(),
            reason: reason.into(),
        }
    }
}

/// Input descriptor for one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepIn {
    /// Opaque step identifier.
    pub id: String,
    pub flow_id: String,
    pub job_id: String,
    /// A non-zero exit still yields SUCCESS when set.
    #[serde(default)]
    pub allow_failure: bool,
    /// Plugin repository materialized before the step runs.
    #[serde(default)]
    pub plugin: Option<String>,
    #[serde(default)]
    pub cache: Option<CacheSpec>,
    /// Empty for host execution, one or many for container groups.
    #[serde(default)]
    pub dockers: Vec<ContainerSpec>,
    /// Opaque shell source lines.
    #[serde(default)]
    pub scripts: Vec<String>,
    #[serde(default = "default_timeout", alias = "timeout")]
    pub timeout_seconds: u64,
    /// Additional attempts on non-success.
    #[serde(default)]
    pub retry: u32,
    #[serde(default)]
    pub inputs: VariableStore,
    /// Name prefixes of variables exported into the result.
    #[serde(default)]
    pub env_filters: Vec<String>,
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECONDS
}

impl StepIn {
    /// Create a host step with the given scripts and defaults for everything else.
    pub fn new(id: impl Into<String>, scripts: Vec<String>) -> Self {
        Self {
            id: id.into(),
            flow_id: "flow".to_string(),
            job_id: "job".to_string(),
            allow_failure: false,
            plugin: None,
            cache: None,
            dockers: Vec::new(),
            scripts,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            retry: 0,
            inputs: VariableStore::new(),
            env_filters: Vec::new(),
        }
    }

    /// Whether this step runs inside containers.
    pub fn has_containers(&self) -> bool {
        !self.dockers.is_empty()
    }

    /// Index of the runtime container, defaulting to the first one.
    pub fn runtime_index(&self) -> Result<Option<usize>, StepSpecError> {
        if self.dockers.is_empty() {
            return Ok(None);
        }
        let mut marked = self.dockers.iter().enumerate().filter(|(_, spec)| spec.is_runtime);
        match (marked.next(), marked.next()) {
            (Some(_), Some(_)) => Err(StepSpecError::MultipleRuntimes { step_id: self.id.clone() }),
            (Some((index, _)), None) => Ok(Some(index)),
            (None, _) => Ok(Some(0)),
        }
    }

    /// Validates structural invariants before any resources are created.
    pub fn validate(&self) -> Result<(), StepSpecError> {
        if self.timeout_seconds == 0 {
            return Err(StepSpecError::InvalidTimeout {
                step_id: self.id.clone(),
                timeout_seconds: self.timeout_seconds,
            });
        }
        if let Some(index) = self.dockers.iter().position(|spec| spec.image.trim().is_empty()) {
            return Err(StepSpecError::MissingImage {
                step_id: self.id.clone(),
                index,
            });
        }
        self.runtime_index().map(|_| ())
    }
}

/// Cache declaration attached to a step.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheSpec {
    pub key: String,
    #[serde(default)]
    pub paths: Vec<String>,
}

/// One container of a step's container group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    pub image: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub command: Vec<String>,
    /// `host:container` port mappings.
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub environment: VariableStore,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub is_runtime: bool,
    #[serde(default = "default_true")]
    pub is_stop_container: bool,
    #[serde(default = "default_true")]
    pub is_delete_container: bool,
    /// Container to resume instead of creating a new one.
    #[serde(default)]
    pub container_id: Option<String>,
}

fn default_true() -> bool {
    true
}

impl ContainerSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            is_stop_container: true,
            is_delete_container: true,
            ..Self::default()
        }
    }

    /// Returns the container id to resume, ignoring blank values.
    pub fn resume_id(&self) -> Option<&str> {
        self.container_id.as_deref().map(str::trim).filter(|id| !id.is_empty())
    }
}

/// A named persistent volume seeded once per agent lifetime.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeSpec {
    pub name: String,
    /// Mount point inside step runtime containers.
    pub dest: String,
    /// Setup script, relative to `dest`, sourced before user scripts.
    pub script: String,
    /// Image used to seed the volume; empty means the volume starts empty.
    pub image: String,
    /// Seeding script, relative to `/ws` inside the seeding image.
    pub init: String,
}

impl DataVolumeSpec {
    /// Absolute path of the seeding script inside the seeding image.
    pub fn init_script_path(&self) -> String {
        format!("/ws/{}", self.init.trim_start_matches('/'))
    }

    /// Absolute path of the setup script inside the runtime container.
    pub fn setup_script_path(&self) -> Option<String> {
        if self.script.trim().is_empty() {
            return None;
        }
        Some(format!("{}/{}", self.dest.trim_end_matches('/'), self.script.trim_start_matches('/')))
    }

    /// Docker bind string mounting the volume at `dest`.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.name, self.dest)
    }

    /// Whether the volume needs a seeding container.
    pub fn has_seed(&self) -> bool {
        !self.image.trim().is_empty() && !self.init.trim().is_empty()
    }
}

const VOLUME_FIELDS: [&str; 5] = ["name", "dest", "script", "image", "init"];

/// Parses the semicolon-separated volume spec string.
///
/// Each record holds exactly five `key=value` fields in the order
/// `name,dest,script,image,init`. Empty records are skipped.
pub fn parse_volume_specs(input: &str) -> Result<Vec<DataVolumeSpec>, StepSpecError> {
    let mut volumes = Vec::new();
    for record in input.split(';').map(str::trim).filter(|record| !record.is_empty()) {
        let fields: Vec<&str> = record.split(',').collect();
        if fields.len() != VOLUME_FIELDS.len() {
            return Err(StepSpecError::malformed_volume(
                record,
                format!("expected {} fields, found {}", VOLUME_FIELDS.len(), fields.len()),
            ));
        }

        let mut values = Vec::with_capacity(VOLUME_FIELDS.len());
        for (field, expected) in fields.iter().zip(VOLUME_FIELDS) {
            let (key, value) = field
                .split_once('=')
                .ok_or_else(|| StepSpecError::malformed_volume(record, format!("field '{field}' is not key=value")))?;
            if key.trim() != expected {
                return Err(StepSpecError::malformed_volume(
                    record,
                    format!("expected field '{expected}', found '{}'", key.trim()),
                ));
            }
            values.push(value.trim().to_string());
        }

        let [name, dest, script, image, init]: [String; 5] = values
            .try_into()
            .map_err(|_| StepSpecError::malformed_volume(record, "unexpected field count"))?;
        if name.is_empty() {
            return Err(StepSpecError::malformed_volume(record, "name must not be empty"));
        }
        if dest.is_empty() {
            return Err(StepSpecError::malformed_volume(record, "dest must not be empty"));
        }
        volumes.push(DataVolumeSpec {
            name,
            dest,
            script,
            image,
            init,
        });
    }
    Ok(volumes)
}
