// Copyright ⓒ 2025 The Seiton Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Seiton Config
//!
//! Desired-state configuration: typed cluster and topic specs loaded from
//! YAML, with `${VAR}` environment expansion and strict field checking.
//! A topic file may hold several specs separated by `---`.

use std::{
    collections::{BTreeMap, HashMap},
    env::vars,
    fmt, fs, io,
    path::Path,
    result,
    sync::Arc,
};

use regex::{Captures, Regex, Replacer};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub type Result<T, E = Error> = result::Result<T, E>;

#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
    #[error("topic {topic} is inconsistent with the cluster config: {diffs}")]
    ClusterMismatch { topic: String, diffs: String },

    #[error("topic {topic}: {reason}")]
    InvalidTopic { topic: String, reason: String },

    #[error("io: {0}")]
    Io(Arc<io::Error>),

    #[error("regex: {0}")]
    Regex(#[from] regex::Error),

    #[error("yaml: {0}")]
    Yaml(Arc<serde_yaml::Error>),
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Yaml(Arc::new(value))
    }
}

/// key used by the broker for retention overrides, derived from
/// `retention_minutes` rather than declared in `settings`
const RETENTION_KEY: &str = "retention.ms";

/// identity of a managed resource, checked against the cluster it is
/// applied to
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceMeta {
    pub name: String,
    pub cluster: String,
    pub region: String,
    pub environment: String,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TopicConfig {
    pub meta: ResourceMeta,
    pub spec: TopicSpec,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct TopicSpec {
    pub partitions: i32,

    pub replication_factor: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_minutes: Option<i64>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub settings: BTreeMap<String, String>,

    #[serde(default)]
    pub placement: PlacementConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration: Option<MigrationConfig>,
}

impl TopicSpec {
    pub fn retention_ms(&self) -> Option<i64> {
        self.retention_minutes.map(|minutes| minutes * 60_000)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct PlacementConfig {
    #[serde(default)]
    pub strategy: PlacementStrategy,

    #[serde(default)]
    pub picker: PickerMethod,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_assignments: Option<Vec<Vec<i32>>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_rack_assignments: Option<Vec<String>>,
}

impl PlacementConfig {
    /// static placements pin replicas (or racks) per partition and are
    /// incompatible with a forced rebalance
    pub fn is_static(&self) -> bool {
        matches!(
            self.strategy,
            PlacementStrategy::Static | PlacementStrategy::StaticInRack
        )
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlacementStrategy {
    #[default]
    Any,
    BalancedLeaders,
    InRack,
    Static,
    StaticInRack,
}

impl fmt::Display for PlacementStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Any => "any",
            Self::BalancedLeaders => "balanced-leaders",
            Self::InRack => "in-rack",
            Self::Static => "static",
            Self::StaticInRack => "static-in-rack",
        })
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PickerMethod {
    #[default]
    LowestIndex,
    Randomized,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct MigrationConfig {
    /// replication bandwidth cap during migrations, in megabytes per second
    pub throttle_mb: i64,

    /// partitions reassigned per batch
    pub partition_batch_size: usize,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterMeta {
    pub name: String,
    pub region: String,
    pub environment: String,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ClusterSpec {
    #[serde(default)]
    pub bootstrap_servers: Vec<String>,

    /// base path for the cluster lock; locking is skipped when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_path: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    pub meta: ClusterMeta,
    pub spec: ClusterSpec,
}

impl TopicConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Error::InvalidTopic {
            topic: self.meta.name.clone(),
            reason,
        };

        if self.spec.partitions < 1 {
            return Err(invalid(format!(
                "at least one partition required, {} given",
                self.spec.partitions
            )));
        }

        if self.spec.replication_factor < 1 {
            return Err(invalid(format!(
                "replication factor must be positive, {} given",
                self.spec.replication_factor
            )));
        }

        if self.spec.retention_minutes.is_some() && self.spec.settings.contains_key(RETENTION_KEY)
        {
            return Err(invalid(format!(
                "{RETENTION_KEY} in settings conflicts with retentionMinutes"
            )));
        }

        if let Some(minutes) = self.spec.retention_minutes
            && minutes < 1
        {
            return Err(invalid(format!(
                "retentionMinutes must be positive, {minutes} given"
            )));
        }

        let placement = &self.spec.placement;

        match placement.strategy {
            PlacementStrategy::Static => {
                if placement.static_rack_assignments.is_some() {
                    return Err(invalid(
                        "staticRackAssignments is not applicable to the static strategy".into(),
                    ));
                }

                let rows = placement
                    .static_assignments
                    .as_deref()
                    .ok_or_else(|| invalid("static placement requires staticAssignments".into()))?;

                if rows.len() != self.spec.partitions as usize {
                    return Err(invalid(format!(
                        "staticAssignments has {} rows for {} partitions",
                        rows.len(),
                        self.spec.partitions
                    )));
                }

                for (partition, row) in rows.iter().enumerate() {
                    if row.len() != self.spec.replication_factor as usize {
                        return Err(invalid(format!(
                            "staticAssignments row {partition} has {} replicas, expected {}",
                            row.len(),
                            self.spec.replication_factor
                        )));
                    }
                }
            }

            PlacementStrategy::StaticInRack => {
                if placement.static_assignments.is_some() {
                    return Err(invalid(
                        "staticAssignments is not applicable to the static-in-rack strategy"
                            .into(),
                    ));
                }

                let racks = placement.static_rack_assignments.as_deref().ok_or_else(|| {
                    invalid("static-in-rack placement requires staticRackAssignments".into())
                })?;

                if racks.len() != self.spec.partitions as usize {
                    return Err(invalid(format!(
                        "staticRackAssignments has {} entries for {} partitions",
                        racks.len(),
                        self.spec.partitions
                    )));
                }
            }

            _ => {
                if placement.static_assignments.is_some() {
                    return Err(invalid(format!(
                        "staticAssignments is not applicable to the {} strategy",
                        placement.strategy
                    )));
                }

                if placement.static_rack_assignments.is_some() {
                    return Err(invalid(format!(
                        "staticRackAssignments is not applicable to the {} strategy",
                        placement.strategy
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Verify that a topic belongs to the cluster it is being applied to,
/// reporting every mismatch in one error.
pub fn check_consistency(meta: &ResourceMeta, cluster: &ClusterConfig) -> Result<()> {
    let mut diffs = Vec::new();

    if meta.cluster != cluster.meta.name {
        diffs.push(format!(
            "cluster {:?} does not match {:?}",
            meta.cluster, cluster.meta.name
        ));
    }

    if meta.region != cluster.meta.region {
        diffs.push(format!(
            "region {:?} does not match {:?}",
            meta.region, cluster.meta.region
        ));
    }

    if meta.environment != cluster.meta.environment {
        diffs.push(format!(
            "environment {:?} does not match {:?}",
            meta.environment, cluster.meta.environment
        ));
    }

    if diffs.is_empty() {
        Ok(())
    } else {
        Err(Error::ClusterMismatch {
            topic: meta.name.clone(),
            diffs: diffs.join("; "),
        })
    }
}

#[derive(Clone, Debug)]
struct VarRep(HashMap<String, String>);

impl Replacer for &VarRep {
    fn replace_append(&mut self, caps: &Captures<'_>, dst: &mut String) {
        if let Some(variable) = caps.name("var")
            && let Some(value) = self.0.get(variable.as_str())
        {
            dst.push_str(value);
        }
    }
}

fn expand_env(contents: &str) -> Result<String> {
    let replacer = VarRep(vars().collect());

    Regex::new(r"\$\{(?<var>[^\}]+)\}")
        .map(|re| re.replace_all(contents, &replacer).into_owned())
        .map_err(Into::into)
}

pub fn load_cluster_file(path: impl AsRef<Path>, expand: bool) -> Result<ClusterConfig> {
    let contents = fs::read_to_string(path)?;

    let contents = if expand {
        expand_env(&contents)?
    } else {
        contents
    };

    serde_yaml::from_str(&contents)
        .inspect(|config| debug!(?config))
        .map_err(Into::into)
}

/// Load every topic spec in a multi-document YAML file, skipping empty
/// documents, expanding `${VAR}` references and validating each spec.
pub fn load_topics_file(path: impl AsRef<Path>) -> Result<Vec<TopicConfig>> {
    fs::read_to_string(path)
        .map_err(Into::into)
        .and_then(|contents| load_topics_str(&contents))
}

pub fn load_topics_str(contents: &str) -> Result<Vec<TopicConfig>> {
    let contents = expand_env(contents)?;
    let mut configs = Vec::new();

    for document in serde_yaml::Deserializer::from_str(&contents) {
        let value = serde_yaml::Value::deserialize(document)?;

        if value.is_null() {
            continue;
        }

        let config = serde_yaml::from_value::<TopicConfig>(value)
            .inspect(|config| debug!(?config))?;
        config.validate()?;

        configs.push(config);
    }

    Ok(configs)
}
