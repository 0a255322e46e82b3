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

//! What an apply run changed, or would change under dry run, projected
//! to JSON with stable lowerCamelCase field names.

use serde::{Deserialize, Serialize};

/// Outcome of one apply run; the `action` field discriminates the two
/// shapes in the JSON projection.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ChangeRecord {
    Create(CreateRecord),
    Update(UpdateRecord),
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRecord {
    pub topic: String,

    pub dry_run: bool,

    pub num_partitions: i32,

    pub replication_factor: i32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config_entries: Vec<NewConfigEntry>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRecord {
    pub topic: String,

    pub dry_run: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_partitions: Option<ValueChange>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config_entries: Vec<NewConfigEntry>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub updated_config_entries: Vec<ConfigEntryChange>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replica_assignments: Vec<ReplicaAssignmentChange>,

    #[serde(default)]
    pub missing_keys: Vec<String>,
}

impl UpdateRecord {
    pub fn new(topic: impl Into<String>, dry_run: bool) -> Self {
        Self {
            topic: topic.into(),
            dry_run,
            ..Self::default()
        }
    }

    /// an empty record means the run was a no-op
    pub fn is_empty(&self) -> bool {
        self.num_partitions.is_none()
            && self.config_entries.is_empty()
            && self.updated_config_entries.is_empty()
            && self.replica_assignments.is_empty()
            && self.missing_keys.is_empty()
    }
}

/// an integer value before and after the run
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueChange {
    pub current: i32,
    pub updated: i32,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewConfigEntry {
    pub name: String,
    pub value: String,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigEntryChange {
    pub name: String,
    pub current: String,
    pub updated: String,
}

/// `updated_replicas` is absent for partitions left in place by the run
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaAssignmentChange {
    pub partition: i32,

    pub current_replicas: Vec<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_replicas: Option<Vec<i32>>,
}
