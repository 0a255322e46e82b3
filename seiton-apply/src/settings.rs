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

//! Topic settings reconciliation.
//!
//! The desired settings are the spec's map plus `retention.ms` derived
//! from the retention in minutes. A retention reduction is stepped: no
//! single run shortens it by more than the configured step, successive
//! runs converge on the target.

use std::{collections::BTreeMap, time::Duration};

use seiton_admin::{RETENTION_KEY, TopicInfo, is_throttle_key};
use seiton_config::TopicSpec;

use crate::record::{ConfigEntryChange, NewConfigEntry};

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct SettingsDiff {
    pub(crate) new_entries: Vec<NewConfigEntry>,
    pub(crate) updated_entries: Vec<ConfigEntryChange>,
    pub(crate) missing_keys: Vec<String>,
}

impl SettingsDiff {
    pub(crate) fn is_empty(&self) -> bool {
        self.new_entries.is_empty()
            && self.updated_entries.is_empty()
            && self.missing_keys.is_empty()
    }
}

/// the settings an apply run should write, with the retention step
/// already taken against the live value
pub(crate) fn desired_settings(
    spec: &TopicSpec,
    live: Option<&TopicInfo>,
    step: Duration,
) -> BTreeMap<String, String> {
    let mut desired = spec.settings.clone();

    if let Some(target) = spec.retention_ms() {
        let current = live
            .and_then(|info| info.config.get(RETENTION_KEY))
            .and_then(|ms| ms.parse().ok());

        _ = desired.insert(
            RETENTION_KEY.to_owned(),
            stepped_retention(current, target, step).to_string(),
        );
    }

    desired
}

pub(crate) fn stepped_retention(current: Option<i64>, desired: i64, step: Duration) -> i64 {
    let step = step.as_millis() as i64;

    match current {
        Some(current) if step > 0 && desired < current && current - desired > step => {
            current - step
        }

        _ => desired,
    }
}

/// Diff desired against live settings. Keys only the cluster knows about
/// are reported, never silently adopted; the throttle namespace belongs
/// to migrations and is left out entirely.
pub(crate) fn diff(
    desired: &BTreeMap<String, String>,
    live: &BTreeMap<String, String>,
) -> SettingsDiff {
    let mut changes = SettingsDiff::default();

    for (name, value) in desired {
        match live.get(name) {
            None => changes.new_entries.push(NewConfigEntry {
                name: name.clone(),
                value: value.clone(),
            }),

            Some(current) if current != value => changes.updated_entries.push(ConfigEntryChange {
                name: name.clone(),
                current: current.clone(),
                updated: value.clone(),
            }),

            Some(_) => {}
        }
    }

    changes.missing_keys = live
        .iter()
        .filter(|(name, value)| {
            !desired.contains_key(*name) && !value.is_empty() && !is_throttle_key(name.as_str())
        })
        .map(|(name, _)| name.clone())
        .collect();

    changes
}
