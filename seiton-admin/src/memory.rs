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

//! In process [`Admin`] engine with the same capability bits, lock
//! semantics and throttle key behavior as a real cluster.
//!
//! A submitted reassignment converges instantly, but the previous leader
//! stays in place while it remains a replica, so callers still have to
//! run preferred leader election to finish a migration.

use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{debug, instrument};

use crate::{
    Admin, Broker, ConfigEntry, Error, Features, Lock, NewTopic, PartitionAssignment,
    PartitionInfo, Result, TopicInfo,
};

const ACQUIRE_POLL: Duration = Duration::from_millis(25);

#[derive(Debug, Default)]
struct PartitionState {
    leader: i32,
    replicas: Vec<i32>,
    isr: Vec<i32>,
}

#[derive(Debug, Default)]
struct TopicState {
    partitions: Vec<PartitionState>,
    config: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct BrokerState {
    rack: String,
    config: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct State {
    brokers: BTreeMap<i32, BrokerState>,
    topics: BTreeMap<String, TopicState>,
}

#[derive(Clone, Debug, Default)]
pub struct Engine {
    features: Features,
    state: Arc<Mutex<State>>,
    locks: Arc<Mutex<BTreeMap<String, u64>>>,
    sequence: Arc<AtomicU64>,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    /// six brokers spread over three racks, two per rack
    pub fn sandbox() -> Self {
        (1..=6).fold(Self::new(), |engine, id| {
            engine.broker(id, format!("zone{}", (id + 1) / 2))
        })
    }

    pub fn broker(self, id: i32, rack: impl Into<String>) -> Self {
        {
            let mut state = self.state.lock().unwrap_or_else(|poison| poison.into_inner());

            _ = state.brokers.insert(
                id,
                BrokerState {
                    rack: rack.into(),
                    config: BTreeMap::new(),
                },
            );
        }

        self
    }

    pub fn features(self, features: Features) -> Self {
        Self { features, ..self }
    }

    fn apply_entries(
        config: &mut BTreeMap<String, String>,
        entries: &[ConfigEntry],
        preserve_existing: bool,
    ) -> Vec<String> {
        let mut written = Vec::new();

        for entry in entries {
            match &entry.value {
                None => {
                    if config.remove(&entry.name).is_some() {
                        written.push(entry.name.clone());
                    }
                }

                Some(value) => {
                    if preserve_existing
                        && config.get(&entry.name).is_some_and(|existing| !existing.is_empty())
                    {
                        continue;
                    }

                    _ = config.insert(entry.name.clone(), value.clone());
                    written.push(entry.name.clone());
                }
            }
        }

        written
    }
}

fn topic_info(name: &str, topic: &TopicState) -> TopicInfo {
    TopicInfo {
        name: name.to_owned(),
        partitions: topic
            .partitions
            .iter()
            .enumerate()
            .map(|(id, partition)| PartitionInfo {
                id: id as i32,
                leader: partition.leader,
                replicas: partition.replicas.clone(),
                isr: partition.isr.clone(),
            })
            .collect(),
        config: topic.config.clone(),
    }
}

#[async_trait]
impl Admin for Engine {
    #[instrument(skip_all)]
    async fn topic(&self, name: &str, _detailed: bool) -> Result<TopicInfo> {
        let state = self.state.lock()?;

        state
            .topics
            .get(name)
            .map(|topic| topic_info(name, topic))
            .ok_or_else(|| Error::UnknownTopic(name.to_owned()))
    }

    #[instrument(skip_all)]
    async fn topics(&self, names: Option<&[String]>, _detailed: bool) -> Result<Vec<TopicInfo>> {
        let state = self.state.lock()?;

        Ok(state
            .topics
            .iter()
            .filter(|(name, _)| names.is_none_or(|names| names.contains(name)))
            .map(|(name, topic)| topic_info(name, topic))
            .collect())
    }

    #[instrument(skip_all)]
    async fn create_topic(&self, topic: NewTopic) -> Result<()> {
        let mut state = self.state.lock()?;

        if state.topics.contains_key(&topic.name) {
            return Err(Error::TopicAlreadyExists(topic.name));
        }

        let partitions = topic
            .assignments
            .iter()
            .map(|assignment| {
                assignment
                    .replicas
                    .first()
                    .copied()
                    .ok_or_else(|| {
                        Error::Message(format!("empty replica list for {}", topic.name))
                    })
                    .map(|leader| PartitionState {
                        leader,
                        replicas: assignment.replicas.clone(),
                        isr: assignment.replicas.clone(),
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        _ = state.topics.insert(
            topic.name,
            TopicState {
                partitions,
                config: topic.config,
            },
        );

        Ok(())
    }

    #[instrument(skip_all)]
    async fn update_topic_config(
        &self,
        name: &str,
        entries: &[ConfigEntry],
        preserve_existing: bool,
    ) -> Result<Vec<String>> {
        let mut state = self.state.lock()?;

        let topic = state
            .topics
            .get_mut(name)
            .ok_or_else(|| Error::UnknownTopic(name.to_owned()))?;

        Ok(Self::apply_entries(&mut topic.config, entries, preserve_existing))
    }

    #[instrument(skip_all)]
    async fn update_broker_config(
        &self,
        id: i32,
        entries: &[ConfigEntry],
        preserve_existing: bool,
    ) -> Result<Vec<String>> {
        if !self.features.dynamic_broker_configs {
            return Err(Error::FeatureNotEnabled {
                feature: "dynamic broker configs".into(),
                message: "broker configs are read only for this engine".into(),
            });
        }

        let mut state = self.state.lock()?;

        let broker = state
            .brokers
            .get_mut(&id)
            .ok_or(Error::UnknownBroker(id))?;

        Ok(Self::apply_entries(&mut broker.config, entries, preserve_existing))
    }

    #[instrument(skip_all)]
    async fn brokers(&self, ids: Option<&[i32]>) -> Result<Vec<Broker>> {
        let state = self.state.lock()?;

        match ids {
            None => Ok(state
                .brokers
                .iter()
                .map(|(id, broker)| Broker {
                    id: *id,
                    rack: broker.rack.clone(),
                    config: broker.config.clone(),
                })
                .collect()),

            Some(ids) => ids
                .iter()
                .map(|id| {
                    state
                        .brokers
                        .get(id)
                        .ok_or(Error::UnknownBroker(*id))
                        .map(|broker| Broker {
                            id: *id,
                            rack: broker.rack.clone(),
                            config: broker.config.clone(),
                        })
                })
                .collect(),
        }
    }

    #[instrument(skip_all)]
    async fn assign_partitions(
        &self,
        name: &str,
        assignments: &[PartitionAssignment],
    ) -> Result<()> {
        let mut state = self.state.lock()?;

        let topic = state
            .topics
            .get_mut(name)
            .ok_or_else(|| Error::UnknownTopic(name.to_owned()))?;

        for assignment in assignments {
            let partition = topic
                .partitions
                .get_mut(assignment.id as usize)
                .ok_or_else(|| Error::UnknownPartition {
                    topic: name.to_owned(),
                    partition: assignment.id,
                })?;

            if !assignment.replicas.contains(&partition.leader) {
                partition.leader = assignment.replicas[0];
            }

            partition.replicas = assignment.replicas.clone();
            partition.isr = assignment.replicas.clone();
        }

        Ok(())
    }

    #[instrument(skip_all)]
    async fn add_partitions(
        &self,
        name: &str,
        new_assignments: &[PartitionAssignment],
    ) -> Result<()> {
        let mut state = self.state.lock()?;

        let topic = state
            .topics
            .get_mut(name)
            .ok_or_else(|| Error::UnknownTopic(name.to_owned()))?;

        for assignment in new_assignments {
            if assignment.id as usize != topic.partitions.len() {
                return Err(Error::Message(format!(
                    "partition {} does not extend {name} contiguously",
                    assignment.id
                )));
            }

            topic.partitions.push(PartitionState {
                leader: assignment.replicas[0],
                replicas: assignment.replicas.clone(),
                isr: assignment.replicas.clone(),
            });
        }

        Ok(())
    }

    #[instrument(skip_all)]
    async fn run_leader_election(&self, name: &str, partitions: &[i32]) -> Result<()> {
        let mut state = self.state.lock()?;

        let topic = state
            .topics
            .get_mut(name)
            .ok_or_else(|| Error::UnknownTopic(name.to_owned()))?;

        for id in partitions {
            let partition =
                topic
                    .partitions
                    .get_mut(*id as usize)
                    .ok_or_else(|| Error::UnknownPartition {
                        topic: name.to_owned(),
                        partition: *id,
                    })?;

            partition.leader = partition.replicas[0];
        }

        Ok(())
    }

    #[instrument(skip_all)]
    async fn acquire_lock(&self, path: &str) -> Result<Box<dyn Lock>> {
        let token = self.sequence.fetch_add(1, Ordering::Relaxed);

        loop {
            {
                let mut locks = self.locks.lock()?;

                if !locks.contains_key(path) {
                    _ = locks.insert(path.to_owned(), token);
                    debug!(path, token);

                    return Ok(Box::new(MemoryLock {
                        path: path.to_owned(),
                        token,
                        locks: self.locks.clone(),
                        released: false,
                    }));
                }
            }

            sleep(ACQUIRE_POLL).await;
        }
    }

    #[instrument(skip_all)]
    async fn lock_held(&self, path: &str) -> Result<bool> {
        self.locks.lock().map_err(Into::into).map(|locks| locks.contains_key(path))
    }

    fn supported_features(&self) -> Features {
        self.features
    }
}

#[derive(Debug)]
struct MemoryLock {
    path: String,
    token: u64,
    locks: Arc<Mutex<BTreeMap<String, u64>>>,
    released: bool,
}

impl MemoryLock {
    fn unlock(&mut self) -> Result<()> {
        if self.released {
            return Err(Error::LockReleased(self.path.clone()));
        }

        self.released = true;

        let mut locks = self.locks.lock()?;

        if locks.get(&self.path).copied() == Some(self.token) {
            _ = locks.remove(&self.path);
        }

        Ok(())
    }
}

#[async_trait]
impl Lock for MemoryLock {
    fn path(&self) -> &str {
        &self.path
    }

    async fn release(mut self: Box<Self>) -> Result<()> {
        self.unlock()
    }
}

impl Drop for MemoryLock {
    fn drop(&mut self) {
        if !self.released {
            _ = self.unlock();
        }
    }
}
