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

//! Seiton Admin
//!
//! The cluster administration contract consumed by the applier, together
//! with the data model it is expressed in: brokers, partition assignments,
//! live topic state, throttle keys and the cluster lock.

use std::{collections::BTreeMap, fmt, result, sync::PoisonError, time::Duration};

use async_trait::async_trait;

pub mod memory;

pub type Result<T, E = Error> = result::Result<T, E>;

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("{feature} is not enabled: {message}")]
    FeatureNotEnabled { feature: String, message: String },

    #[error("lock on {0} has already been released")]
    LockReleased(String),

    #[error("malformed throttled replica entry: {0}")]
    MalformedThrottleEntry(String),

    #[error("message: {0}")]
    Message(String),

    #[error("poison")]
    Poison,

    #[error("topic already exists: {0}")]
    TopicAlreadyExists(String),

    #[error("no such broker: {0}")]
    UnknownBroker(i32),

    #[error("no such partition: {topic}/{partition}")]
    UnknownPartition { topic: String, partition: i32 },

    #[error("no such topic: {0}")]
    UnknownTopic(String),
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_value: PoisonError<T>) -> Self {
        Self::Poison
    }
}

/// topic level retention override
pub const RETENTION_KEY: &str = "retention.ms";

/// broker level replication rate caps, in bytes per second
pub const LEADER_THROTTLED_RATE_KEY: &str = "leader.replication.throttled.rate";
pub const FOLLOWER_THROTTLED_RATE_KEY: &str = "follower.replication.throttled.rate";

/// topic level lists of `partition:broker` pairs subject to the rate caps
pub const LEADER_THROTTLED_REPLICAS_KEY: &str = "leader.replication.throttled.replicas";
pub const FOLLOWER_THROTTLED_REPLICAS_KEY: &str = "follower.replication.throttled.replicas";

/// whether a config key belongs to the replication throttle namespace
pub fn is_throttle_key(name: &str) -> bool {
    matches!(
        name,
        LEADER_THROTTLED_RATE_KEY
            | FOLLOWER_THROTTLED_RATE_KEY
            | LEADER_THROTTLED_REPLICAS_KEY
            | FOLLOWER_THROTTLED_REPLICAS_KEY
    )
}

/// a broker as discovered from cluster metadata, never mutated
/// structurally by the applier
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Broker {
    pub id: i32,
    pub rack: String,
    pub config: BTreeMap<String, String>,
}

impl Broker {
    pub fn new(id: i32, rack: impl Into<String>) -> Self {
        Self {
            id,
            rack: rack.into(),
            config: BTreeMap::new(),
        }
    }

    /// a broker is throttled while either replication rate cap is in place
    pub fn is_throttled(&self) -> bool {
        [LEADER_THROTTLED_RATE_KEY, FOLLOWER_THROTTLED_RATE_KEY]
            .iter()
            .any(|key| self.config.get(*key).is_some_and(|value| !value.is_empty()))
    }
}

/// brokers currently carrying a replication rate cap
pub fn throttled_broker_ids(brokers: &[Broker]) -> Vec<i32> {
    brokers
        .iter()
        .filter(|broker| broker.is_throttled())
        .map(|broker| broker.id)
        .collect()
}

/// an ordered replica list for one partition, position 0 being the
/// preferred leader
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PartitionAssignment {
    pub id: i32,
    pub replicas: Vec<i32>,
}

impl PartitionAssignment {
    pub fn new(id: i32, replicas: impl Into<Vec<i32>>) -> Self {
        Self {
            id,
            replicas: replicas.into(),
        }
    }
}

/// live state of one partition
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PartitionInfo {
    pub id: i32,
    pub leader: i32,
    pub replicas: Vec<i32>,
    pub isr: Vec<i32>,
}

impl PartitionInfo {
    pub fn leader_correct(&self) -> bool {
        self.replicas.first().is_some_and(|preferred| *preferred == self.leader)
    }

    pub fn fully_in_sync(&self) -> bool {
        self.replicas.iter().all(|replica| self.isr.contains(replica))
    }
}

/// live state of one topic as observed from the cluster
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TopicInfo {
    pub name: String,
    pub partitions: Vec<PartitionInfo>,
    pub config: BTreeMap<String, String>,
}

impl TopicInfo {
    pub fn assignments(&self) -> Vec<PartitionAssignment> {
        self.partitions
            .iter()
            .map(|partition| PartitionAssignment::new(partition.id, partition.replicas.clone()))
            .collect()
    }

    /// width of the replica lists; partitions of one topic share it
    pub fn replication_factor(&self) -> usize {
        self.partitions
            .first()
            .map_or(0, |partition| partition.replicas.len())
    }

    pub fn all_leaders_correct(&self) -> bool {
        self.partitions.iter().all(PartitionInfo::leader_correct)
    }

    /// whether either throttled replica list is non-empty
    pub fn is_throttled(&self) -> bool {
        [LEADER_THROTTLED_REPLICAS_KEY, FOLLOWER_THROTTLED_REPLICAS_KEY]
            .iter()
            .any(|key| self.config.get(*key).is_some_and(|value| !value.is_empty()))
    }

    pub fn retention(&self) -> Option<Duration> {
        self.config
            .get(RETENTION_KEY)
            .and_then(|ms| ms.parse().ok())
            .map(Duration::from_millis)
    }
}

/// a topic creation request carrying explicit replica assignments
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NewTopic {
    pub name: String,
    pub assignments: Vec<PartitionAssignment>,
    pub config: BTreeMap<String, String>,
}

/// one config mutation: `Some` sets a value, `None` deletes the key
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConfigEntry {
    pub name: String,
    pub value: Option<String>,
}

impl ConfigEntry {
    pub fn set(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }

    /// clear a value in place, leaving the key present but empty
    pub fn clear(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(String::new()),
        }
    }

    pub fn delete(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
        }
    }
}

/// one `partition:broker` pair of a throttled replica list
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ThrottledReplica {
    pub partition: i32,
    pub broker: i32,
}

impl fmt::Display for ThrottledReplica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.partition, self.broker)
    }
}

pub fn parse_throttled_replicas(value: &str) -> Result<Vec<ThrottledReplica>> {
    value
        .split(',')
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry
                .split_once(':')
                .ok_or_else(|| Error::MalformedThrottleEntry(entry.to_owned()))
                .and_then(|(partition, broker)| {
                    let partition = partition
                        .parse()
                        .map_err(|_| Error::MalformedThrottleEntry(entry.to_owned()))?;
                    let broker = broker
                        .parse()
                        .map_err(|_| Error::MalformedThrottleEntry(entry.to_owned()))?;

                    Ok(ThrottledReplica { partition, broker })
                })
        })
        .collect()
}

pub fn render_throttled_replicas(entries: &[ThrottledReplica]) -> String {
    entries
        .iter()
        .map(ThrottledReplica::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// capability bits of an admin implementation
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Features {
    pub locks: bool,
    pub dynamic_broker_configs: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            locks: true,
            dynamic_broker_configs: true,
        }
    }
}

/// cluster-wide mutual exclusion handle, released on all exit paths
#[async_trait]
pub trait Lock: fmt::Debug + Send + Sync {
    fn path(&self) -> &str;

    async fn release(self: Box<Self>) -> Result<()>;
}

/// The administration contract the applier is written against.
///
/// Production implementations talk to brokers and the metadata store;
/// [`memory::Engine`] provides the same semantics in process. Code paths
/// are gated on [`Features`], never on the implementation type.
#[async_trait]
pub trait Admin: fmt::Debug + Send + Sync {
    /// live state of a named topic; `detailed` includes leader and ISR
    async fn topic(&self, name: &str, detailed: bool) -> Result<TopicInfo>;

    /// live state of the named topics, or of every topic when `names`
    /// is `None`; topics that do not exist are skipped
    async fn topics(&self, names: Option<&[String]>, detailed: bool) -> Result<Vec<TopicInfo>>;

    async fn create_topic(&self, topic: NewTopic) -> Result<()>;

    /// Apply config mutations to a topic, returning the keys actually
    /// written. With `preserve_existing`, keys that already hold a
    /// non-empty value are left untouched.
    async fn update_topic_config(
        &self,
        name: &str,
        entries: &[ConfigEntry],
        preserve_existing: bool,
    ) -> Result<Vec<String>>;

    /// as [`Admin::update_topic_config`], for a broker's dynamic config
    async fn update_broker_config(
        &self,
        id: i32,
        entries: &[ConfigEntry],
        preserve_existing: bool,
    ) -> Result<Vec<String>>;

    /// the named brokers, or every broker when `ids` is `None`
    async fn brokers(&self, ids: Option<&[i32]>) -> Result<Vec<Broker>>;

    /// submit a replica reassignment for existing partitions
    async fn assign_partitions(
        &self,
        name: &str,
        assignments: &[PartitionAssignment],
    ) -> Result<()>;

    /// extend a topic with new partitions and their assignments
    async fn add_partitions(
        &self,
        name: &str,
        new_assignments: &[PartitionAssignment],
    ) -> Result<()>;

    /// trigger preferred leader election for the given partitions
    async fn run_leader_election(&self, name: &str, partitions: &[i32]) -> Result<()>;

    /// block until the lock at `path` is acquired
    async fn acquire_lock(&self, path: &str) -> Result<Box<dyn Lock>>;

    /// whether any holder currently owns the lock at `path`
    async fn lock_held(&self, path: &str) -> Result<bool>;

    fn supported_features(&self) -> Features;
}
