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

//! Seiton Apply
//!
//! The reconciliation engine: one [`Applier::apply`] run diffs a desired
//! topic spec against the live cluster and converges it through create,
//! settings update, partition extension, replica reassignment and leader
//! rebalance phases, under cluster locking with replication throttles
//! around migrations. Runs are idempotent; a dry run plans everything
//! and mutates nothing.

use std::{io, result, sync::Arc, time::Duration};

use seiton_admin::{Admin, ConfigEntry, Lock, NewTopic, PartitionAssignment, TopicInfo};
use seiton_config::TopicConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

pub mod placement;
pub mod record;

mod migrate;
mod settings;
mod throttle;

use migrate::Migration;
use placement::Planner;
pub use record::ChangeRecord;
use record::{CreateRecord, NewConfigEntry, ReplicaAssignmentChange, UpdateRecord, ValueChange};

pub type Result<T, E = Error> = result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("admin: {0}")]
    Admin(#[from] seiton_admin::Error),

    #[error("config: {0}")]
    Config(#[from] seiton_config::Error),

    #[error("migration of {topic} interrupted before convergence")]
    ConvergenceTimeout { topic: String },

    #[error("broker {broker} listed more than once for partition {partition}")]
    DuplicateReplica { partition: i32, broker: i32 },

    #[error("replication factor {required} exceeds the {available} available brokers")]
    InsufficientBrokers { required: usize, available: usize },

    #[error("io: {0}")]
    Io(Arc<io::Error>),

    #[error("could not acquire the cluster lock: {0}")]
    Lock(seiton_admin::Error),

    #[error("no rack has {required} brokers")]
    NoRackWithCapacity { required: usize },

    #[error("declined: {0}")]
    NotConfirmed(String),

    #[error("partition count cannot be reduced from {current} to {requested}")]
    PartitionCountReduction { current: usize, requested: usize },

    #[error("rack {rack} has {available} brokers, partition {partition} needs {required}")]
    RackTooSmall {
        partition: i32,
        rack: String,
        required: usize,
        available: usize,
    },

    #[error("a rebalance cannot be combined with static placement")]
    RebalanceWithStaticPlacement,

    #[error("replication factor change from {current} to {requested} is not supported")]
    ReplicationFactorChange { current: usize, requested: usize },

    #[error("static assignments cover {provided} partitions, expected {expected}")]
    StaticAssignmentCount { expected: usize, provided: usize },

    #[error("static assignment for partition {partition} has {provided} replicas, expected {expected}")]
    StaticAssignmentWidth {
        partition: i32,
        expected: usize,
        provided: usize,
    },

    #[error("static rack assignments cover {provided} partitions, expected {expected}")]
    StaticRackCount { expected: usize, provided: usize },

    #[error("unknown broker {broker} for partition {partition}")]
    UnknownBroker { partition: i32, broker: i32 },

    #[error("unknown rack {rack} for partition {partition}")]
    UnknownRack { partition: i32, rack: String },
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

/// replication throttle when neither an override nor the spec names one,
/// in megabytes per second
pub const DEFAULT_THROTTLE_MB: i64 = 120;

pub const DEFAULT_PARTITION_BATCH_SIZE: usize = 10;

pub const DEFAULT_SLEEP_LOOP_DURATION: Duration = Duration::from_secs(10);

/// Gate called before each mutation phase unless `skip_confirm` is set.
pub trait Confirm: std::fmt::Debug + Send + Sync {
    fn confirm(&self, prompt: &str) -> io::Result<bool>;
}

/// prompts the operator on the terminal
#[derive(Clone, Copy, Debug, Default)]
pub struct Terminal;

impl Confirm for Terminal {
    fn confirm(&self, prompt: &str) -> io::Result<bool> {
        use io::Write as _;

        print!("{prompt}? (y/n) ");
        io::stdout().flush()?;

        let mut response = String::new();
        _ = io::stdin().read_line(&mut response)?;

        Ok(matches!(
            response.trim().to_lowercase().as_str(),
            "y" | "yes"
        ))
    }
}

/// answers yes unattended
#[derive(Clone, Copy, Debug, Default)]
pub struct Assent;

impl Confirm for Assent {
    fn confirm(&self, _prompt: &str) -> io::Result<bool> {
        Ok(true)
    }
}

#[derive(Clone, Debug)]
pub struct ApplierConfig {
    pub cluster: seiton_config::ClusterConfig,
    pub topic: TopicConfig,
    pub dry_run: bool,
    pub destructive: bool,
    pub rebalance: bool,
    pub skip_confirm: bool,
    pub sleep_loop_duration: Duration,
    pub retention_drop_step: Duration,
    pub broker_throttle_mb_override: Option<i64>,
    pub partition_batch_size_override: Option<usize>,
}

impl ApplierConfig {
    pub fn new(cluster: seiton_config::ClusterConfig, topic: TopicConfig) -> Self {
        Self {
            cluster,
            topic,
            dry_run: false,
            destructive: false,
            rebalance: false,
            skip_confirm: false,
            sleep_loop_duration: DEFAULT_SLEEP_LOOP_DURATION,
            retention_drop_step: Duration::ZERO,
            broker_throttle_mb_override: None,
            partition_batch_size_override: None,
        }
    }

    pub fn dry_run(self, dry_run: bool) -> Self {
        Self { dry_run, ..self }
    }

    pub fn destructive(self, destructive: bool) -> Self {
        Self {
            destructive,
            ..self
        }
    }

    pub fn rebalance(self, rebalance: bool) -> Self {
        Self { rebalance, ..self }
    }

    pub fn skip_confirm(self, skip_confirm: bool) -> Self {
        Self {
            skip_confirm,
            ..self
        }
    }

    pub fn sleep_loop_duration(self, sleep_loop_duration: Duration) -> Self {
        Self {
            sleep_loop_duration,
            ..self
        }
    }

    pub fn retention_drop_step(self, retention_drop_step: Duration) -> Self {
        Self {
            retention_drop_step,
            ..self
        }
    }

    pub fn broker_throttle_mb(self, throttle_mb: i64) -> Self {
        Self {
            broker_throttle_mb_override: Some(throttle_mb),
            ..self
        }
    }

    pub fn partition_batch_size(self, partition_batch_size: usize) -> Self {
        Self {
            partition_batch_size_override: Some(partition_batch_size),
            ..self
        }
    }
}

#[derive(Debug)]
pub struct Applier {
    admin: Arc<dyn Admin>,
    config: ApplierConfig,
    throttle_bytes: i64,
    max_batch_size: usize,
    confirm: Box<dyn Confirm>,
    cancellation: CancellationToken,
}

impl Applier {
    pub fn new(admin: Arc<dyn Admin>, config: ApplierConfig) -> Result<Self> {
        config.topic.validate()?;

        if config.rebalance && config.topic.spec.placement.is_static() {
            return Err(Error::RebalanceWithStaticPlacement);
        }

        let migration = config.topic.spec.migration;

        let throttle_bytes = config
            .broker_throttle_mb_override
            .or(migration.map(|migration| migration.throttle_mb))
            .unwrap_or(DEFAULT_THROTTLE_MB)
            * 1_000_000;

        let max_batch_size = config
            .partition_batch_size_override
            .or(migration.map(|migration| migration.partition_batch_size))
            .unwrap_or(DEFAULT_PARTITION_BATCH_SIZE)
            .max(1);

        Ok(Self {
            admin,
            config,
            throttle_bytes,
            max_batch_size,
            confirm: Box::new(Terminal),
            cancellation: CancellationToken::new(),
        })
    }

    pub fn confirm(self, confirm: Box<dyn Confirm>) -> Self {
        Self { confirm, ..self }
    }

    pub fn cancellation(self, cancellation: CancellationToken) -> Self {
        Self {
            cancellation,
            ..self
        }
    }

    /// bytes per second written to throttled brokers during migrations
    pub fn throttle_bytes(&self) -> i64 {
        self.throttle_bytes
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// One reconciliation run. Returns what changed, or `None` when the
    /// cluster already matched the spec.
    #[instrument(skip_all, fields(topic = %self.config.topic.meta.name))]
    pub async fn apply(&self) -> Result<Option<ChangeRecord>> {
        seiton_config::check_consistency(&self.config.topic.meta, &self.config.cluster)?;

        let name = self.config.topic.meta.name.clone();

        match self.admin.topic(&name, true).await {
            Ok(live) => self.update(live).await,
            Err(seiton_admin::Error::UnknownTopic(_)) => self.create().await,
            Err(error) => Err(error.into()),
        }
    }

    async fn create(&self) -> Result<Option<ChangeRecord>> {
        let name = &self.config.topic.meta.name;
        let spec = &self.config.topic.spec;

        let brokers = self.admin.brokers(None).await?;
        let planner = Planner::new(
            name,
            &brokers,
            spec.replication_factor as usize,
            &spec.placement,
        );

        let assignments = planner.plan(&[], spec.partitions as usize, false)?;
        let config = settings::desired_settings(spec, None, self.config.retention_drop_step);

        let record = CreateRecord {
            topic: name.clone(),
            dry_run: self.config.dry_run,
            num_partitions: spec.partitions,
            replication_factor: spec.replication_factor,
            config_entries: config
                .iter()
                .map(|(name, value)| NewConfigEntry {
                    name: name.clone(),
                    value: value.clone(),
                })
                .collect(),
        };

        if !self.config.dry_run {
            self.confirmed(&format!(
                "create topic {name} with {} partitions",
                spec.partitions
            ))?;

            self.admin
                .create_topic(NewTopic {
                    name: name.clone(),
                    assignments,
                    config,
                })
                .await?;

            info!(topic = %name, "created");

            self.cleanup_throttles().await?;
        }

        Ok(Some(ChangeRecord::Create(record)))
    }

    async fn update(&self, live: TopicInfo) -> Result<Option<ChangeRecord>> {
        let name = &self.config.topic.meta.name;
        let spec = &self.config.topic.spec;

        let replication_factor = live.replication_factor();

        if spec.replication_factor as usize != replication_factor {
            return Err(Error::ReplicationFactorChange {
                current: replication_factor,
                requested: spec.replication_factor as usize,
            });
        }

        let current_partitions = live.partitions.len();
        let desired_partitions = spec.partitions as usize;

        if desired_partitions < current_partitions {
            return Err(Error::PartitionCountReduction {
                current: current_partitions,
                requested: desired_partitions,
            });
        }

        let mut record = UpdateRecord::new(name.clone(), self.config.dry_run);

        self.update_settings(&live, &mut record).await?;

        let brokers = self.admin.brokers(None).await?;
        let planner = Planner::new(name, &brokers, replication_factor, &spec.placement);

        let current = live.assignments();
        let mut base = current.clone();

        if desired_partitions > current_partitions {
            let extended = planner.plan(&current, desired_partitions, false)?;
            let fresh = extended[current_partitions..].to_vec();

            record.num_partitions = Some(ValueChange {
                current: current_partitions as i32,
                updated: desired_partitions as i32,
            });

            if !self.config.dry_run {
                self.confirmed(&format!(
                    "extend {name} from {current_partitions} to {desired_partitions} partitions"
                ))?;

                self.admin.add_partitions(name, &fresh).await?;
                self.migration().await_convergence(&fresh).await?;

                info!(topic = %name, partitions = desired_partitions, "extended");
            }

            // existing rows stay exactly as they are live: any repair the
            // strategy wants on them belongs to the reassignment phase
            base.extend(fresh);
        }

        let target = planner.plan(&base, desired_partitions, self.config.rebalance)?;

        let moved: Vec<PartitionAssignment> = base
            .iter()
            .zip(&target)
            .filter(|(current, target)| current.replicas != target.replicas)
            .map(|(_, target)| target.clone())
            .collect();

        let mut migrated = false;

        if !moved.is_empty() {
            record.replica_assignments = base
                .iter()
                .zip(&target)
                .map(|(current, target)| ReplicaAssignmentChange {
                    partition: current.id,
                    current_replicas: current.replicas.clone(),
                    updated_replicas: (current.replicas != target.replicas)
                        .then(|| target.replicas.clone()),
                })
                .collect();

            if !self.config.dry_run {
                self.confirmed(&format!(
                    "reassign {} of {desired_partitions} partitions of {name}",
                    moved.len()
                ))?;

                self.reassign(&base, &moved).await?;
                migrated = true;
            }
        }

        if !self.config.dry_run {
            self.rebalance_leaders().await?;

            if !migrated {
                self.cleanup_throttles().await?;
            }
        }

        Ok((!record.is_empty()).then_some(ChangeRecord::Update(record)))
    }

    async fn update_settings(&self, live: &TopicInfo, record: &mut UpdateRecord) -> Result<()> {
        let name = &self.config.topic.meta.name;

        let desired = settings::desired_settings(
            &self.config.topic.spec,
            Some(live),
            self.config.retention_drop_step,
        );

        let changes = settings::diff(&desired, &live.config);
        debug!(topic = %name, ?changes);

        record.config_entries = changes.new_entries.clone();
        record.updated_config_entries = changes.updated_entries.clone();
        record.missing_keys = changes.missing_keys.clone();

        if self.config.dry_run {
            return Ok(());
        }

        let entries: Vec<ConfigEntry> = changes
            .new_entries
            .iter()
            .map(|entry| ConfigEntry::set(&entry.name, &entry.value))
            .chain(
                changes
                    .updated_entries
                    .iter()
                    .map(|entry| ConfigEntry::set(&entry.name, &entry.updated)),
            )
            .collect();

        if !entries.is_empty() {
            self.confirmed(&format!("update {} settings of {name}", entries.len()))?;

            _ = self.admin.update_topic_config(name, &entries, false).await?;
        }

        if self.config.destructive && !changes.missing_keys.is_empty() {
            self.confirmed(&format!(
                "delete {:?} from {name}",
                changes.missing_keys
            ))?;

            let deletions: Vec<ConfigEntry> = changes
                .missing_keys
                .iter()
                .map(ConfigEntry::delete)
                .collect();

            _ = self
                .admin
                .update_topic_config(name, &deletions, false)
                .await?;
        }

        Ok(())
    }

    /// reassignment proper: the only phase run under the cluster lock
    async fn reassign(
        &self,
        base: &[PartitionAssignment],
        moved: &[PartitionAssignment],
    ) -> Result<()> {
        let lock = self.acquire_cluster_lock().await?;

        let outcome = self.reassign_locked(base, moved).await;

        let released = match lock {
            Some(lock) => lock.release().await.map_err(Error::Admin),
            None => Ok(()),
        };

        outcome.and(released)
    }

    async fn reassign_locked(
        &self,
        base: &[PartitionAssignment],
        moved: &[PartitionAssignment],
    ) -> Result<()> {
        let name = &self.config.topic.meta.name;
        let features = self.admin.supported_features();

        if let Some(plan) = throttle::plan(Some(base), moved, false) {
            info!(topic = %name, brokers = ?plan.brokers, "throttling migration");

            throttle::apply(
                self.admin.as_ref(),
                name,
                &plan,
                self.throttle_bytes,
                features,
            )
            .await?;
        }

        self.migration().run(moved).await?;

        // failure above leaves throttles for the next successful run
        throttle::remove(self.admin.as_ref(), name, features, false).await
    }

    /// preferred leader election for partitions drifted off replica[0]
    async fn rebalance_leaders(&self) -> Result<()> {
        let name = &self.config.topic.meta.name;

        let live = self.admin.topic(name, true).await?;

        if live.all_leaders_correct() {
            return Ok(());
        }

        self.confirmed(&format!("run leader elections for {name}"))?;

        self.migration().await_convergence(&live.assignments()).await
    }

    async fn cleanup_throttles(&self) -> Result<()> {
        let name = &self.config.topic.meta.name;
        let features = self.admin.supported_features();

        let foreign = if features.locks
            && let Some(path) = self.lock_path()
        {
            self.admin.lock_held(&path).await?
        } else {
            false
        };

        throttle::remove(self.admin.as_ref(), name, features, foreign).await
    }

    async fn acquire_cluster_lock(&self) -> Result<Option<Box<dyn Lock>>> {
        if !self.admin.supported_features().locks {
            return Ok(None);
        }

        let Some(path) = self.lock_path() else {
            return Ok(None);
        };

        debug!(path);

        tokio::select! {
            () = self.cancellation.cancelled() => {
                Err(Error::Lock(seiton_admin::Error::Message(format!(
                    "cancelled waiting for {path}"
                ))))
            }

            outcome = self.admin.acquire_lock(&path) => {
                outcome.map(Some).map_err(Error::Lock)
            }
        }
    }

    fn lock_path(&self) -> Option<String> {
        self.config.cluster.spec.lock_path.as_ref().map(|base| {
            format!(
                "{}/{}",
                base.trim_end_matches('/'),
                self.config.cluster.meta.name
            )
        })
    }

    fn migration(&self) -> Migration<'_> {
        Migration::new(
            self.admin.as_ref(),
            &self.config.topic.meta.name,
            self.max_batch_size,
            self.config.sleep_loop_duration,
            self.cancellation.clone(),
        )
    }

    fn confirmed(&self, action: &str) -> Result<()> {
        if self.config.skip_confirm {
            return Ok(());
        }

        if self.confirm.confirm(action)? {
            Ok(())
        } else {
            Err(Error::NotConfirmed(action.to_owned()))
        }
    }
}
