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

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use pretty_assertions::assert_eq;
use seiton_admin::{
    Admin, ConfigEntry, FOLLOWER_THROTTLED_RATE_KEY, FOLLOWER_THROTTLED_REPLICAS_KEY, Features,
    LEADER_THROTTLED_RATE_KEY, memory::Engine, throttled_broker_ids,
};
use seiton_apply::{
    Applier, ApplierConfig, ChangeRecord, Error,
    record::{
        ConfigEntryChange, CreateRecord, NewConfigEntry, ReplicaAssignmentChange, UpdateRecord,
        ValueChange,
    },
};
use seiton_config::{
    ClusterConfig, ClusterMeta, ClusterSpec, MigrationConfig, PickerMethod, PlacementConfig,
    PlacementStrategy, ResourceMeta, TopicConfig, TopicSpec,
};

type Result<T, E = Error> = std::result::Result<T, E>;

fn cluster_config() -> ClusterConfig {
    ClusterConfig {
        meta: ClusterMeta {
            name: "test-cluster".into(),
            region: "test-region".into(),
            environment: "test-environment".into(),
        },
        spec: ClusterSpec {
            bootstrap_servers: vec!["localhost:9092".into()],
            lock_path: Some("/seiton/locks".into()),
        },
    }
}

fn topic_config(name: &str, spec: TopicSpec) -> TopicConfig {
    TopicConfig {
        meta: ResourceMeta {
            name: name.into(),
            cluster: "test-cluster".into(),
            region: "test-region".into(),
            environment: "test-environment".into(),
        },
        spec,
    }
}

fn migration() -> Option<MigrationConfig> {
    Some(MigrationConfig {
        throttle_mb: 2,
        partition_batch_size: 3,
    })
}

fn applier(engine: &Engine, topic: TopicConfig) -> Result<Applier> {
    applier_config(engine, ApplierConfig::new(cluster_config(), topic))
}

fn applier_config(engine: &Engine, config: ApplierConfig) -> Result<Applier> {
    Applier::new(
        Arc::new(engine.clone()),
        config
            .skip_confirm(true)
            .sleep_loop_duration(Duration::from_millis(10))
            .retention_drop_step(Duration::from_secs(50 * 60)),
    )
}

fn replicas(info: &seiton_admin::TopicInfo) -> Vec<Vec<i32>> {
    info.partitions
        .iter()
        .map(|partition| partition.replicas.clone())
        .collect()
}

#[tokio::test]
async fn create_then_update_settings() -> Result<()> {
    let engine = Engine::sandbox();

    let applied = applier(
        &engine,
        topic_config(
            "orders",
            TopicSpec {
                partitions: 9,
                replication_factor: 2,
                retention_minutes: Some(500),
                settings: BTreeMap::from([("cleanup.policy".to_owned(), "compact".to_owned())]),
                placement: PlacementConfig::default(),
                migration: migration(),
            },
        ),
    )?;

    assert_eq!(3, applied.max_batch_size());
    assert_eq!(2_000_000, applied.throttle_bytes());

    let changes = applied.apply().await?;

    assert_eq!(
        Some(ChangeRecord::Create(CreateRecord {
            topic: "orders".into(),
            dry_run: false,
            num_partitions: 9,
            replication_factor: 2,
            config_entries: vec![
                NewConfigEntry {
                    name: "cleanup.policy".into(),
                    value: "compact".into(),
                },
                NewConfigEntry {
                    name: "retention.ms".into(),
                    value: "30000000".into(),
                },
            ],
        })),
        changes
    );

    let info = engine.topic("orders", true).await?;
    assert_eq!(9, info.partitions.len());
    assert_eq!(2, info.replication_factor());
    assert_eq!(Some(&"30000000".to_owned()), info.config.get("retention.ms"));
    assert_eq!(Some(&"compact".to_owned()), info.config.get("cleanup.policy"));
    assert!(info.all_leaders_correct());

    // shorten retention, flip the cleanup policy and add a new setting
    let applied = applier(
        &engine,
        topic_config(
            "orders",
            TopicSpec {
                partitions: 9,
                replication_factor: 2,
                retention_minutes: Some(400),
                settings: BTreeMap::from([
                    ("cleanup.policy".to_owned(), "delete".to_owned()),
                    ("max.message.bytes".to_owned(), "600000".to_owned()),
                ]),
                placement: PlacementConfig::default(),
                migration: migration(),
            },
        ),
    )?;

    let changes = applied.apply().await?;

    assert_eq!(
        Some(ChangeRecord::Update(UpdateRecord {
            topic: "orders".into(),
            dry_run: false,
            config_entries: vec![NewConfigEntry {
                name: "max.message.bytes".into(),
                value: "600000".into(),
            }],
            updated_config_entries: vec![
                ConfigEntryChange {
                    name: "cleanup.policy".into(),
                    current: "compact".into(),
                    updated: "delete".into(),
                },
                ConfigEntryChange {
                    name: "retention.ms".into(),
                    current: "30000000".into(),
                    // stepped: only 50 of the 100 minute reduction applies
                    updated: "27000000".into(),
                },
            ],
            ..UpdateRecord::new("orders", false)
        })),
        changes
    );

    let info = engine.topic("orders", true).await?;
    assert_eq!(Some(&"27000000".to_owned()), info.config.get("retention.ms"));
    assert_eq!(Some(&"delete".to_owned()), info.config.get("cleanup.policy"));

    Ok(())
}

#[tokio::test]
async fn replication_factor_change_rejected() -> Result<()> {
    let engine = Engine::sandbox();

    let spec = TopicSpec {
        partitions: 9,
        replication_factor: 2,
        retention_minutes: Some(500),
        settings: BTreeMap::new(),
        placement: PlacementConfig::default(),
        migration: migration(),
    };

    _ = applier(&engine, topic_config("orders", spec.clone()))?
        .apply()
        .await?;

    let applied = applier(
        &engine,
        topic_config(
            "orders",
            TopicSpec {
                replication_factor: 3,
                ..spec
            },
        ),
    )?;

    assert!(matches!(
        applied.apply().await,
        Err(Error::ReplicationFactorChange {
            current: 2,
            requested: 3
        })
    ));

    // nothing was mutated
    let info = engine.topic("orders", true).await?;
    assert_eq!(2, info.replication_factor());
    assert_eq!(9, info.partitions.len());

    Ok(())
}

#[tokio::test]
async fn missing_keys_deleted_only_when_destructive() -> Result<()> {
    let engine = Engine::sandbox();

    let spec = TopicSpec {
        partitions: 3,
        replication_factor: 2,
        retention_minutes: Some(500),
        settings: BTreeMap::from([("cleanup.policy".to_owned(), "delete".to_owned())]),
        placement: PlacementConfig::default(),
        migration: migration(),
    };

    _ = applier(&engine, topic_config("orders", spec.clone()))?
        .apply()
        .await?;

    let without = TopicSpec {
        settings: BTreeMap::new(),
        ..spec
    };

    let changes = applier(&engine, topic_config("orders", without.clone()))?
        .apply()
        .await?;

    let Some(ChangeRecord::Update(record)) = changes else {
        panic!("expected an update record");
    };
    assert_eq!(vec!["cleanup.policy".to_owned()], record.missing_keys);

    let info = engine.topic("orders", false).await?;
    assert_eq!(Some(&"delete".to_owned()), info.config.get("cleanup.policy"));

    // destructive run deletes the stray key
    let destructive = applier_config(
        &engine,
        ApplierConfig::new(cluster_config(), topic_config("orders", without)).destructive(true),
    )?;

    let changes = destructive.apply().await?;

    let Some(ChangeRecord::Update(record)) = changes else {
        panic!("expected an update record");
    };
    assert_eq!(vec!["cleanup.policy".to_owned()], record.missing_keys);

    let info = engine.topic("orders", false).await?;
    assert!(!info.config.contains_key("cleanup.policy"));

    Ok(())
}

#[tokio::test]
async fn second_apply_is_a_noop() -> Result<()> {
    let engine = Engine::sandbox();

    let config = topic_config(
        "orders",
        TopicSpec {
            partitions: 9,
            replication_factor: 2,
            retention_minutes: Some(500),
            settings: BTreeMap::from([("cleanup.policy".to_owned(), "compact".to_owned())]),
            placement: PlacementConfig::default(),
            migration: migration(),
        },
    );

    _ = applier(&engine, config.clone())?.apply().await?;

    let changes = applier(&engine, config)?.apply().await?;
    assert_eq!(None, changes);

    Ok(())
}

#[tokio::test]
async fn placement_updates_follow_strategy_changes() -> Result<()> {
    let engine = Engine::sandbox();

    // initial apply lays partitions out exactly as pinned
    let applied = applier(
        &engine,
        topic_config(
            "orders",
            TopicSpec {
                partitions: 6,
                replication_factor: 2,
                retention_minutes: Some(500),
                settings: BTreeMap::new(),
                placement: PlacementConfig {
                    strategy: PlacementStrategy::Static,
                    static_assignments: Some(vec![
                        vec![1, 2],
                        vec![2, 3],
                        vec![1, 3],
                        vec![1, 2],
                        vec![2, 3],
                        vec![1, 3],
                    ]),
                    ..PlacementConfig::default()
                },
                migration: migration(),
            },
        ),
    )?;

    _ = applied.apply().await?;

    let info = engine.topic("orders", true).await?;
    assert_eq!(
        vec![
            vec![1, 2],
            vec![2, 3],
            vec![1, 3],
            vec![1, 2],
            vec![2, 3],
            vec![1, 3],
        ],
        replicas(&info)
    );
    assert!(info.all_leaders_correct());

    // balanced leaders shuffles leadership off the overloaded brokers
    let balanced = TopicSpec {
        partitions: 6,
        replication_factor: 2,
        retention_minutes: Some(500),
        settings: BTreeMap::new(),
        placement: PlacementConfig {
            strategy: PlacementStrategy::BalancedLeaders,
            ..PlacementConfig::default()
        },
        migration: migration(),
    };

    _ = applier(&engine, topic_config("orders", balanced.clone()))?
        .apply()
        .await?;

    let info = engine.topic("orders", true).await?;
    assert_eq!(
        vec![
            vec![3, 2],
            vec![5, 3],
            vec![4, 3],
            vec![6, 2],
            vec![2, 3],
            vec![1, 3],
        ],
        replicas(&info)
    );
    assert!(info.all_leaders_correct());

    // in-rack pulls every partition into its leader's rack
    let changes = applier(
        &engine,
        topic_config(
            "orders",
            TopicSpec {
                placement: PlacementConfig {
                    strategy: PlacementStrategy::InRack,
                    ..PlacementConfig::default()
                },
                ..balanced
            },
        ),
    )?
    .apply()
    .await?;

    let info = engine.topic("orders", true).await?;
    assert_eq!(
        vec![
            vec![3, 4],
            vec![5, 6],
            vec![4, 3],
            vec![6, 5],
            vec![2, 1],
            vec![1, 2],
        ],
        replicas(&info)
    );
    assert!(info.all_leaders_correct());

    let Some(ChangeRecord::Update(record)) = changes else {
        panic!("expected an update record");
    };

    assert_eq!(
        vec![
            ReplicaAssignmentChange {
                partition: 0,
                current_replicas: vec![3, 2],
                updated_replicas: Some(vec![3, 4]),
            },
            ReplicaAssignmentChange {
                partition: 1,
                current_replicas: vec![5, 3],
                updated_replicas: Some(vec![5, 6]),
            },
            ReplicaAssignmentChange {
                partition: 2,
                current_replicas: vec![4, 3],
                updated_replicas: None,
            },
            ReplicaAssignmentChange {
                partition: 3,
                current_replicas: vec![6, 2],
                updated_replicas: Some(vec![6, 5]),
            },
            ReplicaAssignmentChange {
                partition: 4,
                current_replicas: vec![2, 3],
                updated_replicas: Some(vec![2, 1]),
            },
            ReplicaAssignmentChange {
                partition: 5,
                current_replicas: vec![1, 3],
                updated_replicas: Some(vec![1, 2]),
            },
        ],
        record.replica_assignments
    );

    // throttles applied for the migration are gone at the end of the run
    assert!(throttled_broker_ids(&engine.brokers(None).await?).is_empty());
    assert!(!engine.topic("orders", false).await?.is_throttled());

    Ok(())
}

#[tokio::test]
async fn rebalance_replans_from_scratch() -> Result<()> {
    let engine = Engine::sandbox();

    _ = applier(
        &engine,
        topic_config(
            "orders",
            TopicSpec {
                partitions: 3,
                replication_factor: 2,
                retention_minutes: Some(500),
                settings: BTreeMap::new(),
                placement: PlacementConfig {
                    strategy: PlacementStrategy::Static,
                    static_assignments: Some(vec![vec![1, 2], vec![2, 3], vec![1, 3]]),
                    ..PlacementConfig::default()
                },
                migration: migration(),
            },
        ),
    )?
    .apply()
    .await?;

    let rebalanced = applier_config(
        &engine,
        ApplierConfig::new(
            cluster_config(),
            topic_config(
                "orders",
                TopicSpec {
                    partitions: 3,
                    replication_factor: 2,
                    retention_minutes: Some(500),
                    settings: BTreeMap::new(),
                    placement: PlacementConfig::default(),
                    migration: migration(),
                },
            ),
        )
        .rebalance(true),
    )?;

    _ = rebalanced.apply().await?;

    let info = engine.topic("orders", true).await?;
    assert_ne!(
        vec![vec![1, 2], vec![2, 3], vec![1, 3]],
        replicas(&info)
    );
    assert!(info.all_leaders_correct());

    Ok(())
}

#[tokio::test]
async fn rebalance_with_static_placement_rejected() {
    let engine = Engine::sandbox();

    let outcome = applier_config(
        &engine,
        ApplierConfig::new(
            cluster_config(),
            topic_config(
                "orders",
                TopicSpec {
                    partitions: 1,
                    replication_factor: 2,
                    retention_minutes: Some(500),
                    settings: BTreeMap::new(),
                    placement: PlacementConfig {
                        strategy: PlacementStrategy::Static,
                        static_assignments: Some(vec![vec![1, 2]]),
                        ..PlacementConfig::default()
                    },
                    migration: migration(),
                },
            ),
        )
        .rebalance(true),
    );

    assert!(matches!(
        outcome,
        Err(Error::RebalanceWithStaticPlacement)
    ));
}

#[tokio::test]
async fn partition_extension_appends_untouched() -> Result<()> {
    let engine = Engine::sandbox();

    _ = applier(
        &engine,
        topic_config(
            "orders",
            TopicSpec {
                partitions: 3,
                replication_factor: 2,
                retention_minutes: Some(500),
                settings: BTreeMap::new(),
                placement: PlacementConfig {
                    strategy: PlacementStrategy::Static,
                    static_assignments: Some(vec![vec![1, 2], vec![3, 4], vec![5, 2]]),
                    ..PlacementConfig::default()
                },
                migration: migration(),
            },
        ),
    )?
    .apply()
    .await?;

    let changes = applier(
        &engine,
        topic_config(
            "orders",
            TopicSpec {
                partitions: 6,
                replication_factor: 2,
                retention_minutes: Some(500),
                settings: BTreeMap::new(),
                placement: PlacementConfig {
                    strategy: PlacementStrategy::BalancedLeaders,
                    ..PlacementConfig::default()
                },
                migration: migration(),
            },
        ),
    )?
    .apply()
    .await?;

    let info = engine.topic("orders", true).await?;
    assert_eq!(
        vec![
            vec![1, 2],
            vec![3, 4],
            vec![5, 2],
            vec![2, 6],
            vec![4, 1],
            vec![6, 3],
        ],
        replicas(&info)
    );
    assert!(info.all_leaders_correct());

    let Some(ChangeRecord::Update(record)) = changes else {
        panic!("expected an update record");
    };
    assert_eq!(
        Some(ValueChange {
            current: 3,
            updated: 6
        }),
        record.num_partitions
    );
    assert!(record.replica_assignments.is_empty());

    // pure extension runs unthrottled
    assert!(throttled_broker_ids(&engine.brokers(None).await?).is_empty());
    assert!(!info.is_throttled());

    Ok(())
}

#[tokio::test]
async fn throttle_cleanup_respects_foreign_lock_and_references() -> Result<()> {
    let engine = Engine::sandbox();

    let spec = TopicSpec {
        partitions: 3,
        replication_factor: 2,
        retention_minutes: Some(500),
        settings: BTreeMap::new(),
        placement: PlacementConfig::default(),
        migration: migration(),
    };

    _ = applier(&engine, topic_config("orders", spec.clone()))?
        .apply()
        .await?;
    _ = applier(&engine, topic_config("payments", spec.clone()))?
        .apply()
        .await?;

    // leftovers of an interrupted migration: throttled replica lists on
    // both topics, rate caps on brokers 1 and 2
    _ = engine
        .update_topic_config(
            "orders",
            &[ConfigEntry::set(FOLLOWER_THROTTLED_REPLICAS_KEY, "0:2,0:4")],
            false,
        )
        .await?;
    _ = engine
        .update_topic_config(
            "payments",
            &[ConfigEntry::set(FOLLOWER_THROTTLED_REPLICAS_KEY, "0:1,0:3")],
            false,
        )
        .await?;
    _ = engine
        .update_broker_config(
            1,
            &[ConfigEntry::set(FOLLOWER_THROTTLED_RATE_KEY, "123456")],
            false,
        )
        .await?;
    _ = engine
        .update_broker_config(
            2,
            &[ConfigEntry::set(LEADER_THROTTLED_RATE_KEY, "123456")],
            false,
        )
        .await?;

    // another operator holds the cluster lock
    let lock = engine.acquire_lock("/seiton/locks/test-cluster").await?;

    _ = applier(&engine, topic_config("orders", spec.clone()))?
        .apply()
        .await?;

    // own lists clear even under the lock, broker caps stay
    assert!(!engine.topic("orders", false).await?.is_throttled());
    assert_eq!(
        vec![1, 2],
        throttled_broker_ids(&engine.brokers(None).await?)
    );

    lock.release().await?;

    _ = applier(&engine, topic_config("orders", spec.clone()))?
        .apply()
        .await?;

    // broker 1 is still referenced by the payments list, broker 2 is not
    assert_eq!(
        vec![1],
        throttled_broker_ids(&engine.brokers(None).await?)
    );

    _ = engine
        .update_topic_config(
            "payments",
            &[ConfigEntry::clear(FOLLOWER_THROTTLED_REPLICAS_KEY)],
            false,
        )
        .await?;

    _ = applier(&engine, topic_config("orders", spec))?.apply().await?;

    assert!(throttled_broker_ids(&engine.brokers(None).await?).is_empty());

    Ok(())
}

#[tokio::test]
async fn dry_run_changes_nothing() -> Result<()> {
    let engine = Engine::sandbox();

    let spec = TopicSpec {
        partitions: 9,
        replication_factor: 2,
        retention_minutes: Some(500),
        settings: BTreeMap::new(),
        placement: PlacementConfig::default(),
        migration: migration(),
    };

    let dry = applier_config(
        &engine,
        ApplierConfig::new(cluster_config(), topic_config("orders", spec.clone())).dry_run(true),
    )?;

    let changes = dry.apply().await?;
    let Some(ChangeRecord::Create(record)) = changes else {
        panic!("expected a create record");
    };
    assert!(record.dry_run);

    // not created
    assert!(engine.topics(None, false).await?.is_empty());

    _ = applier(&engine, topic_config("orders", spec.clone()))?
        .apply()
        .await?;

    let before = engine.topic("orders", true).await?;

    // plan retention, extension and placement changes without mutating
    let dry = applier_config(
        &engine,
        ApplierConfig::new(
            cluster_config(),
            topic_config(
                "orders",
                TopicSpec {
                    partitions: 12,
                    retention_minutes: Some(600),
                    placement: PlacementConfig {
                        strategy: PlacementStrategy::InRack,
                        ..PlacementConfig::default()
                    },
                    ..spec
                },
            ),
        )
        .dry_run(true),
    )?;

    let changes = dry.apply().await?;
    let Some(ChangeRecord::Update(record)) = changes else {
        panic!("expected an update record");
    };
    assert!(record.dry_run);
    assert_eq!(
        Some(ValueChange {
            current: 9,
            updated: 12
        }),
        record.num_partitions
    );
    assert!(!record.updated_config_entries.is_empty());
    assert!(!record.replica_assignments.is_empty());

    let after = engine.topic("orders", true).await?;
    assert_eq!(before, after);
    assert!(throttled_broker_ids(&engine.brokers(None).await?).is_empty());

    Ok(())
}

#[tokio::test]
async fn overrides_take_precedence_over_the_spec() -> Result<()> {
    let engine = Engine::sandbox();

    let applied = applier_config(
        &engine,
        ApplierConfig::new(
            cluster_config(),
            topic_config(
                "orders",
                TopicSpec {
                    partitions: 9,
                    replication_factor: 2,
                    retention_minutes: Some(500),
                    settings: BTreeMap::new(),
                    placement: PlacementConfig::default(),
                    migration: migration(),
                },
            ),
        )
        .broker_throttle_mb(50)
        .partition_batch_size(8),
    )?;

    assert_eq!(50_000_000, applied.throttle_bytes());
    assert_eq!(8, applied.max_batch_size());

    Ok(())
}

#[tokio::test]
async fn cluster_mismatch_rejected_before_any_mutation() -> Result<()> {
    let engine = Engine::sandbox();

    let mut config = topic_config(
        "orders",
        TopicSpec {
            partitions: 3,
            replication_factor: 2,
            retention_minutes: Some(500),
            settings: BTreeMap::new(),
            placement: PlacementConfig::default(),
            migration: migration(),
        },
    );
    config.meta.cluster = "other-cluster".into();

    let outcome = applier(&engine, config)?.apply().await;
    assert!(matches!(
        outcome,
        Err(Error::Config(seiton_config::Error::ClusterMismatch { .. }))
    ));

    assert!(engine.topics(None, false).await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn migrations_without_lock_support() -> Result<()> {
    let engine = Engine::sandbox().features(Features {
        locks: false,
        dynamic_broker_configs: true,
    });

    let spec = TopicSpec {
        partitions: 3,
        replication_factor: 2,
        retention_minutes: Some(500),
        settings: BTreeMap::new(),
        placement: PlacementConfig {
            strategy: PlacementStrategy::Static,
            static_assignments: Some(vec![vec![1, 2], vec![2, 3], vec![1, 3]]),
            ..PlacementConfig::default()
        },
        migration: migration(),
    };

    _ = applier(&engine, topic_config("orders", spec))?.apply().await?;

    _ = applier(
        &engine,
        topic_config(
            "orders",
            TopicSpec {
                partitions: 3,
                replication_factor: 2,
                retention_minutes: Some(500),
                settings: BTreeMap::new(),
                placement: PlacementConfig {
                    strategy: PlacementStrategy::InRack,
                    ..PlacementConfig::default()
                },
                migration: migration(),
            },
        ),
    )?
    .apply()
    .await?;

    let info = engine.topic("orders", true).await?;
    assert!(info.all_leaders_correct());
    assert!(!engine.lock_held("/seiton/locks/test-cluster").await?);

    Ok(())
}

#[tokio::test]
async fn randomized_picker_matches_its_dry_run() -> Result<()> {
    let engine = Engine::sandbox();

    let spec = TopicSpec {
        partitions: 6,
        replication_factor: 2,
        retention_minutes: Some(500),
        settings: BTreeMap::new(),
        placement: PlacementConfig {
            picker: PickerMethod::Randomized,
            ..PlacementConfig::default()
        },
        migration: migration(),
    };

    let dry = applier_config(
        &engine,
        ApplierConfig::new(cluster_config(), topic_config("orders", spec.clone())).dry_run(true),
    )?;

    let Some(ChangeRecord::Create(planned)) = dry.apply().await? else {
        panic!("expected a create record");
    };

    _ = applier(&engine, topic_config("orders", spec.clone()))?
        .apply()
        .await?;

    // a second run against the live topic sees nothing to move: the
    // apply made the same choices the dry run planned
    assert!(planned.dry_run);
    let changes = applier(&engine, topic_config("orders", spec))?.apply().await?;
    assert_eq!(None, changes);

    Ok(())
}
