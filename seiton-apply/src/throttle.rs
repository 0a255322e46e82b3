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

//! Replication throttles around a migration.
//!
//! Broker rate keys are a namespace shared with every other in-flight
//! migration: values already present are preserved on application, and
//! removal is a reference count driven by the throttled replica lists
//! remaining on topics across the cluster.

use std::collections::BTreeSet;

use seiton_admin::{
    Admin, ConfigEntry, FOLLOWER_THROTTLED_RATE_KEY, FOLLOWER_THROTTLED_REPLICAS_KEY, Features,
    LEADER_THROTTLED_RATE_KEY, LEADER_THROTTLED_REPLICAS_KEY, PartitionAssignment,
    ThrottledReplica, parse_throttled_replicas, render_throttled_replicas,
};
use tracing::debug;

use crate::Result;

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct ThrottlePlan {
    /// `partition:broker` pairs on the sending side of a move
    pub(crate) leader_replicas: Vec<ThrottledReplica>,

    /// `partition:broker` pairs receiving a new replica
    pub(crate) follower_replicas: Vec<ThrottledReplica>,

    /// brokers whose replication rates are capped for the migration
    pub(crate) brokers: BTreeSet<i32>,
}

/// Decide whether a migration needs throttling. Creation, pure partition
/// extension and leader-only reordering all proceed unthrottled.
pub(crate) fn plan(
    current: Option<&[PartitionAssignment]>,
    target: &[PartitionAssignment],
    new_partitions: bool,
) -> Option<ThrottlePlan> {
    let current = current?;

    if new_partitions {
        return None;
    }

    let mut plan = ThrottlePlan::default();

    for assignment in target {
        let Some(existing) = current.iter().find(|existing| existing.id == assignment.id)
        else {
            continue;
        };

        if existing.replicas == assignment.replicas {
            continue;
        }

        let mut from = existing.replicas.clone();
        let mut to = assignment.replicas.clone();
        from.sort_unstable();
        to.sort_unstable();

        if from == to {
            // same replicas in a different order, an election will do
            continue;
        }

        for broker in &existing.replicas {
            plan.leader_replicas.push(ThrottledReplica {
                partition: assignment.id,
                broker: *broker,
            });

            _ = plan.brokers.insert(*broker);
        }

        for broker in assignment
            .replicas
            .iter()
            .filter(|broker| !existing.replicas.contains(broker))
        {
            plan.follower_replicas.push(ThrottledReplica {
                partition: assignment.id,
                broker: *broker,
            });

            _ = plan.brokers.insert(*broker);
        }
    }

    (!plan.brokers.is_empty()).then_some(plan)
}

/// Write the topic's throttled replica lists and cap the replication
/// rate of every involved broker, preserving caps another migration has
/// already put in place.
pub(crate) async fn apply(
    admin: &dyn Admin,
    topic: &str,
    plan: &ThrottlePlan,
    throttle_bytes: i64,
    features: Features,
) -> Result<()> {
    let written = admin
        .update_topic_config(
            topic,
            &[
                ConfigEntry::set(
                    LEADER_THROTTLED_REPLICAS_KEY,
                    render_throttled_replicas(&plan.leader_replicas),
                ),
                ConfigEntry::set(
                    FOLLOWER_THROTTLED_REPLICAS_KEY,
                    render_throttled_replicas(&plan.follower_replicas),
                ),
            ],
            false,
        )
        .await?;

    debug!(topic, ?written);

    if !features.dynamic_broker_configs {
        return Ok(());
    }

    let rate = throttle_bytes.to_string();

    for broker in &plan.brokers {
        let written = admin
            .update_broker_config(
                *broker,
                &[
                    ConfigEntry::set(LEADER_THROTTLED_RATE_KEY, rate.clone()),
                    ConfigEntry::set(FOLLOWER_THROTTLED_RATE_KEY, rate.clone()),
                ],
                true,
            )
            .await?;

        debug!(broker, ?written);
    }

    Ok(())
}

/// Clear the topic's own throttle lists, then sweep broker rate caps no
/// remaining throttled replica list refers to. A foreign lock means
/// another migration may depend on the caps, so the sweep is skipped.
pub(crate) async fn remove(
    admin: &dyn Admin,
    topic: &str,
    features: Features,
    foreign_lock: bool,
) -> Result<()> {
    let info = admin.topic(topic, false).await?;

    let entries: Vec<ConfigEntry> = [LEADER_THROTTLED_REPLICAS_KEY, FOLLOWER_THROTTLED_REPLICAS_KEY]
        .iter()
        .filter(|key| info.config.get(**key).is_some_and(|value| !value.is_empty()))
        .map(|key| ConfigEntry::clear(*key))
        .collect();

    if !entries.is_empty() {
        _ = admin.update_topic_config(topic, &entries, false).await?;
    }

    if !features.dynamic_broker_configs {
        return Ok(());
    }

    if foreign_lock {
        debug!(topic, "foreign lock held, keeping broker throttles");
        return Ok(());
    }

    let mut referenced = BTreeSet::new();

    for info in admin.topics(None, false).await? {
        for key in [LEADER_THROTTLED_REPLICAS_KEY, FOLLOWER_THROTTLED_REPLICAS_KEY] {
            if let Some(value) = info.config.get(key) {
                referenced.extend(
                    parse_throttled_replicas(value)?
                        .iter()
                        .map(|entry| entry.broker),
                );
            }
        }
    }

    for broker in admin.brokers(None).await? {
        if referenced.contains(&broker.id) {
            continue;
        }

        let entries: Vec<ConfigEntry> = [LEADER_THROTTLED_RATE_KEY, FOLLOWER_THROTTLED_RATE_KEY]
            .iter()
            .filter(|key| {
                broker
                    .config
                    .get(**key)
                    .is_some_and(|value| !value.is_empty())
            })
            .map(|key| ConfigEntry::clear(*key))
            .collect();

        if !entries.is_empty() {
            _ = admin.update_broker_config(broker.id, &entries, false).await?;
            debug!(broker = broker.id, "throttle removed");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use pretty_assertions::assert_eq;
    use seiton_admin::{NewTopic, memory::Engine};

    use super::*;

    fn rows(rows: &[&[i32]]) -> Vec<PartitionAssignment> {
        rows.iter()
            .enumerate()
            .map(|(id, row)| PartitionAssignment::new(id as i32, row.to_vec()))
            .collect()
    }

    #[test]
    fn creation_is_unthrottled() {
        assert_eq!(None, plan(None, &rows(&[&[1, 2], &[3, 4]]), false));
    }

    #[test]
    fn extension_is_unthrottled() {
        assert_eq!(
            None,
            plan(
                Some(&rows(&[&[1, 2]])),
                &rows(&[&[3, 2], &[2, 1]]),
                true
            )
        );
    }

    #[test]
    fn reorder_only_is_unthrottled() {
        assert_eq!(
            None,
            plan(
                Some(&rows(&[&[1, 2, 3], &[4, 5, 6]])),
                &rows(&[&[3, 2, 1], &[5, 4, 6]]),
                false
            )
        );
    }

    #[test]
    fn moves_throttle_sources_and_destinations() {
        let current = rows(&[&[1, 2, 3]]);
        let target = rows(&[&[2, 4, 5]]);

        let plan = plan(Some(&current), &target, false).expect("a throttled migration");

        assert_eq!(
            vec![
                ThrottledReplica {
                    partition: 0,
                    broker: 1
                },
                ThrottledReplica {
                    partition: 0,
                    broker: 2
                },
                ThrottledReplica {
                    partition: 0,
                    broker: 3
                },
            ],
            plan.leader_replicas
        );

        assert_eq!(
            vec![
                ThrottledReplica {
                    partition: 0,
                    broker: 4
                },
                ThrottledReplica {
                    partition: 0,
                    broker: 5
                },
            ],
            plan.follower_replicas
        );

        assert_eq!(BTreeSet::from([1, 2, 3, 4, 5]), plan.brokers);
    }

    #[test]
    fn mixed_reorders_and_moves_only_list_the_moves() {
        let current = rows(&[&[1, 2], &[3, 4]]);
        let target = rows(&[&[2, 1], &[3, 5]]);

        let plan = plan(Some(&current), &target, false).expect("a throttled migration");

        assert!(
            plan.leader_replicas
                .iter()
                .chain(plan.follower_replicas.iter())
                .all(|entry| entry.partition == 1)
        );

        assert_eq!(BTreeSet::from([3, 4, 5]), plan.brokers);
    }

    async fn throttled_engine() -> seiton_admin::Result<Engine> {
        let engine = Engine::sandbox();

        engine
            .create_topic(NewTopic {
                name: "orders".into(),
                assignments: rows(&[&[1, 2], &[3, 4]]),
                config: BTreeMap::new(),
            })
            .await?;

        Ok(engine)
    }

    #[tokio::test]
    async fn apply_preserves_existing_broker_rates() -> crate::Result<()> {
        let engine = throttled_engine().await?;

        _ = engine
            .update_broker_config(
                5,
                &[ConfigEntry::set(LEADER_THROTTLED_RATE_KEY, "500000")],
                false,
            )
            .await?;

        let plan = plan(
            Some(&rows(&[&[1, 2, 3]])),
            &rows(&[&[2, 4, 5]]),
            false,
        )
        .expect("a throttled migration");

        apply(&engine, "orders", &plan, 20_000_000, Features::default()).await?;

        let info = engine.topic("orders", false).await?;
        assert!(info.is_throttled());
        assert_eq!(
            Some(&"0:1,0:2,0:3".to_owned()),
            info.config.get(LEADER_THROTTLED_REPLICAS_KEY)
        );
        assert_eq!(
            Some(&"0:4,0:5".to_owned()),
            info.config.get(FOLLOWER_THROTTLED_REPLICAS_KEY)
        );

        for broker in engine.brokers(None).await? {
            match broker.id {
                5 => {
                    assert_eq!(
                        Some(&"500000".to_owned()),
                        broker.config.get(LEADER_THROTTLED_RATE_KEY)
                    );
                    assert_eq!(
                        Some(&"20000000".to_owned()),
                        broker.config.get(FOLLOWER_THROTTLED_RATE_KEY)
                    );
                }

                1 | 2 | 3 | 4 => {
                    assert_eq!(
                        Some(&"20000000".to_owned()),
                        broker.config.get(LEADER_THROTTLED_RATE_KEY)
                    );
                    assert_eq!(
                        Some(&"20000000".to_owned()),
                        broker.config.get(FOLLOWER_THROTTLED_RATE_KEY)
                    );
                }

                _ => assert!(!broker.is_throttled()),
            }
        }

        Ok(())
    }

    #[tokio::test]
    async fn remove_sweeps_unreferenced_brokers() -> crate::Result<()> {
        let engine = throttled_engine().await?;

        let plan = plan(
            Some(&rows(&[&[1, 2]])),
            &rows(&[&[1, 3]]),
            false,
        )
        .expect("a throttled migration");

        apply(&engine, "orders", &plan, 2_000_000, Features::default()).await?;
        remove(&engine, "orders", Features::default(), false).await?;

        let info = engine.topic("orders", false).await?;
        assert!(!info.is_throttled());

        let brokers = engine.brokers(None).await?;
        assert!(seiton_admin::throttled_broker_ids(&brokers).is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn remove_keeps_brokers_referenced_elsewhere() -> crate::Result<()> {
        let engine = throttled_engine().await?;

        engine
            .create_topic(NewTopic {
                name: "payments".into(),
                assignments: rows(&[&[1, 2]]),
                config: BTreeMap::new(),
            })
            .await?;

        _ = engine
            .update_topic_config(
                "payments",
                &[ConfigEntry::set(FOLLOWER_THROTTLED_REPLICAS_KEY, "0:1,0:3")],
                false,
            )
            .await?;

        let plan = plan(
            Some(&rows(&[&[1, 2]])),
            &rows(&[&[1, 3]]),
            false,
        )
        .expect("a throttled migration");

        apply(&engine, "orders", &plan, 2_000_000, Features::default()).await?;
        remove(&engine, "orders", Features::default(), false).await?;

        assert!(!engine.topic("orders", false).await?.is_throttled());

        // brokers 1 and 3 stay capped for the other topic's migration
        let brokers = engine.brokers(None).await?;
        assert_eq!(vec![1, 3], seiton_admin::throttled_broker_ids(&brokers));

        Ok(())
    }

    #[tokio::test]
    async fn remove_suppressed_by_foreign_lock() -> crate::Result<()> {
        let engine = throttled_engine().await?;

        let plan = plan(
            Some(&rows(&[&[1, 2]])),
            &rows(&[&[1, 3]]),
            false,
        )
        .expect("a throttled migration");

        apply(&engine, "orders", &plan, 2_000_000, Features::default()).await?;
        remove(&engine, "orders", Features::default(), true).await?;

        // topic lists clear even under the lock, broker caps stay
        assert!(!engine.topic("orders", false).await?.is_throttled());

        let brokers = engine.brokers(None).await?;
        assert_eq!(vec![1, 2, 3], seiton_admin::throttled_broker_ids(&brokers));

        Ok(())
    }

    #[tokio::test]
    async fn broker_caps_skipped_without_dynamic_configs() -> crate::Result<()> {
        let engine = Engine::sandbox().features(Features {
            locks: true,
            dynamic_broker_configs: false,
        });

        engine
            .create_topic(NewTopic {
                name: "orders".into(),
                assignments: rows(&[&[1, 2]]),
                config: BTreeMap::new(),
            })
            .await?;

        let plan = plan(
            Some(&rows(&[&[1, 2]])),
            &rows(&[&[1, 3]]),
            false,
        )
        .expect("a throttled migration");

        apply(
            &engine,
            "orders",
            &plan,
            2_000_000,
            engine.supported_features(),
        )
        .await?;

        // topic level lists apply even when broker configs are read only
        assert!(engine.topic("orders", false).await?.is_throttled());

        remove(&engine, "orders", engine.supported_features(), false).await?;
        assert!(!engine.topic("orders", false).await?.is_throttled());

        Ok(())
    }
}
