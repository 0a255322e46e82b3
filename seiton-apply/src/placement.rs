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

//! Replica placement planning.
//!
//! The planner is a pure function from brokers, current assignments and a
//! placement policy to target assignments. Rows already satisfying the
//! policy are kept verbatim; violating rows are repaired keeping as many
//! of their current replicas as the policy allows, preferring the current
//! leader. Under rebalance every row is planned from scratch.

use std::{
    collections::BTreeMap,
    hash::{DefaultHasher, Hash, Hasher},
};

use rand::{Rng, SeedableRng, rngs::StdRng};
use seiton_admin::{Broker, PartitionAssignment};
use seiton_config::{PickerMethod, PlacementConfig, PlacementStrategy};

use crate::{Error, Result};

#[derive(Debug)]
pub struct Planner<'a> {
    topic: &'a str,
    replication_factor: usize,
    placement: &'a PlacementConfig,
    brokers: BTreeMap<i32, &'a str>,
    racks: BTreeMap<&'a str, Vec<i32>>,
}

#[derive(Debug, Default)]
struct Usage {
    replicas: BTreeMap<i32, usize>,
    leaders: BTreeMap<i32, usize>,
    racks: BTreeMap<String, usize>,
}

impl Usage {
    fn observe_row(&mut self, row: &[i32]) {
        if let Some(leader) = row.first() {
            *self.leaders.entry(*leader).or_default() += 1;
        }

        for replica in row {
            *self.replicas.entry(*replica).or_default() += 1;
        }
    }

    fn observe_rack(&mut self, rack: &str) {
        *self.racks.entry(rack.to_owned()).or_default() += 1;
    }

    fn replica(&self, id: i32) -> usize {
        self.replicas.get(&id).copied().unwrap_or_default()
    }

    fn leader(&self, id: i32) -> usize {
        self.leaders.get(&id).copied().unwrap_or_default()
    }

    fn rack(&self, rack: &str) -> usize {
        self.racks.get(rack).copied().unwrap_or_default()
    }
}

impl<'a> Planner<'a> {
    pub fn new(
        topic: &'a str,
        brokers: &'a [Broker],
        replication_factor: usize,
        placement: &'a PlacementConfig,
    ) -> Self {
        let brokers: BTreeMap<i32, &str> = brokers
            .iter()
            .map(|broker| (broker.id, broker.rack.as_str()))
            .collect();

        let mut racks: BTreeMap<&str, Vec<i32>> = BTreeMap::new();

        for (id, rack) in &brokers {
            racks.entry(*rack).or_default().push(*id);
        }

        Self {
            topic,
            replication_factor,
            placement,
            brokers,
            racks,
        }
    }

    /// Target assignments for `partitions` partitions. Existing rows are
    /// kept where the strategy allows; `rebalance` plans every row from
    /// scratch.
    pub fn plan(
        &self,
        current: &[PartitionAssignment],
        partitions: usize,
        rebalance: bool,
    ) -> Result<Vec<PartitionAssignment>> {
        if self.replication_factor > self.brokers.len() {
            return Err(Error::InsufficientBrokers {
                required: self.replication_factor,
                available: self.brokers.len(),
            });
        }

        let rows = match self.placement.strategy {
            PlacementStrategy::Static => self.plan_static(partitions)?,
            PlacementStrategy::StaticInRack => self.plan_static_in_rack(current, partitions)?,
            PlacementStrategy::Any => self.plan_any(current, partitions, rebalance)?,
            PlacementStrategy::InRack => self.plan_in_rack(current, partitions, rebalance)?,
            PlacementStrategy::BalancedLeaders => {
                self.plan_balanced(current, partitions, rebalance)?
            }
        };

        Ok(rows
            .into_iter()
            .enumerate()
            .map(|(id, replicas)| PartitionAssignment::new(id as i32, replicas))
            .collect())
    }

    fn plan_static(&self, partitions: usize) -> Result<Vec<Vec<i32>>> {
        let rows = self
            .placement
            .static_assignments
            .as_deref()
            .unwrap_or_default();

        if rows.len() != partitions {
            return Err(Error::StaticAssignmentCount {
                expected: partitions,
                provided: rows.len(),
            });
        }

        for (partition, row) in rows.iter().enumerate() {
            self.check_static_row(partition as i32, row)?;
        }

        Ok(rows.to_vec())
    }

    fn plan_static_in_rack(
        &self,
        current: &[PartitionAssignment],
        partitions: usize,
    ) -> Result<Vec<Vec<i32>>> {
        let labels = self
            .placement
            .static_rack_assignments
            .as_deref()
            .unwrap_or_default();

        if labels.len() != partitions {
            return Err(Error::StaticRackCount {
                expected: partitions,
                provided: labels.len(),
            });
        }

        let mut usage = Usage::default();
        let mut rows: Vec<Option<Vec<i32>>> = Vec::with_capacity(partitions);

        for (partition, label) in labels.iter().enumerate() {
            let members = self.rack_members(partition as i32, label)?;

            let kept = current
                .get(partition)
                .map(|assignment| assignment.replicas.as_slice())
                .filter(|row| {
                    self.row_valid(row) && row.iter().all(|id| members.contains(id))
                })
                .map(<[i32]>::to_vec);

            if let Some(row) = &kept {
                usage.observe_row(row);
            }

            rows.push(kept);
        }

        for (partition, slot) in rows.iter_mut().enumerate() {
            if slot.is_some() {
                continue;
            }

            let label = &labels[partition];
            let members = self.rack_members(partition as i32, label)?;

            // carry over whatever the current row already keeps in the rack
            let seed = current
                .get(partition)
                .map(|assignment| {
                    Self::seed_from(&assignment.replicas, &members, self.replication_factor)
                })
                .unwrap_or_default();

            *slot = Some(self.fill_row(partition as i32, seed, &members, &mut usage)?);
        }

        Ok(rows.into_iter().flatten().collect())
    }

    fn plan_any(
        &self,
        current: &[PartitionAssignment],
        partitions: usize,
        rebalance: bool,
    ) -> Result<Vec<Vec<i32>>> {
        let pool: Vec<i32> = self.brokers.keys().copied().collect();

        let mut usage = Usage::default();
        let mut rows = self.keep_rows(current, partitions, rebalance, |row| self.row_valid(row));

        for row in rows.iter().flatten() {
            usage.observe_row(row);
        }

        for (partition, slot) in rows.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(self.fill_row(partition as i32, Vec::new(), &pool, &mut usage)?);
            }
        }

        Ok(rows.into_iter().flatten().collect())
    }

    fn plan_in_rack(
        &self,
        current: &[PartitionAssignment],
        partitions: usize,
        rebalance: bool,
    ) -> Result<Vec<Vec<i32>>> {
        let eligible: BTreeMap<&str, &Vec<i32>> = self
            .racks
            .iter()
            .filter(|(_, members)| members.len() >= self.replication_factor)
            .map(|(rack, members)| (*rack, members))
            .collect();

        if eligible.is_empty() {
            return Err(Error::NoRackWithCapacity {
                required: self.replication_factor,
            });
        }

        let mut usage = Usage::default();
        let mut rows = self.keep_rows(current, partitions, rebalance, |row| {
            self.row_valid(row)
                && self
                    .common_rack(row)
                    .is_some_and(|rack| eligible.contains_key(rack))
        });

        for row in rows.iter().flatten() {
            usage.observe_row(row);

            if let Some(rack) = self.common_rack(row) {
                usage.observe_rack(rack);
            }
        }

        for (partition, slot) in rows.iter_mut().enumerate() {
            if slot.is_some() {
                continue;
            }

            let seed = (!rebalance)
                .then(|| current.get(partition))
                .flatten()
                .map(|assignment| assignment.replicas.as_slice())
                .unwrap_or_default();

            // a repaired row stays in its leader's rack where possible
            let rack = seed
                .first()
                .and_then(|leader| self.brokers.get(leader).copied())
                .filter(|rack| eligible.contains_key(rack))
                .map(<str>::to_owned)
                .map(Ok)
                .unwrap_or_else(|| {
                    self.balanced_rack(partition as i32, &eligible, &usage)
                })?;

            let members = eligible[rack.as_str()].to_vec();
            let seed = Self::seed_from(seed, &members, self.replication_factor);

            let row = self.fill_row(partition as i32, seed, &members, &mut usage)?;
            usage.observe_rack(&rack);
            *slot = Some(row);
        }

        Ok(rows.into_iter().flatten().collect())
    }

    fn plan_balanced(
        &self,
        current: &[PartitionAssignment],
        partitions: usize,
        rebalance: bool,
    ) -> Result<Vec<Vec<i32>>> {
        let pool: Vec<i32> = self.brokers.keys().copied().collect();

        let mut usage = Usage::default();
        let mut slots = self.keep_rows(current, partitions, rebalance, |row| self.row_valid(row));

        for row in slots.iter().flatten() {
            usage.observe_row(row);
        }

        for (partition, slot) in slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(self.fill_row(partition as i32, Vec::new(), &pool, &mut usage)?);
            }
        }

        let mut rows: Vec<Vec<i32>> = slots.into_iter().flatten().collect();
        self.balance_leaders(&mut rows);

        Ok(rows)
    }

    /// Shuffle leadership until no broker leads two partitions more than
    /// any other: swap the overloaded leader with one of its followers
    /// where that suffices (a pure leader election), otherwise bring in
    /// an underused broker at position 0.
    fn balance_leaders(&self, rows: &mut [Vec<i32>]) {
        loop {
            let mut counts: BTreeMap<i32, usize> =
                self.brokers.keys().map(|id| (*id, 0)).collect();

            for row in rows.iter() {
                if let Some(leader) = row.first() {
                    *counts.entry(*leader).or_default() += 1;
                }
            }

            let min = counts.values().copied().min().unwrap_or_default();
            let max = counts.values().copied().max().unwrap_or_default();

            if max - min <= 1 {
                return;
            }

            let Some((partition, row)) = rows
                .iter_mut()
                .enumerate()
                .find(|(_, row)| row.first().is_some_and(|leader| counts[leader] == max))
            else {
                return;
            };

            if let Some(position) = row[1..]
                .iter()
                .position(|follower| counts[follower] == min)
            {
                row.swap(0, position + 1);
                continue;
            }

            let candidates: Vec<i32> = counts
                .iter()
                .filter(|(id, count)| **count == min && !row.contains(*id))
                .map(|(id, _)| *id)
                .collect();

            row[0] = self.pick(partition as i32, &candidates);
        }
    }

    /// current replicas worth keeping in a repaired row: in the pool,
    /// deduplicated, leader first
    fn seed_from(current: &[i32], pool: &[i32], replication_factor: usize) -> Vec<i32> {
        let mut seed = Vec::new();

        for id in current {
            if pool.contains(id) && !seed.contains(id) && seed.len() < replication_factor {
                seed.push(*id);
            }
        }

        seed
    }

    fn keep_rows<F>(
        &self,
        current: &[PartitionAssignment],
        partitions: usize,
        rebalance: bool,
        keep: F,
    ) -> Vec<Option<Vec<i32>>>
    where
        F: Fn(&[i32]) -> bool,
    {
        (0..partitions)
            .map(|partition| {
                (!rebalance)
                    .then(|| current.get(partition))
                    .flatten()
                    .map(|assignment| assignment.replicas.as_slice())
                    .filter(|row| keep(row))
                    .map(<[i32]>::to_vec)
            })
            .collect()
    }

    /// extend `row` to the replication factor from `pool`, preferring
    /// underused brokers; position 0 balances on leadership
    fn fill_row(
        &self,
        partition: i32,
        mut row: Vec<i32>,
        pool: &[i32],
        usage: &mut Usage,
    ) -> Result<Vec<i32>> {
        while row.len() < self.replication_factor {
            let candidates: Vec<i32> = pool
                .iter()
                .copied()
                .filter(|id| !row.contains(id))
                .collect();

            let chosen = if row.is_empty() {
                self.choose(partition, &candidates, |id| usage.leader(id))
            } else {
                self.choose(partition, &candidates, |id| usage.replica(id))
            }
            .ok_or(Error::InsufficientBrokers {
                required: self.replication_factor,
                available: pool.len(),
            })?;

            row.push(chosen);
        }

        usage.observe_row(&row);
        Ok(row)
    }

    fn balanced_rack(
        &self,
        partition: i32,
        eligible: &BTreeMap<&str, &Vec<i32>>,
        usage: &Usage,
    ) -> Result<String> {
        // racks compete through their lowest broker id so the picker can
        // break ties the same way it does for brokers
        let representatives: Vec<i32> = eligible.values().map(|members| members[0]).collect();

        self.choose(partition, &representatives, |id| {
            self.brokers
                .get(&id)
                .map(|rack| usage.rack(rack))
                .unwrap_or_default()
        })
        .and_then(|id| self.brokers.get(&id).copied())
        .map(<str>::to_owned)
        .ok_or(Error::NoRackWithCapacity {
            required: self.replication_factor,
        })
    }

    fn choose<F>(&self, partition: i32, candidates: &[i32], weight: F) -> Option<i32>
    where
        F: Fn(i32) -> usize,
    {
        let min = candidates.iter().map(|id| weight(*id)).min()?;

        let tied: Vec<i32> = candidates
            .iter()
            .copied()
            .filter(|id| weight(*id) == min)
            .collect();

        Some(self.pick(partition, &tied))
    }

    fn pick(&self, partition: i32, tied: &[i32]) -> i32 {
        match self.placement.picker {
            PickerMethod::LowestIndex => tied[0],

            PickerMethod::Randomized => {
                let mut rng = self.rng(partition);

                tied[rng.random_range(0..tied.len())]
            }
        }
    }

    /// reproducible from `(topic, partition)` so a dry run and the apply
    /// that follows it make identical choices
    fn rng(&self, partition: i32) -> StdRng {
        let mut hasher = DefaultHasher::new();
        self.topic.hash(&mut hasher);
        partition.hash(&mut hasher);

        StdRng::seed_from_u64(hasher.finish())
    }

    fn check_static_row(&self, partition: i32, row: &[i32]) -> Result<()> {
        if row.len() != self.replication_factor {
            return Err(Error::StaticAssignmentWidth {
                partition,
                expected: self.replication_factor,
                provided: row.len(),
            });
        }

        for (position, broker) in row.iter().enumerate() {
            if !self.brokers.contains_key(broker) {
                return Err(Error::UnknownBroker {
                    partition,
                    broker: *broker,
                });
            }

            if row[..position].contains(broker) {
                return Err(Error::DuplicateReplica {
                    partition,
                    broker: *broker,
                });
            }
        }

        Ok(())
    }

    fn rack_members(&self, partition: i32, label: &str) -> Result<Vec<i32>> {
        let members = self.racks.get(label).ok_or_else(|| Error::UnknownRack {
            partition,
            rack: label.to_owned(),
        })?;

        if members.len() < self.replication_factor {
            return Err(Error::RackTooSmall {
                partition,
                rack: label.to_owned(),
                required: self.replication_factor,
                available: members.len(),
            });
        }

        Ok(members.clone())
    }

    fn row_valid(&self, row: &[i32]) -> bool {
        row.len() == self.replication_factor
            && row
                .iter()
                .enumerate()
                .all(|(position, id)| {
                    self.brokers.contains_key(id) && !row[..position].contains(id)
                })
    }

    fn common_rack(&self, row: &[i32]) -> Option<&str> {
        let mut racks = row.iter().map(|id| self.brokers.get(id).copied());

        racks
            .next()
            .flatten()
            .filter(|first| racks.all(|rack| rack == Some(*first)))
    }
}
