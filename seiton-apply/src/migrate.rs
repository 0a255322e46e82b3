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

//! Batched execution of partition reassignments.
//!
//! Batches are strictly sequential. Within a batch the live topic is
//! polled until every partition carries the target replica list fully in
//! sync, with preferred leader election run once replicas have caught
//! up. Cancellation interrupts between polls and between batches; a
//! submitted batch is left to complete on the broker side.

use std::time::Duration;

use seiton_admin::{Admin, PartitionAssignment};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{Error, Result};

#[derive(Debug)]
pub(crate) struct Migration<'a> {
    admin: &'a dyn Admin,
    topic: &'a str,
    batch_size: usize,
    poll_interval: Duration,
    cancellation: CancellationToken,
}

impl<'a> Migration<'a> {
    pub(crate) fn new(
        admin: &'a dyn Admin,
        topic: &'a str,
        batch_size: usize,
        poll_interval: Duration,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            admin,
            topic,
            batch_size: batch_size.max(1),
            poll_interval,
            cancellation,
        }
    }

    /// submit `changes` in bounded batches, each awaited to convergence
    /// before the next is submitted
    pub(crate) async fn run(&self, changes: &[PartitionAssignment]) -> Result<()> {
        for batch in changes.chunks(self.batch_size) {
            if self.cancellation.is_cancelled() {
                return Err(Error::ConvergenceTimeout {
                    topic: self.topic.to_owned(),
                });
            }

            let partitions: Vec<i32> = batch.iter().map(|assignment| assignment.id).collect();
            info!(topic = self.topic, ?partitions, "reassigning");

            self.admin.assign_partitions(self.topic, batch).await?;
            self.await_convergence(batch).await?;
        }

        Ok(())
    }

    /// Poll until every target partition is live with its target replica
    /// list, fully in sync and led by its preferred leader, electing the
    /// leader once replicas have caught up.
    pub(crate) async fn await_convergence(&self, targets: &[PartitionAssignment]) -> Result<()> {
        loop {
            let info = self.admin.topic(self.topic, true).await?;

            let mut pending_election = Vec::new();
            let mut converged = true;

            for target in targets {
                let Some(live) = info
                    .partitions
                    .iter()
                    .find(|partition| partition.id == target.id)
                else {
                    converged = false;
                    continue;
                };

                if live.replicas != target.replicas {
                    converged = false;
                    continue;
                }

                if !live.fully_in_sync() {
                    converged = false;
                    continue;
                }

                if live.leader != target.replicas[0] {
                    pending_election.push(target.id);
                }
            }

            if !pending_election.is_empty() {
                debug!(topic = self.topic, ?pending_election);

                self.admin
                    .run_leader_election(self.topic, &pending_election)
                    .await?;

                converged = false;
            }

            if converged {
                return Ok(());
            }

            tokio::select! {
                () = self.cancellation.cancelled() => {
                    return Err(Error::ConvergenceTimeout {
                        topic: self.topic.to_owned(),
                    });
                }

                () = sleep(self.poll_interval) => {}
            }
        }
    }
}
