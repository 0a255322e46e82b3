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

use std::{path::PathBuf, sync::Arc, time::Duration};

use seiton_admin::{Admin, memory::Engine};
use seiton_apply::{Applier, ApplierConfig};
use seiton_config::{load_cluster_file, load_topics_file};
use tracing::info;
use url::Url;

use crate::{Error, Result};

use super::DEFAULT_ADMIN_URL;

#[derive(Clone, Debug, clap::Args)]
pub(super) struct Arg {
    /// cluster config file
    #[arg(long)]
    cluster: PathBuf,

    /// topic config files, `---` separates specs within a file
    #[arg(required = true)]
    topics: Vec<PathBuf>,

    /// admin endpoint, selected by URL scheme
    #[arg(long, default_value = DEFAULT_ADMIN_URL)]
    admin_url: Url,

    /// plan every change without mutating the cluster
    #[arg(long)]
    dry_run: bool,

    /// delete settings present on the cluster but absent from the spec
    #[arg(long)]
    destructive: bool,

    /// reassign every partition under the current strategy
    #[arg(long)]
    rebalance: bool,

    /// run unattended, without confirmation prompts
    #[arg(long)]
    skip_confirm: bool,

    /// poll interval while awaiting convergence, in milliseconds
    #[arg(long, default_value_t = 10_000)]
    sleep_loop_duration_ms: u64,

    /// largest retention reduction per run, in minutes; 0 applies
    /// reductions directly
    #[arg(long, default_value_t = 0)]
    retention_drop_step_minutes: u64,

    /// override the spec's migration throttle, in megabytes per second
    #[arg(long)]
    broker_throttle_mb: Option<i64>,

    /// override the spec's migration batch size
    #[arg(long)]
    partition_batch_size: Option<usize>,
}

impl Arg {
    pub(super) async fn main(self) -> Result<()> {
        let cluster = load_cluster_file(&self.cluster, true)?;
        let admin = admin_for(&self.admin_url)?;

        for path in &self.topics {
            for topic in load_topics_file(path)? {
                let name = topic.meta.name.clone();

                let mut config = ApplierConfig::new(cluster.clone(), topic)
                    .dry_run(self.dry_run)
                    .destructive(self.destructive)
                    .rebalance(self.rebalance)
                    .skip_confirm(self.skip_confirm)
                    .sleep_loop_duration(Duration::from_millis(self.sleep_loop_duration_ms))
                    .retention_drop_step(Duration::from_secs(
                        self.retention_drop_step_minutes * 60,
                    ));

                if let Some(throttle_mb) = self.broker_throttle_mb {
                    config = config.broker_throttle_mb(throttle_mb);
                }

                if let Some(batch_size) = self.partition_batch_size {
                    config = config.partition_batch_size(batch_size);
                }

                match Applier::new(admin.clone(), config)?.apply().await? {
                    Some(record) => {
                        _ = serde_json::to_string(&record)
                            .inspect(|record| println!("{record}"))?;
                    }

                    None => info!(topic = %name, "no changes"),
                }
            }
        }

        Ok(())
    }
}

/// pick an admin engine by URL scheme; `memory://` is an in-process
/// sandbox of six brokers over three racks
fn admin_for(url: &Url) -> Result<Arc<dyn Admin>> {
    match url.scheme() {
        "memory" => Ok(Arc::new(Engine::sandbox())),

        _ => Err(Error::UnsupportedAdminUrl(url.clone())),
    }
}
