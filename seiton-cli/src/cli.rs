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

use clap::{Parser, Subcommand};
use tracing::debug;

use crate::Result;

mod apply;

const DEFAULT_ADMIN_URL: &str = "memory://sandbox";

#[derive(Clone, Debug, Parser)]
#[command(name = "seiton", version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Reconcile desired topic specs against the live cluster
    Apply(Box<apply::Arg>),
}

impl Cli {
    pub async fn main() -> Result<()> {
        let cli = Cli::parse();

        match cli.command {
            Command::Apply(arg) => arg
                .main()
                .await
                .inspect(|outcome| debug!(?outcome))
                .inspect_err(|err| debug!(?err)),
        }
    }
}
