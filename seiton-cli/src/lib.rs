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

//! Seiton CLI
//!
//! Apply desired topic state to a cluster from the command line.

use std::{result, sync::Arc};

use url::Url;

mod cli;

pub use cli::Cli;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("admin: {0}")]
    Admin(#[from] seiton_admin::Error),

    #[error("apply: {0}")]
    Apply(#[from] seiton_apply::Error),

    #[error("config: {0}")]
    Config(#[from] seiton_config::Error),

    #[error("json: {0}")]
    Json(Arc<serde_json::Error>),

    #[error("unsupported admin url: {0}")]
    UnsupportedAdminUrl(Url),

    #[error("url: {0}")]
    Url(#[from] url::ParseError),
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(Arc::new(value))
    }
}

pub type Result<T, E = Error> = result::Result<T, E>;
