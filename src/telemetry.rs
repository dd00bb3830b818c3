// Copyright FlowProxy Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::time::Instant;

use once_cell::sync::Lazy;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{filter, fmt};

pub static APPLICATION_START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

/// Install the global tracing subscriber. Level defaults to `info` and is
/// overridden by `RUST_LOG`. Re-initialization (tests) is a no-op.
pub fn setup_logging() {
    Lazy::force(&APPLICATION_START_TIME);
    let filter = filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| filter::EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_filter(filter))
        .try_init();
}
