// Copyright 2024 GridStore Team
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

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Client lock manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockManagerConfig {
    /// Interval between garbage-collection sweeps over idle locks
    #[serde(default = "default_gc_interval")]
    pub gc_interval: Duration,

    /// Whether the background sweep task is started
    #[serde(default = "default_gc_enabled")]
    pub gc_enabled: bool,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            gc_interval: default_gc_interval(),
            gc_enabled: default_gc_enabled(),
        }
    }
}

fn default_gc_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_gc_enabled() -> bool {
    true
}

impl LockManagerConfig {
    /// Configuration with no background sweeping; garbage collection only
    /// runs when driven explicitly.
    pub fn without_gc() -> Self {
        Self {
            gc_enabled: false,
            ..Self::default()
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.gc_enabled && self.gc_interval.is_zero() {
            return Err(crate::error::LockError::configuration(
                "GC interval must be greater than zero when sweeping is enabled",
            ));
        }
        Ok(())
    }
}
