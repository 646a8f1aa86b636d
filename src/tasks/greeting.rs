//! Demo task set: two slow, unreliable word producers and a consumer that
//! joins their words into a welcome message.
//!
//! ```text
//! fetch-work    --
//!                 |--> welcome -> [ Welcome Work Manager !! ]
//! fetch-manager --
//! ```

use crate::error::Result;
use crate::models::Data;
use crate::tasks::{TaskFunction, TaskOutcome, TaskRegistry};
use anyhow::anyhow;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, warn};

pub const FETCH_WORK: &str = "fetch-work";
pub const FETCH_MANAGER: &str = "fetch-manager";
pub const WELCOME: &str = "welcome";

/// Output key of [`FETCH_WORK`]
pub const KEY_DATA_A: &str = "key_data_a";
/// Output key of [`FETCH_MANAGER`]
pub const KEY_DATA_B: &str = "key_data_b";
/// Output key of [`WELCOME`]
pub const KEY_MESSAGE: &str = "message";

/// Sleeps, then either emits `word` under `key` or faults
#[derive(Debug, Clone)]
pub struct FetchWord {
    pub key: &'static str,
    pub word: &'static str,
    pub delay: Duration,
    pub success_rate: f64,
}

#[async_trait]
impl TaskFunction for FetchWord {
    async fn execute(&self, _input: Data) -> anyhow::Result<TaskOutcome> {
        tokio::time::sleep(self.delay).await;

        if rand::random::<f64>() < self.success_rate {
            info!("Fetched '{}' for {}", self.word, self.key);
            Ok(TaskOutcome::Success(Data::new().with(self.key, self.word)))
        } else {
            warn!("Fetching '{}' failed", self.word);
            Err(anyhow!("fetching '{}' failed", self.word))
        }
    }
}

/// Joins both fetched words into a welcome message
#[derive(Debug, Clone)]
pub struct Welcome {
    pub success_rate: f64,
}

#[async_trait]
impl TaskFunction for Welcome {
    async fn execute(&self, input: Data) -> anyhow::Result<TaskOutcome> {
        let (Some(a), Some(b)) = (input.get_str(KEY_DATA_A), input.get_str(KEY_DATA_B)) else {
            return Ok(TaskOutcome::Failure);
        };

        if rand::random::<f64>() < self.success_rate {
            let message = format!("Welcome {} {} !!", a, b);
            info!("{}", message);
            Ok(TaskOutcome::Success(Data::new().with(KEY_MESSAGE, message)))
        } else {
            warn!("Welcome failed");
            Err(anyhow!("welcome failed"))
        }
    }
}

/// Register the three demo tasks, each succeeding with `success_rate`.
pub fn register(registry: &mut TaskRegistry, success_rate: f64) -> Result<()> {
    registry.register(
        FETCH_WORK,
        FetchWord {
            key: KEY_DATA_A,
            word: "Work",
            delay: Duration::from_secs(1),
            success_rate,
        },
    )?;
    registry.register(
        FETCH_MANAGER,
        FetchWord {
            key: KEY_DATA_B,
            word: "Manager",
            delay: Duration::from_secs(2),
            success_rate,
        },
    )?;
    registry.register(WELCOME, Welcome { success_rate })?;
    Ok(())
}
