//! Agent configuration.
//!
//! An [`AgentConfig`] is read from JSON and validated before any network is
//! built. Omitted hyperparameters take their defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::network::NetworkSpec;
use crate::{Error, Result};

/// Name of the value head and of its learning rate entry.
pub const CRITIC: &str = "critic";

pub const DEFAULT_NUM_STEPS: usize = 2048;
pub const DEFAULT_NUM_EPOCHS: usize = 1;
pub const DEFAULT_BATCH_SIZE: usize = 32;
pub const DEFAULT_PPO_EPSILON: f32 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Train on every transition as it is observed.
    #[default]
    OnlineTd,
    /// Buffer a trajectory, then train TD minibatches over it.
    BatchTd,
    /// Buffer a trajectory, then train clipped-ratio minibatches over it.
    Ppo,
}

impl Algorithm {
    pub fn is_batch(self) -> bool {
        !matches!(self, Algorithm::OnlineTd)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelSpec {
    /// One graph holding the `critic` layer and every action head.
    Single { network: NetworkSpec },
    /// Action heads in `policy`, the `critic` layer in `critic`.
    Pair {
        policy: NetworkSpec,
        critic: NetworkSpec,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub algorithm: Algorithm,
    pub model: ModelSpec,
    /// Action head name -> number of discrete values.
    pub actions: BTreeMap<String, usize>,
    /// Learning rate per action head, plus one for `critic`.
    pub alphas: BTreeMap<String, f32>,
    /// Trace decay.
    #[serde(default)]
    pub lambda: f32,
    /// Learning rate of the average-reward baseline.
    #[serde(default)]
    pub reward_alpha: f32,
    #[serde(default = "default_ppo_epsilon")]
    pub ppo_epsilon: f32,
    #[serde(default = "default_num_steps")]
    pub num_steps: usize,
    #[serde(default = "default_num_epochs")]
    pub num_epochs: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Seed for initialization, dropout, sampling and shuffling.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Where to autosave; nothing is saved without it.
    #[serde(default)]
    pub model_path: Option<PathBuf>,
    /// Autosave after this many training calls.
    #[serde(default)]
    pub saving_interval_steps: Option<u64>,
}

fn default_ppo_epsilon() -> f32 {
    DEFAULT_PPO_EPSILON
}

fn default_num_steps() -> usize {
    DEFAULT_NUM_STEPS
}

fn default_num_epochs() -> usize {
    DEFAULT_NUM_EPOCHS
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

impl AgentConfig {
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let s = std::fs::read_to_string(path)?;
        Self::from_json_str(&s)
    }

    pub fn to_json_string_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Action head learning rates, without the critic.
    pub fn head_alphas(&self) -> BTreeMap<String, f32> {
        self.alphas
            .iter()
            .filter(|(k, _)| self.actions.contains_key(*k))
            .map(|(k, &v)| (k.clone(), v))
            .collect()
    }

    pub fn critic_alpha(&self) -> f32 {
        self.alphas.get(CRITIC).copied().unwrap_or(0.0)
    }

    /// Hyperparameter checks. Graph-level checks happen when the model is built.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.lambda) {
            return Err(Error::InvalidConfig(format!(
                "lambda must be in [0, 1], got {}",
                self.lambda
            )));
        }
        if !(self.reward_alpha.is_finite() && self.reward_alpha >= 0.0) {
            return Err(Error::InvalidConfig(format!(
                "reward_alpha must be finite and >= 0, got {}",
                self.reward_alpha
            )));
        }
        if !(self.ppo_epsilon > 0.0 && self.ppo_epsilon < 1.0) {
            return Err(Error::InvalidConfig(format!(
                "ppo_epsilon must be in (0, 1), got {}",
                self.ppo_epsilon
            )));
        }
        if self.num_steps == 0 || self.num_epochs == 0 || self.batch_size == 0 {
            return Err(Error::InvalidConfig(
                "num_steps, num_epochs and batch_size must be > 0".to_owned(),
            ));
        }
        if self.saving_interval_steps == Some(0) {
            return Err(Error::InvalidConfig(
                "saving_interval_steps must be > 0".to_owned(),
            ));
        }
        if self.actions.is_empty() {
            return Err(Error::InvalidConfig("at least one action is required".to_owned()));
        }
        if self.actions.contains_key(CRITIC) {
            return Err(Error::InvalidConfig(format!(
                "action name `{CRITIC}` is reserved for the value head"
            )));
        }
        if !self.alphas.contains_key(CRITIC) {
            return Err(Error::InvalidConfig(format!("missing alpha for `{CRITIC}`")));
        }
        for (name, &values) in &self.actions {
            if values == 0 {
                return Err(Error::InvalidConfig(format!(
                    "action `{name}` must have at least one value"
                )));
            }
            if !self.alphas.contains_key(name) {
                return Err(Error::InvalidConfig(format!("missing alpha for action `{name}`")));
            }
        }
        for (name, alpha) in &self.alphas {
            if !alpha.is_finite() {
                return Err(Error::InvalidConfig(format!("alpha for `{name}` must be finite")));
            }
        }
        Ok(())
    }
}
