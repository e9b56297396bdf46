//! Agent persistence.
//!
//! An agent directory holds `agent.json` (format version, configuration and
//! running average reward) and one record file per dense parameter, keyed
//! `<network>.<layer>.weights` and `<network>.<layer>.bias`. Eligibility
//! traces are not persisted; a loaded agent starts with zero traces.

use std::path::Path;

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::agent::Agent;
use crate::config::AgentConfig;
use crate::dataset::RecordFile;
use crate::layer::DenseState;
use crate::model::Model;
use crate::network::{Network, NetworkState};
use crate::{Error, Result, Tensor};

pub const MODEL_FORMAT_VERSION: u32 = 1;
pub const AGENT_FILE_NAME: &str = "agent.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedAgent {
    pub format_version: u32,
    pub config: AgentConfig,
    pub avg_reward: f32,
}

impl SerializedAgent {
    pub fn validate(&self) -> Result<()> {
        if self.format_version != MODEL_FORMAT_VERSION {
            return Err(Error::InvalidData(format!(
                "unsupported agent format_version {}; expected {}",
                self.format_version, MODEL_FORMAT_VERSION
            )));
        }
        if !self.avg_reward.is_finite() {
            return Err(Error::InvalidData(
                "avg_reward must be finite".to_owned(),
            ));
        }
        self.config.validate()
    }
}

fn param_key(network: &str, layer: &str, param: &str) -> String {
    format!("{network}.{layer}.{param}")
}

/// Write the dense parameters of `state` under `dir`.
pub fn save_state(dir: &Path, network: &str, state: &NetworkState) -> Result<()> {
    for (layer, dense) in state {
        for (param, tensor) in [("weights", &dense.weights), ("bias", &dense.bias)] {
            let mut file = RecordFile::create_by_key(dir, &param_key(network, layer, param))?;
            file.write(tensor)?;
            file.flush()?;
        }
    }
    Ok(())
}

fn read_param(dir: &Path, network: &str, layer: &str, param: &str) -> Result<Tensor> {
    let mut file = RecordFile::by_key(dir, &param_key(network, layer, param));
    if !file.exists() {
        return Err(Error::InvalidData(format!(
            "missing {param} of `{network}.{layer}` at {}",
            file.path().display()
        )));
    }
    let tensor = file.read_all()?.ok_or_else(|| {
        Error::InvalidData(format!("{} holds no records", file.path().display()))
    })?;
    if tensor.data().iter().any(|v| !v.is_finite()) {
        return Err(Error::InvalidData(format!(
            "{param} of `{network}.{layer}` must contain only finite values"
        )));
    }
    Ok(tensor)
}

/// Read the dense parameters of `net` from `dir`; traces start at zero.
pub fn load_state(dir: &Path, name: &str, net: &Network) -> Result<NetworkState> {
    let mut state = NetworkState::new();
    for layer in net.zero_state().into_keys() {
        let weights = read_param(dir, name, &layer, "weights")?;
        let bias = read_param(dir, name, &layer, "bias")?;
        let dense = DenseState::from_params(weights, bias)
            .map_err(|e| Error::InvalidData(format!("layer `{name}.{layer}` invalid: {e}")))?;
        state.insert(layer, dense);
    }
    net.validate_state(&state)?;
    Ok(state)
}

pub fn save_agent(agent: &Agent, dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let ser = SerializedAgent {
        format_version: MODEL_FORMAT_VERSION,
        config: agent.config().clone(),
        avg_reward: agent.avg_reward(),
    };
    let json = serde_json::to_string_pretty(&ser)?;
    std::fs::write(dir.join(AGENT_FILE_NAME), json)?;
    for (name, _, state) in agent.model().networks() {
        save_state(dir, name, state)?;
    }
    info!(dir = %dir.display(), "agent saved");
    Ok(())
}

pub fn load_agent(dir: &Path) -> Result<Agent> {
    let path = dir.join(AGENT_FILE_NAME);
    let s = std::fs::read_to_string(&path)?;
    let ser: SerializedAgent = serde_json::from_str(&s)
        .map_err(|e| Error::InvalidData(format!("failed to parse {}: {e}", path.display())))?;
    ser.validate()?;

    // Freshly initialized parameters are replaced below.
    let mut rng = StdRng::seed_from_u64(0);
    let mut model = Model::from_spec(&ser.config.model, &ser.config.actions, &mut rng)?;
    for (name, net, state) in model.networks_mut() {
        *state = load_state(dir, name, net)?;
    }
    info!(dir = %dir.display(), avg_reward = ser.avg_reward, "agent loaded");
    Agent::from_parts(ser.config, model, ser.avg_reward)
}
