//! Eligibility-trace actor-critic training.
//!
//! `rltd` trains small named-graph networks with TD(lambda) eligibility traces
//! against an average-reward baseline, online or in batches, with an optional
//! PPO-style clipped ratio. Training data can live out of core in a directory
//! of fixed-shape record files.
//!
//! # Pieces
//!
//! - [`Network`] is a DAG of named layers (dense, tanh, relu, softmax,
//!   linear, sum, concat) evaluated in topological order. Parameters and
//!   traces live in a separate [`NetworkState`].
//! - [`Model`] pairs the graph(s) with their states: one network holding the
//!   `critic` value layer and every action head, or a policy network plus a
//!   critic network.
//! - [`Agent`] acts and learns from [`Transition`]s, as configured by an
//!   [`AgentConfig`].
//! - [`run_mini_batch`] is the single trace update every training path goes
//!   through; [`BatchTrainer`] drives it over a [`Dataset`] on disk.
//! - [`TelemetrySink`] receives a [`Snapshot`] of every training step.
//!
//! # Data layout and shapes
//!
//! - Scalars are `f32`.
//! - A [`Tensor`] is a row-major buffer whose first axis indexes records.
//! - Dense weights have shape `(inputs, outputs)`, biases `(1, outputs)`.
//! - Named tensors travel as a [`TensorMap`], keyed by input or layer name.
//!
//! # Quick start
//!
//! ```rust
//! use std::collections::BTreeMap;
//!
//! use rltd::{Agent, AgentConfig, Tensor, TensorMap, Transition};
//!
//! # fn main() -> rltd::Result<()> {
//! let config = AgentConfig::from_json_str(r#"{
//!     "model": {
//!         "kind": "single",
//!         "network": {
//!             "inputs": {"state": 2},
//!             "layers": [
//!                 {"name": "critic", "type": "dense", "size": 1, "inputs": ["state"]},
//!                 {"name": "logits", "type": "dense", "size": 2, "inputs": ["state"]},
//!                 {"name": "move", "type": "softmax", "inputs": ["logits"]}
//!             ]
//!         }
//!     },
//!     "actions": {"move": 2},
//!     "alphas": {"critic": 0.1, "move": 0.1},
//!     "lambda": 0.5,
//!     "reward_alpha": 0.01,
//!     "seed": 7
//! }"#)?;
//! let mut agent = Agent::new(config)?;
//!
//! let s0: TensorMap = BTreeMap::from([("state".to_owned(), Tensor::row_vector(vec![1.0, 0.0]))]);
//! let s1: TensorMap = BTreeMap::from([("state".to_owned(), Tensor::row_vector(vec![0.0, 1.0]))]);
//! let actions = agent.act(&s0)?;
//! agent.observe(Transition {
//!     s0,
//!     actions,
//!     reward: 1.0,
//!     s1,
//!     terminal: false,
//! })?;
//! assert!(agent.avg_reward() != 0.0);
//! # Ok(())
//! # }
//! ```

pub mod activation;
pub mod advantage;
pub mod agent;
pub mod builder;
pub mod config;
pub mod csv_store;
pub mod dataset;
pub mod error;
pub mod layer;
pub(crate) mod matmul;
pub mod model;
pub mod network;
pub mod persist;
pub mod telemetry;
pub mod tensor;
pub mod trainer;

pub use activation::Activation;
pub use advantage::{
    AverageRewardEstimate, choose_action, ppo_factor, td_errors, td_errors_with_terminals,
    trajectory_advantages,
};
pub use agent::{Agent, Transition};
pub use builder::NetworkBuilder;
pub use config::{AgentConfig, Algorithm, ModelSpec};
pub use dataset::{Dataset, RecordFile};
pub use error::{Error, Result};
pub use layer::{DenseState, LayerDef, LayerKind};
pub use model::{Evaluation, Model};
pub use network::{Activations, Network, NetworkSpec, NetworkState};
pub use telemetry::{FnSink, LossyChannelSink, RecordSink, Snapshot, TelemetrySink};
pub use tensor::{Tensor, TensorMap};
pub use trainer::{
    BatchTrainer, BatchTrainerConfig, Behavior, MiniBatch, MiniBatchOutcome, TrainParams,
    run_mini_batch,
};
