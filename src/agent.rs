//! Actor-critic agent.
//!
//! The agent owns its model, hyperparameters and the running average reward.
//! With [`Algorithm::OnlineTd`] every observed transition is trained on
//! immediately; the batch algorithms buffer a trajectory of `num_steps`
//! transitions and train `num_epochs` passes of shuffled minibatches over it.

use std::collections::BTreeMap;
use std::path::Path;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::advantage::{choose_action, td_errors_with_terminals, trajectory_advantages};
use crate::config::{AgentConfig, Algorithm};
use crate::model::Model;
use crate::persist;
use crate::telemetry::{Snapshot, TelemetrySink};
use crate::trainer::{Behavior, MiniBatch, MiniBatchOutcome, TrainParams, run_mini_batch};
use crate::{Error, Result, Tensor, TensorMap};

/// One environment step.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub s0: TensorMap,
    /// Taken value index per action head.
    pub actions: BTreeMap<String, usize>,
    pub reward: f32,
    pub s1: TensorMap,
    pub terminal: bool,
}

pub struct Agent {
    config: AgentConfig,
    model: Model,
    avg_reward: f32,
    trajectory: Vec<Transition>,
    rng: StdRng,
    train_calls: u64,
    sink: Option<Box<dyn TelemetrySink>>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("algorithm", &self.config.algorithm)
            .field("avg_reward", &self.avg_reward)
            .field("buffered", &self.trajectory.len())
            .field("train_calls", &self.train_calls)
            .finish_non_exhaustive()
    }
}

impl Agent {
    /// Validate `config` and build a freshly initialized model.
    pub fn new(config: AgentConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let model = Model::from_spec(&config.model, &config.actions, &mut rng)?;
        Ok(Self {
            config,
            model,
            avg_reward: 0.0,
            trajectory: Vec::new(),
            rng,
            train_calls: 0,
            sink: None,
        })
    }

    /// Reassemble an agent from a model built for `config`.
    pub fn from_parts(config: AgentConfig, model: Model, avg_reward: f32) -> Result<Self> {
        let mut agent = Self::new(config)?;
        {
            let expected = agent.model.networks();
            let given = model.networks();
            if expected.len() != given.len() {
                return Err(Error::InvalidConfig(format!(
                    "model has {} networks, config describes {}",
                    given.len(),
                    expected.len()
                )));
            }
            for ((_, net, _), (_, _, state)) in expected.iter().zip(&given) {
                net.validate_state(state)?;
            }
        }
        agent.model = model;
        agent.avg_reward = avg_reward;
        Ok(agent)
    }

    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        persist::load_agent(dir.as_ref())
    }

    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        persist::save_agent(self, dir.as_ref())
    }

    pub fn set_sink(&mut self, sink: Box<dyn TelemetrySink>) {
        self.sink = Some(sink);
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut Model {
        &mut self.model
    }

    pub fn into_model(self) -> Model {
        self.model
    }

    pub fn avg_reward(&self) -> f32 {
        self.avg_reward
    }

    /// Transitions buffered for the next batch update.
    pub fn trajectory(&self) -> &[Transition] {
        &self.trajectory
    }

    /// Clear traces and the trajectory buffer.
    pub fn reset(&mut self) {
        self.model.reset_traces();
        self.trajectory.clear();
    }

    fn params(&self) -> TrainParams {
        TrainParams {
            lambda: self.config.lambda,
            critic_alpha: self.config.critic_alpha(),
            head_alphas: self.config.head_alphas(),
            ppo_epsilon: self.config.ppo_epsilon,
        }
    }

    /// Sample one value per action head from the inference policy.
    pub fn act(&mut self, state: &TensorMap) -> Result<BTreeMap<String, usize>> {
        let inputs = self.stack_states(std::slice::from_ref(&state))?;
        let eval = self.model.forward(&inputs)?;
        let mut actions = BTreeMap::new();
        for head in self.config.actions.keys() {
            let probs = eval.probs(head)?;
            let u: f32 = self.rng.random();
            actions.insert(head.clone(), choose_action(probs.row(0), u));
        }
        Ok(actions)
    }

    /// Feed one transition: train on it now, or buffer it for a batch update.
    pub fn observe(&mut self, transition: Transition) -> Result<()> {
        if self.config.algorithm.is_batch() {
            self.trajectory.push(transition);
            if self.trajectory.len() >= self.config.num_steps {
                let trajectory = std::mem::take(&mut self.trajectory);
                if let Err(e) = self.train_by_trajectory(&trajectory) {
                    self.trajectory = trajectory;
                    return Err(e);
                }
            }
            return Ok(());
        }

        let mut batch = self.batch(std::slice::from_ref(&transition))?;
        batch.residuals[0] = transition.reward - self.avg_reward;
        let params = self.params();
        let outcome = run_mini_batch(&mut self.model, &batch, &params, &mut self.rng)?;
        let delta = outcome.deltas[0];
        self.avg_reward += delta * self.config.reward_alpha;
        debug!(delta, avg_reward = self.avg_reward, "online step trained");
        self.publish(&batch, &[transition.reward], &outcome)?;
        self.after_train()
    }

    /// Batch update over a whole trajectory; returns the mean delta.
    ///
    /// The TD errors, baselines and (for PPO) behaviour probabilities and
    /// advantages are computed once up front; each epoch then replays the
    /// trajectory in shuffled minibatches. The running baseline ends at the
    /// value reached after the last transition.
    pub fn train_by_trajectory(&mut self, trajectory: &[Transition]) -> Result<f32> {
        let n = trajectory.len();
        if n == 0 {
            return Ok(0.0);
        }
        let inputs = self.model.input_sizes();
        for (t, pair) in trajectory.windows(2).enumerate() {
            // An episode may restart anywhere after a terminal step.
            if pair[0].terminal {
                continue;
            }
            for key in inputs.keys() {
                if pair[0].s1.get(key) != pair[1].s0.get(key) {
                    return Err(Error::InvalidData(format!(
                        "transition {t} does not continue into {}: `{key}` differs",
                        t + 1
                    )));
                }
            }
        }

        let mut batch = self.batch(trajectory)?;
        let eval = self.model.forward(&batch.s0)?;
        let last = self.stack_states(&[&trajectory[n - 1].s1])?;
        let v_last = self.model.forward(&last)?.values()?.scalar(0);
        let mut values: Vec<f32> = eval.values()?.data().to_vec();
        values.push(v_last);

        let rewards: Vec<f32> = trajectory.iter().map(|t| t.reward).collect();
        let estimate = td_errors_with_terminals(
            &rewards,
            &values,
            &batch.terminals,
            self.avg_reward,
            self.config.reward_alpha,
        )?;
        batch.residuals = rewards
            .iter()
            .zip(&estimate.avg_rewards)
            .map(|(r, a)| r - a)
            .collect();

        if self.config.algorithm == Algorithm::Ppo {
            let mut probs = TensorMap::new();
            for head in self.config.actions.keys() {
                let p = eval.probs(head)?;
                let mask = &batch.masks[head];
                let taken = (0..n)
                    .map(|i| mask.row(i).iter().zip(p.row(i)).map(|(m, p)| m * p).sum::<f32>())
                    .collect();
                probs.insert(head.clone(), Tensor::column(taken));
            }
            let advantages = trajectory_advantages(&rewards, &estimate.avg_rewards, &values)?;
            batch.behavior = Some(Behavior {
                probs,
                advantages: Some(advantages),
            });
        }

        let params = self.params();
        let mut indices: Vec<usize> = (0..n).collect();
        let mut sum = 0.0_f32;
        let mut count = 0usize;
        for epoch in 0..self.config.num_epochs {
            indices.shuffle(&mut self.rng);
            for chunk in indices.chunks(self.config.batch_size) {
                let mini = batch.select(chunk);
                let outcome = run_mini_batch(&mut self.model, &mini, &params, &mut self.rng)?;
                sum += outcome.deltas.iter().sum::<f32>();
                count += outcome.deltas.len();
                let chunk_rewards: Vec<f32> = chunk.iter().map(|&i| rewards[i]).collect();
                self.publish(&mini, &chunk_rewards, &outcome)?;
            }
            debug!(epoch, "trajectory epoch trained");
        }

        self.avg_reward = estimate.final_avg_reward;
        let mean = sum / count.max(1) as f32;
        info!(
            steps = n,
            epochs = self.config.num_epochs,
            mean_delta = mean,
            avg_reward = self.avg_reward,
            "trajectory trained"
        );
        self.after_train()?;
        Ok(mean)
    }

    /// Stack single observations into one batch per model input.
    fn stack_states(&self, states: &[&TensorMap]) -> Result<TensorMap> {
        let mut out = TensorMap::new();
        for key in self.model.input_sizes().keys() {
            let parts = states
                .iter()
                .map(|s| {
                    s.get(key)
                        .ok_or_else(|| Error::InvalidData(format!("state has no input `{key}`")))
                })
                .collect::<Result<Vec<_>>>()?;
            out.insert(key.clone(), Tensor::stack_flat(&parts)?);
        }
        Ok(out)
    }

    /// Minibatch of `transitions` with residuals left at zero.
    fn batch(&self, transitions: &[Transition]) -> Result<MiniBatch> {
        let s0: Vec<&TensorMap> = transitions.iter().map(|t| &t.s0).collect();
        let s1: Vec<&TensorMap> = transitions.iter().map(|t| &t.s1).collect();
        let mut masks = TensorMap::new();
        for (head, &values) in &self.config.actions {
            let indices = transitions
                .iter()
                .map(|t| {
                    t.actions
                        .get(head)
                        .copied()
                        .ok_or_else(|| Error::InvalidData(format!("transition has no action `{head}`")))
                })
                .collect::<Result<Vec<_>>>()?;
            masks.insert(head.clone(), Tensor::one_hot(&indices, values)?);
        }
        Ok(MiniBatch {
            s0: self.stack_states(&s0)?,
            s1: self.stack_states(&s1)?,
            masks,
            residuals: vec![0.0; transitions.len()],
            terminals: transitions.iter().map(|t| t.terminal).collect(),
            behavior: None,
        })
    }

    fn publish(&mut self, batch: &MiniBatch, rewards: &[f32], outcome: &MiniBatchOutcome) -> Result<()> {
        if self.sink.is_none() {
            return Ok(());
        }
        let trained = self.model.forward(&batch.s0)?;
        let mut snapshot = Snapshot::new(self.train_calls);
        snapshot.insert_prefixed("s0", &batch.s0);
        snapshot.insert_prefixed("actions", &batch.masks);
        snapshot.insert("reward", Tensor::column(rewards.to_vec()));
        snapshot.insert("delta", Tensor::column(outcome.deltas.clone()));
        snapshot.insert_scalar("avg_reward", self.avg_reward);
        snapshot.insert_prefixed("training_layers", &outcome.evaluation.layer_values());
        snapshot.insert_prefixed("trained_layers", &trained.layer_values());
        snapshot.insert_prefixed("grads", &outcome.grads);
        snapshot.insert_prefixed("dropout_masks", &outcome.evaluation.masks());
        if let Some(sink) = self.sink.as_mut() {
            sink.publish(&snapshot)?;
        }
        Ok(())
    }

    fn after_train(&mut self) -> Result<()> {
        self.train_calls += 1;
        if let (Some(path), Some(interval)) =
            (&self.config.model_path, self.config.saving_interval_steps)
            && self.train_calls % interval == 0
        {
            info!(path = %path.display(), train_calls = self.train_calls, "autosaving agent");
            self.save(path)?;
        }
        Ok(())
    }
}
