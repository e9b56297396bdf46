//! Minibatch training.
//!
//! [`run_mini_batch`] is the single update step shared by the agent and the
//! out-of-core [`BatchTrainer`]. The trainer streams a recorded dataset:
//!
//! ```text
//! <root>/s0/<input>/data.bin        state before the step
//! <root>/s1/<input>/data.bin        state after the step
//! <root>/actions/<head>/data.bin    taken action index, one scalar per record
//! <root>/reward/data.bin            one scalar per record
//! <root>/terminal/data.bin          1 for terminal steps, else 0
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::advantage::ppo_factor;
use crate::config::CRITIC;
use crate::dataset::{Dataset, RecordFile};
use crate::model::{Evaluation, Model};
use crate::telemetry::{Snapshot, TelemetrySink};
use crate::{Error, Result, Tensor, TensorMap};

pub const REWARD_KEY: &str = "reward";
pub const TERMINAL_KEY: &str = "terminal";
pub const ACTIONS_KEY: &str = "actions";
pub const S0_KEY: &str = "s0";
pub const S1_KEY: &str = "s1";
pub const RESIDUAL_KEY: &str = "residual";
pub const MASKS_KEY: &str = "masks";

/// Learning rates and trace decay for one update.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainParams {
    pub lambda: f32,
    pub critic_alpha: f32,
    /// Learning rate per action head.
    pub head_alphas: BTreeMap<String, f32>,
    pub ppo_epsilon: f32,
}

/// Behaviour policy data for clipped-ratio updates.
#[derive(Debug, Clone)]
pub struct Behavior {
    /// Per head, `(records, 1)` probability of the taken action before training.
    pub probs: TensorMap,
    /// Multi-step advantages; the sign of the TD delta is used when absent.
    pub advantages: Option<Vec<f32>>,
}

#[derive(Debug, Clone)]
pub struct MiniBatch {
    pub s0: TensorMap,
    pub s1: TensorMap,
    /// Per head, `(records, values)` one-hot masks of the taken actions.
    pub masks: TensorMap,
    /// `r - a` per record.
    pub residuals: Vec<f32>,
    pub terminals: Vec<bool>,
    pub behavior: Option<Behavior>,
}

impl MiniBatch {
    pub fn len(&self) -> usize {
        self.residuals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.residuals.is_empty()
    }

    /// The records at `indices`, in that order.
    pub fn select(&self, indices: &[usize]) -> MiniBatch {
        let pick = |m: &TensorMap| -> TensorMap {
            m.iter()
                .map(|(k, t)| (k.clone(), t.select_rows(indices)))
                .collect()
        };
        MiniBatch {
            s0: pick(&self.s0),
            s1: pick(&self.s1),
            masks: pick(&self.masks),
            residuals: indices.iter().map(|&i| self.residuals[i]).collect(),
            terminals: indices.iter().map(|&i| self.terminals[i]).collect(),
            behavior: self.behavior.as_ref().map(|b| Behavior {
                probs: pick(&b.probs),
                advantages: b
                    .advantages
                    .as_ref()
                    .map(|a| indices.iter().map(|&i| a[i]).collect()),
            }),
        }
    }
}

/// What one minibatch update did.
#[derive(Debug, Clone)]
pub struct MiniBatchOutcome {
    pub deltas: Vec<f32>,
    /// Injected head gradients, critic included.
    pub grads: TensorMap,
    /// Training forward pass of `s0` the update was computed from.
    pub evaluation: Evaluation,
}

impl MiniBatchOutcome {
    pub fn mean_delta(&self) -> f32 {
        if self.deltas.is_empty() {
            return 0.0;
        }
        self.deltas.iter().sum::<f32>() / self.deltas.len() as f32
    }
}

/// One trace update over a minibatch.
///
/// `delta_i = residual_i + v(s1_i) - v(s0_i)`, or `residual_i` for terminal
/// records. The critic gradient is `alpha_critic`; an action head gets
/// `mask / pi * alpha` (TD) or `mask * ppo_factor * alpha` (with behaviour).
pub fn run_mini_batch<R: Rng + ?Sized>(
    model: &mut Model,
    batch: &MiniBatch,
    params: &TrainParams,
    rng: &mut R,
) -> Result<MiniBatchOutcome> {
    let n = batch.len();
    if batch.terminals.len() != n {
        return Err(Error::InvalidShape(format!(
            "{} terminal flags for {n} records",
            batch.terminals.len()
        )));
    }

    let eval0 = model.forward_training(&batch.s0, rng)?;
    let eval1 = model.forward(&batch.s1)?;
    let v0 = eval0.values()?;
    let v1 = eval1.values()?;
    if v0.rows() != n || v1.rows() != n {
        return Err(Error::InvalidShape(format!(
            "states have {} and {} records, expected {n}",
            v0.rows(),
            v1.rows()
        )));
    }

    let deltas: Vec<f32> = (0..n)
        .map(|i| {
            if batch.terminals[i] {
                batch.residuals[i]
            } else {
                batch.residuals[i] + v1.scalar(i) - v0.scalar(i)
            }
        })
        .collect();

    let mut grads = TensorMap::new();
    grads.insert(CRITIC.to_owned(), Tensor::filled(&[n, 1], params.critic_alpha));
    for (head, &alpha) in &params.head_alphas {
        let probs = eval0.probs(head)?;
        let Some(mask) = batch.masks.get(head) else {
            return Err(Error::InvalidData(format!("missing action mask for `{head}`")));
        };
        if mask.shape() != probs.shape() {
            return Err(Error::InvalidShape(format!(
                "mask for `{head}` has shape {:?}, expected {:?}",
                mask.shape(),
                probs.shape()
            )));
        }
        let mut g = Tensor::zeros(probs.shape());
        match &batch.behavior {
            None => {
                for ((gv, &m), &p) in g.data_mut().iter_mut().zip(mask.data()).zip(probs.data()) {
                    if m != 0.0 {
                        *gv = m / p * alpha;
                    }
                }
            }
            Some(behavior) => {
                let Some(prob0) = behavior.probs.get(head) else {
                    return Err(Error::InvalidData(format!(
                        "missing behaviour probabilities for `{head}`"
                    )));
                };
                for i in 0..n {
                    let taken: f32 = mask.row(i).iter().zip(probs.row(i)).map(|(m, p)| m * p).sum();
                    let sign = behavior.advantages.as_ref().map_or(deltas[i], |a| a[i]);
                    let factor = ppo_factor(taken, prob0.scalar(i), params.ppo_epsilon, sign);
                    for (gv, &m) in g.row_mut(i).iter_mut().zip(mask.row(i)) {
                        if m != 0.0 {
                            *gv = m * factor * alpha;
                        }
                    }
                }
            }
        }
        grads.insert(head.clone(), g);
    }

    model.train(&eval0, &grads, &deltas, params.lambda)?;
    Ok(MiniBatchOutcome {
        deltas,
        grads,
        evaluation: eval0,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchTrainerConfig {
    pub params: TrainParams,
    pub batch_size: usize,
    /// Passes over the whole dataset.
    pub num_iterations: usize,
    pub seed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrepareReport {
    pub records: u64,
    pub avg_reward: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainReport {
    /// Record-weighted mean delta of each iteration.
    pub mean_deltas: Vec<f32>,
}

#[derive(Debug)]
struct Prepared {
    s0: Dataset,
    s1: Dataset,
    masks: Dataset,
    residuals: RecordFile,
    terminals: RecordFile,
    records: u64,
}

/// Trains a model over a recorded dataset too large to load at once.
pub struct BatchTrainer {
    model: Model,
    config: BatchTrainerConfig,
    rng: StdRng,
    avg_reward: f32,
    prepared: Option<Prepared>,
    sink: Option<Box<dyn TelemetrySink>>,
}

impl BatchTrainer {
    pub fn new(model: Model, config: BatchTrainerConfig) -> Result<Self> {
        if config.batch_size == 0 || config.num_iterations == 0 {
            return Err(Error::InvalidConfig(
                "batch_size and num_iterations must be > 0".to_owned(),
            ));
        }
        for head in config.params.head_alphas.keys() {
            if model.head_size(head).is_none() {
                return Err(Error::InvalidConfig(format!("model has no action head `{head}`")));
            }
        }
        let rng = StdRng::seed_from_u64(config.seed);
        Ok(Self {
            model,
            config,
            rng,
            avg_reward: 0.0,
            prepared: None,
            sink: None,
        })
    }

    pub fn with_sink(mut self, sink: Box<dyn TelemetrySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn into_model(self) -> Model {
        self.model
    }

    pub fn avg_reward(&self) -> f32 {
        self.avg_reward
    }

    /// Derive the training files from `dataset_root` into `work_dir`:
    /// the mean reward, residual rewards `r - mean`, and one-hot masks of
    /// the taken actions.
    pub fn prepare(&mut self, dataset_root: &Path, work_dir: &Path) -> Result<PrepareReport> {
        let data = Dataset::open(dataset_root)?;
        let block = self.config.batch_size;

        let mut s0 = data.children(S0_KEY);
        let mut s1 = data.children(S1_KEY);
        for (name, ds) in [(S0_KEY, &s0), (S1_KEY, &s1)] {
            for input in self.model.input_sizes().keys() {
                if !ds.contains(input) {
                    return Err(Error::InvalidData(format!(
                        "dataset has no `{name}.{input}`"
                    )));
                }
            }
        }

        let mut rewards = RecordFile::by_key(dataset_root, REWARD_KEY);
        let mut terminals = RecordFile::by_key(dataset_root, TERMINAL_KEY);
        for file in [&rewards, &terminals] {
            if !file.exists() {
                return Err(Error::InvalidData(format!(
                    "missing {}",
                    file.path().display()
                )));
            }
        }

        let records = rewards.size()?;
        if records == 0 {
            return Err(Error::InvalidData("dataset has no records".to_owned()));
        }
        let mut sum = 0.0_f64;
        rewards.reset()?;
        while let Some(r) = rewards.read(block)? {
            sum += r.data().iter().map(|&v| f64::from(v)).sum::<f64>();
        }
        let avg_reward = (sum / records as f64) as f32;

        let mut residuals = RecordFile::create_by_key(work_dir, RESIDUAL_KEY)?;
        rewards.reset()?;
        while let Some(r) = rewards.read(block)? {
            residuals.write(&r.flatten_records().map(|v| v - avg_reward))?;
        }
        residuals.flush()?;

        let heads: Vec<String> = self.config.params.head_alphas.keys().cloned().collect();
        for head in &heads {
            let classes = self.model.head_size(head).unwrap_or(0);
            let mut actions = RecordFile::by_key(dataset_root, &format!("{ACTIONS_KEY}.{head}"));
            if !actions.exists() {
                return Err(Error::InvalidData(format!("missing actions for `{head}`")));
            }
            let mut masks = RecordFile::create_by_key(work_dir, &format!("{MASKS_KEY}.{head}"))?;
            while let Some(a) = actions.read(block)? {
                let indices = a
                    .data()
                    .iter()
                    .map(|&v| {
                        if v.fract() != 0.0 || v < 0.0 {
                            Err(Error::InvalidData(format!("bad action value {v} for `{head}`")))
                        } else {
                            Ok(v as usize)
                        }
                    })
                    .collect::<Result<Vec<_>>>()?;
                masks.write(&Tensor::one_hot(&indices, classes)?)?;
            }
            masks.flush()?;
        }

        let mask_keys: Vec<String> = heads.iter().map(|h| format!("{MASKS_KEY}.{h}")).collect();
        let mask_keys: Vec<&str> = mask_keys.iter().map(String::as_str).collect();
        let mut masks = Dataset::new()
            .add_existing(work_dir, &mask_keys)?
            .children(MASKS_KEY);

        for (name, size) in [
            (S0_KEY, s0.size()?),
            (S1_KEY, s1.size()?),
            (MASKS_KEY, masks.size()?),
            (RESIDUAL_KEY, residuals.size()?),
            (TERMINAL_KEY, terminals.size()?),
        ] {
            if size != records {
                return Err(Error::InvalidData(format!(
                    "`{name}` has {size} records, `{REWARD_KEY}` has {records}"
                )));
            }
        }

        self.avg_reward = avg_reward;
        self.prepared = Some(Prepared {
            s0,
            s1,
            masks,
            residuals,
            terminals,
            records,
        });
        info!(records, avg_reward, work_dir = %work_dir.display(), "dataset prepared");
        Ok(PrepareReport {
            records,
            avg_reward,
        })
    }

    /// Run the configured iterations over the prepared dataset, replaying
    /// minibatch blocks in a fresh random order each iteration.
    pub fn train(&mut self) -> Result<TrainReport> {
        let Some(prepared) = self.prepared.as_mut() else {
            return Err(Error::InvalidConfig("call prepare before train".to_owned()));
        };
        let block = self.config.batch_size;
        let mut blocks: Vec<u64> = (0..prepared.records).step_by(block).collect();
        let mut mean_deltas = Vec::with_capacity(self.config.num_iterations);

        for iteration in 0..self.config.num_iterations {
            blocks.shuffle(&mut self.rng);
            let mut sum = 0.0_f64;
            let mut count = 0usize;
            for &start in &blocks {
                let batch = read_block(prepared, start, block)?;
                let outcome =
                    run_mini_batch(&mut self.model, &batch, &self.config.params, &mut self.rng)?;
                sum += outcome.deltas.iter().map(|&d| f64::from(d)).sum::<f64>();
                count += outcome.deltas.len();
                debug!(iteration, start, mean_delta = outcome.mean_delta(), "minibatch trained");
            }
            let mean = if count == 0 { 0.0 } else { (sum / count as f64) as f32 };
            info!(iteration, records = count, mean_delta = mean, "iteration trained");
            if let Some(sink) = self.sink.as_mut() {
                let mut snapshot = Snapshot::new(iteration as u64);
                snapshot.insert_scalar("delta", mean);
                snapshot.insert_scalar("avg_reward", self.avg_reward);
                sink.publish(&snapshot)?;
            }
            mean_deltas.push(mean);
        }
        Ok(TrainReport { mean_deltas })
    }
}

fn read_block(p: &mut Prepared, start: u64, len: usize) -> Result<MiniBatch> {
    p.s0.seek(start)?;
    p.s1.seek(start)?;
    p.masks.seek(start)?;
    p.residuals.seek(start)?;
    p.terminals.seek(start)?;
    let ended = |what: &str| Error::InvalidData(format!("`{what}` ended at record {start}"));
    let s0 = p.s0.read(len)?.ok_or_else(|| ended(S0_KEY))?;
    let s1 = p.s1.read(len)?.ok_or_else(|| ended(S1_KEY))?;
    let masks = p.masks.read(len)?.ok_or_else(|| ended(MASKS_KEY))?;
    let residuals = p.residuals.read(len)?.ok_or_else(|| ended(RESIDUAL_KEY))?;
    let terminals = p.terminals.read(len)?.ok_or_else(|| ended(TERMINAL_KEY))?;
    Ok(MiniBatch {
        s0,
        s1,
        masks,
        residuals: residuals.into_data(),
        terminals: terminals.data().iter().map(|&t| t != 0.0).collect(),
        behavior: None,
    })
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;
    use crate::builder::NetworkBuilder;
    use crate::layer::LayerKind;

    fn single_model() -> Model {
        let (network, state) = NetworkBuilder::new()
            .input("x", 2)
            .unwrap()
            .dense("critic", 1, "x")
            .unwrap()
            .dense("logits", 2, "x")
            .unwrap()
            .layer("move", LayerKind::softmax(1.0), &["logits"])
            .unwrap()
            .build_with_seed(4)
            .unwrap();
        Model::Single { network, state }
    }

    fn params() -> TrainParams {
        TrainParams {
            lambda: 0.0,
            critic_alpha: 0.1,
            head_alphas: BTreeMap::from([("move".to_owned(), 0.1)]),
            ppo_epsilon: 0.2,
        }
    }

    fn batch(terminal: bool) -> MiniBatch {
        let x = |a: f32, b: f32| Tensor::matrix(1, 2, vec![a, b]).unwrap();
        MiniBatch {
            s0: TensorMap::from([("x".to_owned(), x(1.0, 0.0))]),
            s1: TensorMap::from([("x".to_owned(), x(0.0, 1.0))]),
            masks: TensorMap::from([("move".to_owned(), Tensor::one_hot(&[1], 2).unwrap())]),
            residuals: vec![0.5],
            terminals: vec![terminal],
            behavior: None,
        }
    }

    #[test]
    fn delta_bootstraps_unless_terminal() {
        let mut rng = StdRng::seed_from_u64(0);
        let model = single_model();
        let v = |s: &TensorMap| model.forward(s).unwrap().values().unwrap().scalar(0);
        let b = batch(false);
        let expected = 0.5 + v(&b.s1) - v(&b.s0);

        let mut m = model.clone();
        let out = run_mini_batch(&mut m, &b, &params(), &mut rng).unwrap();
        assert!((out.deltas[0] - expected).abs() < 1e-6);

        let mut m = model.clone();
        let out = run_mini_batch(&mut m, &batch(true), &params(), &mut rng).unwrap();
        assert_eq!(out.deltas, vec![0.5]);
    }

    #[test]
    fn td_head_gradient_is_mask_over_prob() {
        let mut rng = StdRng::seed_from_u64(0);
        let model = single_model();
        let b = batch(false);
        let p = model.forward(&b.s0).unwrap().probs("move").unwrap().clone();
        let mut m = model.clone();
        let out = run_mini_batch(&mut m, &b, &params(), &mut rng).unwrap();
        let g = &out.grads["move"];
        assert_eq!(g.data()[0], 0.0);
        assert!((g.data()[1] - 0.1 / p.data()[1]).abs() < 1e-5);
        assert_eq!(out.grads[CRITIC].data(), &[0.1]);
    }

    #[test]
    fn ppo_head_gradient_is_zeroed_outside_clip() {
        let mut rng = StdRng::seed_from_u64(0);
        let model = single_model();
        let mut b = batch(false);
        let p = model.forward(&b.s0).unwrap().probs("move").unwrap().data()[1];
        // Behaviour probability far below the current one: ratio > 1 + eps.
        b.behavior = Some(Behavior {
            probs: TensorMap::from([("move".to_owned(), Tensor::column(vec![p / 2.0]))]),
            advantages: Some(vec![1.0]),
        });
        let mut m = model.clone();
        let out = run_mini_batch(&mut m, &b, &params(), &mut rng).unwrap();
        assert_eq!(out.grads["move"].data(), &[0.0, 0.0]);

        b.behavior = Some(Behavior {
            probs: TensorMap::from([("move".to_owned(), Tensor::column(vec![p]))]),
            advantages: Some(vec![1.0]),
        });
        let mut m = model.clone();
        let out = run_mini_batch(&mut m, &b, &params(), &mut rng).unwrap();
        assert!((out.grads["move"].data()[1] - 0.1 / p).abs() < 1e-5);
    }

    #[test]
    fn ppo_untaken_actions_stay_zero_with_zero_behaviour_prob() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut b = batch(false);
        b.behavior = Some(Behavior {
            probs: TensorMap::from([("move".to_owned(), Tensor::column(vec![0.0]))]),
            advantages: Some(vec![-1.0]),
        });
        let mut m = single_model();
        let out = run_mini_batch(&mut m, &b, &params(), &mut rng).unwrap();
        assert_eq!(out.grads["move"].data()[0], 0.0);
    }

    #[test]
    fn missing_mask_is_an_error() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut m = single_model();
        let mut b = batch(false);
        b.masks.clear();
        assert!(run_mini_batch(&mut m, &b, &params(), &mut rng).is_err());
    }

    #[test]
    fn select_keeps_records_aligned() {
        let mut b = batch(false);
        let xs = Tensor::matrix(2, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        b.s0.insert("x".to_owned(), xs.clone());
        b.s1.insert("x".to_owned(), xs);
        b.masks.insert("move".to_owned(), Tensor::one_hot(&[0, 1], 2).unwrap());
        b.residuals = vec![0.1, 0.2];
        b.terminals = vec![false, true];
        let picked = b.select(&[1]);
        assert_eq!(picked.s0["x"].data(), &[3.0, 4.0]);
        assert_eq!(picked.masks["move"].data(), &[0.0, 1.0]);
        assert_eq!(picked.residuals, vec![0.2]);
        assert_eq!(picked.terminals, vec![true]);
    }
}
