//! Named DAG network with eligibility-trace training.
//!
//! `Network` is the immutable topology: layer definitions, external input
//! sizes, a topological order computed once, and the consumers of every node.
//! Parameters and traces live in a separate [`NetworkState`] so a topology can
//! be shared while its state is owned and mutated by one agent.
//!
//! `forward` never touches traces. `train` walks the graph backwards from the
//! injected head gradients, sums gradients flowing into shared nodes, and
//! updates the parameters and traces of exactly the dense layers it reaches.

use std::collections::{BTreeMap, BTreeSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::layer::{
    DenseState, LayerDef, LayerKind, dense_forward, dense_train, dropout_mask,
    stateless_backward, stateless_forward,
};
use crate::{Error, Result, Tensor, TensorMap};

/// Serializable description of a network: external inputs and layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSpec {
    /// External input name -> feature count.
    pub inputs: BTreeMap<String, usize>,
    pub layers: Vec<LayerDef>,
}

/// Parameters and eligibility traces of every dense layer, by layer name.
pub type NetworkState = BTreeMap<String, DenseState>;

/// Result of a forward pass.
#[derive(Debug, Clone, Default)]
pub struct Activations {
    /// Output of every layer plus the external inputs, by name.
    pub values: TensorMap,
    /// Dropout masks applied to dense inputs, by dense layer name.
    pub masks: TensorMap,
}

impl Activations {
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.values.get(name)
    }

    /// Number of records in the batch.
    pub fn rows(&self) -> usize {
        self.values.values().next().map_or(0, Tensor::rows)
    }
}

#[derive(Debug, Clone)]
pub struct Network {
    spec: NetworkSpec,
    index: BTreeMap<String, usize>,
    order: Vec<usize>,
    sizes: BTreeMap<String, usize>,
    consumers: BTreeMap<String, Vec<String>>,
}

impl Network {
    pub fn new(layers: Vec<LayerDef>, inputs: BTreeMap<String, usize>) -> Result<Self> {
        Self::from_spec(NetworkSpec { inputs, layers })
    }

    pub fn from_spec(spec: NetworkSpec) -> Result<Self> {
        for (name, &size) in &spec.inputs {
            if size == 0 {
                return Err(Error::InvalidConfig(format!("input `{name}` size must be > 0")));
            }
        }

        let mut index = BTreeMap::new();
        for (i, def) in spec.layers.iter().enumerate() {
            if spec.inputs.contains_key(&def.name) || index.insert(def.name.clone(), i).is_some() {
                return Err(Error::DuplicateName(def.name.clone()));
            }
            def.kind.validate(&def.name)?;
        }

        for def in &spec.layers {
            for input in &def.inputs {
                if !index.contains_key(input) && !spec.inputs.contains_key(input) {
                    return Err(Error::UnresolvedInput {
                        layer: def.name.clone(),
                        input: input.clone(),
                    });
                }
            }
        }

        let order = topological_order(&spec.layers, &index)?;

        let mut sizes = spec.inputs.clone();
        for &i in &order {
            let def = &spec.layers[i];
            let input_sizes: Vec<usize> = def.inputs.iter().map(|n| sizes[n]).collect();
            let size = def.kind.output_size(&def.name, &input_sizes)?;
            sizes.insert(def.name.clone(), size);
        }

        let mut consumers: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for def in &spec.layers {
            for input in &def.inputs {
                let list = consumers.entry(input.clone()).or_default();
                if !list.contains(&def.name) {
                    list.push(def.name.clone());
                }
            }
        }

        Ok(Self {
            spec,
            index,
            order,
            sizes,
            consumers,
        })
    }

    pub fn spec(&self) -> &NetworkSpec {
        &self.spec
    }

    pub fn input_sizes(&self) -> &BTreeMap<String, usize> {
        &self.spec.inputs
    }

    pub fn layer(&self, name: &str) -> Option<&LayerDef> {
        self.index.get(name).map(|&i| &self.spec.layers[i])
    }

    pub fn contains_layer(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Output width of a layer or external input.
    pub fn size(&self, name: &str) -> Option<usize> {
        self.sizes.get(name).copied()
    }

    /// Layer names in evaluation order.
    pub fn order(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|&i| self.spec.layers[i].name.as_str())
    }

    /// Layers reading the output of `name`.
    pub fn consumers(&self, name: &str) -> &[String] {
        self.consumers.get(name).map_or(&[], Vec::as_slice)
    }

    fn dense_layers(&self) -> impl Iterator<Item = (&LayerDef, usize)> {
        self.spec
            .layers
            .iter()
            .filter(|def| def.kind.is_trainable())
            .map(|def| (def, self.sizes[&def.inputs[0]]))
    }

    pub fn init_state_with_seed(&self, seed: u64) -> NetworkState {
        let mut rng = StdRng::seed_from_u64(seed);
        self.init_state(&mut rng)
    }

    /// Xavier-initialized parameters with zero traces.
    pub fn init_state<R: Rng + ?Sized>(&self, rng: &mut R) -> NetworkState {
        self.dense_layers()
            .map(|(def, n_in)| {
                (
                    def.name.clone(),
                    DenseState::xavier(n_in, self.sizes[&def.name], rng),
                )
            })
            .collect()
    }

    pub fn zero_state(&self) -> NetworkState {
        self.dense_layers()
            .map(|(def, n_in)| {
                (
                    def.name.clone(),
                    DenseState::zeros(n_in, self.sizes[&def.name]),
                )
            })
            .collect()
    }

    /// Check that `state` holds correctly shaped parameters for every dense layer.
    pub fn validate_state(&self, state: &NetworkState) -> Result<()> {
        for (def, n_in) in self.dense_layers() {
            let Some(dense) = state.get(&def.name) else {
                return Err(Error::InvalidData(format!(
                    "missing parameters for layer `{}`",
                    def.name
                )));
            };
            let n_out = self.sizes[&def.name];
            if dense.weights.shape() != [n_in, n_out]
                || dense.bias.shape() != [1, n_out]
                || dense.weights_trace.shape() != dense.weights.shape()
                || dense.bias_trace.shape() != dense.bias.shape()
            {
                return Err(Error::ShapeMismatch {
                    layer: def.name.clone(),
                    msg: format!(
                        "expected weights [{n_in}, {n_out}], got {:?}",
                        dense.weights.shape()
                    ),
                });
            }
        }
        Ok(())
    }

    pub fn reset_traces(&self, state: &mut NetworkState) {
        for dense in state.values_mut() {
            dense.reset_traces();
        }
    }

    /// Inference forward pass; dropout is disabled.
    pub fn forward(&self, state: &NetworkState, inputs: &TensorMap) -> Result<Activations> {
        self.forward_impl::<StdRng>(state, inputs, None)
    }

    /// Training forward pass; dense layers with a dropout rate sample masks.
    pub fn forward_training<R: Rng + ?Sized>(
        &self,
        state: &NetworkState,
        inputs: &TensorMap,
        rng: &mut R,
    ) -> Result<Activations> {
        self.forward_impl(state, inputs, Some(rng))
    }

    fn forward_impl<R: Rng + ?Sized>(
        &self,
        state: &NetworkState,
        inputs: &TensorMap,
        mut rng: Option<&mut R>,
    ) -> Result<Activations> {
        let mut acts = Activations::default();
        let mut rows = None;
        for (name, &size) in &self.spec.inputs {
            let Some(x) = inputs.get(name) else {
                return Err(Error::InvalidData(format!("missing input `{name}`")));
            };
            let x = x.flatten_records();
            if x.record_len() != size {
                return Err(Error::InvalidShape(format!(
                    "input `{name}` has {} features, expected {size}",
                    x.record_len()
                )));
            }
            match rows {
                None => rows = Some(x.rows()),
                Some(r) if r != x.rows() => {
                    return Err(Error::InvalidShape(format!(
                        "input `{name}` has {} records, expected {r}",
                        x.rows()
                    )));
                }
                Some(_) => {}
            }
            acts.values.insert(name.clone(), x);
        }

        for &i in &self.order {
            let def = &self.spec.layers[i];
            let y = match def.kind {
                LayerKind::Dense { dropout, .. } => {
                    let dense = state.get(&def.name).ok_or_else(|| {
                        Error::InvalidData(format!("missing parameters for layer `{}`", def.name))
                    })?;
                    let x = &acts.values[&def.inputs[0]];
                    let mask = match rng.as_deref_mut() {
                        Some(rng) if dropout > 0.0 => Some(dropout_mask(x.shape(), dropout, rng)),
                        _ => None,
                    };
                    let y = dense_forward(dense, x, mask.as_ref());
                    if let Some(mask) = mask {
                        acts.masks.insert(def.name.clone(), mask);
                    }
                    y
                }
                _ => {
                    let xs: Vec<&Tensor> = def.inputs.iter().map(|n| &acts.values[n]).collect();
                    stateless_forward(&def.kind, &xs)?
                }
            };
            acts.values.insert(def.name.clone(), y);
        }
        Ok(acts)
    }

    /// Trace update driven by gradients injected at one or more layers.
    ///
    /// `grads` maps layer names to `(records, size)` output gradients with the
    /// learning rate already folded in; `delta` holds the scalar error signal
    /// of each record. Returns the gradients reaching the external inputs.
    pub fn train(
        &self,
        state: &mut NetworkState,
        acts: &Activations,
        grads: &TensorMap,
        delta: &[f32],
        lambda: f32,
    ) -> Result<TensorMap> {
        let rows = acts.rows();
        if delta.len() != rows {
            return Err(Error::InvalidShape(format!(
                "delta has {} values for {rows} records",
                delta.len()
            )));
        }
        for (name, grad) in grads {
            let Some(size) = self.index.get(name).map(|_| self.sizes[name]) else {
                return Err(Error::InvalidData(format!("gradient for unknown layer `{name}`")));
            };
            if grad.shape() != [rows, size] {
                return Err(Error::InvalidShape(format!(
                    "gradient for `{name}` has shape {:?}, expected [{rows}, {size}]",
                    grad.shape()
                )));
            }
        }

        let mut pending: TensorMap = grads.clone();
        let mut input_grads = TensorMap::new();
        for &i in self.order.iter().rev() {
            let def = &self.spec.layers[i];
            let Some(grad) = pending.remove(&def.name) else {
                continue;
            };
            let produced = match def.kind {
                LayerKind::Dense { max_abs_weight, .. } => {
                    let dense = state.get_mut(&def.name).ok_or_else(|| {
                        Error::InvalidData(format!("missing parameters for layer `{}`", def.name))
                    })?;
                    let x = &acts.values[&def.inputs[0]];
                    let mask = acts.masks.get(&def.name);
                    vec![dense_train(dense, max_abs_weight, x, mask, &grad, delta, lambda)]
                }
                _ => {
                    let xs: Vec<&Tensor> = def.inputs.iter().map(|n| &acts.values[n]).collect();
                    stateless_backward(&def.kind, &xs, &acts.values[&def.name], &grad)
                }
            };
            for (input, g) in def.inputs.iter().zip(produced) {
                let target = if self.index.contains_key(input) {
                    &mut pending
                } else {
                    &mut input_grads
                };
                match target.get_mut(input) {
                    Some(acc) => acc.add_assign(&g),
                    None => {
                        target.insert(input.clone(), g);
                    }
                }
            }
        }
        Ok(input_grads)
    }

    /// Single-head form of [`Network::train`].
    pub fn backward(
        &self,
        state: &mut NetworkState,
        acts: &Activations,
        layer: &str,
        grad: Tensor,
        delta: &[f32],
        lambda: f32,
    ) -> Result<TensorMap> {
        let grads = TensorMap::from([(layer.to_owned(), grad)]);
        self.train(state, acts, &grads, delta, lambda)
    }
}

/// Kahn's algorithm; ties are broken by declaration order.
fn topological_order(layers: &[LayerDef], index: &BTreeMap<String, usize>) -> Result<Vec<usize>> {
    let mut pending: Vec<usize> = layers
        .iter()
        .map(|def| def.inputs.iter().filter(|n| index.contains_key(*n)).count())
        .collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); layers.len()];
    for (i, def) in layers.iter().enumerate() {
        for input in &def.inputs {
            if let Some(&j) = index.get(input) {
                dependents[j].push(i);
            }
        }
    }

    let mut ready: BTreeSet<usize> = (0..layers.len()).filter(|&i| pending[i] == 0).collect();
    let mut order = Vec::with_capacity(layers.len());
    while let Some(i) = ready.pop_first() {
        order.push(i);
        for &j in &dependents[i] {
            pending[j] -= 1;
            if pending[j] == 0 {
                ready.insert(j);
            }
        }
    }

    if order.len() != layers.len() {
        let stuck = (0..layers.len()).find(|i| pending[*i] > 0).unwrap_or(0);
        return Err(Error::Cycle(layers[stuck].name.clone()));
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(analytic: f32, numeric: f32, abs_tol: f32, rel_tol: f32) {
        let diff = (analytic - numeric).abs();
        let scale = analytic.abs().max(numeric.abs()).max(1.0);
        assert!(
            diff <= abs_tol || diff / scale <= rel_tol,
            "analytic={analytic} numeric={numeric} diff={diff}"
        );
    }

    fn inputs(pairs: &[(&str, usize)]) -> BTreeMap<String, usize> {
        pairs.iter().map(|(n, s)| ((*n).to_owned(), *s)).collect()
    }

    fn feed(name: &str, rows: usize, data: Vec<f32>) -> TensorMap {
        let cols = data.len() / rows;
        TensorMap::from([(name.to_owned(), Tensor::matrix(rows, cols, data).unwrap())])
    }

    fn two_head_net() -> Network {
        Network::new(
            vec![
                LayerDef::new("hidden", LayerKind::dense(3), &["x"]),
                LayerDef::new("act", LayerKind::Tanh, &["hidden"]),
                LayerDef::new("critic", LayerKind::dense(1), &["act"]),
                LayerDef::new("logits", LayerKind::dense(2), &["act"]),
                LayerDef::new("policy", LayerKind::softmax(1.0), &["logits"]),
                LayerDef::new("side", LayerKind::dense(2), &["x"]),
            ],
            inputs(&[("x", 2)]),
        )
        .unwrap()
    }

    #[test]
    fn rejects_duplicate_names() {
        let err = Network::new(
            vec![
                LayerDef::new("a", LayerKind::Tanh, &["x"]),
                LayerDef::new("a", LayerKind::Relu, &["x"]),
            ],
            inputs(&[("x", 1)]),
        )
        .unwrap_err();
        assert!(matches!(err, Error::DuplicateName(n) if n == "a"));
    }

    #[test]
    fn rejects_unresolved_inputs() {
        let err = Network::new(
            vec![LayerDef::new("a", LayerKind::Tanh, &["nope"])],
            inputs(&[("x", 1)]),
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnresolvedInput { layer, input } if layer == "a" && input == "nope"));
    }

    #[test]
    fn rejects_cycles() {
        let err = Network::new(
            vec![
                LayerDef::new("a", LayerKind::Sum, &["x", "b"]),
                LayerDef::new("b", LayerKind::Tanh, &["a"]),
            ],
            inputs(&[("x", 1)]),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Cycle(_)));
    }

    #[test]
    fn rejects_sum_of_different_sizes() {
        let err = Network::new(
            vec![
                LayerDef::new("h", LayerKind::dense(3), &["x"]),
                LayerDef::new("s", LayerKind::Sum, &["x", "h"]),
            ],
            inputs(&[("x", 2)]),
        )
        .unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { layer, .. } if layer == "s"));
    }

    #[test]
    fn order_respects_dependencies_not_declaration() {
        let net = Network::new(
            vec![
                LayerDef::new("out", LayerKind::Tanh, &["mid"]),
                LayerDef::new("mid", LayerKind::Concat, &["x", "y"]),
            ],
            inputs(&[("x", 1), ("y", 2)]),
        )
        .unwrap();
        assert_eq!(net.order().collect::<Vec<_>>(), vec!["mid", "out"]);
        assert_eq!(net.size("mid"), Some(3));
        assert_eq!(net.consumers("x"), &["mid".to_owned()]);
    }

    #[test]
    fn forward_sum_and_concat() {
        let net = Network::new(
            vec![
                LayerDef::new("s", LayerKind::Sum, &["x", "x"]),
                LayerDef::new("c", LayerKind::Concat, &["x", "s"]),
            ],
            inputs(&[("x", 2)]),
        )
        .unwrap();
        let acts = net
            .forward(&net.zero_state(), &feed("x", 1, vec![1.0, 2.0]))
            .unwrap();
        assert_eq!(acts.get("s").unwrap().data(), &[2.0, 4.0]);
        assert_eq!(acts.get("c").unwrap().data(), &[1.0, 2.0, 2.0, 4.0]);
    }

    #[test]
    fn forward_rejects_bad_inputs() {
        let net = two_head_net();
        let state = net.init_state_with_seed(0);
        assert!(net.forward(&state, &TensorMap::new()).is_err());
        assert!(net.forward(&state, &feed("x", 1, vec![1.0, 2.0, 3.0])).is_err());
    }

    #[test]
    fn softmax_head_sums_to_one() {
        let net = two_head_net();
        let state = net.init_state_with_seed(3);
        let acts = net
            .forward(&state, &feed("x", 2, vec![0.5, -0.5, 1.0, 2.0]))
            .unwrap();
        let p = acts.get("policy").unwrap();
        for i in 0..2 {
            assert_close(p.row(i).iter().sum(), 1.0, 1e-6, 0.0);
        }
    }

    #[test]
    fn train_only_touches_reached_layers() {
        let net = two_head_net();
        let mut state = net.init_state_with_seed(1);
        let before = state.clone();
        let acts = net.forward(&state, &feed("x", 1, vec![0.3, -0.7])).unwrap();
        let grads = TensorMap::from([("critic".to_owned(), Tensor::matrix(1, 1, vec![1.0]).unwrap())]);
        net.train(&mut state, &acts, &grads, &[0.5], 0.9).unwrap();

        assert_eq!(state["side"], before["side"]);
        assert_eq!(state["logits"], before["logits"]);
        assert_ne!(state["critic"], before["critic"]);
        assert_ne!(state["hidden"], before["hidden"]);
    }

    #[test]
    fn input_gradient_matches_numeric() {
        let net = two_head_net();
        let mut state = net.init_state_with_seed(11);
        let x = vec![0.4_f32, -0.25];
        let g_critic = 0.7_f32;
        let g_policy = [1.0_f32, -0.5];

        let objective = |state: &NetworkState, x: &[f32]| -> f32 {
            let acts = net.forward(state, &feed("x", 1, x.to_vec())).unwrap();
            let v = acts.get("critic").unwrap().data()[0];
            let p = acts.get("policy").unwrap().data();
            g_critic * v + g_policy[0] * p[0] + g_policy[1] * p[1]
        };

        let eps = 1e-2_f32;
        let mut numeric = [0.0_f32; 2];
        for k in 0..2 {
            let mut xp = x.clone();
            let mut xm = x.clone();
            xp[k] += eps;
            xm[k] -= eps;
            numeric[k] = (objective(&state, &xp) - objective(&state, &xm)) / (2.0 * eps);
        }

        let acts = net.forward(&state, &feed("x", 1, x.clone())).unwrap();
        let grads = TensorMap::from([
            ("critic".to_owned(), Tensor::matrix(1, 1, vec![g_critic]).unwrap()),
            ("policy".to_owned(), Tensor::matrix(1, 2, g_policy.to_vec()).unwrap()),
        ]);
        // Zero delta: traces fill, parameters stay.
        let before = state.clone();
        let input_grads = net.train(&mut state, &acts, &grads, &[0.0], 0.0).unwrap();
        for (name, dense) in &state {
            assert_eq!(dense.weights, before[name].weights);
        }

        let analytic = input_grads["x"].data();
        for k in 0..2 {
            assert_close(analytic[k], numeric[k], 1e-3, 1e-2);
        }
    }

    #[test]
    fn positive_delta_moves_head_along_gradient() {
        let net = two_head_net();
        let mut state = net.init_state_with_seed(5);
        let x = feed("x", 1, vec![0.2, 0.9]);
        let v0 = net.forward(&state, &x).unwrap().get("critic").unwrap().data()[0];
        for _ in 0..3 {
            let acts = net.forward(&state, &x).unwrap();
            net.backward(
                &mut state,
                &acts,
                "critic",
                Tensor::matrix(1, 1, vec![0.05]).unwrap(),
                &[1.0],
                0.0,
            )
            .unwrap();
        }
        let v1 = net.forward(&state, &x).unwrap().get("critic").unwrap().data()[0];
        assert!(v1 > v0);
    }

    #[test]
    fn dropout_is_disabled_at_inference() {
        let net = Network::new(
            vec![LayerDef::new(
                "d",
                LayerKind::Dense {
                    size: 2,
                    max_abs_weight: 10.0,
                    dropout: 0.5,
                },
                &["x"],
            )],
            inputs(&[("x", 4)]),
        )
        .unwrap();
        let state = net.init_state_with_seed(2);
        let x = feed("x", 1, vec![1.0, 1.0, 1.0, 1.0]);
        let a = net.forward(&state, &x).unwrap();
        let b = net.forward(&state, &x).unwrap();
        assert!(a.masks.is_empty());
        assert_eq!(a.get("d"), b.get("d"));

        let mut rng = StdRng::seed_from_u64(9);
        let t = net.forward_training(&state, &x, &mut rng).unwrap();
        assert_eq!(t.masks["d"].shape(), &[1, 4]);
    }

    #[test]
    fn validate_state_reports_layer() {
        let net = two_head_net();
        let mut state = net.zero_state();
        assert!(net.validate_state(&state).is_ok());
        state.insert("critic".to_owned(), DenseState::zeros(2, 1));
        assert!(matches!(
            net.validate_state(&state),
            Err(Error::ShapeMismatch { layer, .. }) if layer == "critic"
        ));
    }
}
