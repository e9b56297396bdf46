//! Layer definitions and per-kind forward/backward kernels.
//!
//! A layer is a named node of the network graph. Only `dense` layers carry
//! trainable parameters; they also carry eligibility traces with the same
//! shapes as their parameters.
//!
//! All kernels work on rank-2 `(records, features)` tensors. Shape checks
//! happen once when the network is built; the kernels only `debug_assert!`.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::activation::{Activation, softmax_backward_row, softmax_row};
use crate::matmul::{matmul, matmul_bt};
use crate::{Error, Result, Tensor};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerDef {
    pub name: String,
    #[serde(flatten)]
    pub kind: LayerKind,
    #[serde(default)]
    pub inputs: Vec<String>,
}

impl LayerDef {
    pub fn new(name: impl Into<String>, kind: LayerKind, inputs: &[&str]) -> Self {
        Self {
            name: name.into(),
            kind,
            inputs: inputs.iter().map(|s| (*s).to_owned()).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerKind {
    /// `y = x·W + b`, trainable.
    Dense {
        size: usize,
        #[serde(default = "unbounded")]
        max_abs_weight: f32,
        /// Probability of dropping each input unit while training.
        #[serde(default)]
        dropout: f32,
    },
    /// `y = weight * x + bias` with fixed scalars.
    Linear { bias: f32, weight: f32 },
    Tanh,
    Relu,
    Softmax {
        #[serde(default = "unit_temperature")]
        temperature: f32,
    },
    Sum,
    Concat,
}

fn unbounded() -> f32 {
    f32::MAX
}

fn unit_temperature() -> f32 {
    1.0
}

impl LayerKind {
    pub fn dense(size: usize) -> Self {
        LayerKind::Dense {
            size,
            max_abs_weight: unbounded(),
            dropout: 0.0,
        }
    }

    pub fn softmax(temperature: f32) -> Self {
        LayerKind::Softmax { temperature }
    }

    pub fn is_trainable(&self) -> bool {
        matches!(self, LayerKind::Dense { .. })
    }

    pub(crate) fn validate(&self, name: &str) -> Result<()> {
        let bad = |msg: String| Err(Error::InvalidConfig(format!("layer `{name}`: {msg}")));
        match *self {
            LayerKind::Dense {
                size,
                max_abs_weight,
                dropout,
            } => {
                if size == 0 {
                    return bad("dense size must be > 0".to_owned());
                }
                if max_abs_weight.is_nan() || max_abs_weight <= 0.0 {
                    return bad(format!("max_abs_weight must be > 0, got {max_abs_weight}"));
                }
                if !(0.0..1.0).contains(&dropout) {
                    return bad(format!("dropout must be in [0, 1), got {dropout}"));
                }
            }
            LayerKind::Linear { bias, weight } => {
                if !(bias.is_finite() && weight.is_finite()) {
                    return bad("linear bias and weight must be finite".to_owned());
                }
            }
            LayerKind::Softmax { temperature } => {
                if !(temperature.is_finite() && temperature > 0.0) {
                    return bad(format!("temperature must be > 0, got {temperature}"));
                }
            }
            LayerKind::Tanh | LayerKind::Relu | LayerKind::Sum | LayerKind::Concat => {}
        }
        Ok(())
    }

    /// Output width given the widths of the inputs, in declaration order.
    pub(crate) fn output_size(&self, name: &str, inputs: &[usize]) -> Result<usize> {
        match self {
            LayerKind::Sum | LayerKind::Concat => {
                if inputs.is_empty() {
                    return Err(Error::ShapeMismatch {
                        layer: name.to_owned(),
                        msg: "needs at least one input".to_owned(),
                    });
                }
            }
            _ => {
                if inputs.len() != 1 {
                    return Err(Error::ShapeMismatch {
                        layer: name.to_owned(),
                        msg: format!("needs exactly one input, got {}", inputs.len()),
                    });
                }
            }
        }
        match *self {
            LayerKind::Dense { size, .. } => Ok(size),
            LayerKind::Concat => Ok(inputs.iter().sum()),
            LayerKind::Sum => {
                let size = inputs[0];
                if let Some(other) = inputs.iter().find(|&&s| s != size) {
                    return Err(Error::ShapeMismatch {
                        layer: name.to_owned(),
                        msg: format!("sum inputs have sizes {size} and {other}"),
                    });
                }
                Ok(size)
            }
            LayerKind::Linear { .. }
            | LayerKind::Tanh
            | LayerKind::Relu
            | LayerKind::Softmax { .. } => Ok(inputs[0]),
        }
    }
}

/// Parameters and eligibility traces of a dense layer.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseState {
    /// `(inputs, outputs)`.
    pub weights: Tensor,
    /// `(1, outputs)`.
    pub bias: Tensor,
    pub weights_trace: Tensor,
    pub bias_trace: Tensor,
}

impl DenseState {
    pub fn zeros(inputs: usize, outputs: usize) -> Self {
        Self {
            weights: Tensor::zeros(&[inputs, outputs]),
            bias: Tensor::zeros(&[1, outputs]),
            weights_trace: Tensor::zeros(&[inputs, outputs]),
            bias_trace: Tensor::zeros(&[1, outputs]),
        }
    }

    /// Xavier/Glorot uniform weights, zero bias, zero traces.
    pub fn xavier<R: Rng + ?Sized>(inputs: usize, outputs: usize, rng: &mut R) -> Self {
        let mut state = Self::zeros(inputs, outputs);
        let limit = (6.0 / (inputs + outputs) as f32).sqrt();
        for w in state.weights.data_mut() {
            *w = rng.random_range(-limit..limit);
        }
        state
    }

    /// Rebuild from persisted parameters; traces start at zero.
    pub fn from_params(weights: Tensor, bias: Tensor) -> Result<Self> {
        if weights.shape().len() != 2 || bias.shape() != [1, weights.shape()[1]] {
            return Err(Error::InvalidShape(format!(
                "weights {:?} and bias {:?} do not form a dense layer",
                weights.shape(),
                bias.shape()
            )));
        }
        let weights_trace = Tensor::zeros(weights.shape());
        let bias_trace = Tensor::zeros(bias.shape());
        Ok(Self {
            weights,
            bias,
            weights_trace,
            bias_trace,
        })
    }

    #[inline]
    pub fn inputs(&self) -> usize {
        self.weights.shape()[0]
    }

    #[inline]
    pub fn outputs(&self) -> usize {
        self.weights.shape()[1]
    }

    pub fn reset_traces(&mut self) {
        self.weights_trace.data_mut().fill(0.0);
        self.bias_trace.data_mut().fill(0.0);
    }
}

/// Dropout mask for a dense input: kept units hold `1 / keep`, dropped units `0`.
pub(crate) fn dropout_mask<R: Rng + ?Sized>(shape: &[usize], rate: f32, rng: &mut R) -> Tensor {
    let keep = 1.0 - rate;
    let mut mask = Tensor::zeros(shape);
    for m in mask.data_mut() {
        if rng.random::<f32>() < keep {
            *m = 1.0 / keep;
        }
    }
    mask
}

fn apply_mask(x: &Tensor, mask: Option<&Tensor>) -> Tensor {
    match mask {
        None => x.clone(),
        Some(mask) => {
            debug_assert_eq!(x.shape(), mask.shape());
            let mut out = x.clone();
            for (v, &m) in out.data_mut().iter_mut().zip(mask.data()) {
                *v *= m;
            }
            out
        }
    }
}

pub(crate) fn dense_forward(state: &DenseState, x: &Tensor, mask: Option<&Tensor>) -> Tensor {
    let rows = x.rows();
    let (n_in, n_out) = (state.inputs(), state.outputs());
    debug_assert_eq!(x.record_len(), n_in);

    let x = apply_mask(x, mask);
    let mut y = Tensor::zeros(&[rows, n_out]);
    matmul(rows, n_in, n_out, x.data(), state.weights.data(), y.data_mut());
    let b = state.bias.data();
    for i in 0..rows {
        for (v, &bj) in y.row_mut(i).iter_mut().zip(b) {
            *v += bj;
        }
    }
    y
}

/// Trace update of a dense layer; returns the gradient for its input.
///
/// Per record `i`, in order:
/// `e_b = λ·e_b + g_i`, `e_W = λ·e_W + x̃_iᵀ·g_i`, `b += e_b·δ_i`,
/// `W += e_W·δ_i`, then every parameter is clamped to `±max_abs_weight`.
/// The input gradient uses the weights from before the update.
#[allow(clippy::too_many_arguments)]
pub(crate) fn dense_train(
    state: &mut DenseState,
    max_abs_weight: f32,
    x: &Tensor,
    mask: Option<&Tensor>,
    grad: &Tensor,
    delta: &[f32],
    lambda: f32,
) -> Tensor {
    let rows = x.rows();
    let (n_in, n_out) = (state.inputs(), state.outputs());
    debug_assert_eq!(grad.shape(), &[rows, n_out]);
    debug_assert_eq!(delta.len(), rows);

    let mut grad_in = Tensor::zeros(&[rows, n_in]);
    matmul_bt(rows, n_out, n_in, grad.data(), state.weights.data(), grad_in.data_mut());
    let grad_in = apply_mask(&grad_in, mask);
    let x = apply_mask(x, mask);

    let max = max_abs_weight;
    for i in 0..rows {
        let g = grad.row(i);
        let xi = x.row(i);
        let d = delta[i];

        let eb = state.bias_trace.data_mut();
        for (e, &gj) in eb.iter_mut().zip(g) {
            *e = lambda.mul_add(*e, gj);
        }
        for (b, &e) in state.bias.data_mut().iter_mut().zip(state.bias_trace.data()) {
            *b = e.mul_add(d, *b).clamp(-max, max);
        }

        let ew = state.weights_trace.data_mut();
        let w = state.weights.data_mut();
        for (r, &xr) in xi.iter().enumerate() {
            let row = r * n_out;
            for j in 0..n_out {
                let e = lambda.mul_add(ew[row + j], xr * g[j]);
                ew[row + j] = e;
                w[row + j] = e.mul_add(d, w[row + j]).clamp(-max, max);
            }
        }
    }
    grad_in
}

pub(crate) fn stateless_forward(kind: &LayerKind, inputs: &[&Tensor]) -> Result<Tensor> {
    Ok(match *kind {
        LayerKind::Tanh => inputs[0].map(|v| Activation::Tanh.forward(v)),
        LayerKind::Relu => inputs[0].map(|v| Activation::Relu.forward(v)),
        LayerKind::Linear { bias, weight } => inputs[0].map(|v| weight.mul_add(v, bias)),
        LayerKind::Softmax { temperature } => {
            let x = inputs[0];
            let mut y = Tensor::zeros(x.shape());
            for i in 0..x.rows() {
                softmax_row(x.row(i), temperature, y.row_mut(i));
            }
            y
        }
        LayerKind::Sum => {
            let mut y = inputs[0].clone();
            for x in &inputs[1..] {
                y.add_assign(x);
            }
            y
        }
        LayerKind::Concat => Tensor::hconcat(inputs)?,
        LayerKind::Dense { .. } => unreachable!("dense layers go through dense_forward"),
    })
}

/// Input gradients of a parameter-free layer, one per input.
pub(crate) fn stateless_backward(
    kind: &LayerKind,
    inputs: &[&Tensor],
    output: &Tensor,
    grad: &Tensor,
) -> Vec<Tensor> {
    debug_assert_eq!(output.shape(), grad.shape());
    match *kind {
        LayerKind::Tanh | LayerKind::Relu => {
            let act = if matches!(kind, LayerKind::Tanh) {
                Activation::Tanh
            } else {
                Activation::Relu
            };
            let mut g = grad.clone();
            for (v, &y) in g.data_mut().iter_mut().zip(output.data()) {
                *v *= act.grad_from_output(y);
            }
            vec![g]
        }
        LayerKind::Linear { weight, .. } => vec![grad.map(|v| v * weight)],
        LayerKind::Softmax { temperature } => {
            let mut g = Tensor::zeros(grad.shape());
            for i in 0..grad.rows() {
                softmax_backward_row(output.row(i), grad.row(i), temperature, g.row_mut(i));
            }
            vec![g]
        }
        LayerKind::Sum => inputs.iter().map(|_| grad.clone()).collect(),
        LayerKind::Concat => {
            let mut out = Vec::with_capacity(inputs.len());
            let mut offset = 0;
            for x in inputs {
                let n = x.record_len();
                let mut g = Tensor::zeros(&[grad.rows(), n]);
                for i in 0..grad.rows() {
                    g.row_mut(i).copy_from_slice(&grad.row(i)[offset..offset + n]);
                }
                offset += n;
                out.push(g);
            }
            out
        }
        LayerKind::Dense { .. } => unreachable!("dense layers go through dense_train"),
    }
}
