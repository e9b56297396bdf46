//! Elementwise activations and the row-wise softmax.
//!
//! Activation layers cache their *output* `y`; the backward pass computes
//! `dL/dx` from `dL/dy` and `y` alone, so no pre-activation buffer is kept.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Tanh,
    Relu,
}

impl Activation {
    #[inline]
    pub(crate) fn forward(self, x: f32) -> f32 {
        match self {
            Activation::Tanh => x.tanh(),
            Activation::Relu => x.max(0.0),
        }
    }

    /// Derivative with respect to the input, expressed through the output `y`.
    #[inline]
    pub(crate) fn grad_from_output(self, y: f32) -> f32 {
        match self {
            Activation::Tanh => 1.0 - y * y,
            Activation::Relu => {
                if y > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

/// Softmax of `x / temperature`, max-subtracted.
pub(crate) fn softmax_row(x: &[f32], temperature: f32, out: &mut [f32]) {
    debug_assert_eq!(x.len(), out.len());
    let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0_f32;
    for (o, &v) in out.iter_mut().zip(x) {
        *o = ((v - max) / temperature).exp();
        sum += *o;
    }
    for o in out.iter_mut() {
        *o /= sum;
    }
}

/// `dx_k = (g_k y_k - y_k * sum_j g_j y_j) / T`.
pub(crate) fn softmax_backward_row(y: &[f32], g: &[f32], temperature: f32, out: &mut [f32]) {
    debug_assert_eq!(y.len(), g.len());
    debug_assert_eq!(y.len(), out.len());
    let dot: f32 = y.iter().zip(g).map(|(&a, &b)| a * b).sum();
    for ((o, &yk), &gk) in out.iter_mut().zip(y).zip(g) {
        *o = yk * (gk - dot) / temperature;
    }
}
