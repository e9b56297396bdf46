//! Average-reward TD errors, trajectory advantages and the PPO ratio factor.
//!
//! The task is continuing, so instead of discounting, a running average
//! reward `a` is subtracted from every reward and itself tracks the TD error.

use crate::{Error, Result};

/// Output of the average-reward TD recurrence.
#[derive(Debug, Clone, PartialEq)]
pub struct AverageRewardEstimate {
    /// `delta_t` for every transition.
    pub deltas: Vec<f32>,
    /// `a_0..a_{n-1}`: the baseline each delta was computed against.
    pub avg_rewards: Vec<f32>,
    /// `a_n`, the baseline after the whole sequence.
    pub final_avg_reward: f32,
}

/// `delta_t = r_t - a_t + v_{t+1} - v_t`, `a_{t+1} = a_t + delta_t * reward_alpha`.
///
/// `values` holds one more entry than `rewards`.
pub fn td_errors(
    rewards: &[f32],
    values: &[f32],
    avg_reward: f32,
    reward_alpha: f32,
) -> Result<AverageRewardEstimate> {
    td_errors_impl(rewards, values, None, avg_reward, reward_alpha)
}

/// Same recurrence, but a terminal transition drops its bootstrap:
/// `delta_t = r_t - a_t`.
pub fn td_errors_with_terminals(
    rewards: &[f32],
    values: &[f32],
    terminals: &[bool],
    avg_reward: f32,
    reward_alpha: f32,
) -> Result<AverageRewardEstimate> {
    if terminals.len() != rewards.len() {
        return Err(Error::InvalidShape(format!(
            "{} terminal flags for {} rewards",
            terminals.len(),
            rewards.len()
        )));
    }
    td_errors_impl(rewards, values, Some(terminals), avg_reward, reward_alpha)
}

fn td_errors_impl(
    rewards: &[f32],
    values: &[f32],
    terminals: Option<&[bool]>,
    avg_reward: f32,
    reward_alpha: f32,
) -> Result<AverageRewardEstimate> {
    if values.len() != rewards.len() + 1 {
        return Err(Error::InvalidShape(format!(
            "{} values for {} rewards, expected {}",
            values.len(),
            rewards.len(),
            rewards.len() + 1
        )));
    }
    let n = rewards.len();
    let mut deltas = Vec::with_capacity(n);
    let mut avg_rewards = Vec::with_capacity(n);
    let mut avg = avg_reward;
    for t in 0..n {
        let terminal = terminals.is_some_and(|f| f[t]);
        let delta = if terminal {
            rewards[t] - avg
        } else {
            rewards[t] - avg + values[t + 1] - values[t]
        };
        avg_rewards.push(avg);
        deltas.push(delta);
        avg += delta * reward_alpha;
    }
    Ok(AverageRewardEstimate {
        deltas,
        avg_rewards,
        final_avg_reward: avg,
    })
}

/// Multi-step advantage `A_t = sum_{i=t}^{n-1} (r_i - a_i) + v_n - v_t`.
pub fn trajectory_advantages(
    rewards: &[f32],
    avg_rewards: &[f32],
    values: &[f32],
) -> Result<Vec<f32>> {
    let n = rewards.len();
    if avg_rewards.len() != n || values.len() != n + 1 {
        return Err(Error::InvalidShape(format!(
            "advantage needs {n} baselines and {} values, got {} and {}",
            n + 1,
            avg_rewards.len(),
            values.len()
        )));
    }
    let mut out = vec![0.0; n];
    let mut residual_sum = 0.0_f32;
    for t in (0..n).rev() {
        residual_sum += rewards[t] - avg_rewards[t];
        out[t] = residual_sum + values[n] - values[t];
    }
    Ok(out)
}

/// Gradient factor of the clipped PPO surrogate for the taken action.
///
/// Returns `1 / prob0`, or `0` when the ratio `prob / prob0` has left
/// `[1 - epsilon, 1 + epsilon]` on the side the advantage pushes towards.
#[inline]
pub fn ppo_factor(prob: f32, prob0: f32, epsilon: f32, advantage: f32) -> f32 {
    let ratio = prob / prob0;
    let clipped = if advantage >= 0.0 {
        ratio > 1.0 + epsilon
    } else {
        ratio < 1.0 - epsilon
    };
    if clipped { 0.0 } else { 1.0 / prob0 }
}

/// First category whose cumulative probability exceeds `u`; the last
/// category when rounding leaves the sum short of `u`.
pub fn choose_action(probs: &[f32], u: f32) -> usize {
    let mut cumulative = 0.0_f32;
    for (i, &p) in probs.iter().enumerate() {
        cumulative += p;
        if u < cumulative {
            return i;
        }
    }
    probs.len().saturating_sub(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: f32, b: f32) {
        assert!((a - b).abs() < 1e-5, "{a} vs {b}");
    }

    #[test]
    fn td_recurrence_on_three_steps() {
        let rewards = [0.0, 1.0, -1.0];
        let values = [0.4, 0.2, -0.3, -0.2];
        let alpha = 0.9;
        let est = td_errors(&rewards, &values, 0.3, alpha).unwrap();

        let mut a = 0.3_f32;
        for t in 0..3 {
            let delta = rewards[t] - a + values[t + 1] - values[t];
            assert_close(est.avg_rewards[t], a);
            assert_close(est.deltas[t], delta);
            a += delta * alpha;
        }
        assert_close(est.final_avg_reward, a);

        // 0 - 0.3 + 0.2 - 0.4, then a_1 = 0.3 + 0.9 * -0.5
        assert_close(est.deltas[0], -0.5);
        assert_close(est.avg_rewards[1], -0.15);
        assert_close(est.deltas[1], 0.65);
        assert_close(est.final_avg_reward, -0.7665);
    }

    #[test]
    fn td_rejects_wrong_value_count() {
        assert!(td_errors(&[1.0], &[0.0], 0.0, 0.1).is_err());
        let empty = td_errors(&[], &[0.5], 0.2, 0.1).unwrap();
        assert!(empty.deltas.is_empty());
        assert_eq!(empty.final_avg_reward, 0.2);
    }

    #[test]
    fn terminal_drops_bootstrap() {
        let est = td_errors_with_terminals(&[1.0, 1.0], &[0.5, 2.0, 9.0], &[false, true], 0.0, 0.0)
            .unwrap();
        assert_close(est.deltas[0], 1.0 + 2.0 - 0.5);
        assert_close(est.deltas[1], 1.0);
    }

    #[test]
    fn trajectory_advantage_sums_residuals() {
        let r = [0.0, 1.0, -1.0];
        let a = [0.3, 0.2, -0.1];
        let v = [0.4, 0.2, -0.3, -0.2];
        let adv = trajectory_advantages(&r, &a, &v).unwrap();
        assert_close(adv[0], r[0] - a[0] + r[1] - a[1] + r[2] - a[2] + v[3] - v[0]);
        assert_close(adv[1], r[1] - a[1] + r[2] - a[2] + v[3] - v[1]);
        assert_close(adv[2], r[2] - a[2] + v[3] - v[2]);
    }

    #[test]
    fn ppo_factor_clips_per_branch() {
        let eps = 0.2;
        let p0 = 0.2;
        for adv in [1.0, 0.0] {
            assert_close(ppo_factor(0.2, p0, eps, adv), 5.0);
            assert_close(ppo_factor(0.22, p0, eps, adv), 5.0);
            assert_close(ppo_factor(0.18, p0, eps, adv), 5.0);
            assert_close(ppo_factor(0.14, p0, eps, adv), 5.0);
            assert_eq!(ppo_factor(0.26, p0, eps, adv), 0.0);
        }
        let adv = -1.0;
        assert_close(ppo_factor(0.2, p0, eps, adv), 5.0);
        assert_close(ppo_factor(0.22, p0, eps, adv), 5.0);
        assert_close(ppo_factor(0.26, p0, eps, adv), 5.0);
        assert_eq!(ppo_factor(0.14, p0, eps, adv), 0.0);
    }

    #[test]
    fn choose_action_walks_cumulative_mass() {
        let probs = [0.2, 0.5, 0.3];
        assert_eq!(choose_action(&probs, 0.0), 0);
        assert_eq!(choose_action(&probs, 0.19), 0);
        assert_eq!(choose_action(&probs, 0.2), 1);
        assert_eq!(choose_action(&probs, 0.69), 1);
        assert_eq!(choose_action(&probs, 0.71), 2);
        assert_eq!(choose_action(&[0.3, 0.3], 0.99), 1);
    }
}
