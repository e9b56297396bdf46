use std::collections::BTreeMap;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rltd::{LayerKind, MiniBatch, Model, NetworkBuilder, Tensor, TensorMap, TrainParams, run_mini_batch};

fn model() -> Model {
    let (network, mut state) = NetworkBuilder::new()
        .input("state", 2)
        .unwrap()
        .dense("critic", 1, "state")
        .unwrap()
        .dense("logits", 2, "state")
        .unwrap()
        .layer("action", LayerKind::softmax(1.0), &["logits"])
        .unwrap()
        .build_with_seed(0)
        .unwrap();

    let critic = state.get_mut("critic").unwrap();
    critic.weights.data_mut().copy_from_slice(&[0.1, -0.1]);
    critic.bias.data_mut().fill(0.0);
    let logits = state.get_mut("logits").unwrap();
    logits.weights.data_mut().fill(0.0);
    logits.bias.data_mut().fill(0.0);
    Model::Single { network, state }
}

fn states(rows: &[[f32; 2]]) -> TensorMap {
    let data = rows.iter().flatten().copied().collect();
    TensorMap::from([("state".to_owned(), Tensor::matrix(rows.len(), 2, data).unwrap())])
}

const A: [f32; 2] = [1.0, 0.0];
const B: [f32; 2] = [0.0, 1.0];

/// Action 1 pays 1, action 0 pays 0, from both states; mean reward 0.5.
fn batch() -> MiniBatch {
    MiniBatch {
        s0: states(&[A, A, B, B]),
        s1: states(&[B, B, A, A]),
        masks: TensorMap::from([(
            "action".to_owned(),
            Tensor::one_hot(&[1, 0, 1, 0], 2).unwrap(),
        )]),
        residuals: vec![0.5, -0.5, 0.5, -0.5],
        terminals: vec![false; 4],
        behavior: None,
    }
}

fn params() -> TrainParams {
    TrainParams {
        lambda: 0.0,
        critic_alpha: 0.1,
        head_alphas: BTreeMap::from([("action".to_owned(), 0.1)]),
        ppo_epsilon: 0.2,
    }
}

fn p_good(model: &Model) -> (f32, f32) {
    let eval = model.forward(&states(&[A, B])).unwrap();
    let probs = eval.probs("action").unwrap();
    (probs.row(0)[1], probs.row(1)[1])
}

fn value_gap(model: &Model) -> f32 {
    let eval = model.forward(&states(&[A, B])).unwrap();
    let v = eval.values().unwrap();
    v.scalar(0) - v.scalar(1)
}

#[test]
fn policy_moves_toward_paying_action() {
    let mut model = model();
    let mut rng = StdRng::seed_from_u64(1);
    let (mut pa, mut pb) = p_good(&model);
    assert!((pa - 0.5).abs() < 1e-6 && (pb - 0.5).abs() < 1e-6);

    for _ in 0..5 {
        run_mini_batch(&mut model, &batch(), &params(), &mut rng).unwrap();
        let (na, nb) = p_good(&model);
        assert!(na > pa, "pi(1|A) did not grow: {pa} -> {na}");
        assert!(nb > pb, "pi(1|B) did not grow: {pb} -> {nb}");
        pa = na;
        pb = nb;
    }
}

#[test]
fn critic_gap_shrinks_under_symmetric_rewards() {
    let mut model = model();
    let mut rng = StdRng::seed_from_u64(2);
    let mut gap = value_gap(&model).abs();
    assert!((gap - 0.2).abs() < 1e-6);

    for _ in 0..5 {
        run_mini_batch(&mut model, &batch(), &params(), &mut rng).unwrap();
        let next = value_gap(&model).abs();
        assert!(next < gap, "critic gap did not shrink: {gap} -> {next}");
        gap = next;
    }
}

#[test]
fn deltas_follow_bootstrapped_residuals() {
    let mut model = model();
    let mut rng = StdRng::seed_from_u64(3);
    let out = run_mini_batch(&mut model, &batch(), &params(), &mut rng).unwrap();
    // v(A) - v(B) = 0.2 before the update.
    let expected = [0.3, -0.7, 0.7, -0.3];
    for (d, e) in out.deltas.iter().zip(expected) {
        assert!((d - e).abs() < 1e-5, "delta {d} != {e}");
    }
}
