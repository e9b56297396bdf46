//! Agent models: one network, or a policy network plus a critic network.
//!
//! Both shapes expose the same operations to the training code: evaluate a
//! batch, read the value and head probabilities, and apply head gradients.

use std::collections::BTreeMap;

use rand::Rng;

use crate::config::{CRITIC, ModelSpec};
use crate::network::{Activations, Network, NetworkState};
use crate::{Error, Result, Tensor, TensorMap};

#[derive(Debug, Clone)]
pub enum Model {
    Single {
        network: Network,
        state: NetworkState,
    },
    Pair {
        policy: Network,
        policy_state: NetworkState,
        critic: Network,
        critic_state: NetworkState,
    },
}

/// Forward pass of a model over one batch.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub policy: Activations,
    /// Present for policy + critic pairs.
    pub critic: Option<Activations>,
}

impl Evaluation {
    /// `(records, 1)` state values.
    pub fn values(&self) -> Result<&Tensor> {
        self.critic
            .as_ref()
            .unwrap_or(&self.policy)
            .get(CRITIC)
            .ok_or_else(|| Error::InvalidData(format!("no `{CRITIC}` output")))
    }

    /// `(records, values)` probabilities of an action head.
    pub fn probs(&self, head: &str) -> Result<&Tensor> {
        self.policy
            .get(head)
            .ok_or_else(|| Error::InvalidData(format!("no action head `{head}`")))
    }

    /// Every layer output, critic network entries included.
    pub fn layer_values(&self) -> TensorMap {
        let mut out = self.policy.values.clone();
        if let Some(critic) = &self.critic {
            out.extend(critic.values.clone());
        }
        out
    }

    pub fn masks(&self) -> TensorMap {
        let mut out = self.policy.masks.clone();
        if let Some(critic) = &self.critic {
            out.extend(critic.masks.clone());
        }
        out
    }
}

impl Model {
    /// Build the networks and check the heads against `actions`.
    pub fn from_spec<R: Rng + ?Sized>(
        spec: &ModelSpec,
        actions: &BTreeMap<String, usize>,
        rng: &mut R,
    ) -> Result<Self> {
        let model = match spec {
            ModelSpec::Single { network } => {
                let network = Network::from_spec(network.clone())?;
                let state = network.init_state(rng);
                Model::Single { network, state }
            }
            ModelSpec::Pair { policy, critic } => {
                let policy = Network::from_spec(policy.clone())?;
                let critic = Network::from_spec(critic.clone())?;
                let policy_state = policy.init_state(rng);
                let critic_state = critic.init_state(rng);
                Model::Pair {
                    policy,
                    policy_state,
                    critic,
                    critic_state,
                }
            }
        };
        model.validate_heads(actions)?;
        Ok(model)
    }

    fn validate_heads(&self, actions: &BTreeMap<String, usize>) -> Result<()> {
        let (policy, critic) = match self {
            Model::Single { network, .. } => (network, network),
            Model::Pair { policy, critic, .. } => {
                if policy.contains_layer(CRITIC) {
                    return Err(Error::InvalidConfig(format!(
                        "policy network must not define `{CRITIC}`"
                    )));
                }
                (policy, critic)
            }
        };
        match critic.size(CRITIC) {
            Some(1) if critic.contains_layer(CRITIC) => {}
            Some(n) if critic.contains_layer(CRITIC) => {
                return Err(Error::ShapeMismatch {
                    layer: CRITIC.to_owned(),
                    msg: format!("value head must have size 1, got {n}"),
                });
            }
            _ => return Err(Error::InvalidConfig(format!("missing `{CRITIC}` layer"))),
        }
        for (name, &values) in actions {
            if !policy.contains_layer(name) {
                return Err(Error::InvalidConfig(format!("missing action layer `{name}`")));
            }
            if policy.size(name) != Some(values) {
                return Err(Error::ShapeMismatch {
                    layer: name.clone(),
                    msg: format!(
                        "action has {values} values, layer has size {:?}",
                        policy.size(name)
                    ),
                });
            }
        }
        Ok(())
    }

    /// Named networks with their states, in persistence order.
    pub fn networks(&self) -> Vec<(&'static str, &Network, &NetworkState)> {
        match self {
            Model::Single { network, state } => vec![("network", network, state)],
            Model::Pair {
                policy,
                policy_state,
                critic,
                critic_state,
            } => vec![
                ("policy", policy, policy_state),
                ("critic", critic, critic_state),
            ],
        }
    }

    pub fn networks_mut(&mut self) -> Vec<(&'static str, &Network, &mut NetworkState)> {
        match self {
            Model::Single { network, state } => vec![("network", &*network, state)],
            Model::Pair {
                policy,
                policy_state,
                critic,
                critic_state,
            } => vec![
                ("policy", &*policy, policy_state),
                ("critic", &*critic, critic_state),
            ],
        }
    }

    /// Every external input the model reads, with its size.
    pub fn input_sizes(&self) -> BTreeMap<String, usize> {
        let mut out = BTreeMap::new();
        for (_, net, _) in self.networks() {
            out.extend(net.input_sizes().iter().map(|(k, &v)| (k.clone(), v)));
        }
        out
    }

    /// Size of an action head.
    pub fn head_size(&self, head: &str) -> Option<usize> {
        match self {
            Model::Single { network, .. } => network.size(head),
            Model::Pair { policy, .. } => policy.size(head),
        }
    }

    pub fn forward(&self, inputs: &TensorMap) -> Result<Evaluation> {
        match self {
            Model::Single { network, state } => Ok(Evaluation {
                policy: network.forward(state, inputs)?,
                critic: None,
            }),
            Model::Pair {
                policy,
                policy_state,
                critic,
                critic_state,
            } => Ok(Evaluation {
                policy: policy.forward(policy_state, inputs)?,
                critic: Some(critic.forward(critic_state, inputs)?),
            }),
        }
    }

    pub fn forward_training<R: Rng + ?Sized>(
        &self,
        inputs: &TensorMap,
        rng: &mut R,
    ) -> Result<Evaluation> {
        match self {
            Model::Single { network, state } => Ok(Evaluation {
                policy: network.forward_training(state, inputs, rng)?,
                critic: None,
            }),
            Model::Pair {
                policy,
                policy_state,
                critic,
                critic_state,
            } => Ok(Evaluation {
                policy: policy.forward_training(policy_state, inputs, rng)?,
                critic: Some(critic.forward_training(critic_state, inputs, rng)?),
            }),
        }
    }

    /// Trace update of every head in `grads` (`critic` and action heads).
    pub fn train(
        &mut self,
        eval: &Evaluation,
        grads: &TensorMap,
        delta: &[f32],
        lambda: f32,
    ) -> Result<()> {
        match self {
            Model::Single { network, state } => {
                network.train(state, &eval.policy, grads, delta, lambda)?;
            }
            Model::Pair {
                policy,
                policy_state,
                critic,
                critic_state,
            } => {
                let (critic_grads, policy_grads): (TensorMap, TensorMap) =
                    grads.clone().into_iter().partition(|(k, _)| k == CRITIC);
                let critic_acts = eval.critic.as_ref().ok_or_else(|| {
                    Error::InvalidData("evaluation has no critic activations".to_owned())
                })?;
                critic.train(critic_state, critic_acts, &critic_grads, delta, lambda)?;
                policy.train(policy_state, &eval.policy, &policy_grads, delta, lambda)?;
            }
        }
        Ok(())
    }

    pub fn reset_traces(&mut self) {
        for (_, net, state) in self.networks_mut() {
            net.reset_traces(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;
    use crate::layer::{LayerDef, LayerKind};
    use crate::network::NetworkSpec;

    fn spec(layers: Vec<LayerDef>) -> NetworkSpec {
        NetworkSpec {
            inputs: BTreeMap::from([("x".to_owned(), 2)]),
            layers,
        }
    }

    fn policy_layers() -> Vec<LayerDef> {
        vec![
            LayerDef::new("logits", LayerKind::dense(3), &["x"]),
            LayerDef::new("move", LayerKind::softmax(1.0), &["logits"]),
        ]
    }

    fn actions() -> BTreeMap<String, usize> {
        BTreeMap::from([("move".to_owned(), 3)])
    }

    #[test]
    fn pair_routes_critic_gradient_to_critic_network() {
        let model_spec = ModelSpec::Pair {
            policy: spec(policy_layers()),
            critic: spec(vec![LayerDef::new("critic", LayerKind::dense(1), &["x"])]),
        };
        let mut rng = StdRng::seed_from_u64(0);
        let mut model = Model::from_spec(&model_spec, &actions(), &mut rng).unwrap();
        let before = model.clone();

        let inputs = TensorMap::from([("x".to_owned(), Tensor::matrix(1, 2, vec![1.0, 1.0]).unwrap())]);
        let eval = model.forward(&inputs).unwrap();
        assert_eq!(eval.values().unwrap().shape(), &[1, 1]);
        let grads = TensorMap::from([(CRITIC.to_owned(), Tensor::filled(&[1, 1], 0.1))]);
        model.train(&eval, &grads, &[1.0], 0.0).unwrap();

        let (Model::Pair { policy_state, critic_state, .. }, Model::Pair { policy_state: p0, critic_state: c0, .. }) =
            (&model, &before)
        else {
            panic!("expected pair");
        };
        assert_eq!(policy_state, p0);
        assert_ne!(critic_state, c0);
    }

    #[test]
    fn policy_network_must_not_define_critic() {
        let mut layers = policy_layers();
        layers.push(LayerDef::new("critic", LayerKind::dense(1), &["x"]));
        let model_spec = ModelSpec::Pair {
            policy: spec(layers),
            critic: spec(vec![LayerDef::new("critic", LayerKind::dense(1), &["x"])]),
        };
        let mut rng = StdRng::seed_from_u64(0);
        assert!(Model::from_spec(&model_spec, &actions(), &mut rng).is_err());
    }

    #[test]
    fn single_requires_critic_and_matching_heads() {
        let mut rng = StdRng::seed_from_u64(0);
        let no_critic = ModelSpec::Single {
            network: spec(policy_layers()),
        };
        assert!(Model::from_spec(&no_critic, &actions(), &mut rng).is_err());

        let mut layers = policy_layers();
        layers.push(LayerDef::new("critic", LayerKind::dense(1), &["x"]));
        let ok = ModelSpec::Single {
            network: spec(layers),
        };
        assert!(Model::from_spec(&ok, &actions(), &mut rng).is_ok());

        let wrong_size = BTreeMap::from([("move".to_owned(), 2)]);
        assert!(matches!(
            Model::from_spec(&ok, &wrong_size, &mut rng),
            Err(Error::ShapeMismatch { .. })
        ));
    }
}
