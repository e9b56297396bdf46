use std::path::Path;

use rltd::csv_store::{self, CsvReader};
use rltd::{Agent, AgentConfig, Algorithm, Dataset, RecordFile, RecordSink, Tensor, TensorMap, Transition};

const CONFIG: &str = r#"{
    "model": {
        "kind": "pair",
        "policy": {
            "inputs": {"state": 2},
            "layers": [
                {"name": "hidden", "type": "dense", "size": 4, "inputs": ["state"]},
                {"name": "hidden_act", "type": "relu", "inputs": ["hidden"]},
                {"name": "skip", "type": "concat", "inputs": ["hidden_act", "state"]},
                {"name": "logits", "type": "dense", "size": 2, "inputs": ["skip"]},
                {"name": "move", "type": "softmax", "temperature": 0.8, "inputs": ["logits"]}
            ]
        },
        "critic": {
            "inputs": {"state": 2},
            "layers": [
                {"name": "critic", "type": "dense", "size": 1, "inputs": ["state"]}
            ]
        }
    },
    "actions": {"move": 2},
    "alphas": {"critic": 0.05, "move": 0.05},
    "lambda": 0.7,
    "reward_alpha": 0.05,
    "num_steps": 8,
    "num_epochs": 2,
    "batch_size": 4,
    "seed": 21
}"#;

fn state(i: usize) -> TensorMap {
    let v = if i % 2 == 0 { vec![1.0, 0.0] } else { vec![0.0, 1.0] };
    TensorMap::from([("state".to_owned(), Tensor::row_vector(v))])
}

/// Two alternating states; action 1 pays 1.
fn run(agent: &mut Agent, steps: usize) {
    for i in 0..steps {
        let s0 = state(i);
        let actions = agent.act(&s0).unwrap();
        let reward = if actions["move"] == 1 { 1.0 } else { 0.0 };
        agent
            .observe(Transition {
                s0,
                actions,
                reward,
                s1: state(i + 1),
                terminal: false,
            })
            .unwrap();
    }
}

fn weights(agent: &Agent) -> Vec<Tensor> {
    agent
        .model()
        .networks()
        .into_iter()
        .flat_map(|(_, _, state)| state.values().map(|d| d.weights.clone()).collect::<Vec<_>>())
        .collect()
}

fn config() -> AgentConfig {
    AgentConfig::from_json_str(CONFIG).unwrap()
}

#[test]
fn online_agent_records_telemetry_and_exports_csv() {
    let telemetry = tempfile::tempdir().unwrap();
    let csv = tempfile::tempdir().unwrap();

    let mut agent = Agent::new(config()).unwrap();
    agent.set_sink(Box::new(RecordSink::new(telemetry.path())));
    run(&mut agent, 12);
    drop(agent);

    for key in ["reward", "delta", "avg_reward", "s0.state", "grads.move"] {
        let mut file = RecordFile::by_key(telemetry.path(), key);
        assert_eq!(file.size().unwrap(), 12, "records in {key}");
    }

    let mut recorded = Dataset::open(telemetry.path()).unwrap();
    let exported = csv_store::export(&mut recorded, csv.path(), 5).unwrap();
    assert_eq!(exported, 12);

    let mut reader = CsvReader::open_by_key(csv.path(), "s0.state").unwrap();
    assert_eq!(reader.record_shape(), &[2]);
    let states = reader.read(100).unwrap().unwrap();
    assert_eq!(states.row(0), &[1.0, 0.0]);
    assert_eq!(states.row(1), &[0.0, 1.0]);
}

#[test]
fn autosave_writes_a_loadable_agent() {
    let dir = tempfile::tempdir().unwrap();
    let model_dir = dir.path().join("model");
    let mut config = config();
    config.model_path = Some(model_dir.clone());
    config.saving_interval_steps = Some(5);

    let mut agent = Agent::new(config).unwrap();
    run(&mut agent, 4);
    assert!(!model_dir.join("agent.json").exists());
    run(&mut agent, 6);
    assert!(model_dir.join("agent.json").is_file());

    let loaded = Agent::load(&model_dir).unwrap();
    assert_eq!(loaded.avg_reward(), agent.avg_reward());
    assert_eq!(weights(&loaded), weights(&agent));
    assert_loaded_traces_are_zero(&loaded);
}

fn assert_loaded_traces_are_zero(agent: &Agent) {
    for (_, _, state) in agent.model().networks() {
        for dense in state.values() {
            assert!(dense.weights_trace.data().iter().all(|&v| v == 0.0));
        }
    }
}

#[test]
fn ppo_agent_trains_once_per_trajectory() {
    let mut config = config();
    config.algorithm = Algorithm::Ppo;
    let mut agent = Agent::new(config).unwrap();
    let before = weights(&agent);

    run(&mut agent, 7);
    assert_eq!(agent.trajectory().len(), 7);
    assert_eq!(weights(&agent), before);

    run_from(&mut agent, 7, 1);
    assert!(agent.trajectory().is_empty());
    assert_ne!(weights(&agent), before);
    assert!(agent.avg_reward().is_finite());
}

fn run_from(agent: &mut Agent, start: usize, steps: usize) {
    for i in start..start + steps {
        let s0 = state(i);
        let actions = agent.act(&s0).unwrap();
        agent
            .observe(Transition {
                s0,
                actions,
                reward: 1.0,
                s1: state(i + 1),
                terminal: false,
            })
            .unwrap();
    }
}

#[test]
fn saved_agent_resumes_in_a_fresh_directory() {
    let dir = tempfile::tempdir().unwrap();
    let mut agent = Agent::new(config()).unwrap();
    run(&mut agent, 3);
    agent.save(dir.path()).unwrap();
    assert_saved_layout(dir.path());

    let mut loaded = Agent::load(dir.path()).unwrap();
    run(&mut loaded, 3);
    assert!(loaded.avg_reward().is_finite());
}

fn assert_saved_layout(dir: &Path) {
    for key in [
        "policy.hidden.weights",
        "policy.hidden.bias",
        "policy.logits.weights",
        "critic.critic.bias",
    ] {
        assert!(RecordFile::by_key(dir, key).exists(), "missing {key}");
    }
}
