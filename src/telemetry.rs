//! Training telemetry.
//!
//! Every training step can push a [`Snapshot`] of named tensors (inputs,
//! layer values before and after the update, gradients, masks, delta and
//! average reward) into a [`TelemetrySink`]. Sinks decide their own
//! buffering: a bounded channel gives backpressure, a closure runs inline.

use std::path::{Path, PathBuf};

use crossbeam_channel::{Sender, TrySendError};
use tracing::debug;

use crate::dataset::RecordFile;
use crate::{Result, Tensor, TensorMap};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    /// Training step counter of the producer.
    pub step: u64,
    pub values: TensorMap,
}

impl Snapshot {
    pub fn new(step: u64) -> Self {
        Self {
            step,
            values: TensorMap::new(),
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Tensor) {
        self.values.insert(key.into(), value);
    }

    pub fn insert_scalar(&mut self, key: impl Into<String>, value: f32) {
        self.insert(key, Tensor::row_vector(vec![value]));
    }

    /// Insert every entry of `map` under `prefix.<key>`.
    pub fn insert_prefixed(&mut self, prefix: &str, map: &TensorMap) {
        for (key, value) in map {
            self.values.insert(format!("{prefix}.{key}"), value.clone());
        }
    }

    pub fn get(&self, key: &str) -> Option<&Tensor> {
        self.values.get(key)
    }
}

pub trait TelemetrySink: Send {
    fn publish(&mut self, snapshot: &Snapshot) -> Result<()>;
}

/// Blocks when the channel is full; a dropped receiver is not an error.
impl TelemetrySink for Sender<Snapshot> {
    fn publish(&mut self, snapshot: &Snapshot) -> Result<()> {
        if self.send(snapshot.clone()).is_err() {
            debug!(step = snapshot.step, "telemetry receiver disconnected");
        }
        Ok(())
    }
}

/// Non-blocking channel sink: snapshots are dropped while the consumer lags.
#[derive(Debug, Clone)]
pub struct LossyChannelSink(pub Sender<Snapshot>);

impl TelemetrySink for LossyChannelSink {
    fn publish(&mut self, snapshot: &Snapshot) -> Result<()> {
        match self.0.try_send(snapshot.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!(step = snapshot.step, "telemetry snapshot dropped"),
            Err(TrySendError::Disconnected(_)) => {
                debug!(step = snapshot.step, "telemetry receiver disconnected")
            }
        }
        Ok(())
    }
}

/// Runs a closure per snapshot.
pub struct FnSink<F>(pub F);

impl<F> TelemetrySink for FnSink<F>
where
    F: FnMut(&Snapshot) -> Result<()> + Send,
{
    fn publish(&mut self, snapshot: &Snapshot) -> Result<()> {
        (self.0)(snapshot)
    }
}

/// Appends every snapshot value to a record file under `root`, one file per key.
///
/// Keys present in only some snapshots produce files of different lengths.
#[derive(Debug)]
pub struct RecordSink {
    root: PathBuf,
    files: std::collections::BTreeMap<String, RecordFile>,
}

impl RecordSink {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            files: Default::default(),
        }
    }

    pub fn flush(&mut self) -> Result<()> {
        for file in self.files.values_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

impl TelemetrySink for RecordSink {
    fn publish(&mut self, snapshot: &Snapshot) -> Result<()> {
        for (key, value) in &snapshot.values {
            if !self.files.contains_key(key) {
                let file = RecordFile::create_by_key(&self.root, key)?;
                self.files.insert(key.clone(), file);
            }
            if let Some(file) = self.files.get_mut(key) {
                file.write(value)?;
            }
        }
        Ok(())
    }
}
