//! CSV rendition of the record store.
//!
//! Each key directory holds `shape.csv`, a single row with the record
//! dimensions, and `data.csv`, one flattened record per row. No header rows.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use tracing::info;

use crate::dataset::{Dataset, key_dir};
use crate::{Error, Result, Tensor};

pub const DATA_FILE_NAME: &str = "data.csv";
pub const SHAPE_FILE_NAME: &str = "shape.csv";

#[derive(Debug)]
pub struct CsvWriter {
    dir: PathBuf,
    writer: Option<csv::Writer<File>>,
    record_shape: Option<Vec<usize>>,
    size: u64,
}

impl CsvWriter {
    /// A fresh writer for `key` under `root`; existing CSV files are replaced.
    pub fn create_by_key(root: &Path, key: &str) -> Result<Self> {
        let dir = key_dir(root, key);
        fs::create_dir_all(&dir)?;
        for name in [DATA_FILE_NAME, SHAPE_FILE_NAME] {
            let path = dir.join(name);
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        Ok(Self {
            dir,
            writer: None,
            record_shape: None,
            size: 0,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn write(&mut self, tensor: &Tensor) -> Result<()> {
        match &self.record_shape {
            Some(shape) if shape.as_slice() != tensor.record_shape() => {
                return Err(Error::InvalidShape(format!(
                    "{}: record shape {:?} does not match {shape:?}",
                    self.dir.display(),
                    tensor.record_shape()
                )));
            }
            Some(_) => {}
            None => {
                let mut shape = WriterBuilder::new()
                    .has_headers(false)
                    .from_path(self.dir.join(SHAPE_FILE_NAME))?;
                shape.write_record(tensor.record_shape().iter().map(|d| d.to_string()))?;
                shape.flush()?;
                self.record_shape = Some(tensor.record_shape().to_vec());
            }
        }

        if self.writer.is_none() {
            self.writer = Some(
                WriterBuilder::new()
                    .has_headers(false)
                    .from_path(self.dir.join(DATA_FILE_NAME))?,
            );
        }
        if let Some(writer) = self.writer.as_mut() {
            for i in 0..tensor.rows() {
                writer.write_record(tensor.row(i).iter().map(|v| v.to_string()))?;
            }
        }
        self.size += tensor.rows() as u64;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct CsvReader {
    dir: PathBuf,
    record_shape: Vec<usize>,
    reader: csv::Reader<File>,
    position: u64,
}

impl CsvReader {
    pub fn open_by_key(root: &Path, key: &str) -> Result<Self> {
        let dir = key_dir(root, key);
        let record_shape = read_shape(&dir.join(SHAPE_FILE_NAME))?;
        let reader = open_data(&dir)?;
        Ok(Self {
            dir,
            record_shape,
            reader,
            position: 0,
        })
    }

    pub fn record_shape(&self) -> &[usize] {
        &self.record_shape
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Back to the first record.
    pub fn reset(&mut self) -> Result<()> {
        self.reader = open_data(&self.dir)?;
        self.position = 0;
        Ok(())
    }

    /// Up to `max` records; `None` at end of file.
    pub fn read(&mut self, max: usize) -> Result<Option<Tensor>> {
        let width: usize = self.record_shape.iter().product();
        let mut data = Vec::new();
        let mut rows = 0;
        let mut record = StringRecord::new();
        while rows < max && self.reader.read_record(&mut record)? {
            if record.len() != width {
                return Err(Error::InvalidData(format!(
                    "{}: row {} has {} values, expected {width}",
                    self.dir.display(),
                    self.position + rows as u64,
                    record.len()
                )));
            }
            for field in record.iter() {
                let v = field.trim().parse::<f32>().map_err(|e| {
                    Error::InvalidData(format!("{}: bad value `{field}`: {e}", self.dir.display()))
                })?;
                data.push(v);
            }
            rows += 1;
        }
        if rows == 0 {
            return Ok(None);
        }
        self.position += rows as u64;
        let shape = std::iter::once(rows)
            .chain(self.record_shape.iter().copied())
            .collect();
        Tensor::from_shape_vec(shape, data).map(Some)
    }
}

fn open_data(dir: &Path) -> Result<csv::Reader<File>> {
    Ok(ReaderBuilder::new()
        .has_headers(false)
        .from_path(dir.join(DATA_FILE_NAME))?)
}

fn read_shape(path: &Path) -> Result<Vec<usize>> {
    let mut reader = ReaderBuilder::new().has_headers(false).from_path(path)?;
    let mut record = StringRecord::new();
    if !reader.read_record(&mut record)? {
        return Err(Error::InvalidData(format!("{}: empty shape", path.display())));
    }
    // Scalar records are written as a single empty field.
    if record.len() == 1 && record[0].trim().is_empty() {
        return Ok(Vec::new());
    }
    record
        .iter()
        .map(|f| {
            f.trim()
                .parse::<usize>()
                .map_err(|e| Error::InvalidData(format!("{}: bad dimension `{f}`: {e}", path.display())))
        })
        .collect()
}

/// Copy every file of `dataset` into CSV form under `out_root`.
/// Returns the number of records written per file.
pub fn export(dataset: &mut Dataset, out_root: &Path, batch_size: usize) -> Result<u64> {
    let keys: Vec<String> = dataset.keys().map(str::to_owned).collect();
    let mut total = 0;
    for key in &keys {
        let Some(file) = dataset.get_mut(key) else {
            continue;
        };
        file.reset()?;
        let mut writer = CsvWriter::create_by_key(out_root, key)?;
        while let Some(batch) = file.read(batch_size.max(1))? {
            writer.write(&batch)?;
        }
        writer.flush()?;
        total = writer.size();
    }
    info!(files = keys.len(), records = total, out = %out_root.display(), "dataset exported to csv");
    Ok(total)
}
