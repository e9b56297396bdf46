//! Out-of-core dataset store.
//!
//! A [`RecordFile`] is a sequence of fixed-shape `f32` records on disk. Its
//! layout, all little-endian:
//!
//! ```text
//! u32          rank r of one record
//! u64 x r      record dimensions
//! f32 x ...    records, row-major, back to back
//! ```
//!
//! The record count is derived from the file length. A trailing partial
//! record is reported as [`Error::InvalidData`], never padded or dropped.
//!
//! A [`Dataset`] maps dotted keys to record files laid out as
//! `root/<k1>/<k2>/.../data.bin` and reads them in lock-step. Reads also carry
//! an aggregate entry for every internal key: the feature-axis concatenation
//! of its descendants in key order.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{Error, Result, Tensor, TensorMap};

pub const RECORD_FILE_NAME: &str = "data.bin";

/// Key of the dataset sitting exactly at a `children` prefix.
pub const SELF_KEY: &str = ".";

/// Directory of `key` under `root`: `a.b` -> `root/a/b`.
pub fn key_dir(root: &Path, key: &str) -> PathBuf {
    let mut dir = root.to_path_buf();
    if key != SELF_KEY {
        dir.extend(key.split('.'));
    }
    dir
}

#[derive(Debug, Clone, PartialEq)]
struct Layout {
    record_shape: Vec<usize>,
    header_len: u64,
    record_bytes: u64,
}

impl Layout {
    /// `None` when one record would not fit in a `u64` byte count.
    fn new(record_shape: &[usize]) -> Option<Self> {
        let record_bytes = record_shape
            .iter()
            .try_fold(4u64, |acc, &d| acc.checked_mul(u64::try_from(d).ok()?))?;
        Some(Self {
            record_shape: record_shape.to_vec(),
            header_len: 4 + 8 * record_shape.len() as u64,
            record_bytes,
        })
    }

    fn header_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header_len as usize);
        out.extend_from_slice(&(self.record_shape.len() as u32).to_le_bytes());
        for &d in &self.record_shape {
            out.extend_from_slice(&(d as u64).to_le_bytes());
        }
        out
    }

    fn read(file: &mut File, path: &Path) -> Result<Option<Self>> {
        let len = file.metadata()?.len();
        if len == 0 {
            return Ok(None);
        }
        let truncated = || Error::InvalidData(format!("{}: truncated header", path.display()));
        if len < 4 {
            return Err(truncated());
        }
        file.seek(SeekFrom::Start(0))?;
        let mut rank_bytes = [0u8; 4];
        file.read_exact(&mut rank_bytes)?;
        let rank = u32::from_le_bytes(rank_bytes) as u64;
        if len < 4 + 8 * rank {
            return Err(truncated());
        }
        let mut dims = Vec::with_capacity(rank as usize);
        for _ in 0..rank {
            let mut dim = [0u8; 8];
            file.read_exact(&mut dim)?;
            let dim = usize::try_from(u64::from_le_bytes(dim)).map_err(|_| {
                Error::InvalidData(format!("{}: record dimension overflows", path.display()))
            })?;
            dims.push(dim);
        }
        let layout = Self::new(&dims).ok_or_else(|| {
            Error::InvalidData(format!(
                "{}: record shape {dims:?} is too large",
                path.display()
            ))
        })?;
        if layout.record_bytes == 0 {
            return Err(Error::InvalidData(format!(
                "{}: empty record shape {dims:?}",
                path.display()
            )));
        }
        Ok(Some(layout))
    }
}

/// One binary record file with its own cursor.
///
/// The file is opened lazily on first use; a missing file reads as empty.
#[derive(Debug)]
pub struct RecordFile {
    path: PathBuf,
    file: Option<File>,
    writable: bool,
    layout: Option<Layout>,
    position: u64,
}

impl RecordFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
            writable: false,
            layout: None,
            position: 0,
        }
    }

    /// The file of `key` under `root`, without touching the file system.
    pub fn by_key(root: &Path, key: &str) -> Self {
        Self::new(key_dir(root, key).join(RECORD_FILE_NAME))
    }

    /// A fresh, empty file for `key` under `root`; existing data is removed.
    pub fn create_by_key(root: &Path, key: &str) -> Result<Self> {
        let mut file = Self::by_key(root, key);
        if let Some(dir) = file.path.parent() {
            fs::create_dir_all(dir)?;
        }
        file.clear()?;
        Ok(file)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Independent handle on the same file, at the same cursor.
    pub fn dup(&self) -> Self {
        Self {
            path: self.path.clone(),
            file: None,
            writable: false,
            layout: None,
            position: self.position,
        }
    }

    fn open_read(&mut self) -> Result<bool> {
        if self.file.is_some() {
            return Ok(true);
        }
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        self.layout = Layout::read(&mut file, &self.path)?;
        self.file = Some(file);
        self.writable = false;
        Ok(true)
    }

    fn open_write(&mut self) -> Result<&mut File> {
        if self.file.is_none() || !self.writable {
            if let Some(dir) = self.path.parent() {
                fs::create_dir_all(dir)?;
            }
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&self.path)?;
            self.layout = Layout::read(&mut file, &self.path)?;
            self.file = Some(file);
            self.writable = true;
        }
        self.file
            .as_mut()
            .ok_or_else(|| Error::InvalidData(format!("{}: not open", self.path.display())))
    }

    /// Shape of one record, `None` while the file is empty.
    pub fn record_shape(&mut self) -> Result<Option<Vec<usize>>> {
        self.open_read()?;
        Ok(self.layout.as_ref().map(|l| l.record_shape.clone()))
    }

    /// Number of records in the file.
    pub fn size(&mut self) -> Result<u64> {
        if !self.open_read()? {
            return Ok(0);
        }
        let (Some(file), Some(layout)) = (&self.file, &self.layout) else {
            return Ok(0);
        };
        let data_len = file.metadata()?.len().saturating_sub(layout.header_len);
        if data_len % layout.record_bytes != 0 {
            return Err(Error::InvalidData(format!(
                "{}: truncated record ({} trailing bytes)",
                self.path.display(),
                data_len % layout.record_bytes
            )));
        }
        Ok(data_len / layout.record_bytes)
    }

    #[inline]
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn available(&mut self) -> Result<u64> {
        Ok(self.size()?.saturating_sub(self.position))
    }

    pub fn seek(&mut self, position: u64) -> Result<()> {
        let size = self.size()?;
        if position > size {
            return Err(Error::InvalidData(format!(
                "{}: cannot seek to {position} past {size} records",
                self.path.display()
            )));
        }
        self.position = position;
        Ok(())
    }

    pub fn reset(&mut self) -> Result<()> {
        self.seek(0)
    }

    /// Up to `max` records from the cursor; `None` at end of file.
    pub fn read(&mut self, max: usize) -> Result<Option<Tensor>> {
        let n = self.available()?.min(max as u64);
        if n == 0 {
            return Ok(None);
        }
        let (Some(file), Some(layout)) = (self.file.as_mut(), self.layout.as_ref()) else {
            return Ok(None);
        };
        file.seek(SeekFrom::Start(
            layout.header_len + self.position * layout.record_bytes,
        ))?;
        let mut buf = vec![0u8; (n * layout.record_bytes) as usize];
        file.read_exact(&mut buf)?;
        let data = buf
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        let shape = std::iter::once(n as usize)
            .chain(layout.record_shape.iter().copied())
            .collect();
        self.position += n;
        Tensor::from_shape_vec(shape, data).map(Some)
    }

    /// Every record, leaving the cursor at end of file.
    pub fn read_all(&mut self) -> Result<Option<Tensor>> {
        self.seek(0)?;
        let n = self.size()?;
        self.read(n as usize)
    }

    /// Append every record of `tensor`; the cursor moves to end of file.
    pub fn write(&mut self, tensor: &Tensor) -> Result<()> {
        if tensor.record_len() == 0 {
            return Err(Error::InvalidShape(format!(
                "{}: records of shape {:?} are empty",
                self.path.display(),
                tensor.record_shape()
            )));
        }
        self.open_write()?;
        let header = match &self.layout {
            Some(layout) if layout.record_shape != tensor.record_shape() => {
                return Err(Error::InvalidShape(format!(
                    "{}: record shape {:?} does not match file shape {:?}",
                    self.path.display(),
                    tensor.record_shape(),
                    layout.record_shape
                )));
            }
            Some(_) => None,
            None => Some(Layout::new(tensor.record_shape()).ok_or_else(|| {
                Error::InvalidShape(format!(
                    "{}: record shape {:?} is too large",
                    self.path.display(),
                    tensor.record_shape()
                ))
            })?),
        };

        let mut bytes = Vec::with_capacity(tensor.len() * 4 + 64);
        if let Some(layout) = &header {
            bytes.extend_from_slice(&layout.header_bytes());
        }
        for v in tensor.data() {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let file = self.open_write()?;
        file.seek(SeekFrom::End(0))?;
        file.write_all(&bytes)?;
        if header.is_some() {
            self.layout = header;
        }
        self.position = self.size()?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }

    /// Drop all records; the next write starts a new file.
    pub fn clear(&mut self) -> Result<()> {
        self.close();
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.position = 0;
        Ok(())
    }

    /// Release the file handle; the cursor is kept.
    pub fn close(&mut self) {
        self.file = None;
        self.layout = None;
        self.writable = false;
    }
}

/// Entries of `map` under `prefix`, with the prefix stripped.
/// The entry at `prefix` itself is returned as [`SELF_KEY`].
pub fn children<V: Clone>(map: &BTreeMap<String, V>, prefix: &str) -> BTreeMap<String, V> {
    map.iter()
        .filter_map(|(key, v)| strip_key(key, prefix).map(|k| (k.to_owned(), v.clone())))
        .collect()
}

/// Entries whose key equals, or lies under, one of `prefixes`.
pub fn filter<V: Clone>(map: &BTreeMap<String, V>, prefixes: &[&str]) -> BTreeMap<String, V> {
    map.iter()
        .filter(|(key, _)| prefixes.iter().any(|p| strip_key(key, p).is_some()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn strip_key<'a>(key: &'a str, prefix: &str) -> Option<&'a str> {
    if prefix.is_empty() {
        return Some(key);
    }
    if key == prefix {
        return Some(SELF_KEY);
    }
    key.strip_prefix(prefix)?.strip_prefix('.')
}

/// Add an entry for every internal key that has no entry of its own:
/// the feature-axis concatenation of all its descendants, in key order.
pub fn with_aggregates(leaves: TensorMap) -> Result<TensorMap> {
    let mut groups: BTreeMap<String, Vec<&str>> = BTreeMap::new();
    for key in leaves.keys() {
        let mut end = 0;
        while let Some(dot) = key[end..].find('.') {
            end += dot;
            let parent = &key[..end];
            if !parent.is_empty() && !leaves.contains_key(parent) {
                groups.entry(parent.to_owned()).or_default().push(key);
            }
            end += 1;
        }
    }
    let mut aggregates = TensorMap::new();
    for (parent, keys) in groups {
        let parts: Vec<&Tensor> = keys.iter().map(|k| &leaves[*k]).collect();
        aggregates.insert(parent, Tensor::hconcat(&parts)?);
    }
    let mut out = leaves;
    out.extend(aggregates);
    Ok(out)
}

/// A set of record files under dotted keys, read in lock-step.
#[derive(Debug, Default)]
pub struct Dataset {
    files: BTreeMap<String, RecordFile>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record file found under `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        Self::new().add_read(root)
    }

    /// Add every record file found under `root`; keys must not clash.
    pub fn add_read(mut self, root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let mut found = Vec::new();
        scan(root, root, &mut found)?;
        debug!(root = %root.display(), files = found.len(), "dataset scanned");
        for key in found {
            let file = RecordFile::by_key(root, &key);
            self.insert(key, file)?;
        }
        Ok(self)
    }

    /// Add `keys` under `root`; every file must already exist.
    pub fn add_existing(mut self, root: impl AsRef<Path>, keys: &[&str]) -> Result<Self> {
        let root = root.as_ref();
        for key in keys {
            let file = RecordFile::by_key(root, key);
            if !file.exists() {
                return Err(Error::InvalidData(format!(
                    "missing dataset `{key}` at {}",
                    file.path().display()
                )));
            }
            self.insert((*key).to_owned(), file)?;
        }
        Ok(self)
    }

    /// Add fresh, empty files for `keys` under `root`.
    pub fn add_write(mut self, root: impl AsRef<Path>, keys: &[&str]) -> Result<Self> {
        let root = root.as_ref();
        for key in keys {
            let file = RecordFile::create_by_key(root, key)?;
            self.insert((*key).to_owned(), file)?;
        }
        Ok(self)
    }

    pub fn insert(&mut self, key: String, file: RecordFile) -> Result<()> {
        if self.files.contains_key(&key) {
            return Err(Error::DuplicateName(key));
        }
        self.files.insert(key, file);
        Ok(())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.files.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut RecordFile> {
        self.files.get_mut(key)
    }

    /// Same files on fresh handles; cursors start where these are.
    pub fn dup(&self) -> Dataset {
        let files = self
            .files
            .iter()
            .map(|(k, f)| (k.clone(), f.dup()))
            .collect();
        Dataset { files }
    }

    /// Sub-dataset under `prefix` with the prefix stripped, on fresh handles.
    pub fn children(&self, prefix: &str) -> Dataset {
        let files = self
            .files
            .iter()
            .filter_map(|(key, f)| strip_key(key, prefix).map(|k| (k.to_owned(), f.dup())))
            .collect();
        Dataset { files }
    }

    /// Sub-dataset of the keys equal to or under `prefixes`, on fresh handles.
    pub fn filter(&self, prefixes: &[&str]) -> Dataset {
        let files = self
            .files
            .iter()
            .filter(|(key, _)| prefixes.iter().any(|p| strip_key(key, p).is_some()))
            .map(|(k, f)| (k.clone(), f.dup()))
            .collect();
        Dataset { files }
    }

    /// Common record count; fails if the files disagree.
    pub fn size(&mut self) -> Result<u64> {
        let mut size: Option<(u64, &str)> = None;
        for (key, file) in self.files.iter_mut() {
            let n = file.size()?;
            match size {
                None => size = Some((n, key)),
                Some((m, first)) if m != n => {
                    return Err(Error::InvalidData(format!(
                        "dataset `{key}` has {n} records, `{first}` has {m}"
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(size.map_or(0, |(n, _)| n))
    }

    /// Record counts of every file.
    pub fn sizes(&mut self) -> Result<BTreeMap<String, u64>> {
        self.files
            .iter_mut()
            .map(|(k, f)| Ok((k.clone(), f.size()?)))
            .collect()
    }

    /// Check that every file holds records of the given shape.
    pub fn validate_shapes(&mut self, shapes: &BTreeMap<String, Vec<usize>>) -> Result<()> {
        for (key, expected) in shapes {
            let Some(file) = self.files.get_mut(key) else {
                return Err(Error::InvalidData(format!("missing dataset `{key}`")));
            };
            if let Some(shape) = file.record_shape()?
                && &shape != expected
            {
                return Err(Error::InvalidShape(format!(
                    "dataset `{key}` has records {shape:?}, expected {expected:?}"
                )));
            }
        }
        Ok(())
    }

    pub fn seek(&mut self, position: u64) -> Result<()> {
        for file in self.files.values_mut() {
            file.seek(position)?;
        }
        Ok(())
    }

    pub fn reset(&mut self) -> Result<()> {
        self.seek(0)
    }

    /// Records left before the first file runs out.
    pub fn available(&mut self) -> Result<u64> {
        let mut min: Option<u64> = None;
        for file in self.files.values_mut() {
            let n = file.available()?;
            min = Some(min.map_or(n, |m| m.min(n)));
        }
        Ok(min.unwrap_or(0))
    }

    /// Up to `max` records from every file, plus aggregates; `None` as soon
    /// as any file is exhausted.
    pub fn read(&mut self, max: usize) -> Result<Option<TensorMap>> {
        let n = self.available()?.min(max as u64) as usize;
        if n == 0 {
            return Ok(None);
        }
        let mut leaves = TensorMap::new();
        for (key, file) in self.files.iter_mut() {
            let Some(t) = file.read(n)? else {
                return Err(Error::InvalidData(format!("dataset `{key}` ended early")));
            };
            leaves.insert(key.clone(), t);
        }
        with_aggregates(leaves).map(Some)
    }

    /// Append one tensor per key; every key must belong to this dataset.
    pub fn write(&mut self, records: &TensorMap) -> Result<()> {
        for (key, tensor) in records {
            let Some(file) = self.files.get_mut(key) else {
                return Err(Error::InvalidData(format!("no dataset file for `{key}`")));
            };
            file.write(tensor)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        for file in self.files.values_mut() {
            file.flush()?;
        }
        Ok(())
    }

    pub fn clear(&mut self) -> Result<()> {
        for file in self.files.values_mut() {
            file.clear()?;
        }
        Ok(())
    }

    pub fn close(&mut self) {
        for file in self.files.values_mut() {
            file.close();
        }
    }
}

fn scan(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
    let mut entries = fs::read_dir(dir)?.collect::<io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let path = entry.path();
        if path.is_dir() {
            scan(root, &path, out)?;
        } else if entry.file_name() == RECORD_FILE_NAME {
            let rel = dir.strip_prefix(root).unwrap_or(dir);
            let parts: Vec<String> = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            if parts.is_empty() {
                out.push(SELF_KEY.to_owned());
            } else {
                out.push(parts.join("."));
            }
        }
    }
    Ok(())
}
