//! Checkpoint manifest: parameter values keyed by logical name and store id,
//! plus the optimizer's moment snapshot. One bincode file per checkpoint.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{LstmError, Result};
use crate::optimizer::OptimizerSnapshot;
use crate::params::{LstmDims, ParamName};
use crate::tensor::Shape;

pub const CHECKPOINT_VERSION: &str = "lstm-1-bin";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CheckpointEntry {
    pub name: String,
    pub id: String,
    pub shape: Shape,
    pub data: Vec<f32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Checkpoint {
    pub version: String,
    pub timestamp: String,
    /// JSON text, free-form.
    pub metadata: Option<String>,
    pub dims: LstmDims,
    pub entries: Vec<CheckpointEntry>,
    pub optimizer: OptimizerSnapshot,
}

impl Checkpoint {
    pub fn entry(&self, name: ParamName) -> Option<&CheckpointEntry> {
        self.entries.iter().find(|e| e.name == name.as_str())
    }

    pub fn metadata_json(&self) -> Result<Option<serde_json::Value>> {
        match &self.metadata {
            Some(s) => Ok(Some(serde_json::from_str(s)?)),
            None => Ok(None),
        }
    }

    pub fn parameter_count(&self) -> usize {
        self.entries.iter().map(|e| e.data.len()).sum()
    }
}

/// What `peek_checkpoint` reports without restoring anything.
#[derive(Clone, Debug)]
pub struct CheckpointInfo {
    pub version: String,
    pub timestamp: String,
    pub metadata: Option<String>,
    pub dims: LstmDims,
    pub tensors: usize,
    pub parameter_count: usize,
    pub optimizer_layers: usize,
    /// Largest per-layer Adam step counter.
    pub optimizer_step: u64,
}

pub fn save_checkpoint(path: impl AsRef<Path>, cp: &Checkpoint) -> Result<u64> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    {
        let mut w = BufWriter::new(File::create(&tmp)?);
        bincode::serialize_into(&mut w, cp)?;
        w.flush()?;
        w.get_ref().sync_data()?;
    }
    fs::rename(&tmp, path)?;
    let bytes = fs::metadata(path)?.len();
    info!(
        "saved checkpoint to {} ({} tensors, {:.2} MB)",
        path.display(),
        cp.entries.len(),
        bytes as f64 / 1_048_576.0
    );
    Ok(bytes)
}

pub fn load_checkpoint(path: impl AsRef<Path>) -> Result<Checkpoint> {
    let path = path.as_ref();
    let cp: Checkpoint = bincode::deserialize_from(BufReader::new(File::open(path)?))?;
    if cp.version != CHECKPOINT_VERSION {
        return Err(LstmError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{}: checkpoint version `{}`, expected `{}`", path.display(), cp.version, CHECKPOINT_VERSION),
        )));
    }
    info!(
        "loaded checkpoint from {} ({} params, saved {})",
        path.display(),
        cp.parameter_count(),
        cp.timestamp
    );
    Ok(cp)
}

pub fn peek_checkpoint(path: impl AsRef<Path>) -> Result<CheckpointInfo> {
    let cp = load_checkpoint(path)?;
    Ok(CheckpointInfo {
        tensors: cp.entries.len(),
        parameter_count: cp.parameter_count(),
        optimizer_layers: cp.optimizer.layers.len(),
        optimizer_step: cp.optimizer.layers.iter().map(|l| l.t).max().unwrap_or(0),
        version: cp.version,
        timestamp: cp.timestamp,
        metadata: cp.metadata,
        dims: cp.dims,
    })
}

/// UTC `YYYY-MM-DDTHH:MM:SS.mmmZ`.
pub fn iso_timestamp() -> String {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    let (secs, ms) = (now.as_secs() as i64, now.subsec_millis());
    let (days, tod) = (secs / 86400, secs % 86400);
    let (h, m, s) = (tod / 3600, (tod % 3600) / 60, tod % 60);
    let is_leap = |y: i64| (y % 4 == 0 && y % 100 != 0) || y % 400 == 0;
    let mut year = 1970i64;
    let mut rd = days;
    loop {
        let diy = if is_leap(year) { 366 } else { 365 };
        if rd < diy {
            break;
        }
        rd -= diy;
        year += 1;
    }
    let month_days = [31, if is_leap(year) { 29 } else { 28 }, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];
    let mut month = 0;
    for d in month_days {
        if rd < d {
            break;
        }
        rd -= d;
        month += 1;
    }
    format!("{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:03}Z", year, month + 1, rd + 1, h, m, s, ms)
}
