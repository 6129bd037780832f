//! Per-timestep forward intermediates, paged to disk for the backward pass.
//!
//! Two append-only files per cache: the data log holds ten codec blocks per
//! step, the index log holds ten `(name, offset)` entries per step. The k-th
//! index block describes the k-th data record, so any timestep can be read
//! back without touching the others.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, trace, warn};

use crate::codec;
use crate::engine::ComputeEngine;
use crate::error::{LstmError, Result};
use crate::params::LstmDims;
use crate::tensor::{Shape, Tensor};

pub const STEP_FIELDS: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StepField {
    Input,
    HiddenPrev,
    CellPrev,
    ForgetGate,
    InputGate,
    CellCandidate,
    OutputGate,
    CellNext,
    TanhCellNext,
    HiddenNext,
}

impl StepField {
    pub const ALL: [StepField; STEP_FIELDS] = [
        StepField::Input,
        StepField::HiddenPrev,
        StepField::CellPrev,
        StepField::ForgetGate,
        StepField::InputGate,
        StepField::CellCandidate,
        StepField::OutputGate,
        StepField::CellNext,
        StepField::TanhCellNext,
        StepField::HiddenNext,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StepField::Input => "Input",
            StepField::HiddenPrev => "HiddenPrev",
            StepField::CellPrev => "CellPrev",
            StepField::ForgetGate => "ForgetGate",
            StepField::InputGate => "InputGate",
            StepField::CellCandidate => "CellCandidate",
            StepField::OutputGate => "OutputGate",
            StepField::CellNext => "CellNext",
            StepField::TanhCellNext => "TanhCellNext",
            StepField::HiddenNext => "HiddenNext",
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn shape(self, dims: &StepDims) -> Shape {
        match self {
            StepField::Input => Shape::matrix(1, dims.embed_size),
            _ => Shape::matrix(1, dims.hidden_size),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StepDims {
    pub embed_size: usize,
    pub hidden_size: usize,
}

impl From<LstmDims> for StepDims {
    fn from(d: LstmDims) -> Self {
        StepDims { embed_size: d.embed_size, hidden_size: d.hidden_size }
    }
}

/// The ten tensors one timestep leaves behind for backprop.
#[derive(Debug)]
pub struct StepRecord {
    pub input: Tensor,
    pub hidden_prev: Tensor,
    pub cell_prev: Tensor,
    pub forget_gate: Tensor,
    pub input_gate: Tensor,
    pub cell_candidate: Tensor,
    pub output_gate: Tensor,
    pub cell_next: Tensor,
    pub tanh_cell_next: Tensor,
    pub hidden_next: Tensor,
}

impl StepRecord {
    pub fn get(&self, field: StepField) -> &Tensor {
        match field {
            StepField::Input => &self.input,
            StepField::HiddenPrev => &self.hidden_prev,
            StepField::CellPrev => &self.cell_prev,
            StepField::ForgetGate => &self.forget_gate,
            StepField::InputGate => &self.input_gate,
            StepField::CellCandidate => &self.cell_candidate,
            StepField::OutputGate => &self.output_gate,
            StepField::CellNext => &self.cell_next,
            StepField::TanhCellNext => &self.tanh_cell_next,
            StepField::HiddenNext => &self.hidden_next,
        }
    }

    pub fn into_tensors(self) -> [Tensor; STEP_FIELDS] {
        [
            self.input,
            self.hidden_prev,
            self.cell_prev,
            self.forget_gate,
            self.input_gate,
            self.cell_candidate,
            self.output_gate,
            self.cell_next,
            self.tanh_cell_next,
            self.hidden_next,
        ]
    }
}

/// Result of a partial retrieval: only the requested fields are present.
#[derive(Debug)]
pub struct StepTensors {
    timestep: usize,
    slots: [Option<Tensor>; STEP_FIELDS],
}

impl StepTensors {
    pub fn timestep(&self) -> usize {
        self.timestep
    }

    pub fn get(&self, field: StepField) -> Option<&Tensor> {
        self.slots[field.index()].as_ref()
    }

    pub fn take(&mut self, field: StepField) -> Result<Tensor> {
        self.slots[field.index()]
            .take()
            .ok_or_else(|| LstmError::not_found("step field", format!("{} at timestep {}", field.as_str(), self.timestep)))
    }

    fn into_record(mut self) -> Result<StepRecord> {
        Ok(StepRecord {
            input: self.take(StepField::Input)?,
            hidden_prev: self.take(StepField::HiddenPrev)?,
            cell_prev: self.take(StepField::CellPrev)?,
            forget_gate: self.take(StepField::ForgetGate)?,
            input_gate: self.take(StepField::InputGate)?,
            cell_candidate: self.take(StepField::CellCandidate)?,
            output_gate: self.take(StepField::OutputGate)?,
            cell_next: self.take(StepField::CellNext)?,
            tanh_cell_next: self.take(StepField::TanhCellNext)?,
            hidden_next: self.take(StepField::HiddenNext)?,
        })
    }
}

pub struct StepCache<E: ComputeEngine> {
    engine: Arc<E>,
    dims: StepDims,
    data_path: PathBuf,
    index_path: PathBuf,
    data: File,
    index: File,
    data_len: u64,
    index_len: u64,
    blocks: Vec<[u64; STEP_FIELDS]>,
    sync_writes: bool,
    disposed: bool,
}

impl<E: ComputeEngine> StepCache<E> {
    /// Create (or truncate) `dir/name.data` and `dir/name.index`.
    pub fn create(engine: Arc<E>, dir: impl AsRef<Path>, name: &str, dims: StepDims) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let data_path = dir.join(format!("{}.data", name));
        let index_path = dir.join(format!("{}.index", name));
        let open = |p: &Path| {
            OpenOptions::new().read(true).write(true).create(true).truncate(true).open(p)
        };
        let data = open(&data_path)?;
        let index = open(&index_path)?;
        debug!("step cache: opened {:?}", data_path);
        Ok(StepCache {
            engine,
            dims,
            data_path,
            index_path,
            data,
            index,
            data_len: 0,
            index_len: 0,
            blocks: Vec::new(),
            sync_writes: true,
            disposed: false,
        })
    }

    /// Skip `fsync` after each step. Writes still reach the OS before
    /// `cache_step` returns.
    pub fn set_sync_writes(&mut self, sync: bool) {
        self.sync_writes = sync;
    }

    pub fn dims(&self) -> StepDims {
        self.dims
    }

    /// Number of recorded timesteps.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn data_bytes(&self) -> u64 {
        self.data_len
    }

    pub fn paths(&self) -> (&Path, &Path) {
        (&self.data_path, &self.index_path)
    }

    /// Append `record` as the next timestep and return its number.
    pub fn cache_step(&mut self, record: &StepRecord) -> Result<usize> {
        let t = self.blocks.len();
        for field in StepField::ALL {
            let expected = field.shape(&self.dims);
            let got = record.get(field);
            if got.shape() != &expected {
                return Err(LstmError::shape_mismatch(
                    format!("step {} field {} {}", t, field.as_str(), got.shape()),
                    expected.len(),
                    got.len(),
                ));
            }
        }

        self.engine.synchronize();
        let mut data_buf = Vec::new();
        let mut index_buf = Vec::new();
        let mut offsets = [0u64; STEP_FIELDS];
        for field in StepField::ALL {
            let offset = self.data_len + data_buf.len() as u64;
            offsets[field.index()] = offset;
            codec::encode_block(&self.engine.to_host(record.get(field)), &mut data_buf);
            codec::encode_index_entry(field.as_str(), offset, &mut index_buf);
        }

        // Drop any tail left by an earlier failed append.
        self.data.set_len(self.data_len)?;
        self.index.set_len(self.index_len)?;
        self.data.seek(SeekFrom::Start(self.data_len))?;
        self.data.write_all(&data_buf)?;
        self.index.seek(SeekFrom::Start(self.index_len))?;
        self.index.write_all(&index_buf)?;
        self.data.flush()?;
        self.index.flush()?;
        if self.sync_writes {
            self.data.sync_data()?;
            self.index.sync_data()?;
        }

        self.data_len += data_buf.len() as u64;
        self.index_len += index_buf.len() as u64;
        self.blocks.push(offsets);
        trace!("step cache: step {} cached ({} bytes)", t, data_buf.len());
        Ok(t)
    }

    /// Read back the requested fields of timestep `t`, in on-disk order.
    pub fn retrieve(&mut self, t: usize, fields: &[StepField]) -> Result<StepTensors> {
        let offsets = *self.blocks.get(t).ok_or_else(|| {
            LstmError::not_found("timestep", format!("{} ({} recorded)", t, self.blocks.len()))
        })?;
        let mut order: Vec<StepField> = fields.to_vec();
        order.sort_by_key(|f| offsets[f.index()]);
        order.dedup();

        let mut slots: [Option<Tensor>; STEP_FIELDS] = std::array::from_fn(|_| None);
        let mut reader = BufReader::new(&self.data);
        let mut pos = None;
        for field in order {
            let offset = offsets[field.index()];
            if pos != Some(offset) {
                reader.seek(SeekFrom::Start(offset))?;
            }
            let shape = field.shape(&self.dims);
            let context = format!("step {} field {}", t, field.as_str());
            let values = codec::read_block(&mut reader, shape.len(), &context)?;
            pos = Some(offset + codec::block_len(shape.len()));
            slots[field.index()] = Some(self.engine.from_host(values, shape)?);
        }
        Ok(StepTensors { timestep: t, slots })
    }

    /// All ten tensors of timestep `t`.
    pub fn retrieve_record(&mut self, t: usize) -> Result<StepRecord> {
        self.retrieve(t, &StepField::ALL)?.into_record()
    }

    /// Re-parse the index log from disk, checking the field order of every
    /// block.
    pub fn read_index_log(&self) -> Result<Vec<[u64; STEP_FIELDS]>> {
        let mut reader = BufReader::new(File::open(&self.index_path)?);
        let mut blocks = Vec::new();
        loop {
            let mut block = [0u64; STEP_FIELDS];
            for (k, field) in StepField::ALL.iter().enumerate() {
                let entry = codec::read_index_entry(&mut reader)?;
                let (name, offset) = match entry {
                    Some(e) => e,
                    None if k == 0 => return Ok(blocks),
                    None => {
                        return Err(LstmError::Io(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            format!("index block {} truncated after {} entries", blocks.len(), k),
                        )))
                    }
                };
                if name != field.as_str() {
                    return Err(LstmError::Io(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("index block {} entry {} is `{}`, expected `{}`", blocks.len(), k, name, field.as_str()),
                    )));
                }
                block[k] = offset;
            }
            blocks.push(block);
        }
    }

    /// Empty both logs but keep the files open for the next sequence.
    pub fn reset(&mut self) -> Result<()> {
        self.data.set_len(0)?;
        self.index.set_len(0)?;
        self.data.seek(SeekFrom::Start(0))?;
        self.index.seek(SeekFrom::Start(0))?;
        let n = self.blocks.len();
        self.blocks.clear();
        self.data_len = 0;
        self.index_len = 0;
        debug!("step cache: reset after {} steps", n);
        Ok(())
    }

    /// Close the cache and delete its files.
    pub fn dispose(mut self) -> Result<()> {
        self.disposed = true;
        self.blocks.clear();
        fs::remove_file(&self.data_path)?;
        fs::remove_file(&self.index_path)?;
        debug!("step cache: disposed {:?}", self.data_path);
        Ok(())
    }
}

impl<E: ComputeEngine> Drop for StepCache<E> {
    fn drop(&mut self) {
        if self.disposed {
            return;
        }
        for p in [&self.data_path, &self.index_path] {
            if let Err(e) = fs::remove_file(p) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("step cache: failed to remove {:?}: {}", p, e);
                }
            }
        }
    }
}
