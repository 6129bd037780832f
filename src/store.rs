//! ID-addressed tensor records on local disk.
//!
//! Each record is one file `<id>.tensor` holding a single codec block. The
//! manifest (shape, name, access stats) stays in memory. A store owns one
//! session directory: opening a session wipes any leftover directory of the
//! same name, and dropping the store removes it.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::mem;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use log::{debug, trace, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::codec;
use crate::engine::ComputeEngine;
use crate::error::{LstmError, Result};
use crate::tensor::{Shape, Tensor};

#[derive(Clone, Debug)]
pub struct StoreRecord {
    pub id: String,
    pub name: String,
    pub shape: Shape,
    pub path: PathBuf,
    pub bytes: u64,
    pub created_at: SystemTime,
    pub last_accessed: SystemTime,
    pub access_count: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub count: usize,
    pub bytes_on_disk: u64,
    /// Approximate in-memory manifest size.
    pub index_bytes: usize,
    pub total_accesses: u64,
}

pub struct TensorStore<E: ComputeEngine> {
    engine: Arc<E>,
    root: PathBuf,
    records: HashMap<String, StoreRecord>,
    rng: StdRng,
    next_seq: u64,
}

impl<E: ComputeEngine> TensorStore<E> {
    /// Open the namespace `base_dir/session`, clearing anything already there.
    pub fn new(engine: Arc<E>, base_dir: impl AsRef<Path>, session: &str) -> Result<Self> {
        check_component("session", session)?;
        let root = base_dir.as_ref().join(session);
        if root.exists() {
            debug!("store: clearing stale namespace {:?}", root);
            fs::remove_dir_all(&root)?;
        }
        fs::create_dir_all(&root)?;
        Ok(TensorStore {
            engine,
            root,
            records: HashMap::new(),
            rng: StdRng::from_entropy(),
            next_seq: 0,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn create_and_store(&mut self, data: Vec<f32>, shape: Shape, name: &str) -> Result<String> {
        let t = self.engine.from_host(data, shape)?;
        self.store_tensor(t, name)
    }

    pub fn create_and_store_zeros(&mut self, shape: Shape, name: &str) -> Result<String> {
        let t = self.engine.allocate(&shape)?;
        self.store_tensor(t, name)
    }

    /// Move a live tensor into the store.
    pub fn store_tensor(&mut self, t: Tensor, name: &str) -> Result<String> {
        let id = self.fresh_id(name);
        self.insert(id.clone(), &t, name)?;
        Ok(id)
    }

    /// Recreate a record under a caller-chosen id (checkpoint restore).
    pub fn insert_with_id(&mut self, id: &str, data: Vec<f32>, shape: Shape, name: &str) -> Result<()> {
        check_component("record id", id)?;
        if self.records.contains_key(id) {
            return Err(LstmError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("store id `{}` already in use", id),
            )));
        }
        let t = self.engine.from_host(data, shape)?;
        self.insert(id.to_string(), &t, name)
    }

    pub fn load(&mut self, id: &str) -> Result<Tensor> {
        let rec = self.records.get_mut(id).ok_or_else(|| LstmError::not_found("tensor record", id))?;
        let mut reader = BufReader::new(File::open(&rec.path)?);
        let context = format!("store record `{}` ({}) {}", rec.id, rec.name, rec.shape);
        let data = codec::read_block(&mut reader, rec.shape.len(), &context)?;
        rec.last_accessed = SystemTime::now();
        rec.access_count += 1;
        let shape = rec.shape.clone();
        trace!("store: load {} {}", id, shape);
        self.engine.from_host(data, shape)
    }

    /// Load, mutate in place, write back. The id is unchanged, and nothing is
    /// written if `f` fails.
    pub fn update<T>(&mut self, id: &str, f: impl FnOnce(&mut Tensor) -> Result<T>) -> Result<T> {
        let mut t = self.load(id)?;
        let out = f(&mut t)?;
        let path = self.path_for(id);
        let bytes = self.write_file(&path, &t)?;
        if let Some(rec) = self.records.get_mut(id) {
            rec.bytes = bytes;
        }
        Ok(out)
    }

    /// Copy a record under a new id.
    pub fn clone_record(&mut self, id: &str, name: &str) -> Result<String> {
        let t = self.load(id)?;
        self.store_tensor(t, name)
    }

    /// Remove a record. Unknown ids are ignored; file removal is best effort.
    pub fn delete(&mut self, id: &str) {
        if let Some(rec) = self.records.remove(id) {
            if let Err(e) = fs::remove_file(&rec.path) {
                warn!("store: failed to remove {:?}: {}", rec.path, e);
            }
            debug!("store: deleted {} ({})", id, rec.name);
        }
    }

    pub fn shape_of(&self, id: &str) -> Result<Shape> {
        self.records
            .get(id)
            .map(|r| r.shape.clone())
            .ok_or_else(|| LstmError::not_found("tensor record", id))
    }

    pub fn name_of(&self, id: &str) -> Option<&str> {
        self.records.get(id).map(|r| r.name.as_str())
    }

    pub fn record(&self, id: &str) -> Option<&StoreRecord> {
        self.records.get(id)
    }

    /// Ids whose record name contains `filter` (all ids when `None`), sorted.
    pub fn list(&self, filter: Option<&str>) -> Vec<String> {
        let mut ids: Vec<String> = self
            .records
            .values()
            .filter(|r| filter.map_or(true, |f| r.name.contains(f)))
            .map(|r| r.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn stats(&self) -> StoreStats {
        let mut stats = StoreStats { count: self.records.len(), ..StoreStats::default() };
        for r in self.records.values() {
            stats.bytes_on_disk += r.bytes;
            stats.total_accesses += r.access_count;
            stats.index_bytes += mem::size_of::<StoreRecord>()
                + r.id.len()
                + r.name.len()
                + r.path.as_os_str().len()
                + r.shape.rank() * mem::size_of::<usize>();
        }
        stats
    }

    fn insert(&mut self, id: String, t: &Tensor, name: &str) -> Result<()> {
        let path = self.path_for(&id);
        let bytes = self.write_file(&path, t)?;
        let now = SystemTime::now();
        debug!("store: created {} ({}) {}", id, name, t.shape());
        self.records.insert(
            id.clone(),
            StoreRecord {
                id,
                name: name.to_string(),
                shape: t.shape().clone(),
                path,
                bytes,
                created_at: now,
                last_accessed: now,
                access_count: 0,
            },
        );
        Ok(())
    }

    fn write_file(&self, path: &Path, t: &Tensor) -> Result<u64> {
        self.engine.synchronize();
        let tmp = path.with_extension("tensor.tmp");
        {
            let mut w = BufWriter::new(File::create(&tmp)?);
            codec::write_block(&mut w, &self.engine.to_host(t))?;
            w.flush()?;
            w.get_ref().sync_data()?;
        }
        fs::rename(&tmp, path)?;
        Ok(codec::block_len(t.len()))
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}.tensor", id))
    }

    fn fresh_id(&mut self, name: &str) -> String {
        let slug: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .take(32)
            .collect();
        loop {
            self.next_seq += 1;
            let id = format!("{}-{:06x}-{:08x}", slug, self.next_seq, self.rng.gen::<u32>());
            if !self.records.contains_key(&id) {
                return id;
            }
        }
    }
}

/// `value` must name a single entry directly under its parent directory.
fn check_component(kind: &str, value: &str) -> Result<()> {
    let mut parts = Path::new(value).components();
    match (parts.next(), parts.next()) {
        (Some(Component::Normal(part)), None) if part == value => Ok(()),
        _ => Err(LstmError::InvalidConfig(format!("{} `{}` is not a single path component", kind, value))),
    }
}

impl<E: ComputeEngine> Drop for TensorStore<E> {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.root) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("store: failed to remove namespace {:?}: {}", self.root, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CpuEngine;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> TensorStore<CpuEngine> {
        TensorStore::new(Arc::new(CpuEngine::new()), dir.path(), "session").unwrap()
    }

    #[test]
    fn store_then_load_reproduces_shape_and_values() {
        let dir = TempDir::new().unwrap();
        let mut s = store(&dir);
        let data: Vec<f32> = (0..12).map(|i| i as f32 * 0.5 - 3.0).collect();
        let id = s.create_and_store(data.clone(), Shape::matrix(3, 4), "w_f").unwrap();
        let t = s.load(&id).unwrap();
        assert_eq!(t.shape(), &Shape::matrix(3, 4));
        assert_eq!(t.as_slice(), data.as_slice());
        assert_eq!(s.shape_of(&id).unwrap(), Shape::matrix(3, 4));
        assert_eq!(s.name_of(&id), Some("w_f"));
    }

    #[test]
    fn identity_update_leaves_record_unchanged() {
        let dir = TempDir::new().unwrap();
        let mut s = store(&dir);
        let id = s.create_and_store(vec![1.0, 2.0, 3.0], Shape::matrix(1, 3), "b").unwrap();
        s.update(&id, |_| Ok(())).unwrap();
        assert_eq!(s.load(&id).unwrap().as_slice(), &[1.0, 2.0, 3.0]);

        s.update(&id, |t| {
            t.as_mut_slice()[1] = 20.0;
            Ok(())
        })
        .unwrap();
        assert_eq!(s.load(&id).unwrap().as_slice(), &[1.0, 20.0, 3.0]);
    }

    #[test]
    fn failed_update_does_not_write() {
        let dir = TempDir::new().unwrap();
        let mut s = store(&dir);
        let id = s.create_and_store(vec![1.0, 2.0], Shape::matrix(1, 2), "b").unwrap();
        let res: Result<()> = s.update(&id, |t| {
            t.as_mut_slice()[0] = f32::NAN;
            Err(LstmError::non_finite(crate::error::ValueRole::Parameter, "b"))
        });
        assert!(res.is_err());
        assert_eq!(s.load(&id).unwrap().as_slice(), &[1.0, 2.0]);
    }

    #[test]
    fn delete_invalidates_id_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut s = store(&dir);
        let id = s.create_and_store_zeros(Shape::matrix(2, 2), "tmp").unwrap();
        s.delete(&id);
        s.delete(&id);
        assert!(matches!(s.load(&id), Err(LstmError::NotFound { .. })));
        assert!(matches!(s.shape_of(&id), Err(LstmError::NotFound { .. })));
        assert!(s.is_empty());
    }

    #[test]
    fn clone_record_copies_under_new_id() {
        let dir = TempDir::new().unwrap();
        let mut s = store(&dir);
        let id = s.create_and_store(vec![4.0, 5.0], Shape::matrix(1, 2), "w").unwrap();
        let copy = s.clone_record(&id, "w_copy").unwrap();
        assert_ne!(id, copy);
        s.update(&id, |t| {
            t.as_mut_slice()[0] = 0.0;
            Ok(())
        })
        .unwrap();
        assert_eq!(s.load(&copy).unwrap().as_slice(), &[4.0, 5.0]);
        assert_eq!(s.list(Some("copy")), vec![copy]);
        assert_eq!(s.list(None).len(), 2);
    }

    #[test]
    fn truncated_file_is_reported_as_shape_mismatch() {
        let dir = TempDir::new().unwrap();
        let mut s = store(&dir);
        let id = s.create_and_store(vec![1.0; 6], Shape::matrix(2, 3), "w").unwrap();
        let path = s.record(&id).unwrap().path.clone();
        let mut bytes = Vec::new();
        codec::encode_block(&[1.0; 4], &mut bytes);
        fs::write(&path, bytes).unwrap();
        assert!(matches!(s.load(&id), Err(LstmError::ShapeMismatch { .. })));
    }

    #[test]
    fn stats_track_bytes_and_accesses() {
        let dir = TempDir::new().unwrap();
        let mut s = store(&dir);
        let a = s.create_and_store_zeros(Shape::matrix(2, 2), "a").unwrap();
        s.create_and_store_zeros(Shape::matrix(1, 3), "b").unwrap();
        s.load(&a).unwrap();
        s.load(&a).unwrap();
        let st = s.stats();
        assert_eq!(st.count, 2);
        assert_eq!(st.bytes_on_disk, codec::block_len(4) + codec::block_len(3));
        assert_eq!(st.total_accesses, 2);
        assert!(st.index_bytes > 0);
    }

    #[test]
    fn session_must_stay_inside_the_base_dir() {
        let parent = TempDir::new().unwrap();
        let base = parent.path().join("work");
        fs::create_dir_all(&base).unwrap();
        fs::write(base.join("precious.txt"), b"keep").unwrap();
        fs::write(parent.path().join("sibling.txt"), b"keep").unwrap();

        for session in ["", ".", "..", "a/b", "../x", "/abs"] {
            let res = TensorStore::new(Arc::new(CpuEngine::new()), &base, session);
            assert!(matches!(res, Err(LstmError::InvalidConfig(_))), "session {:?}", session);
        }
        assert!(base.join("precious.txt").exists());
        assert!(parent.path().join("sibling.txt").exists());
    }

    #[test]
    fn restored_ids_cannot_escape_the_namespace() {
        let dir = TempDir::new().unwrap();
        let mut s = store(&dir);
        for id in ["../../x", "a/b", ".."] {
            let res = s.insert_with_id(id, vec![1.0], Shape::matrix(1, 1), "w");
            assert!(matches!(res, Err(LstmError::InvalidConfig(_))), "id {:?}", id);
        }
        assert!(s.is_empty());
        s.insert_with_id("w_f-000001-deadbeef", vec![1.0], Shape::matrix(1, 1), "w_f").unwrap();
        assert_eq!(s.list(None), vec!["w_f-000001-deadbeef".to_string()]);
    }

    #[test]
    fn namespace_is_cleared_on_open_and_removed_on_drop() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("session");
        {
            let mut s = store(&dir);
            s.create_and_store_zeros(Shape::matrix(1, 1), "x").unwrap();
            fs::write(root.join("stray.bin"), b"junk").unwrap();
        }
        assert!(!root.exists());

        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("leftover.tensor"), b"junk").unwrap();
        let s = store(&dir);
        assert_eq!(fs::read_dir(s.root()).unwrap().count(), 0);
    }
}
