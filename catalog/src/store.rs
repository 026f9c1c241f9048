//! One catalog's backing database.
//!
//! A catalog is a self-contained redb file holding every directory entry in
//! its subtree up to the next nesting, the chunk lists of its files, the
//! links to its nested children, and a property table with counters. All
//! row operations run inside an explicit write transaction; finalization
//! commits, exports the canonical table image, compresses it and digests
//! the compressed bytes; that digest is the catalog's content address.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use canopy_cas::{CasDigest, FileChunk};
use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use tracing::{debug, instrument};

use crate::entry::DirectoryEntry;
use crate::errors::CatalogError;
use crate::path::CatalogPath;

const ENTRIES: TableDefinition<&[u8], Vec<u8>> = TableDefinition::new("entries");
const CHUNKS: TableDefinition<&[u8], Vec<u8>> = TableDefinition::new("chunks");
const NESTED: TableDefinition<&[u8], Vec<u8>> = TableDefinition::new("nested");
const PROPERTIES: TableDefinition<&str, Vec<u8>> = TableDefinition::new("properties");

const SCHEMA: &[u8] = b"canopy-catalog-1";

/// Aggregated per-catalog counters, persisted on commit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Counters {
    pub entry_count: u64,
    pub chunked_file_count: u64,
    pub nested_count: u64,
    pub subtree_data_size: u64,
}

/// Link from a catalog to one nested child. The digest is absent between
/// the child's creation and its first snapshot.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct NestedLink {
    pub digest: Option<CasDigest>,
    pub size: u64,
}

/// Result of finalizing a catalog: the compressed snapshot on disk, its
/// content address, and its (compressed) size.
#[derive(Clone, Debug)]
pub struct FinalizedCatalog {
    pub local_path: PathBuf,
    pub digest: CasDigest,
    pub size: u64,
}

pub struct CatalogStore {
    db_path: PathBuf,
    db: Database,
    txn: Option<WriteTransaction>,
    dirty: bool,
    mountpoint: CatalogPath,
    revision: u64,
    previous_digest: Option<CasDigest>,
    counters: Counters,
}

impl CatalogStore {
    /// Create a fresh, empty catalog database at `db_path`.
    #[instrument(skip_all, fields(mountpoint = %mountpoint))]
    pub fn create(db_path: PathBuf, mountpoint: CatalogPath) -> Result<Self, CatalogError> {
        let db = Database::create(&db_path)?;
        let txn = db.begin_write()?;
        {
            txn.open_table(ENTRIES)?;
            txn.open_table(CHUNKS)?;
            txn.open_table(NESTED)?;
            let mut props = txn.open_table(PROPERTIES)?;
            props.insert("schema", SCHEMA.to_vec())?;
            props.insert("mountpoint", mountpoint.as_bytes().to_vec())?;
            props.insert("revision", bincode::serialize(&0u64)?)?;
            props.insert("counters", bincode::serialize(&Counters::default())?)?;
        }
        txn.commit()?;

        Ok(Self {
            db_path,
            db,
            txn: None,
            dirty: true,
            mountpoint,
            revision: 0,
            previous_digest: None,
            counters: Counters::default(),
        })
    }

    /// Open an existing (decompressed) catalog database, e.g. one fetched
    /// for lazy loading. `previous` is the digest it was published under.
    #[instrument(skip_all, fields(path = ?db_path))]
    pub fn open(db_path: PathBuf, previous: Option<CasDigest>) -> Result<Self, CatalogError> {
        let db = Database::open(&db_path)
            .map_err(|e| CatalogError::LoadFailed(format!("{db_path:?}: {e}")))?;

        let (mountpoint, revision, counters) = {
            let txn = db.begin_read()?;
            let props = txn
                .open_table(PROPERTIES)
                .map_err(|e| CatalogError::LoadFailed(e.to_string()))?;

            let schema = props
                .get("schema")?
                .ok_or_else(|| CatalogError::LoadFailed("missing schema tag".into()))?;
            if schema.value() != SCHEMA {
                return Err(CatalogError::LoadFailed("unknown catalog schema".into()));
            }

            let mountpoint = props
                .get("mountpoint")?
                .ok_or_else(|| CatalogError::LoadFailed("missing mountpoint".into()))?;
            let mountpoint = CatalogPath::new(mountpoint.value())
                .map_err(|e| CatalogError::LoadFailed(e.to_string()))?;

            let revision: u64 = match props.get("revision")? {
                Some(raw) => bincode::deserialize(&raw.value())?,
                None => 0,
            };
            let counters: Counters = match props.get("counters")? {
                Some(raw) => bincode::deserialize(&raw.value())?,
                None => Counters::default(),
            };
            (mountpoint, revision, counters)
        };

        Ok(Self {
            db_path,
            db,
            txn: None,
            dirty: false,
            mountpoint,
            revision,
            previous_digest: previous,
            counters,
        })
    }

    /// Import a fetched catalog snapshot: decompress the canonical image,
    /// replay its rows into a fresh database under `staging_dir`, and open
    /// that.
    pub fn open_compressed(
        compressed_path: &Path,
        staging_dir: &Path,
        previous: Option<CasDigest>,
    ) -> Result<Self, CatalogError> {
        let compressed = std::fs::read(compressed_path)
            .map_err(|e| CatalogError::LoadFailed(format!("{compressed_path:?}: {e}")))?;
        let raw = zstd::decode_all(Cursor::new(compressed))
            .map_err(|e| CatalogError::LoadFailed(format!("{compressed_path:?}: {e}")))?;
        let image: CatalogImage = bincode::deserialize(&raw)
            .map_err(|e| CatalogError::LoadFailed(format!("malformed catalog image: {e}")))?;

        let db_path = stage_file(staging_dir, &[])
            .map_err(|e| CatalogError::LoadFailed(e.to_string()))?;
        let db = Database::create(&db_path)?;
        let txn = db.begin_write()?;
        {
            let mut props = txn.open_table(PROPERTIES)?;
            for (key, value) in &image.properties {
                props.insert(key.as_str(), value.clone())?;
            }
            let mut entries = txn.open_table(ENTRIES)?;
            for (key, value) in &image.entries {
                entries.insert(key.as_slice(), value.clone())?;
            }
            let mut chunks = txn.open_table(CHUNKS)?;
            for (key, value) in &image.chunks {
                chunks.insert(key.as_slice(), value.clone())?;
            }
            let mut nested = txn.open_table(NESTED)?;
            for (key, value) in &image.nested {
                nested.insert(key.as_slice(), value.clone())?;
            }
        }
        txn.commit()?;
        drop(db);

        Self::open(db_path, previous)
    }

    pub fn mountpoint(&self) -> &CatalogPath {
        &self.mountpoint
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn previous_digest(&self) -> Option<&CasDigest> {
        self.previous_digest.as_ref()
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Open a write transaction. Row operations open one implicitly; the
    /// explicit form exists so callers can group work and roll it back.
    pub fn begin(&mut self) -> Result<(), CatalogError> {
        if self.txn.is_none() {
            self.txn = Some(self.db.begin_write()?);
        }
        Ok(())
    }

    pub fn commit(&mut self) -> Result<(), CatalogError> {
        if let Some(txn) = self.txn.take() {
            self.persist_properties(&txn)?;
            txn.commit()?;
        }
        Ok(())
    }

    /// Discard the open transaction and restore the counters persisted by
    /// the last commit.
    pub fn rollback(&mut self) -> Result<(), CatalogError> {
        if let Some(txn) = self.txn.take() {
            txn.abort()?;
            let txn = self.db.begin_read()?;
            let props = txn.open_table(PROPERTIES)?;
            self.counters = match props.get("counters")? {
                Some(raw) => bincode::deserialize(&raw.value())?,
                None => Counters::default(),
            };
        }
        Ok(())
    }

    fn txn(&mut self) -> Result<&WriteTransaction, CatalogError> {
        if self.txn.is_none() {
            self.txn = Some(self.db.begin_write()?);
        }
        Ok(self.txn.as_ref().unwrap())
    }

    fn persist_properties(&self, txn: &WriteTransaction) -> Result<(), CatalogError> {
        let mut props = txn.open_table(PROPERTIES)?;
        props.insert("revision", bincode::serialize(&self.revision)?)?;
        props.insert("counters", bincode::serialize(&self.counters)?)?;
        if let Some(previous) = &self.previous_digest {
            props.insert("previous", previous.as_slice().to_vec())?;
        }
        Ok(())
    }

    // - - - entry rows - - -

    pub fn get_entry(
        &mut self,
        path: &CatalogPath,
    ) -> Result<Option<DirectoryEntry>, CatalogError> {
        let txn = self.txn()?;
        let table = txn.open_table(ENTRIES)?;
        let result = match table.get(path.as_bytes())? {
            Some(raw) => Ok(Some(bincode::deserialize(&raw.value())?)),
            None => Ok(None),
        };
        result
    }

    pub fn insert_entry(
        &mut self,
        path: &CatalogPath,
        entry: &DirectoryEntry,
    ) -> Result<(), CatalogError> {
        eprintln!("DEBUG insert_entry start {:?}", path);
        let encoded = bincode::serialize(entry)?;
        {
            let txn = self.txn()?;
            let mut table = txn.open_table(ENTRIES)?;
            if table.get(path.as_bytes())?.is_some() {
                return Err(CatalogError::AlreadyExists(path.clone()));
            }
            table.insert(path.as_bytes(), encoded)?;
        }

        self.counters.entry_count += 1;
        if entry.is_regular() {
            self.counters.subtree_data_size += entry.size;
        }
        if entry.chunked {
            self.counters.chunked_file_count += 1;
        }
        self.dirty = true;
        Ok(())
    }

    pub fn update_entry(
        &mut self,
        path: &CatalogPath,
        entry: &DirectoryEntry,
    ) -> Result<(), CatalogError> {
        let encoded = bincode::serialize(entry)?;
        let old: DirectoryEntry = {
            let txn = self.txn()?;
            let mut table = txn.open_table(ENTRIES)?;
            let old: Option<DirectoryEntry> = {
                let insert_result = table.insert(path.as_bytes(), encoded)?;
                match insert_result {
                    Some(raw) => Some(bincode::deserialize(&raw.value())?),
                    None => None,
                }
            };
            let old = match old {
                Some(old) => old,
                None => {
                    table.remove(path.as_bytes())?;
                    return Err(CatalogError::NotFound(path.clone()));
                }
            };
            old
        };

        if old.is_regular() {
            self.counters.subtree_data_size -= old.size;
        }
        if entry.is_regular() {
            self.counters.subtree_data_size += entry.size;
        }
        if old.chunked != entry.chunked {
            if entry.chunked {
                self.counters.chunked_file_count += 1;
            } else {
                self.counters.chunked_file_count -= 1;
            }
        }
        self.dirty = true;
        Ok(())
    }

    pub fn remove_entry(&mut self, path: &CatalogPath) -> Result<DirectoryEntry, CatalogError> {
        let old: DirectoryEntry = {
            let txn = self.txn()?;
            let mut table = txn.open_table(ENTRIES)?;
            let remove_result = table.remove(path.as_bytes())?;
            let deserialized: Option<DirectoryEntry> = match remove_result {
                Some(raw) => Some(bincode::deserialize(&raw.value())?),
                None => None,
            };
            match deserialized {
                Some(old) => old,
                None => return Err(CatalogError::NotFound(path.clone())),
            }
        };

        self.counters.entry_count -= 1;
        if old.is_regular() {
            self.counters.subtree_data_size -= old.size;
        }
        if old.chunked {
            self.counters.chunked_file_count -= 1;
        }
        self.dirty = true;
        Ok(old)
    }

    /// Direct children of `dir`, in path order.
    pub fn list_children(
        &mut self,
        dir: &CatalogPath,
    ) -> Result<Vec<(CatalogPath, DirectoryEntry)>, CatalogError> {
        eprintln!("DEBUG list_children start {:?}", dir);
        let base_depth = dir.depth();
        Ok(self
            .scan_subtree(dir)?
            .into_iter()
            .filter(|(path, _)| path.depth() == base_depth + 1)
            .collect())
    }

    pub fn has_children(&mut self, dir: &CatalogPath) -> Result<bool, CatalogError> {
        eprintln!("DEBUG has_children start {:?}", dir);
        let (lo, hi) = subtree_bounds(dir);
        let txn = self.txn()?;
        let table = txn.open_table(ENTRIES)?;
        let mut range = table.range::<&[u8]>(&lo[..]..&hi[..])?;
        let has_next = range.next().is_some();
        Ok(has_next)
    }

    /// Every entry strictly below `dir`, in path order.
    pub fn subtree_entries(
        &mut self,
        dir: &CatalogPath,
    ) -> Result<Vec<(CatalogPath, DirectoryEntry)>, CatalogError> {
        self.scan_subtree(dir)
    }

    fn scan_subtree(
        &mut self,
        dir: &CatalogPath,
    ) -> Result<Vec<(CatalogPath, DirectoryEntry)>, CatalogError> {
        eprintln!("DEBUG scan_subtree start {:?}", dir);
        let (lo, hi) = subtree_bounds(dir);
        let txn = self.txn()?;
        let table = txn.open_table(ENTRIES)?;

        let mut result = Vec::new();
        for item in table.range::<&[u8]>(&lo[..]..&hi[..])? {
            let (key, value) = item?;
            let path = CatalogPath::new(key.value())
                .map_err(|e| CatalogError::Fatal(format!("malformed path row: {e}")))?;
            result.push((path, bincode::deserialize(&value.value())?));
        }
        Ok(result)
    }

    // - - - chunk rows - - -

    pub fn set_chunks(
        &mut self,
        path: &CatalogPath,
        chunks: &[FileChunk],
    ) -> Result<(), CatalogError> {
        {
            let txn = self.txn()?;
            let mut table = txn.open_table(CHUNKS)?;
            for chunk in chunks {
                table.insert(
                    chunk_key(path, chunk.offset).as_slice(),
                    bincode::serialize(chunk)?,
                )?;
            }
        }
        self.dirty = true;
        Ok(())
    }

    pub fn chunks_of(&mut self, path: &CatalogPath) -> Result<Vec<FileChunk>, CatalogError> {
        let (lo, hi) = chunk_bounds(path);
        let txn = self.txn()?;
        let table = txn.open_table(CHUNKS)?;

        let mut result = Vec::new();
        for item in table.range::<&[u8]>(&lo[..]..&hi[..])? {
            let (_, value) = item?;
            result.push(bincode::deserialize(&value.value())?);
        }
        Ok(result)
    }

    pub fn remove_chunks(&mut self, path: &CatalogPath) -> Result<(), CatalogError> {
        let (lo, hi) = chunk_bounds(path);
        {
            let txn = self.txn()?;
            let mut table = txn.open_table(CHUNKS)?;

            let keys: Vec<Vec<u8>> = {
                let mut keys = Vec::new();
                for item in table.range::<&[u8]>(&lo[..]..&hi[..])? {
                    let (key, _) = item?;
                    keys.push(key.value().to_vec());
                }
                keys
            };
            for key in keys {
                table.remove(key.as_slice())?;
            }
        }
        self.dirty = true;
        Ok(())
    }

    // - - - nested-catalog links - - -

    pub fn link_nested(
        &mut self,
        mountpoint: &CatalogPath,
        link: &NestedLink,
    ) -> Result<(), CatalogError> {
        let inserted_new = {
            let txn = self.txn()?;
            let mut table = txn.open_table(NESTED)?;
            let insert_result = table.insert(mountpoint.as_bytes(), bincode::serialize(link)?)?;
            insert_result.is_none()
        };
        if inserted_new {
            self.counters.nested_count += 1;
        }
        self.dirty = true;
        Ok(())
    }

    pub fn unlink_nested(&mut self, mountpoint: &CatalogPath) -> Result<NestedLink, CatalogError> {
        let link: NestedLink = {
            let txn = self.txn()?;
            let mut table = txn.open_table(NESTED)?;
            let remove_result = table.remove(mountpoint.as_bytes())?;
            let deserialized: Option<NestedLink> = match remove_result {
                Some(raw) => Some(bincode::deserialize(&raw.value())?),
                None => None,
            };
            match deserialized {
                Some(link) => link,
                None => return Err(CatalogError::NotNested(mountpoint.clone())),
            }
        };
        self.counters.nested_count -= 1;
        self.dirty = true;
        Ok(link)
    }

    pub fn nested_link(
        &mut self,
        mountpoint: &CatalogPath,
    ) -> Result<Option<NestedLink>, CatalogError> {
        let txn = self.txn()?;
        let table = txn.open_table(NESTED)?;
        let result = match table.get(mountpoint.as_bytes())? {
            Some(raw) => Ok(Some(bincode::deserialize(&raw.value())?)),
            None => Ok(None),
        };
        result
    }

    pub fn nested_links(&mut self) -> Result<Vec<(CatalogPath, NestedLink)>, CatalogError> {
        let txn = self.txn()?;
        let table = txn.open_table(NESTED)?;

        let mut result = Vec::new();
        for item in table.iter()? {
            let (key, value) = item?;
            let path = CatalogPath::new(key.value())
                .map_err(|e| CatalogError::Fatal(format!("malformed nested row: {e}")))?;
            result.push((path, bincode::deserialize(&value.value())?));
        }
        Ok(result)
    }

    // - - - snapshot - - -

    /// Runtime check of the structural invariants; a violation is fatal to
    /// the publish.
    pub fn check_integrity(&mut self) -> Result<(), CatalogError> {
        let mountpoint = self.mountpoint.clone();
        let entries = self.scan_subtree(&mountpoint)?;
        let root_entry = self.get_entry(&mountpoint)?;
        let nested: Vec<(CatalogPath, NestedLink)> = self.nested_links()?;

        match &root_entry {
            Some(entry) if entry.nested_root => {}
            _ => {
                return Err(CatalogError::Fatal(format!(
                    "catalog {mountpoint} has no root-flagged entry at its mountpoint"
                )))
            }
        }

        let mut row_count = 1u64;
        for (path, entry) in &entries {
            row_count += 1;
            if entry.nested_root {
                return Err(CatalogError::Fatal(format!(
                    "stray root-flagged entry at {path}"
                )));
            }
            let parent = path.parent().expect("non-root entry has a parent");
            if parent != mountpoint && self.get_entry(&parent)?.is_none() {
                return Err(CatalogError::Fatal(format!(
                    "entry {path} has no parent directory in its catalog"
                )));
            }
            if entry.nested_mountpoint && !nested.iter().any(|(mp, _)| mp == path) {
                return Err(CatalogError::Fatal(format!(
                    "mountpoint-flagged entry {path} has no nested link"
                )));
            }
        }

        if row_count != self.counters.entry_count {
            return Err(CatalogError::Fatal(format!(
                "catalog {mountpoint} entry count {} does not match rows {row_count}",
                self.counters.entry_count
            )));
        }
        Ok(())
    }

    /// Write the ended marker, commit, export the canonical catalog image,
    /// compress it and digest the compressed bytes. The export walks every
    /// table in key order, so equal catalog contents always produce equal
    /// digests. The store is consumed; a finalized catalog is immutable.
    #[instrument(skip_all, fields(mountpoint = %self.mountpoint, revision = revision))]
    pub fn finalize(
        mut self,
        revision: u64,
        compression_level: i32,
    ) -> Result<FinalizedCatalog, CatalogError> {
        self.check_integrity()?;
        self.revision = revision;

        let txn = match self.txn.take() {
            Some(txn) => txn,
            None => self.db.begin_write()?,
        };
        {
            let mut props = txn.open_table(PROPERTIES)?;
            props.insert("revision", bincode::serialize(&self.revision)?)?;
            props.insert("counters", bincode::serialize(&self.counters)?)?;
            props.insert("ended", vec![1u8])?;
            if let Some(previous) = &self.previous_digest {
                props.insert("previous", previous.as_slice().to_vec())?;
            }
        }
        txn.commit()?;

        let image = {
            let txn = self.db.begin_read()?;
            CatalogImage {
                properties: dump_str_table(&txn.open_table(PROPERTIES)?)?,
                entries: dump_table(&txn.open_table(ENTRIES)?)?,
                chunks: dump_table(&txn.open_table(CHUNKS)?)?,
                nested: dump_table(&txn.open_table(NESTED)?)?,
            }
        };
        let raw = bincode::serialize(&image)?;
        let compressed = zstd::encode_all(Cursor::new(raw), compression_level)
            .map_err(|e| CatalogError::Storage(e.to_string()))?;
        let digest = CasDigest::of_bytes(&compressed);

        let parent = self
            .db_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let local_path =
            stage_file(&parent, &compressed).map_err(|e| CatalogError::Storage(e.to_string()))?;

        debug!(digest = %digest, size = compressed.len(), "finalized catalog");
        Ok(FinalizedCatalog {
            local_path,
            digest,
            size: compressed.len() as u64,
        })
    }
}

/// The canonical transport form of a catalog: every table dumped in key
/// order. Chunks and bulk objects are addressed by the digest of their
/// compressed bytes; catalogs by the digest of this image, compressed.
#[derive(serde::Serialize, serde::Deserialize)]
struct CatalogImage {
    properties: Vec<(String, Vec<u8>)>,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    chunks: Vec<(Vec<u8>, Vec<u8>)>,
    nested: Vec<(Vec<u8>, Vec<u8>)>,
}

fn dump_table(
    table: &impl ReadableTable<&'static [u8], Vec<u8>>,
) -> Result<Vec<(Vec<u8>, Vec<u8>)>, CatalogError> {
    let mut rows = Vec::new();
    for item in table.iter()? {
        let (key, value) = item?;
        rows.push((key.value().to_vec(), value.value()));
    }
    Ok(rows)
}

fn dump_str_table(
    table: &impl ReadableTable<&'static str, Vec<u8>>,
) -> Result<Vec<(String, Vec<u8>)>, CatalogError> {
    let mut rows = Vec::new();
    for item in table.iter()? {
        let (key, value) = item?;
        rows.push((key.value().to_string(), value.value()));
    }
    Ok(rows)
}

fn stage_file(dir: &Path, contents: &[u8]) -> std::io::Result<PathBuf> {
    use std::io::Write;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    let (_file, path) = tmp.keep().map_err(|e| e.error)?;
    Ok(path)
}

/// Key range covering everything strictly below `dir`: exactly the keys
/// with byte prefix `dir ++ "/"`, i.e. `[dir ++ 0x2f, dir ++ 0x30)`.
fn subtree_bounds(dir: &CatalogPath) -> (Vec<u8>, Vec<u8>) {
    let mut lo = dir.as_bytes().to_vec();
    lo.push(b'/');
    let mut hi = dir.as_bytes().to_vec();
    hi.push(b'/' + 1);
    (lo, hi)
}

fn chunk_key(path: &CatalogPath, offset: u64) -> Vec<u8> {
    let mut key = path.as_bytes().to_vec();
    key.push(0);
    key.extend_from_slice(&offset.to_be_bytes());
    key
}

fn chunk_bounds(path: &CatalogPath) -> (Vec<u8>, Vec<u8>) {
    let mut lo = path.as_bytes().to_vec();
    lo.push(0);
    let mut hi = lo.clone();
    hi.extend_from_slice(&u64::MAX.to_be_bytes());
    lo.extend_from_slice(&0u64.to_be_bytes());
    (lo, hi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{DirectoryEntry, EntryKind};

    fn p(s: &str) -> CatalogPath {
        s.parse().unwrap()
    }

    fn root_store(dir: &Path) -> CatalogStore {
        let mut store =
            CatalogStore::create(dir.join("catalog.db"), CatalogPath::root()).unwrap();
        let mut root = DirectoryEntry::directory("", 0o755);
        root.nested_root = true;
        store.insert_entry(&CatalogPath::root(), &root).unwrap();
        store
    }

    #[test]
    fn insert_get_update_remove() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = root_store(dir.path());

        store
            .insert_entry(&p("/a"), &DirectoryEntry::directory("a", 0o755))
            .unwrap();
        store
            .insert_entry(&p("/a/x"), &DirectoryEntry::regular("x", 0o644, 100))
            .unwrap();

        assert!(matches!(
            store.insert_entry(&p("/a"), &DirectoryEntry::directory("a", 0o755)),
            Err(CatalogError::AlreadyExists(_))
        ));

        let fetched = store.get_entry(&p("/a/x")).unwrap().unwrap();
        assert_eq!(fetched.kind, EntryKind::Regular);
        assert_eq!(fetched.size, 100);

        let mut touched = fetched.clone();
        touched.mtime = 42;
        store.update_entry(&p("/a/x"), &touched).unwrap();
        assert_eq!(store.get_entry(&p("/a/x")).unwrap().unwrap().mtime, 42);

        assert_eq!(store.counters().entry_count, 3);
        assert_eq!(store.counters().subtree_data_size, 100);

        let removed = store.remove_entry(&p("/a/x")).unwrap();
        assert_eq!(removed.size, 100);
        assert_eq!(store.counters().entry_count, 2);
        assert_eq!(store.counters().subtree_data_size, 0);

        assert!(matches!(
            store.remove_entry(&p("/a/x")),
            Err(CatalogError::NotFound(_))
        ));
    }

    #[test]
    fn children_listing_is_depth_aware() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = root_store(dir.path());

        for path in ["/a", "/a/b", "/a/c", "/a/b/d", "/ab"] {
            store
                .insert_entry(&p(path), &DirectoryEntry::directory("x", 0o755))
                .unwrap();
        }

        let children: Vec<String> = store
            .list_children(&p("/a"))
            .unwrap()
            .into_iter()
            .map(|(path, _)| path.to_string())
            .collect();
        assert_eq!(children, vec!["/a/b", "/a/c"]);

        // "/ab" shares a byte prefix with "/a" but is not inside it.
        let top: Vec<String> = store
            .list_children(&CatalogPath::root())
            .unwrap()
            .into_iter()
            .map(|(path, _)| path.to_string())
            .collect();
        assert_eq!(top, vec!["/a", "/ab"]);

        assert!(store.has_children(&p("/a")).unwrap());
        assert!(!store.has_children(&p("/ab")).unwrap());

        assert_eq!(store.subtree_entries(&p("/a")).unwrap().len(), 3);
    }

    #[test]
    fn chunk_rows_roundtrip_in_offset_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = root_store(dir.path());

        let chunks = vec![
            FileChunk {
                offset: 0,
                size: 10,
                digest: CasDigest::of_bytes(b"c0"),
            },
            FileChunk {
                offset: 10,
                size: 20,
                digest: CasDigest::of_bytes(b"c1"),
            },
        ];
        store.set_chunks(&p("/big"), &chunks).unwrap();
        assert_eq!(store.chunks_of(&p("/big")).unwrap(), chunks);

        store.remove_chunks(&p("/big")).unwrap();
        assert!(store.chunks_of(&p("/big")).unwrap().is_empty());
    }

    #[test]
    fn nested_links() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = root_store(dir.path());

        let link = NestedLink {
            digest: None,
            size: 0,
        };
        store.link_nested(&p("/nested"), &link).unwrap();
        assert_eq!(store.counters().nested_count, 1);
        assert_eq!(store.nested_link(&p("/nested")).unwrap().unwrap(), link);

        // Updating the link does not bump the counter.
        let updated = NestedLink {
            digest: Some(CasDigest::of_bytes(b"snap")),
            size: 123,
        };
        store.link_nested(&p("/nested"), &updated).unwrap();
        assert_eq!(store.counters().nested_count, 1);

        assert_eq!(store.unlink_nested(&p("/nested")).unwrap(), updated);
        assert_eq!(store.counters().nested_count, 0);
        assert!(matches!(
            store.unlink_nested(&p("/nested")),
            Err(CatalogError::NotNested(_))
        ));
    }

    #[test]
    fn rollback_restores_committed_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = root_store(dir.path());
        store.commit().unwrap();

        store
            .insert_entry(&p("/a"), &DirectoryEntry::directory("a", 0o755))
            .unwrap();
        assert_eq!(store.counters().entry_count, 2);

        store.rollback().unwrap();
        assert_eq!(store.counters().entry_count, 1);
        assert!(store.get_entry(&p("/a")).unwrap().is_none());
    }

    #[test]
    fn finalize_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = root_store(dir.path());
        store
            .insert_entry(&p("/a"), &DirectoryEntry::directory("a", 0o755))
            .unwrap();

        let finalized = store.finalize(7, 3).unwrap();
        assert!(finalized.size > 0);

        let compressed = std::fs::read(&finalized.local_path).unwrap();
        assert_eq!(finalized.digest, CasDigest::of_bytes(&compressed));
        assert_eq!(finalized.size, compressed.len() as u64);

        let mut reopened = CatalogStore::open_compressed(
            &finalized.local_path,
            dir.path(),
            Some(finalized.digest.clone()),
        )
        .unwrap();
        assert_eq!(reopened.revision(), 7);
        assert_eq!(reopened.counters().entry_count, 2);
        assert!(!reopened.is_dirty());
        assert!(reopened.get_entry(&p("/a")).unwrap().is_some());
        assert_eq!(
            reopened.previous_digest().unwrap(),
            &CasDigest::of_bytes(&compressed)
        );
    }

    #[test]
    fn integrity_check_catches_missing_parent() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = root_store(dir.path());
        store
            .insert_entry(&p("/ghost/child"), &DirectoryEntry::regular("child", 0o644, 1))
            .unwrap();

        assert!(matches!(
            store.check_integrity(),
            Err(CatalogError::Fatal(_))
        ));
    }

    #[test]
    fn integrity_check_catches_unlinked_mountpoint() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = root_store(dir.path());
        let mut nested = DirectoryEntry::directory("n", 0o755);
        nested.nested_mountpoint = true;
        store.insert_entry(&p("/n"), &nested).unwrap();

        assert!(matches!(
            store.check_integrity(),
            Err(CatalogError::Fatal(_))
        ));
    }
}
