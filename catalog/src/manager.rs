//! The writable catalog manager.
//!
//! An in-memory tree of open catalogs mirrors the nesting structure of the
//! published filesystem. Mutations are routed to the deepest catalog whose
//! mountpoint covers the path; catalogs outside the loaded tree are fetched
//! lazily. On commit, dirty catalogs are snapshotted post-order, parents
//! pick up the new child digests, and the fresh root digest goes into a
//! manifest.
//!
//! The tree is an arena: nodes refer to parents and children by index, so
//! there are no back-owning references. Downloads are staged outside the
//! tree lock and attached optimistically afterwards.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use canopy_cas::{CasDigest, FileChunk, Uploader};
use tracing::{debug, info, instrument, warn};

use crate::balancer::BalancerConfig;
use crate::entry::{validate_chunk_list, DirectoryEntry, XattrList};
use crate::errors::CatalogError;
use crate::manifest::Manifest;
use crate::path::CatalogPath;
use crate::store::{CatalogStore, FinalizedCatalog, NestedLink};

/// Downloads existing catalog snapshots for lazy loading.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch the object stored under `digest` and return a local file path.
    async fn fetch(&self, digest: &CasDigest) -> Result<PathBuf, FetchError>;
}

#[derive(thiserror::Error, Debug)]
#[error("fetch of {digest} failed: {reason}")]
pub struct FetchError {
    pub digest: String,
    pub reason: String,
}

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CatalogManagerConfig {
    /// Directory holding the working catalog databases and snapshots.
    pub staging_dir: PathBuf,
    #[serde(default)]
    pub balancer: Option<BalancerConfig>,
    /// Log a warning when a single catalog grows past this many entries.
    #[serde(default = "default_warn_threshold")]
    pub entry_warn_threshold: u64,
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
}

fn default_warn_threshold() -> u64 {
    500_000
}

fn default_compression_level() -> i32 {
    zstd::DEFAULT_COMPRESSION_LEVEL
}

impl CatalogManagerConfig {
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            balancer: None,
            entry_warn_threshold: default_warn_threshold(),
            compression_level: default_compression_level(),
        }
    }
}

/// Read capabilities over the catalog tree. The writable manager composes
/// these with the mutation set; there is no read-only/writable hierarchy.
#[async_trait]
pub trait CatalogReader {
    async fn get_entry(
        &self,
        path: &CatalogPath,
    ) -> Result<Option<DirectoryEntry>, CatalogError>;

    async fn list_children(
        &self,
        dir: &CatalogPath,
    ) -> Result<Vec<(CatalogPath, DirectoryEntry)>, CatalogError>;

    async fn chunks_of(&self, path: &CatalogPath) -> Result<Vec<FileChunk>, CatalogError>;

    /// True iff the path appears both as a mountpoint in its parent catalog
    /// and as the root of a child catalog.
    async fn is_transition_point(&self, path: &CatalogPath) -> Result<bool, CatalogError>;
}

pub(crate) struct CatalogNode {
    pub(crate) mountpoint: CatalogPath,
    pub(crate) store: CatalogStore,
    pub(crate) parent: Option<usize>,
    pub(crate) children: Vec<usize>,
}

pub(crate) enum Route {
    Loaded(usize),
    NeedsLoad {
        parent: usize,
        mountpoint: CatalogPath,
        digest: CasDigest,
    },
}

pub(crate) struct CatalogTree {
    /// Arena slots; vacated slots stay `None` for the session.
    pub(crate) nodes: Vec<Option<CatalogNode>>,
    pub(crate) staging_dir: PathBuf,
    pub(crate) compression_level: i32,
    entry_warn_threshold: u64,
    db_name_seq: u64,
}

const ROOT: usize = 0;

impl CatalogTree {
    fn new(root_store: CatalogStore, config: &CatalogManagerConfig) -> Self {
        let root = CatalogNode {
            mountpoint: root_store.mountpoint().clone(),
            store: root_store,
            parent: None,
            children: Vec::new(),
        };
        Self {
            nodes: vec![Some(root)],
            staging_dir: config.staging_dir.clone(),
            compression_level: config.compression_level,
            entry_warn_threshold: config.entry_warn_threshold,
            db_name_seq: 0,
        }
    }

    pub(crate) fn node(&self, idx: usize) -> &CatalogNode {
        self.nodes[idx].as_ref().expect("live catalog node")
    }

    pub(crate) fn node_mut(&mut self, idx: usize) -> &mut CatalogNode {
        self.nodes[idx].as_mut().expect("live catalog node")
    }

    pub(crate) fn live_nodes(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.nodes.len()).filter(|idx| self.nodes[*idx].is_some())
    }

    fn next_db_path(&mut self) -> PathBuf {
        self.db_name_seq += 1;
        self.staging_dir.join(format!("catalog-{}.db", self.db_name_seq))
    }

    /// Find the deepest catalog whose mountpoint covers `path`. If that
    /// catalog is not loaded, report what must be fetched.
    pub(crate) fn route(&mut self, path: &CatalogPath) -> Result<Route, CatalogError> {
        let mut idx = ROOT;
        loop {
            let loaded_child = self
                .node(idx)
                .children
                .iter()
                .copied()
                .find(|c| self.node(*c).mountpoint.is_ancestor_of(path));
            if let Some(child) = loaded_child {
                idx = child;
                continue;
            }

            // A covering link that survived the loaded-children check is
            // necessarily unloaded.
            let covering = self
                .node_mut(idx)
                .store
                .nested_links()?
                .into_iter()
                .find(|(mountpoint, _)| mountpoint.is_ancestor_of(path));
            return match covering {
                Some((mountpoint, link)) => {
                    let digest = link.digest.ok_or_else(|| {
                        CatalogError::Fatal(format!(
                            "unloaded nested catalog {mountpoint} has no digest"
                        ))
                    })?;
                    Ok(Route::NeedsLoad {
                        parent: idx,
                        mountpoint,
                        digest,
                    })
                }
                None => Ok(Route::Loaded(idx)),
            };
        }
    }

    /// Attach a freshly opened catalog below `parent`, unless another task
    /// attached it while the download was staged.
    fn attach(
        &mut self,
        parent: usize,
        mountpoint: &CatalogPath,
        store: CatalogStore,
    ) -> Result<(), CatalogError> {
        if store.mountpoint() != mountpoint {
            return Err(CatalogError::LoadFailed(format!(
                "catalog mountpoint {} does not match link {mountpoint}",
                store.mountpoint()
            )));
        }
        let Some(Some(parent_node)) = self.nodes.get(parent) else {
            return Ok(());
        };
        if parent_node
            .children
            .iter()
            .any(|c| self.node(*c).mountpoint == *mountpoint)
        {
            debug!(mountpoint = %mountpoint, "catalog attached concurrently, discarding");
            return Ok(());
        }

        let new_idx = self.nodes.len();
        self.nodes.push(Some(CatalogNode {
            mountpoint: mountpoint.clone(),
            store,
            parent: Some(parent),
            children: Vec::new(),
        }));
        self.node_mut(parent).children.push(new_idx);
        debug!(mountpoint = %mountpoint, "attached nested catalog");
        Ok(())
    }

    // - - - mutations, routed to `idx` - - -

    fn check_new_entry(
        &mut self,
        idx: usize,
        path: &CatalogPath,
    ) -> Result<(), CatalogError> {
        let store = &mut self.node_mut(idx).store;
        let parent = path
            .parent()
            .ok_or_else(|| CatalogError::AlreadyExists(path.clone()))?;
        match store.get_entry(&parent)? {
            Some(entry) if entry.is_directory() => {}
            Some(_) => return Err(CatalogError::WrongType(parent)),
            None => return Err(CatalogError::ParentMissing(path.clone())),
        }
        if store.get_entry(path)?.is_some() {
            return Err(CatalogError::AlreadyExists(path.clone()));
        }
        Ok(())
    }

    fn warn_if_large(&self, idx: usize) {
        let count = self.node(idx).store.counters().entry_count;
        if count > self.entry_warn_threshold {
            warn!(
                mountpoint = %self.node(idx).mountpoint,
                entries = count,
                "catalog exceeds the entry warning threshold, consider nesting"
            );
        }
    }

    fn add_file_at(
        &mut self,
        idx: usize,
        path: &CatalogPath,
        mut entry: DirectoryEntry,
        chunks: Option<&[FileChunk]>,
    ) -> Result<(), CatalogError> {
        if !entry.is_leaf() {
            return Err(CatalogError::WrongType(path.clone()));
        }
        self.check_new_entry(idx, path)?;

        if let Some(chunks) = chunks {
            validate_chunk_list(path, entry.size, chunks).map_err(|reason| {
                CatalogError::InvalidChunkList {
                    path: path.clone(),
                    reason,
                }
            })?;
            entry.chunked = true;
        }

        let store = &mut self.node_mut(idx).store;
        store.insert_entry(path, &entry)?;
        if let Some(chunks) = chunks {
            store.set_chunks(path, chunks)?;
        }
        self.warn_if_large(idx);
        Ok(())
    }

    fn remove_file_at(&mut self, idx: usize, path: &CatalogPath) -> Result<(), CatalogError> {
        let store = &mut self.node_mut(idx).store;
        let entry = store
            .get_entry(path)?
            .ok_or_else(|| CatalogError::NotFound(path.clone()))?;
        if !entry.is_leaf() {
            return Err(CatalogError::WrongType(path.clone()));
        }
        store.remove_entry(path)?;
        if entry.chunked {
            store.remove_chunks(path)?;
        }
        Ok(())
    }

    fn add_directory_at(
        &mut self,
        idx: usize,
        path: &CatalogPath,
        entry: DirectoryEntry,
    ) -> Result<(), CatalogError> {
        if !entry.is_directory() {
            return Err(CatalogError::WrongType(path.clone()));
        }
        self.check_new_entry(idx, path)?;
        self.node_mut(idx).store.insert_entry(path, &entry)?;
        self.warn_if_large(idx);
        Ok(())
    }

    /// Update directory metadata in place. A transition point has a copy in
    /// both catalogs; both are touched.
    fn touch_directory_at(
        &mut self,
        idx: usize,
        path: &CatalogPath,
        template: &DirectoryEntry,
    ) -> Result<(), CatalogError> {
        let (is_child_root, parent_idx) = {
            let node = self.node(idx);
            (node.mountpoint == *path && node.parent.is_some(), node.parent)
        };

        let store = &mut self.node_mut(idx).store;
        let mut entry = store
            .get_entry(path)?
            .ok_or_else(|| CatalogError::NotFound(path.clone()))?;
        if !entry.is_directory() {
            return Err(CatalogError::WrongType(path.clone()));
        }
        apply_touch(&mut entry, template);
        store.update_entry(path, &entry)?;

        if is_child_root {
            let parent_store = &mut self.node_mut(parent_idx.unwrap()).store;
            if let Some(mut copy) = parent_store.get_entry(path)? {
                apply_touch(&mut copy, template);
                parent_store.update_entry(path, &copy)?;
            }
        }
        Ok(())
    }

    fn remove_directory_at(&mut self, idx: usize, path: &CatalogPath) -> Result<(), CatalogError> {
        let store = &mut self.node_mut(idx).store;
        let entry = store
            .get_entry(path)?
            .ok_or_else(|| CatalogError::NotFound(path.clone()))?;
        if !entry.is_directory() {
            return Err(CatalogError::WrongType(path.clone()));
        }
        if entry.nested_mountpoint || entry.nested_root {
            // Transition points must be dissolved first.
            return Err(CatalogError::WrongType(path.clone()));
        }
        if store.has_children(path)? {
            return Err(CatalogError::NotEmpty(path.clone()));
        }
        store.remove_entry(path)?;
        Ok(())
    }

    fn add_hardlink_group_at(
        &mut self,
        idx: usize,
        parent_dir: &CatalogPath,
        entries: Vec<DirectoryEntry>,
        group: u64,
    ) -> Result<(), CatalogError> {
        if entries.is_empty() {
            return Err(CatalogError::NotFound(parent_dir.clone()));
        }
        // Validate the whole group before inserting any member; all members
        // land in the catalog owning the parent directory.
        let mut paths = Vec::with_capacity(entries.len());
        for entry in &entries {
            if !entry.is_leaf() {
                return Err(CatalogError::WrongType(parent_dir.clone()));
            }
            let path = parent_dir
                .join(&entry.name)
                .map_err(|_| CatalogError::WrongType(parent_dir.clone()))?;
            self.check_new_entry(idx, &path)?;
            paths.push(path);
        }

        let store = &mut self.node_mut(idx).store;
        for (path, mut entry) in paths.into_iter().zip(entries) {
            entry.hardlink_group = group;
            store.insert_entry(&path, &entry)?;
        }
        self.warn_if_large(idx);
        Ok(())
    }

    /// Remove one member; a group reduced to a single member stops being a
    /// hardlink group.
    fn shrink_hardlink_group_at(
        &mut self,
        idx: usize,
        path: &CatalogPath,
    ) -> Result<(), CatalogError> {
        let store = &mut self.node_mut(idx).store;
        let entry = store
            .get_entry(path)?
            .ok_or_else(|| CatalogError::NotFound(path.clone()))?;
        if entry.hardlink_group == 0 || !entry.is_leaf() {
            return Err(CatalogError::WrongType(path.clone()));
        }
        store.remove_entry(path)?;
        if entry.chunked {
            store.remove_chunks(path)?;
        }

        let parent = path.parent().expect("hardlink member has a parent");
        let remaining: Vec<(CatalogPath, DirectoryEntry)> = store
            .list_children(&parent)?
            .into_iter()
            .filter(|(_, e)| e.hardlink_group == entry.hardlink_group)
            .collect();
        if let [(last_path, last_entry)] = &remaining[..] {
            let mut cleared = last_entry.clone();
            cleared.hardlink_group = 0;
            store.update_entry(last_path, &cleared)?;
        }
        Ok(())
    }

    pub(crate) fn create_nested_catalog_at(
        &mut self,
        idx: usize,
        mountpoint: &CatalogPath,
    ) -> Result<(), CatalogError> {
        if self.node(idx).mountpoint == *mountpoint {
            return Err(CatalogError::AlreadyNested(mountpoint.clone()));
        }
        let mountpoint_entry = {
            let store = &mut self.node_mut(idx).store;
            let entry = store
                .get_entry(mountpoint)?
                .ok_or_else(|| CatalogError::NotFound(mountpoint.clone()))?;
            if !entry.is_directory() {
                return Err(CatalogError::WrongType(mountpoint.clone()));
            }
            if entry.nested_mountpoint {
                return Err(CatalogError::AlreadyNested(mountpoint.clone()));
            }
            entry
        };

        // Build the child aside, then splice it into the tree.
        let db_path = self.next_db_path();
        let mut child_store = CatalogStore::create(db_path, mountpoint.clone())?;
        let mut child_root = mountpoint_entry.clone();
        child_root.nested_root = true;
        child_store.insert_entry(mountpoint, &child_root)?;

        let moved = self.node_mut(idx).store.subtree_entries(mountpoint)?;
        for (path, entry) in moved {
            child_store.insert_entry(&path, &entry)?;
            if entry.chunked {
                let chunks = self.node_mut(idx).store.chunks_of(&path)?;
                child_store.set_chunks(&path, &chunks)?;
                self.node_mut(idx).store.remove_chunks(&path)?;
            }
            self.node_mut(idx).store.remove_entry(&path)?;
        }

        // Deeper nested catalogs move with their subtree.
        let moved_links: Vec<(CatalogPath, NestedLink)> = self
            .node_mut(idx)
            .store
            .nested_links()?
            .into_iter()
            .filter(|(mp, _)| mountpoint.is_strict_ancestor_of(mp))
            .collect();
        for (mp, link) in &moved_links {
            self.node_mut(idx).store.unlink_nested(mp)?;
            child_store.link_nested(mp, link)?;
        }

        let mut marked = mountpoint_entry;
        marked.nested_mountpoint = true;
        {
            let store = &mut self.node_mut(idx).store;
            store.update_entry(mountpoint, &marked)?;
            store.link_nested(
                mountpoint,
                &NestedLink {
                    digest: None,
                    size: 0,
                },
            )?;
        }

        // Splice: loaded grandchildren under the new mountpoint re-parent.
        let grandchildren: Vec<usize> = self
            .node(idx)
            .children
            .iter()
            .copied()
            .filter(|c| mountpoint.is_strict_ancestor_of(&self.node(*c).mountpoint))
            .collect();
        let new_idx = self.nodes.len();
        self.nodes.push(Some(CatalogNode {
            mountpoint: mountpoint.clone(),
            store: child_store,
            parent: Some(idx),
            children: grandchildren.clone(),
        }));
        for grandchild in &grandchildren {
            self.node_mut(*grandchild).parent = Some(new_idx);
        }
        let parent_children = &mut self.node_mut(idx).children;
        parent_children.retain(|c| !grandchildren.contains(c));
        parent_children.push(new_idx);

        info!(mountpoint = %mountpoint, "created nested catalog");
        Ok(())
    }

    pub(crate) fn remove_nested_catalog_at(
        &mut self,
        child_idx: usize,
        mountpoint: &CatalogPath,
    ) -> Result<(), CatalogError> {
        {
            let node = self.node(child_idx);
            if node.mountpoint != *mountpoint || node.parent.is_none() {
                return Err(CatalogError::NotNested(mountpoint.clone()));
            }
        }

        let mut child = self.nodes[child_idx]
            .take()
            .expect("live catalog node");
        let parent_idx = child.parent.expect("checked above");

        // Move the child's content back; its root-flagged copy of the
        // mountpoint stays behind and disappears with the child.
        let moved = child.store.subtree_entries(mountpoint)?;
        for (path, entry) in moved {
            self.node_mut(parent_idx).store.insert_entry(&path, &entry)?;
            if entry.chunked {
                let chunks = child.store.chunks_of(&path)?;
                self.node_mut(parent_idx).store.set_chunks(&path, &chunks)?;
            }
        }
        for (mp, link) in child.store.nested_links()? {
            self.node_mut(parent_idx).store.link_nested(&mp, &link)?;
        }

        {
            let parent_store = &mut self.node_mut(parent_idx).store;
            parent_store.unlink_nested(mountpoint)?;
            let mut copy = parent_store
                .get_entry(mountpoint)?
                .ok_or_else(|| {
                    CatalogError::Fatal(format!("transition point {mountpoint} lost its parent copy"))
                })?;
            copy.nested_mountpoint = false;
            parent_store.update_entry(mountpoint, &copy)?;
        }

        // Re-parent the child's loaded children and drop the node.
        let orphaned = std::mem::take(&mut child.children);
        for grandchild in &orphaned {
            self.node_mut(*grandchild).parent = Some(parent_idx);
        }
        let parent_children = &mut self.node_mut(parent_idx).children;
        parent_children.retain(|c| *c != child_idx);
        parent_children.extend(orphaned);

        let db_path = child.store.db_path().to_path_buf();
        drop(child);
        if let Err(err) = std::fs::remove_file(&db_path) {
            debug!(path = ?db_path, %err, "could not remove dissolved catalog database");
        }

        info!(mountpoint = %mountpoint, "removed nested catalog");
        Ok(())
    }

    // - - - commit support - - -

    /// Indices of all catalogs needing a new snapshot, children before
    /// parents. A dirty catalog marks all its ancestors dirty, because each
    /// parent must pick up the new child digest.
    pub(crate) fn dirty_post_order(&self) -> Vec<usize> {
        fn visit(tree: &CatalogTree, idx: usize, out: &mut Vec<usize>) -> bool {
            let mut dirty = tree.node(idx).store.is_dirty();
            for child in tree.node(idx).children.clone() {
                if visit(tree, child, out) {
                    dirty = true;
                }
            }
            if dirty {
                out.push(idx);
            }
            dirty
        }

        let mut out = Vec::new();
        visit(self, ROOT, &mut out);
        out
    }

    /// All catalogs the publish knows about: loaded ones plus direct links
    /// to unloaded subtrees.
    pub(crate) fn catalog_count(&mut self) -> Result<u64, CatalogError> {
        let mut count = 0u64;
        for idx in self.live_nodes().collect::<Vec<_>>() {
            count += 1;
            let loaded: Vec<CatalogPath> = self
                .node(idx)
                .children
                .iter()
                .map(|c| self.node(*c).mountpoint.clone())
                .collect();
            for (mountpoint, _) in self.node_mut(idx).store.nested_links()? {
                if !loaded.contains(&mountpoint) {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    /// Finalize one catalog and record its digest in the parent. The node
    /// leaves the tree; a finalized catalog is immutable.
    fn snapshot_node(
        &mut self,
        idx: usize,
        revision: u64,
    ) -> Result<FinalizedCatalog, CatalogError> {
        let node = self.nodes[idx]
            .take()
            .ok_or_else(|| CatalogError::Fatal("snapshot of a vacated catalog".into()))?;
        let mountpoint = node.mountpoint.clone();
        let parent = node.parent;

        let finalized = node.store.finalize(revision, self.compression_level)?;

        if let Some(parent_idx) = parent {
            let parent_node = self.node_mut(parent_idx);
            parent_node.children.retain(|c| *c != idx);
            parent_node.store.link_nested(
                &mountpoint,
                &NestedLink {
                    digest: Some(finalized.digest.clone()),
                    size: finalized.size,
                },
            )?;
        }
        Ok(finalized)
    }
}

fn apply_touch(entry: &mut DirectoryEntry, template: &DirectoryEntry) {
    entry.mode = template.mode;
    entry.uid = template.uid;
    entry.gid = template.gid;
    entry.mtime = template.mtime;
}

pub struct WritableCatalogManager {
    inner: Mutex<CatalogTree>,
    fetcher: Arc<dyn Fetcher>,
    uploader: Arc<dyn Uploader>,
    balancer: Option<BalancerConfig>,
    staging_dir: PathBuf,
    hardlink_group_seq: AtomicU64,
    /// Directories are published without xattrs.
    empty_xattrs: XattrList,
    /// Invoked between balancing and snapshotting when a commit is asked to
    /// stop for manual tweaks.
    tweaks_hook: Option<Box<dyn Fn() + Send + Sync>>,
}

impl WritableCatalogManager {
    /// Bootstrap an empty repository: a fresh root catalog containing only
    /// the root directory. The first commit publishes revision 1.
    pub fn create_repository(
        config: CatalogManagerConfig,
        fetcher: Arc<dyn Fetcher>,
        uploader: Arc<dyn Uploader>,
    ) -> Result<Self, CatalogError> {
        std::fs::create_dir_all(&config.staging_dir)
            .map_err(|e| CatalogError::Storage(e.to_string()))?;

        let mut tree = CatalogTree::new(
            CatalogStore::create(
                config.staging_dir.join("catalog-0.db"),
                CatalogPath::root(),
            )?,
            &config,
        );
        let mut root_entry = DirectoryEntry::directory("", 0o755);
        root_entry.nested_root = true;
        tree.node_mut(ROOT)
            .store
            .insert_entry(&CatalogPath::root(), &root_entry)?;

        Ok(Self::assemble(tree, config, fetcher, uploader))
    }

    /// Open an existing repository from its published root digest.
    pub async fn open_repository(
        config: CatalogManagerConfig,
        root_digest: CasDigest,
        fetcher: Arc<dyn Fetcher>,
        uploader: Arc<dyn Uploader>,
    ) -> Result<Self, CatalogError> {
        std::fs::create_dir_all(&config.staging_dir)
            .map_err(|e| CatalogError::Storage(e.to_string()))?;

        let local = fetcher
            .fetch(&root_digest)
            .await
            .map_err(|e| CatalogError::LoadFailed(e.to_string()))?;
        let staging = config.staging_dir.clone();
        let store = tokio::task::spawn_blocking(move || {
            CatalogStore::open_compressed(&local, &staging, Some(root_digest))
        })
        .await
        .map_err(|e| CatalogError::Storage(e.to_string()))??;

        if !store.mountpoint().is_root() {
            return Err(CatalogError::LoadFailed(format!(
                "root catalog has mountpoint {}",
                store.mountpoint()
            )));
        }
        let tree = CatalogTree::new(store, &config);
        Ok(Self::assemble(tree, config, fetcher, uploader))
    }

    fn assemble(
        tree: CatalogTree,
        config: CatalogManagerConfig,
        fetcher: Arc<dyn Fetcher>,
        uploader: Arc<dyn Uploader>,
    ) -> Self {
        Self {
            inner: Mutex::new(tree),
            fetcher,
            uploader,
            balancer: config.balancer,
            staging_dir: config.staging_dir,
            hardlink_group_seq: AtomicU64::new(1),
            empty_xattrs: XattrList::new(),
            tweaks_hook: None,
        }
    }

    pub fn set_tweaks_hook(&mut self, hook: impl Fn() + Send + Sync + 'static) {
        self.tweaks_hook = Some(Box::new(hook));
    }

    /// Run `f` against the catalog owning `path`, lazily loading catalogs
    /// as needed. Downloads never happen under the tree lock: the fetch is
    /// staged first, then the tree is re-entered and the catalog attached
    /// unless another task got there first.
    async fn with_catalog<R, F>(&self, path: &CatalogPath, mut f: F) -> Result<R, CatalogError>
    where
        F: FnMut(&mut CatalogTree, usize) -> Result<R, CatalogError>,
    {
        loop {
            let pending_load = {
                let mut tree = self.inner.lock().unwrap();
                match tree.route(path)? {
                    Route::Loaded(idx) => return f(&mut tree, idx),
                    Route::NeedsLoad {
                        parent,
                        mountpoint,
                        digest,
                    } => (parent, mountpoint, digest),
                }
            };

            let (parent, mountpoint, digest) = pending_load;
            let local = self
                .fetcher
                .fetch(&digest)
                .await
                .map_err(|e| CatalogError::LoadFailed(e.to_string()))?;
            let staging = self.staging_dir.clone();
            let store = tokio::task::spawn_blocking(move || {
                CatalogStore::open_compressed(&local, &staging, Some(digest))
            })
            .await
            .map_err(|e| CatalogError::Storage(e.to_string()))??;

            self.inner
                .lock()
                .unwrap()
                .attach(parent, &mountpoint, store)?;
        }
    }

    // - - - mutation API - - -

    #[instrument(skip(self, entry, xattrs), fields(parent = %parent_dir, name = ?entry.name))]
    pub async fn add_file(
        &self,
        mut entry: DirectoryEntry,
        xattrs: &XattrList,
        parent_dir: &CatalogPath,
    ) -> Result<(), CatalogError> {
        entry.xattrs = xattrs.clone();
        let path = parent_dir
            .join(&entry.name)
            .map_err(|_| CatalogError::WrongType(parent_dir.clone()))?;
        self.with_catalog(&path, |tree, idx| {
            tree.add_file_at(idx, &path, entry.clone(), None)
        })
        .await
    }

    #[instrument(skip(self, entry, xattrs, chunks), fields(parent = %parent_dir, name = ?entry.name))]
    pub async fn add_chunked_file(
        &self,
        mut entry: DirectoryEntry,
        xattrs: &XattrList,
        parent_dir: &CatalogPath,
        chunks: Vec<FileChunk>,
    ) -> Result<(), CatalogError> {
        entry.xattrs = xattrs.clone();
        let path = parent_dir
            .join(&entry.name)
            .map_err(|_| CatalogError::WrongType(parent_dir.clone()))?;
        self.with_catalog(&path, |tree, idx| {
            tree.add_file_at(idx, &path, entry.clone(), Some(&chunks))
        })
        .await
    }

    #[instrument(skip(self), fields(path = %path))]
    pub async fn remove_file(&self, path: &CatalogPath) -> Result<(), CatalogError> {
        self.with_catalog(path, |tree, idx| tree.remove_file_at(idx, path))
            .await
    }

    #[instrument(skip(self, entry), fields(parent = %parent_dir, name = ?entry.name))]
    pub async fn add_directory(
        &self,
        mut entry: DirectoryEntry,
        parent_dir: &CatalogPath,
    ) -> Result<(), CatalogError> {
        entry.xattrs = self.empty_xattrs.clone();
        let path = parent_dir
            .join(&entry.name)
            .map_err(|_| CatalogError::WrongType(parent_dir.clone()))?;
        self.with_catalog(&path, |tree, idx| {
            tree.add_directory_at(idx, &path, entry.clone())
        })
        .await
    }

    #[instrument(skip(self, entry), fields(path = %path))]
    pub async fn touch_directory(
        &self,
        entry: &DirectoryEntry,
        path: &CatalogPath,
    ) -> Result<(), CatalogError> {
        self.with_catalog(path, |tree, idx| tree.touch_directory_at(idx, path, entry))
            .await
    }

    #[instrument(skip(self), fields(path = %path))]
    pub async fn remove_directory(&self, path: &CatalogPath) -> Result<(), CatalogError> {
        self.with_catalog(path, |tree, idx| tree.remove_directory_at(idx, path))
            .await
    }

    /// Insert a group of entries sharing a fresh hardlink-group id. All
    /// members live in the directory `parent_dir` and therefore in one
    /// catalog.
    #[instrument(skip(self, entries, xattrs), fields(parent = %parent_dir, members = entries.len()))]
    pub async fn add_hardlink_group(
        &self,
        entries: Vec<DirectoryEntry>,
        xattrs: &XattrList,
        parent_dir: &CatalogPath,
    ) -> Result<(), CatalogError> {
        let group = self.hardlink_group_seq.fetch_add(1, Ordering::Relaxed);
        let entries: Vec<DirectoryEntry> = entries
            .into_iter()
            .map(|mut e| {
                e.xattrs = xattrs.clone();
                e
            })
            .collect();
        self.with_catalog(parent_dir, |tree, idx| {
            tree.add_hardlink_group_at(idx, parent_dir, entries.clone(), group)
        })
        .await
    }

    #[instrument(skip(self), fields(path = %path))]
    pub async fn shrink_hardlink_group(&self, path: &CatalogPath) -> Result<(), CatalogError> {
        self.with_catalog(path, |tree, idx| tree.shrink_hardlink_group_at(idx, path))
            .await
    }

    #[instrument(skip(self), fields(mountpoint = %mountpoint))]
    pub async fn create_nested_catalog(
        &self,
        mountpoint: &CatalogPath,
    ) -> Result<(), CatalogError> {
        self.with_catalog(mountpoint, |tree, idx| {
            tree.create_nested_catalog_at(idx, mountpoint)
        })
        .await
    }

    #[instrument(skip(self), fields(mountpoint = %mountpoint))]
    pub async fn remove_nested_catalog(
        &self,
        mountpoint: &CatalogPath,
    ) -> Result<(), CatalogError> {
        self.with_catalog(mountpoint, |tree, idx| {
            tree.remove_nested_catalog_at(idx, mountpoint)
        })
        .await
    }

    /// Apply the autocatalog balancer now. Commit runs this automatically
    /// when a balancer is configured.
    pub fn balance(&self) -> Result<(), CatalogError> {
        let Some(config) = &self.balancer else {
            return Ok(());
        };
        let mut tree = self.inner.lock().unwrap();
        crate::balancer::balance_tree(&mut tree, config)
    }

    /// Snapshot every dirty catalog and publish a new root.
    ///
    /// Post-order: a parent is finalized only after all its dirty children
    /// have been, so each parent records the children's new digests. An
    /// upload failure aborts the commit; anything already uploaded is an
    /// unreferenced content-addressed object, and the previous root stays
    /// authoritative.
    #[instrument(skip(self))]
    pub async fn commit(
        mut self,
        stop_for_tweaks: bool,
        manual_revision: Option<u64>,
    ) -> Result<Manifest, CatalogError> {
        if let Some(config) = &self.balancer {
            let mut tree = self.inner.lock().unwrap();
            crate::balancer::balance_tree(&mut tree, config)?;
        }

        if stop_for_tweaks {
            match self.tweaks_hook.take() {
                Some(hook) => hook(),
                None => warn!("commit asked to stop for tweaks, but no hook is installed"),
            }
        }

        let (order, revision, catalog_count) = {
            let mut tree = self.inner.lock().unwrap();
            let previous = tree.node(ROOT).store.revision();
            (
                tree.dirty_post_order(),
                manual_revision.unwrap_or(previous + 1),
                tree.catalog_count()?,
            )
        };
        // Even a publish without mutations snapshots the root, so every
        // commit produces a new revision.
        let order = if order.is_empty() { vec![ROOT] } else { order };

        let mut root_snapshot: Option<FinalizedCatalog> = None;
        for idx in order {
            let finalized = {
                let mut tree = self.inner.lock().unwrap();
                tree.snapshot_node(idx, revision)?
            };
            self.uploader
                .upload(&finalized.local_path, &finalized.digest.catalog_key())
                .await?;
            if idx == ROOT {
                root_snapshot = Some(finalized);
            }
        }

        let root = root_snapshot
            .ok_or_else(|| CatalogError::Fatal("commit finished without a root snapshot".into()))?;
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();

        info!(revision, root = %root.digest, "published new catalog root");
        Ok(Manifest {
            root_digest: root.digest,
            revision,
            timestamp,
            catalog_count,
            root_catalog_size: root.size,
            history_digest: None,
        })
    }

    /// Weights of all loaded catalogs, keyed by mountpoint. Mostly useful
    /// for balancer diagnostics and tests.
    pub fn loaded_catalog_weights(&self) -> Vec<(CatalogPath, u64)> {
        let tree = self.inner.lock().unwrap();
        tree.live_nodes()
            .map(|idx| {
                let node = tree.node(idx);
                (node.mountpoint.clone(), node.store.counters().entry_count)
            })
            .collect()
    }
}

#[async_trait]
impl CatalogReader for WritableCatalogManager {
    async fn get_entry(
        &self,
        path: &CatalogPath,
    ) -> Result<Option<DirectoryEntry>, CatalogError> {
        self.with_catalog(path, |tree, idx| tree.node_mut(idx).store.get_entry(path))
            .await
    }

    async fn list_children(
        &self,
        dir: &CatalogPath,
    ) -> Result<Vec<(CatalogPath, DirectoryEntry)>, CatalogError> {
        self.with_catalog(dir, |tree, idx| tree.node_mut(idx).store.list_children(dir))
            .await
    }

    async fn chunks_of(&self, path: &CatalogPath) -> Result<Vec<FileChunk>, CatalogError> {
        self.with_catalog(path, |tree, idx| tree.node_mut(idx).store.chunks_of(path))
            .await
    }

    async fn is_transition_point(&self, path: &CatalogPath) -> Result<bool, CatalogError> {
        self.with_catalog(path, |tree, idx| {
            let node = tree.node(idx);
            if node.mountpoint == *path {
                // The deepest loaded catalog is rooted here; the parent's
                // mountpoint-flagged copy is the other half of the pair.
                return Ok(node.parent.is_some());
            }
            let store = &mut tree.node_mut(idx).store;
            let flagged = store
                .get_entry(path)?
                .map(|e| e.nested_mountpoint)
                .unwrap_or(false);
            Ok(flagged && store.nested_link(path)?.is_some())
        })
        .await
    }
}
