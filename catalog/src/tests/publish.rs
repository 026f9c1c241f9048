//! End-to-end publish cycles against an in-memory object store.

use std::io::Cursor;
use std::sync::Arc;

use canopy_cas::{CasDigest, FileChunk, MemoryUploader};

use super::utils::MemoryFetcher;
use crate::entry::{DirectoryEntry, XattrList};
use crate::errors::CatalogError;
use crate::manager::{CatalogManagerConfig, CatalogReader, WritableCatalogManager};
use crate::path::CatalogPath;
use crate::BalancerConfig;

fn p(s: &str) -> CatalogPath {
    s.parse().unwrap()
}

struct Harness {
    uploader: Arc<MemoryUploader>,
    fetcher: Arc<MemoryFetcher>,
    _staging: tempfile::TempDir,
    config: CatalogManagerConfig,
}

impl Harness {
    fn new() -> Self {
        let uploader = Arc::new(MemoryUploader::new());
        let fetcher = Arc::new(MemoryFetcher::new(uploader.clone()));
        let staging = tempfile::tempdir().unwrap();
        let config = CatalogManagerConfig::new(staging.path().join("publish"));
        Self {
            uploader,
            fetcher,
            _staging: staging,
            config,
        }
    }

    fn with_balancer(mut self, max_weight: u64, min_weight: u64) -> Self {
        self.config.balancer = Some(BalancerConfig {
            max_weight,
            min_weight,
        });
        self
    }

    fn fresh_manager(&self) -> WritableCatalogManager {
        // Each manager publishes into its own staging subtree.
        let mut config = self.config.clone();
        config.staging_dir = config
            .staging_dir
            .join(format!("run-{}", self.uploader.object_count()));
        WritableCatalogManager::create_repository(
            config,
            self.fetcher.clone(),
            self.uploader.clone(),
        )
        .unwrap()
    }

    async fn reopen(&self, root_digest: CasDigest) -> WritableCatalogManager {
        let mut config = self.config.clone();
        config.staging_dir = config.staging_dir.join("reopened");
        WritableCatalogManager::open_repository(
            config,
            root_digest,
            self.fetcher.clone(),
            self.uploader.clone(),
        )
        .await
        .unwrap()
    }
}

fn bulk_digest(data: &[u8]) -> CasDigest {
    let compressed = zstd::encode_all(Cursor::new(data), zstd::DEFAULT_COMPRESSION_LEVEL).unwrap();
    CasDigest::of_bytes(&compressed)
}

/// Create an empty repository, add `/a` and `/a/x`, commit. One catalog,
/// revision 1, and the file entry carries its bulk digest.
#[tokio::test]
async fn first_publish_of_a_single_file() {
    let harness = Harness::new();
    let manager = harness.fresh_manager();

    let content = b"X".repeat(100);
    let digest = bulk_digest(&content);

    manager
        .add_directory(DirectoryEntry::directory("a", 0o755), &CatalogPath::root())
        .await
        .unwrap();
    let mut file = DirectoryEntry::regular("x", 0o644, 100);
    file.content = Some(digest.clone());
    manager
        .add_file(file, &XattrList::new(), &p("/a"))
        .await
        .unwrap();

    let manifest = manager.commit(false, None).await.unwrap();
    assert_eq!(manifest.revision, 1);
    assert_eq!(manifest.catalog_count, 1);
    assert!(manifest.root_catalog_size > 0);
    assert!(harness
        .uploader
        .contains(&manifest.root_digest.catalog_key()));

    // The published root is self-contained: reopen it and look around.
    let reopened = harness.reopen(manifest.root_digest).await;
    let dir = reopened.get_entry(&p("/a")).await.unwrap().unwrap();
    assert!(dir.is_directory());
    let file = reopened.get_entry(&p("/a/x")).await.unwrap().unwrap();
    assert_eq!(file.size, 100);
    assert_eq!(file.content.unwrap(), digest);
    assert!(!file.chunked);
}

#[tokio::test]
async fn chunked_files_keep_their_chunk_list() {
    let harness = Harness::new();
    let manager = harness.fresh_manager();

    let chunks = vec![
        FileChunk {
            offset: 0,
            size: 120,
            digest: CasDigest::of_bytes(b"chunk0"),
        },
        FileChunk {
            offset: 120,
            size: 80,
            digest: CasDigest::of_bytes(b"chunk1"),
        },
    ];
    let entry = DirectoryEntry::regular("big", 0o644, 200);
    manager
        .add_chunked_file(entry, &XattrList::new(), &CatalogPath::root(), chunks.clone())
        .await
        .unwrap();

    let stored = manager.get_entry(&p("/big")).await.unwrap().unwrap();
    assert!(stored.chunked);
    assert!(stored.content.is_none());
    assert_eq!(manager.chunks_of(&p("/big")).await.unwrap(), chunks);

    // A gap in the list violates the partition invariant.
    let broken = vec![FileChunk {
        offset: 10,
        size: 90,
        digest: CasDigest::of_bytes(b"chunk2"),
    }];
    let err = manager
        .add_chunked_file(
            DirectoryEntry::regular("broken", 0o644, 100),
            &XattrList::new(),
            &CatalogPath::root(),
            broken,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CatalogError::InvalidChunkList { .. }));
}

#[tokio::test]
async fn mutation_invariants_are_enforced() {
    let harness = Harness::new();
    let manager = harness.fresh_manager();

    // Parent must exist.
    let err = manager
        .add_file(
            DirectoryEntry::regular("x", 0o644, 1),
            &XattrList::new(),
            &p("/missing"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CatalogError::ParentMissing(_)));

    manager
        .add_directory(DirectoryEntry::directory("d", 0o755), &CatalogPath::root())
        .await
        .unwrap();
    manager
        .add_file(
            DirectoryEntry::regular("x", 0o644, 1),
            &XattrList::new(),
            &p("/d"),
        )
        .await
        .unwrap();

    // No duplicates.
    let err = manager
        .add_file(
            DirectoryEntry::regular("x", 0o644, 1),
            &XattrList::new(),
            &p("/d"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CatalogError::AlreadyExists(_)));

    // Only leaf entries can be removed as files.
    let err = manager.remove_file(&p("/d")).await.unwrap_err();
    assert!(matches!(err, CatalogError::WrongType(_)));

    // Non-empty directories stay.
    let err = manager.remove_directory(&p("/d")).await.unwrap_err();
    assert!(matches!(err, CatalogError::NotEmpty(_)));

    manager.remove_file(&p("/d/x")).await.unwrap();
    manager.remove_directory(&p("/d")).await.unwrap();
    assert!(manager.get_entry(&p("/d")).await.unwrap().is_none());

    // Gone means gone.
    let err = manager.remove_file(&p("/d/x")).await.unwrap_err();
    assert!(matches!(err, CatalogError::NotFound(_)));
}

#[tokio::test]
async fn touch_directory_updates_metadata() {
    let harness = Harness::new();
    let manager = harness.fresh_manager();

    manager
        .add_directory(DirectoryEntry::directory("d", 0o755), &CatalogPath::root())
        .await
        .unwrap();

    let mut template = DirectoryEntry::directory("d", 0o700);
    template.mtime = 123456;
    template.uid = 42;
    manager.touch_directory(&template, &p("/d")).await.unwrap();

    let touched = manager.get_entry(&p("/d")).await.unwrap().unwrap();
    assert_eq!(touched.mode, 0o700);
    assert_eq!(touched.mtime, 123456);
    assert_eq!(touched.uid, 42);
}

#[tokio::test]
async fn hardlink_groups_share_an_id_and_shrink() {
    let harness = Harness::new();
    let manager = harness.fresh_manager();

    let members = vec![
        DirectoryEntry::regular("l1", 0o644, 10),
        DirectoryEntry::regular("l2", 0o644, 10),
        DirectoryEntry::regular("l3", 0o644, 10),
    ];
    manager
        .add_hardlink_group(members, &XattrList::new(), &CatalogPath::root())
        .await
        .unwrap();

    let g1 = manager.get_entry(&p("/l1")).await.unwrap().unwrap();
    let g2 = manager.get_entry(&p("/l2")).await.unwrap().unwrap();
    let g3 = manager.get_entry(&p("/l3")).await.unwrap().unwrap();
    assert_ne!(g1.hardlink_group, 0);
    assert_eq!(g1.hardlink_group, g2.hardlink_group);
    assert_eq!(g2.hardlink_group, g3.hardlink_group);

    manager.shrink_hardlink_group(&p("/l3")).await.unwrap();
    assert!(manager.get_entry(&p("/l3")).await.unwrap().is_none());
    assert_ne!(
        manager
            .get_entry(&p("/l1"))
            .await
            .unwrap()
            .unwrap()
            .hardlink_group,
        0
    );

    // Shrinking to one member dissolves the group.
    manager.shrink_hardlink_group(&p("/l2")).await.unwrap();
    assert_eq!(
        manager
            .get_entry(&p("/l1"))
            .await
            .unwrap()
            .unwrap()
            .hardlink_group,
        0
    );
}

#[tokio::test]
async fn nested_catalogs_roundtrip() {
    let harness = Harness::new();
    let manager = harness.fresh_manager();

    manager
        .add_directory(DirectoryEntry::directory("sw", 0o755), &CatalogPath::root())
        .await
        .unwrap();
    manager
        .add_directory(DirectoryEntry::directory("v1", 0o755), &p("/sw"))
        .await
        .unwrap();
    manager
        .add_file(
            DirectoryEntry::regular("bin", 0o755, 64),
            &XattrList::new(),
            &p("/sw/v1"),
        )
        .await
        .unwrap();

    assert!(!manager.is_transition_point(&p("/sw")).await.unwrap());
    manager.create_nested_catalog(&p("/sw")).await.unwrap();
    assert!(manager.is_transition_point(&p("/sw")).await.unwrap());

    // Mutations under the mountpoint land in the child catalog; entries
    // stay reachable through the same paths.
    manager
        .add_file(
            DirectoryEntry::regular("doc", 0o644, 16),
            &XattrList::new(),
            &p("/sw/v1"),
        )
        .await
        .unwrap();
    assert!(manager.get_entry(&p("/sw/v1/bin")).await.unwrap().is_some());
    assert!(manager.get_entry(&p("/sw/v1/doc")).await.unwrap().is_some());

    let weights = manager.loaded_catalog_weights();
    assert_eq!(weights.len(), 2);

    // Nesting twice is rejected.
    let err = manager.create_nested_catalog(&p("/sw")).await.unwrap_err();
    assert!(matches!(err, CatalogError::AlreadyNested(_)));

    manager.remove_nested_catalog(&p("/sw")).await.unwrap();
    assert!(!manager.is_transition_point(&p("/sw")).await.unwrap());
    assert!(manager.get_entry(&p("/sw/v1/bin")).await.unwrap().is_some());
    assert!(manager.get_entry(&p("/sw/v1/doc")).await.unwrap().is_some());
    assert_eq!(manager.loaded_catalog_weights().len(), 1);

    let err = manager.remove_nested_catalog(&p("/sw")).await.unwrap_err();
    assert!(matches!(err, CatalogError::NotNested(_)));
}

#[tokio::test]
async fn nested_catalogs_load_lazily_after_publish() {
    let harness = Harness::new();
    let manager = harness.fresh_manager();

    manager
        .add_directory(DirectoryEntry::directory("sw", 0o755), &CatalogPath::root())
        .await
        .unwrap();
    manager
        .add_file(
            DirectoryEntry::regular("tool", 0o755, 32),
            &XattrList::new(),
            &p("/sw"),
        )
        .await
        .unwrap();
    manager.create_nested_catalog(&p("/sw")).await.unwrap();

    let manifest = manager.commit(false, None).await.unwrap();
    assert_eq!(manifest.revision, 1);
    assert_eq!(manifest.catalog_count, 2);

    // A fresh manager sees only the root; touching /sw/tool forces the
    // nested catalog in.
    let reopened = harness.reopen(manifest.root_digest).await;
    assert_eq!(reopened.loaded_catalog_weights().len(), 1);
    let entry = reopened.get_entry(&p("/sw/tool")).await.unwrap().unwrap();
    assert_eq!(entry.size, 32);
    assert_eq!(reopened.loaded_catalog_weights().len(), 2);
    assert!(reopened.is_transition_point(&p("/sw")).await.unwrap());

    // Mutating the lazily loaded subtree and committing bumps the revision.
    reopened
        .add_file(
            DirectoryEntry::regular("tool2", 0o755, 48),
            &XattrList::new(),
            &p("/sw"),
        )
        .await
        .unwrap();
    let second = reopened.commit(false, None).await.unwrap();
    assert_eq!(second.revision, 2);

    let third = harness.reopen(second.root_digest).await;
    assert!(third.get_entry(&p("/sw/tool2")).await.unwrap().is_some());
}

#[tokio::test]
async fn manual_revision_overrides_the_counter() {
    let harness = Harness::new();
    let manager = harness.fresh_manager();
    manager
        .add_directory(DirectoryEntry::directory("a", 0o755), &CatalogPath::root())
        .await
        .unwrap();
    let manifest = manager.commit(false, Some(40)).await.unwrap();
    assert_eq!(manifest.revision, 40);
}

#[tokio::test]
async fn upload_failure_aborts_commit() {
    let harness = Harness::new();
    let manager = harness.fresh_manager();
    manager
        .add_directory(DirectoryEntry::directory("a", 0o755), &CatalogPath::root())
        .await
        .unwrap();

    harness.uploader.fail_everything();
    let err = manager.commit(false, None).await.unwrap_err();
    assert!(matches!(err, CatalogError::UploadFailed(_)));
}

/// Two publishes of the same mutation sequence produce the same root
/// digest.
#[tokio::test]
async fn commits_are_deterministic() {
    async fn publish(harness: &Harness) -> CasDigest {
        let manager = harness.fresh_manager();
        manager
            .add_directory(DirectoryEntry::directory("sw", 0o755), &CatalogPath::root())
            .await
            .unwrap();
        for i in 0..10 {
            let mut file = DirectoryEntry::regular(format!("f{i}"), 0o644, 100 + i);
            file.mtime = 1_600_000_000;
            file.content = Some(CasDigest::of_bytes(format!("content-{i}").as_bytes()));
            manager
                .add_file(file, &XattrList::new(), &p("/sw"))
                .await
                .unwrap();
        }
        manager.create_nested_catalog(&p("/sw")).await.unwrap();
        manager.commit(false, None).await.unwrap().root_digest
    }

    let harness = Harness::new();
    let first = publish(&harness).await;
    let second = publish(&harness).await;
    assert_eq!(first, second);
}

/// Balancer scenario: 25 entries in a branching tree, max weight 10,
/// min weight 3. At least two nested catalogs appear, each within the
/// band, and the residual parent fits.
#[tokio::test]
async fn balancer_splits_an_overweight_catalog() {
    let harness = Harness::new().with_balancer(10, 3);
    let manager = harness.fresh_manager();

    for dir in ["a", "b", "c"] {
        manager
            .add_directory(DirectoryEntry::directory(dir, 0o755), &CatalogPath::root())
            .await
            .unwrap();
    }
    for i in 0..8 {
        for dir in ["/a", "/b"] {
            manager
                .add_file(
                    DirectoryEntry::regular(format!("f{i}"), 0o644, 10),
                    &XattrList::new(),
                    &p(dir),
                )
                .await
                .unwrap();
        }
    }
    for i in 0..4 {
        manager
            .add_file(
                DirectoryEntry::regular(format!("f{i}"), 0o644, 10),
                &XattrList::new(),
                &p("/c"),
            )
            .await
            .unwrap();
    }
    // 1 root + 3 dirs + 20 files, plus the child root copies to come.

    manager.balance().unwrap();

    let weights = manager.loaded_catalog_weights();
    let nested: Vec<_> = weights
        .iter()
        .filter(|(mountpoint, _)| !mountpoint.is_root())
        .collect();
    assert!(nested.len() >= 2, "expected at least two splits: {weights:?}");
    for (mountpoint, weight) in &nested {
        assert!(
            (3..=10).contains(weight),
            "nested catalog {mountpoint} has weight {weight}"
        );
        assert!(manager.is_transition_point(mountpoint).await.unwrap());
    }
    let root_weight = weights
        .iter()
        .find(|(mountpoint, _)| mountpoint.is_root())
        .map(|(_, weight)| *weight)
        .unwrap();
    assert!(root_weight <= 10, "root residual weight is {root_weight}");
}

/// Full pipeline: the file processor chunks and uploads content, its
/// reports feed the catalog, and the commit publishes a root that points
/// at everything.
#[tokio::test]
async fn ingest_reports_feed_the_catalog() {
    use canopy_cas::{ChunkerConfig, FileJob, FileProcessor, FileProcessorConfig};

    let harness = Harness::new();
    let manager = harness.fresh_manager();

    let input_dir = tempfile::tempdir().unwrap();
    let small_path = input_dir.path().join("small");
    let big_path = input_dir.path().join("big");
    std::fs::write(&small_path, b"tiny contents").unwrap();
    let big_data: Vec<u8> = (0..16 * 1024).map(|i| (i * 31 % 251) as u8).collect();
    std::fs::write(&big_path, &big_data).unwrap();

    let mut processor_config = FileProcessorConfig::new(input_dir.path().join("staging"));
    processor_config.chunking = Some(ChunkerConfig {
        min_size: 64,
        avg_size: 256,
        max_size: 1024,
    });
    let (processor, mut reports) =
        FileProcessor::spawn(processor_config, harness.uploader.clone()).unwrap();

    for path in [&small_path, &big_path] {
        processor
            .submit(FileJob {
                local_path: path.clone(),
                allow_chunking: true,
            })
            .await
            .unwrap();
    }

    for _ in 0..2 {
        let report = reports.recv().await.unwrap();
        assert!(report.succeeded());
        let name = report
            .local_path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .into_owned();
        let size: u64 = std::fs::metadata(&report.local_path).unwrap().len();

        if report.is_chunked() {
            let entry = DirectoryEntry::regular(name, 0o644, size);
            manager
                .add_chunked_file(entry, &XattrList::new(), &CatalogPath::root(), report.chunks)
                .await
                .unwrap();
        } else {
            let mut entry = DirectoryEntry::regular(name, 0o644, size);
            entry.content = Some(report.bulk.unwrap().digest);
            manager
                .add_file(entry, &XattrList::new(), &CatalogPath::root())
                .await
                .unwrap();
        }
    }
    processor.shutdown().await;

    let manifest = manager.commit(false, None).await.unwrap();

    // Every chunk the published entries reference is in the object store.
    let reopened = harness.reopen(manifest.root_digest).await;
    let big = reopened.get_entry(&p("/big")).await.unwrap().unwrap();
    assert!(big.chunked);
    let chunks = reopened.chunks_of(&p("/big")).await.unwrap();
    assert!(!chunks.is_empty());
    assert_eq!(chunks.iter().map(|c| c.size).sum::<u64>(), big_data.len() as u64);
    for chunk in &chunks {
        assert!(harness.uploader.contains(&chunk.digest.chunk_key()));
    }

    let small = reopened.get_entry(&p("/small")).await.unwrap().unwrap();
    assert!(harness
        .uploader
        .contains(&small.content.unwrap().chunk_key()));
}

/// The merge half of the balancer: an underweight nested catalog is
/// dissolved when the parent has room.
#[tokio::test]
async fn balancer_merges_underweight_catalogs() {
    let harness = Harness::new().with_balancer(10, 3);
    let manager = harness.fresh_manager();

    manager
        .add_directory(DirectoryEntry::directory("tiny", 0o755), &CatalogPath::root())
        .await
        .unwrap();
    manager
        .add_file(
            DirectoryEntry::regular("only", 0o644, 1),
            &XattrList::new(),
            &p("/tiny"),
        )
        .await
        .unwrap();
    manager.create_nested_catalog(&p("/tiny")).await.unwrap();
    assert_eq!(manager.loaded_catalog_weights().len(), 2);

    manager.balance().unwrap();

    assert_eq!(manager.loaded_catalog_weights().len(), 1);
    assert!(!manager.is_transition_point(&p("/tiny")).await.unwrap());
    assert!(manager.get_entry(&p("/tiny/only")).await.unwrap().is_some());
}
