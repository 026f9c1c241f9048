use std::collections::BTreeMap;

use bytes::Bytes;
use canopy_cas::{CasDigest, FileChunk};

use crate::path::CatalogPath;

/// Exactly one of these holds for every entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum EntryKind {
    Regular,
    Directory,
    Symlink,
    /// Device nodes, fifos and sockets; carried as metadata only.
    Special,
}

/// Ordered extended-attribute set. Directories are published without
/// xattrs; the shared empty list is owned by the catalog manager rather
/// than a process-wide global.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct XattrList(BTreeMap<Bytes, Bytes>);

impl XattrList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &[u8]) -> Option<&Bytes> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Bytes, &Bytes)> {
        self.0.iter()
    }
}

/// One unit of filesystem metadata, as stored in a catalog.
///
/// The `nested_mountpoint` flag lives on the parent catalog's copy of a
/// transition point; `nested_root` on the child catalog's copy of the same
/// path.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DirectoryEntry {
    pub name: Bytes,
    pub kind: EntryKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: i64,
    pub size: u64,
    pub symlink_target: Option<Bytes>,
    pub xattrs: XattrList,
    /// Content address of the bulk object; `None` for a chunked-only file
    /// and for non-regular entries.
    pub content: Option<CasDigest>,
    /// 0 means no hardlink group.
    pub hardlink_group: u64,
    pub nested_mountpoint: bool,
    pub nested_root: bool,
    pub chunked: bool,
    pub external: bool,
}

impl DirectoryEntry {
    pub fn regular(name: impl Into<Bytes>, mode: u32, size: u64) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::Regular,
            mode,
            uid: 0,
            gid: 0,
            mtime: 0,
            size,
            symlink_target: None,
            xattrs: XattrList::new(),
            content: None,
            hardlink_group: 0,
            nested_mountpoint: false,
            nested_root: false,
            chunked: false,
            external: false,
        }
    }

    pub fn directory(name: impl Into<Bytes>, mode: u32) -> Self {
        Self {
            kind: EntryKind::Directory,
            size: 0,
            ..Self::regular(name, mode, 0)
        }
    }

    pub fn symlink(name: impl Into<Bytes>, target: impl Into<Bytes>) -> Self {
        let target = target.into();
        Self {
            kind: EntryKind::Symlink,
            size: target.len() as u64,
            symlink_target: Some(target),
            ..Self::regular(name, 0o777, 0)
        }
    }

    pub fn is_directory(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn is_regular(&self) -> bool {
        self.kind == EntryKind::Regular
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == EntryKind::Symlink
    }

    /// True for the kinds a hardlink group may contain and `remove_file`
    /// may delete.
    pub fn is_leaf(&self) -> bool {
        matches!(
            self.kind,
            EntryKind::Regular | EntryKind::Symlink | EntryKind::Special
        )
    }
}

/// Check the chunk-list invariants for a chunked file of `size` bytes:
/// ascending offsets tiling `[0, size)` without overlap or gap, and a
/// non-empty list.
pub fn validate_chunk_list(path: &CatalogPath, size: u64, chunks: &[FileChunk]) -> Result<(), String> {
    if chunks.is_empty() {
        return Err(format!("chunked file {path} with empty chunk list"));
    }
    let mut expected_offset = 0u64;
    for chunk in chunks {
        if chunk.offset != expected_offset {
            return Err(format!(
                "chunk at offset {} of {path}, expected {expected_offset}",
                chunk.offset
            ));
        }
        if chunk.size == 0 && size != 0 {
            return Err(format!("empty chunk at offset {} of {path}", chunk.offset));
        }
        expected_offset += chunk.size;
    }
    if expected_offset != size {
        return Err(format!(
            "chunks of {path} cover {expected_offset} bytes, file has {size}"
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(offset: u64, size: u64) -> FileChunk {
        FileChunk {
            offset,
            size,
            digest: CasDigest::of_bytes(&offset.to_be_bytes()),
        }
    }

    #[test]
    fn constructors_set_kind() {
        assert!(DirectoryEntry::regular("f", 0o644, 10).is_regular());
        assert!(DirectoryEntry::directory("d", 0o755).is_directory());
        let link = DirectoryEntry::symlink("l", "target");
        assert!(link.is_symlink());
        assert_eq!(link.size, 6);
        assert_eq!(link.symlink_target.unwrap(), Bytes::from("target"));
    }

    #[test]
    fn chunk_list_must_tile() {
        let path: CatalogPath = "/big".parse().unwrap();
        assert!(validate_chunk_list(&path, 30, &[chunk(0, 10), chunk(10, 20)]).is_ok());
        assert!(validate_chunk_list(&path, 30, &[]).is_err());
        // gap
        assert!(validate_chunk_list(&path, 30, &[chunk(0, 10), chunk(15, 15)]).is_err());
        // overlap
        assert!(validate_chunk_list(&path, 30, &[chunk(0, 20), chunk(10, 20)]).is_err());
        // short
        assert!(validate_chunk_list(&path, 40, &[chunk(0, 10), chunk(10, 20)]).is_err());
    }

    #[test]
    fn xattrs_are_ordered() {
        let mut xattrs = XattrList::new();
        xattrs.set(&b"user.b"[..], &b"2"[..]);
        xattrs.set(&b"user.a"[..], &b"1"[..]);
        let keys: Vec<_> = xattrs.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec![Bytes::from("user.a"), Bytes::from("user.b")]);
    }

    #[test]
    fn entry_row_roundtrip() {
        let mut entry = DirectoryEntry::regular("data.bin", 0o644, 1234);
        entry.content = Some(CasDigest::of_bytes(b"object"));
        entry.chunked = true;
        entry.xattrs.set(&b"user.k"[..], &b"v"[..]);

        let encoded = bincode::serialize(&entry).unwrap();
        let decoded: DirectoryEntry = bincode::deserialize(&encoded).unwrap();
        assert_eq!(entry, decoded);
    }
}
