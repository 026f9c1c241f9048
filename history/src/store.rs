//! The append-mostly tag database.
//!
//! Backed by one redb file; a single writer mutates it through explicit
//! transactions while readers see committed snapshots. Rollback deletes
//! every channel peer at or above the target revision and reinstates the
//! target under a fresh revision, atomically.

use std::path::Path;

use canopy_cas::CasDigest;
use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use tracing::{debug, instrument};

use crate::{Channel, HistoryError, Tag};

const TAGS: TableDefinition<&str, Vec<u8>> = TableDefinition::new("tags");
const META: TableDefinition<&str, Vec<u8>> = TableDefinition::new("meta");

const SCHEMA: &[u8] = b"canopy-history-1";

/// Name of the tag tracking the latest publish.
pub const HEAD_TAG: &str = "trunk";
/// Undo tag holding the head before the latest publish.
pub const PREVIOUS_HEAD_TAG: &str = "trunk-previous";

/// A tag row plus its insertion sequence number, which breaks ordering
/// ties between tags of equal revision.
#[derive(serde::Serialize, serde::Deserialize)]
struct StoredTag {
    tag: Tag,
    insert_seq: u64,
}

pub struct TagStore {
    db: Database,
    txn: Option<WriteTransaction>,
    repository_name: String,
    insert_seq: u64,
}

impl TagStore {
    /// Create a fresh history database for `repository_name`.
    #[instrument(skip_all, fields(repository = repository_name))]
    pub fn create(db_path: &Path, repository_name: &str) -> Result<Self, HistoryError> {
        let db = Database::create(db_path)?;
        let txn = db.begin_write()?;
        {
            txn.open_table(TAGS)?;
            let mut meta = txn.open_table(META)?;
            meta.insert("schema", SCHEMA.to_vec())?;
            meta.insert("repository", repository_name.as_bytes().to_vec())?;
            meta.insert("insert_seq", bincode::serialize(&0u64)?)?;
        }
        txn.commit()?;

        Ok(Self {
            db,
            txn: None,
            repository_name: repository_name.to_string(),
            insert_seq: 0,
        })
    }

    /// Open an existing history database.
    pub fn open(db_path: &Path) -> Result<Self, HistoryError> {
        let db = Database::open(db_path)
            .map_err(|e| HistoryError::LoadFailed(format!("{db_path:?}: {e}")))?;

        let (repository_name, insert_seq) = {
            let txn = db.begin_read()?;
            let meta = txn
                .open_table(META)
                .map_err(|e| HistoryError::LoadFailed(e.to_string()))?;

            let schema = meta
                .get("schema")?
                .ok_or_else(|| HistoryError::LoadFailed("missing schema tag".into()))?;
            if schema.value() != SCHEMA {
                return Err(HistoryError::LoadFailed("unknown history schema".into()));
            }

            let repository = meta
                .get("repository")?
                .ok_or_else(|| HistoryError::LoadFailed("missing repository name".into()))?;
            let repository = String::from_utf8(repository.value())
                .map_err(|_| HistoryError::LoadFailed("malformed repository name".into()))?;

            let insert_seq = match meta.get("insert_seq")? {
                Some(raw) => bincode::deserialize(&raw.value())?,
                None => 0,
            };
            (repository, insert_seq)
        };

        Ok(Self {
            db,
            txn: None,
            repository_name,
            insert_seq,
        })
    }

    pub fn repository_name(&self) -> &str {
        &self.repository_name
    }

    pub fn begin(&mut self) -> Result<(), HistoryError> {
        if self.txn.is_none() {
            self.txn = Some(self.db.begin_write()?);
        }
        Ok(())
    }

    pub fn commit(&mut self) -> Result<(), HistoryError> {
        if let Some(txn) = self.txn.take() {
            txn.commit()?;
        }
        Ok(())
    }

    /// Discard the open transaction and restore the committed sequence
    /// counter.
    pub fn rollback_transaction(&mut self) -> Result<(), HistoryError> {
        if let Some(txn) = self.txn.take() {
            txn.abort()?;
            let txn = self.db.begin_read()?;
            let meta = txn.open_table(META)?;
            self.insert_seq = match meta.get("insert_seq")? {
                Some(raw) => bincode::deserialize(&raw.value())?,
                None => 0,
            };
        }
        Ok(())
    }

    fn txn(&mut self) -> Result<&WriteTransaction, HistoryError> {
        if self.txn.is_none() {
            self.txn = Some(self.db.begin_write()?);
        }
        Ok(self.txn.as_ref().unwrap())
    }

    // - - - operations - - -

    /// Insert a tag; names are unique across the whole history.
    #[instrument(skip_all, fields(name = %tag.name, revision = tag.revision, channel = %tag.channel))]
    pub fn insert(&mut self, tag: &Tag) -> Result<(), HistoryError> {
        let seq = self.insert_seq + 1;
        let encoded = bincode::serialize(&StoredTag {
            tag: tag.clone(),
            insert_seq: seq,
        })?;

        let txn = self.txn()?;
        {
            let mut tags = txn.open_table(TAGS)?;
            if tags.get(tag.name.as_str())?.is_some() {
                return Err(HistoryError::Duplicate(tag.name.clone()));
            }
            tags.insert(tag.name.as_str(), encoded)?;
        }
        {
            let mut meta = txn.open_table(META)?;
            meta.insert("insert_seq", bincode::serialize(&seq)?)?;
        }
        self.insert_seq = seq;
        Ok(())
    }

    /// Removing an unknown name succeeds with no effect.
    pub fn remove(&mut self, name: &str) -> Result<(), HistoryError> {
        let txn = self.txn()?;
        let mut tags = txn.open_table(TAGS)?;
        tags.remove(name)?;
        Ok(())
    }

    pub fn exists(&mut self, name: &str) -> Result<bool, HistoryError> {
        Ok(self.get_by_name(name)?.is_some())
    }

    pub fn get_by_name(&mut self, name: &str) -> Result<Option<Tag>, HistoryError> {
        let txn = self.txn()?;
        let tags = txn.open_table(TAGS)?;
        let result = match tags.get(name)? {
            Some(raw) => {
                let stored: StoredTag = bincode::deserialize(&raw.value())?;
                Ok(Some(stored.tag))
            }
            None => Ok(None),
        };
        result
    }

    pub fn count(&mut self) -> Result<u64, HistoryError> {
        Ok(self.all_stored()?.len() as u64)
    }

    /// All tags, by descending revision; equal revisions keep insertion
    /// order.
    pub fn list(&mut self) -> Result<Vec<Tag>, HistoryError> {
        let mut stored = self.all_stored()?;
        stored.sort_by(|a, b| {
            b.tag
                .revision
                .cmp(&a.tag.revision)
                .then_with(|| a.insert_seq.cmp(&b.insert_seq))
        });
        Ok(stored.into_iter().map(|s| s.tag).collect())
    }

    /// One tag per channel: the highest revision, latest insertion on ties.
    pub fn tips(&mut self) -> Result<Vec<Tag>, HistoryError> {
        let stored = self.all_stored()?;
        let mut tips = Vec::new();
        for channel in Channel::ALL {
            let tip = stored
                .iter()
                .filter(|s| s.tag.channel == channel)
                .max_by_key(|s| (s.tag.revision, s.insert_seq));
            if let Some(tip) = tip {
                tips.push(tip.tag.clone());
            }
        }
        Ok(tips)
    }

    /// The tag whose timestamp is the largest value not after `timestamp`;
    /// `None` if the history starts later.
    pub fn get_by_date(&mut self, timestamp: i64) -> Result<Option<Tag>, HistoryError> {
        Ok(self
            .all_stored()?
            .into_iter()
            .filter(|s| s.tag.timestamp <= timestamp)
            .max_by_key(|s| (s.tag.timestamp, s.tag.revision, s.insert_seq))
            .map(|s| s.tag))
    }

    /// Root digests in [TagStore::list] order.
    pub fn get_hashes(&mut self) -> Result<Vec<CasDigest>, HistoryError> {
        Ok(self.list()?.into_iter().map(|t| t.root_digest).collect())
    }

    /// Dry run of [TagStore::rollback]: the channel peers at or above the
    /// target's revision, by descending revision. Ordering within one
    /// revision is unspecified.
    pub fn list_tags_affected_by_rollback(
        &mut self,
        name: &str,
    ) -> Result<Vec<Tag>, HistoryError> {
        let target = self
            .get_by_name(name)?
            .ok_or_else(|| HistoryError::NotFound(name.to_string()))?;
        let mut affected = self.affected_set(&target)?;
        affected.sort_by(|a, b| {
            b.tag
                .revision
                .cmp(&a.tag.revision)
                .then_with(|| b.insert_seq.cmp(&a.insert_seq))
        });
        Ok(affected.into_iter().map(|s| s.tag).collect())
    }

    /// Replace the target tag with a copy pointing at an older root under a
    /// new revision, removing every channel peer whose revision is at or
    /// above the original one. Runs inside the store's transaction.
    #[instrument(skip_all, fields(name = %target.name, new_revision = target.revision))]
    pub fn rollback(&mut self, target: &Tag) -> Result<(), HistoryError> {
        let existing = self
            .get_by_name(&target.name)?
            .ok_or_else(|| HistoryError::NotFound(target.name.clone()))?;
        let affected = self.affected_set(&existing)?;
        if !affected.iter().any(|s| s.tag.name == target.name) {
            return Err(HistoryError::RollbackTargetInvalid(target.name.clone()));
        }

        for stored in &affected {
            debug!(name = %stored.tag.name, revision = stored.tag.revision, "rollback removes tag");
            self.remove(&stored.tag.name)?;
        }

        let mut reinstated = existing;
        reinstated.revision = target.revision;
        reinstated.root_digest = target.root_digest.clone();
        self.insert(&reinstated)
    }

    /// Move the current head tag aside and record a new head, maintaining
    /// the one-step undo pair.
    pub fn update_undo_tags(&mut self, new_head: &Tag) -> Result<(), HistoryError> {
        self.remove(PREVIOUS_HEAD_TAG)?;
        if let Some(mut previous_head) = self.get_by_name(HEAD_TAG)? {
            self.remove(HEAD_TAG)?;
            previous_head.name = PREVIOUS_HEAD_TAG.to_string();
            self.insert(&previous_head)?;
        }
        let mut head = new_head.clone();
        head.name = HEAD_TAG.to_string();
        self.insert(&head)
    }

    fn affected_set(&mut self, target: &Tag) -> Result<Vec<StoredTag>, HistoryError> {
        Ok(self
            .all_stored()?
            .into_iter()
            .filter(|s| s.tag.channel == target.channel && s.tag.revision >= target.revision)
            .collect())
    }

    fn all_stored(&mut self) -> Result<Vec<StoredTag>, HistoryError> {
        let txn = self.txn()?;
        let tags = txn.open_table(TAGS)?;
        let mut result = Vec::new();
        for item in tags.iter()? {
            let (_, value) = item?;
            result.push(bincode::deserialize(&value.value())?);
        }
        Ok(result)
    }
}
