//! Ledger storage using RocksDB
//!
//! # Column Families
//!
//! - `entries` - Ledger entries (key: sequence_id, big endian)
//! - `subjects` - Secondary index (key: subject || 0x00 || sequence_id)
//!
//! Every mutation is a single `WriteBatch`. Sequence ids are dense, so the
//! last key of `entries` is also the entry count.
//!
//! Only the mutation actor writes; reads may come from any thread.

use crate::{
    error::{Error, Result},
    types::{HolderId, LedgerEntry, NewEntry, Order},
    Config,
};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, Snapshot, WriteBatch,
    WriteOptions, DB,
};
use std::fmt;
use std::path::PathBuf;

/// Column family names
const CF_ENTRIES: &str = "entries";
const CF_SUBJECTS: &str = "subjects";

/// Separates the subject from the sequence id in index keys
const SUBJECT_SEPARATOR: u8 = 0x00;

/// Storage wrapper for RocksDB
pub struct Storage {
    db: DB,
    path: PathBuf,
    sync_writes: bool,
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("path", &self.path)
            .field("sync_writes", &self.sync_writes)
            .finish()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.storage.data_dir;

        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_ENTRIES, Self::cf_options_entries()),
            ColumnFamilyDescriptor::new(CF_SUBJECTS, Self::cf_options_subjects()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(path = ?path, "Opened ledger store");

        Ok(Self {
            db,
            path: path.clone(),
            sync_writes: config.storage.sync_writes,
        })
    }

    // Column family options

    fn cf_options_entries() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_subjects() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.sync_writes);
        self.db.write_opt(batch, &opts)?;
        Ok(())
    }

    // Entry operations

    /// Append entries as one atomic unit, assigning sequence ids in call order
    pub fn append(&self, entries: Vec<NewEntry>) -> Result<Vec<LedgerEntry>> {
        let cf_entries = self.cf_handle(CF_ENTRIES)?;
        let cf_subjects = self.cf_handle(CF_SUBJECTS)?;

        let first = self.count()? + 1;
        let mut batch = WriteBatch::default();
        let mut appended = Vec::with_capacity(entries.len());

        for (offset, entry) in entries.into_iter().enumerate() {
            let entry = entry.into_entry(first + offset as u64);
            batch.put_cf(cf_entries, entry_key(entry.sequence_id), bincode::serialize(&entry)?);
            batch.put_cf(cf_subjects, subject_key(&entry.subject, entry.sequence_id), b"");
            appended.push(entry);
        }

        self.write(batch)?;

        tracing::debug!(
            first_sequence_id = first,
            count = appended.len(),
            "Entries appended"
        );

        Ok(appended)
    }

    /// Relabel every entry of `from` as `to` and append `marker`, atomically.
    ///
    /// Returns the persisted marker and the number of relabelled rows.
    pub fn rename_subject(
        &self,
        from: &HolderId,
        to: &HolderId,
        marker: NewEntry,
    ) -> Result<(LedgerEntry, usize)> {
        let cf_entries = self.cf_handle(CF_ENTRIES)?;
        let cf_subjects = self.cf_handle(CF_SUBJECTS)?;

        let mut batch = WriteBatch::default();
        let sequence_ids = self.sequence_ids_for(from)?;

        for &sequence_id in &sequence_ids {
            let mut entry = self.get(sequence_id)?.ok_or_else(|| {
                Error::ConsistencyViolation(format!(
                    "Subject index of {} points at missing entry {}",
                    from, sequence_id
                ))
            })?;
            entry.subject = to.clone();

            batch.put_cf(cf_entries, entry_key(sequence_id), bincode::serialize(&entry)?);
            batch.delete_cf(cf_subjects, subject_key(from, sequence_id));
            batch.put_cf(cf_subjects, subject_key(to, sequence_id), b"");
        }

        let marker = marker.into_entry(self.count()? + 1);
        batch.put_cf(cf_entries, entry_key(marker.sequence_id), bincode::serialize(&marker)?);
        batch.put_cf(cf_subjects, subject_key(&marker.subject, marker.sequence_id), b"");

        self.write(batch)?;

        tracing::debug!(
            from = %from,
            to = %to,
            relabelled = sequence_ids.len(),
            marker_sequence_id = marker.sequence_id,
            "Subject renamed"
        );

        Ok((marker, sequence_ids.len()))
    }

    /// Sequence ids of every entry currently attributed to `subject`, ascending
    pub fn sequence_ids_for(&self, subject: &HolderId) -> Result<Vec<u64>> {
        let cf = self.cf_handle(CF_SUBJECTS)?;
        let prefix = subject_prefix(subject);

        let mut ids = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            ids.push(decode_sequence_id(&key[prefix.len()..])?);
        }

        Ok(ids)
    }

    /// Get entry by sequence id
    pub fn get(&self, sequence_id: u64) -> Result<Option<LedgerEntry>> {
        let cf = self.cf_handle(CF_ENTRIES)?;

        match self.db.get_cf(cf, entry_key(sequence_id))? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Lazy scan over all entries. Each call starts a fresh pass.
    pub fn scan(&self, order: Order) -> Result<impl Iterator<Item = Result<LedgerEntry>> + '_> {
        let cf = self.cf_handle(CF_ENTRIES)?;
        let mode = match order {
            Order::Ascending => IteratorMode::Start,
            Order::Descending => IteratorMode::End,
        };

        Ok(self.db.iterator_cf(cf, mode).map(decode_entry))
    }

    /// Number of entries ever appended
    pub fn count(&self) -> Result<u64> {
        let cf = self.cf_handle(CF_ENTRIES)?;

        match self.db.iterator_cf(cf, IteratorMode::End).next() {
            Some(item) => {
                let (key, _) = item?;
                decode_sequence_id(&key)
            }
            None => Ok(0),
        }
    }

    /// Point-in-time view of the ledger.
    ///
    /// A mutation is one `WriteBatch`, so the view contains each mutation
    /// entirely or not at all, including the relabelling done by a rename.
    pub fn view(&self) -> Result<LedgerView<'_>> {
        Ok(LedgerView {
            snapshot: self.db.snapshot(),
            entries: self.cf_handle(CF_ENTRIES)?,
        })
    }

    /// Close database (graceful shutdown)
    pub fn close(self) -> Result<()> {
        drop(self.db);
        tracing::info!(path = ?self.path, "Ledger store closed");
        Ok(())
    }
}

/// Read-only ledger snapshot, see [`Storage::view`]
pub struct LedgerView<'a> {
    snapshot: Snapshot<'a>,
    entries: &'a ColumnFamily,
}

impl fmt::Debug for LedgerView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LedgerView").finish_non_exhaustive()
    }
}

impl LedgerView<'_> {
    /// Number of entries in the view
    pub fn count(&self) -> Result<u64> {
        match self.snapshot.iterator_cf(self.entries, IteratorMode::End).next() {
            Some(item) => {
                let (key, _) = item?;
                decode_sequence_id(&key)
            }
            None => Ok(0),
        }
    }

    /// All entries in the view
    pub fn entries(&self, order: Order) -> Result<Vec<LedgerEntry>> {
        let mode = match order {
            Order::Ascending => IteratorMode::Start,
            Order::Descending => IteratorMode::End,
        };

        self.snapshot
            .iterator_cf(self.entries, mode)
            .map(decode_entry)
            .collect()
    }
}

// Key helpers

fn entry_key(sequence_id: u64) -> [u8; 8] {
    sequence_id.to_be_bytes()
}

fn subject_prefix(subject: &HolderId) -> Vec<u8> {
    let mut key = subject.as_bytes().to_vec();
    key.push(SUBJECT_SEPARATOR);
    key
}

fn subject_key(subject: &HolderId, sequence_id: u64) -> Vec<u8> {
    let mut key = subject_prefix(subject);
    key.extend_from_slice(&sequence_id.to_be_bytes());
    key
}

fn decode_sequence_id(bytes: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::Storage(format!("Malformed sequence key of {} bytes", bytes.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

fn decode_entry(
    item: std::result::Result<(Box<[u8]>, Box<[u8]>), rocksdb::Error>,
) -> Result<LedgerEntry> {
    let (_, value) = item?;
    Ok(bincode::deserialize(&value)?)
}
