//! Rotating on-disk journal of locally submitted transactions.
//!
//! Locally created transactions are appended here so the ones not yet
//! included in a block survive node restarts. Each record is a little
//! endian `u32` length prefix followed by the MessagePack-encoded
//! transaction.

use crate::core::transaction::Transaction;
use crate::pool::PoolError;
use crate::types::address::Address;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Errors surfaced by journal operations.
#[derive(Debug, Error)]
pub enum JournalError {
    /// A transaction was inserted while no journal file is open.
    #[error("no active journal")]
    NoActiveJournal,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Encode(#[from] rmp_serde::encode::Error),
    #[error(transparent)]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Output stream of the journal.
///
/// The null variant discards writes; it is installed while the journal is
/// being loaded so re-injected transactions are not journaled a second
/// time.
enum JournalWriter {
    File(File),
    Null,
}

impl Write for JournalWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            JournalWriter::File(file) => file.write(buf),
            JournalWriter::Null => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            JournalWriter::File(file) => file.flush(),
            JournalWriter::Null => Ok(()),
        }
    }
}

/// Rotating log of transactions backing up local submissions to disk.
pub(crate) struct TxJournal {
    /// Filesystem path to store the transactions at.
    path: PathBuf,
    /// Output stream to write new transactions into.
    writer: Option<JournalWriter>,
}

impl TxJournal {
    pub(crate) fn new(path: impl Into<PathBuf>) -> Self {
        TxJournal {
            path: path.into(),
            writer: None,
        }
    }

    /// Parses the journal from disk, feeding each record to `inject`.
    ///
    /// A missing file is a no-op. Decoding stops at the first corrupt or
    /// truncated record; the successfully parsed prefix is kept and the
    /// error is returned for the caller to log. Writes are discarded for
    /// the duration of the load so injection does not re-journal.
    pub(crate) fn load(
        &mut self,
        mut inject: impl FnMut(Transaction) -> Result<(), PoolError>,
    ) -> Result<(), JournalError> {
        if !self.path.exists() {
            return Ok(());
        }
        let input = File::open(&self.path)?;
        let mut reader = BufReader::new(input);

        // Temporarily discard any journal additions (don't double add on load).
        self.writer = Some(JournalWriter::Null);

        let mut total = 0u64;
        let mut dropped = 0u64;
        let failure = loop {
            let mut len_bytes = [0u8; 4];
            match reader.read_exact(&mut len_bytes) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => break None,
                Err(err) => break Some(JournalError::from(err)),
            }

            let len = u32::from_le_bytes(len_bytes) as usize;
            let mut record = vec![0u8; len];
            if let Err(err) = reader.read_exact(&mut record) {
                break Some(JournalError::from(err));
            }
            let tx: Transaction = match rmp_serde::from_slice(&record) {
                Ok(tx) => tx,
                Err(err) => break Some(JournalError::from(err)),
            };

            total += 1;
            if let Err(err) = inject(tx) {
                debug!(%err, "Failed to add journaled transaction");
                dropped += 1;
            }
        };
        self.writer = None;

        info!(transactions = total, dropped, "Loaded local transaction journal");
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Appends the transaction to the journal.
    pub(crate) fn insert(&mut self, tx: &Transaction) -> Result<(), JournalError> {
        let writer = self.writer.as_mut().ok_or(JournalError::NoActiveJournal)?;
        write_record(writer, tx)
    }

    /// Regenerates the journal from the given pool snapshot.
    ///
    /// Writes `<path>.new`, atomically renames it over the live journal,
    /// then reopens the file in append mode for subsequent inserts.
    pub(crate) fn rotate(
        &mut self,
        all: &HashMap<Address, Vec<Arc<Transaction>>>,
    ) -> Result<(), JournalError> {
        // Close the current journal (if any is open).
        self.writer = None;

        let mut replacement_path = self.path.clone().into_os_string();
        replacement_path.push(".new");
        let replacement_path = PathBuf::from(replacement_path);

        let mut replacement = File::create(&replacement_path)?;
        let mut journaled = 0usize;
        for txs in all.values() {
            for tx in txs {
                write_record(&mut replacement, tx)?;
            }
            journaled += txs.len();
        }
        drop(replacement);

        std::fs::rename(&replacement_path, &self.path)?;
        let sink = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = Some(JournalWriter::File(sink));

        info!(
            transactions = journaled,
            accounts = all.len(),
            "Regenerated local transaction journal"
        );
        Ok(())
    }

    /// Flushes the journal contents to disk and closes the file.
    /// Idempotent.
    pub(crate) fn close(&mut self) -> Result<(), JournalError> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }
}

fn write_record(writer: &mut impl Write, tx: &Transaction) -> Result<(), JournalError> {
    let payload = rmp_serde::to_vec(tx)?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_bigint::BigInt;

    fn tx(nonce: u64) -> Transaction {
        Transaction::new(nonce, None, BigInt::from(nonce), b"journal".as_slice())
    }

    fn journal_in(dir: &tempfile::TempDir) -> TxJournal {
        TxJournal::new(dir.path().join("transactions.msgp"))
    }

    #[test]
    fn insert_without_writer_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = journal_in(&dir);

        let err = journal.insert(&tx(0)).unwrap_err();
        assert!(matches!(err, JournalError::NoActiveJournal));
    }

    #[test]
    fn load_of_missing_file_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = journal_in(&dir);

        let mut seen = 0;
        journal
            .load(|_| {
                seen += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, 0);
    }

    #[test]
    fn rotate_then_insert_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = journal_in(&dir);

        journal.rotate(&HashMap::new()).unwrap();
        journal.insert(&tx(1)).unwrap();
        journal.insert(&tx(2)).unwrap();
        journal.close().unwrap();

        let mut loaded = Vec::new();
        journal
            .load(|tx| {
                loaded.push(tx.nonce());
                Ok(())
            })
            .unwrap();
        assert_eq!(loaded, vec![1, 2]);
    }

    #[test]
    fn rotate_writes_the_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = journal_in(&dir);

        let sender = Address([1u8; 20]);
        let mut all = HashMap::new();
        all.insert(sender, vec![Arc::new(tx(3)), Arc::new(tx(4))]);

        journal.rotate(&all).unwrap();
        journal.close().unwrap();

        let mut loaded = Vec::new();
        journal
            .load(|tx| {
                loaded.push(tx.nonce());
                Ok(())
            })
            .unwrap();
        assert_eq!(loaded, vec![3, 4]);
    }

    #[test]
    fn rotate_replaces_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = journal_in(&dir);

        journal.rotate(&HashMap::new()).unwrap();
        journal.insert(&tx(9)).unwrap();

        // A rotation with an empty snapshot wipes the stale entry.
        journal.rotate(&HashMap::new()).unwrap();
        journal.close().unwrap();

        let mut seen = 0;
        journal
            .load(|_| {
                seen += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, 0);
    }

    #[test]
    fn corrupt_tail_keeps_parsed_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transactions.msgp");
        let mut journal = TxJournal::new(&path);

        journal.rotate(&HashMap::new()).unwrap();
        journal.insert(&tx(1)).unwrap();
        journal.close().unwrap();

        // Append a truncated record: a length prefix with no payload.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&100u32.to_le_bytes()).unwrap();
        drop(file);

        let mut loaded = Vec::new();
        let result = journal.load(|tx| {
            loaded.push(tx.nonce());
            Ok(())
        });
        assert!(result.is_err());
        assert_eq!(loaded, vec![1]);
    }

    #[test]
    fn load_counts_rejected_transactions_as_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = journal_in(&dir);

        journal.rotate(&HashMap::new()).unwrap();
        journal.insert(&tx(1)).unwrap();
        journal.insert(&tx(2)).unwrap();
        journal.close().unwrap();

        // Rejecting entries must not abort the load.
        let mut accepted = Vec::new();
        journal
            .load(|tx| {
                if tx.nonce() == 1 {
                    Err(PoolError::NonceTooLow)
                } else {
                    accepted.push(tx.nonce());
                    Ok(())
                }
            })
            .unwrap();
        assert_eq!(accepted, vec![2]);
    }

    #[test]
    fn close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = journal_in(&dir);

        journal.rotate(&HashMap::new()).unwrap();
        journal.close().unwrap();
        journal.close().unwrap();
    }
}
