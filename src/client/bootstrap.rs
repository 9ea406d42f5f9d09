//! Flexible-sync bootstrap assembly.
//!
//! A bootstrap is a multi-message DOWNLOAD sequence materializing a query
//! version. Batches are buffered here and integrated in one transaction
//! when the terminal batch arrives.

use thiserror::Error;

use crate::core::{DownloadBatchState, QueryVersion, RemoteChangeset, SyncProgress};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BootstrapError {
    #[error("empty DOWNLOAD message that was not the last in batch")]
    EmptyMoreToCome,
    #[error("bootstrap exceeds buffer limit: {got_bytes} > {max_bytes} bytes")]
    Overflow { max_bytes: usize, got_bytes: usize },
}

/// A fully assembled bootstrap, ready for atomic integration.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingBootstrap {
    pub query_version: QueryVersion,
    /// Progress of the terminal batch; earlier batches only contribute
    /// changesets.
    pub progress: SyncProgress,
    pub downloadable_bytes: u64,
    pub changesets: Vec<RemoteChangeset>,
}

/// Outcome of feeding one DOWNLOAD message into the buffer.
#[derive(Debug, PartialEq)]
pub enum BootstrapIngest {
    /// Buffered; more batches expected.
    Buffered { batches: usize, bytes: usize },
    /// Terminal batch arrived.
    Complete(PendingBootstrap),
}

#[derive(Debug)]
struct ActiveBootstrap {
    query_version: QueryVersion,
    changesets: Vec<RemoteChangeset>,
    batches: usize,
    bytes: usize,
}

/// Side buffer assembling one bootstrap at a time.
#[derive(Debug)]
pub struct BootstrapBuffer {
    max_bytes: usize,
    active: Option<ActiveBootstrap>,
}

impl BootstrapBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            active: None,
        }
    }

    pub fn in_progress(&self) -> bool {
        self.active.is_some()
    }

    pub fn active_query_version(&self) -> Option<QueryVersion> {
        self.active.as_ref().map(|active| active.query_version)
    }

    pub fn clear(&mut self) {
        self.active = None;
    }

    /// Feed one bootstrap DOWNLOAD message.
    ///
    /// A batch for a different query version than the one in progress
    /// discards the stale bootstrap; the server has superseded it.
    pub fn ingest(
        &mut self,
        query_version: QueryVersion,
        batch_state: DownloadBatchState,
        progress: &SyncProgress,
        downloadable_bytes: u64,
        changesets: Vec<RemoteChangeset>,
    ) -> Result<BootstrapIngest, BootstrapError> {
        debug_assert_ne!(batch_state, DownloadBatchState::SteadyState);

        if batch_state == DownloadBatchState::MoreToCome && changesets.is_empty() {
            return Err(BootstrapError::EmptyMoreToCome);
        }

        if self
            .active
            .as_ref()
            .is_some_and(|active| active.query_version != query_version)
        {
            tracing::debug!(
                target: "sync::session",
                stale = self.active.as_ref().map(|a| a.query_version),
                new = query_version,
                "discarding superseded bootstrap"
            );
            self.active = None;
        }

        let active = self.active.get_or_insert_with(|| ActiveBootstrap {
            query_version,
            changesets: Vec::new(),
            batches: 0,
            bytes: 0,
        });

        active.batches += 1;
        active.bytes += changesets
            .iter()
            .map(|changeset| changeset.data.len())
            .sum::<usize>();
        active.changesets.extend(changesets);

        if active.bytes > self.max_bytes {
            let got_bytes = active.bytes;
            self.active = None;
            return Err(BootstrapError::Overflow {
                max_bytes: self.max_bytes,
                got_bytes,
            });
        }

        match batch_state {
            DownloadBatchState::MoreToCome => Ok(BootstrapIngest::Buffered {
                batches: active.batches,
                bytes: active.bytes,
            }),
            DownloadBatchState::LastInBatch | DownloadBatchState::SteadyState => {
                let active = self.active.take().expect("active bootstrap");
                Ok(BootstrapIngest::Complete(PendingBootstrap {
                    query_version: active.query_version,
                    progress: *progress,
                    downloadable_bytes,
                    changesets: active.changesets,
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn changeset(version: u64, payload: &'static [u8]) -> RemoteChangeset {
        RemoteChangeset {
            remote_version: version,
            last_integrated_local_version: 0,
            origin_file_ident: 2,
            origin_timestamp: 0,
            original_size: payload.len() as u64,
            data: Bytes::from_static(payload),
        }
    }

    #[test]
    fn single_batch_completes_immediately() {
        let mut buffer = BootstrapBuffer::new(1024);
        let result = buffer
            .ingest(
                1,
                DownloadBatchState::LastInBatch,
                &SyncProgress::default(),
                10,
                vec![changeset(5, b"a")],
            )
            .unwrap();
        let BootstrapIngest::Complete(bootstrap) = result else {
            panic!("expected completion");
        };
        assert_eq!(bootstrap.query_version, 1);
        assert_eq!(bootstrap.changesets.len(), 1);
        assert!(!buffer.in_progress());
    }

    #[test]
    fn batches_accumulate_until_terminal() {
        let mut buffer = BootstrapBuffer::new(1024);
        let first = buffer
            .ingest(
                2,
                DownloadBatchState::MoreToCome,
                &SyncProgress::default(),
                0,
                vec![changeset(5, b"aa"), changeset(6, b"bb")],
            )
            .unwrap();
        assert_eq!(
            first,
            BootstrapIngest::Buffered {
                batches: 1,
                bytes: 4
            }
        );
        assert!(buffer.in_progress());

        let done = buffer
            .ingest(
                2,
                DownloadBatchState::LastInBatch,
                &SyncProgress::default(),
                0,
                vec![changeset(6, b"cc")],
            )
            .unwrap();
        let BootstrapIngest::Complete(bootstrap) = done else {
            panic!("expected completion");
        };
        assert_eq!(bootstrap.changesets.len(), 3);
    }

    #[test]
    fn empty_more_to_come_rejected() {
        let mut buffer = BootstrapBuffer::new(1024);
        assert_eq!(
            buffer.ingest(
                1,
                DownloadBatchState::MoreToCome,
                &SyncProgress::default(),
                0,
                vec![],
            ),
            Err(BootstrapError::EmptyMoreToCome)
        );
    }

    #[test]
    fn empty_terminal_batch_is_fine() {
        let mut buffer = BootstrapBuffer::new(1024);
        let result = buffer
            .ingest(
                3,
                DownloadBatchState::LastInBatch,
                &SyncProgress::default(),
                0,
                vec![],
            )
            .unwrap();
        assert!(matches!(result, BootstrapIngest::Complete(b) if b.changesets.is_empty()));
    }

    #[test]
    fn newer_query_version_supersedes() {
        let mut buffer = BootstrapBuffer::new(1024);
        buffer
            .ingest(
                1,
                DownloadBatchState::MoreToCome,
                &SyncProgress::default(),
                0,
                vec![changeset(5, b"old")],
            )
            .unwrap();
        let done = buffer
            .ingest(
                2,
                DownloadBatchState::LastInBatch,
                &SyncProgress::default(),
                0,
                vec![changeset(9, b"new")],
            )
            .unwrap();
        let BootstrapIngest::Complete(bootstrap) = done else {
            panic!("expected completion");
        };
        assert_eq!(bootstrap.query_version, 2);
        assert_eq!(bootstrap.changesets.len(), 1);
    }

    #[test]
    fn overflow_drops_bootstrap() {
        let mut buffer = BootstrapBuffer::new(3);
        let result = buffer.ingest(
            1,
            DownloadBatchState::MoreToCome,
            &SyncProgress::default(),
            0,
            vec![changeset(5, b"toolarge")],
        );
        assert!(matches!(result, Err(BootstrapError::Overflow { .. })));
        assert!(!buffer.in_progress());
    }
}
