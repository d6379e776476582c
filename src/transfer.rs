//! SFTP Transfer Manager: per-session ordered chunk ingest, pause/resume,
//! cancellation, and completion statistics (spec §4.4).
//!
//! Grounded on the teacher's transaction machinery (`session/transaction.rs`):
//! a per-operation status enum with forward execution and a terminal
//! commit/rollback outcome. The transfer state machine reuses that same
//! "ordered steps, explicit terminal states, a result struct" shape, applied
//! to chunk indices instead of command steps.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::TransferError;
use crate::ids::{SessionId, TransferId};
use crate::rate_limiter::RateLimiter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Upload,
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Pending,
    Active,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

pub struct TransferParams {
    pub session_id: SessionId,
    pub direction: TransferDirection,
    pub remote_path: String,
    pub filename: String,
    pub total_bytes: u64,
}

struct TransferRecord {
    session_id: SessionId,
    direction: TransferDirection,
    remote_path: String,
    filename: String,
    total_bytes: u64,
    bytes_transferred: u64,
    next_chunk_index: u64,
    status: TransferStatus,
    started_at: Instant,
    last_chunk_at: Instant,
    rate_limiter: RateLimiter,
}

/// Snapshot used to render `sftp-progress` frames (spec §6) without
/// exposing the internal record.
#[derive(Debug, Clone)]
pub struct TransferInfo {
    pub session_id: SessionId,
    pub direction: TransferDirection,
    pub remote_path: String,
    pub filename: String,
    pub total_bytes: u64,
    pub bytes_transferred: u64,
    pub status: TransferStatus,
}

#[derive(Debug, Clone)]
pub struct TransferCompletionReport {
    pub transfer_id: TransferId,
    pub bytes_transferred: u64,
    pub duration: Duration,
    pub average_bytes_per_sec: f64,
}

/// Tracks active SFTP transfers across all sessions, enforcing a
/// per-session concurrency cap.
pub struct TransferManager {
    max_concurrent_per_session: usize,
    chunk_rate_limit_bytes_per_sec: u64,
    transfers: Mutex<HashMap<TransferId, TransferRecord>>,
}

impl TransferManager {
    pub fn new(max_concurrent_per_session: usize, chunk_rate_limit_bytes_per_sec: u64) -> Self {
        Self {
            max_concurrent_per_session,
            chunk_rate_limit_bytes_per_sec,
            transfers: Mutex::new(HashMap::new()),
        }
    }

    fn active_count_for_session(transfers: &HashMap<TransferId, TransferRecord>, session_id: SessionId) -> usize {
        transfers
            .values()
            .filter(|t| t.session_id == session_id && !matches!(t.status, TransferStatus::Completed | TransferStatus::Cancelled | TransferStatus::Failed))
            .count()
    }

    pub fn start_transfer(&self, params: TransferParams) -> Result<TransferId, TransferError> {
        let mut transfers = self.transfers.lock().expect("transfer manager lock poisoned");
        if Self::active_count_for_session(&transfers, params.session_id) >= self.max_concurrent_per_session {
            return Err(TransferError::MaxTransfers(self.max_concurrent_per_session));
        }
        let id = TransferId::new();
        let now = Instant::now();
        transfers.insert(
            id,
            TransferRecord {
                session_id: params.session_id,
                direction: params.direction,
                remote_path: params.remote_path,
                filename: params.filename,
                total_bytes: params.total_bytes,
                bytes_transferred: 0,
                next_chunk_index: 0,
                status: TransferStatus::Pending,
                started_at: now,
                last_chunk_at: now,
                rate_limiter: RateLimiter::new(self.chunk_rate_limit_bytes_per_sec),
            },
        );
        Ok(id)
    }

    pub fn activate_transfer(&self, id: TransferId) -> Result<(), TransferError> {
        let mut transfers = self.transfers.lock().expect("transfer manager lock poisoned");
        let record = transfers.get_mut(&id).ok_or(TransferError::NotFound)?;
        if record.status != TransferStatus::Pending {
            return Err(TransferError::InvalidState);
        }
        record.status = TransferStatus::Active;
        Ok(())
    }

    /// Requires `active` and `chunkIndex == nextChunkIndex`; advances the
    /// counters and feeds the per-transfer rate limiter (spec §4.4).
    pub fn update_progress(&self, id: TransferId, chunk_index: u64, bytes: u64) -> Result<(), TransferError> {
        let mut transfers = self.transfers.lock().expect("transfer manager lock poisoned");
        let record = transfers.get_mut(&id).ok_or(TransferError::NotFound)?;
        if record.status != TransferStatus::Active {
            return Err(TransferError::InvalidState);
        }
        if chunk_index != record.next_chunk_index {
            return Err(TransferError::ChunkMismatch { expected: record.next_chunk_index, got: chunk_index });
        }
        record.bytes_transferred += bytes;
        record.next_chunk_index += 1;
        record.last_chunk_at = Instant::now();
        record.rate_limiter.check_and_update(bytes);
        Ok(())
    }

    pub fn pause_transfer(&self, id: TransferId) -> Result<(), TransferError> {
        self.transition(id, TransferStatus::Active, TransferStatus::Paused)
    }

    pub fn resume_transfer(&self, id: TransferId) -> Result<(), TransferError> {
        self.transition(id, TransferStatus::Paused, TransferStatus::Active)
    }

    fn transition(&self, id: TransferId, from: TransferStatus, to: TransferStatus) -> Result<(), TransferError> {
        let mut transfers = self.transfers.lock().expect("transfer manager lock poisoned");
        let record = transfers.get_mut(&id).ok_or(TransferError::NotFound)?;
        if record.status != from {
            return Err(TransferError::InvalidState);
        }
        record.status = to;
        Ok(())
    }

    /// Computes the completion report and removes the record — the only
    /// path that produces one (spec §4.4 invariant).
    pub fn complete_transfer(&self, id: TransferId) -> Result<TransferCompletionReport, TransferError> {
        let mut transfers = self.transfers.lock().expect("transfer manager lock poisoned");
        let mut record = transfers.remove(&id).ok_or(TransferError::NotFound)?;
        record.status = TransferStatus::Completed;
        let duration = record.started_at.elapsed();
        let average = if duration.as_secs_f64() > 0.0 {
            record.bytes_transferred as f64 / duration.as_secs_f64()
        } else {
            record.bytes_transferred as f64
        };
        Ok(TransferCompletionReport {
            transfer_id: id,
            bytes_transferred: record.bytes_transferred,
            duration,
            average_bytes_per_sec: average,
        })
    }

    /// Idempotent: cancelling twice is `Ok` in both calls.
    pub fn cancel_transfer(&self, id: TransferId) {
        let mut transfers = self.transfers.lock().expect("transfer manager lock poisoned");
        transfers.remove(&id);
    }

    pub fn fail_transfer(&self, id: TransferId, _reason: &str) {
        let mut transfers = self.transfers.lock().expect("transfer manager lock poisoned");
        transfers.remove(&id);
    }

    /// Returns `TransferNotFound` for both "missing" and "wrong session" to
    /// avoid enumeration (spec §4.4).
    pub fn verify_ownership(&self, id: TransferId, session_id: SessionId) -> Result<(), TransferError> {
        let transfers = self.transfers.lock().expect("transfer manager lock poisoned");
        match transfers.get(&id) {
            Some(record) if record.session_id == session_id => Ok(()),
            _ => Err(TransferError::NotFound),
        }
    }

    pub fn info(&self, id: TransferId) -> Option<TransferInfo> {
        let transfers = self.transfers.lock().expect("transfer manager lock poisoned");
        transfers.get(&id).map(|r| TransferInfo {
            session_id: r.session_id,
            direction: r.direction,
            remote_path: r.remote_path.clone(),
            filename: r.filename.clone(),
            total_bytes: r.total_bytes,
            bytes_transferred: r.bytes_transferred,
            status: r.status,
        })
    }

    pub fn cancel_all_for_session(&self, session_id: SessionId) {
        let mut transfers = self.transfers.lock().expect("transfer manager lock poisoned");
        transfers.retain(|_, record| record.session_id != session_id);
    }

    #[cfg(test)]
    fn status(&self, id: TransferId) -> Option<TransferStatus> {
        self.transfers.lock().expect("lock").get(&id).map(|r| r.status)
    }

    #[cfg(test)]
    fn next_chunk_index(&self, id: TransferId) -> Option<u64> {
        self.transfers.lock().expect("lock").get(&id).map(|r| r.next_chunk_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(session_id: SessionId) -> TransferParams {
        TransferParams {
            session_id,
            direction: TransferDirection::Upload,
            remote_path: "/tmp/f".into(),
            filename: "f".into(),
            total_bytes: 300,
        }
    }

    #[test]
    fn update_progress_advances_next_chunk_index() {
        let mgr = TransferManager::new(4, 0);
        let session = SessionId::new();
        let id = mgr.start_transfer(params(session)).expect("start");
        mgr.activate_transfer(id).expect("activate");
        mgr.update_progress(id, 0, 100).expect("chunk 0");
        assert_eq!(mgr.next_chunk_index(id), Some(1));
    }

    #[test]
    fn out_of_order_chunk_is_rejected() {
        let mgr = TransferManager::new(4, 0);
        let session = SessionId::new();
        let id = mgr.start_transfer(params(session)).expect("start");
        mgr.activate_transfer(id).expect("activate");
        mgr.update_progress(id, 0, 100).expect("chunk 0");
        mgr.update_progress(id, 1, 100).expect("chunk 1");
        let err = mgr.update_progress(id, 3, 100).expect_err("gap should fail");
        assert!(matches!(err, TransferError::ChunkMismatch { expected: 2, got: 3 }));
        assert_eq!(mgr.status(id), Some(TransferStatus::Active));
        assert_eq!(mgr.next_chunk_index(id), Some(2));
    }

    #[test]
    fn max_transfers_enforced_per_session() {
        let mgr = TransferManager::new(1, 0);
        let session = SessionId::new();
        mgr.start_transfer(params(session)).expect("first");
        let err = mgr.start_transfer(params(session)).expect_err("should be capped");
        assert!(matches!(err, TransferError::MaxTransfers(1)));
    }

    #[test]
    fn cancel_is_idempotent() {
        let mgr = TransferManager::new(4, 0);
        let id = mgr.start_transfer(params(SessionId::new())).expect("start");
        mgr.cancel_transfer(id);
        mgr.cancel_transfer(id);
    }

    #[test]
    fn verify_ownership_hides_wrong_session_as_not_found() {
        let mgr = TransferManager::new(4, 0);
        let owner = SessionId::new();
        let stranger = SessionId::new();
        let id = mgr.start_transfer(params(owner)).expect("start");
        assert!(mgr.verify_ownership(id, owner).is_ok());
        let err = mgr.verify_ownership(id, stranger).expect_err("should be hidden");
        assert!(matches!(err, TransferError::NotFound));
    }

    #[test]
    fn info_reflects_progress() {
        let mgr = TransferManager::new(4, 0);
        let session = SessionId::new();
        let id = mgr.start_transfer(params(session)).expect("start");
        mgr.activate_transfer(id).expect("activate");
        mgr.update_progress(id, 0, 100).expect("chunk 0");
        let info = mgr.info(id).expect("info");
        assert_eq!(info.bytes_transferred, 100);
        assert_eq!(info.filename, "f");
        assert_eq!(info.status, TransferStatus::Active);
    }

    #[test]
    fn complete_transfer_removes_record_and_reports_stats() {
        let mgr = TransferManager::new(4, 0);
        let id = mgr.start_transfer(params(SessionId::new())).expect("start");
        mgr.activate_transfer(id).expect("activate");
        mgr.update_progress(id, 0, 300).expect("chunk");
        let report = mgr.complete_transfer(id).expect("complete");
        assert_eq!(report.bytes_transferred, 300);
        assert!(mgr.verify_ownership(id, SessionId::new()).is_err());
    }
}
