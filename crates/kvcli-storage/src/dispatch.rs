//! Runs one operation inside one device session.

use std::io::Write;

use serde::Serialize;
use tracing::info;

use crate::driver::{KvDevice, KvDriver};
use crate::error::StorageResult;
use crate::key::Key;
use crate::keyops::{self, KeyPresence};
use crate::listing::{self, ListSummary};
use crate::select::{self, SelectRequest, SelectSummary};
use crate::session::DeviceSession;
use crate::transfer::{self, RetrieveRequest, StoreRequest, TransferSummary};

/// A validated user operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvOperation {
    /// Upload a local file.
    Store(StoreRequest),
    /// Download a value.
    Retrieve(RetrieveRequest),
    /// Print every key starting with the prefix.
    List {
        /// Key prefix, possibly empty.
        prefix: Key,
    },
    /// Report whether a key exists.
    Exists {
        /// Key to check.
        key: Key,
    },
    /// Delete a key.
    Delete {
        /// Key to delete.
        key: Key,
    },
    /// Run a query and download its result.
    Select(SelectRequest),
}

impl KvOperation {
    /// Command name as typed on the command line.
    pub fn name(&self) -> &'static str {
        match self {
            KvOperation::Store(_) => "store",
            KvOperation::Retrieve(_) => "retrieve",
            KvOperation::List { .. } => "list",
            KvOperation::Exists { .. } => "exists",
            KvOperation::Delete { .. } => "delete",
            KvOperation::Select(_) => "select",
        }
    }
}

/// Result of a successful operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OperationOutcome {
    /// Value written.
    Stored(TransferSummary),
    /// Value downloaded.
    Retrieved(TransferSummary),
    /// Keys printed.
    Listed(ListSummary),
    /// Existence answer.
    Exists(KeyPresence),
    /// Key deleted.
    Deleted,
    /// Query result downloaded.
    Selected(SelectSummary),
}

/// Opens `device`, runs `operation` and releases the session.
///
/// Zoned devices are reset before the operation. Text output (`list`
/// lines) goes to `out`. The session is released exactly once whether the
/// operation succeeds or fails.
pub async fn run<D, W>(
    driver: &D,
    device: &str,
    buffer_size: usize,
    operation: KvOperation,
    out: &mut W,
) -> StorageResult<OperationOutcome>
where
    D: KvDriver,
    W: Write,
{
    let mut session = DeviceSession::open(driver, device, buffer_size)?;
    let name = operation.name();
    let result = execute(&mut session, operation, out).await;
    let stats = session.release();
    info!(
        "{} on {} finished (ok={}): {} submissions, {} requeues, {} device failures, \
         {} bytes sent, {} bytes received",
        name,
        device,
        result.is_ok(),
        stats.submissions,
        stats.requeues,
        stats.device_failures,
        stats.bytes_sent,
        stats.bytes_received
    );
    result
}

async fn execute<Dev, W>(
    session: &mut DeviceSession<Dev>,
    operation: KvOperation,
    out: &mut W,
) -> StorageResult<OperationOutcome>
where
    Dev: KvDevice,
    W: Write,
{
    session.prepare().await?;
    let outcome = match operation {
        KvOperation::Store(request) => {
            OperationOutcome::Stored(transfer::store(session, &request).await?)
        }
        KvOperation::Retrieve(request) => {
            OperationOutcome::Retrieved(transfer::retrieve(session, &request).await?)
        }
        KvOperation::List { prefix } => {
            OperationOutcome::Listed(listing::list(session, prefix, out).await?)
        }
        KvOperation::Exists { key } => {
            OperationOutcome::Exists(keyops::exists(session, &key).await?)
        }
        KvOperation::Delete { key } => {
            keyops::delete(session, &key).await?;
            OperationOutcome::Deleted
        }
        KvOperation::Select(request) => {
            OperationOutcome::Selected(select::select(session, &request).await?)
        }
    };
    out.flush()?;
    Ok(outcome)
}
