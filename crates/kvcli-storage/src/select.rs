//! Two-phase select: run a query on the device, then download its result.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::command::{DataFormat, KvCommand, KvOpType, SelectFree, SelectOptions};
use crate::driver::KvDevice;
use crate::error::{StorageError, StorageResult};
use crate::key::Key;
use crate::session::DeviceSession;
use crate::transfer::{download, ChunkedDownload, TransferSummary};

/// A query against one stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectRequest {
    /// Key of the queried object.
    pub key: Key,
    /// Query text, passed to the device as is.
    pub query: String,
    /// Serialization of the stored object.
    pub input: DataFormat,
    /// Serialization of the result.
    pub output: DataFormat,
    /// CSV header flags.
    pub options: SelectOptions,
    /// Local file receiving the result.
    pub destination: PathBuf,
}

/// Progress of a select result download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryContinuation {
    /// Result identifier assigned by the device.
    pub result_id: u32,
    /// Local destination.
    pub destination: PathBuf,
    /// Result offset of the next chunk.
    pub offset: u64,
}

impl ChunkedDownload for QueryContinuation {
    const OP: KvOpType = KvOpType::RetrieveSelect;

    fn destination(&self) -> &Path {
        &self.destination
    }

    fn offset(&self) -> u64 {
        self.offset
    }

    fn command(&self, len: usize) -> KvCommand {
        KvCommand::RetrieveSelect {
            result_id: self.result_id,
            offset: self.offset,
            len,
            free: SelectFree::FreeIfFit,
        }
    }

    fn advance(self, by: u64) -> Self {
        Self {
            offset: self.offset.saturating_add(by),
            ..self
        }
    }
}

/// Outcome of a select.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectSummary {
    /// Result identifier the device assigned.
    pub result_id: u32,
    /// Result download.
    pub transfer: TransferSummary,
}

/// Runs `request.query` and writes the result to `request.destination`.
pub async fn select<Dev: KvDevice>(
    session: &mut DeviceSession<Dev>,
    request: &SelectRequest,
) -> StorageResult<SelectSummary> {
    let completion = session
        .submit(KvCommand::SendSelect {
            key: request.key.clone(),
            query: request.query.clone(),
            input: request.input,
            output: request.output,
            options: request.options,
        })
        .await?;
    if !completion.success {
        error!("KV send select error: {}", completion.status);
        return Err(StorageError::DeviceFailure {
            op: KvOpType::SendSelect,
            status: completion.status,
        });
    }

    let result_id = completion.result_id();
    debug!(
        "Select on {} ({} -> {}, options {:#04x}) produced result {}",
        request.key,
        request.input,
        request.output,
        request.options.bits(),
        result_id
    );

    let transfer = download(
        session,
        QueryContinuation {
            result_id,
            destination: request.destination.clone(),
            offset: 0,
        },
    )
    .await?;
    Ok(SelectSummary { result_id, transfer })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::NvmeStatus;
    use crate::emulator::{FaultPlan, MemoryDriver};

    fn request(dest: PathBuf) -> SelectRequest {
        SelectRequest {
            key: Key::new("sales.csv").unwrap(),
            query: "SELECT * FROM S3Object".to_string(),
            input: DataFormat::Csv,
            output: DataFormat::Json,
            options: SelectOptions {
                input_header: true,
                output_header: false,
            },
            destination: dest,
        }
    }

    #[tokio::test]
    async fn test_select_downloads_result_in_chunks() {
        let driver = MemoryDriver::new();
        let object: Vec<u8> = b"region,amount\n".iter().cycle().take(70).copied().collect();
        driver.insert(b"sales.csv", object.clone());
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("result.json");

        let mut session = DeviceSession::open(&driver, "mem0", 32).unwrap();
        let summary = select(&mut session, &request(dest.clone())).await.unwrap();
        session.release();

        assert_eq!(summary.transfer.chunks, 3);
        assert_eq!(summary.transfer.total_size, 70);
        assert_eq!(std::fs::read(&dest).unwrap(), object);
        assert_eq!(driver.results_outstanding(), 0);

        let probe = driver.probe();
        let first = &probe.submissions[0].command;
        assert!(matches!(
            first,
            KvCommand::SendSelect {
                input: DataFormat::Csv,
                output: DataFormat::Json,
                options,
                ..
            } if options.bits() == 0x01
        ));
        let reads: Vec<u64> = probe
            .submissions
            .iter()
            .filter_map(|s| match s.command {
                KvCommand::RetrieveSelect {
                    result_id,
                    offset,
                    free: SelectFree::FreeIfFit,
                    ..
                } if result_id == summary.result_id => Some(offset),
                _ => None,
            })
            .collect();
        assert_eq!(reads, vec![0, 32, 64]);
    }

    #[tokio::test]
    async fn test_select_missing_object() {
        let driver = MemoryDriver::new();
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("result.json");

        let mut session = DeviceSession::open(&driver, "mem0", 32).unwrap();
        let err = select(&mut session, &request(dest.clone())).await.unwrap_err();
        session.release();

        assert!(matches!(err, StorageError::DeviceFailure { op: KvOpType::SendSelect, .. }));
        assert!(!dest.exists());
        assert_eq!(driver.probe().submissions.len(), 1);
    }

    #[tokio::test]
    async fn test_result_read_failure() {
        let driver = MemoryDriver::new();
        driver.insert(b"sales.csv", vec![b'x'; 100]);
        driver.set_faults(FaultPlan::new().fail_nth(
            KvOpType::RetrieveSelect,
            2,
            NvmeStatus::INTERNAL_ERROR,
        ));
        let dir = tempfile::tempdir().unwrap();

        let mut session = DeviceSession::open(&driver, "mem0", 32).unwrap();
        let err = select(&mut session, &request(dir.path().join("r"))).await.unwrap_err();
        session.release();
        assert!(matches!(err, StorageError::DeviceFailure { op: KvOpType::RetrieveSelect, .. }));
    }
}
