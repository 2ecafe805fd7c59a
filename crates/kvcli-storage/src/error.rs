//! Error types for the kvcli storage subsystem.

use std::path::PathBuf;

use thiserror::Error;

use crate::command::{KvOpType, NvmeStatus};

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error variants for device sessions and the transfer engines.
///
/// Every variant except the ones produced while parsing user input is
/// fatal to the running operation: the session is released and the run
/// ends in failure.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Wraps standard I/O errors not tied to a particular local file.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// A local source or destination file could not be opened, read or written.
    #[error("Local file error on {}: {source}", path.display())]
    LocalFile {
        /// The file being accessed.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The named device does not exist.
    #[error("Device not found: {device}")]
    DeviceNotFound {
        /// The device name that was requested.
        device: String,
    },

    /// Device-level error while opening the device or its I/O channel.
    #[error("Device error on {device}: {reason}")]
    DeviceError {
        /// The device identifier.
        device: String,
        /// Description of the error.
        reason: String,
    },

    /// The transfer buffer could not be allocated.
    #[error("Buffer allocation failed: {size} bytes aligned to {alignment}")]
    BufferAllocation {
        /// Requested buffer size in bytes.
        size: usize,
        /// Requested alignment in bytes.
        alignment: usize,
    },

    /// The transfer buffer cannot hold the smallest complete response.
    #[error("Buffer of {size} bytes is too small: at least {min} bytes are required")]
    BufferTooSmall {
        /// Configured buffer size in bytes.
        size: usize,
        /// Smallest usable size in bytes.
        min: usize,
    },

    /// A key or prefix violates the device key length limits.
    #[error("Invalid key: length {len} is outside {min}..={max}")]
    InvalidKey {
        /// Length of the rejected key.
        len: usize,
        /// Minimum accepted length.
        min: usize,
        /// Maximum accepted length.
        max: usize,
    },

    /// The driver refused the submission with a non-transient error.
    #[error("{op} submission rejected: {reason}")]
    SubmitFailed {
        /// The operation being submitted.
        op: KvOpType,
        /// Reason reported by the driver.
        reason: String,
    },

    /// The device completed the request with a failure status.
    #[error("KV {op} error: {status}")]
    DeviceFailure {
        /// The failed operation.
        op: KvOpType,
        /// NVMe completion status.
        status: NvmeStatus,
    },

    /// The device reported a status the operation does not know how to interpret.
    #[error("Unknown error: {op} completed with {status}")]
    UnknownStatus {
        /// The operation.
        op: KvOpType,
        /// NVMe completion status.
        status: NvmeStatus,
    },

    /// The local source file ended before the expected number of bytes was read.
    #[error("Short read on {}: no data at offset {offset} of {expected} bytes", path.display())]
    ShortRead {
        /// The source file.
        path: PathBuf,
        /// Offset at which the read came back empty.
        offset: u64,
        /// File length observed when the transfer started.
        expected: u64,
    },

    /// A list response could not be decoded without overrunning the buffer.
    #[error("Corrupt key listing: {reason}")]
    CorruptListing {
        /// Description of the decoding failure.
        reason: String,
    },

    /// A list continuation returned no key beyond its anchor.
    #[error("Key listing stalled at anchor {anchor:?} after {observed} of {total} keys")]
    ListingStalled {
        /// Anchor key used for the stalled request.
        anchor: String,
        /// Keys observed so far.
        observed: u64,
        /// Total reported by the device.
        total: u64,
    },

    /// An unrecognized select data format name.
    #[error("Invalid data format {0:?}: valid formats are csv, json, parquet")]
    InvalidFormat(String),
}

impl StorageError {
    /// Builds a [`StorageError::LocalFile`] for the given path.
    pub fn local_file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::LocalFile {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_result_alias() {
        let ok: StorageResult<i32> = Ok(42);
        assert!(ok.is_ok());

        let err: StorageResult<i32> = Err(StorageError::InvalidFormat("xml".to_string()));
        assert!(err.is_err());
    }

    #[test]
    fn test_io_error_from_std() {
        let std_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let storage_err: StorageError = std_err.into();
        assert!(matches!(storage_err, StorageError::IoError(_)));
    }

    #[test]
    fn test_local_file_mentions_path() {
        let err = StorageError::local_file(
            "/tmp/input.csv",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        let msg = format!("{}", err);
        assert!(msg.contains("/tmp/input.csv"));
        assert!(msg.contains("denied"));
    }

    #[test]
    fn test_device_error() {
        let err = StorageError::DeviceError {
            device: "Nvme1n1".to_string(),
            reason: "could not create I/O channel".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Nvme1n1"));
        assert!(msg.contains("could not create I/O channel"));
    }

    #[test]
    fn test_device_failure_shows_status() {
        let err = StorageError::DeviceFailure {
            op: KvOpType::Delete,
            status: NvmeStatus::KEY_NOT_FOUND,
        };
        assert_eq!(format!("{}", err), "KV delete error: sct=0x1 sc=0x87");
    }

    #[test]
    fn test_invalid_key() {
        let err = StorageError::InvalidKey {
            len: 17,
            min: 1,
            max: 16,
        };
        assert_eq!(format!("{}", err), "Invalid key: length 17 is outside 1..=16");
    }

    #[test]
    fn test_buffer_too_small() {
        let err = StorageError::BufferTooSmall { size: 8, min: 40 };
        assert_eq!(
            format!("{}", err),
            "Buffer of 8 bytes is too small: at least 40 bytes are required"
        );
    }

    #[test]
    fn test_short_read() {
        let err = StorageError::ShortRead {
            path: PathBuf::from("data.bin"),
            offset: 4096,
            expected: 8192,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("data.bin"));
        assert!(msg.contains("4096"));
    }
}
