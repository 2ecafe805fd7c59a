//! Typed NVMe key-value commands and their completions.
//!
//! A [`KvCommand`] carries every argument of one device request except the
//! transfer buffer, which is lent separately for the lifetime of the
//! submission. Completions expose the NVMe status and command dword 0, which
//! the device uses as a side channel for totals and result identifiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::key::Key;

/// Default transfer buffer size (16 MiB).
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Store option bit: append to the existing value instead of replacing it.
pub const STORE_OPTION_APPEND: u8 = 0x01;

/// Select option bit: the input object carries a CSV header row.
pub const SELECT_OPTION_INPUT_HEADER: u8 = 0x01;

/// Select option bit: emit a CSV header row in the result.
pub const SELECT_OPTION_OUTPUT_HEADER: u8 = 0x02;

/// Kind of device request, used for logging, statistics and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KvOpType {
    /// Write (or append) a value chunk.
    Store,
    /// Read a value chunk.
    Retrieve,
    /// Enumerate keys by prefix.
    List,
    /// Probe for a key.
    Exists,
    /// Remove a key.
    Delete,
    /// Submit a query against a stored value.
    SendSelect,
    /// Read a chunk of a query result.
    RetrieveSelect,
    /// Reset every zone of a zoned device.
    ZoneReset,
}

impl fmt::Display for KvOpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KvOpType::Store => "store",
            KvOpType::Retrieve => "retrieve",
            KvOpType::List => "list",
            KvOpType::Exists => "exists",
            KvOpType::Delete => "delete",
            KvOpType::SendSelect => "send select",
            KvOpType::RetrieveSelect => "retrieve select",
            KvOpType::ZoneReset => "zone reset",
        };
        f.write_str(name)
    }
}

/// Serialization format of a select input or output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    /// Comma separated values; header presence is set by [`SelectOptions`].
    Csv,
    /// JSON records.
    Json,
    /// Columnar Parquet.
    Parquet,
}

impl DataFormat {
    /// Wire code of the format.
    pub fn code(self) -> u8 {
        match self {
            DataFormat::Csv => 0,
            DataFormat::Json => 1,
            DataFormat::Parquet => 2,
        }
    }

    /// Lowercase name as accepted on the command line.
    pub fn name(self) -> &'static str {
        match self {
            DataFormat::Csv => "csv",
            DataFormat::Json => "json",
            DataFormat::Parquet => "parquet",
        }
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DataFormat {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "csv" => Ok(DataFormat::Csv),
            "json" => Ok(DataFormat::Json),
            "parquet" => Ok(DataFormat::Parquet),
            other => Err(StorageError::InvalidFormat(other.to_string())),
        }
    }
}

/// Header flags of a select request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SelectOptions {
    /// Treat the first CSV row of the input as a header.
    pub input_header: bool,
    /// Write a CSV header row to the output.
    pub output_header: bool,
}

impl SelectOptions {
    /// Option byte sent with the select command.
    pub fn bits(self) -> u8 {
        let mut bits = 0;
        if self.input_header {
            bits |= SELECT_OPTION_INPUT_HEADER;
        }
        if self.output_header {
            bits |= SELECT_OPTION_OUTPUT_HEADER;
        }
        bits
    }
}

/// Hint telling the device what to do with a select result after a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SelectFree {
    /// Keep the result until it is explicitly freed.
    Keep,
    /// Free the result once a read window covers its end.
    FreeIfFit,
}

/// One device request. Buffer-carrying commands name the length of the
/// buffer window they use; the buffer itself is lent at submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KvCommand {
    /// Write `len` bytes from the buffer under `key`.
    Store {
        /// Target key.
        key: Key,
        /// Bytes of the buffer to write.
        len: usize,
        /// Append instead of replacing.
        append: bool,
    },
    /// Read up to `len` bytes of the value at `offset` into the buffer.
    Retrieve {
        /// Source key.
        key: Key,
        /// Byte offset into the value.
        offset: u64,
        /// Buffer window size.
        len: usize,
    },
    /// Fill the buffer with keys starting at `prefix`.
    List {
        /// Prefix, or the anchor key of a continuation.
        prefix: Key,
        /// Buffer window size.
        len: usize,
    },
    /// Check whether `key` exists.
    Exists {
        /// Key to probe.
        key: Key,
    },
    /// Delete `key`.
    Delete {
        /// Key to remove.
        key: Key,
    },
    /// Run `query` against the value of `key`.
    SendSelect {
        /// Key of the queried object.
        key: Key,
        /// Query text.
        query: String,
        /// Input serialization.
        input: DataFormat,
        /// Output serialization.
        output: DataFormat,
        /// Header flags.
        options: SelectOptions,
    },
    /// Read up to `len` bytes of a select result at `offset` into the buffer.
    RetrieveSelect {
        /// Result identifier returned by [`KvCommand::SendSelect`].
        result_id: u32,
        /// Byte offset into the result.
        offset: u64,
        /// Buffer window size.
        len: usize,
        /// Free hint.
        free: SelectFree,
    },
    /// Reset all zones of a zoned device.
    ZoneReset,
}

impl KvCommand {
    /// Operation kind of this command.
    pub fn op(&self) -> KvOpType {
        match self {
            KvCommand::Store { .. } => KvOpType::Store,
            KvCommand::Retrieve { .. } => KvOpType::Retrieve,
            KvCommand::List { .. } => KvOpType::List,
            KvCommand::Exists { .. } => KvOpType::Exists,
            KvCommand::Delete { .. } => KvOpType::Delete,
            KvCommand::SendSelect { .. } => KvOpType::SendSelect,
            KvCommand::RetrieveSelect { .. } => KvOpType::RetrieveSelect,
            KvCommand::ZoneReset => KvOpType::ZoneReset,
        }
    }

    /// Option byte of a store command.
    pub fn store_options(&self) -> u8 {
        match self {
            KvCommand::Store { append: true, .. } => STORE_OPTION_APPEND,
            _ => 0,
        }
    }
}

/// NVMe completion status: status code type and status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NvmeStatus {
    /// Status code type.
    pub sct: u8,
    /// Status code.
    pub sc: u8,
}

impl NvmeStatus {
    /// Generic command status: successful completion.
    pub const SUCCESS: NvmeStatus = NvmeStatus { sct: 0x0, sc: 0x00 };

    /// Generic command status: invalid field in command.
    pub const INVALID_FIELD: NvmeStatus = NvmeStatus { sct: 0x0, sc: 0x02 };

    /// Generic command status: internal error.
    pub const INTERNAL_ERROR: NvmeStatus = NvmeStatus { sct: 0x0, sc: 0x06 };

    /// Command specific status: the KV key does not exist.
    pub const KEY_NOT_FOUND: NvmeStatus = NvmeStatus { sct: 0x1, sc: 0x87 };

    /// Returns true for a successful completion status.
    pub fn is_success(self) -> bool {
        self.sc == 0x00
    }
}

impl fmt::Display for NvmeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sct={:#x} sc={:#x}", self.sct, self.sc)
    }
}

/// Completion of a device request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvCompletion {
    /// Device-level success flag.
    pub success: bool,
    /// Fine-grained completion status.
    pub status: NvmeStatus,
    /// Command dword 0: total value size, total matching keys or result id.
    pub cdw0: u32,
}

impl KvCompletion {
    /// Successful completion carrying `cdw0`.
    pub fn ok(cdw0: u32) -> Self {
        Self {
            success: true,
            status: NvmeStatus::SUCCESS,
            cdw0,
        }
    }

    /// Failed completion with the given status.
    pub fn failed(status: NvmeStatus) -> Self {
        Self {
            success: false,
            status,
            cdw0: 0,
        }
    }

    /// Total size of the value or select result being read.
    pub fn total_size(&self) -> u64 {
        u64::from(self.cdw0)
    }

    /// Total number of keys matching a list prefix.
    pub fn total_keys(&self) -> u64 {
        u64::from(self.cdw0)
    }

    /// Result identifier assigned by a send select.
    pub fn result_id(&self) -> u32 {
        self.cdw0
    }

    /// True when the device reported that the key does not exist.
    pub fn is_key_not_found(&self) -> bool {
        !self.success && self.status.sc == NvmeStatus::KEY_NOT_FOUND.sc
    }
}
