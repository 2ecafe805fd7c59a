#![warn(missing_docs)]

//! kvcli storage subsystem: chunked key-value transfers over an NVMe KV device session
//!
//! This crate holds the core of the `kvcli` tool. A [`DeviceSession`] owns one
//! device handle, one I/O channel and one transfer buffer; the engines move
//! values, key listings and select results through that buffer one request at
//! a time, replaying requests the device refuses for lack of resources.

pub mod backpressure;
pub mod buffer;
pub mod command;
pub mod dispatch;
pub mod driver;
pub mod emulator;
pub mod error;
pub mod key;
pub mod keyops;
pub mod listing;
pub mod media;
pub mod select;
pub mod session;
pub mod transfer;

pub use backpressure::{BackpressureStats, PendingSubmission, Resubmitter};
pub use buffer::DmaBuffer;
pub use command::{
    DataFormat, KvCommand, KvCompletion, KvOpType, NvmeStatus, SelectFree, SelectOptions,
    DEFAULT_BUFFER_SIZE,
};
pub use dispatch::{run, KvOperation, OperationOutcome};
pub use driver::{IoChannel, KvDevice, KvDriver, SubmitError};
pub use emulator::{DeviceProbe, DirDriver, FaultPlan, MemoryDriver};
pub use error::{StorageError, StorageResult};
pub use key::{Key, MAX_KEY_LEN};
pub use keyops::KeyPresence;
pub use listing::{decode_key_list, encode_key_list, KeyBatch, ListSummary, MIN_BUFFER_SIZE};
pub use media::{DirMedia, KvMedia, MemMedia};
pub use select::{SelectRequest, SelectSummary};
pub use session::{DeviceSession, SessionStats};
pub use transfer::{RetrieveRequest, StoreRequest, TransferSummary};
