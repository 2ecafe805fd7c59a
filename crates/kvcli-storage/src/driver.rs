//! Driver boundary for NVMe key-value devices.
//!
//! This module defines the traits the core engines use to talk to a block
//! device driver. A driver opens devices ([`KvDriver`]), a device hands out
//! I/O channels ([`KvDevice`]), and a channel accepts one [`KvCommand`] at a
//! time together with the session's transfer buffer ([`IoChannel`]).
//!
//! Submission is modelled as a single future: it resolves to
//! `Err(SubmitError::NoResources)` straight away when the device cannot take
//! the request, or to the request's [`KvCompletion`] once the device is done.

use std::future::Future;

use thiserror::Error;

use crate::buffer::DmaBuffer;
use crate::command::{KvCommand, KvCompletion};
use crate::error::StorageResult;

/// Immediate submission failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// The device is temporarily out of request resources. The same request
    /// must be submitted again after [`IoChannel::io_wait`] resolves.
    #[error("device temporarily out of resources")]
    NoResources,
    /// The driver refused the request.
    #[error("{0}")]
    Rejected(String),
}

/// A block device driver able to open key-value devices by name.
pub trait KvDriver: Send + Sync {
    /// Device handle type.
    type Device: KvDevice;

    /// Opens the named device for reading and writing.
    fn open(&self, name: &str) -> StorageResult<Self::Device>;
}

/// An open device handle.
pub trait KvDevice: Send {
    /// I/O channel type.
    type Channel: IoChannel;

    /// Device name.
    fn name(&self) -> &str;

    /// Required alignment of transfer buffers in bytes.
    fn buf_align(&self) -> usize;

    /// True when the device uses a zoned layout and must be reset before use.
    fn is_zoned(&self) -> bool;

    /// Creates the I/O channel used to submit requests.
    fn io_channel(&mut self) -> StorageResult<Self::Channel>;

    /// Closes the device.
    fn close(self);
}

/// A per-session I/O channel.
pub trait IoChannel: Send {
    /// Submits `command`, lending `buf` until the returned future resolves.
    fn submit(
        &mut self,
        command: &KvCommand,
        buf: &mut DmaBuffer,
    ) -> impl Future<Output = Result<KvCompletion, SubmitError>> + Send;

    /// Resolves when the device signals that it can accept a request again.
    fn io_wait(&mut self) -> impl Future<Output = ()> + Send;

    /// Returns the channel to the driver.
    fn put(self);
}
