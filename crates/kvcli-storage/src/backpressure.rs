//! Backpressure handling for device submissions.
//!
//! When the device reports that it is temporarily out of request resources,
//! the request is parked as a [`PendingSubmission`] and re-submitted verbatim
//! (same command, same buffer) once the channel signals capacity. Any other
//! submission error is fatal to the running operation.

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::buffer::DmaBuffer;
use crate::command::{KvCommand, KvCompletion, KvOpType};
use crate::driver::{IoChannel, SubmitError};
use crate::error::{StorageError, StorageResult};

/// A request the device could not accept yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSubmission {
    /// The exact command to re-submit.
    pub command: KvCommand,
    /// Address of the buffer lent with the command.
    pub buf_addr: usize,
    /// Number of times the device has refused it so far.
    pub requeues: u32,
}

impl PendingSubmission {
    fn new(command: KvCommand, buf: &DmaBuffer) -> Self {
        Self {
            command,
            buf_addr: buf.addr(),
            requeues: 0,
        }
    }

    /// Operation kind of the parked command.
    pub fn op(&self) -> KvOpType {
        self.command.op()
    }
}

/// Counters kept by the [`Resubmitter`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackpressureStats {
    /// Submissions attempted, including re-submissions.
    pub attempts: u64,
    /// Times a submission was parked for lack of resources.
    pub requeues: u64,
    /// Submissions rejected with a non-transient error.
    pub rejections: u64,
}

/// Submits commands, parking and replaying them while the device is out of
/// resources.
#[derive(Debug, Default)]
pub struct Resubmitter {
    stats: BackpressureStats,
}

impl Resubmitter {
    /// Creates a resubmitter with zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Submits `command` on `channel` and waits for its completion.
    ///
    /// A `NoResources` refusal parks the command and waits for the channel's
    /// capacity signal before replaying the parked command unchanged. A
    /// `Rejected` refusal is returned as [`StorageError::SubmitFailed`].
    pub async fn submit<C: IoChannel>(
        &mut self,
        channel: &mut C,
        buf: &mut DmaBuffer,
        command: KvCommand,
    ) -> StorageResult<KvCompletion> {
        let mut pending = PendingSubmission::new(command, buf);
        loop {
            self.stats.attempts += 1;
            match channel.submit(&pending.command, buf).await {
                Ok(completion) => {
                    if pending.requeues > 0 {
                        debug!(
                            "{} accepted after {} requeues",
                            pending.op(),
                            pending.requeues
                        );
                    }
                    return Ok(completion);
                }
                Err(SubmitError::NoResources) => {
                    pending.requeues += 1;
                    self.stats.requeues += 1;
                    debug!("Queueing {} until the device has room", pending.op());
                    channel.io_wait().await;
                    debug_assert_eq!(pending.buf_addr, buf.addr());
                }
                Err(SubmitError::Rejected(reason)) => {
                    self.stats.rejections += 1;
                    error!("{} error while submitting: {}", pending.op(), reason);
                    return Err(StorageError::SubmitFailed {
                        op: pending.op(),
                        reason,
                    });
                }
            }
        }
    }

    /// Counters so far.
    pub fn stats(&self) -> &BackpressureStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::NvmeStatus;
    use crate::emulator::{FaultPlan, MemoryDriver};
    use crate::driver::{KvDevice, KvDriver};
    use crate::key::Key;

    fn retrieve(offset: u64) -> KvCommand {
        KvCommand::Retrieve {
            key: Key::new("obj").unwrap(),
            offset,
            len: 32,
        }
    }

    #[tokio::test]
    async fn test_requeued_submission_is_identical() {
        let driver = MemoryDriver::new();
        driver.insert(b"obj", vec![7u8; 100]);
        driver.set_faults(FaultPlan::new().busy(KvOpType::Retrieve, 3));

        let mut device = driver.open("mem0").unwrap();
        let mut channel = device.io_channel().unwrap();
        let mut buf = DmaBuffer::zeroed(32, device.buf_align()).unwrap();
        let mut resubmitter = Resubmitter::new();

        let completion = resubmitter
            .submit(&mut channel, &mut buf, retrieve(64))
            .await
            .unwrap();
        assert!(completion.success);
        assert_eq!(completion.total_size(), 100);

        let log = driver.probe().submissions;
        assert_eq!(log.len(), 4);
        assert!(log.iter().all(|s| s.command == retrieve(64)));
        assert!(log.iter().all(|s| s.buf_addr == buf.addr()));
        assert_eq!(driver.probe().io_waits, 3);
        assert_eq!(resubmitter.stats().requeues, 3);
        assert_eq!(resubmitter.stats().attempts, 4);

        channel.put();
        device.close();
    }

    #[tokio::test]
    async fn test_rejection_is_fatal() {
        let driver = MemoryDriver::new();
        driver.set_faults(FaultPlan::new().reject(KvOpType::Exists, "invalid opcode"));

        let mut device = driver.open("mem0").unwrap();
        let mut channel = device.io_channel().unwrap();
        let mut buf = DmaBuffer::zeroed(32, 1).unwrap();
        let mut resubmitter = Resubmitter::new();

        let err = resubmitter
            .submit(
                &mut channel,
                &mut buf,
                KvCommand::Exists {
                    key: Key::new("obj").unwrap(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::SubmitFailed { op: KvOpType::Exists, ref reason }
                if reason == "invalid opcode"
        ));
        assert_eq!(resubmitter.stats().rejections, 1);
        assert_eq!(driver.probe().io_waits, 0);
    }

    #[tokio::test]
    async fn test_device_failure_is_returned_not_retried() {
        let driver = MemoryDriver::new();
        let mut device = driver.open("mem0").unwrap();
        let mut channel = device.io_channel().unwrap();
        let mut buf = DmaBuffer::zeroed(32, 1).unwrap();
        let mut resubmitter = Resubmitter::new();

        let completion = resubmitter
            .submit(&mut channel, &mut buf, retrieve(0))
            .await
            .unwrap();
        assert!(!completion.success);
        assert_eq!(completion.status, NvmeStatus::KEY_NOT_FOUND);
        assert_eq!(resubmitter.stats().attempts, 1);
    }
}
