//! Device session: one device handle, one I/O channel, one transfer buffer.
//!
//! Every operation runs inside exactly one session. Opening acquires the
//! three resources in order and undoes partial acquisition on failure;
//! [`DeviceSession::release`] consumes the session, so resources are released
//! exactly once on every path.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::backpressure::Resubmitter;
use crate::buffer::DmaBuffer;
use crate::command::{KvCommand, KvCompletion, KvOpType};
use crate::driver::{IoChannel, KvDevice, KvDriver};
use crate::error::{StorageError, StorageResult};

/// Counters reported when a session is released.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    /// Commands handed to the resubmitter.
    pub submissions: u64,
    /// Completions observed.
    pub completions: u64,
    /// Completions with a failure status.
    pub device_failures: u64,
    /// Times a submission was parked for lack of device resources.
    pub requeues: u64,
    /// Value bytes accepted by successful stores.
    pub bytes_sent: u64,
    /// Bytes written to local destinations.
    pub bytes_received: u64,
}

/// An open device session.
pub struct DeviceSession<Dev: KvDevice> {
    device: Dev,
    channel: Dev::Channel,
    buffer: DmaBuffer,
    resubmitter: Resubmitter,
    stats: SessionStats,
}

impl<Dev> DeviceSession<Dev>
where
    Dev: KvDevice,
{
    /// Opens `name` through `driver`, creates its I/O channel and allocates a
    /// zeroed `buffer_size` byte buffer aligned to the device's requirement.
    pub fn open<D>(driver: &D, name: &str, buffer_size: usize) -> StorageResult<Self>
    where
        D: KvDriver<Device = Dev>,
    {
        let mut device = driver.open(name).map_err(|e| {
            error!("Could not open device {}: {}", name, e);
            e
        })?;

        let channel = match device.io_channel() {
            Ok(channel) => channel,
            Err(e) => {
                error!("Could not create I/O channel on {}: {}", name, e);
                device.close();
                return Err(e);
            }
        };

        let buffer = match DmaBuffer::zeroed(buffer_size, device.buf_align()) {
            Ok(buffer) => buffer,
            Err(e) => {
                error!("Failed to allocate transfer buffer: {}", e);
                channel.put();
                device.close();
                return Err(e);
            }
        };

        info!(
            "Opened device {} (buffer {} bytes, align {}, zoned={})",
            name,
            buffer.len(),
            buffer.alignment(),
            device.is_zoned()
        );
        Ok(Self {
            device,
            channel,
            buffer,
            resubmitter: Resubmitter::new(),
            stats: SessionStats::default(),
        })
    }

    /// Resets all zones if the device is zoned. No-op otherwise.
    pub async fn prepare(&mut self) -> StorageResult<()> {
        if !self.device.is_zoned() {
            return Ok(());
        }
        warn!("Device {} is zoned, resetting all zones", self.device.name());
        let completion = self.submit(KvCommand::ZoneReset).await?;
        if !completion.success {
            error!("Zone reset error: {}", completion.status);
            return Err(StorageError::DeviceFailure {
                op: KvOpType::ZoneReset,
                status: completion.status,
            });
        }
        Ok(())
    }

    /// Submits `command` with the session buffer and waits for its completion.
    pub async fn submit(&mut self, command: KvCommand) -> StorageResult<KvCompletion> {
        let sent = match &command {
            KvCommand::Store { len, .. } => *len as u64,
            _ => 0,
        };
        self.stats.submissions += 1;
        let completion = self
            .resubmitter
            .submit(&mut self.channel, &mut self.buffer, command)
            .await?;
        self.stats.completions += 1;
        if completion.success {
            self.stats.bytes_sent += sent;
        } else {
            self.stats.device_failures += 1;
        }
        Ok(completion)
    }

    /// The transfer buffer.
    pub fn buffer(&self) -> &DmaBuffer {
        &self.buffer
    }

    /// The transfer buffer, mutably.
    pub fn buffer_mut(&mut self) -> &mut DmaBuffer {
        &mut self.buffer
    }

    /// Transfer buffer size in bytes.
    pub fn buffer_size(&self) -> usize {
        self.buffer.len()
    }

    /// Name of the open device.
    pub fn device_name(&self) -> &str {
        self.device.name()
    }

    /// Counts bytes written to a local destination.
    pub fn record_received(&mut self, bytes: u64) {
        self.stats.bytes_received += bytes;
    }

    /// Counters so far.
    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Frees the buffer, returns the channel, closes the device.
    pub fn release(self) -> SessionStats {
        let Self {
            device,
            channel,
            buffer,
            resubmitter,
            mut stats,
        } = self;
        stats.requeues = resubmitter.stats().requeues;

        drop(buffer);
        channel.put();
        let name = device.name().to_string();
        device.close();

        debug!("Released device {}: {:?}", name, stats);
        stats
    }
}
