//! Emulated NVMe key-value devices.
//!
//! [`MemoryDriver`] keeps values in memory and is what the engine tests run
//! against; [`DirDriver`] persists each device as a directory under a root,
//! which is what the command line uses when no hardware driver is linked in.
//! Both run the same command semantics on top of a [`KvMedia`], plus a
//! [`FaultPlan`] for injecting backpressure, rejections and failure statuses,
//! and a [`DeviceProbe`] recording what the session did.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::buffer::DmaBuffer;
use crate::command::{KvCommand, KvCompletion, KvOpType, NvmeStatus, SelectFree};
use crate::driver::{IoChannel, KvDevice, KvDriver, SubmitError};
use crate::error::{StorageError, StorageResult};
use crate::listing::encode_key_list;
use crate::media::{DirMedia, KvMedia, MemMedia};

/// Marker file that makes a directory-backed device zoned.
pub const ZONED_MARKER: &str = ".zoned";

/// Default buffer alignment reported by emulated devices.
pub const DEFAULT_ALIGNMENT: usize = 4096;

/// Faults to inject into an emulated device.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    busy: HashMap<KvOpType, u32>,
    fail_nth: HashMap<(KvOpType, u32), NvmeStatus>,
    reject: HashMap<KvOpType, String>,
    corrupt_listing: bool,
    list_batch_limit: Option<usize>,
    fail_open: Option<String>,
    fail_channel: Option<String>,
}

impl FaultPlan {
    /// A plan injecting nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `times` submissions of `op` for lack of resources.
    pub fn busy(mut self, op: KvOpType, times: u32) -> Self {
        *self.busy.entry(op).or_default() += times;
        self
    }

    /// Complete the `nth` (1-based) accepted `op` with `status`, without effect.
    pub fn fail_nth(mut self, op: KvOpType, nth: u32, status: NvmeStatus) -> Self {
        self.fail_nth.insert((op, nth), status);
        self
    }

    /// Reject every submission of `op` with `reason`.
    pub fn reject(mut self, op: KvOpType, reason: impl Into<String>) -> Self {
        self.reject.insert(op, reason.into());
        self
    }

    /// Answer list requests with an entry that overruns the buffer.
    pub fn corrupt_listing(mut self) -> Self {
        self.corrupt_listing = true;
        self
    }

    /// Return at most `limit` keys per list batch.
    pub fn list_batch_limit(mut self, limit: usize) -> Self {
        self.list_batch_limit = Some(limit);
        self
    }

    /// Fail device open with `reason`.
    pub fn fail_open(mut self, reason: impl Into<String>) -> Self {
        self.fail_open = Some(reason.into());
        self
    }

    /// Fail I/O channel creation with `reason`.
    pub fn fail_channel(mut self, reason: impl Into<String>) -> Self {
        self.fail_channel = Some(reason.into());
        self
    }

    fn take_busy(&mut self, op: KvOpType) -> bool {
        match self.busy.get_mut(&op) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }
}

/// One submission seen by an emulated channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionRecord {
    /// The submitted command.
    pub command: KvCommand,
    /// Address of the lent buffer.
    pub buf_addr: usize,
    /// False when the submission was refused or rejected.
    pub accepted: bool,
}

/// What happened on an emulated device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceProbe {
    /// Successful device opens.
    pub opens: u32,
    /// Device closes.
    pub closes: u32,
    /// I/O channels created.
    pub channels_opened: u32,
    /// I/O channels returned.
    pub channels_put: u32,
    /// Zone resets executed.
    pub zone_resets: u32,
    /// Capacity waits completed.
    pub io_waits: u32,
    /// Every submission, in order.
    pub submissions: Vec<SubmissionRecord>,
}

#[derive(Debug)]
struct EmulatorState {
    faults: FaultPlan,
    probe: DeviceProbe,
    results: HashMap<u32, Vec<u8>>,
    next_result_id: u32,
    executed: HashMap<KvOpType, u32>,
}

impl Default for EmulatorState {
    fn default() -> Self {
        Self {
            faults: FaultPlan::default(),
            probe: DeviceProbe::default(),
            results: HashMap::new(),
            next_result_id: 1,
            executed: HashMap::new(),
        }
    }
}

type SharedState = Arc<Mutex<EmulatorState>>;

/// Open handle on an emulated device.
pub struct EmulatedDevice<M: KvMedia> {
    name: String,
    media: Arc<M>,
    state: SharedState,
    zoned: bool,
    alignment: usize,
}

impl<M: KvMedia> KvDevice for EmulatedDevice<M> {
    type Channel = EmulatedChannel<M>;

    fn name(&self) -> &str {
        &self.name
    }

    fn buf_align(&self) -> usize {
        self.alignment
    }

    fn is_zoned(&self) -> bool {
        self.zoned
    }

    fn io_channel(&mut self) -> StorageResult<Self::Channel> {
        let mut state = self.state.lock();
        if let Some(reason) = state.faults.fail_channel.clone() {
            return Err(StorageError::DeviceError {
                device: self.name.clone(),
                reason,
            });
        }
        state.probe.channels_opened += 1;
        Ok(EmulatedChannel {
            media: Arc::clone(&self.media),
            state: Arc::clone(&self.state),
        })
    }

    fn close(self) {
        self.state.lock().probe.closes += 1;
        debug!("Closed emulated device {}", self.name);
    }
}

/// I/O channel of an emulated device.
pub struct EmulatedChannel<M: KvMedia> {
    media: Arc<M>,
    state: SharedState,
}

impl<M: KvMedia> IoChannel for EmulatedChannel<M> {
    async fn submit(
        &mut self,
        command: &KvCommand,
        buf: &mut DmaBuffer,
    ) -> Result<KvCompletion, SubmitError> {
        // Completion is asynchronous even though the work is not.
        tokio::task::yield_now().await;

        let mut state = self.state.lock();
        let op = command.op();
        let rejected = state.faults.reject.get(&op).cloned();
        let refused = rejected.is_none() && state.faults.take_busy(op);
        state.probe.submissions.push(SubmissionRecord {
            command: command.clone(),
            buf_addr: buf.addr(),
            accepted: rejected.is_none() && !refused,
        });
        if let Some(reason) = rejected {
            return Err(SubmitError::Rejected(reason));
        }
        if refused {
            return Err(SubmitError::NoResources);
        }

        let nth = {
            let count = state.executed.entry(op).or_default();
            *count += 1;
            *count
        };
        if let Some(status) = state.faults.fail_nth.get(&(op, nth)) {
            return Ok(KvCompletion::failed(*status));
        }

        Ok(execute(self.media.as_ref(), &mut state, command, buf))
    }

    async fn io_wait(&mut self) {
        tokio::task::yield_now().await;
        self.state.lock().probe.io_waits += 1;
    }

    fn put(self) {
        self.state.lock().probe.channels_put += 1;
    }
}

fn execute<M: KvMedia>(
    media: &M,
    state: &mut EmulatorState,
    command: &KvCommand,
    buf: &mut DmaBuffer,
) -> KvCompletion {
    let result = match command {
        KvCommand::Store { key, len, append } => {
            if *len > buf.len() {
                return KvCompletion::failed(NvmeStatus::INVALID_FIELD);
            }
            media
                .put(key.as_bytes(), &buf.as_slice()[..*len], *append)
                .map(|()| KvCompletion::ok(0))
        }
        KvCommand::Retrieve { key, offset, len } => {
            let window = (*len).min(buf.len());
            media
                .read_at(key.as_bytes(), *offset, &mut buf.as_mut_slice()[..window])
                .map(|total| match total {
                    Some(total) => completion_with_size(total),
                    None => KvCompletion::failed(NvmeStatus::KEY_NOT_FOUND),
                })
        }
        KvCommand::List { prefix, len } => media.keys().map(|keys| {
            let prefix = prefix.as_bytes();
            let matching = keys.iter().filter(|k| k.starts_with(prefix)).count();
            let limit = state.faults.list_batch_limit.unwrap_or(usize::MAX);
            let window_len = (*len).min(buf.len());
            let window = &mut buf.as_mut_slice()[..window_len];
            if state.faults.corrupt_listing && window.len() >= 6 {
                window[..4].copy_from_slice(&1u32.to_le_bytes());
                window[4..6].copy_from_slice(&u16::MAX.to_le_bytes());
            } else {
                let batch = keys
                    .iter()
                    .filter(|k| k.as_slice() >= prefix)
                    .take(limit)
                    .map(Vec::as_slice);
                encode_key_list(batch, window);
            }
            completion_with_size(matching as u64)
        }),
        KvCommand::Exists { key } => media.contains(key.as_bytes()).map(|found| {
            if found {
                KvCompletion::ok(0)
            } else {
                KvCompletion::failed(NvmeStatus::KEY_NOT_FOUND)
            }
        }),
        KvCommand::Delete { key } => media.remove(key.as_bytes()).map(|found| {
            if found {
                KvCompletion::ok(0)
            } else {
                KvCompletion::failed(NvmeStatus::KEY_NOT_FOUND)
            }
        }),
        KvCommand::SendSelect { key, query, .. } => media.get(key.as_bytes()).map(|value| {
            let Some(value) = value else {
                return KvCompletion::failed(NvmeStatus::KEY_NOT_FOUND);
            };
            // The query is not evaluated: the result is the object itself.
            let id = state.next_result_id;
            state.next_result_id = state.next_result_id.wrapping_add(1).max(1);
            debug!("Staged select result {} ({} bytes) for {:?}", id, value.len(), query);
            state.results.insert(id, value);
            KvCompletion::ok(id)
        }),
        KvCommand::RetrieveSelect {
            result_id,
            offset,
            len,
            free,
        } => {
            let Some(result) = state.results.get(result_id) else {
                return KvCompletion::failed(NvmeStatus::INVALID_FIELD);
            };
            let total = result.len() as u64;
            let window = (*len).min(buf.len());
            let start = (*offset).min(total) as usize;
            let n = window.min(result.len() - start);
            buf.as_mut_slice()[..n].copy_from_slice(&result[start..start + n]);
            if *free == SelectFree::FreeIfFit && offset.saturating_add(window as u64) >= total {
                state.results.remove(result_id);
            }
            Ok(completion_with_size(total))
        }
        KvCommand::ZoneReset => media.keys().and_then(|keys| {
            for key in keys {
                media.remove(&key)?;
            }
            state.probe.zone_resets += 1;
            Ok(KvCompletion::ok(0))
        }),
    };

    result.unwrap_or_else(|e| {
        warn!("Emulated {} failed: {}", command.op(), e);
        KvCompletion::failed(NvmeStatus::INTERNAL_ERROR)
    })
}

fn completion_with_size(size: u64) -> KvCompletion {
    match u32::try_from(size) {
        Ok(cdw0) => KvCompletion::ok(cdw0),
        Err(_) => KvCompletion::failed(NvmeStatus::INVALID_FIELD),
    }
}

/// In-memory emulated device driver. Every name opens the same store.
#[derive(Clone)]
pub struct MemoryDriver {
    media: Arc<MemMedia>,
    state: SharedState,
    zoned: bool,
    alignment: usize,
}

impl MemoryDriver {
    /// An empty, conventional device with 4 KiB buffer alignment.
    pub fn new() -> Self {
        Self {
            media: Arc::new(MemMedia::new()),
            state: SharedState::default(),
            zoned: false,
            alignment: DEFAULT_ALIGNMENT,
        }
    }

    /// Sets the buffer alignment the device reports.
    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    /// Makes the device zoned.
    pub fn zoned(mut self, zoned: bool) -> Self {
        self.zoned = zoned;
        self
    }

    /// Sets the value of `key` directly.
    pub fn insert(&self, key: &[u8], value: Vec<u8>) {
        self.media.insert(key, value);
    }

    /// Current value of `key`.
    pub fn value(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.media.value(key)
    }

    /// Replaces the fault plan and resets per-operation counters.
    pub fn set_faults(&self, faults: FaultPlan) {
        let mut state = self.state.lock();
        state.faults = faults;
        state.executed.clear();
    }

    /// Snapshot of the probe.
    pub fn probe(&self) -> DeviceProbe {
        self.state.lock().probe.clone()
    }

    /// Select results staged and not yet freed.
    pub fn results_outstanding(&self) -> usize {
        self.state.lock().results.len()
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl KvDriver for MemoryDriver {
    type Device = EmulatedDevice<MemMedia>;

    fn open(&self, name: &str) -> StorageResult<Self::Device> {
        let mut state = self.state.lock();
        if let Some(reason) = state.faults.fail_open.clone() {
            return Err(StorageError::DeviceError {
                device: name.to_string(),
                reason,
            });
        }
        state.probe.opens += 1;
        Ok(EmulatedDevice {
            name: name.to_string(),
            media: Arc::clone(&self.media),
            state: Arc::clone(&self.state),
            zoned: self.zoned,
            alignment: self.alignment,
        })
    }
}

/// Directory-backed emulated device driver.
///
/// Device `NAME` is the directory `<root>/NAME`; it is zoned when it holds a
/// [`ZONED_MARKER`] file.
#[derive(Debug, Clone)]
pub struct DirDriver {
    root: PathBuf,
    state: SharedState,
}

impl DirDriver {
    /// Uses `root` as the parent directory of all devices.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            state: SharedState::default(),
        }
    }

    /// Parent directory of all devices.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Snapshot of the probe.
    pub fn probe(&self) -> DeviceProbe {
        self.state.lock().probe.clone()
    }
}

impl KvDriver for DirDriver {
    type Device = EmulatedDevice<DirMedia>;

    fn open(&self, name: &str) -> StorageResult<Self::Device> {
        let not_found = || StorageError::DeviceNotFound {
            device: name.to_string(),
        };
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(not_found());
        }
        let dir = self.root.join(name);
        if !dir.is_dir() {
            return Err(not_found());
        }

        let zoned = dir.join(ZONED_MARKER).exists();
        self.state.lock().probe.opens += 1;
        debug!("Opened {} at {} (zoned={})", name, dir.display(), zoned);
        Ok(EmulatedDevice {
            name: name.to_string(),
            media: Arc::new(DirMedia::new(dir)),
            state: Arc::clone(&self.state),
            zoned,
            alignment: DEFAULT_ALIGNMENT,
        })
    }
}
