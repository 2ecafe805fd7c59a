//! Prefix enumeration of device keys.
//!
//! A list request fills the transfer buffer with a batch of keys:
//!
//! ```text
//! +-----------+----------+------------------+----------+----------------
//! | count u32 | len u16  | key, padded to 4 | len u16  | key ...
//! +-----------+----------+------------------+----------+----------------
//! ```
//!
//! All integers are little-endian. The completion's dword 0 carries the total
//! number of keys matching the prefix. When a batch does not cover the total,
//! the next request uses the batch's last key as its prefix; the device
//! returns that anchor again as entry 0, so the continuation skips it.

use std::io::Write;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::command::{KvCommand, KvOpType};
use crate::driver::KvDevice;
use crate::error::{StorageError, StorageResult};
use crate::key::{Key, MAX_KEY_LEN};
use crate::session::DeviceSession;

/// Size of the batch header (key count).
pub const LIST_HEADER_LEN: usize = 4;

/// Size of the per-entry length field.
pub const LIST_LEN_FIELD: usize = 2;

/// Smallest buffer in which a continuation always makes progress: the
/// re-returned anchor plus one more key, both of maximum length.
pub const MIN_BUFFER_SIZE: usize = LIST_HEADER_LEN + 2 * entry_stride(MAX_KEY_LEN);

/// Key length rounded up to a multiple of 4.
pub const fn padded_len(len: usize) -> usize {
    (len + 3) & !3
}

/// Bytes one entry of a key of length `len` occupies in the buffer.
pub const fn entry_stride(len: usize) -> usize {
    LIST_LEN_FIELD + padded_len(len)
}

/// Keys decoded from one list response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyBatch {
    /// Keys in device order.
    pub keys: Vec<Vec<u8>>,
}

impl KeyBatch {
    /// Number of keys in the batch.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// True for an empty batch.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Last key of the batch, the anchor of the next continuation.
    pub fn last(&self) -> Option<&[u8]> {
        self.keys.last().map(Vec::as_slice)
    }
}

/// Decodes a list response, failing instead of reading past `buf`.
pub fn decode_key_list(buf: &[u8]) -> StorageResult<KeyBatch> {
    let header: [u8; LIST_HEADER_LEN] = buf
        .get(..LIST_HEADER_LEN)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| StorageError::CorruptListing {
            reason: format!("buffer of {} bytes has no key count", buf.len()),
        })?;
    let count = u32::from_le_bytes(header);

    let mut batch = KeyBatch::default();
    let mut pos = LIST_HEADER_LEN;
    for i in 0..count {
        let len_field = buf
            .get(pos..pos + LIST_LEN_FIELD)
            .ok_or_else(|| StorageError::CorruptListing {
                reason: format!("entry {} of {} starts past the buffer end", i, count),
            })?;
        let len = u16::from_le_bytes([len_field[0], len_field[1]]) as usize;

        let stride = entry_stride(len);
        if pos + stride > buf.len() {
            return Err(StorageError::CorruptListing {
                reason: format!(
                    "entry {} of {} with length {} overflows the {} byte buffer",
                    i,
                    count,
                    len,
                    buf.len()
                ),
            });
        }

        let start = pos + LIST_LEN_FIELD;
        batch.keys.push(buf[start..start + len].to_vec());
        pos += stride;
    }
    Ok(batch)
}

/// Encodes as many of `keys` as fit in `out`. Returns the number encoded.
pub fn encode_key_list<'a, I>(keys: I, out: &mut [u8]) -> usize
where
    I: IntoIterator<Item = &'a [u8]>,
{
    if out.len() < LIST_HEADER_LEN {
        return 0;
    }
    let mut count = 0u32;
    let mut pos = LIST_HEADER_LEN;
    for key in keys {
        let stride = entry_stride(key.len());
        if key.len() > u16::MAX as usize || pos + stride > out.len() {
            break;
        }
        out[pos..pos + LIST_LEN_FIELD].copy_from_slice(&(key.len() as u16).to_le_bytes());
        let start = pos + LIST_LEN_FIELD;
        out[start..start + key.len()].copy_from_slice(key);
        out[start + key.len()..pos + stride].fill(0);
        pos += stride;
        count += 1;
    }
    out[..LIST_HEADER_LEN].copy_from_slice(&count.to_le_bytes());
    count as usize
}

/// Progress of a key enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListContinuation {
    /// Prefix of the next request: the user prefix, then the anchor key.
    pub prefix: Key,
    /// Suppress entry 0 of the next batch (the re-returned anchor).
    pub skip_first: bool,
}

impl ListContinuation {
    /// First request of an enumeration.
    pub fn start(prefix: Key) -> Self {
        Self {
            prefix,
            skip_first: false,
        }
    }

    /// Continuation anchored at the last key of the previous batch.
    pub fn resume_at(anchor: Key) -> Self {
        Self {
            prefix: anchor,
            skip_first: true,
        }
    }
}

/// Result of a completed enumeration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListSummary {
    /// Total matching keys reported by the device.
    pub total: u64,
    /// Keys written to the output.
    pub printed: u64,
    /// List requests issued.
    pub batches: u32,
}

/// Lists every key starting with `prefix`, writing `key[i] = <key>` lines to `out`.
///
/// The key total reported by the first batch is the target; later batches
/// are requested until that many distinct keys have been observed. Indices
/// count printed keys across all batches, so the re-returned anchor never
/// shifts them.
///
/// Fails with [`StorageError::BufferTooSmall`] before submitting anything when
/// the session buffer is smaller than [`MIN_BUFFER_SIZE`].
pub async fn list<Dev, W>(
    session: &mut DeviceSession<Dev>,
    prefix: Key,
    out: &mut W,
) -> StorageResult<ListSummary>
where
    Dev: KvDevice,
    W: Write,
{
    if session.buffer_size() < MIN_BUFFER_SIZE {
        error!(
            "List needs a buffer of at least {} bytes, have {}",
            MIN_BUFFER_SIZE,
            session.buffer_size()
        );
        return Err(StorageError::BufferTooSmall {
            size: session.buffer_size(),
            min: MIN_BUFFER_SIZE,
        });
    }

    let mut cont = ListContinuation::start(prefix);
    let mut summary = ListSummary::default();
    let mut target = None;
    let mut observed = 0u64;

    loop {
        let len = session.buffer_size();
        session.buffer_mut().clear();
        let completion = session
            .submit(KvCommand::List {
                prefix: cont.prefix.clone(),
                len,
            })
            .await?;
        if !completion.success {
            error!("KV list error: {}", completion.status);
            return Err(StorageError::DeviceFailure {
                op: KvOpType::List,
                status: completion.status,
            });
        }
        let total = *target.get_or_insert(completion.total_keys());

        let batch = decode_key_list(session.buffer().as_slice())?;
        summary.batches += 1;

        let skip = usize::from(cont.skip_first && !batch.is_empty());
        if skip == 1 && batch.keys[0] != cont.prefix.as_bytes() {
            warn!(
                "List continuation at anchor {} returned {:?} first",
                cont.prefix,
                String::from_utf8_lossy(&batch.keys[0])
            );
        }
        for key in &batch.keys[skip..] {
            if summary.printed >= total {
                break;
            }
            writeln!(out, "key[{}] = {}", summary.printed, String::from_utf8_lossy(key))?;
            summary.printed += 1;
        }

        let fresh = (batch.len() - skip) as u64;
        observed += fresh;
        debug!(
            "List batch {}: {} keys ({} new), {}/{} observed",
            summary.batches,
            batch.len(),
            fresh,
            observed,
            total
        );
        if observed >= total {
            break;
        }

        let anchor = match batch.last() {
            Some(last) if fresh > 0 => last,
            _ => {
                return Err(StorageError::ListingStalled {
                    anchor: cont.prefix.to_string(),
                    observed,
                    total,
                })
            }
        };
        let anchor = Key::new(anchor).map_err(|_| StorageError::CorruptListing {
            reason: format!("anchor key of {} bytes is not a valid key", anchor.len()),
        })?;
        cont = ListContinuation::resume_at(anchor);
    }

    summary.total = target.unwrap_or(0);
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::NvmeStatus;
    use crate::emulator::{FaultPlan, MemoryDriver};
    use std::collections::HashSet;

    fn printed_keys(out: &[u8]) -> Vec<String> {
        String::from_utf8_lossy(out)
            .lines()
            .map(|l| l.split_once(" = ").unwrap().1.to_string())
            .collect()
    }

    #[test]
    fn test_decode_three_keys() {
        let keys: [&[u8]; 3] = [b"a", b"abcd", b"0123456789abcdef"];
        let mut buf = vec![0u8; 64];
        assert_eq!(encode_key_list(keys, &mut buf), 3);

        // 4 + (2+4) + (2+4) + (2+16)
        assert_eq!(u32::from_le_bytes(buf[..4].try_into().unwrap()), 3);
        let batch = decode_key_list(&buf).unwrap();
        assert_eq!(batch.keys, keys.iter().map(|k| k.to_vec()).collect::<Vec<_>>());
        assert_eq!(batch.last(), Some(&b"0123456789abcdef"[..]));
    }

    #[test]
    fn test_decode_exact_fit() {
        let mut buf = vec![0u8; 4 + 6 + 6 + 18];
        let keys: [&[u8]; 3] = [b"a", b"abcd", b"0123456789abcdef"];
        assert_eq!(encode_key_list(keys, &mut buf), 3);
        assert_eq!(decode_key_list(&buf).unwrap().len(), 3);
    }

    #[test]
    fn test_decode_overflowing_entry_fails() {
        let mut buf = vec![0u8; 32];
        buf[..4].copy_from_slice(&2u32.to_le_bytes());
        buf[4..6].copy_from_slice(&3u16.to_le_bytes());
        buf[6..9].copy_from_slice(b"abc");
        // Second entry claims 40 bytes in a 32 byte buffer.
        buf[10..12].copy_from_slice(&40u16.to_le_bytes());

        let err = decode_key_list(&buf).unwrap_err();
        assert!(matches!(err, StorageError::CorruptListing { .. }));
    }

    #[test]
    fn test_decode_count_past_end_fails() {
        let mut buf = vec![0u8; 10];
        buf[..4].copy_from_slice(&5u32.to_le_bytes());
        buf[4..6].copy_from_slice(&1u16.to_le_bytes());
        assert!(decode_key_list(&buf).is_err());
        assert!(decode_key_list(&buf[..3]).is_err());
    }

    #[test]
    fn test_encode_stops_when_full() {
        let keys: Vec<&[u8]> = vec![b"k1", b"k2", b"k3"];
        let mut buf = vec![0u8; 4 + 6 + 6];
        assert_eq!(encode_key_list(keys, &mut buf), 2);
        assert_eq!(decode_key_list(&buf).unwrap().keys, vec![b"k1".to_vec(), b"k2".to_vec()]);
    }

    #[test]
    fn test_padding() {
        assert_eq!(padded_len(0), 0);
        assert_eq!(padded_len(1), 4);
        assert_eq!(padded_len(4), 4);
        assert_eq!(padded_len(13), 16);
        assert_eq!(entry_stride(16), 18);
        assert_eq!(MIN_BUFFER_SIZE, 40);
    }

    async fn run_list(
        driver: &MemoryDriver,
        prefix: &str,
        buffer: usize,
    ) -> (StorageResult<ListSummary>, Vec<u8>) {
        let mut session = DeviceSession::open(driver, "mem0", buffer).unwrap();
        let mut out = Vec::new();
        let result = list(&mut session, Key::prefix(prefix).unwrap(), &mut out).await;
        session.release();
        (result, out)
    }

    #[tokio::test]
    async fn test_single_batch() {
        let driver = MemoryDriver::new();
        for k in ["alpha", "beta", "gamma"] {
            driver.insert(k.as_bytes(), b"v".to_vec());
        }
        let (result, out) = run_list(&driver, "", 4096).await;
        let summary = result.unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.batches, 1);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "key[0] = alpha\nkey[1] = beta\nkey[2] = gamma\n"
        );
    }

    #[tokio::test]
    async fn test_continuation_never_repeats_anchor() {
        let driver = MemoryDriver::new();
        for i in 0..23 {
            driver.insert(format!("key{:02}", i).as_bytes(), vec![1]);
        }
        driver.set_faults(FaultPlan::new().list_batch_limit(5));

        let (result, out) = run_list(&driver, "key", 4096).await;
        let summary = result.unwrap();
        let keys = printed_keys(&out);
        let distinct: HashSet<_> = keys.iter().collect();
        assert_eq!(summary.total, 23);
        assert_eq!(keys.len(), 23);
        assert_eq!(distinct.len(), 23);
        // 5 + 4 * 4 + 2 fresh keys
        assert_eq!(summary.batches, 6);

        let requests = driver.probe().submissions;
        assert!(matches!(
            &requests[1].command,
            KvCommand::List { prefix, .. } if prefix.as_bytes() == b"key04"
        ));
    }

    #[tokio::test]
    async fn test_continuation_limited_by_buffer() {
        let driver = MemoryDriver::new();
        for i in 0..10 {
            driver.insert(format!("k{}", i).as_bytes(), vec![1]);
        }
        // Header plus six 6-byte entries.
        let (result, out) = run_list(&driver, "", 40).await;
        assert_eq!(result.unwrap().printed, 10);
        assert_eq!(printed_keys(&out).len(), 10);
    }

    #[tokio::test]
    async fn test_buffer_below_minimum_rejected() {
        let driver = MemoryDriver::new();
        driver.insert(b"greeting", vec![1]);
        let (result, out) = run_list(&driver, "", MIN_BUFFER_SIZE - 1).await;
        assert!(matches!(
            result,
            Err(StorageError::BufferTooSmall { size: 39, min: 40 })
        ));
        assert!(out.is_empty());
        assert!(driver.probe().submissions.is_empty());
        assert_eq!(driver.probe().closes, 1);
    }

    #[tokio::test]
    async fn test_minimum_buffer_lists_longest_key() {
        let driver = MemoryDriver::new();
        let keys = ["0123456789abcde0", "0123456789abcde1", "0123456789abcde2"];
        for k in keys {
            driver.insert(k.as_bytes(), vec![1]);
        }
        let (result, out) = run_list(&driver, "", MIN_BUFFER_SIZE).await;
        let summary = result.unwrap();
        assert_eq!(summary.printed, 3);
        assert_eq!(summary.batches, 2);
        assert_eq!(printed_keys(&out), keys);
    }

    #[tokio::test]
    async fn test_prefix_excludes_following_keys() {
        let driver = MemoryDriver::new();
        for k in ["a1", "a2", "a3", "b1", "b2"] {
            driver.insert(k.as_bytes(), vec![1]);
        }
        let (result, out) = run_list(&driver, "a", 4096).await;
        assert_eq!(result.unwrap().total, 3);
        assert_eq!(printed_keys(&out), vec!["a1", "a2", "a3"]);
    }

    #[tokio::test]
    async fn test_empty_device() {
        let driver = MemoryDriver::new();
        let (result, out) = run_list(&driver, "", 4096).await;
        assert_eq!(result.unwrap(), ListSummary { total: 0, printed: 0, batches: 1 });
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_response_fails() {
        let driver = MemoryDriver::new();
        driver.insert(b"k", vec![1]);
        driver.set_faults(FaultPlan::new().corrupt_listing());
        let (result, _) = run_list(&driver, "", 64).await;
        assert!(matches!(result, Err(StorageError::CorruptListing { .. })));
        assert_eq!(driver.probe().closes, 1);
    }

    #[tokio::test]
    async fn test_device_failure() {
        let driver = MemoryDriver::new();
        driver.set_faults(FaultPlan::new().fail_nth(
            KvOpType::List,
            1,
            NvmeStatus::INTERNAL_ERROR,
        ));
        let (result, _) = run_list(&driver, "", 64).await;
        assert!(matches!(
            result,
            Err(StorageError::DeviceFailure { op: KvOpType::List, .. })
        ));
    }

    #[tokio::test]
    async fn test_stalled_listing() {
        let driver = MemoryDriver::new();
        for k in ["a1", "a2"] {
            driver.insert(k.as_bytes(), vec![1]);
        }
        // One key per batch: every continuation only re-returns its anchor.
        driver.set_faults(FaultPlan::new().list_batch_limit(1));
        let (result, out) = run_list(&driver, "a", 4096).await;
        assert!(matches!(
            result,
            Err(StorageError::ListingStalled { observed: 1, total: 2, .. })
        ));
        assert_eq!(printed_keys(&out), vec!["a1"]);
    }
}
