//! Single-request key operations: existence check and delete.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::command::{KvCommand, KvOpType};
use crate::driver::KvDevice;
use crate::error::{StorageError, StorageResult};
use crate::key::Key;
use crate::session::DeviceSession;

/// Answer of an existence check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyPresence {
    /// The key exists.
    Present,
    /// The device reported the key as not found.
    Absent,
}

impl fmt::Display for KeyPresence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPresence::Present => f.write_str("Key exists."),
            KeyPresence::Absent => f.write_str("Key does not exist."),
        }
    }
}

/// Asks the device whether `key` exists.
///
/// "Not found" is an answer, not an error. Any other failure status is
/// reported as [`StorageError::UnknownStatus`].
pub async fn exists<Dev: KvDevice>(
    session: &mut DeviceSession<Dev>,
    key: &Key,
) -> StorageResult<KeyPresence> {
    let completion = session.submit(KvCommand::Exists { key: key.clone() }).await?;
    if completion.success && completion.status.is_success() {
        Ok(KeyPresence::Present)
    } else if completion.is_key_not_found() {
        Ok(KeyPresence::Absent)
    } else {
        warn!("KV exists on {} completed with {}", key, completion.status);
        Err(StorageError::UnknownStatus {
            op: KvOpType::Exists,
            status: completion.status,
        })
    }
}

/// Deletes `key`.
pub async fn delete<Dev: KvDevice>(
    session: &mut DeviceSession<Dev>,
    key: &Key,
) -> StorageResult<()> {
    let completion = session.submit(KvCommand::Delete { key: key.clone() }).await?;
    if completion.success && completion.status.is_success() {
        return Ok(());
    }
    error!("KV delete error: {:#x}", completion.status.sc);
    Err(StorageError::DeviceFailure {
        op: KvOpType::Delete,
        status: completion.status,
    })
}
