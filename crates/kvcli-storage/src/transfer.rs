//! Chunked value transfers between local files and the device.
//!
//! Values larger than the transfer buffer move in buffer-sized chunks: the
//! first chunk of a store replaces the value and every later chunk appends,
//! and a download is repeated at increasing offsets until the total size
//! reported by the device is covered.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, error};

use crate::command::{KvCommand, KvOpType};
use crate::driver::KvDevice;
use crate::error::{StorageError, StorageResult};
use crate::key::Key;
use crate::session::DeviceSession;

/// Upload of a local file into a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreRequest {
    /// Destination key.
    pub key: Key,
    /// Local source file.
    pub source: PathBuf,
    /// Append the whole file to the existing value.
    pub append: bool,
}

/// Download of a value into a local file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrieveRequest {
    /// Source key.
    pub key: Key,
    /// Local destination file.
    pub destination: PathBuf,
    /// Value offset to resume from. The destination is pre-sized only from 0.
    pub offset: u64,
}

/// Bytes moved by a chunked transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSummary {
    /// Device requests issued.
    pub chunks: u32,
    /// Bytes moved.
    pub bytes: u64,
    /// Size of the whole source (local file for a store, device value otherwise).
    pub total_size: u64,
}

/// Progress of a chunked store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreContinuation {
    /// Destination key.
    pub key: Key,
    /// File offset of the next chunk.
    pub offset: u64,
    /// Whether the user asked to append.
    pub append: bool,
}

impl StoreContinuation {
    /// The first chunk.
    pub fn start(key: Key, append: bool) -> Self {
        Self {
            key,
            offset: 0,
            append,
        }
    }

    /// The chunk after this one.
    pub fn next_chunk(self, buffer_size: usize) -> Self {
        Self {
            offset: self.offset + buffer_size as u64,
            ..self
        }
    }

    /// Append bit of this chunk: set for every chunk after the first.
    pub fn append_bit(&self) -> bool {
        self.append || self.offset != 0
    }

    /// Store command for a chunk of `len` bytes.
    pub fn command(&self, len: usize) -> KvCommand {
        KvCommand::Store {
            key: self.key.clone(),
            len,
            append: self.append_bit(),
        }
    }
}

/// Number of value bytes in the chunk at `offset`.
pub fn chunk_len(total: u64, offset: u64, buffer_size: usize) -> usize {
    total.saturating_sub(offset).min(buffer_size as u64) as usize
}

/// Whether another chunk follows the one at `offset`.
pub fn has_more(total: u64, offset: u64, buffer_size: usize) -> bool {
    offset.saturating_add(buffer_size as u64) < total
}

/// Uploads `request.source` into `request.key`.
pub async fn store<Dev: KvDevice>(
    session: &mut DeviceSession<Dev>,
    request: &StoreRequest,
) -> StorageResult<TransferSummary> {
    let path = &request.source;
    let mut source = File::open(path).await.map_err(|e| {
        error!("Could not open input file {}: {}", path.display(), e);
        StorageError::local_file(path, e)
    })?;
    let file_len = source
        .metadata()
        .await
        .map_err(|e| StorageError::local_file(path, e))?
        .len();

    let buffer_size = session.buffer_size();
    let mut cont = StoreContinuation::start(request.key.clone(), request.append);
    let mut summary = TransferSummary {
        total_size: file_len,
        ..TransferSummary::default()
    };

    loop {
        session.buffer_mut().clear();
        source
            .seek(SeekFrom::Start(cont.offset))
            .await
            .map_err(|e| StorageError::local_file(path, e))?;
        let read = fill(&mut source, session.buffer_mut().as_mut_slice())
            .await
            .map_err(|e| StorageError::local_file(path, e))?;
        if read == 0 && cont.offset < file_len {
            error!("Input file {} ended at {} of {} bytes", path.display(), cont.offset, file_len);
            return Err(StorageError::ShortRead {
                path: path.clone(),
                offset: cont.offset,
                expected: file_len,
            });
        }
        let last = read < buffer_size || cont.offset + read as u64 >= file_len;

        let completion = session.submit(cont.command(read)).await?;
        if !completion.success {
            error!("KV store error: {}", completion.status);
            return Err(StorageError::DeviceFailure {
                op: KvOpType::Store,
                status: completion.status,
            });
        }
        summary.chunks += 1;
        summary.bytes += read as u64;
        debug!(
            "Stored {} bytes of {} at offset {} (append={})",
            read,
            cont.key,
            cont.offset,
            cont.append_bit()
        );

        if last {
            return Ok(summary);
        }
        cont = cont.next_chunk(buffer_size);
    }
}

async fn fill(source: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// A download that proceeds one buffer-sized window at a time.
pub trait ChunkedDownload: Sized {
    /// Operation named in errors.
    const OP: KvOpType;

    /// Local destination.
    fn destination(&self) -> &Path;

    /// Offset of the next window.
    fn offset(&self) -> u64;

    /// Command reading the next window of `len` bytes.
    fn command(&self, len: usize) -> KvCommand;

    /// The continuation `by` bytes further on.
    fn advance(self, by: u64) -> Self;
}

/// Progress of a chunked retrieve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrieveContinuation {
    /// Source key.
    pub key: Key,
    /// Local destination.
    pub destination: PathBuf,
    /// Value offset of the next chunk.
    pub offset: u64,
}

impl ChunkedDownload for RetrieveContinuation {
    const OP: KvOpType = KvOpType::Retrieve;

    fn destination(&self) -> &Path {
        &self.destination
    }

    fn offset(&self) -> u64 {
        self.offset
    }

    fn command(&self, len: usize) -> KvCommand {
        KvCommand::Retrieve {
            key: self.key.clone(),
            offset: self.offset,
            len,
        }
    }

    fn advance(self, by: u64) -> Self {
        Self {
            offset: self.offset.saturating_add(by),
            ..self
        }
    }
}

/// Downloads `request.key` into `request.destination`.
pub async fn retrieve<Dev: KvDevice>(
    session: &mut DeviceSession<Dev>,
    request: &RetrieveRequest,
) -> StorageResult<TransferSummary> {
    let cont = RetrieveContinuation {
        key: request.key.clone(),
        destination: request.destination.clone(),
        offset: request.offset,
    };
    download(session, cont).await
}

/// Runs a chunked download to completion.
///
/// The destination is created on the first completion. When that completion
/// is for offset 0 the file is truncated and sized to the reported total;
/// otherwise existing contents are kept. Every chunk lands at its own offset.
pub async fn download<Dev, C>(
    session: &mut DeviceSession<Dev>,
    mut cont: C,
) -> StorageResult<TransferSummary>
where
    Dev: KvDevice,
    C: ChunkedDownload,
{
    let buffer_size = session.buffer_size();
    let mut output: Option<File> = None;
    let mut summary = TransferSummary::default();

    loop {
        session.buffer_mut().clear();
        let completion = session.submit(cont.command(buffer_size)).await?;
        if !completion.success {
            error!("KV {} error: {}", C::OP, completion.status);
            return Err(StorageError::DeviceFailure {
                op: C::OP,
                status: completion.status,
            });
        }
        let total = completion.total_size();
        let offset = cont.offset();
        summary.chunks += 1;
        summary.total_size = total;

        if output.is_none() {
            output = Some(open_destination(cont.destination(), offset, total).await?);
        }
        let n = chunk_len(total, offset, buffer_size);
        if let Some(file) = output.as_mut() {
            if n > 0 {
                write_chunk(file, offset, &session.buffer().as_slice()[..n])
                    .await
                    .map_err(|e| StorageError::local_file(cont.destination(), e))?;
            }
        }
        summary.bytes += n as u64;
        session.record_received(n as u64);
        debug!("{} chunk: {} bytes at {} of {}", C::OP, n, offset, total);

        if !has_more(total, offset, buffer_size) {
            break;
        }
        cont = cont.advance(buffer_size as u64);
    }

    if let Some(mut file) = output {
        file.flush()
            .await
            .map_err(|e| StorageError::local_file(cont.destination(), e))?;
    }
    Ok(summary)
}

async fn open_destination(path: &Path, offset: u64, total: u64) -> StorageResult<File> {
    let fresh = offset == 0;
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(fresh)
        .open(path)
        .await
        .map_err(|e| {
            error!("Could not open output file {}: {}", path.display(), e);
            StorageError::local_file(path, e)
        })?;
    if fresh {
        file.set_len(total)
            .await
            .map_err(|e| StorageError::local_file(path, e))?;
    }
    Ok(file)
}

async fn write_chunk(file: &mut File, offset: u64, data: &[u8]) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(data).await
}
