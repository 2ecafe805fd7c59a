//! Storage media behind the emulated key-value device.
//!
//! A medium is a plain byte-oriented key-value map. The emulator in
//! [`crate::emulator`] layers the device command set on top of it.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::debug;

/// Key-value medium used by the device emulator.
pub trait KvMedia: Send + Sync + 'static {
    /// Copies the value of `key` starting at `offset` into `out`, as far as
    /// it goes. Returns the total value size, or `None` if the key is absent.
    fn read_at(&self, key: &[u8], offset: u64, out: &mut [u8]) -> io::Result<Option<u64>>;

    /// Returns the whole value of `key`.
    fn get(&self, key: &[u8]) -> io::Result<Option<Vec<u8>>>;

    /// Replaces (or extends, with `append`) the value of `key`.
    fn put(&self, key: &[u8], data: &[u8], append: bool) -> io::Result<()>;

    /// Removes `key`. Returns whether it existed.
    fn remove(&self, key: &[u8]) -> io::Result<bool>;

    /// Returns whether `key` exists.
    fn contains(&self, key: &[u8]) -> io::Result<bool>;

    /// All keys in ascending byte order.
    fn keys(&self) -> io::Result<Vec<Vec<u8>>>;
}

fn copy_window(value: &[u8], offset: u64, out: &mut [u8]) {
    let start = usize::try_from(offset).unwrap_or(usize::MAX).min(value.len());
    let n = out.len().min(value.len() - start);
    out[..n].copy_from_slice(&value[start..start + n]);
}

/// In-memory medium.
#[derive(Debug, Default)]
pub struct MemMedia {
    values: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemMedia {
    /// Creates an empty medium.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the value of `key`, replacing any previous value.
    pub fn insert(&self, key: &[u8], value: Vec<u8>) {
        self.values.lock().insert(key.to_vec(), value);
    }

    /// Current value of `key`.
    pub fn value(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.values.lock().get(key).cloned()
    }
}

impl KvMedia for MemMedia {
    fn read_at(&self, key: &[u8], offset: u64, out: &mut [u8]) -> io::Result<Option<u64>> {
        let values = self.values.lock();
        Ok(values.get(key).map(|value| {
            copy_window(value, offset, out);
            value.len() as u64
        }))
    }

    fn get(&self, key: &[u8]) -> io::Result<Option<Vec<u8>>> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn put(&self, key: &[u8], data: &[u8], append: bool) -> io::Result<()> {
        let mut values = self.values.lock();
        let value = values.entry(key.to_vec()).or_default();
        if !append {
            value.clear();
        }
        value.extend_from_slice(data);
        Ok(())
    }

    fn remove(&self, key: &[u8]) -> io::Result<bool> {
        Ok(self.values.lock().remove(key).is_some())
    }

    fn contains(&self, key: &[u8]) -> io::Result<bool> {
        Ok(self.values.lock().contains_key(key))
    }

    fn keys(&self) -> io::Result<Vec<Vec<u8>>> {
        Ok(self.values.lock().keys().cloned().collect())
    }
}

/// Directory-backed medium: one file per key, named by the hex-encoded key.
#[derive(Debug, Clone)]
pub struct DirMedia {
    dir: PathBuf,
}

impl DirMedia {
    /// Uses `dir` as the key directory. The directory must exist.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Key directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_of(&self, key: &[u8]) -> PathBuf {
        self.dir.join(hex::encode(key))
    }

    fn open_existing(&self, key: &[u8]) -> io::Result<Option<File>> {
        match File::open(self.path_of(key)) {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl KvMedia for DirMedia {
    fn read_at(&self, key: &[u8], offset: u64, out: &mut [u8]) -> io::Result<Option<u64>> {
        let Some(mut file) = self.open_existing(key)? else {
            return Ok(None);
        };
        let total = file.metadata()?.len();
        if offset < total {
            file.seek(SeekFrom::Start(offset))?;
            let want = out.len().min((total - offset) as usize);
            file.read_exact(&mut out[..want])?;
        }
        Ok(Some(total))
    }

    fn get(&self, key: &[u8]) -> io::Result<Option<Vec<u8>>> {
        let Some(mut file) = self.open_existing(key)? else {
            return Ok(None);
        };
        let mut value = Vec::new();
        file.read_to_end(&mut value)?;
        Ok(Some(value))
    }

    fn put(&self, key: &[u8], data: &[u8], append: bool) -> io::Result<()> {
        let path = self.path_of(key);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&path)?;
        file.write_all(data)?;
        debug!("Stored {} bytes in {} (append={})", data.len(), path.display(), append);
        Ok(())
    }

    fn remove(&self, key: &[u8]) -> io::Result<bool> {
        match fs::remove_file(self.path_of(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn contains(&self, key: &[u8]) -> io::Result<bool> {
        Ok(self.path_of(key).is_file())
    }

    fn keys(&self) -> io::Result<Vec<Vec<u8>>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            // Marker files and anything else that is not a hex key are skipped.
            if let Some(key) = entry.file_name().to_str().and_then(|n| hex::decode(n).ok()) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}
