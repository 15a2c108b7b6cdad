//! Locked access to documents shared between processes.
//!
//! Readers take a shared lock and never create the file. Writers hold a
//! process-wide mutex and try for an exclusive lock without blocking; a writer
//! that loses the race gives up and lets the next reconciliation write instead.

use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions, TryLockError};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;

static WRITER: Mutex<()> = Mutex::new(());

#[derive(Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// Another writer held the file.
    Contended,
}

/// Reads `path` under a shared lock. Returns `Ok(None)` when the file does not exist.
pub fn read_shared<T, E, F>(path: &Path, read: F) -> Result<Option<T>, E>
where
    F: FnOnce(BufReader<&File>) -> Result<T, E>,
    E: From<io::Error>,
{
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    file.lock_shared()?;
    let result = read(BufReader::new(&file));
    file.unlock()?;

    result.map(Some)
}

/// Replaces the contents of `path` with the output of `update`, which receives
/// the current contents (`None` for a new or empty file). The read and the
/// rewrite happen under the same exclusive lock.
pub fn update_exclusive<E, F>(path: &Path, update: F) -> Result<WriteOutcome, E>
where
    F: FnOnce(Option<&[u8]>) -> Result<Vec<u8>, E>,
    E: From<io::Error>,
{
    let _guard = WRITER.lock();

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;

    match file.try_lock() {
        Ok(()) => {}
        Err(TryLockError::WouldBlock) => return Ok(WriteOutcome::Contended),
        Err(TryLockError::Error(e)) => return Err(e.into()),
    }

    let mut current = Vec::new();
    file.read_to_end(&mut current)?;
    let contents = update((!current.is_empty()).then_some(current.as_slice()))?;

    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&contents)?;
    file.flush()?;
    file.unlock()?;

    Ok(WriteOutcome::Written)
}
