use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use log::debug;

use crate::torrent::FileEntry;

/// Byte-addressed access to the torrent's files, by file index.
pub trait Backend: Send {
    /// Fills `buf` from `file` starting at `offset`. Reading bytes that were never written
    /// is an error.
    fn read_at(&mut self, file: usize, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Writes `data` into `file` at `offset`, growing the file if needed.
    fn write_at(&mut self, file: usize, offset: u64, data: &[u8]) -> io::Result<()>;
}

/// One file per entry under `root`. Files and parent directories are created on first write
/// and grow only as far as data is written to them.
pub struct FileBackend {
    paths: Vec<PathBuf>,
    handles: HashMap<usize, File>,
}

impl FileBackend {
    pub fn new(root: impl Into<PathBuf>, files: &[FileEntry]) -> Self {
        let root = root.into();
        Self {
            paths: files.iter().map(|file| root.join(&file.path)).collect(),
            handles: HashMap::new(),
        }
    }

    fn handle(&mut self, file: usize) -> io::Result<&mut File> {
        if !self.handles.contains_key(&file) {
            let path = self
                .paths
                .get(file)
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "invalid file index"))?;
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            debug!("opening {}", path.display());
            let handle = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)?;
            self.handles.insert(file, handle);
        }
        self.handles
            .get_mut(&file)
            .ok_or_else(|| io::Error::other("file handle missing"))
    }
}

impl Backend for FileBackend {
    fn read_at(&mut self, file: usize, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let handle = self.handle(file)?;
        handle.seek(SeekFrom::Start(offset))?;
        handle.read_exact(buf)
    }

    fn write_at(&mut self, file: usize, offset: u64, data: &[u8]) -> io::Result<()> {
        let handle = self.handle(file)?;
        handle.seek(SeekFrom::Start(offset))?;
        handle.write_all(data)?;
        handle.flush()
    }
}

/// In-memory files. Clones share the same contents, so a test can keep a handle to inspect
/// what the engine stored.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    files: Arc<Mutex<HashMap<usize, Vec<u8>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current contents of `file`, empty if nothing was written to it.
    pub fn contents(&self, file: usize) -> Vec<u8> {
        self.files
            .lock()
            .map(|files| files.get(&file).cloned().unwrap_or_default())
            .unwrap_or_default()
    }
}

impl Backend for MemoryBackend {
    fn read_at(&mut self, file: usize, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let files = self
            .files
            .lock()
            .map_err(|_| io::Error::other("memory backend poisoned"))?;
        let start = offset as usize;
        let data = files
            .get(&file)
            .and_then(|data| data.get(start..start + buf.len()))
            .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
        buf.copy_from_slice(data);
        Ok(())
    }

    fn write_at(&mut self, file: usize, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut files = self
            .files
            .lock()
            .map_err(|_| io::Error::other("memory backend poisoned"))?;
        let contents = files.entry(file).or_default();
        let start = offset as usize;
        let end = start + data.len();
        if contents.len() < end {
            contents.resize(end, 0);
        }
        contents[start..end].copy_from_slice(data);
        Ok(())
    }
}
