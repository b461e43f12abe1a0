//! Filesystem capability consumed by the KV layer and the sorters.
//!
//! All disk access in the engine goes through [`FileSystem`] so tests and
//! embedders can substitute their own byte-stream provider. [`LocalFs`]
//! is the buffered local-disk implementation; [`FsPath`] bundles a
//! filesystem with a path so the two travel together.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::Result;
use crate::io::{ReadCloser, Reader, WriteCloser, Writer};

/// Metadata for a directory child or a stat target.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
}

/// Capability for creating, opening, listing and deleting byte streams.
pub trait FileSystem: Send + Sync {
    /// Creates (truncating) a buffered byte sink with an explicit close.
    fn create(&self, path: &Path) -> Result<Box<dyn WriteCloser + Send>>;

    /// Opens a byte source supporting `read`, `read_byte` and `skip`.
    fn open(&self, path: &Path) -> Result<Box<dyn ReadCloser + Send>>;

    /// Makes the directory and any missing parents.
    fn mkdir(&self, path: &Path) -> Result<()>;

    /// Lists immediate children sorted by name.
    fn read_dir(&self, path: &Path) -> Result<Vec<FileInfo>>;

    fn stat(&self, path: &Path) -> Result<FileInfo>;

    /// Removes a file or a directory tree. A missing path is not an
    /// error.
    fn remove(&self, path: &Path) -> Result<()>;
}

struct FileWriter {
    inner: BufWriter<File>,
}

impl Writer for FileWriter {
    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.inner.write_all(buf)?;
        Ok(())
    }
}

impl WriteCloser for FileWriter {
    fn close(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }
}

struct FileReader {
    inner: BufReader<File>,
}

impl Reader for FileReader {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(std::io::Read::read(&mut self.inner, buf)?)
    }

    fn read_byte(&mut self) -> Result<u8> {
        let avail = self.inner.fill_buf()?;
        match avail.first() {
            Some(&b) => {
                self.inner.consume(1);
                Ok(b)
            }
            None => Err(crate::error::Error::Eof),
        }
    }

    fn skip(&mut self, n: u64) -> Result<u64> {
        let mut left = n;
        while left > 0 {
            let avail = self.inner.fill_buf()?;
            if avail.is_empty() {
                break;
            }
            let take = (avail.len() as u64).min(left);
            self.inner.consume(take as usize);
            left -= take;
        }
        Ok(n - left)
    }
}

impl ReadCloser for FileReader {
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// The local disk, with buffered readers and writers.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFs;

impl FileSystem for LocalFs {
    fn create(&self, path: &Path) -> Result<Box<dyn WriteCloser + Send>> {
        let file = File::create(path)?;
        Ok(Box::new(FileWriter { inner: BufWriter::new(file) }))
    }

    fn open(&self, path: &Path) -> Result<Box<dyn ReadCloser + Send>> {
        let file = File::open(path)?;
        Ok(Box::new(FileReader { inner: BufReader::new(file) }))
    }

    fn mkdir(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)?;
        Ok(())
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<FileInfo>> {
        let mut infos = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            infos.push(FileInfo {
                name: entry.file_name().to_string_lossy().into_owned(),
                size: meta.len(),
                is_dir: meta.is_dir(),
            });
        }
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(infos)
    }

    fn stat(&self, path: &Path) -> Result<FileInfo> {
        let meta = fs::metadata(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(FileInfo { name, size: meta.len(), is_dir: meta.is_dir() })
    }

    fn remove(&self, path: &Path) -> Result<()> {
        let res = match fs::metadata(path) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
            Ok(_) => fs::remove_file(path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        match res {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => Ok(other?),
        }
    }
}

/// A [`FileSystem`] paired with a path on it.
#[derive(Clone)]
pub struct FsPath {
    pub fs: Arc<dyn FileSystem>,
    pub path: PathBuf,
}

impl std::fmt::Debug for FsPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsPath").field("path", &self.path).finish()
    }
}

impl FsPath {
    pub fn new(fs: Arc<dyn FileSystem>, path: impl Into<PathBuf>) -> Self {
        FsPath { fs, path: path.into() }
    }

    /// An [`FsPath`] on the local disk.
    pub fn local(path: impl Into<PathBuf>) -> Self {
        FsPath::new(Arc::new(LocalFs), path)
    }

    /// Same filesystem, path extended with `sub`.
    pub fn join(&self, sub: impl AsRef<Path>) -> Self {
        FsPath { fs: Arc::clone(&self.fs), path: self.path.join(sub) }
    }

    pub fn create(&self) -> Result<Box<dyn WriteCloser + Send>> {
        self.fs.create(&self.path)
    }

    pub fn open(&self) -> Result<Box<dyn ReadCloser + Send>> {
        self.fs.open(&self.path)
    }

    pub fn mkdir(&self) -> Result<()> {
        self.fs.mkdir(&self.path)
    }

    pub fn read_dir(&self) -> Result<Vec<FileInfo>> {
        self.fs.read_dir(&self.path)
    }

    pub fn stat(&self) -> Result<FileInfo> {
        self.fs.stat(&self.path)
    }

    pub fn remove(&self) -> Result<()> {
        self.fs.remove(&self.path)
    }
}
