// SPDX-License-Identifier: LGPL-2.1

//! Abstract block-storage capability.
//!
//! The pipeline never touches the host filesystem directly; it consumes a
//! mapping from flat UTF-8 filenames to byte-addressable files. Opening for
//! write truncates, writes past end-of-file extend the file, and there is no
//! atomic rename; stages that need in-place replacement copy over a temp
//! file instead.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::Result;

/// An open file handle on external storage.
pub trait StorageFile {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
  fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
  fn seek(&mut self, pos: u64) -> io::Result<()>;
  fn size(&mut self) -> io::Result<u64>;
  fn flush(&mut self) -> io::Result<()>;

  /// Read exactly `buf.len()` bytes; a short read is an error.
  fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
    let mut done = 0;
    while done < buf.len() {
      let n = self.read(&mut buf[done..])?;
      if n == 0 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short read from storage"));
      }
      done += n;
    }
    Ok(())
  }

  /// Write all of `buf`; a short write is an error.
  fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
    let mut done = 0;
    while done < buf.len() {
      let n = self.write(&buf[done..])?;
      if n == 0 {
        return Err(io::Error::new(io::ErrorKind::WriteZero, "short write to storage"));
      }
      done += n;
    }
    Ok(())
  }

  fn read_exact_at(&mut self, pos: u64, buf: &mut [u8]) -> io::Result<()> {
    self.seek(pos)?;
    self.read_exact(buf)
  }

  fn write_all_at(&mut self, pos: u64, buf: &[u8]) -> io::Result<()> {
    self.seek(pos)?;
    self.write_all(buf)
  }
}

/// A filesystem that produces owned file handles.
pub trait FileSystem {
  type File: StorageFile;

  /// Open an existing file for reading.
  fn open_read(&self, name: &str) -> io::Result<Self::File>;

  /// Create (or truncate) a file for writing. Seeking and reading back are
  /// permitted on the returned handle.
  fn open_write(&self, name: &str) -> io::Result<Self::File>;

  /// Open a file read-write without truncation, creating it if absent.
  fn open_rw(&self, name: &str) -> io::Result<Self::File>;

  /// Delete a file. Removing a file that does not exist is not an error.
  fn remove(&self, name: &str) -> io::Result<()>;

  fn exists(&self, name: &str) -> bool;
}

/// Host implementation over `std::fs`, rooted at a directory.
pub struct HostFileSystem {
  root: PathBuf,
}

impl HostFileSystem {
  pub fn new<P: AsRef<Path>>(root: P) -> io::Result<Self> {
    std::fs::create_dir_all(root.as_ref())?;
    Ok(Self { root: root.as_ref().to_path_buf() })
  }

  fn resolve(&self, name: &str) -> io::Result<PathBuf> {
    if name.is_empty() || name.contains(['/', '\\']) {
      return Err(io::Error::new(io::ErrorKind::InvalidInput, format!("invalid storage filename: {:?}", name)));
    }
    Ok(self.root.join(name))
  }

  /// Names of all files currently present, sorted. Used by tests to audit
  /// temp-file cleanup.
  pub fn list(&self) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(&self.root)? {
      let entry = entry?;
      if entry.file_type()?.is_file() {
        names.push(entry.file_name().to_string_lossy().into_owned());
      }
    }
    names.sort();
    Ok(names)
  }
}

pub struct HostFile {
  inner: File,
}

impl StorageFile for HostFile {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    self.inner.read(buf)
  }

  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    self.inner.write(buf)
  }

  fn seek(&mut self, pos: u64) -> io::Result<()> {
    self.inner.seek(SeekFrom::Start(pos)).map(|_| ())
  }

  fn size(&mut self) -> io::Result<u64> {
    self.inner.metadata().map(|m| m.len())
  }

  fn flush(&mut self) -> io::Result<()> {
    self.inner.flush()
  }
}

impl FileSystem for HostFileSystem {
  type File = HostFile;

  fn open_read(&self, name: &str) -> io::Result<HostFile> {
    Ok(HostFile {
      inner: OpenOptions::new().read(true).open(self.resolve(name)?)?,
    })
  }

  fn open_write(&self, name: &str) -> io::Result<HostFile> {
    Ok(HostFile {
      inner: OpenOptions::new().read(true).write(true).create(true).truncate(true).open(self.resolve(name)?)?,
    })
  }

  fn open_rw(&self, name: &str) -> io::Result<HostFile> {
    Ok(HostFile {
      inner: OpenOptions::new().read(true).write(true).create(true).open(self.resolve(name)?)?,
    })
  }

  fn remove(&self, name: &str) -> io::Result<()> {
    match std::fs::remove_file(self.resolve(name)?) {
      Ok(()) => Ok(()),
      Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
      Err(err) => Err(err),
    }
  }

  fn exists(&self, name: &str) -> bool {
    self.resolve(name).map(|p| p.is_file()).unwrap_or(false)
  }
}

/// Copy `src` over `dst` in 4 KB chunks, returning the byte count.
pub fn copy_file<F: FileSystem>(fs: &F, src: &str, dst: &str) -> Result<u64> {
  let mut input = fs.open_read(src)?;
  let mut output = fs.open_write(dst)?;
  let mut chunk = [0u8; 4096];
  let mut total = 0u64;
  loop {
    let n = input.read(&mut chunk)?;
    if n == 0 {
      break;
    }
    output.write_all(&chunk[..n])?;
    total += n as u64;
  }
  output.flush()?;
  Ok(total)
}

/// Removes its registered files on drop unless disarmed. Centralizes the
/// cleanup that must run on every failure path of a stage.
pub struct TempFileGuard<'a, F: FileSystem> {
  fs: &'a F,
  names: Vec<String>,
  armed: bool,
}

impl<'a, F: FileSystem> TempFileGuard<'a, F> {
  pub fn new(fs: &'a F) -> Self {
    Self { fs, names: Vec::new(), armed: true }
  }

  pub fn push(&mut self, name: &str) {
    self.names.push(name.to_string());
  }

  /// Keep the registered files (success path).
  pub fn disarm(mut self) {
    self.armed = false;
  }
}

impl<F: FileSystem> Drop for TempFileGuard<'_, F> {
  fn drop(&mut self) {
    if self.armed {
      for name in &self.names {
        let _ = self.fs.remove(name);
      }
    }
  }
}
