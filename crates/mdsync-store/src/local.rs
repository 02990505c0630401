use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use mdsync_types::ByteRange;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::traits::{AppendHandle, RangeStream, ReadFs, WriteFs};

/// Prefix `tempfile` gives the staging files written by `put`.
const TEMP_PREFIX: &str = ".tmp";

/// A store rooted at a local directory.
///
/// `put` writes a temporary file in the same directory and renames it over
/// the target, so readers see either the old or the new contents.
#[derive(Clone, Debug)]
pub struct LocalFs {
    dir: PathBuf,
}

impl LocalFs {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

fn read_optional(path: &Path) -> StoreResult<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl ReadFs for LocalFs {
    fn fetch(&self, names: &[String]) -> StoreResult<BTreeMap<String, Option<Vec<u8>>>> {
        names
            .iter()
            .map(|name| Ok((name.clone(), read_optional(&self.path(name))?)))
            .collect()
    }

    fn fetch_ranges<'a>(&'a self, name: &str, ranges: &[ByteRange]) -> StoreResult<RangeStream<'a>> {
        let mut sorted = ranges.to_vec();
        sorted.sort();
        if sorted.is_empty() {
            return Ok(Box::new(std::iter::empty()));
        }
        let mut file = File::open(self.path(name))?;
        Ok(Box::new(sorted.into_iter().map(move |range| -> StoreResult<(ByteRange, Vec<u8>)> {
            file.seek(SeekFrom::Start(range.offset))?;
            let mut buf = vec![0u8; range.length as usize];
            file.read_exact(&mut buf)?;
            Ok((range, buf))
        })))
    }

    fn exists(&self, name: &str) -> StoreResult<bool> {
        Ok(self.path(name).exists())
    }

    fn describe(&self) -> String {
        self.dir.display().to_string()
    }
}

impl WriteFs for LocalFs {
    fn open_append(&self, name: &str) -> StoreResult<Box<dyn AppendHandle>> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(name))?;
        Ok(Box::new(LocalAppender {
            writer: BufWriter::new(file),
        }))
    }

    fn size(&self, name: &str) -> StoreResult<u64> {
        match fs::metadata(self.path(name)) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, files: &[(String, Vec<u8>)]) -> StoreResult<()> {
        for (name, data) in files {
            let mut tmp = NamedTempFile::new_in(&self.dir)?;
            tmp.write_all(data)?;
            tmp.as_file().sync_all()?;
            tmp.persist(self.path(name)).map_err(|e| StoreError::Io(e.error))?;
        }
        debug!(dir = %self.dir.display(), files = files.len(), "put");
        Ok(())
    }

    fn rollback_interrupted_puts(&self, _names: &[String]) -> StoreResult<()> {
        // Renames are atomic here; only orphaned staging files can be left.
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(TEMP_PREFIX) && entry.file_type()?.is_file() {
                warn!(file = %entry.path().display(), "removing orphaned staging file");
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    fn mkdir(&self, name: &str) -> StoreResult<bool> {
        match fs::create_dir(self.path(name)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn rmdir(&self, name: &str) -> StoreResult<()> {
        fs::remove_dir(self.path(name))?;
        Ok(())
    }

    fn ensure_dir_exists(&self) -> StoreResult<()> {
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }
}

struct LocalAppender {
    writer: BufWriter<File>,
}

impl AppendHandle for LocalAppender {
    fn write_all(&mut self, data: &[u8]) -> StoreResult<()> {
        self.writer.write_all(data)?;
        Ok(())
    }

    fn flush(&mut self) -> StoreResult<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }
}
