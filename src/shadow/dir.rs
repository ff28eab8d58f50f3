//! Shadow backend: one regular host file per shelf.
//!
//! The files live in the filesystem of whatever runs the FUSE daemon (on a
//! VM, the VM's disk image).  Offsets pass straight through; the flat-space
//! translation is not involved.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use log::info;

use super::{CachedShelf, ShadowBackend, ShadowError};
use crate::books::Shelf;

pub struct ShadowDirectory {
    dir: PathBuf,
    files: HashMap<String, File>,
}

impl ShadowDirectory {
    /// Probe the directory for existence and writability up front; a broken
    /// shadow dir should stop the daemon at startup, not at first write.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, ShadowError> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.is_dir() {
            return Err(ShadowError::NotADirectory(dir.display().to_string()));
        }
        let probe = dir.join(format!(".lfs_probe_{}", std::process::id()));
        match File::create(&probe) {
            Ok(_) => {
                let _ = std::fs::remove_file(&probe);
            }
            Err(_) => {
                return Err(ShadowError::NotWriteable(dir.display().to_string()));
            }
        }
        info!("shadow directory at {}", dir.display());
        Ok(Self {
            dir,
            files: HashMap::new(),
        })
    }

    fn shadow_path(&self, shelf_name: &str) -> PathBuf {
        self.dir.join(shelf_name)
    }

    fn open_common(&mut self, shelf: &Shelf, create: bool) -> Result<(), ShadowError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(self.shadow_path(&shelf.name))?;
        self.files.insert(shelf.name.clone(), file);
        Ok(())
    }

    fn file_of(&self, shelf_name: &str) -> Result<&File, ShadowError> {
        self.files
            .get(shelf_name)
            .ok_or_else(|| ShadowError::UnknownShelf(shelf_name.to_string()))
    }
}

impl ShadowBackend for ShadowDirectory {
    fn create(&mut self, shelf: &Shelf) -> Result<(), ShadowError> {
        self.open_common(shelf, true)
    }

    fn open(&mut self, shelf: &Shelf) -> Result<(), ShadowError> {
        self.open_common(shelf, false)
    }

    fn truncate(&mut self, shelf: &Shelf, length: u64) -> Result<(), ShadowError> {
        match self.files.get(&shelf.name) {
            Some(file) => file.set_len(length)?,
            // not open here: go through the path
            None => {
                let file = OpenOptions::new()
                    .write(true)
                    .open(self.shadow_path(&shelf.name))?;
                file.set_len(length)?;
            }
        }
        Ok(())
    }

    fn unlink(&mut self, shelf_name: &str) -> Result<(), ShadowError> {
        self.files.remove(shelf_name);
        match std::fs::remove_file(self.shadow_path(shelf_name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn release(&mut self, shelf_name: &str) -> Result<(), ShadowError> {
        self.files.remove(shelf_name);
        Ok(())
    }

    fn read(
        &mut self,
        entry: &CachedShelf,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, ShadowError> {
        Ok(self.file_of(&entry.shelf.name)?.read_at(buf, offset)?)
    }

    fn write(
        &mut self,
        entry: &CachedShelf,
        offset: u64,
        data: &[u8],
    ) -> Result<usize, ShadowError> {
        Ok(self.file_of(&entry.shelf.name)?.write_at(data, offset)?)
    }
}
