//! Shadow backend: one pre-sized file covering the entire NVM span,
//! indexed by flat-space offset.
//!
//! Shelves don't exist as files here; every read and write is translated
//! book by book through [`super::shadow_offset`].  The file must already be
//! at least `nvm_bytes_total` long, a regular file, and private to the
//! owner, and it is locked exclusively so two daemons can't fight over it.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, PermissionsExt};
use std::path::Path;

use fs4::fs_std::FileExt as _;
use log::info;

use super::{book_spans, shadow_offset, CachedShelf, ShadowBackend, ShadowError};
use crate::books::Shelf;
use crate::topology::Topology;

pub struct ShadowFlatFile {
    file: File,
    topology: Topology,
}

impl ShadowFlatFile {
    pub fn open(path: impl AsRef<Path>, topology: &Topology) -> Result<Self, ShadowError> {
        let path = path.as_ref();
        let display = path.display().to_string();

        let meta = std::fs::metadata(path)?;
        if !meta.is_file() {
            return Err(ShadowError::NotAFile(display));
        }
        if meta.permissions().mode() & 0o600 != 0o600 {
            return Err(ShadowError::BadMode(display));
        }
        let need = topology.nvm_bytes_total();
        if meta.len() < need {
            return Err(ShadowError::TooSmall {
                path: display,
                have: meta.len(),
                need,
            });
        }

        let file = OpenOptions::new().read(true).write(true).open(path)?;
        file.try_lock_exclusive().map_err(ShadowError::Lock)?;
        info!("flat shadow file at {} ({} bytes)", path.display(), meta.len());
        Ok(Self {
            file,
            topology: topology.clone(),
        })
    }

    /// Run one transfer span by span; `op` moves the bytes for one
    /// translated span.  A translation miss ends a read short and fails a
    /// write, per the backend contract.
    fn transfer(
        &self,
        entry: &CachedShelf,
        offset: u64,
        len: usize,
        reading: bool,
        mut op: impl FnMut(&File, u64, u64, usize) -> Result<(), ShadowError>,
    ) -> Result<usize, ShadowError> {
        let mut moved = 0usize;
        for (span_off, span_len) in book_spans(self.topology.book_size_bytes(), offset, len) {
            let Some(flat) = shadow_offset(&self.topology, &entry.bos, span_off) else {
                if reading {
                    return Ok(moved);
                }
                return Err(ShadowError::Eof(span_off));
            };
            op(&self.file, span_off, flat, span_len)?;
            moved += span_len;
        }
        Ok(moved)
    }
}

impl ShadowBackend for ShadowFlatFile {
    // Shelf namespace operations have no per-shelf backing to manage.
    fn create(&mut self, _shelf: &Shelf) -> Result<(), ShadowError> {
        Ok(())
    }

    fn open(&mut self, _shelf: &Shelf) -> Result<(), ShadowError> {
        Ok(())
    }

    fn truncate(&mut self, _shelf: &Shelf, _length: u64) -> Result<(), ShadowError> {
        Ok(())
    }

    fn unlink(&mut self, _shelf_name: &str) -> Result<(), ShadowError> {
        Ok(())
    }

    fn release(&mut self, _shelf_name: &str) -> Result<(), ShadowError> {
        Ok(())
    }

    fn read(
        &mut self,
        entry: &CachedShelf,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, ShadowError> {
        let base = offset;
        self.transfer(entry, offset, buf.len(), true, |file, span_off, flat, len| {
            let at = (span_off - base) as usize;
            file.read_exact_at(&mut buf[at..at + len], flat)?;
            Ok(())
        })
    }

    fn write(
        &mut self,
        entry: &CachedShelf,
        offset: u64,
        data: &[u8],
    ) -> Result<usize, ShadowError> {
        let base = offset;
        self.transfer(entry, offset, data.len(), false, |file, span_off, flat, len| {
            let at = (span_off - base) as usize;
            file.write_all_at(&data[at..at + len], flat)?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::books::{lza, Bos};
    use std::collections::HashMap;
    use std::io::Write;

    const MIB: u64 = 1 << 20;

    fn topo() -> Topology {
        Topology::from_json(r#"{ "bookSize": "1M", "booksPerIG": { "0": 3, "1": 2 } }"#)
            .unwrap()
    }

    fn entry(bos: Vec<Bos>) -> CachedShelf {
        CachedShelf {
            shelf: Shelf {
                id: 1,
                name: "xyzzy".to_string(),
                size_bytes: bos.len() as u64 * MIB,
                book_count: bos.len() as u64,
                open_count: 1,
                ctime: 0,
                mtime: 0,
            },
            bos,
            handles_by_pid: HashMap::new(),
        }
    }

    fn bos_row(seq_num: u64, ig: u8, book_num: u64) -> Bos {
        Bos {
            shelf_id: 1,
            book_id: lza(ig, book_num),
            seq_num,
        }
    }

    fn sized_file(topo: &Topology) -> tempfile::NamedTempFile {
        let f = tempfile::NamedTempFile::new().unwrap();
        f.as_file().set_len(topo.nvm_bytes_total()).unwrap();
        let mut perms = f.as_file().metadata().unwrap().permissions();
        perms.set_mode(0o600);
        f.as_file().set_permissions(perms).unwrap();
        f
    }

    #[test]
    fn refuses_undersized_file() {
        let topo = topo();
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"tiny").unwrap();
        let mut perms = f.as_file().metadata().unwrap().permissions();
        perms.set_mode(0o600);
        f.as_file().set_permissions(perms).unwrap();
        assert!(matches!(
            ShadowFlatFile::open(f.path(), &topo),
            Err(ShadowError::TooSmall { .. })
        ));
    }

    #[test]
    fn writes_land_at_flat_offsets() {
        let topo = topo();
        let f = sized_file(&topo);
        let mut shadow = ShadowFlatFile::open(f.path(), &topo).unwrap();

        // two-book shelf: (ig=1, bn=0) then (ig=0, bn=2)
        let e = entry(vec![bos_row(1, 1, 0), bos_row(2, 0, 2)]);

        // a write spanning the book boundary splits into both books
        let at = MIB - 2;
        assert_eq!(shadow.write(&e, at, b"abcd").unwrap(), 4);

        let raw = std::fs::read(f.path()).unwrap();
        // first half: tail of flat book 3 (ig 1, bn 0)
        assert_eq!(&raw[(4 * MIB - 2) as usize..(4 * MIB) as usize], b"ab");
        // second half: head of flat book 2 (ig 0, bn 2)
        assert_eq!(&raw[(2 * MIB) as usize..(2 * MIB + 2) as usize], b"cd");

        let mut buf = [0u8; 4];
        assert_eq!(shadow.read(&e, at, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");
    }

    #[test]
    fn read_stops_at_eof_write_refuses() {
        let topo = topo();
        let f = sized_file(&topo);
        let mut shadow = ShadowFlatFile::open(f.path(), &topo).unwrap();
        let e = entry(vec![bos_row(1, 0, 0)]);

        // read straddling the last book: short count, no error
        let mut buf = vec![0u8; 64];
        let n = shadow.read(&e, MIB - 16, &mut buf).unwrap();
        assert_eq!(n, 16);
        // entirely past the end: zero bytes
        assert_eq!(shadow.read(&e, 2 * MIB, &mut buf).unwrap(), 0);

        // the same write aborts instead
        assert!(matches!(
            shadow.write(&e, MIB - 16, &[7u8; 64]),
            Err(ShadowError::Eof(_))
        ));
    }
}
