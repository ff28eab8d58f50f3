//! User-space stand-ins for direct kernel mapping of FAM.
//!
//! The shadow layer owns two things: a process-local cache of opened shelves
//! (reachable by name and by every live handle), and the translation from a
//! shelf-relative byte offset to the flat physical space.  Three backends
//! consume the translation: one file per shelf ([`dir`]), one big file over
//! the whole NVM span ([`flat`]), and an mmapped PCI region with real
//! aperture faulting ([`ivshmem`]).
//!
//! Flat-space rule: concatenate every IG's *actual* book span in ascending
//! IG order.  Holes in LZA space collapse; the flat space is exactly
//! `nvm_bytes_total` long.

pub mod dir;
pub mod flat;
pub mod ivshmem;

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use thiserror::Error;

use crate::books::{lza_book_num, lza_ig, Bos, Shelf};
use crate::desc::DescError;
use crate::topology::Topology;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ShadowError {
    #[error("I/O on the shadow backing failed")]
    Io(#[from] std::io::Error),
    #[error("{0} is not a directory")]
    NotADirectory(String),
    #[error("{0} is not writeable")]
    NotWriteable(String),
    #[error("{0} is not a regular file")]
    NotAFile(String),
    #[error("shadow file {path} holds {have} bytes, NVM needs {need}")]
    TooSmall { path: String, have: u64, need: u64 },
    #[error("{0} lacks owner read/write permission")]
    BadMode(String),
    #[error("locking the shadow file failed")]
    Lock(#[source] std::io::Error),
    #[error("shelf \"{0}\" is not open in this shadow")]
    UnknownShelf(String),
    #[error("offset {0} is past the last book of the shelf")]
    Eof(u64),
    #[error("no ivshmem device (1af4:1110) found")]
    NoIvshmem,
    #[error("mmap of the shadow region failed")]
    Mmap(#[source] std::io::Error),
    #[error(transparent)]
    Desc(#[from] DescError),
}

/// Translate a shelf-relative offset to a flat-space offset.
///
/// `None` is EOF: the offset points past the shelf's last book.
pub fn shadow_offset(topology: &Topology, bos: &[Bos], offset: u64) -> Option<u64> {
    let book_size = topology.book_size_bytes();
    let row = bos.get((offset / book_size) as usize)?;
    let ig = lza_ig(row.book_id);
    let book_num = lza_book_num(row.book_id);
    Some(topology.ig_start(ig)? + book_num * book_size + offset % book_size)
}

/// Split a transfer into book-aligned spans of (shelf offset, length).
pub fn book_spans(book_size: u64, offset: u64, len: usize) -> Vec<(u64, usize)> {
    let mut spans = Vec::new();
    let mut at = offset;
    let mut remaining = len as u64;
    while remaining > 0 {
        let in_book = book_size - at % book_size;
        let chunk = in_book.min(remaining);
        spans.push((at, chunk as usize));
        at += chunk;
        remaining -= chunk;
    }
    spans
}

/// Cached view of one opened shelf, shared by all its handles.
#[derive(Debug)]
pub struct CachedShelf {
    pub shelf: Shelf,
    pub bos: Vec<Bos>,
    handles_by_pid: HashMap<u32, Vec<u64>>,
}

impl CachedShelf {
    pub fn handles_of(&self, pid: u32) -> &[u64] {
        self.handles_by_pid
            .get(&pid)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn handle_count(&self) -> usize {
        self.handles_by_pid.values().map(Vec::len).sum()
    }
}

/// What a (re)open did to existing mappings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReopenEffect {
    /// First open in this process: nothing was mapped.
    Fresh,
    /// The old BOS is a prefix of the new one; mappings stay valid.
    MappingsPreserved,
    /// The book run changed under the mappings; the caller must invalidate
    /// PTEs (a stub in single-node operation).
    PteInvalidationNeeded,
}

/// Process-local cache of opened shelves: one owned record per shelf,
/// indexed by name and weakly by every live handle.
#[derive(Default)]
pub struct ShelfCache {
    by_name: HashMap<String, Rc<RefCell<CachedShelf>>>,
    by_handle: HashMap<u64, Weak<RefCell<CachedShelf>>>,
}

impl ShelfCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an open (or re-open) and report what happened to mappings.
    pub fn open(&mut self, shelf: Shelf, bos: Vec<Bos>, handle: u64, pid: u32) -> ReopenEffect {
        if let Some(rc) = self.by_name.get(&shelf.name) {
            let mut entry = rc.borrow_mut();
            let unchanged = bos.len() >= entry.bos.len() && bos[..entry.bos.len()] == entry.bos;
            entry.shelf = shelf;
            entry.bos = bos;
            entry.handles_by_pid.entry(pid).or_default().push(handle);
            self.by_handle.insert(handle, Rc::downgrade(rc));
            if unchanged {
                ReopenEffect::MappingsPreserved
            } else {
                ReopenEffect::PteInvalidationNeeded
            }
        } else {
            let mut handles_by_pid = HashMap::new();
            handles_by_pid.insert(pid, vec![handle]);
            let rc = Rc::new(RefCell::new(CachedShelf {
                shelf,
                bos,
                handles_by_pid,
            }));
            self.by_handle.insert(handle, Rc::downgrade(&rc));
            let name = rc.borrow().shelf.name.clone();
            self.by_name.insert(name, rc);
            ReopenEffect::Fresh
        }
    }

    /// Drop one handle; the record goes away with its last handle.
    pub fn close(&mut self, handle: u64) -> Option<Rc<RefCell<CachedShelf>>> {
        let rc = self.by_handle.remove(&handle)?.upgrade()?;
        let empty = {
            let mut entry = rc.borrow_mut();
            for handles in entry.handles_by_pid.values_mut() {
                handles.retain(|h| *h != handle);
            }
            entry.handles_by_pid.retain(|_, v| !v.is_empty());
            entry.handles_by_pid.is_empty()
        };
        if empty {
            let name = rc.borrow().shelf.name.clone();
            self.by_name.remove(&name);
        }
        Some(rc)
    }

    /// Forget a shelf wholesale (unlink path).
    pub fn remove_name(&mut self, name: &str) {
        if let Some(rc) = self.by_name.remove(name) {
            let entry = rc.borrow();
            for handles in entry.handles_by_pid.values() {
                for handle in handles {
                    self.by_handle.remove(handle);
                }
            }
        }
    }

    pub fn get_by_name(&self, name: &str) -> Option<Rc<RefCell<CachedShelf>>> {
        self.by_name.get(name).cloned()
    }

    pub fn get_by_handle(&self, handle: u64) -> Option<Rc<RefCell<CachedShelf>>> {
        self.by_handle.get(&handle)?.upgrade()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

/// One shadow backing.  Reads that hit a translation failure mid-transfer
/// return the bytes moved so far; writes abort instead.
pub trait ShadowBackend {
    fn create(&mut self, shelf: &Shelf) -> Result<(), ShadowError>;
    fn open(&mut self, shelf: &Shelf) -> Result<(), ShadowError>;
    fn truncate(&mut self, shelf: &Shelf, length: u64) -> Result<(), ShadowError>;
    fn unlink(&mut self, shelf_name: &str) -> Result<(), ShadowError>;
    fn release(&mut self, shelf_name: &str) -> Result<(), ShadowError>;
    fn read(&mut self, entry: &CachedShelf, offset: u64, buf: &mut [u8])
        -> Result<usize, ShadowError>;
    fn write(&mut self, entry: &CachedShelf, offset: u64, data: &[u8])
        -> Result<usize, ShadowError>;
}

/// Which backing to stand up.
#[derive(Clone, Debug)]
pub enum ShadowSpec {
    /// One regular file per shelf under this directory.
    Directory(std::path::PathBuf),
    /// A single pre-sized file covering the whole NVM span.
    FlatFile(std::path::PathBuf),
    /// The ivshmem PCI region, apertures and all.
    Ivshmem,
}

/// Probe and construct the configured backend.  A missing descriptor device
/// under [`ShadowSpec::Ivshmem`] is an error the caller should treat as
/// fatal.
pub fn open_shadow(
    spec: &ShadowSpec,
    topology: &Topology,
) -> Result<Box<dyn ShadowBackend>, ShadowError> {
    match spec {
        ShadowSpec::Directory(path) => Ok(Box::new(dir::ShadowDirectory::new(path)?)),
        ShadowSpec::FlatFile(path) => {
            Ok(Box::new(flat::ShadowFlatFile::open(path, topology)?))
        }
        ShadowSpec::Ivshmem => Ok(Box::new(ivshmem::ShadowIvshmem::probe(topology)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topo_two_igs() -> Topology {
        // books_per_IG = {0: 3, 1: 2}, book_size = 1 MiB
        Topology::from_json(r#"{ "bookSize": "1M", "booksPerIG": { "0": 3, "1": 2 } }"#)
            .unwrap()
    }

    fn bos_row(seq_num: u64, ig: u8, book_num: u64) -> Bos {
        Bos {
            shelf_id: 1,
            book_id: crate::books::lza(ig, book_num),
            seq_num,
        }
    }

    fn shelf(name: &str, size_bytes: u64, book_count: u64) -> Shelf {
        Shelf {
            id: 1,
            name: name.to_string(),
            size_bytes,
            book_count,
            open_count: 0,
            ctime: 0,
            mtime: 0,
        }
    }

    #[test]
    fn translator_flat_placement() {
        let topo = topo_two_igs();
        const MIB: u64 = 1 << 20;
        // shelf of two books: (ig=1, bn=0) then (ig=0, bn=2)
        let bos = vec![bos_row(1, 1, 0), bos_row(2, 0, 2)];

        // IG 1 starts after IG 0's three books
        assert_eq!(shadow_offset(&topo, &bos, 0), Some(3 * MIB));
        // second book lands inside IG 0, book number 2
        assert_eq!(shadow_offset(&topo, &bos, MIB + 16), Some(2 * MIB + 16));
        // one byte shy of the boundary stays in book one
        assert_eq!(shadow_offset(&topo, &bos, MIB - 1), Some(4 * MIB - 1));
        // past the last book: EOF
        assert_eq!(shadow_offset(&topo, &bos, 2 * MIB), None);

        // every reachable offset stays inside the NVM span
        for off in [0, 1, MIB - 1, MIB, MIB + 16, 2 * MIB - 1] {
            let flat = shadow_offset(&topo, &bos, off).unwrap();
            assert!(flat < topo.nvm_bytes_total());
        }
    }

    #[test]
    fn spans_split_on_book_boundaries() {
        const MIB: u64 = 1 << 20;
        assert_eq!(book_spans(MIB, 0, 10), vec![(0, 10)]);
        assert_eq!(
            book_spans(MIB, MIB - 3, 10),
            vec![(MIB - 3, 3), (MIB, 7)]
        );
        let three_books = book_spans(MIB, MIB - 1, (2 * MIB + 2) as usize);
        assert_eq!(
            three_books,
            vec![
                (MIB - 1, 1),
                (MIB, MIB as usize),
                (2 * MIB, MIB as usize),
                (3 * MIB, 1),
            ]
        );
        assert!(book_spans(MIB, 5, 0).is_empty());
    }

    #[test]
    fn cache_indexes_by_name_and_handle() {
        let mut cache = ShelfCache::new();
        let bos = vec![bos_row(1, 0, 0)];
        let effect = cache.open(shelf("xyzzy", 1 << 20, 1), bos.clone(), 10, 100);
        assert_eq!(effect, ReopenEffect::Fresh);
        let effect = cache.open(shelf("xyzzy", 1 << 20, 1), bos, 11, 101);
        assert_eq!(effect, ReopenEffect::MappingsPreserved);

        // both handles resolve to the one record
        let by_name = cache.get_by_name("xyzzy").unwrap();
        let by_handle = cache.get_by_handle(11).unwrap();
        assert!(Rc::ptr_eq(&by_name, &by_handle));
        assert_eq!(by_name.borrow().handle_count(), 2);
        assert_eq!(by_name.borrow().handles_of(100), &[10]);

        cache.close(10).unwrap();
        assert!(cache.get_by_handle(10).is_none());
        assert!(cache.get_by_name("xyzzy").is_some());
        cache.close(11).unwrap();
        assert!(cache.get_by_name("xyzzy").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn reopen_after_growth_keeps_mappings() {
        let mut cache = ShelfCache::new();
        let old = vec![bos_row(1, 0, 0), bos_row(2, 0, 1)];
        cache.open(shelf("s", 2 << 20, 2), old.clone(), 1, 50);

        // grown: old run is a prefix
        let mut grown = old.clone();
        grown.push(bos_row(3, 1, 0));
        let effect = cache.open(shelf("s", 3 << 20, 3), grown, 2, 50);
        assert_eq!(effect, ReopenEffect::MappingsPreserved);

        // replaced books under the same length: invalidate
        let swapped = vec![bos_row(1, 0, 0), bos_row(2, 1, 1), bos_row(3, 1, 0)];
        let effect = cache.open(shelf("s", 3 << 20, 3), swapped, 3, 50);
        assert_eq!(effect, ReopenEffect::PteInvalidationNeeded);

        // shrink also invalidates: mappings past the end are stale
        let shrunk = vec![bos_row(1, 0, 0)];
        let effect = cache.open(shelf("s", 1 << 20, 1), shrunk, 4, 50);
        assert_eq!(effect, ReopenEffect::PteInvalidationNeeded);
    }

    #[test]
    fn remove_name_drops_all_handles() {
        let mut cache = ShelfCache::new();
        cache.open(shelf("s", 0, 0), Vec::new(), 1, 50);
        cache.open(shelf("s", 0, 0), Vec::new(), 2, 51);
        cache.remove_name("s");
        assert!(cache.get_by_handle(1).is_none());
        assert!(cache.get_by_handle(2).is_none());
        assert!(cache.is_empty());
    }
}
