//! The metadata store contract and its transactional in-memory
//! implementation.
//!
//! Every multi-row change made by one engine command happens inside one
//! transaction bracketed by [`MetadataStore::commit`] /
//! [`MetadataStore::rollback`].  [`MemStore`] implements that with an undo
//! journal: each mutation records its inverse, commit truncates the journal,
//! rollback replays it backwards.  Reads always see uncommitted writes.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::books::{Book, BookState, Bos, OpenedShelf, Shelf};
use crate::error::EngineError;
use crate::proto::Context;
use crate::topology::Topology;
use crate::LIBRARIAN_VERSION;

/// Read-only globals served by `version` / `get_fs_stats`.
#[derive(Clone, Debug, Serialize)]
pub struct LfsGlobals {
    pub book_size_bytes: u64,
    pub nvm_bytes_total: u64,
    pub books_total: u64,
    pub version: String,
}

/// Shelf lookup key: by unique name, or by stable id.
#[derive(Clone, Copy, Debug)]
pub enum ShelfMatch<'a> {
    Name(&'a str),
    Id(u64),
}

/// Row operations the librarian engine runs against.  A SQL-backed store
/// plugs in here; [`MemStore`] is the in-process implementation.
pub trait MetadataStore {
    fn get_globals(&mut self) -> Result<LfsGlobals, EngineError>;

    fn create_shelf(&mut self, name: &str, now: u64) -> Result<Shelf, EngineError>;
    fn get_shelf(&mut self, which: ShelfMatch<'_>) -> Result<Option<Shelf>, EngineError>;
    fn get_shelf_all(&mut self) -> Result<Vec<Shelf>, EngineError>;
    fn modify_shelf(&mut self, shelf: &Shelf) -> Result<(), EngineError>;
    fn delete_shelf(&mut self, shelf_id: u64) -> Result<(), EngineError>;

    /// FREE books filtered by interleave group, in LZA order.  With
    /// `exclude` the filter inverts: books whose IG is NOT in `igs` (so an
    /// empty `igs` plus `exclude` means "everything").  `limit: None`
    /// returns all matching rows, which random policies need for an honest
    /// shuffle.
    fn get_books_by_intlv_group(
        &mut self,
        limit: Option<usize>,
        igs: &[u8],
        exclude: bool,
        ascending: bool,
    ) -> Result<Vec<Book>, EngineError>;
    fn get_book_by_node(
        &mut self,
        node_id: u32,
        state: BookState,
        limit: Option<usize>,
    ) -> Result<Vec<Book>, EngineError>;
    fn get_book_by_id(&mut self, book_id: u64) -> Result<Option<Book>, EngineError>;
    fn modify_book(&mut self, book: &Book) -> Result<(), EngineError>;

    fn create_bos(&mut self, bos: Bos) -> Result<(), EngineError>;
    fn delete_bos(&mut self, bos: &Bos) -> Result<(), EngineError>;
    /// BOS rows for one shelf, ordered by seq_num.
    fn get_bos_by_shelf_id(&mut self, shelf_id: u64) -> Result<Vec<Bos>, EngineError>;

    fn get_xattr(&mut self, shelf_id: u64, name: &str) -> Result<Option<String>, EngineError>;
    fn list_xattrs(&mut self, shelf_id: u64) -> Result<Vec<String>, EngineError>;
    fn create_xattr(&mut self, shelf_id: u64, name: &str, value: &str)
        -> Result<(), EngineError>;
    fn modify_xattr(&mut self, shelf_id: u64, name: &str, value: &str)
        -> Result<(), EngineError>;
    fn delete_xattr(&mut self, shelf_id: u64, name: &str) -> Result<(), EngineError>;

    /// Record one open, returning a handle unique across live opens.
    fn open_handle(&mut self, shelf_id: u64, ctx: &Context) -> Result<u64, EngineError>;
    /// Remove one open.  `None` means nobody holds that handle.
    fn close_handle(&mut self, handle: u64) -> Result<Option<OpenedShelf>, EngineError>;
    fn open_count(&mut self, shelf_id: u64) -> Result<u32, EngineError>;

    fn commit(&mut self) -> Result<(), EngineError>;
    fn rollback(&mut self) -> Result<(), EngineError>;
}

/// Inverse of one mutation, replayed on rollback.
enum Undo {
    ShelfCreated(u64),
    ShelfModified(Shelf),
    ShelfDeleted(Shelf),
    BookModified(Book),
    BosCreated(Bos),
    BosDeleted(Bos),
    XattrCreated(u64, String),
    XattrModified(u64, String, String),
    XattrDeleted(u64, String, String),
    OpenCreated(u64),
    OpenDeleted(OpenedShelf),
}

/// In-memory metadata store.  Books are keyed by id, and since a book's id
/// is its LZA, map order is LZA order.
pub struct MemStore {
    globals: LfsGlobals,
    shelves: BTreeMap<u64, Shelf>,
    ids_by_name: HashMap<String, u64>,
    books: BTreeMap<u64, Book>,
    /// shelf_id -> rows kept sorted by seq_num.
    bos: BTreeMap<u64, Vec<Bos>>,
    xattrs: BTreeMap<(u64, String), String>,
    opened: BTreeMap<u64, OpenedShelf>,
    next_shelf_id: u64,
    next_handle: u64,
    journal: Vec<Undo>,
}

impl MemStore {
    /// Populate the book pool from the topology: every IG's books are
    /// created once, FREE, with id == LZA.
    pub fn new(topology: &Topology) -> Self {
        let book_size = topology.book_size_bytes();
        let mut books = BTreeMap::new();
        for ig in 0..topology.ig_count() as u8 {
            for num in 0..topology.books_in_ig(ig) {
                let book = Book::new(ig, num, book_size);
                books.insert(book.id, book);
            }
        }
        let globals = LfsGlobals {
            book_size_bytes: book_size,
            nvm_bytes_total: topology.nvm_bytes_total(),
            books_total: books.len() as u64,
            version: LIBRARIAN_VERSION.to_string(),
        };
        Self {
            globals,
            shelves: BTreeMap::new(),
            ids_by_name: HashMap::new(),
            books,
            bos: BTreeMap::new(),
            xattrs: BTreeMap::new(),
            opened: BTreeMap::new(),
            next_shelf_id: 1,
            next_handle: 1,
            journal: Vec::new(),
        }
    }

    fn book_rows(
        &self,
        keep: impl Fn(&Book) -> bool,
        limit: Option<usize>,
        ascending: bool,
    ) -> Vec<Book> {
        let limit = limit.unwrap_or(usize::MAX);
        let mut out = Vec::new();
        let mut push = |b: &Book| {
            if keep(b) && out.len() < limit {
                out.push(b.clone());
            }
        };
        if ascending {
            self.books.values().for_each(&mut push);
        } else {
            self.books.values().rev().for_each(&mut push);
        }
        out
    }
}

impl MetadataStore for MemStore {
    fn get_globals(&mut self) -> Result<LfsGlobals, EngineError> {
        Ok(self.globals.clone())
    }

    fn create_shelf(&mut self, name: &str, now: u64) -> Result<Shelf, EngineError> {
        if self.ids_by_name.contains_key(name) {
            return Err(EngineError::Store(format!(
                "shelf \"{name}\" already exists"
            )));
        }
        let shelf = Shelf {
            id: self.next_shelf_id,
            name: name.to_string(),
            size_bytes: 0,
            book_count: 0,
            open_count: 0,
            ctime: now,
            mtime: now,
        };
        self.next_shelf_id += 1;
        self.ids_by_name.insert(name.to_string(), shelf.id);
        self.shelves.insert(shelf.id, shelf.clone());
        self.journal.push(Undo::ShelfCreated(shelf.id));
        Ok(shelf)
    }

    fn get_shelf(&mut self, which: ShelfMatch<'_>) -> Result<Option<Shelf>, EngineError> {
        let id = match which {
            ShelfMatch::Id(id) => Some(id),
            ShelfMatch::Name(name) => self.ids_by_name.get(name).copied(),
        };
        Ok(id.and_then(|id| self.shelves.get(&id).cloned()))
    }

    fn get_shelf_all(&mut self) -> Result<Vec<Shelf>, EngineError> {
        Ok(self.shelves.values().cloned().collect())
    }

    fn modify_shelf(&mut self, shelf: &Shelf) -> Result<(), EngineError> {
        let slot = self
            .shelves
            .get_mut(&shelf.id)
            .ok_or_else(|| EngineError::Store(format!("modify of unknown shelf {}", shelf.id)))?;
        self.journal.push(Undo::ShelfModified(slot.clone()));
        *slot = shelf.clone();
        Ok(())
    }

    fn delete_shelf(&mut self, shelf_id: u64) -> Result<(), EngineError> {
        let shelf = self
            .shelves
            .remove(&shelf_id)
            .ok_or_else(|| EngineError::Store(format!("delete of unknown shelf {shelf_id}")))?;
        self.ids_by_name.remove(&shelf.name);
        self.journal.push(Undo::ShelfDeleted(shelf));
        Ok(())
    }

    fn get_books_by_intlv_group(
        &mut self,
        limit: Option<usize>,
        igs: &[u8],
        exclude: bool,
        ascending: bool,
    ) -> Result<Vec<Book>, EngineError> {
        Ok(self.book_rows(
            |b| b.state == BookState::Free && igs.contains(&b.intlv_group()) != exclude,
            limit,
            ascending,
        ))
    }

    fn get_book_by_node(
        &mut self,
        node_id: u32,
        state: BookState,
        limit: Option<usize>,
    ) -> Result<Vec<Book>, EngineError> {
        Ok(self.book_rows(|b| b.node_id == node_id && b.state == state, limit, true))
    }

    fn get_book_by_id(&mut self, book_id: u64) -> Result<Option<Book>, EngineError> {
        Ok(self.books.get(&book_id).cloned())
    }

    fn modify_book(&mut self, book: &Book) -> Result<(), EngineError> {
        let slot = self
            .books
            .get_mut(&book.id)
            .ok_or_else(|| EngineError::Store(format!("modify of unknown book {:#x}", book.id)))?;
        self.journal.push(Undo::BookModified(slot.clone()));
        *slot = book.clone();
        Ok(())
    }

    fn create_bos(&mut self, bos: Bos) -> Result<(), EngineError> {
        let rows = self.bos.entry(bos.shelf_id).or_default();
        rows.push(bos.clone());
        rows.sort_by_key(|r| r.seq_num);
        self.journal.push(Undo::BosCreated(bos));
        Ok(())
    }

    fn delete_bos(&mut self, bos: &Bos) -> Result<(), EngineError> {
        let rows = self
            .bos
            .get_mut(&bos.shelf_id)
            .ok_or_else(|| EngineError::Store(format!("no BOS for shelf {}", bos.shelf_id)))?;
        let at = rows
            .iter()
            .position(|r| r == bos)
            .ok_or_else(|| EngineError::Store("delete of unknown BOS row".to_string()))?;
        rows.remove(at);
        if rows.is_empty() {
            self.bos.remove(&bos.shelf_id);
        }
        self.journal.push(Undo::BosDeleted(bos.clone()));
        Ok(())
    }

    fn get_bos_by_shelf_id(&mut self, shelf_id: u64) -> Result<Vec<Bos>, EngineError> {
        Ok(self.bos.get(&shelf_id).cloned().unwrap_or_default())
    }

    fn get_xattr(&mut self, shelf_id: u64, name: &str) -> Result<Option<String>, EngineError> {
        Ok(self.xattrs.get(&(shelf_id, name.to_string())).cloned())
    }

    fn list_xattrs(&mut self, shelf_id: u64) -> Result<Vec<String>, EngineError> {
        Ok(self
            .xattrs
            .range((shelf_id, String::new())..(shelf_id + 1, String::new()))
            .map(|((_, name), _)| name.clone())
            .collect())
    }

    fn create_xattr(
        &mut self,
        shelf_id: u64,
        name: &str,
        value: &str,
    ) -> Result<(), EngineError> {
        let key = (shelf_id, name.to_string());
        if self.xattrs.contains_key(&key) {
            return Err(EngineError::Store(format!("xattr \"{name}\" already exists")));
        }
        self.xattrs.insert(key, value.to_string());
        self.journal
            .push(Undo::XattrCreated(shelf_id, name.to_string()));
        Ok(())
    }

    fn modify_xattr(
        &mut self,
        shelf_id: u64,
        name: &str,
        value: &str,
    ) -> Result<(), EngineError> {
        let slot = self
            .xattrs
            .get_mut(&(shelf_id, name.to_string()))
            .ok_or_else(|| EngineError::Store(format!("modify of unknown xattr \"{name}\"")))?;
        self.journal
            .push(Undo::XattrModified(shelf_id, name.to_string(), slot.clone()));
        *slot = value.to_string();
        Ok(())
    }

    fn delete_xattr(&mut self, shelf_id: u64, name: &str) -> Result<(), EngineError> {
        let prev = self
            .xattrs
            .remove(&(shelf_id, name.to_string()))
            .ok_or_else(|| EngineError::Store(format!("delete of unknown xattr \"{name}\"")))?;
        self.journal
            .push(Undo::XattrDeleted(shelf_id, name.to_string(), prev));
        Ok(())
    }

    fn open_handle(&mut self, shelf_id: u64, ctx: &Context) -> Result<u64, EngineError> {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.opened.insert(
            handle,
            OpenedShelf {
                handle,
                shelf_id,
                node_id: ctx.node_id,
                pid: ctx.pid,
                uid: ctx.uid,
                gid: ctx.gid,
            },
        );
        self.journal.push(Undo::OpenCreated(handle));
        Ok(handle)
    }

    fn close_handle(&mut self, handle: u64) -> Result<Option<OpenedShelf>, EngineError> {
        let row = self.opened.remove(&handle);
        if let Some(row) = &row {
            self.journal.push(Undo::OpenDeleted(row.clone()));
        }
        Ok(row)
    }

    fn open_count(&mut self, shelf_id: u64) -> Result<u32, EngineError> {
        Ok(self
            .opened
            .values()
            .filter(|o| o.shelf_id == shelf_id)
            .count() as u32)
    }

    fn commit(&mut self) -> Result<(), EngineError> {
        self.journal.clear();
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), EngineError> {
        while let Some(undo) = self.journal.pop() {
            match undo {
                Undo::ShelfCreated(id) => {
                    if let Some(shelf) = self.shelves.remove(&id) {
                        self.ids_by_name.remove(&shelf.name);
                    }
                }
                Undo::ShelfModified(prev) => {
                    self.shelves.insert(prev.id, prev);
                }
                Undo::ShelfDeleted(prev) => {
                    self.ids_by_name.insert(prev.name.clone(), prev.id);
                    self.shelves.insert(prev.id, prev);
                }
                Undo::BookModified(prev) => {
                    self.books.insert(prev.id, prev);
                }
                Undo::BosCreated(row) => {
                    if let Some(rows) = self.bos.get_mut(&row.shelf_id) {
                        rows.retain(|r| r != &row);
                        if rows.is_empty() {
                            self.bos.remove(&row.shelf_id);
                        }
                    }
                }
                Undo::BosDeleted(row) => {
                    let rows = self.bos.entry(row.shelf_id).or_default();
                    rows.push(row);
                    rows.sort_by_key(|r| r.seq_num);
                }
                Undo::XattrCreated(shelf_id, name) => {
                    self.xattrs.remove(&(shelf_id, name));
                }
                Undo::XattrModified(shelf_id, name, prev)
                | Undo::XattrDeleted(shelf_id, name, prev) => {
                    self.xattrs.insert((shelf_id, name), prev);
                }
                Undo::OpenCreated(handle) => {
                    self.opened.remove(&handle);
                }
                Undo::OpenDeleted(row) => {
                    self.opened.insert(row.handle, row);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::books::lza;

    fn topo() -> Topology {
        Topology::from_json(
            r#"{ "bookSize": "1M", "booksPerIG": { "0": 4, "1": 3, "2": 2 } }"#,
        )
        .unwrap()
    }

    fn ctx() -> Context {
        Context {
            node_id: 1,
            uid: 0,
            gid: 0,
            pid: 42,
            umask: 0,
        }
    }

    #[test]
    fn globals_from_topology() {
        let mut s = MemStore::new(&topo());
        let g = s.get_globals().unwrap();
        assert_eq!(g.book_size_bytes, 1 << 20);
        assert_eq!(g.books_total, 9);
        assert_eq!(g.nvm_bytes_total, 9 << 20);
    }

    #[test]
    fn book_queries() {
        let mut s = MemStore::new(&topo());

        let ig1 = s
            .get_books_by_intlv_group(None, &[1], false, true)
            .unwrap();
        assert_eq!(ig1.len(), 3);
        assert!(ig1.iter().all(|b| b.intlv_group() == 1));
        assert!(ig1.windows(2).all(|w| w[0].id < w[1].id));

        let not_ig1 = s.get_books_by_intlv_group(None, &[1], true, true).unwrap();
        assert_eq!(not_ig1.len(), 6);

        let all_desc = s.get_books_by_intlv_group(None, &[], true, false).unwrap();
        assert_eq!(all_desc.len(), 9);
        assert!(all_desc.windows(2).all(|w| w[0].id > w[1].id));

        let two = s
            .get_books_by_intlv_group(Some(2), &[], true, true)
            .unwrap();
        assert_eq!(
            two.iter().map(|b| b.id).collect::<Vec<_>>(),
            vec![lza(0, 0), lza(0, 1)]
        );

        // marking a book IN_USE hides it from the free queries
        let mut b = s.get_book_by_id(lza(1, 0)).unwrap().unwrap();
        b.transition(BookState::InUse).unwrap();
        s.modify_book(&b).unwrap();
        assert_eq!(
            s.get_books_by_intlv_group(None, &[1], false, true)
                .unwrap()
                .len(),
            2
        );
        assert_eq!(
            s.get_book_by_node(2, BookState::InUse, None).unwrap().len(),
            1
        );
    }

    #[test]
    fn shelf_lifecycle_and_rollback() {
        let mut s = MemStore::new(&topo());
        let shelf = s.create_shelf("xyzzy", 1000).unwrap();
        s.commit().unwrap();

        // a whole failed command's worth of changes, then rollback
        let mut b = s.get_book_by_id(lza(0, 0)).unwrap().unwrap();
        b.transition(BookState::InUse).unwrap();
        s.modify_book(&b).unwrap();
        s.create_bos(Bos {
            shelf_id: shelf.id,
            book_id: b.id,
            seq_num: 1,
        })
        .unwrap();
        let mut grown = shelf.clone();
        grown.size_bytes = 1 << 20;
        grown.book_count = 1;
        s.modify_shelf(&grown).unwrap();
        s.rollback().unwrap();

        assert_eq!(
            s.get_book_by_id(lza(0, 0)).unwrap().unwrap().state,
            BookState::Free
        );
        assert!(s.get_bos_by_shelf_id(shelf.id).unwrap().is_empty());
        assert_eq!(
            s.get_shelf(ShelfMatch::Name("xyzzy")).unwrap().unwrap(),
            shelf
        );

        // rollback of a delete restores both indexes
        s.delete_shelf(shelf.id).unwrap();
        assert!(s.get_shelf(ShelfMatch::Name("xyzzy")).unwrap().is_none());
        s.rollback().unwrap();
        assert!(s.get_shelf(ShelfMatch::Id(shelf.id)).unwrap().is_some());
    }

    #[test]
    fn handles_and_open_count() {
        let mut s = MemStore::new(&topo());
        let shelf = s.create_shelf("coke", 0).unwrap();
        let h1 = s.open_handle(shelf.id, &ctx()).unwrap();
        let h2 = s.open_handle(shelf.id, &ctx()).unwrap();
        assert_ne!(h1, h2);
        assert_eq!(s.open_count(shelf.id).unwrap(), 2);

        assert!(s.close_handle(h1).unwrap().is_some());
        assert!(s.close_handle(h1).unwrap().is_none());
        assert_eq!(s.open_count(shelf.id).unwrap(), 1);
    }

    #[test]
    fn xattr_rollback_restores_previous_value() {
        let mut s = MemStore::new(&topo());
        let shelf = s.create_shelf("pepsi", 0).unwrap();
        s.create_xattr(shelf.id, "user.color", "red").unwrap();
        s.commit().unwrap();

        s.modify_xattr(shelf.id, "user.color", "blue").unwrap();
        s.delete_xattr(shelf.id, "user.color").unwrap();
        s.rollback().unwrap();
        assert_eq!(
            s.get_xattr(shelf.id, "user.color").unwrap().as_deref(),
            Some("red")
        );
        assert_eq!(s.list_xattrs(shelf.id).unwrap(), vec!["user.color"]);
    }
}
