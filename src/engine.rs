//! The librarian command engine: the single authority over shelves, books,
//! BOS ordering and xattrs.
//!
//! One command, one transaction.  Every handler runs against the store,
//! commits on success, and rolls the whole thing back on the first error.
//! Consistency is checked on every shelf read, never repaired: a shelf whose
//! size and book count disagree is reported (EBADF), as is a BOS set that is
//! short (EREMOTEIO) or out of sequence (EBADFD).

use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;

use crate::books::{Book, BookState, Bos, Shelf};
use crate::error::EngineError;
use crate::policy::{self, AllocationPolicy, POLICY_DEFAULT, XATTR_POLICY};
use crate::proto::Context;
use crate::store::{LfsGlobals, MetadataStore, ShelfMatch};
use crate::topology::Topology;
use crate::{LIBRARIAN_VERSION, MIN_BOOK_SIZE};

/// Reply to `create_shelf` / `open_shelf`: the shelf plus the caller's
/// freshly minted handle.
#[derive(Clone, Debug, Serialize)]
pub struct OpenReply {
    pub shelf: Shelf,
    pub handle: u64,
}

pub struct LibrarianEngine<S: MetadataStore> {
    store: S,
    topology: Topology,
    book_size: u64,
    rng: StdRng,
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl<S: MetadataStore> LibrarianEngine<S> {
    /// Boot the engine over a store.  Fails (and the process should exit)
    /// when the store's globals are unusable or disagree with the topology.
    pub fn new(mut store: S, topology: Topology) -> Result<Self, EngineError> {
        let globals = store.get_globals()?;
        if globals.book_size_bytes < MIN_BOOK_SIZE {
            return Err(EngineError::Invalid(format!(
                "bad book size {} in store",
                globals.book_size_bytes
            )));
        }
        if globals.book_size_bytes != topology.book_size_bytes() {
            return Err(EngineError::Invalid(format!(
                "store book size {} disagrees with topology {}",
                globals.book_size_bytes,
                topology.book_size_bytes()
            )));
        }
        info!(
            "{}: {} books of {} bytes across {} nodes",
            LIBRARIAN_VERSION,
            globals.books_total,
            globals.book_size_bytes,
            topology.node_count()
        );
        Ok(Self {
            store,
            topology,
            book_size: globals.book_size_bytes,
            rng: StdRng::from_entropy(),
        })
    }

    /// Pin the policy RNG, for reproducible allocation in tests.
    pub fn seed_rng(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Run one command body as a transaction: commit on Ok, rollback on Err.
    fn transact<T>(
        &mut self,
        body: impl FnOnce(&mut Self) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        match body(self) {
            Ok(value) => {
                self.store.commit()?;
                Ok(value)
            }
            Err(e) => {
                let _ = self.store.rollback();
                Err(e)
            }
        }
    }

    /// Fetch a shelf, or ENOENT; enforce the size/count law, or EBADF.
    fn get_shelf_checked(&mut self, which: ShelfMatch<'_>) -> Result<Shelf, EngineError> {
        let shelf = self.store.get_shelf(which)?.ok_or_else(|| match which {
            ShelfMatch::Name(name) => EngineError::not_found("shelf", name),
            ShelfMatch::Id(id) => EngineError::not_found("shelf", id.to_string()),
        })?;
        if !shelf.size_matches_books(self.book_size) {
            return Err(EngineError::SizeMismatch(shelf.name));
        }
        Ok(shelf)
    }

    /// Fetch a shelf's BOS rows; enforce the count (EREMOTEIO) and the dense
    /// 1..book_count progression (EBADFD).
    fn get_bos_checked(&mut self, shelf: &Shelf) -> Result<Vec<Bos>, EngineError> {
        let bos = self.store.get_bos_by_shelf_id(shelf.id)?;
        if bos.len() as u64 != shelf.book_count {
            return Err(EngineError::CountMismatch(shelf.name.clone()));
        }
        for (i, row) in bos.iter().enumerate() {
            if row.seq_num != i as u64 + 1 {
                return Err(EngineError::CorruptSequence(shelf.name.clone()));
            }
        }
        Ok(bos)
    }

    fn get_book_checked(&mut self, book_id: u64) -> Result<Book, EngineError> {
        self.store
            .get_book_by_id(book_id)?
            .ok_or_else(|| EngineError::not_found("book", format!("{book_id:#x}")))
    }

    /// Record one open against a shelf and hand back the handle.
    fn do_open(&mut self, mut shelf: Shelf, ctx: &Context) -> Result<OpenReply, EngineError> {
        let handle = self.store.open_handle(shelf.id, ctx)?;
        shelf.open_count += 1;
        self.store.modify_shelf(&shelf)?;
        Ok(OpenReply { shelf, handle })
    }

    // ---- command set -----------------------------------------------------

    pub fn version(&self) -> &'static str {
        LIBRARIAN_VERSION
    }

    pub fn get_fs_stats(&mut self) -> Result<LfsGlobals, EngineError> {
        self.store.get_globals()
    }

    /// Create-if-absent, then open.  Pre-existence is never an error.
    pub fn create_shelf(&mut self, ctx: &Context, name: &str) -> Result<OpenReply, EngineError> {
        self.transact(|eng| {
            let shelf = match eng.store.get_shelf(ShelfMatch::Name(name))? {
                Some(_) => eng.get_shelf_checked(ShelfMatch::Name(name))?,
                None => {
                    let shelf = eng.store.create_shelf(name, now())?;
                    eng.store
                        .create_xattr(shelf.id, XATTR_POLICY, POLICY_DEFAULT.as_str())?;
                    debug!("created shelf \"{name}\" (id {})", shelf.id);
                    shelf
                }
            };
            eng.do_open(shelf, ctx)
        })
    }

    pub fn get_shelf(
        &mut self,
        name: &str,
        match_id: Option<u64>,
    ) -> Result<Shelf, EngineError> {
        match match_id {
            Some(id) => self.get_shelf_checked(ShelfMatch::Id(id)),
            None => self.get_shelf_checked(ShelfMatch::Name(name)),
        }
    }

    pub fn list_shelves(&mut self) -> Result<Vec<Shelf>, EngineError> {
        self.store.get_shelf_all()
    }

    pub fn open_shelf(&mut self, ctx: &Context, name: &str) -> Result<OpenReply, EngineError> {
        self.transact(|eng| {
            let shelf = eng.get_shelf_checked(ShelfMatch::Name(name))?;
            eng.do_open(shelf, ctx)
        })
    }

    /// Drop one handle.  Unknown handles fail ESTALE with no side effects.
    pub fn close_shelf(&mut self, _ctx: &Context, handle: u64) -> Result<Shelf, EngineError> {
        self.transact(|eng| {
            let row = eng
                .store
                .close_handle(handle)?
                .ok_or(EngineError::StaleHandle(handle))?;
            let mut shelf = eng.get_shelf_checked(ShelfMatch::Id(row.shelf_id))?;
            shelf.open_count = shelf.open_count.saturating_sub(1);
            shelf.mtime = now();
            eng.store.modify_shelf(&shelf)?;
            Ok(shelf)
        })
    }

    /// Tear a shelf down: every book goes IN_USE -> ZOMBIE, xattrs and BOS
    /// rows go away, then the shelf row itself.  EBUSY while anyone still
    /// holds a handle.
    pub fn destroy_shelf(&mut self, _ctx: &Context, name: &str) -> Result<Shelf, EngineError> {
        self.transact(|eng| {
            let shelf = eng.get_shelf_checked(ShelfMatch::Name(name))?;
            if eng.store.open_count(shelf.id)? > 0 {
                return Err(EngineError::Busy(name.to_string()));
            }
            let bos = eng.get_bos_checked(&shelf)?;
            for row in &bos {
                eng.store.delete_bos(row)?;
                let mut book = eng.get_book_checked(row.book_id)?;
                book.transition(BookState::Zombie)?;
                eng.store.modify_book(&book)?;
            }
            for xname in eng.store.list_xattrs(shelf.id)? {
                eng.store.delete_xattr(shelf.id, &xname)?;
            }
            eng.store.delete_shelf(shelf.id)?;
            info!(
                "destroyed shelf \"{name}\": {} books zombied",
                bos.len()
            );
            Ok(shelf)
        })
    }

    /// Grow or shrink a shelf to `new_size_bytes`.
    ///
    /// Growth asks the shelf's allocation policy for the delta and fails
    /// ENOSPC (rolling back) if it under-delivers.  Shrink pops BOS rows off
    /// the tail and zombies their books.
    pub fn resize_shelf(
        &mut self,
        ctx: &Context,
        name: &str,
        match_id: Option<u64>,
        new_size_bytes: u64,
    ) -> Result<Shelf, EngineError> {
        self.transact(|eng| {
            let mut shelf = match match_id {
                Some(id) => eng.get_shelf_checked(ShelfMatch::Id(id))?,
                None => eng.get_shelf_checked(ShelfMatch::Name(name))?,
            };
            let bos = eng.get_bos_checked(&shelf)?;

            if new_size_bytes == shelf.size_bytes {
                return Ok(shelf);
            }
            let new_book_count = new_size_bytes.div_ceil(eng.book_size);
            debug!(
                "resize \"{}\": {} -> {} bytes, {} -> {} books",
                shelf.name, shelf.size_bytes, new_size_bytes, shelf.book_count, new_book_count
            );

            if new_book_count > shelf.book_count {
                let wanted = (new_book_count - shelf.book_count) as usize;
                let LibrarianEngine {
                    store,
                    topology,
                    rng,
                    ..
                } = eng;
                let chosen = AllocationPolicy::for_shelf(store, &shelf)?
                    .allocate(store, topology, ctx, wanted, rng)?;
                if chosen.len() < wanted {
                    return Err(EngineError::OutOfSpace {
                        wanted: wanted as u64,
                        got: chosen.len() as u64,
                    });
                }
                let mut seq_num = shelf.book_count;
                for mut book in chosen {
                    seq_num += 1;
                    book.transition(BookState::InUse)?;
                    eng.store.modify_book(&book)?;
                    eng.store.create_bos(Bos {
                        shelf_id: shelf.id,
                        book_id: book.id,
                        seq_num,
                    })?;
                }
            } else if new_book_count < shelf.book_count {
                let surplus = (shelf.book_count - new_book_count) as usize;
                for row in bos.iter().rev().take(surplus) {
                    eng.store.delete_bos(row)?;
                    let mut book = eng.get_book_checked(row.book_id)?;
                    book.transition(BookState::Zombie)?;
                    eng.store.modify_book(&book)?;
                }
            }

            shelf.size_bytes = new_size_bytes;
            shelf.book_count = new_book_count;
            shelf.mtime = now();
            eng.store.modify_shelf(&shelf)?;
            Ok(shelf)
        })
    }

    pub fn get_xattr(&mut self, name: &str, xattr: &str) -> Result<String, EngineError> {
        let shelf = self.get_shelf_checked(ShelfMatch::Name(name))?;
        if let Some(value) = policy::special_get(&mut self.store, &shelf, xattr)? {
            return Ok(value);
        }
        self.store
            .get_xattr(shelf.id, xattr)?
            .ok_or_else(|| EngineError::not_found("xattr", xattr))
    }

    pub fn list_xattrs(&mut self, name: &str) -> Result<Vec<String>, EngineError> {
        let shelf = self.get_shelf_checked(ShelfMatch::Name(name))?;
        self.store.list_xattrs(shelf.id)
    }

    pub fn set_xattr(
        &mut self,
        name: &str,
        xattr: &str,
        value: &str,
    ) -> Result<(), EngineError> {
        self.transact(|eng| {
            let shelf = eng.get_shelf_checked(ShelfMatch::Name(name))?;
            policy::check_set(xattr, value)?;
            if eng.store.get_xattr(shelf.id, xattr)?.is_some() {
                eng.store.modify_xattr(shelf.id, xattr, value)
            } else {
                eng.store.create_xattr(shelf.id, xattr, value)
            }
        })
    }

    pub fn remove_xattr(&mut self, name: &str, xattr: &str) -> Result<(), EngineError> {
        self.transact(|eng| {
            let shelf = eng.get_shelf_checked(ShelfMatch::Name(name))?;
            policy::check_remove(xattr)?;
            if eng.store.get_xattr(shelf.id, xattr)?.is_none() {
                return Err(EngineError::not_found("xattr", xattr));
            }
            eng.store.delete_xattr(shelf.id, xattr)
        })
    }

    /// Update the modification time and nothing else.
    pub fn set_am_time(&mut self, name: &str, mtime: u64) -> Result<Shelf, EngineError> {
        self.transact(|eng| {
            let mut shelf = eng.get_shelf_checked(ShelfMatch::Name(name))?;
            shelf.mtime = mtime;
            eng.store.modify_shelf(&shelf)?;
            Ok(shelf)
        })
    }

    /// Node daemons have zeroed everything: every ZOMBIE goes back to FREE.
    pub fn kill_zombie_books(&mut self, _ctx: &Context) -> Result<u64, EngineError> {
        self.transact(|eng| {
            let mut freed = 0u64;
            for node_id in 1..=eng.topology.node_count() {
                for mut book in eng
                    .store
                    .get_book_by_node(node_id, BookState::Zombie, None)?
                {
                    book.transition(BookState::Free)?;
                    eng.store.modify_book(&book)?;
                    freed += 1;
                }
            }
            info!("kill_zombie_books: {freed} books back to FREE");
            Ok(freed)
        })
    }

    /// A node daemon confirms it zeroed these books.  Each must belong to
    /// the caller's node; all transitions land in one commit.
    pub fn log_zero(&mut self, ctx: &Context, book_ids: &[u64]) -> Result<u64, EngineError> {
        self.transact(|eng| {
            for &book_id in book_ids {
                let mut book = eng.get_book_checked(book_id)?;
                if book.node_id != ctx.node_id {
                    return Err(EngineError::Invalid(format!(
                        "book {book_id:#x} belongs to node {}, not node {}",
                        book.node_id, ctx.node_id
                    )));
                }
                book.transition(BookState::Free)?;
                eng.store.modify_book(&book)?;
            }
            debug!("log_zero: {} books freed on node {}", book_ids.len(), ctx.node_id);
            Ok(book_ids.len() as u64)
        })
    }

    /// Out-of-band test notification: plain echo.
    pub fn send_oob(&self, msg: &str) -> String {
        msg.to_string()
    }

    pub fn list_book(&mut self, book_id: u64) -> Result<Book, EngineError> {
        self.get_book_checked(book_id)
    }

    pub fn list_bos(&mut self, shelf_id: u64) -> Result<Vec<Bos>, EngineError> {
        let shelf = self.get_shelf_checked(ShelfMatch::Id(shelf_id))?;
        self.get_bos_checked(&shelf)
    }

    #[cfg(test)]
    pub(crate) fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }
}
