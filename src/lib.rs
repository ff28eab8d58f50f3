/*
Control-plane core of the Library FileSystem (LFS): a pool of fixed-size
"books" of fabric-attached NVM, striped one interleave group per node, is
carved into named "shelves" by a single authoritative metadata engine.

- The librarian engine owns all shelf/book/BOS metadata and mediates every
  mutation behind one transaction per command.
- Allocation policies pick free books by locality.
- The shadow layer translates (shelf, offset) into the flat physical space
  and backs it with per-shelf files, one big file, or an mmapped device.
- The descriptor manager rations the few hardware apertures that make
  user-space mmap of FAM possible, evicting LRU-ish under fault pressure.
 */

pub mod books;
pub mod desc;
pub mod engine;
mod error;
pub mod policy;
pub mod proto;
pub mod shadow;
pub mod store;
pub mod topology;

pub use error::EngineError;

/// Version string reported by the `version` command.
pub const LIBRARIAN_VERSION: &str = "Librarian v0.01";

/// Smallest book size the engine will boot with.
pub const MIN_BOOK_SIZE: u64 = 1 << 20;
