//! Aperture descriptor management.
//!
//! The hardware exposes a small fixed table of descriptors, each able to
//! bind one book's LZA into the processor's fault path.  This module tracks
//! which LZA owns which aperture, who has faulted on it, and picks victims
//! when a new binding needs a slot.
//!
//! Eviction is two-phase on purpose: [`DescriptorManager::assign`] only
//! *proposes* a victim when the table is full, because the victim's PTEs
//! must be invalidated in every faulting process before the descriptor can
//! be reprogrammed.  [`DescriptorManager::commit_assign`] finishes the job.
//!
//! Register layout, bit-exact: bit 0 is the valid bit, bits 33 and up hold
//! the 20-bit LZA (7-bit IG over a 13-bit in-IG book number).  Read-back
//! masks the valid bit before decoding.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::os::unix::io::AsRawFd;

use log::debug;
use thiserror::Error;
use xxhash_rust::xxh3::Xxh3Builder;

use crate::books::LZA_BITS;

/// Conventional device node for the descriptor ioctls.
pub const DESC_DEVICE: &str = "/dev/descioctl";

/// Bits of offset below the LZA field in a descriptor register.
pub const BOOK_SHIFT: u32 = 33;
/// One past the largest legal baseLZA.
pub const LZA_LIMIT: u64 = 1 << LZA_BITS;

const VALID_BIT: u64 = 1;
/// All 64 bits except the valid bit.
const EVEN_MASK: u64 = !VALID_BIT;

/// Encode a descriptor register for a bound LZA.
fn encode(base_lza: u64) -> u64 {
    (base_lza << BOOK_SHIFT) | VALID_BIT
}

/// Decode a register read back from hardware; `None` when invalid.
fn decode(register: u64) -> Option<u64> {
    if register & VALID_BIT == 0 {
        return None;
    }
    Some((register & EVEN_MASK) >> BOOK_SHIFT)
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DescError {
    #[error("missing descriptor device {0}")]
    Missing(String),
    #[error("{0} is not a character device")]
    NotCharDevice(String),
    #[error("opening the descriptor device failed")]
    Open(#[source] std::io::Error),
    #[error("descriptor ioctl failed")]
    Ioctl(#[source] nix::Error),
    #[error("baseLZA {0:#x} out of range")]
    LzaRange(u64),
    #[error("aperture index {0} out of range")]
    BadIndex(u64),
    #[error("aperture table inconsistent")]
    Inconsistent,
}

/// 2xu64 transfer buffer shared with the kernel module.
#[derive(Clone, Copy, bytemuck::Zeroable, bytemuck::Pod)]
#[repr(C)]
struct DescXfer {
    index: u64,
    value: u64,
}

mod ioctls {
    use super::DescXfer;

    // DESBK_READ_OFF == 0xc0102100, DESBK_PUT == 0xc0102102
    nix::ioctl_readwrite!(desbk_read_off, b'!', 0x00, DescXfer);
    nix::ioctl_readwrite!(desbk_put, b'!', 0x02, DescXfer);
}

/// One descriptor register, readable and writable by index.
pub trait DescDevice {
    fn read_desc(&mut self, index: u64) -> Result<u64, DescError>;
    fn write_desc(&mut self, index: u64, value: u64) -> Result<(), DescError>;
}

/// The real device at [`DESC_DEVICE`].
pub struct DescIoctl {
    file: File,
}

impl DescIoctl {
    pub fn open() -> Result<Self, DescError> {
        Self::open_at(DESC_DEVICE)
    }

    pub fn open_at(path: &str) -> Result<Self, DescError> {
        let st = nix::sys::stat::stat(path).map_err(|_| DescError::Missing(path.to_string()))?;
        if st.st_mode & nix::libc::S_IFMT != nix::libc::S_IFCHR {
            return Err(DescError::NotCharDevice(path.to_string()));
        }
        let file = File::options()
            .write(true)
            .open(path)
            .map_err(DescError::Open)?;
        Ok(Self { file })
    }
}

impl DescDevice for DescIoctl {
    fn read_desc(&mut self, index: u64) -> Result<u64, DescError> {
        let mut buf = DescXfer { index, value: 0 };
        unsafe { ioctls::desbk_read_off(self.file.as_raw_fd(), &mut buf) }
            .map_err(DescError::Ioctl)?;
        Ok(buf.value)
    }

    fn write_desc(&mut self, index: u64, value: u64) -> Result<(), DescError> {
        let mut buf = DescXfer { index, value };
        unsafe { ioctls::desbk_put(self.file.as_raw_fd(), &mut buf) }
            .map_err(DescError::Ioctl)?;
        Ok(())
    }
}

type Xxh3Map<K, V> = HashMap<K, V, Xxh3Builder>;

/// Occupancy record for one bound aperture: which processes faulted where,
/// and when the last fault landed (monotonic engine ticks, not wall time).
#[derive(Clone, Debug)]
pub struct LzaInUse {
    pub base_lza: u64,
    pub index: u64,
    pids: Xxh3Map<u32, Vec<u64>>,
    pub mtime: u64,
}

impl LzaInUse {
    fn new(base_lza: u64, index: u64) -> Self {
        Self {
            base_lza,
            index,
            pids: Xxh3Map::with_hasher(Xxh3Builder::new()),
            // zero forces boot-scanned strangers to the head of the
            // eviction line
            mtime: 0,
        }
    }

    fn with_fault(base_lza: u64, index: u64, pid: u32, user_va: u64, mtime: u64) -> Self {
        let mut entry = Self::new(base_lza, index);
        entry.update(pid, user_va, mtime);
        entry
    }

    fn update(&mut self, pid: u32, user_va: u64, mtime: u64) {
        self.pids.entry(pid).or_default().push(user_va);
        self.mtime = mtime;
    }

    /// Total faulted pages across all processes.
    pub fn mappings(&self) -> usize {
        self.pids.values().map(Vec::len).sum()
    }

    pub fn pids(&self) -> Vec<u32> {
        self.pids.keys().copied().collect()
    }

    pub fn faults_of(&self, pid: u32) -> &[u64] {
        self.pids.get(&pid).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Victim selection key: oldest fault first, then fewest mappings, then
    /// lowest index to make the choice total.
    fn eviction_key(&self) -> (u64, usize, u64) {
        (self.mtime, self.mappings(), self.index)
    }
}

/// Proposed rebinding of one aperture.  The hardware still holds
/// `evict_lza`; the caller invalidates `evict_pids`' PTEs and then calls
/// [`DescriptorManager::commit_assign`].
#[derive(Clone, Debug)]
pub struct Eviction {
    pub evict_lza: u64,
    pub evict_pids: Vec<u32>,
    pub index: u64,
    pub new_lza: u64,
    pub pid: u32,
    pub user_va: u64,
}

pub struct DescriptorManager<D: DescDevice> {
    dev: D,
    indices: Vec<u64>,
    available: VecDeque<u64>,
    descriptors: Xxh3Map<u64, LzaInUse>,
    clock: u64,
}

impl<D: DescDevice> DescriptorManager<D> {
    /// Bring the manager up over a device, seeding occupancy from whatever
    /// the hardware table already holds.  `indices` defaults to {0, 1, 2}.
    pub fn new(mut dev: D, indices: Option<&[u64]>) -> Result<Self, DescError> {
        let indices: Vec<u64> = match indices {
            Some(list) if !list.is_empty() => list.to_vec(),
            _ => vec![0, 1, 2],
        };
        for &index in &indices {
            if index >= 2000 {
                return Err(DescError::BadIndex(index));
            }
        }

        let mut available = VecDeque::new();
        let mut descriptors = Xxh3Map::with_hasher(Xxh3Builder::new());
        for &index in &indices {
            let register = dev.read_desc(index)?;
            match decode(register) {
                Some(lza) => {
                    descriptors.insert(lza, LzaInUse::new(lza, index));
                }
                None => available.push_back(index),
            }
        }

        let mgr = Self {
            dev,
            indices,
            available,
            descriptors,
            clock: 0,
        };
        mgr.consistent()?;
        Ok(mgr)
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn consistent(&self) -> Result<(), DescError> {
        if self.available.len() + self.descriptors.len() != self.indices.len() {
            return Err(DescError::Inconsistent);
        }
        Ok(())
    }

    pub fn bound(&self) -> usize {
        self.descriptors.len()
    }

    pub fn available(&self) -> usize {
        self.available.len()
    }

    pub fn lookup(&self, base_lza: u64) -> Option<&LzaInUse> {
        self.descriptors.get(&base_lza)
    }

    /// Find an aperture for a faulting (LZA, pid, VA).
    ///
    /// `Ok(None)` means the fault is served: either the LZA was already
    /// bound (hit) or a free aperture was programmed.  `Ok(Some(_))` means
    /// the table is full and the returned eviction must be committed after
    /// PTE invalidation; the table and hardware are untouched until then.
    pub fn assign(
        &mut self,
        base_lza: u64,
        pid: u32,
        user_va: u64,
    ) -> Result<Option<Eviction>, DescError> {
        if base_lza >= LZA_LIMIT {
            return Err(DescError::LzaRange(base_lza));
        }
        self.consistent()?;

        let now = self.tick();
        if let Some(entry) = self.descriptors.get_mut(&base_lza) {
            entry.update(pid, user_va, now);
            return Ok(None);
        }

        if let Some(index) = self.available.pop_front() {
            if let Err(e) = self.dev.write_desc(index, encode(base_lza)) {
                self.available.push_front(index);
                return Err(e);
            }
            self.descriptors
                .insert(base_lza, LzaInUse::with_fault(base_lza, index, pid, user_va, now));
            self.consistent()?;
            return Ok(None);
        }

        let victim = self
            .descriptors
            .values()
            .min_by_key(|e| e.eviction_key())
            .ok_or(DescError::Inconsistent)?;
        debug!(
            "aperture {} full: propose evicting LZA {:#07x} for {:#07x}",
            victim.index, victim.base_lza, base_lza
        );
        Ok(Some(Eviction {
            evict_lza: victim.base_lza,
            evict_pids: victim.pids(),
            index: victim.index,
            new_lza: base_lza,
            pid,
            user_va,
        }))
    }

    /// Program the new binding proposed by [`Self::assign`].  Only call
    /// once every pid in `evict_pids` has had its PTEs invalidated.
    pub fn commit_assign(&mut self, eviction: &Eviction) -> Result<(), DescError> {
        self.dev.write_desc(eviction.index, encode(eviction.new_lza))?;
        self.descriptors
            .remove(&eviction.evict_lza)
            .ok_or(DescError::Inconsistent)?;
        let now = self.tick();
        self.descriptors.insert(
            eviction.new_lza,
            LzaInUse::with_fault(
                eviction.new_lza,
                eviction.index,
                eviction.pid,
                eviction.user_va,
                now,
            ),
        );
        self.consistent()
    }
}
