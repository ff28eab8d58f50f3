//! Shadow backend: the ivshmem PCI region, mmapped whole, with real
//! aperture management on the fault path.
//!
//! QEMU models FAM as an inter-VM shared-memory device (vendor:device
//! 1af4:1110).  Region 2 is the 64-bit prefetchable BAR backing the NVM;
//! its `resource2` file is mmapped and indexed by flat-space offset exactly
//! like the flat-file shadow.  On top of that, every page fault consults
//! the descriptor manager so the kernel can be handed a physical address
//! behind one of the few hardware apertures.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::info;
use memmap2::{MmapMut, MmapOptions};

use super::{book_spans, shadow_offset, CachedShelf, ShadowBackend, ShadowError};
use crate::books::{Shelf, LZA_MASK};
use crate::desc::{DescDevice, DescIoctl, DescriptorManager, Eviction};
use crate::topology::Topology;

/// PCI vendor:device of the ivshmem model.
pub const IVSHMEM_ID: &str = "1af4:1110";

/// Outcome of one page fault: where the page really lives, and whatever
/// must be evicted before the aperture binding can change.
#[derive(Debug)]
pub struct FaultReply {
    pub phys_addr: u64,
    pub eviction: Option<Eviction>,
}

pub struct ShadowIvshmem<D: DescDevice = DescIoctl> {
    map: MmapMut,
    phys_base: u64,
    topology: Topology,
    descriptors: DescriptorManager<D>,
}

/// First BDF with the ivshmem id, via lspci.
fn probe_bdf() -> Result<String, ShadowError> {
    let out = Command::new("lspci").args(["-D", "-d", IVSHMEM_ID]).output()?;
    let text = String::from_utf8_lossy(&out.stdout);
    text.lines()
        .next()
        .and_then(|line| line.split_whitespace().next())
        .map(str::to_string)
        .ok_or(ShadowError::NoIvshmem)
}

/// Physical base of region 2, from the sysfs `resource` table (one
/// "start end flags" line per BAR).
fn region2_base(resource_table: &Path) -> Result<u64, ShadowError> {
    let text = std::fs::read_to_string(resource_table)?;
    let line = text.lines().nth(2).ok_or(ShadowError::NoIvshmem)?;
    let start = line.split_whitespace().next().ok_or(ShadowError::NoIvshmem)?;
    u64::from_str_radix(start.trim_start_matches("0x"), 16)
        .map_err(|_| ShadowError::NoIvshmem)
}

impl ShadowIvshmem<DescIoctl> {
    /// Find the device, mmap its region 2, and bring up descriptor
    /// management.  A missing `/dev/descioctl` here is fatal to the caller:
    /// this backend cannot run without apertures.
    pub fn probe(topology: &Topology) -> Result<Self, ShadowError> {
        let bdf = probe_bdf()?;
        let device_dir = PathBuf::from(format!("/sys/devices/pci0000:00/{bdf}"));
        let phys_base = region2_base(&device_dir.join("resource"))?;

        let file = File::options()
            .read(true)
            .write(true)
            .open(device_dir.join("resource2"))?;
        let map = unsafe {
            MmapOptions::new()
                .len(topology.nvm_bytes_total() as usize)
                .map_mut(&file)
        }
        .map_err(ShadowError::Mmap)?;
        info!(
            "ivshmem at {bdf}, region 2 base {phys_base:#x}, {} bytes mapped",
            map.len()
        );

        let descriptors = DescriptorManager::new(DescIoctl::open()?, None)?;
        Ok(Self::from_parts(map, phys_base, topology, descriptors))
    }
}

impl<D: DescDevice> ShadowIvshmem<D> {
    /// Assemble from already-opened pieces (alternate wiring and tests).
    pub fn from_parts(
        map: MmapMut,
        phys_base: u64,
        topology: &Topology,
        descriptors: DescriptorManager<D>,
    ) -> Self {
        Self {
            map,
            phys_base,
            topology: topology.clone(),
            descriptors,
        }
    }

    /// Serve a page fault at `offset` into the shelf from process `pid`
    /// faulting at `user_va`.
    ///
    /// The physical address goes back to the kernel through the side
    /// channel; if an eviction comes back with it, the caller invalidates
    /// the victim's PTEs and then calls [`Self::commit_eviction`].
    pub fn fault(
        &mut self,
        entry: &CachedShelf,
        pid: u32,
        offset: u64,
        user_va: u64,
    ) -> Result<FaultReply, ShadowError> {
        let flat = shadow_offset(&self.topology, &entry.bos, offset)
            .ok_or(ShadowError::Eof(offset))?;
        let book = (offset / self.topology.book_size_bytes()) as usize;
        let base_lza = entry.bos[book].book_id & LZA_MASK;
        let page_va = user_va & !(page_size::get() as u64 - 1);
        let eviction = self.descriptors.assign(base_lza, pid, page_va)?;
        Ok(FaultReply {
            phys_addr: self.phys_base + flat,
            eviction,
        })
    }

    /// Finish a two-phase eviction once PTE invalidation is done.
    pub fn commit_eviction(&mut self, eviction: &Eviction) -> Result<(), ShadowError> {
        Ok(self.descriptors.commit_assign(eviction)?)
    }

    pub fn descriptors(&self) -> &DescriptorManager<D> {
        &self.descriptors
    }
}

impl<D: DescDevice> ShadowBackend for ShadowIvshmem<D> {
    // The region is the whole machine's NVM; shelves need no per-shelf
    // backing here.
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
        let mut moved = 0usize;
        for (span_off, span_len) in
            book_spans(self.topology.book_size_bytes(), offset, buf.len())
        {
            let Some(flat) = shadow_offset(&self.topology, &entry.bos, span_off) else {
                return Ok(moved);
            };
            let flat = flat as usize;
            buf[moved..moved + span_len].copy_from_slice(&self.map[flat..flat + span_len]);
            moved += span_len;
        }
        Ok(moved)
    }

    fn write(
        &mut self,
        entry: &CachedShelf,
        offset: u64,
        data: &[u8],
    ) -> Result<usize, ShadowError> {
        let mut moved = 0usize;
        for (span_off, span_len) in
            book_spans(self.topology.book_size_bytes(), offset, data.len())
        {
            let flat = shadow_offset(&self.topology, &entry.bos, span_off)
                .ok_or(ShadowError::Eof(span_off))? as usize;
            self.map[flat..flat + span_len].copy_from_slice(&data[moved..moved + span_len]);
            moved += span_len;
        }
        Ok(moved)
    }
}
