// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Physically contiguous buffers shared between the CPU and the accelerator.
//!
//! The accelerator addresses physical memory and does not snoop the CPU
//! caches, so CPU access only happens inside a sync window:
//!
//! - input: [`DmaBuffer::write_with`] writes dirty lines back before the
//!   transfer is started;
//! - output: [`DmaBuffer::read_with`] invalidates stale lines after
//!   completion, before the CPU reads.

use crate::{
    error::{Error, Result},
    image::{Geometry, GrayImage},
    mmio::page_size,
    vdma::BYTES_PER_PIXEL,
};
use dma_buf::{DmaBuf, MappedDmaBuf};
use dma_heap::{Heap, HeapKind};
use std::{
    cell::Cell,
    error::Error as StdError,
    fs::File,
    os::{fd::OwnedFd, unix::fs::FileExt},
};
use tracing::{debug, info};

/// A CPU-mapped, physically contiguous buffer.
pub trait DmaBuffer: Send {
    /// Physical address the accelerator uses for this buffer.
    fn phys_addr(&self) -> u64;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs `f` over the CPU view. Dirty cache lines are written back before
    /// this returns so the device observes the writes.
    fn write_with<F>(&mut self, f: F) -> Result<()>
    where
        F: Fn(&mut [u8]);

    /// Invalidates stale cache lines, then runs `f` over the CPU view.
    fn read_with<T, F>(&mut self, f: F) -> Result<T>
    where
        F: Fn(&[u8]) -> T;
}

/// Source of [`DmaBuffer`]s. Dropping a buffer releases it.
pub trait DmaAllocator: Send {
    type Buffer: DmaBuffer;

    /// Allocates a zero-filled buffer of `len` bytes.
    fn allocate(&mut self, len: usize) -> Result<Self::Buffer>;
}

/// Allocator backed by the Linux CMA DMA heap.
///
/// Requires `/dev/dma_heap/linux,cma` and, to resolve physical addresses
/// through `/proc/self/pagemap`, `CAP_SYS_ADMIN`.
pub struct CmaAllocator {
    heap: Heap,
}

impl CmaAllocator {
    pub fn new() -> Result<Self> {
        let heap = Heap::new(HeapKind::Cma)
            .map_err(|e| Error::Configuration(format!("CMA heap: {e}")))?;
        Ok(Self { heap })
    }
}

impl DmaAllocator for CmaAllocator {
    type Buffer = CmaBuffer;

    fn allocate(&mut self, len: usize) -> Result<CmaBuffer> {
        let fd = self
            .heap
            .allocate(len)
            .map_err(|e| Error::Allocation(format!("{len} bytes from CMA: {e}")))?;
        CmaBuffer::map(fd, len)
    }
}

/// CMA dma-buf mapped into this process.
///
/// Every CPU access goes through [`MappedDmaBuf::read`] or
/// [`MappedDmaBuf::write`], which bracket it with `DMA_BUF_IOCTL_SYNC`.
/// Dropping the buffer unmaps it and closes the dma-buf, which returns the
/// memory to the heap.
pub struct CmaBuffer {
    mem: MappedDmaBuf,
    len: usize,
    phys: u64,
}

// The mapping and its dma-buf are owned exclusively by this value.
unsafe impl Send for CmaBuffer {}

impl CmaBuffer {
    fn map(fd: OwnedFd, len: usize) -> Result<Self> {
        let mut mem = DmaBuf::from(fd)
            .memory_map()
            .map_err(|e| Error::Allocation(format!("mmap dma-buf: {e}")))?;

        // fault the first page in so pagemap reports its frame
        let vaddr = Cell::new(0usize);
        mem.write(
            |bytes: &mut [u8], _: Option<()>| {
                if let Some(first) = bytes.first_mut() {
                    *first = 0;
                }
                vaddr.set(bytes.as_ptr() as usize);
                Ok::<(), Box<dyn StdError>>(())
            },
            None,
        )
        .map_err(|e| Error::Allocation(format!("touch dma-buf: {e}")))?;

        let phys = physical_address(vaddr.get())?;
        debug!("CMA buffer {} bytes at {:#x}", len, phys);
        Ok(Self { mem, len, phys })
    }
}

impl DmaBuffer for CmaBuffer {
    fn phys_addr(&self) -> u64 {
        self.phys
    }

    fn len(&self) -> usize {
        self.len
    }

    fn write_with<F>(&mut self, f: F) -> Result<()>
    where
        F: Fn(&mut [u8]),
    {
        self.mem
            .write(
                |bytes: &mut [u8], _: Option<()>| {
                    f(bytes);
                    Ok::<(), Box<dyn StdError>>(())
                },
                None,
            )
            .map_err(|e| Error::Allocation(format!("dma-buf {:#x} write: {e}", self.phys)))
    }

    fn read_with<T, F>(&mut self, f: F) -> Result<T>
    where
        F: Fn(&[u8]) -> T,
    {
        self.mem
            .read(
                |bytes: &[u8], _: Option<()>| Ok::<T, Box<dyn StdError>>(f(bytes)),
                None,
            )
            .map_err(|e| Error::Allocation(format!("dma-buf {:#x} read: {e}", self.phys)))
    }
}

impl Drop for CmaBuffer {
    fn drop(&mut self) {
        debug!("CMA buffer {:#x} freed", self.phys);
    }
}

/// Resolves the physical address behind a mapped virtual address.
fn physical_address(vaddr: usize) -> Result<u64> {
    const PRESENT: u64 = 1 << 63;
    const PFN_MASK: u64 = (1 << 55) - 1;

    let page = page_size();
    let pagemap = File::open("/proc/self/pagemap")
        .map_err(|e| Error::Allocation(format!("/proc/self/pagemap: {e}")))?;
    let mut entry = [0u8; 8];
    pagemap
        .read_exact_at(&mut entry, (vaddr / page * 8) as u64)
        .map_err(|e| Error::Allocation(format!("pagemap entry: {e}")))?;
    let entry = u64::from_ne_bytes(entry);

    let pfn = entry & PFN_MASK;
    if entry & PRESENT == 0 || pfn == 0 {
        return Err(Error::Allocation(
            "physical address unavailable (CAP_SYS_ADMIN required)".to_string(),
        ));
    }
    Ok(pfn * page as u64 + (vaddr % page) as u64)
}

/// Input and output buffers for one frame geometry.
pub struct BufferPair<B> {
    pub input: B,
    pub output: B,
}

/// Owns the single input/output buffer pair, sized to the current geometry.
///
/// Each buffer holds one 64-bit word per pixel. In the input buffer byte 0
/// of every word carries the pixel intensity; bytes 1–4 of word 0 carry the
/// frame height and width (little-endian u16 each), which is how the
/// accelerator learns the geometry of its otherwise uniform byte stream.
///
/// The pool does not know about transfers. Callers must not call
/// [`BufferPool::ensure`] or [`BufferPool::release`] while the engine still
/// owns the buffers.
pub struct BufferPool<A: DmaAllocator> {
    allocator: A,
    pair: Option<BufferPair<A::Buffer>>,
    geometry: Option<Geometry>,
    reallocations: u64,
}

impl<A: DmaAllocator> BufferPool<A> {
    pub fn new(allocator: A) -> Self {
        Self {
            allocator,
            pair: None,
            geometry: None,
            reallocations: 0,
        }
    }

    /// Geometry of the current pair, if any.
    pub fn geometry(&self) -> Option<Geometry> {
        self.geometry
    }

    /// Number of times a pair has been allocated.
    pub fn reallocations(&self) -> u64 {
        self.reallocations
    }

    pub fn pair(&self) -> Option<&BufferPair<A::Buffer>> {
        self.pair.as_ref()
    }

    /// Makes sure a pair sized for `geometry` exists, releasing the previous
    /// pair before allocating its replacement. Returns whether a new pair was
    /// allocated.
    pub fn ensure(&mut self, geometry: Geometry) -> Result<bool> {
        if self.pair.is_some() && self.geometry == Some(geometry) {
            return Ok(false);
        }
        self.release();

        let len = geometry
            .pixels()
            .checked_mul(BYTES_PER_PIXEL)
            .ok_or_else(|| Error::Allocation(format!("{geometry} frame overflows")))?;
        let input = self.allocator.allocate(len)?;
        let output = self.allocator.allocate(len)?;

        self.pair = Some(BufferPair { input, output });
        self.geometry = Some(geometry);
        self.reallocations += 1;
        info!("re-init DMA buffers {} ({} bytes each)", geometry, len);
        Ok(true)
    }

    /// Drops the current pair.
    pub fn release(&mut self) {
        if let Some(pair) = self.pair.take() {
            drop(pair);
            debug!("released DMA buffers {:?}", self.geometry);
        }
        self.geometry = None;
    }

    fn pair_for(&mut self, geometry: Geometry) -> Result<&mut BufferPair<A::Buffer>> {
        match (self.pair.as_mut(), self.geometry) {
            (Some(pair), Some(current)) if current == geometry => Ok(pair),
            _ => Err(Error::Allocation(format!(
                "no DMA buffers for {geometry} (current {:?})",
                self.geometry
            ))),
        }
    }

    /// Copies the image into the input lanes, writes the geometry side
    /// channel into word 0 and flushes the input buffer.
    pub fn stage(&mut self, image: &GrayImage) -> Result<()> {
        let geometry = image.geometry();
        let input = &mut self.pair_for(geometry)?.input;

        input.write_with(|words| {
            for (lane, &px) in words.chunks_exact_mut(BYTES_PER_PIXEL).zip(image.as_slice()) {
                lane[0] = px;
            }
            words[1..3].copy_from_slice(&geometry.height.to_le_bytes());
            words[3..5].copy_from_slice(&geometry.width.to_le_bytes());
        })
    }

    /// Physical addresses of the (input, output) buffers.
    pub fn physical_addresses(&self) -> Result<(u64, u64)> {
        self.pair
            .as_ref()
            .map(|p| (p.input.phys_addr(), p.output.phys_addr()))
            .ok_or_else(|| Error::Allocation("no DMA buffers allocated".to_string()))
    }

    /// Invalidates the output buffer and hands its bytes to `f`.
    pub fn read_output<T>(&mut self, f: impl Fn(&[u8]) -> T) -> Result<T> {
        self.pair
            .as_mut()
            .ok_or_else(|| Error::Allocation("no DMA buffers allocated".to_string()))?
            .output
            .read_with(f)
    }
}
