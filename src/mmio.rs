// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::error::{Error, Result};
use libc::{c_void, mmap, munmap, MAP_FAILED, MAP_SHARED, PROT_READ, PROT_WRITE};
use std::{
    fs::OpenOptions,
    os::{fd::AsRawFd, unix::fs::OpenOptionsExt},
    ptr::null_mut,
};
use tracing::{debug, warn};

/// 32-bit register access to a memory-mapped peripheral.
///
/// Offsets are in bytes from the start of the peripheral's register block.
/// Implementations are shared between threads only through the hardware
/// context lock, so `&self` access is sufficient.
pub trait RegisterIo: Send {
    fn read(&self, offset: usize) -> u32;
    fn write(&self, offset: usize, value: u32);
}

/// Register block mapped from `/dev/mem`.
///
/// The mapping is released when dropped.
pub struct Mmio {
    base: *mut u8,
    map_len: usize,
    page_offset: usize,
    size: usize,
}

// The mapping is plain device memory; all access goes through volatile
// reads and writes.
unsafe impl Send for Mmio {}

impl Mmio {
    /// Maps `size` bytes of physical address space starting at `phys_addr`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `/dev/mem` cannot be opened (usually
    /// insufficient privileges) or the mapping is refused by the kernel.
    pub fn open(phys_addr: u64, size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open("/dev/mem")
            .map_err(|e| Error::Configuration(format!("/dev/mem: {e}")))?;

        let page = page_size();
        let page_offset = (phys_addr % page as u64) as usize;
        let map_len = page_offset + size;
        let map_base = phys_addr - page_offset as u64;

        let ptr = unsafe {
            mmap(
                null_mut(),
                map_len,
                PROT_READ | PROT_WRITE,
                MAP_SHARED,
                file.as_raw_fd(),
                map_base as libc::off_t,
            )
        };
        if ptr == MAP_FAILED {
            return Err(Error::Configuration(format!(
                "mmap {phys_addr:#x}+{size:#x}: {}",
                std::io::Error::last_os_error()
            )));
        }
        debug!("mapped registers {:#x}+{:#x}", phys_addr, size);

        Ok(Self {
            base: ptr.cast::<u8>(),
            map_len,
            page_offset,
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn register(&self, offset: usize) -> *mut u32 {
        assert!(
            offset % 4 == 0 && offset + 4 <= self.size,
            "register offset {offset:#x} outside {:#x}-byte block",
            self.size
        );
        unsafe { self.base.add(self.page_offset + offset).cast::<u32>() }
    }
}

impl RegisterIo for Mmio {
    fn read(&self, offset: usize) -> u32 {
        unsafe { self.register(offset).read_volatile() }
    }

    fn write(&self, offset: usize, value: u32) {
        unsafe { self.register(offset).write_volatile(value) }
    }
}

impl Drop for Mmio {
    fn drop(&mut self) {
        if unsafe { munmap(self.base.cast::<c_void>(), self.map_len) } != 0 {
            warn!("register unmap failed!");
        }
    }
}

pub(crate) fn page_size() -> usize {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        n if n > 0 => n as usize,
        _ => 4096,
    }
}
