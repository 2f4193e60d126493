// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Hardware-free stand-in for the VDMA engine and corner accelerator.
//!
//! [`SimAccelerator`] provides both capabilities the hardware path needs: a
//! register file ([`SimRegisters`]) and a contiguous allocator
//! ([`SimAllocator`]). It models the parts of the hardware contract the
//! control plane must get right:
//!
//! | Behaviour | Model |
//! |-----------|-------|
//! | DMASR flags | Write-one-to-clear |
//! | DMACR reset | Self-clearing, halts the channel |
//! | Transfer trigger | Write to MM2S VSIZE with both channels running |
//! | Cache coherence | None: device memory only changes on write-back, CPU views only on invalidate |
//! | Completion | IOC set on both channels once the kernel has written the output |
//!
//! The kernel reads the geometry side channel from word 0, runs FAST on the
//! intensity lanes and writes one packed result word per pixel.

use crate::{
    corner::CornerWord,
    dma::{DmaAllocator, DmaBuffer},
    error::{Error, Result},
    fast::{FastDetector, KeypointDetector},
    image::{Geometry, GrayImage},
    mmio::RegisterIo,
    vdma::{
        BYTES_PER_PIXEL, DMACR_RESET, DMACR_RS, DMASR_CLEAR_ALL, DMASR_IOC_IRQ, MM2S_DMACR,
        MM2S_DMASR, MM2S_HSIZE, MM2S_START_ADDR, MM2S_VSIZE, S2MM_DMACR, S2MM_DMASR,
        S2MM_HSIZE, S2MM_START_ADDR,
    },
};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tracing::{trace, warn};

/// DMASR internal error flag.
pub const DMASR_INTERNAL_ERR: u32 = 1 << 4;

const PHYS_BASE: u64 = 0x1000_0000;
const PHYS_ALIGN: u64 = 0x1000;

/// Responses at or above `STRONG_RATIO × threshold` are flagged strong.
const STRONG_RATIO: f32 = 2.0;

/// Counters describing what the simulated hardware has seen.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SimStats {
    /// Transfers triggered
    pub transfers: u64,
    /// Transfers completed
    pub completions: u64,
    /// Status cleared or transfer triggered while a previous transfer was
    /// still unacknowledged
    pub overlaps: u64,
    /// Soft resets observed
    pub resets: u64,
    /// Buffers allocated
    pub allocations: u64,
    /// Buffers released
    pub releases: u64,
    /// Largest number of buffers alive at once
    pub peak_live_buffers: usize,
}

struct Device {
    regs: HashMap<usize, u32>,
    memory: HashMap<u64, Vec<u8>>,
    next_phys: u64,
    detector: FastDetector,
    threshold: u8,
    stalled: bool,
    fail_allocations: bool,
    busy: bool,
    stats: SimStats,
}

impl Device {
    fn reg(&self, offset: usize) -> u32 {
        self.regs.get(&offset).copied().unwrap_or(0)
    }

    fn set_flags(&mut self, offset: usize, flags: u32) {
        *self.regs.entry(offset).or_insert(0) |= flags;
    }

    fn write(&mut self, offset: usize, value: u32) {
        match offset {
            MM2S_DMASR | S2MM_DMASR => {
                if self.busy {
                    if value == DMASR_IOC_IRQ {
                        if offset == S2MM_DMASR {
                            self.busy = false;
                        }
                    } else if value == DMASR_CLEAR_ALL {
                        warn!("sim: status cleared under an unacknowledged transfer");
                        self.stats.overlaps += 1;
                        self.busy = false;
                    }
                }
                let v = self.reg(offset) & !value;
                self.regs.insert(offset, v);
            }
            MM2S_DMACR | S2MM_DMACR if value & DMACR_RESET != 0 => {
                self.regs.insert(offset, 0);
                self.busy = false;
                if offset == MM2S_DMACR {
                    self.stats.resets += 1;
                }
            }
            MM2S_VSIZE => {
                self.regs.insert(offset, value);
                self.trigger(value as usize);
            }
            _ => {
                self.regs.insert(offset, value);
            }
        }
    }

    fn running(&self) -> bool {
        self.reg(MM2S_DMACR) & DMACR_RS != 0 && self.reg(S2MM_DMACR) & DMACR_RS != 0
    }

    fn trigger(&mut self, lines: usize) {
        if !self.running() {
            return;
        }
        if self.busy {
            warn!("sim: transfer triggered while another is outstanding");
            self.stats.overlaps += 1;
        }
        self.busy = true;
        self.stats.transfers += 1;
        if self.stalled {
            return;
        }

        match self.run_kernel(lines) {
            Ok(()) => {
                self.set_flags(MM2S_DMASR, DMASR_IOC_IRQ);
                self.set_flags(S2MM_DMASR, DMASR_IOC_IRQ);
                self.stats.completions += 1;
            }
            Err(e) => {
                warn!("sim: transfer failed: {e}");
                self.set_flags(MM2S_DMASR, DMASR_INTERNAL_ERR);
                self.set_flags(S2MM_DMASR, DMASR_INTERNAL_ERR);
            }
        }
    }

    fn run_kernel(&mut self, lines: usize) -> Result<()> {
        let hsize = self.reg(MM2S_HSIZE) as usize;
        if hsize != self.reg(S2MM_HSIZE) as usize || hsize % BYTES_PER_PIXEL != 0 {
            return Err(Error::Protocol(format!("channel line sizes disagree ({hsize})")));
        }
        let len = hsize * lines;
        let in_addr = self.reg(MM2S_START_ADDR) as u64;
        let out_addr = self.reg(S2MM_START_ADDR) as u64;

        let input = self
            .memory
            .get(&in_addr)
            .filter(|m| m.len() >= len && len >= 5)
            .ok_or_else(|| Error::Protocol(format!("no {len}-byte input at {in_addr:#x}")))?;

        let geometry = Geometry::new(
            u16::from_le_bytes([input[1], input[2]]),
            u16::from_le_bytes([input[3], input[4]]),
        );
        if geometry.pixels() * BYTES_PER_PIXEL != len || geometry.height as usize != lines {
            return Err(Error::Protocol(format!(
                "side channel {geometry} disagrees with {lines} lines of {hsize} bytes"
            )));
        }
        let pixels = input[..len].iter().step_by(BYTES_PER_PIXEL).copied().collect();
        let image = GrayImage::from_vec(geometry, pixels)
            .ok_or_else(|| Error::Protocol("input plane size".to_string()))?;

        let threshold = self.threshold;
        let keypoints = self.detector.detect(&image, threshold);

        let output = self
            .memory
            .get_mut(&out_addr)
            .filter(|m| m.len() >= len)
            .ok_or_else(|| Error::Protocol(format!("no {len}-byte output at {out_addr:#x}")))?;
        output[..len].fill(0);
        let width = geometry.width as usize;
        for kp in keypoints {
            let (x, y) = (kp.x as u16, kp.y as u16);
            let score = (kp.response as u32).clamp(1, CornerWord::MAX_SCORE as u32) as u16;
            let strong = kp.response >= STRONG_RATIO * threshold as f32;
            let idx = (y as usize * width + x as usize) * BYTES_PER_PIXEL;
            output[idx..idx + BYTES_PER_PIXEL]
                .copy_from_slice(&CornerWord::pack(x, y, strong, score).0.to_le_bytes());
        }
        trace!("sim: kernel processed {}", geometry);
        Ok(())
    }

    fn live_buffers(&self) -> usize {
        self.memory.len()
    }
}

/// Simulated accelerator shared by its register and allocator handles.
#[derive(Clone)]
pub struct SimAccelerator {
    device: Arc<Mutex<Device>>,
}

impl SimAccelerator {
    /// Creates an accelerator whose kernel runs FAST-9 with `threshold`.
    pub fn new(threshold: u8) -> Self {
        Self {
            device: Arc::new(Mutex::new(Device {
                regs: HashMap::new(),
                memory: HashMap::new(),
                next_phys: PHYS_BASE,
                detector: FastDetector::default(),
                threshold,
                stalled: false,
                fail_allocations: false,
                busy: false,
                stats: SimStats::default(),
            })),
        }
    }

    pub fn registers(&self) -> SimRegisters {
        SimRegisters {
            device: Arc::clone(&self.device),
        }
    }

    pub fn allocator(&self) -> SimAllocator {
        SimAllocator {
            device: Arc::clone(&self.device),
        }
    }

    /// While stalled, triggered transfers never complete.
    pub fn set_stalled(&self, stalled: bool) {
        self.device.lock().stalled = stalled;
    }

    /// While set, every allocation fails.
    pub fn fail_allocations(&self, fail: bool) {
        self.device.lock().fail_allocations = fail;
    }

    pub fn stats(&self) -> SimStats {
        self.device.lock().stats
    }

    pub fn live_buffers(&self) -> usize {
        self.device.lock().live_buffers()
    }

    /// Copy of the device-side contents of the buffer at `phys`.
    pub fn device_memory(&self, phys: u64) -> Option<Vec<u8>> {
        self.device.lock().memory.get(&phys).cloned()
    }
}

/// Register handle of a [`SimAccelerator`].
pub struct SimRegisters {
    device: Arc<Mutex<Device>>,
}

impl RegisterIo for SimRegisters {
    fn read(&self, offset: usize) -> u32 {
        self.device.lock().reg(offset)
    }

    fn write(&self, offset: usize, value: u32) {
        self.device.lock().write(offset, value)
    }
}

/// Allocator handle of a [`SimAccelerator`].
pub struct SimAllocator {
    device: Arc<Mutex<Device>>,
}

impl DmaAllocator for SimAllocator {
    type Buffer = SimBuffer;

    fn allocate(&mut self, len: usize) -> Result<SimBuffer> {
        let mut dev = self.device.lock();
        if dev.fail_allocations {
            return Err(Error::Allocation(format!("sim: {len} bytes refused")));
        }
        let phys = dev.next_phys;
        let span = (len as u64).max(1).div_ceil(PHYS_ALIGN) * PHYS_ALIGN;
        dev.next_phys += span;
        dev.memory.insert(phys, vec![0; len]);
        dev.stats.allocations += 1;
        dev.stats.peak_live_buffers = dev.stats.peak_live_buffers.max(dev.live_buffers());

        Ok(SimBuffer {
            device: Arc::clone(&self.device),
            phys,
            cpu: vec![0; len],
        })
    }
}

/// Buffer with a CPU view that is only synchronised with device memory at
/// access window boundaries.
pub struct SimBuffer {
    device: Arc<Mutex<Device>>,
    phys: u64,
    cpu: Vec<u8>,
}

impl SimBuffer {
    fn not_mapped(&self) -> Error {
        Error::Allocation(format!("sim: {:#x} not mapped", self.phys))
    }
}

impl DmaBuffer for SimBuffer {
    fn phys_addr(&self) -> u64 {
        self.phys
    }

    fn len(&self) -> usize {
        self.cpu.len()
    }

    fn write_with<F>(&mut self, f: F) -> Result<()>
    where
        F: Fn(&mut [u8]),
    {
        f(&mut self.cpu);
        let mut dev = self.device.lock();
        let mem = dev.memory.get_mut(&self.phys).ok_or_else(|| self.not_mapped())?;
        mem.copy_from_slice(&self.cpu);
        Ok(())
    }

    fn read_with<T, F>(&mut self, f: F) -> Result<T>
    where
        F: Fn(&[u8]) -> T,
    {
        {
            let dev = self.device.lock();
            let mem = dev.memory.get(&self.phys).ok_or_else(|| self.not_mapped())?;
            self.cpu.copy_from_slice(mem);
        }
        Ok(f(&self.cpu))
    }
}

impl Drop for SimBuffer {
    fn drop(&mut self) {
        let mut dev = self.device.lock();
        if dev.memory.remove(&self.phys).is_some() {
            dev.stats.releases += 1;
        }
    }
}
