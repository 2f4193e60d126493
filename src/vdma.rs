// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Register-level control of the AXI VDMA engine feeding the accelerator.
//!
//! The engine has an outbound channel (MM2S, memory to stream) carrying the
//! packed input words into the accelerator and an inbound channel (S2MM,
//! stream to memory) writing result words back. Both channels move `H`
//! lines of `8×W` bytes per frame.
//!
//! ```text
//!                    configure            start             wait_complete
//!  Uninitialized ───────────────► Configured ──────► Armed ───────────────► WaitingComplete
//!        ▲                                             ▲                         │
//!        │ soft_reset                                  │ start                   │ both IOC set
//!        │                                             │                         ▼
//!    Resetting ◄─────────── (any state) ◄──────────── Complete ◄─────────────────┘
//! ```

use crate::{
    error::{Error, Result},
    image::Geometry,
    mmio::RegisterIo,
};
use std::{
    fmt,
    time::{Duration, Instant},
};
use tracing::{debug, warn};

/// MM2S (memory to stream) control register
pub const MM2S_DMACR: usize = 0x00;
/// MM2S status register
pub const MM2S_DMASR: usize = 0x04;
/// MM2S vertical size; writing it starts the transfer
pub const MM2S_VSIZE: usize = 0x50;
/// MM2S horizontal size in bytes
pub const MM2S_HSIZE: usize = 0x54;
/// MM2S line stride in bytes
pub const MM2S_STRIDE: usize = 0x58;
/// MM2S frame buffer 0 start address
pub const MM2S_START_ADDR: usize = 0x5C;

/// S2MM (stream to memory) control register
pub const S2MM_DMACR: usize = 0x30;
/// S2MM status register
pub const S2MM_DMASR: usize = 0x34;
/// S2MM vertical size; writing it arms the channel
pub const S2MM_VSIZE: usize = 0xA0;
/// S2MM horizontal size in bytes
pub const S2MM_HSIZE: usize = 0xA4;
/// S2MM line stride in bytes
pub const S2MM_STRIDE: usize = 0xA8;
/// S2MM frame buffer 0 start address
pub const S2MM_START_ADDR: usize = 0xAC;

/// Smallest register span that covers every register used here.
pub const REGISTER_SPAN: usize = S2MM_START_ADDR + 4;

/// DMACR run/stop
pub const DMACR_RS: u32 = 1 << 0;
/// DMACR soft reset, self-clearing
pub const DMACR_RESET: u32 = 1 << 2;
/// DMASR frame-count (completion) interrupt flag, write one to clear
pub const DMASR_IOC_IRQ: u32 = 1 << 12;
/// Writing all ones to DMASR clears every flag
pub const DMASR_CLEAR_ALL: u32 = 0xFFFF_FFFF;

/// Bytes per pixel lane in the packed input/output stream.
pub const BYTES_PER_PIXEL: usize = 8;

/// Largest line size the 16-bit HSIZE field can hold.
const MAX_HSIZE: usize = 0xFFFF;
/// Largest line count the 13-bit VSIZE field can hold.
const MAX_VSIZE: u16 = 0x1FFF;

/// Default completion deadline.
pub const DEFAULT_COMPLETION_TIMEOUT: Duration = Duration::from_secs(2);
/// Default soft reset poll deadline.
pub const DEFAULT_RESET_TIMEOUT: Duration = Duration::from_millis(10);

const CHANNELS: [(usize, usize); 2] = [(MM2S_DMACR, MM2S_DMASR), (S2MM_DMACR, S2MM_DMASR)];

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VdmaState {
    Uninitialized,
    Configured,
    Armed,
    WaitingComplete,
    Complete,
    Resetting,
}

impl VdmaState {
    pub const fn name(self) -> &'static str {
        match self {
            VdmaState::Uninitialized => "UNINITIALIZED",
            VdmaState::Configured => "CONFIGURED",
            VdmaState::Armed => "ARMED",
            VdmaState::WaitingComplete => "WAITING_COMPLETE",
            VdmaState::Complete => "COMPLETE",
            VdmaState::Resetting => "RESETTING",
        }
    }
}

impl fmt::Display for VdmaState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Drives one VDMA instance through configure/start/wait/reset.
pub struct VdmaController<R> {
    regs: R,
    state: VdmaState,
    width: Option<u16>,
}

impl<R: RegisterIo> VdmaController<R> {
    pub fn new(regs: R) -> Self {
        Self {
            regs,
            state: VdmaState::Uninitialized,
            width: None,
        }
    }

    pub fn state(&self) -> VdmaState {
        self.state
    }

    /// Width the channels are currently programmed for.
    pub fn width(&self) -> Option<u16> {
        self.width
    }

    pub fn registers(&self) -> &R {
        &self.regs
    }

    /// True while a started transfer has not been acknowledged. Buffers must
    /// not be released in this state.
    pub fn transfer_outstanding(&self) -> bool {
        matches!(self.state, VdmaState::Armed | VdmaState::WaitingComplete)
    }

    /// Checks the geometry against the engine's size fields.
    pub fn supports(geometry: Geometry) -> Result<()> {
        let fault = |reason| Error::Geometry {
            width: geometry.width,
            height: geometry.height,
            reason,
        };
        if geometry.is_empty() {
            return Err(fault("empty frame"));
        }
        if geometry.width as usize * BYTES_PER_PIXEL > MAX_HSIZE {
            return Err(fault("line exceeds 16-bit HSIZE"));
        }
        if geometry.height > MAX_VSIZE {
            return Err(fault("height exceeds 13-bit VSIZE"));
        }
        Ok(())
    }

    /// Clears status, starts both channels and programs line geometry for
    /// `width` pixels per line.
    pub fn configure(&mut self, width: u16) -> Result<()> {
        if self.transfer_outstanding() {
            return Err(self.invalid("configure"));
        }
        let bpl = (BYTES_PER_PIXEL * width as usize) as u32;

        self.regs.write(MM2S_DMASR, DMASR_CLEAR_ALL);
        self.regs.write(S2MM_DMASR, DMASR_CLEAR_ALL);
        self.regs.write(MM2S_DMACR, DMACR_RS);
        self.regs.write(S2MM_DMACR, DMACR_RS);
        self.regs.write(MM2S_STRIDE, bpl);
        self.regs.write(MM2S_HSIZE, bpl);
        self.regs.write(S2MM_STRIDE, bpl);
        self.regs.write(S2MM_HSIZE, bpl);

        self.state = VdmaState::Configured;
        self.width = Some(width);
        debug!("vdma configured for {} bytes per line", bpl);
        Ok(())
    }

    /// Soft-resets both channels, polling up to `timeout` for the reset bits
    /// to self-clear. A reset that does not finish in time is logged, not
    /// returned; the controller must be configured again afterwards.
    ///
    /// Returns whether both channels reported reset completion.
    pub fn soft_reset(&mut self, timeout: Duration) -> bool {
        self.state = VdmaState::Resetting;
        for (cr, _) in CHANNELS {
            let v = self.regs.read(cr);
            self.regs.write(cr, v | DMACR_RESET);
        }

        let deadline = Instant::now() + timeout;
        let done = loop {
            let pending = CHANNELS
                .iter()
                .any(|&(cr, _)| self.regs.read(cr) & DMACR_RESET != 0);
            if !pending {
                break true;
            }
            if Instant::now() > deadline {
                break false;
            }
            std::hint::spin_loop();
        };
        if !done {
            warn!("vdma soft reset did not complete within {:?}", timeout);
        }

        for (_, sr) in CHANNELS {
            self.regs.write(sr, DMASR_CLEAR_ALL);
        }
        self.state = VdmaState::Uninitialized;
        self.width = None;
        done
    }

    /// Programs buffer addresses and kicks off a transfer of `height` lines.
    ///
    /// The vertical size is written last because that write is what starts
    /// the engine.
    pub fn start(&mut self, in_phys: u64, out_phys: u64, height: u16) -> Result<()> {
        if !matches!(self.state, VdmaState::Configured | VdmaState::Complete) {
            return Err(self.invalid("start"));
        }
        let in_addr = low_address(in_phys)?;
        let out_addr = low_address(out_phys)?;

        self.regs.write(MM2S_DMASR, DMASR_CLEAR_ALL);
        self.regs.write(S2MM_DMASR, DMASR_CLEAR_ALL);
        self.regs.write(MM2S_START_ADDR, in_addr);
        self.regs.write(S2MM_START_ADDR, out_addr);
        self.regs.write(S2MM_VSIZE, height as u32);
        self.regs.write(MM2S_VSIZE, height as u32);

        self.state = VdmaState::Armed;
        Ok(())
    }

    /// Polls both status registers until both completion flags are set, then
    /// acknowledges them.
    ///
    /// # Errors
    ///
    /// [`Error::HardwareTimeout`] when the deadline passes first. The
    /// controller stays in `WaitingComplete`; the engine must be reset before
    /// its buffers are touched again.
    pub fn wait_complete(&mut self, timeout: Duration) -> Result<()> {
        if !matches!(self.state, VdmaState::Armed | VdmaState::WaitingComplete) {
            return Err(self.invalid("wait_complete"));
        }
        self.state = VdmaState::WaitingComplete;

        let deadline = Instant::now() + timeout;
        loop {
            let mm2s = self.regs.read(MM2S_DMASR);
            let s2mm = self.regs.read(S2MM_DMASR);
            if mm2s & DMASR_IOC_IRQ != 0 && s2mm & DMASR_IOC_IRQ != 0 {
                self.regs.write(MM2S_DMASR, DMASR_IOC_IRQ);
                self.regs.write(S2MM_DMASR, DMASR_IOC_IRQ);
                self.state = VdmaState::Complete;
                return Ok(());
            }
            if Instant::now() > deadline {
                return Err(Error::HardwareTimeout(timeout));
            }
            std::hint::spin_loop();
        }
    }

    fn invalid(&self, operation: &'static str) -> Error {
        Error::InvalidState {
            operation,
            state: self.state.name(),
        }
    }
}

fn low_address(phys: u64) -> Result<u32> {
    u32::try_from(phys).map_err(|_| {
        Error::Allocation(format!(
            "buffer at {phys:#x} is outside the 32-bit VDMA address window"
        ))
    })
}
