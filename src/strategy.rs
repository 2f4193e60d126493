// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Corner detection strategies.
//!
//! A strategy is chosen once at startup and shared by every session:
//!
//! - [`HardwareStrategy`] drives the accelerator through the VDMA engine.
//!   There is one accelerator, so the whole per-frame sequence runs under a
//!   single lock and concurrent sessions queue for it.
//! - [`SoftwareStrategy`] runs a [`KeypointDetector`] on the CPU and holds
//!   no shared state.

use crate::{
    corner::{decode_corners_le, Corner, Strength},
    dma::{BufferPool, DmaAllocator},
    error::Result,
    fast::KeypointDetector,
    image::GrayImage,
    mmio::RegisterIo,
    vdma::{VdmaController, VdmaState, DEFAULT_COMPLETION_TIMEOUT, DEFAULT_RESET_TIMEOUT},
};
use parking_lot::Mutex;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Turns one grayscale frame into corner records.
pub trait CornerStrategy: Send + Sync {
    /// Short tag identifying the strategy in per-frame logs.
    fn mode(&self) -> &'static str;

    /// Detects corners in `image`.
    ///
    /// # Errors
    ///
    /// Any error is fatal to the calling session only.
    fn detect(&self, image: &GrayImage) -> Result<Vec<Corner>>;
}

/// CPU fallback built on a keypoint detector.
///
/// Every point is reported strong. The score is the detector response,
/// saturated to `u16`, or the threshold when the detector reports no
/// response.
pub struct SoftwareStrategy<D> {
    detector: D,
    threshold: u8,
}

impl<D: KeypointDetector> SoftwareStrategy<D> {
    pub fn new(detector: D, threshold: u8) -> Self {
        Self {
            detector,
            threshold,
        }
    }
}

impl<D: KeypointDetector> CornerStrategy for SoftwareStrategy<D> {
    fn mode(&self) -> &'static str {
        "CPU"
    }

    fn detect(&self, image: &GrayImage) -> Result<Vec<Corner>> {
        let corners = self
            .detector
            .detect(image, self.threshold)
            .into_iter()
            .map(|kp| Corner {
                x: kp.x as u16,
                y: kp.y as u16,
                strength: Strength::Strong,
                score: if kp.response != 0.0 {
                    kp.response as u16
                } else {
                    self.threshold as u16
                },
            })
            .collect();
        Ok(corners)
    }
}

/// Everything the hardware path owns: the VDMA engine, the buffer pair and
/// the reconfiguration policy.
pub struct HardwareContext<R: RegisterIo, A: DmaAllocator> {
    vdma: VdmaController<R>,
    pool: BufferPool<A>,
    reset_per_frame: bool,
    completion_timeout: Duration,
    reset_timeout: Duration,
    reconfigurations: u64,
}

impl<R: RegisterIo, A: DmaAllocator> HardwareContext<R, A> {
    pub fn new(regs: R, allocator: A) -> Self {
        Self {
            vdma: VdmaController::new(regs),
            pool: BufferPool::new(allocator),
            reset_per_frame: false,
            completion_timeout: DEFAULT_COMPLETION_TIMEOUT,
            reset_timeout: DEFAULT_RESET_TIMEOUT,
            reconfigurations: 0,
        }
    }

    /// Soft-resets the engine before every frame.
    pub fn with_reset_per_frame(mut self, enabled: bool) -> Self {
        self.reset_per_frame = enabled;
        self
    }

    pub fn with_completion_timeout(mut self, timeout: Duration) -> Self {
        self.completion_timeout = timeout;
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    pub fn reset_per_frame(&self) -> bool {
        self.reset_per_frame
    }

    /// Number of geometry changes that required new buffers and a
    /// controller reconfiguration.
    pub fn reconfigurations(&self) -> u64 {
        self.reconfigurations
    }

    pub fn vdma(&self) -> &VdmaController<R> {
        &self.vdma
    }

    /// Runs one frame through the accelerator: stage, trigger, wait, decode.
    ///
    /// # Errors
    ///
    /// Geometry the engine cannot express, allocation failures and
    /// completion timeouts. After a timeout the engine is reset at the start
    /// of the next call, before any buffer is touched.
    #[instrument(skip_all, fields(geometry = %image.geometry()))]
    pub fn process(&mut self, image: &GrayImage) -> Result<Vec<Corner>> {
        let geometry = image.geometry();
        VdmaController::<R>::supports(geometry)?;

        if self.vdma.transfer_outstanding() {
            warn!(
                "vdma left in {} by a previous frame, resetting",
                self.vdma.state()
            );
            self.vdma.soft_reset(self.reset_timeout);
        }

        let reallocated = self.pool.ensure(geometry)?;
        if reallocated {
            self.reconfigurations += 1;
        }
        if reallocated || self.vdma.state() == VdmaState::Uninitialized {
            self.vdma.configure(geometry.width)?;
        }

        self.pool.stage(image)?;

        if self.reset_per_frame {
            self.vdma.soft_reset(self.reset_timeout);
            self.vdma.configure(geometry.width)?;
        }

        let (in_phys, out_phys) = self.pool.physical_addresses()?;
        self.vdma.start(in_phys, out_phys, geometry.height)?;
        self.vdma.wait_complete(self.completion_timeout)?;

        let corners = self.pool.read_output(decode_corners_le)?;
        debug!("decoded {} corners", corners.len());
        Ok(corners)
    }
}

impl<R: RegisterIo, A: DmaAllocator> Drop for HardwareContext<R, A> {
    fn drop(&mut self) {
        if self.vdma.transfer_outstanding() {
            self.vdma.soft_reset(self.reset_timeout);
        }
        self.pool.release();
    }
}

/// Hardware path shared by all sessions through one lock.
pub struct HardwareStrategy<R: RegisterIo, A: DmaAllocator> {
    context: Mutex<HardwareContext<R, A>>,
    mode: &'static str,
}

impl<R: RegisterIo, A: DmaAllocator> HardwareStrategy<R, A> {
    /// Wraps `context`; frames are tagged `FPGA`, or `RST` when the context
    /// resets every frame.
    pub fn new(context: HardwareContext<R, A>) -> Self {
        Self::with_mode(context, "FPGA")
    }

    /// Wraps `context` with a custom tag for frames without per-frame reset.
    pub fn with_mode(context: HardwareContext<R, A>, mode: &'static str) -> Self {
        let mode = if context.reset_per_frame() { "RST" } else { mode };
        Self {
            context: Mutex::new(context),
            mode,
        }
    }

    pub fn reconfigurations(&self) -> u64 {
        self.context.lock().reconfigurations()
    }
}

impl<R, A> CornerStrategy for HardwareStrategy<R, A>
where
    R: RegisterIo,
    A: DmaAllocator,
{
    fn mode(&self) -> &'static str {
        self.mode
    }

    fn detect(&self, image: &GrayImage) -> Result<Vec<Corner>> {
        self.context.lock().process(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::Error,
        fast::{FastDetector, Keypoint},
        image::Geometry,
        sim::{SimAccelerator, SimAllocator, SimRegisters},
    };

    fn sim_context(sim: &SimAccelerator) -> HardwareContext<SimRegisters, SimAllocator> {
        HardwareContext::new(sim.registers(), sim.allocator())
            .with_completion_timeout(Duration::from_millis(50))
    }

    /// Bright square on a dark background.
    fn square(size: u16) -> GrayImage {
        let mut img = GrayImage::new(Geometry::new(size, size));
        let (lo, hi) = (size as usize / 4, size as usize * 3 / 4);
        for y in lo..hi {
            for x in lo..hi {
                img.set(x, y, 200);
            }
        }
        img
    }

    #[test]
    fn test_hardware_matches_kernel() {
        let sim = SimAccelerator::new(30);
        let mut ctx = sim_context(&sim);
        let img = square(32);
        let corners = ctx.process(&img).unwrap();

        let expected = FastDetector::default().detect(&img, 30);
        assert!(!corners.is_empty());
        assert_eq!(corners.len(), expected.len());
        for (c, k) in corners.iter().zip(&expected) {
            assert_eq!((c.x, c.y), (k.x as u16, k.y as u16));
            assert!(c.score > 0);
        }
        assert_eq!(ctx.vdma().state(), VdmaState::Complete);
    }

    #[test]
    fn test_same_geometry_no_reconfiguration() {
        let sim = SimAccelerator::new(30);
        let mut ctx = sim_context(&sim);
        let img = square(16);
        ctx.process(&img).unwrap();
        ctx.process(&img).unwrap();
        assert_eq!(ctx.reconfigurations(), 1);
        assert_eq!(sim.stats().allocations, 2);
        assert_eq!(sim.stats().transfers, 2);
    }

    #[test]
    fn test_geometry_change_reconfigures_once() {
        let sim = SimAccelerator::new(30);
        let mut ctx = sim_context(&sim);
        ctx.process(&square(16)).unwrap();
        ctx.process(&square(24)).unwrap();
        assert_eq!(ctx.reconfigurations(), 2);
        assert_eq!(ctx.vdma().width(), Some(24));
        assert_eq!(sim.live_buffers(), 2);
        assert_eq!(sim.stats().releases, 2);

        ctx.process(&square(24)).unwrap();
        assert_eq!(ctx.reconfigurations(), 2);
    }

    #[test]
    fn test_reset_per_frame() {
        let sim = SimAccelerator::new(30);
        let ctx = sim_context(&sim).with_reset_per_frame(true);
        let strategy = HardwareStrategy::new(ctx);
        assert_eq!(strategy.mode(), "RST");

        let img = square(16);
        let a = strategy.detect(&img).unwrap();
        let b = strategy.detect(&img).unwrap();
        assert_eq!(a, b);
        assert_eq!(sim.stats().resets, 2);
        assert_eq!(strategy.reconfigurations(), 1);
    }

    #[test]
    fn test_timeout_then_recovery() {
        let sim = SimAccelerator::new(30);
        let mut ctx = sim_context(&sim);
        let img = square(16);

        sim.set_stalled(true);
        assert!(matches!(ctx.process(&img), Err(Error::HardwareTimeout(_))));
        assert!(ctx.vdma().transfer_outstanding());

        sim.set_stalled(false);
        let corners = ctx.process(&img).unwrap();
        assert!(!corners.is_empty());
        assert_eq!(sim.stats().resets, 1);
        assert_eq!(sim.stats().overlaps, 0);
    }

    #[test]
    fn test_unsupported_geometry() {
        let sim = SimAccelerator::new(30);
        let mut ctx = sim_context(&sim);
        let img = GrayImage::new(Geometry::new(1, 8192));
        assert!(matches!(ctx.process(&img), Err(Error::Geometry { .. })));
        assert_eq!(sim.stats().allocations, 0);
    }

    #[test]
    fn test_allocation_failure() {
        let sim = SimAccelerator::new(30);
        let mut ctx = sim_context(&sim);
        sim.fail_allocations(true);
        assert!(matches!(
            ctx.process(&square(16)),
            Err(Error::Allocation(_))
        ));
        sim.fail_allocations(false);
        assert!(ctx.process(&square(16)).is_ok());
    }

    #[test]
    fn test_drop_releases_buffers() {
        let sim = SimAccelerator::new(30);
        let mut ctx = sim_context(&sim);
        ctx.process(&square(16)).unwrap();
        assert_eq!(sim.live_buffers(), 2);
        drop(ctx);
        assert_eq!(sim.live_buffers(), 0);
    }

    struct Fixed(Vec<Keypoint>);

    impl KeypointDetector for Fixed {
        fn detect(&self, _image: &GrayImage, _threshold: u8) -> Vec<Keypoint> {
            self.0.clone()
        }
    }

    #[test]
    fn test_software_scores() {
        let detector = Fixed(vec![
            Keypoint {
                x: 4.0,
                y: 5.0,
                response: 77.6,
            },
            Keypoint {
                x: 6.0,
                y: 7.0,
                response: 0.0,
            },
        ]);
        let strategy = SoftwareStrategy::new(detector, 25);
        assert_eq!(strategy.mode(), "CPU");

        let corners = strategy
            .detect(&GrayImage::new(Geometry::new(8, 8)))
            .unwrap();
        assert_eq!(
            corners,
            vec![
                Corner {
                    x: 4,
                    y: 5,
                    strength: Strength::Strong,
                    score: 77
                },
                Corner {
                    x: 6,
                    y: 7,
                    strength: Strength::Strong,
                    score: 25
                },
            ]
        );
    }

    #[test]
    fn test_software_is_uncapped() {
        let keypoints = (0..25_000)
            .map(|i| Keypoint {
                x: (i % 200) as f32,
                y: (i / 200) as f32,
                response: 40.0,
            })
            .collect();
        let strategy = SoftwareStrategy::new(Fixed(keypoints), 25);
        let corners = strategy
            .detect(&GrayImage::new(Geometry::new(125, 200)))
            .unwrap();
        assert_eq!(corners.len(), 25_000);
        assert_eq!(corners[24_999].x, 199);
        assert_eq!(corners[24_999].y, 124);
    }

    #[test]
    fn test_software_fast() {
        let strategy = SoftwareStrategy::new(FastDetector::default(), 30);
        let corners = strategy.detect(&square(32)).unwrap();
        assert!(!corners.is_empty());
        assert!(corners.iter().all(|c| c.strength == Strength::Strong));
    }
}
