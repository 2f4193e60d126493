// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! FAST (Features from Accelerated Segment Test) keypoint detection on the
//! CPU.
//!
//! For each pixel, 16 samples on a Bresenham circle of radius 3 are compared
//! against the center intensity. The pixel is a corner when at least
//! `arc_length` contiguous samples (wrapping around the circle) are all
//! brighter than `center + threshold` or all darker than `center - threshold`.
//! The response is the summed excess contrast along the longest qualifying
//! arc. A 3-pixel border is never evaluated.

use crate::image::GrayImage;

/// Bresenham circle of radius 3, clockwise from 12 o'clock.
pub const CIRCLE_OFFSETS: [(isize, isize); 16] = [
    (0, -3),
    (1, -3),
    (2, -2),
    (3, -1),
    (3, 0),
    (3, 1),
    (2, 2),
    (1, 3),
    (0, 3),
    (-1, 3),
    (-2, 2),
    (-3, 1),
    (-3, 0),
    (-3, -1),
    (-2, -2),
    (-1, -3),
];

const BORDER: usize = 3;

/// A detected keypoint.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    /// Detector response; larger is a more distinctive corner.
    pub response: f32,
}

/// Keypoint detection on a grayscale plane.
///
/// This is the capability the CPU fallback strategy is built on; anything
/// that can turn an image and a contrast threshold into keypoints fits.
pub trait KeypointDetector: Send + Sync {
    fn detect(&self, image: &GrayImage, threshold: u8) -> Vec<Keypoint>;
}

/// FAST-N detector with optional 3×3 non-maximum suppression.
#[derive(Clone, Debug)]
pub struct FastDetector {
    arc_length: usize,
    nonmax_suppression: bool,
}

impl Default for FastDetector {
    /// FAST-9 with non-maximum suppression.
    fn default() -> Self {
        Self::new(9)
    }
}

impl FastDetector {
    /// Creates a FAST-`arc_length` detector with non-maximum suppression
    /// enabled.
    ///
    /// # Panics
    ///
    /// Panics if `arc_length` is not in `9..=12`.
    pub fn new(arc_length: usize) -> Self {
        assert!(
            (9..=12).contains(&arc_length),
            "arc_length must be 9..=12 (got {arc_length})"
        );
        Self {
            arc_length,
            nonmax_suppression: true,
        }
    }

    pub fn with_nonmax_suppression(mut self, enabled: bool) -> Self {
        self.nonmax_suppression = enabled;
        self
    }

    pub fn arc_length(&self) -> usize {
        self.arc_length
    }

    /// Response map with one entry per pixel, zero where there is no corner.
    fn score_map(&self, image: &GrayImage, threshold: u8) -> Vec<f32> {
        let (w, h) = (image.width(), image.height());
        let mut scores = vec![0.0f32; w * h];
        if w <= 2 * BORDER || h <= 2 * BORDER {
            return scores;
        }

        let px = image.as_slice();
        let stride = w as isize;
        let offsets: [isize; 16] = CIRCLE_OFFSETS.map(|(dx, dy)| dy * stride + dx);
        let thresh = threshold as i16;
        let min_cardinals: u8 = if self.arc_length >= 12 { 3 } else { 2 };

        for y in BORDER..h - BORDER {
            for x in BORDER..w - BORDER {
                let idx = y * w + x;
                let center = px[idx] as i16;
                let sample = |k: usize| px[(idx as isize + offsets[k]) as usize] as i16;

                // high-speed test on the four cardinal points
                let cardinals = [sample(0), sample(4), sample(8), sample(12)];
                let bright = cardinals.iter().filter(|&&p| p > center + thresh).count() as u8;
                let dark = cardinals.iter().filter(|&&p| p < center - thresh).count() as u8;
                if bright < min_cardinals && dark < min_cardinals {
                    continue;
                }

                let mut circle = [0i16; 16];
                for (k, v) in circle.iter_mut().enumerate() {
                    *v = sample(k);
                }
                if let Some(score) = self.corner_score(center, &circle, thresh) {
                    scores[idx] = score;
                }
            }
        }
        scores
    }

    /// Score of the best qualifying arc, or `None` when no arc of
    /// `arc_length` contiguous samples exists.
    fn corner_score(&self, center: i16, circle: &[i16; 16], thresh: i16) -> Option<f32> {
        let mut bright_mask: u16 = 0;
        let mut dark_mask: u16 = 0;
        for (i, &p) in circle.iter().enumerate() {
            let diff = p - center;
            if diff > thresh {
                bright_mask |= 1 << i;
            } else if diff < -thresh {
                dark_mask |= 1 << i;
            }
        }

        [bright_mask, dark_mask]
            .into_iter()
            .filter(|&mask| self.has_arc(mask))
            .map(|mask| arc_score(center, circle, thresh, mask))
            .reduce(f32::max)
    }

    /// Tests for `arc_length` contiguous set bits in a circular 16-bit mask.
    fn has_arc(&self, mask: u16) -> bool {
        if (mask.count_ones() as usize) < self.arc_length {
            return false;
        }
        let m32 = (mask as u32) | ((mask as u32) << 16);
        let mut acc = m32;
        for _ in 1..self.arc_length {
            acc &= acc >> 1;
        }
        acc != 0
    }
}

/// Sums `|p - center| - threshold` along the longest run in `mask`.
fn arc_score(center: i16, circle: &[i16; 16], thresh: i16, mask: u16) -> f32 {
    let m32 = (mask as u32) | ((mask as u32) << 16);
    let (mut best_start, mut best_len) = (0usize, 0usize);
    let mut i = 0u32;
    while i < 16 {
        if m32 & (1 << i) == 0 {
            i += 1;
            continue;
        }
        let start = i;
        while i < 32 && m32 & (1 << i) != 0 {
            i += 1;
        }
        let len = (i - start) as usize;
        if len > best_len {
            best_len = len;
            best_start = start as usize;
        }
    }

    (best_start..best_start + best_len.min(16))
        .map(|j| ((circle[j % 16] - center).abs() - thresh).max(0) as f32)
        .sum()
}

impl KeypointDetector for FastDetector {
    /// Keypoints in raster order.
    fn detect(&self, image: &GrayImage, threshold: u8) -> Vec<Keypoint> {
        let (w, h) = (image.width(), image.height());
        let scores = self.score_map(image, threshold);
        let mut keypoints = Vec::new();

        for y in BORDER..h.saturating_sub(BORDER) {
            for x in BORDER..w.saturating_sub(BORDER) {
                let score = scores[y * w + x];
                if score <= 0.0 {
                    continue;
                }
                if self.nonmax_suppression {
                    let dominated = (y - 1..=y + 1)
                        .flat_map(|ny| (x - 1..=x + 1).map(move |nx| (nx, ny)))
                        .filter(|&(nx, ny)| (nx, ny) != (x, y))
                        .any(|(nx, ny)| scores[ny * w + nx] >= score);
                    if dominated {
                        continue;
                    }
                }
                keypoints.push(Keypoint {
                    x: x as f32,
                    y: y as f32,
                    response: score,
                });
            }
        }
        keypoints
    }
}
