// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use core::fmt;

/// Frame geometry as carried in the request header.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Geometry {
    /// Number of rows
    pub height: u16,
    /// Number of columns
    pub width: u16,
}

impl Geometry {
    pub const fn new(height: u16, width: u16) -> Self {
        Self { height, width }
    }

    /// Number of pixels, which is also the number of 64-bit words in each
    /// accelerator buffer.
    pub const fn pixels(&self) -> usize {
        self.height as usize * self.width as usize
    }

    pub const fn is_empty(&self) -> bool {
        self.height == 0 || self.width == 0
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Row-major 8-bit grayscale image without row padding.
///
/// The pixel storage is reused across frames by the session that owns it;
/// [`GrayImage::reshape`] only reallocates when the pixel count grows.
///
/// # Example
///
/// ```
/// use edgefirst_corners::image::{Geometry, GrayImage};
///
/// let img = GrayImage::from_vec(Geometry::new(2, 2), vec![10, 20, 30, 40]).unwrap();
/// assert_eq!(img.get(1, 0), 20);
/// assert_eq!(img.get(0, 1), 30);
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GrayImage {
    geometry: Geometry,
    pixels: Vec<u8>,
}

impl GrayImage {
    /// Allocates a zeroed image.
    pub fn new(geometry: Geometry) -> Self {
        Self {
            geometry,
            pixels: vec![0; geometry.pixels()],
        }
    }

    /// Wraps existing pixels, returning `None` when the length does not
    /// match the geometry.
    pub fn from_vec(geometry: Geometry, pixels: Vec<u8>) -> Option<Self> {
        (pixels.len() == geometry.pixels()).then_some(Self { geometry, pixels })
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn width(&self) -> usize {
        self.geometry.width as usize
    }

    pub fn height(&self) -> usize {
        self.geometry.height as usize
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.pixels
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.pixels
    }

    /// Pixel at column `x`, row `y`.
    ///
    /// # Panics
    ///
    /// Panics if the coordinate is outside the image.
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> u8 {
        assert!(x < self.width() && y < self.height(), "({x}, {y}) out of bounds");
        self.pixels[y * self.width() + x]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: u8) {
        let w = self.width();
        self.pixels[y * w + x] = value;
    }

    /// Changes the geometry in place. Contents are unspecified afterwards and
    /// are expected to be overwritten by the next received payload.
    pub fn reshape(&mut self, geometry: Geometry) {
        self.pixels.resize(geometry.pixels(), 0);
        self.geometry = geometry;
    }
}

impl fmt::Display for GrayImage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} GREY {} bytes", self.geometry, self.pixels.len())
    }
}
