// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Corner records and the accelerator's 64-bit result word.
//!
//! The accelerator writes one word per input pixel, in raster order. A word
//! describes a corner when its score field is nonzero:
//!
//! ```text
//!  63        48 47        32 31        11  10   9         0
//! ┌────────────┬────────────┬────────────┬────┬────────────┐
//! │     y      │     x      │  reserved  │ S  │   score    │
//! └────────────┴────────────┴────────────┴────┴────────────┘
//! ```

/// Upper bound on corners reported for one frame. Words past the cap are
/// ignored.
pub const MAX_CORNERS: usize = 20_000;

/// Weak/strong classification assigned by the detector.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Strength {
    Weak = 0,
    Strong = 1,
}

impl From<bool> for Strength {
    fn from(strong: bool) -> Self {
        if strong {
            Strength::Strong
        } else {
            Strength::Weak
        }
    }
}

/// A detected feature point as sent on the wire.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Corner {
    pub x: u16,
    pub y: u16,
    pub strength: Strength,
    pub score: u16,
}

/// One accelerator output word with named accessors for each bit field.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CornerWord(pub u64);

impl CornerWord {
    const SCORE_MASK: u64 = 0x3FF;
    const STRENGTH_SHIFT: u32 = 10;
    const X_SHIFT: u32 = 32;
    const Y_SHIFT: u32 = 48;

    /// Largest score representable in the word.
    pub const MAX_SCORE: u16 = Self::SCORE_MASK as u16;

    /// Packs a corner into a word. The score is truncated to 10 bits.
    pub const fn pack(x: u16, y: u16, strong: bool, score: u16) -> Self {
        Self(
            ((y as u64) << Self::Y_SHIFT)
                | ((x as u64) << Self::X_SHIFT)
                | ((strong as u64) << Self::STRENGTH_SHIFT)
                | (score as u64 & Self::SCORE_MASK),
        )
    }

    pub const fn score(self) -> u16 {
        (self.0 & Self::SCORE_MASK) as u16
    }

    pub const fn is_strong(self) -> bool {
        (self.0 >> Self::STRENGTH_SHIFT) & 1 == 1
    }

    pub const fn x(self) -> u16 {
        (self.0 >> Self::X_SHIFT) as u16
    }

    pub const fn y(self) -> u16 {
        (self.0 >> Self::Y_SHIFT) as u16
    }

    /// Zero-score words mean "no corner at this pixel".
    pub const fn is_corner(self) -> bool {
        self.score() != 0
    }

    pub fn corner(self) -> Option<Corner> {
        self.is_corner().then(|| Corner {
            x: self.x(),
            y: self.y(),
            strength: self.is_strong().into(),
            score: self.score(),
        })
    }
}

/// Extracts corners from result words in raster order, stopping once
/// [`MAX_CORNERS`] have been accepted.
pub fn decode_corners<I>(words: I) -> Vec<Corner>
where
    I: IntoIterator<Item = u64>,
{
    words
        .into_iter()
        .filter_map(|w| CornerWord(w).corner())
        .take(MAX_CORNERS)
        .collect()
}

/// Same as [`decode_corners`] over a raw little-endian byte view of the
/// output buffer. Trailing bytes that do not form a whole word are ignored.
pub fn decode_corners_le(bytes: &[u8]) -> Vec<Corner> {
    decode_corners(bytes.chunks_exact(8).map(|chunk| {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        u64::from_le_bytes(word)
    }))
}
