// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Error types for the corner detection server.

use std::{io, time::Duration};

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Faults raised by the server, sessions and accelerator control plane.
///
/// Every variant except [`Error::Configuration`] is scoped to a single
/// session: the session that raised it closes its connection and the
/// listener keeps accepting.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed message, short read or end-of-stream inside a message
    #[error("protocol fault: {0}")]
    Protocol(String),

    /// Completion flag not observed on both VDMA channels before the deadline
    #[error("VDMA completion not observed within {0:?}")]
    HardwareTimeout(Duration),

    /// DMA buffer (re)allocation or mapping failed
    #[error("DMA allocation failed: {0}")]
    Allocation(String),

    /// Invalid startup arguments or missing hardware resource
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Frame geometry the accelerator cannot express
    #[error("unsupported geometry {width}x{height}: {reason}")]
    Geometry {
        /// Frame width in pixels
        width: u16,
        /// Frame height in pixels
        height: u16,
        /// Which hardware limit was exceeded
        reason: &'static str,
    },

    /// VDMA operation issued in a state that does not allow it
    #[error("VDMA {operation} not allowed in state {state}")]
    InvalidState {
        /// Operation that was attempted
        operation: &'static str,
        /// Controller state at the time
        state: &'static str,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// True when the error is the peer going away rather than a fault on
    /// our side.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}
