// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! # EdgeFirst Corner Detection Library
//!
//! This library provides the control plane for an FPGA FAST corner detection
//! accelerator and the TCP service that exposes it. Clients stream grayscale
//! frames; the server stages them into physically contiguous DMA buffers,
//! drives the AXI VDMA engine feeding the accelerator, decodes the packed
//! result words and streams the corners back.
//!
//! ## Features
//!
//! - **Wire Protocol**: Length-prefixed request/response framing over TCP
//!   ([`protocol`]).
//! - **VDMA Control**: Register-level state machine for the DMA engine
//!   ([`vdma`]) over memory-mapped registers ([`mmio`]).
//! - **DMA Buffer Management**: CMA-backed input/output buffers with explicit
//!   cache maintenance, reallocated only on geometry change ([`dma`]).
//! - **Software Fallback**: FAST-9 with non-maximum suppression on the CPU
//!   ([`fast`]), selected at startup instead of the accelerator.
//! - **Simulation**: A register-accurate stand-in for the accelerator
//!   ([`sim`]) so the hardware path runs anywhere.
//!
//! ## Example
//!
//! ```no_run
//! use edgefirst_corners::{
//!     client::CornerClient,
//!     image::{Geometry, GrayImage},
//!     server::{Backend, Server, ServerConfig},
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ServerConfig {
//!     backend: Backend::Simulated,
//!     ..Default::default()
//! };
//! let server = Server::from_config(&config).await?;
//! let addr = server.local_addr()?;
//! tokio::spawn(server.run());
//!
//! let mut client = CornerClient::connect(addr, None).await?;
//! let corners = client.detect(&GrayImage::new(Geometry::new(480, 640))).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Platform Requirements
//!
//! - **Linux**: DMA heap support (`/dev/dma_heap/linux,cma`) and `/dev/mem`
//! - **Privileges**: `CAP_SYS_ADMIN` to resolve buffer physical addresses
//! - **Hardware**: Accelerator bitstream loaded and VDMA base address known
//!   before start (the CPU and simulated backends need neither)
//!
//! ## Safety
//!
//! This library uses `unsafe` code for register and DMA buffer mappings. All
//! unsafe operations are isolated to [`mmio`] and [`dma`] and wrapped with
//! safe APIs.

pub mod client;
pub mod corner;
pub mod dma;
pub mod error;
pub mod fast;
pub mod image;
pub mod mmio;
pub mod protocol;
pub mod server;
pub mod session;
pub mod sim;
pub mod strategy;
pub mod vdma;

pub use error::{Error, Result};
