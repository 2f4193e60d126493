// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use clap::Parser;
use edgefirst_corners::{
    server::{Backend, ServerConfig},
    Error,
};
use std::{net::IpAddr, time::Duration};
use tracing::level_filters::LevelFilter;

/// Parses a decimal or `0x`-prefixed hexadecimal integer.
fn parse_int(s: &str) -> Result<u64, String> {
    let s = s.trim().replace('_', "");
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number {s:?}: {e}"))
}

fn parse_span(s: &str) -> Result<usize, String> {
    let n = parse_int(s)?;
    usize::try_from(n).map_err(|_| format!("{n:#x} does not fit in usize"))
}

/// Parses seconds as a decimal, rejecting negative or non-finite values.
fn parse_seconds(s: &str) -> Result<Duration, String> {
    let secs: f64 = s
        .trim()
        .parse()
        .map_err(|e| format!("invalid seconds {s:?}: {e}"))?;
    Duration::try_from_secs_f64(secs).map_err(|e| format!("invalid seconds {s:?}: {e}"))
}

/// Command-line arguments for the EdgeFirst corner detection server.
///
/// Arguments can be specified via command line or environment variables.
///
/// # Example
///
/// ```bash
/// # Accelerator with a VDMA at 0x43000000, resetting every frame
/// edgefirst-corners --vdma-base 0x43000000 --reset-per-frame
///
/// # Software fallback via environment variables
/// export CPU=true
/// export THRESHOLD=30
/// edgefirst-corners
/// ```
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// TCP listening port
    #[arg(short, long, env = "PORT", default_value = "9092")]
    pub port: u16,

    /// Listening address
    #[arg(long, env = "BIND", default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// Use the software FAST detector instead of the accelerator
    #[arg(long, env = "CPU", conflicts_with = "simulate")]
    pub cpu: bool,

    /// Drive the hardware path against the simulated accelerator
    #[arg(long, env = "SIMULATE")]
    pub simulate: bool,

    /// Soft-reset the VDMA before every frame
    #[arg(long, env = "RESET_PER_FRAME")]
    pub reset_per_frame: bool,

    /// FAST threshold for the software detector and the simulated kernel
    #[arg(short, long, env = "THRESHOLD", default_value = "20")]
    pub threshold: u8,

    /// VDMA register block physical address (e.g., 0x43000000)
    #[arg(long, env = "VDMA_BASE", value_parser = parse_int)]
    pub vdma_base: Option<u64>,

    /// VDMA register block size in bytes
    #[arg(long, env = "VDMA_SIZE", default_value = "0x10000", value_parser = parse_span)]
    pub vdma_size: usize,

    /// Seconds to wait for the VDMA completion flags
    #[arg(long, env = "COMPLETION_TIMEOUT", default_value = "2.0", value_parser = parse_seconds)]
    pub completion_timeout: Duration,

    /// Seconds to wait for a VDMA soft reset to finish
    #[arg(long, env = "RESET_TIMEOUT", default_value = "0.01", value_parser = parse_seconds)]
    pub reset_timeout: Duration,

    /// Seconds to wait for client data before closing the session (0
    /// disables)
    #[arg(long, env = "READ_TIMEOUT", default_value = "60", value_parser = parse_seconds)]
    pub read_timeout: Duration,

    /// Application log level
    #[arg(long, env = "RUST_LOG", default_value = "INFO")]
    pub rust_log: LevelFilter,

    /// Enable Tracy profiler for performance analysis
    #[arg(long, env = "TRACY")]
    pub tracy: bool,

    /// Enable Tokio async runtime console for debugging
    #[arg(long, env = "TOKIO_CONSOLE")]
    pub tokio_console: bool,
}

impl TryFrom<Args> for ServerConfig {
    type Error = Error;

    fn try_from(args: Args) -> Result<Self, Error> {
        if args.cpu && args.simulate {
            return Err(Error::Configuration(
                "--cpu and --simulate are exclusive".to_string(),
            ));
        }
        let backend = if args.cpu {
            Backend::Cpu
        } else if args.simulate {
            Backend::Simulated
        } else {
            let vdma_base = args.vdma_base.ok_or_else(|| {
                Error::Configuration(
                    "--vdma-base is required unless --cpu or --simulate is given".to_string(),
                )
            })?;
            Backend::Fpga {
                vdma_base,
                vdma_size: args.vdma_size,
            }
        };

        let config = ServerConfig {
            bind: args.bind,
            port: args.port,
            backend,
            reset_per_frame: args.reset_per_frame,
            threshold: args.threshold,
            completion_timeout: args.completion_timeout,
            reset_timeout: args.reset_timeout,
            read_timeout: (!args.read_timeout.is_zero()).then_some(args.read_timeout),
        };
        config.validate()?;
        Ok(config)
    }
}
