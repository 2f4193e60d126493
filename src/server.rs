// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! TCP listener and startup configuration.

use crate::{
    dma::{CmaAllocator, DmaAllocator},
    error::{Error, Result},
    fast::FastDetector,
    mmio::{Mmio, RegisterIo},
    session::Session,
    sim::SimAccelerator,
    strategy::{CornerStrategy, HardwareContext, HardwareStrategy, SoftwareStrategy},
    vdma::{DEFAULT_COMPLETION_TIMEOUT, DEFAULT_RESET_TIMEOUT, REGISTER_SPAN},
};
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use tokio::net::{TcpListener, ToSocketAddrs};
use tracing::{error, info, info_span, Instrument};

/// Default TCP listening port.
pub const DEFAULT_PORT: u16 = 9092;

/// Default FAST threshold.
pub const DEFAULT_THRESHOLD: u8 = 20;

/// Default server-side read deadline.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Where frames are processed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Backend {
    /// The accelerator, through the VDMA registers at `vdma_base`.
    Fpga { vdma_base: u64, vdma_size: usize },
    /// FAST on the CPU.
    Cpu,
    /// The hardware path against [`SimAccelerator`].
    Simulated,
}

/// Process-wide configuration, fixed at startup.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub backend: Backend,
    /// Soft-reset the VDMA before every frame.
    pub reset_per_frame: bool,
    /// FAST threshold for the CPU fallback and the simulated kernel.
    pub threshold: u8,
    pub completion_timeout: Duration,
    pub reset_timeout: Duration,
    /// `None` disables the read deadline.
    pub read_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            backend: Backend::Cpu,
            reset_per_frame: false,
            threshold: DEFAULT_THRESHOLD,
            completion_timeout: DEFAULT_COMPLETION_TIMEOUT,
            reset_timeout: DEFAULT_RESET_TIMEOUT,
            read_timeout: Some(DEFAULT_READ_TIMEOUT),
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    /// Checks the configuration before anything is opened.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] for a register span that does not cover the
    /// VDMA registers or a zero timeout.
    pub fn validate(&self) -> Result<()> {
        if let Backend::Fpga { vdma_size, .. } = self.backend {
            if vdma_size < REGISTER_SPAN {
                return Err(Error::Configuration(format!(
                    "VDMA span {vdma_size:#x} is smaller than the {REGISTER_SPAN:#x} register block"
                )));
            }
        }
        let timeouts = [
            ("completion timeout", Some(self.completion_timeout)),
            ("reset timeout", Some(self.reset_timeout)),
            ("read timeout", self.read_timeout),
        ];
        for (name, timeout) in timeouts {
            if timeout == Some(Duration::ZERO) {
                return Err(Error::Configuration(format!("{name} must be positive")));
            }
        }
        Ok(())
    }
}

/// Builds the strategy selected by `config`, opening hardware resources as
/// needed.
///
/// # Errors
///
/// [`Error::Configuration`] when the configuration is invalid or the
/// register block or CMA heap cannot be opened.
pub fn build_strategy(config: &ServerConfig) -> Result<Arc<dyn CornerStrategy>> {
    config.validate()?;
    let strategy: Arc<dyn CornerStrategy> = match config.backend {
        Backend::Cpu => {
            info!("software FAST fallback, threshold {}", config.threshold);
            Arc::new(SoftwareStrategy::new(
                FastDetector::default(),
                config.threshold,
            ))
        }
        Backend::Simulated => {
            info!("simulated accelerator, threshold {}", config.threshold);
            let sim = SimAccelerator::new(config.threshold);
            let context = hardware_context(config, sim.registers(), sim.allocator());
            Arc::new(HardwareStrategy::with_mode(context, "SIM"))
        }
        Backend::Fpga {
            vdma_base,
            vdma_size,
        } => {
            let regs = Mmio::open(vdma_base, vdma_size)?;
            let allocator = CmaAllocator::new()?;
            info!(
                "accelerator VDMA at {:#x}, reset per frame {}",
                vdma_base, config.reset_per_frame
            );
            Arc::new(HardwareStrategy::new(hardware_context(
                config, regs, allocator,
            )))
        }
    };
    Ok(strategy)
}

fn hardware_context<R, A>(config: &ServerConfig, regs: R, allocator: A) -> HardwareContext<R, A>
where
    R: RegisterIo,
    A: DmaAllocator,
{
    HardwareContext::new(regs, allocator)
        .with_reset_per_frame(config.reset_per_frame)
        .with_completion_timeout(config.completion_timeout)
        .with_reset_timeout(config.reset_timeout)
}

/// Accepts connections and runs one [`Session`] task per client.
pub struct Server {
    listener: TcpListener,
    strategy: Arc<dyn CornerStrategy>,
    read_timeout: Option<Duration>,
}

impl Server {
    pub async fn bind<A: ToSocketAddrs>(
        addr: A,
        strategy: Arc<dyn CornerStrategy>,
        read_timeout: Option<Duration>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            strategy,
            read_timeout,
        })
    }

    /// Validates `config`, builds its strategy and binds its address.
    pub async fn from_config(config: &ServerConfig) -> Result<Self> {
        let strategy = build_strategy(config)?;
        Self::bind(config.listen_addr(), strategy, config.read_timeout).await
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn strategy(&self) -> &Arc<dyn CornerStrategy> {
        &self.strategy
    }

    /// Accept loop. Session failures stay inside their task; accept errors
    /// are logged and retried.
    pub async fn run(self) -> Result<()> {
        info!(
            "listening on {} [{}]",
            self.local_addr()?,
            self.strategy.mode()
        );
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                error!("{}: set TCP_NODELAY: {}", peer, e);
            }
            info!("client connected {}", peer);

            let session = Session::for_peer(peer, Arc::clone(&self.strategy))
                .with_read_timeout(self.read_timeout);
            tokio::spawn(
                async move {
                    session.run(stream).await;
                }
                .instrument(info_span!("session", %peer)),
            );
        }
    }
}
