// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use args::Args;
use clap::Parser;
use edgefirst_corners::server::{Server, ServerConfig};
use std::error::Error;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, Layer, Registry};

mod args;

fn init_tracing(args: &Args) -> Result<(), Box<dyn Error>> {
    let console = args.tokio_console.then(console_subscriber::spawn::<Registry>);

    let stdout_log = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(args.rust_log);

    let journald = match tracing_journald::layer() {
        Ok(journald) => Some(journald.with_filter(args.rust_log)),
        Err(_) => None,
    };

    let tracy = if args.tracy {
        tracy_client::Client::start();
        Some(tracing_tracy::TracyLayer::default().with_filter(args.rust_log))
    } else {
        None
    };

    let subscriber = Registry::default()
        .with(console)
        .with(stdout_log)
        .with(journald)
        .with(tracy);
    tracing::subscriber::set_global_default(subscriber)?;
    tracing_log::LogTracer::init()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_tracing(&args)?;
    info!(
        "EdgeFirst Corner Detection Server {}",
        env!("CARGO_PKG_VERSION")
    );

    let config = ServerConfig::try_from(args)?;
    let server = Server::from_config(&config).await?;
    server.run().await?;
    Ok(())
}
