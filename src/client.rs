// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::{
    corner::Corner,
    error::{Error, Result},
    image::GrayImage,
    protocol::{read_response, write_request},
};
use std::time::Duration;
use tokio::net::{TcpStream, ToSocketAddrs};

/// Default deadline for connecting and for each request/response exchange.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

/// Client for the corner server.
///
/// # Example
///
/// ```no_run
/// use edgefirst_corners::{client::CornerClient, image::{Geometry, GrayImage}};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let mut client = CornerClient::connect("127.0.0.1:9092", None).await?;
/// let frame = GrayImage::new(Geometry::new(480, 640));
/// let corners = client.detect(&frame).await?;
/// println!("{} corners", corners.len());
/// # Ok(())
/// # }
/// ```
pub struct CornerClient {
    stream: TcpStream,
    timeout: Duration,
}

impl CornerClient {
    /// Connects to `addr`; `timeout` defaults to [`DEFAULT_TIMEOUT`].
    pub async fn connect<A: ToSocketAddrs>(addr: A, timeout: Option<Duration>) -> Result<Self> {
        let timeout = timeout.unwrap_or(DEFAULT_TIMEOUT);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Protocol(format!("connect timed out after {timeout:?}")))??;
        stream.set_nodelay(true)?;
        Ok(Self { stream, timeout })
    }

    /// Sends one frame and waits for its corners.
    pub async fn detect(&mut self, image: &GrayImage) -> Result<Vec<Corner>> {
        let timeout = self.timeout;
        let stream = &mut self.stream;
        let exchange = async move {
            write_request(stream, image).await?;
            read_response(stream).await
        };
        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| Error::Protocol(format!("no response within {timeout:?}")))?
    }

    pub fn into_inner(self) -> TcpStream {
        self.stream
    }
}
