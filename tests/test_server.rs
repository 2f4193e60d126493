// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use edgefirst_corners::{
    client::CornerClient,
    corner::{Corner, CornerWord, Strength},
    fast::{FastDetector, Keypoint, KeypointDetector},
    image::{Geometry, GrayImage},
    protocol::{encode_request, HEADER_LEN, RECORD_LEN},
    server::{build_strategy, Backend, Server, ServerConfig},
    sim::SimAccelerator,
    strategy::{CornerStrategy, HardwareContext, HardwareStrategy, SoftwareStrategy},
};
use std::{error::Error, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

const THRESHOLD: u8 = 30;

/// Flags every pixel at or above the threshold, responding with its
/// intensity.
struct EveryPixel;

impl KeypointDetector for EveryPixel {
    fn detect(&self, image: &GrayImage, threshold: u8) -> Vec<Keypoint> {
        let mut keypoints = Vec::new();
        for y in 0..image.height() {
            for x in 0..image.width() {
                let px = image.get(x, y);
                if px >= threshold {
                    keypoints.push(Keypoint {
                        x: x as f32,
                        y: y as f32,
                        response: px as f32,
                    });
                }
            }
        }
        keypoints
    }
}

async fn serve(strategy: Arc<dyn CornerStrategy>) -> Result<SocketAddr, Box<dyn Error>> {
    let server = Server::bind("127.0.0.1:0", strategy, Some(Duration::from_secs(5))).await?;
    let addr = server.local_addr()?;
    tokio::spawn(server.run());
    Ok(addr)
}

fn sim_strategy(sim: &SimAccelerator) -> Arc<dyn CornerStrategy> {
    let context = HardwareContext::new(sim.registers(), sim.allocator())
        .with_completion_timeout(Duration::from_millis(200));
    Arc::new(HardwareStrategy::with_mode(context, "SIM"))
}

/// Bright rectangle on a dark background.
fn scene(height: u16, width: u16, offset: usize) -> GrayImage {
    let mut img = GrayImage::new(Geometry::new(height, width));
    let (h, w) = (height as usize, width as usize);
    for y in h / 4 + offset..h * 3 / 4 {
        for x in w / 4 + offset..w * 3 / 4 {
            img.set(x, y, 210);
        }
    }
    img
}

/// What the simulated kernel reports for `img`.
fn kernel_corners(img: &GrayImage) -> Vec<Corner> {
    FastDetector::default()
        .detect(img, THRESHOLD)
        .into_iter()
        .map(|kp| {
            let score = (kp.response as u32).clamp(1, CornerWord::MAX_SCORE as u32) as u16;
            Corner {
                x: kp.x as u16,
                y: kp.y as u16,
                strength: (kp.response >= 2.0 * THRESHOLD as f32).into(),
                score,
            }
        })
        .collect()
}

#[tokio::test]
async fn test_end_to_end_every_pixel() -> Result<(), Box<dyn Error>> {
    let addr = serve(Arc::new(SoftwareStrategy::new(EveryPixel, 0))).await?;
    let mut client = CornerClient::connect(addr, None).await?;

    let img = GrayImage::from_vec(Geometry::new(2, 2), vec![10, 20, 30, 40]).unwrap();
    let corners = client.detect(&img).await?;

    assert_eq!(corners.len(), 4);
    assert!(corners.iter().all(|c| c.strength == Strength::Strong));
    let scores: Vec<u16> = corners.iter().map(|c| c.score).collect();
    assert_eq!(scores, vec![10, 20, 30, 40]);
    Ok(())
}

#[tokio::test]
async fn test_cpu_fast() -> Result<(), Box<dyn Error>> {
    let config = ServerConfig {
        backend: Backend::Cpu,
        threshold: THRESHOLD,
        ..Default::default()
    };
    let addr = serve(build_strategy(&config)?).await?;
    let mut client = CornerClient::connect(addr, None).await?;

    let img = scene(48, 64, 0);
    let corners = client.detect(&img).await?;
    assert!(!corners.is_empty());
    for c in &corners {
        assert_eq!(c.strength, Strength::Strong);
        assert!(c.x >= 3 && c.x < 61 && c.y >= 3 && c.y < 45);
    }

    // a flat frame has nothing to report
    let flat = GrayImage::new(Geometry::new(48, 64));
    assert!(client.detect(&flat).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_simulated_hardware() -> Result<(), Box<dyn Error>> {
    let sim = SimAccelerator::new(THRESHOLD);
    let addr = serve(sim_strategy(&sim)).await?;
    let mut client = CornerClient::connect(addr, None).await?;

    let a = scene(32, 40, 0);
    let b = scene(64, 48, 2);
    for img in [&a, &a, &b, &b, &a] {
        let corners = client.detect(img).await?;
        assert!(!corners.is_empty());
        assert_eq!(corners, kernel_corners(img));
    }

    let stats = sim.stats();
    assert_eq!(stats.transfers, 5);
    assert_eq!(stats.completions, 5);
    assert_eq!(stats.allocations, 6);
    assert_eq!(stats.overlaps, 0);
    assert_eq!(sim.live_buffers(), 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sessions_are_serialised() -> Result<(), Box<dyn Error>> {
    const CLIENTS: usize = 4;
    const FRAMES: usize = 8;

    let sim = SimAccelerator::new(THRESHOLD);
    let addr = serve(sim_strategy(&sim)).await?;

    let mut tasks = Vec::new();
    for i in 0..CLIENTS {
        tasks.push(tokio::spawn(async move {
            let img = scene(24 + 8 * i as u16, 32 + 4 * i as u16, i % 3);
            let expected = kernel_corners(&img);
            let mut client = CornerClient::connect(addr, None).await?;
            for _ in 0..FRAMES {
                let corners = client.detect(&img).await?;
                assert_eq!(corners, expected, "client {i}");
            }
            Ok::<_, edgefirst_corners::Error>(())
        }));
    }
    for task in tasks {
        task.await??;
    }

    let stats = sim.stats();
    assert_eq!(stats.transfers, (CLIENTS * FRAMES) as u64);
    assert_eq!(stats.completions, (CLIENTS * FRAMES) as u64);
    assert_eq!(stats.overlaps, 0);
    assert_eq!(stats.peak_live_buffers, 2);
    assert_eq!(sim.live_buffers(), 2);
    Ok(())
}

#[tokio::test]
async fn test_partial_payload_is_isolated() -> Result<(), Box<dyn Error>> {
    let sim = SimAccelerator::new(THRESHOLD);
    let addr = serve(sim_strategy(&sim)).await?;

    let mut broken = TcpStream::connect(addr).await?;
    broken.write_all(&[16, 0, 16, 0, 1, 2, 3]).await?;
    broken.shutdown().await?;
    let mut rest = Vec::new();
    broken.read_to_end(&mut rest).await?;
    assert!(rest.is_empty());

    let mut client = CornerClient::connect(addr, None).await?;
    let img = scene(32, 32, 0);
    assert_eq!(client.detect(&img).await?, kernel_corners(&img));
    assert_eq!(sim.stats().transfers, 1);
    Ok(())
}

#[tokio::test]
async fn test_hardware_timeout_recovers() -> Result<(), Box<dyn Error>> {
    let sim = SimAccelerator::new(THRESHOLD);
    let addr = serve(sim_strategy(&sim)).await?;
    let img = scene(32, 32, 0);

    sim.set_stalled(true);
    let mut stalled = CornerClient::connect(addr, None).await?;
    assert!(stalled.detect(&img).await.is_err());

    sim.set_stalled(false);
    let mut client = CornerClient::connect(addr, None).await?;
    assert_eq!(client.detect(&img).await?, kernel_corners(&img));

    let stats = sim.stats();
    assert_eq!(stats.resets, 1);
    assert_eq!(stats.overlaps, 0);
    assert_eq!(sim.live_buffers(), 2);
    Ok(())
}

/// Sends one raw request and checks the response framing byte by byte.
async fn raw_exchange(addr: SocketAddr, img: &GrayImage) -> Result<usize, Box<dyn Error>> {
    let mut stream = TcpStream::connect(addr).await?;
    let mut request = Vec::new();
    encode_request(img, &mut request);
    assert_eq!(request.len(), HEADER_LEN + img.as_slice().len());
    stream.write_all(&request).await?;

    let mut count = [0u8; 4];
    stream.read_exact(&mut count).await?;
    let n = u32::from_le_bytes(count) as usize;
    let mut records = vec![0u8; n * RECORD_LEN];
    stream.read_exact(&mut records).await?;
    for rec in records.chunks_exact(RECORD_LEN) {
        let strength = u16::from_le_bytes([rec[4], rec[5]]);
        assert!(strength <= 1);
    }

    // nothing trails the response
    stream.shutdown().await?;
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).await?;
    assert!(rest.is_empty());
    Ok(n)
}

#[tokio::test]
async fn test_response_shape_both_strategies() -> Result<(), Box<dyn Error>> {
    let img = scene(40, 40, 1);

    let cpu = serve(build_strategy(&ServerConfig {
        threshold: THRESHOLD,
        ..Default::default()
    })?)
    .await?;
    let sim = serve(build_strategy(&ServerConfig {
        backend: Backend::Simulated,
        threshold: THRESHOLD,
        ..Default::default()
    })?)
    .await?;

    assert!(raw_exchange(cpu, &img).await? > 0);
    assert!(raw_exchange(sim, &img).await? > 0);

    let empty = GrayImage::new(Geometry::new(0, 12));
    assert_eq!(raw_exchange(cpu, &empty).await?, 0);
    assert_eq!(raw_exchange(sim, &empty).await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_reset_per_frame() -> Result<(), Box<dyn Error>> {
    let sim = SimAccelerator::new(THRESHOLD);
    let context = HardwareContext::new(sim.registers(), sim.allocator()).with_reset_per_frame(true);
    let strategy: Arc<dyn CornerStrategy> = Arc::new(HardwareStrategy::new(context));
    assert_eq!(strategy.mode(), "RST");
    let addr = serve(strategy).await?;

    let mut client = CornerClient::connect(addr, None).await?;
    let img = scene(32, 48, 0);
    for _ in 0..3 {
        assert_eq!(client.detect(&img).await?, kernel_corners(&img));
    }
    assert_eq!(sim.stats().resets, 3);
    assert_eq!(sim.stats().allocations, 2);
    Ok(())
}
