// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Per-connection frame loop and its telemetry.

use crate::{
    corner::Corner,
    error::{Error, Result},
    image::{Geometry, GrayImage},
    protocol::{read_header, read_pixels, write_response},
    strategy::CornerStrategy,
};
use std::{
    future::Future,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info};

/// Rolling per-session timing.
///
/// The first frame carries warm-up cost (buffer allocation, engine
/// configuration) and is counted but left out of the timing aggregates.
#[derive(Clone, Debug, Default)]
pub struct SessionStats {
    frames: u64,
    valid_frames: u64,
    valid_total: Duration,
}

impl SessionStats {
    pub fn record(&mut self, elapsed: Duration) {
        if self.frames > 0 {
            self.valid_frames += 1;
            self.valid_total += elapsed;
        }
        self.frames += 1;
    }

    /// Frames answered, including the first.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Frames included in the timing aggregates.
    pub fn valid_frames(&self) -> u64 {
        self.valid_frames
    }

    pub fn valid_total(&self) -> Duration {
        self.valid_total
    }

    /// Mean processing time over the valid frames.
    pub fn average(&self) -> Option<Duration> {
        let frames = u32::try_from(self.valid_frames).ok().filter(|&n| n > 0)?;
        Some(self.valid_total / frames)
    }

    /// Throughput derived from [`SessionStats::average`].
    pub fn fps(&self) -> Option<f64> {
        self.average()
            .map(|avg| avg.as_secs_f64())
            .filter(|&s| s > 0.0)
            .map(|s| 1.0 / s)
    }

    /// One-line description of the session for the disconnect log.
    pub fn summary(&self, peer: &str) -> String {
        match (self.average(), self.fps()) {
            (Some(avg), Some(fps)) => format!(
                "session {} summary: {} frames ({} valid), total {:.1} ms, avg {:.2} ms, {:.1} fps",
                peer,
                self.frames,
                self.valid_frames,
                self.valid_total.as_secs_f64() * 1e3,
                avg.as_secs_f64() * 1e3,
                fps
            ),
            _ => format!(
                "session {} summary: {} frames, no timing (first frame excluded)",
                peer, self.frames
            ),
        }
    }

    pub fn log_summary(&self, peer: &str) {
        info!("{}", self.summary(peer));
    }
}

/// Runs `fut` under an optional deadline.
async fn with_deadline<T>(
    deadline: Option<Duration>,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match deadline {
        Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
            Error::Protocol(format!("no data from peer within {limit:?}"))
        })?,
        None => fut.await,
    }
}

/// One client connection.
///
/// The session owns its receive buffer and only borrows the strategy, so
/// nothing it holds is visible to other sessions.
pub struct Session {
    peer: String,
    strategy: Arc<dyn CornerStrategy>,
    read_timeout: Option<Duration>,
    image: GrayImage,
    stats: SessionStats,
}

impl Session {
    pub fn new(peer: impl Into<String>, strategy: Arc<dyn CornerStrategy>) -> Self {
        Self {
            peer: peer.into(),
            strategy,
            read_timeout: None,
            image: GrayImage::default(),
            stats: SessionStats::default(),
        }
    }

    pub fn for_peer(peer: SocketAddr, strategy: Arc<dyn CornerStrategy>) -> Self {
        Self::new(peer.to_string(), strategy)
    }

    /// Bounds every network read. `None` waits forever.
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Serves frames until the peer disconnects or a fault occurs, then logs
    /// the session summary.
    pub async fn run<S>(mut self, mut stream: S) -> SessionStats
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match self.serve(&mut stream).await {
            Ok(()) => info!("client {} disconnected", self.peer),
            Err(e) if e.is_disconnect() => info!("client {} dropped: {}", self.peer, e),
            Err(e) => error!("session {} closed: {}", self.peer, e),
        }
        self.stats.log_summary(&self.peer);
        self.stats
    }

    async fn serve<S>(&mut self, stream: &mut S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let Some(geometry) = with_deadline(self.read_timeout, read_header(stream)).await?
            else {
                return Ok(());
            };
            if geometry != self.image.geometry() {
                debug!(
                    "session {} geometry {} -> {}",
                    self.peer,
                    self.image.geometry(),
                    geometry
                );
                self.image.reshape(geometry);
            }
            with_deadline(
                self.read_timeout,
                read_pixels(stream, self.image.as_mut_slice()),
            )
            .await?;

            let (corners, elapsed) = self.process(geometry).await?;
            write_response(stream, &corners).await?;

            let frame = self.stats.frames();
            self.stats.record(elapsed);
            let ms = elapsed.as_secs_f64() * 1e3;
            debug!(
                "frame {} {} {:.2} ms {:.1} fps N={} [{}]",
                frame,
                geometry,
                ms,
                if ms > 0.0 { 1e3 / ms } else { 0.0 },
                corners.len(),
                self.strategy.mode()
            );
        }
    }

    /// Runs the strategy on the receive buffer off the async workers.
    async fn process(&mut self, geometry: Geometry) -> Result<(Vec<Corner>, Duration)> {
        if geometry.is_empty() {
            return Ok((Vec::new(), Duration::ZERO));
        }
        let image = std::mem::take(&mut self.image);
        let strategy = Arc::clone(&self.strategy);
        let (image, result, elapsed) = tokio::task::spawn_blocking(move || {
            let start = Instant::now();
            let result = strategy.detect(&image);
            (image, result, start.elapsed())
        })
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?;
        self.image = image;
        Ok((result?, elapsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        corner::Strength,
        protocol::{read_response, write_request},
    };
    use parking_lot::Mutex;
    use tokio::io::{duplex, AsyncWriteExt};

    /// Reports one corner per frame at (W, H) and records what it saw.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Geometry>>,
    }

    impl CornerStrategy for Recorder {
        fn mode(&self) -> &'static str {
            "TEST"
        }

        fn detect(&self, image: &GrayImage) -> Result<Vec<Corner>> {
            let g = image.geometry();
            self.seen.lock().push(g);
            Ok(vec![Corner {
                x: g.width,
                y: g.height,
                strength: Strength::Weak,
                score: image.as_slice().iter().map(|&p| p as u16).sum(),
            }])
        }
    }

    struct Failing;

    impl CornerStrategy for Failing {
        fn mode(&self) -> &'static str {
            "FAIL"
        }

        fn detect(&self, _image: &GrayImage) -> Result<Vec<Corner>> {
            Err(Error::HardwareTimeout(Duration::from_millis(1)))
        }
    }

    fn frame(h: u16, w: u16, value: u8) -> GrayImage {
        GrayImage::from_vec(Geometry::new(h, w), vec![value; h as usize * w as usize]).unwrap()
    }

    #[test]
    fn test_stats_exclude_first_frame() {
        let mut stats = SessionStats::default();
        assert_eq!(stats.average(), None);
        stats.record(Duration::from_millis(500));
        assert_eq!(stats.frames(), 1);
        assert_eq!(stats.valid_frames(), 0);
        assert_eq!(stats.fps(), None);

        stats.record(Duration::from_millis(10));
        stats.record(Duration::from_millis(30));
        assert_eq!(stats.valid_frames(), 2);
        assert_eq!(stats.average(), Some(Duration::from_millis(20)));
        let fps = stats.fps().unwrap();
        assert!((fps - 50.0).abs() < 1e-6);
    }

    #[test]
    fn test_summary_reports_all_frames() {
        let mut stats = SessionStats::default();
        stats.record(Duration::from_millis(500));
        assert_eq!(
            stats.summary("peer"),
            "session peer summary: 1 frames, no timing (first frame excluded)"
        );

        stats.record(Duration::from_millis(10));
        stats.record(Duration::from_millis(30));
        let line = stats.summary("peer");
        assert!(line.contains("3 frames (2 valid)"), "{line}");
        assert!(line.contains("total 40.0 ms"), "{line}");
        assert!(line.contains("avg 20.00 ms"), "{line}");
        assert!(line.contains("50.0 fps"), "{line}");
    }

    #[tokio::test]
    async fn test_session_geometry_changes() {
        let recorder = Arc::new(Recorder::default());
        let (mut client, server) = duplex(64);
        let session = Session::new("test", recorder.clone());
        let task = tokio::spawn(session.run(server));

        for (h, w, v) in [(2, 2, 1), (2, 2, 2), (3, 5, 1)] {
            write_request(&mut client, &frame(h, w, v)).await.unwrap();
            let corners = read_response(&mut client).await.unwrap();
            assert_eq!(corners.len(), 1);
            assert_eq!((corners[0].x, corners[0].y), (w, h));
            assert_eq!(corners[0].score, h * w * v as u16);
        }
        drop(client);

        let stats = task.await.unwrap();
        assert_eq!(stats.frames(), 3);
        assert_eq!(stats.valid_frames(), 2);
        assert_eq!(
            *recorder.seen.lock(),
            vec![
                Geometry::new(2, 2),
                Geometry::new(2, 2),
                Geometry::new(3, 5)
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_frame_skips_strategy() {
        let recorder = Arc::new(Recorder::default());
        let (mut client, server) = duplex(64);
        let task = tokio::spawn(Session::new("test", recorder.clone()).run(server));

        client.write_all(&[0, 0, 7, 0]).await.unwrap();
        assert!(read_response(&mut client).await.unwrap().is_empty());
        drop(client);

        assert_eq!(task.await.unwrap().frames(), 1);
        assert!(recorder.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_short_payload_ends_session() {
        let recorder = Arc::new(Recorder::default());
        let (mut client, server) = duplex(64);
        let task = tokio::spawn(Session::new("test", recorder.clone()).run(server));

        client.write_all(&[2, 0, 2, 0, 10, 20]).await.unwrap();
        drop(client);

        assert_eq!(task.await.unwrap().frames(), 0);
        assert!(recorder.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_strategy_fault_closes_session() {
        let (mut client, server) = duplex(64);
        let task = tokio::spawn(Session::new("test", Arc::new(Failing)).run(server));

        write_request(&mut client, &frame(2, 2, 1)).await.unwrap();
        assert!(matches!(
            read_response(&mut client).await,
            Err(Error::Protocol(_))
        ));
        assert_eq!(task.await.unwrap().frames(), 0);
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let (mut client, server) = duplex(64);
        let session = Session::new("test", Arc::new(Recorder::default()))
            .with_read_timeout(Some(Duration::from_millis(20)));
        let task = tokio::spawn(session.run(server));

        // header promises more than is ever sent
        client.write_all(&[4, 0, 4, 0, 1]).await.unwrap();
        let stats = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.frames(), 0);
        drop(client);
    }
}
