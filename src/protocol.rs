// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Wire framing between clients and the corner server.
//!
//! # Request
//!
//! ```text
//! ┌──────────────┬──────────────┬───────────────────────────────┐
//! │ H (u16 LE)   │ W (u16 LE)   │ H×W grayscale bytes, row-major │
//! └──────────────┴──────────────┴───────────────────────────────┘
//! ```
//!
//! # Response
//!
//! ```text
//! ┌──────────────┬─────────────────────────────────────────────────┐
//! │ N (u32 LE)   │ N × (x u16, y u16, strength u16, score u16) LE   │
//! └──────────────┴─────────────────────────────────────────────────┘
//! ```
//!
//! There is no maximum image size at the protocol level. Every read consumes
//! exactly the declared length; a peer that closes the connection inside a
//! message is a protocol fault, while a close on a message boundary is a
//! normal disconnect.

use crate::{
    corner::{Corner, Strength},
    error::{Error, Result},
    image::{Geometry, GrayImage},
};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the request header in bytes.
pub const HEADER_LEN: usize = 4;

/// Size of one encoded corner record in bytes.
pub const RECORD_LEN: usize = 8;

pub fn encode_header(geometry: Geometry) -> [u8; HEADER_LEN] {
    let mut hdr = [0u8; HEADER_LEN];
    hdr[..2].copy_from_slice(&geometry.height.to_le_bytes());
    hdr[2..].copy_from_slice(&geometry.width.to_le_bytes());
    hdr
}

pub fn decode_header(hdr: [u8; HEADER_LEN]) -> Geometry {
    Geometry {
        height: u16::from_le_bytes([hdr[0], hdr[1]]),
        width: u16::from_le_bytes([hdr[2], hdr[3]]),
    }
}

fn eof_fault(what: &str, len: usize, e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        Error::Protocol(format!("connection closed inside {len}-byte {what}"))
    } else {
        Error::Io(e)
    }
}

/// Reads a request header.
///
/// Returns `Ok(None)` when the peer closed the connection before sending
/// the first header byte.
pub async fn read_header<R>(reader: &mut R) -> Result<Option<Geometry>>
where
    R: AsyncRead + Unpin,
{
    let mut hdr = [0u8; HEADER_LEN];
    let n = reader.read(&mut hdr).await?;
    if n == 0 {
        return Ok(None);
    }
    reader
        .read_exact(&mut hdr[n..])
        .await
        .map_err(|e| eof_fault("header", HEADER_LEN, e))?;
    Ok(Some(decode_header(hdr)))
}

/// Fills `pixels` completely from the stream.
pub async fn read_pixels<R>(reader: &mut R, pixels: &mut [u8]) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let len = pixels.len();
    reader
        .read_exact(pixels)
        .await
        .map_err(|e| eof_fault("payload", len, e))?;
    Ok(())
}

/// Reads one whole request into a freshly allocated image.
pub async fn read_request<R>(reader: &mut R) -> Result<Option<GrayImage>>
where
    R: AsyncRead + Unpin,
{
    let Some(geometry) = read_header(reader).await? else {
        return Ok(None);
    };
    let mut img = GrayImage::new(geometry);
    read_pixels(reader, img.as_mut_slice()).await?;
    Ok(Some(img))
}

pub fn encode_request(img: &GrayImage, out: &mut Vec<u8>) {
    out.reserve(HEADER_LEN + img.as_slice().len());
    out.extend_from_slice(&encode_header(img.geometry()));
    out.extend_from_slice(img.as_slice());
}

pub async fn write_request<W>(writer: &mut W, img: &GrayImage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_header(img.geometry())).await?;
    writer.write_all(img.as_slice()).await?;
    writer.flush().await?;
    Ok(())
}

/// Appends the encoded response for `corners` to `out`.
pub fn encode_response(corners: &[Corner], out: &mut Vec<u8>) {
    out.reserve(4 + corners.len() * RECORD_LEN);
    out.extend_from_slice(&(corners.len() as u32).to_le_bytes());
    for c in corners {
        out.extend_from_slice(&c.x.to_le_bytes());
        out.extend_from_slice(&c.y.to_le_bytes());
        out.extend_from_slice(&(c.strength as u16).to_le_bytes());
        out.extend_from_slice(&c.score.to_le_bytes());
    }
}

pub async fn write_response<W>(writer: &mut W, corners: &[Corner]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::new();
    encode_response(corners, &mut buf);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

fn decode_record(rec: &[u8]) -> Result<Corner> {
    let field = |i: usize| u16::from_le_bytes([rec[2 * i], rec[2 * i + 1]]);
    let strength = match field(2) {
        0 => Strength::Weak,
        1 => Strength::Strong,
        s => return Err(Error::Protocol(format!("invalid strength flag {s}"))),
    };
    Ok(Corner {
        x: field(0),
        y: field(1),
        strength,
        score: field(3),
    })
}

/// Reads one response. End-of-stream anywhere in the response is a fault.
pub async fn read_response<R>(reader: &mut R) -> Result<Vec<Corner>>
where
    R: AsyncRead + Unpin,
{
    let mut count = [0u8; 4];
    reader
        .read_exact(&mut count)
        .await
        .map_err(|e| eof_fault("response count", 4, e))?;
    let n = u32::from_le_bytes(count) as usize;

    let len = n
        .checked_mul(RECORD_LEN)
        .ok_or_else(|| Error::Protocol(format!("corner count {n} overflows")))?;
    // the count is peer-controlled; grow with what actually arrives
    let mut records = Vec::new();
    (&mut *reader)
        .take(len as u64)
        .read_to_end(&mut records)
        .await?;
    if records.len() != len {
        return Err(Error::Protocol(format!(
            "stream ended after {} of {len} corner record bytes",
            records.len()
        )));
    }

    records.chunks_exact(RECORD_LEN).map(decode_record).collect()
}
