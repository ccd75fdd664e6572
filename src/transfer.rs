//! Chunked file transfer over the data channel.
//!
//! Wire discipline per file: one UTF-8 JSON `meta` text frame, then raw
//! binary chunks in send order until the cumulative size reaches the
//! declared size. No end-of-file marker beyond the byte count. Ordering is
//! inherited from the channel capability (ordered, reliable) — there are
//! no sequence numbers.

use std::path::Path;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::link::DataChannel;

/// Default chunk size for binary frames.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Backpressure threshold: suspend sending while the channel buffers more
/// than this many bytes, resume once it signals the drop below.
pub fn low_water_mark(chunk_size: usize) -> usize {
    chunk_size * 4
}

/// Header describing the file that follows, sent strictly before any of
/// its binary chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename = "meta", rename_all = "camelCase")]
pub struct FileMeta {
    pub name: String,
    pub size: u64,
    pub mime: String,
    pub chunk_size: usize,
}

/// An outgoing file: metadata plus a byte source.
pub struct OutgoingFile {
    pub meta: FileMeta,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl OutgoingFile {
    /// Open a file from disk, guessing its MIME type from the extension.
    pub async fn open(path: &Path, chunk_size: usize) -> Result<Self> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| Error::Transfer(format!("cannot open {}: {e}", path.display())))?;
        let size = file
            .metadata()
            .await
            .map_err(|e| Error::Transfer(format!("cannot stat {}: {e}", path.display())))?
            .len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());
        let mime = mime_guess::from_path(path)
            .first()
            .map(|m| m.to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string());

        Ok(Self {
            meta: FileMeta {
                name,
                size,
                mime,
                chunk_size,
            },
            reader: Box::new(file),
        })
    }
}

/// Aggregate progress across all files of one send or receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub bytes_done: u64,
    pub bytes_total: u64,
}

/// A fully received file, ready for the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub name: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

// ============================================================================
// Sending
// ============================================================================

/// Stream `files` over `channel` in order, pacing on the channel's
/// buffered amount.
///
/// Before each chunk the sender suspends while the buffered amount sits
/// above the low-water mark, so at most one chunk is ever pending beyond
/// the threshold. The first send failure aborts the remaining files.
pub async fn send_files(
    channel: &dyn DataChannel,
    files: Vec<OutgoingFile>,
    progress: &mpsc::UnboundedSender<TransferProgress>,
) -> Result<()> {
    let bytes_total: u64 = files.iter().map(|f| f.meta.size).sum();
    let mut bytes_done = 0u64;

    for mut file in files {
        let meta_json = serde_json::to_string(&file.meta)
            .map_err(|e| Error::Transfer(format!("cannot encode file meta: {e}")))?;
        channel
            .send_text(&meta_json)
            .await
            .map_err(|e| Error::Transfer(format!("meta send failed: {e}")))?;

        log::info!(
            "sending {} ({} bytes, chunk size {})",
            file.meta.name,
            file.meta.size,
            file.meta.chunk_size
        );

        let low_water = low_water_mark(file.meta.chunk_size);
        let mut buffer = vec![0u8; file.meta.chunk_size];

        loop {
            let read = file
                .reader
                .read(&mut buffer)
                .await
                .map_err(|e| Error::Transfer(format!("read failed: {e}")))?;
            if read == 0 {
                break;
            }

            while channel.buffered_amount().await > low_water {
                channel.wait_buffered_low().await;
            }

            channel
                .send_binary(Bytes::copy_from_slice(&buffer[..read]))
                .await
                .map_err(|e| Error::Transfer(format!("chunk send failed: {e}")))?;

            bytes_done += read as u64;
            let _ = progress.send(TransferProgress {
                bytes_done,
                bytes_total,
            });
        }
    }

    Ok(())
}

// ============================================================================
// Receiving
// ============================================================================

struct Reception {
    meta: FileMeta,
    chunks: Vec<Bytes>,
    received: u64,
}

/// Reassembles inbound frames into complete files.
///
/// A `meta` text frame always starts a fresh reception context; an
/// incomplete predecessor is discarded (last meta wins). Completion
/// triggers exactly when the received byte count reaches the declared
/// size, at which point the assembled length must match exactly.
#[derive(Default)]
pub struct Assembler {
    current: Option<Reception>,
    bytes_done: u64,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cumulative bytes received across all files so far.
    pub fn bytes_done(&self) -> u64 {
        self.bytes_done
    }

    /// True while a file's bytes are still outstanding.
    pub fn in_progress(&self) -> bool {
        self.current.is_some()
    }

    /// (received, declared) byte counts for the file in flight.
    pub fn current_progress(&self) -> Option<(u64, u64)> {
        self.current.as_ref().map(|r| (r.received, r.meta.size))
    }

    /// Handle a text frame. Returns the new file's meta if the frame
    /// opened a reception context; non-meta text is ignored.
    pub fn on_text(&mut self, text: &str) -> Option<FileMeta> {
        let meta: FileMeta = match serde_json::from_str(text) {
            Ok(meta) => meta,
            Err(_) => {
                log::debug!("ignoring non-meta text frame ({} bytes)", text.len());
                return None;
            }
        };

        if let Some(prior) = self.current.take() {
            log::warn!(
                "new file meta for {} supersedes incomplete {} ({}/{} bytes)",
                meta.name,
                prior.meta.name,
                prior.received,
                prior.meta.size
            );
        }

        let expected_chunks = (meta.size as usize).div_ceil(meta.chunk_size.max(1));
        self.current = Some(Reception {
            meta: meta.clone(),
            chunks: Vec::with_capacity(expected_chunks),
            received: 0,
        });

        Some(meta)
    }

    /// Handle a binary frame. Returns a completed file once the declared
    /// size is reached.
    pub fn on_binary(&mut self, data: Bytes) -> Result<Option<ReceivedFile>> {
        let Some(reception) = self.current.as_mut() else {
            log::warn!("dropping {} byte binary frame outside any file", data.len());
            return Ok(None);
        };

        reception.received += data.len() as u64;
        self.bytes_done += data.len() as u64;
        reception.chunks.push(data);

        if reception.received >= reception.meta.size {
            let reception = self.current.take().expect("reception context present");
            return self.finalize(reception).map(Some);
        }
        Ok(None)
    }

    /// Finalize a zero-byte file, whose completion cannot be driven by a
    /// binary frame.
    pub fn try_finalize_empty(&mut self) -> Result<Option<ReceivedFile>> {
        match self.current.as_ref() {
            Some(r) if r.meta.size == 0 => {
                let reception = self.current.take().expect("reception context present");
                self.finalize(reception).map(Some)
            }
            _ => Ok(None),
        }
    }

    fn finalize(&self, reception: Reception) -> Result<ReceivedFile> {
        let mut bytes = Vec::with_capacity(reception.meta.size as usize);
        for chunk in &reception.chunks {
            bytes.extend_from_slice(chunk);
        }

        if bytes.len() as u64 != reception.meta.size {
            return Err(Error::Transfer(format!(
                "size mismatch for {}: declared {} bytes, assembled {}",
                reception.meta.name,
                reception.meta.size,
                bytes.len()
            )));
        }

        Ok(ReceivedFile {
            name: reception.meta.name,
            mime: reception.meta.mime,
            bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_wire_shape() {
        let meta = FileMeta {
            name: "photo.jpg".into(),
            size: 150 * 1024,
            mime: "image/jpeg".into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["type"], "meta");
        assert_eq!(json["chunkSize"], DEFAULT_CHUNK_SIZE);
        assert_eq!(json["name"], "photo.jpg");
    }

    #[test]
    fn test_assembler_single_file() {
        let mut asm = Assembler::new();
        let meta = FileMeta {
            name: "a.bin".into(),
            size: 5,
            mime: "application/octet-stream".into(),
            chunk_size: 4,
        };
        asm.on_text(&serde_json::to_string(&meta).unwrap()).unwrap();

        assert!(asm.on_binary(Bytes::from_static(b"abcd")).unwrap().is_none());
        let done = asm.on_binary(Bytes::from_static(b"e")).unwrap().unwrap();
        assert_eq!(done.name, "a.bin");
        assert_eq!(done.bytes, b"abcde");
        assert!(!asm.in_progress());
    }

    #[test]
    fn test_assembler_last_meta_wins() {
        let mut asm = Assembler::new();
        let first = FileMeta {
            name: "first.bin".into(),
            size: 100,
            mime: "application/octet-stream".into(),
            chunk_size: 64,
        };
        asm.on_text(&serde_json::to_string(&first).unwrap());
        asm.on_binary(Bytes::from_static(b"partial")).unwrap();

        let second = FileMeta {
            name: "second.bin".into(),
            size: 3,
            mime: "application/octet-stream".into(),
            chunk_size: 64,
        };
        asm.on_text(&serde_json::to_string(&second).unwrap());

        let done = asm.on_binary(Bytes::from_static(b"xyz")).unwrap().unwrap();
        assert_eq!(done.name, "second.bin");
        assert_eq!(done.bytes, b"xyz");
    }

    #[test]
    fn test_assembler_ignores_stray_frames() {
        let mut asm = Assembler::new();
        assert!(asm.on_text("not json at all").is_none());
        assert!(asm.on_binary(Bytes::from_static(b"stray")).unwrap().is_none());
        assert_eq!(asm.bytes_done(), 0);
    }

    #[test]
    fn test_assembler_size_mismatch_is_fatal() {
        let mut asm = Assembler::new();
        let meta = FileMeta {
            name: "short.bin".into(),
            size: 3,
            mime: "application/octet-stream".into(),
            chunk_size: 64,
        };
        asm.on_text(&serde_json::to_string(&meta).unwrap());
        // One oversized chunk trips completion with the wrong total.
        assert!(asm.on_binary(Bytes::from_static(b"abcdef")).is_err());
    }

    #[test]
    fn test_assembler_empty_file() {
        let mut asm = Assembler::new();
        let meta = FileMeta {
            name: "empty.txt".into(),
            size: 0,
            mime: "text/plain".into(),
            chunk_size: 64,
        };
        asm.on_text(&serde_json::to_string(&meta).unwrap());
        let done = asm.try_finalize_empty().unwrap().unwrap();
        assert_eq!(done.bytes.len(), 0);
    }
}
