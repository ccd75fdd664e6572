//! Transfer engine tests over an in-memory channel fake.

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use droplink::error::{Error, Result};
use droplink::link::DataChannel;
use droplink::transfer::{
    low_water_mark, send_files, Assembler, FileMeta, OutgoingFile, TransferProgress,
    DEFAULT_CHUNK_SIZE,
};

/// One recorded frame, as the wire would carry it.
#[derive(Debug, Clone)]
enum Frame {
    Text(String),
    Binary(Bytes),
}

/// In-memory stand-in for the data channel capability.
///
/// Tracks a simulated buffered amount that only drains when the sender
/// suspends on `wait_buffered_low`, which makes the backpressure bound
/// deterministic.
struct FakeChannel {
    frames: Mutex<Vec<Frame>>,
    buffered: AtomicUsize,
    max_buffered: AtomicUsize,
    fail_after_frames: Option<usize>,
}

impl FakeChannel {
    fn new() -> Self {
        Self {
            frames: Mutex::new(Vec::new()),
            buffered: AtomicUsize::new(0),
            max_buffered: AtomicUsize::new(0),
            fail_after_frames: None,
        }
    }

    fn failing_after(frames: usize) -> Self {
        Self {
            fail_after_frames: Some(frames),
            ..Self::new()
        }
    }

    fn frames(&self) -> Vec<Frame> {
        self.frames.lock().unwrap().clone()
    }

    fn record(&self, frame: Frame, len: usize) -> Result<()> {
        let mut frames = self.frames.lock().unwrap();
        if let Some(limit) = self.fail_after_frames {
            if frames.len() >= limit {
                return Err(Error::Channel("simulated send failure".into()));
            }
        }
        frames.push(frame);
        let now = self.buffered.fetch_add(len, Ordering::SeqCst) + len;
        self.max_buffered.fetch_max(now, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl DataChannel for FakeChannel {
    async fn send_text(&self, text: &str) -> Result<()> {
        self.record(Frame::Text(text.to_string()), text.len())
    }

    async fn send_binary(&self, data: Bytes) -> Result<()> {
        let len = data.len();
        self.record(Frame::Binary(data), len)
    }

    async fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    async fn wait_buffered_low(&self) {
        // The transport drains while the sender is suspended.
        self.buffered.store(0, Ordering::SeqCst);
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

fn outgoing(name: &str, data: Vec<u8>, chunk_size: usize) -> OutgoingFile {
    OutgoingFile {
        meta: FileMeta {
            name: name.to_string(),
            size: data.len() as u64,
            mime: "application/octet-stream".to_string(),
            chunk_size,
        },
        reader: Box::new(Cursor::new(data)),
    }
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Drive every recorded frame through an assembler, reproducing the
/// receive loop's handling of meta and binary frames.
fn reassemble(frames: &[Frame]) -> Vec<droplink::transfer::ReceivedFile> {
    let mut assembler = Assembler::new();
    let mut received = Vec::new();

    for frame in frames {
        match frame {
            Frame::Text(text) => {
                if assembler.on_text(text).is_some() {
                    if let Some(file) = assembler.try_finalize_empty().unwrap() {
                        received.push(file);
                    }
                }
            }
            Frame::Binary(data) => {
                if let Some(file) = assembler.on_binary(data.clone()).unwrap() {
                    received.push(file);
                }
            }
        }
    }
    received
}

#[tokio::test]
async fn test_single_file_frame_layout() {
    // The end-to-end scenario: 150 KB at a 64 KiB chunk size.
    let channel = FakeChannel::new();
    let (progress_tx, _progress_rx) = mpsc::unbounded_channel();
    let data = patterned(150 * 1024);

    send_files(
        &channel,
        vec![outgoing("photo.jpg", data.clone(), DEFAULT_CHUNK_SIZE)],
        &progress_tx,
    )
    .await
    .unwrap();

    let frames = channel.frames();
    assert_eq!(frames.len(), 4); // one meta + three chunks

    match &frames[0] {
        Frame::Text(text) => {
            let meta: FileMeta = serde_json::from_str(text).unwrap();
            assert_eq!(meta.name, "photo.jpg");
            assert_eq!(meta.size, 150 * 1024);
        }
        other => panic!("expected meta frame first, got {other:?}"),
    }

    let chunk_sizes: Vec<usize> = frames[1..]
        .iter()
        .map(|f| match f {
            Frame::Binary(b) => b.len(),
            other => panic!("expected binary chunk, got {other:?}"),
        })
        .collect();
    assert_eq!(chunk_sizes, vec![64 * 1024, 64 * 1024, 22 * 1024]);

    let received = reassemble(&frames);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].bytes, data);
}

#[tokio::test]
async fn test_multi_file_frame_counts_and_sizes() {
    let chunk = 1024;
    let sizes = [10usize, 0, 5000, 1024];
    let channel = FakeChannel::new();
    let (progress_tx, _progress_rx) = mpsc::unbounded_channel();

    let files = sizes
        .iter()
        .enumerate()
        .map(|(i, &len)| outgoing(&format!("file{i}.bin"), patterned(len), chunk))
        .collect();

    send_files(&channel, files, &progress_tx).await.unwrap();

    let frames = channel.frames();
    let meta_count = frames.iter().filter(|f| matches!(f, Frame::Text(_))).count();
    let binary_count = frames.len() - meta_count;
    let expected_binary: usize = sizes.iter().map(|&s| s.div_ceil(chunk)).sum();
    assert_eq!(meta_count, sizes.len());
    assert_eq!(binary_count, expected_binary);

    // The receiver emits exactly n completed files of the declared sizes.
    let received = reassemble(&frames);
    assert_eq!(received.len(), sizes.len());
    for (i, file) in received.iter().enumerate() {
        assert_eq!(file.name, format!("file{i}.bin"));
        assert_eq!(file.bytes.len(), sizes[i]);
        assert_eq!(file.bytes, patterned(sizes[i]));
    }
}

#[tokio::test]
async fn test_backpressure_bound_holds() {
    let chunk = 4 * 1024;
    let channel = FakeChannel::new();
    let (progress_tx, _progress_rx) = mpsc::unbounded_channel();

    send_files(
        &channel,
        vec![outgoing("big.bin", patterned(256 * 1024), chunk)],
        &progress_tx,
    )
    .await
    .unwrap();

    // The sender may exceed the low-water mark by at most one pending
    // chunk (plus the meta frame sent before any chunk).
    let meta_len = match &channel.frames()[0] {
        Frame::Text(text) => text.len(),
        Frame::Binary(_) => 0,
    };
    let bound = low_water_mark(chunk) + chunk + meta_len;
    assert!(channel.max_buffered.load(Ordering::SeqCst) <= bound);
}

#[tokio::test]
async fn test_send_failure_aborts_remaining_files() {
    // Fail once the meta and first chunk of file one are out.
    let channel = FakeChannel::failing_after(2);
    let (progress_tx, _progress_rx) = mpsc::unbounded_channel();

    let result = send_files(
        &channel,
        vec![
            outgoing("one.bin", patterned(4096), 1024),
            outgoing("two.bin", patterned(4096), 1024),
        ],
        &progress_tx,
    )
    .await;

    assert!(matches!(result, Err(Error::Transfer(_))));
    // Nothing of the second file ever hits the wire.
    let frames = channel.frames();
    assert_eq!(frames.len(), 2);
}

#[tokio::test]
async fn test_progress_is_cumulative_across_files() {
    let channel = FakeChannel::new();
    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<TransferProgress>();

    send_files(
        &channel,
        vec![
            outgoing("a.bin", patterned(2048), 1024),
            outgoing("b.bin", patterned(1024), 1024),
        ],
        &progress_tx,
    )
    .await
    .unwrap();
    drop(progress_tx);

    let mut reports = Vec::new();
    while let Some(report) = progress_rx.recv().await {
        reports.push(report);
    }

    assert_eq!(reports.len(), 3);
    assert!(reports.iter().all(|r| r.bytes_total == 3072));
    let done: Vec<u64> = reports.iter().map(|r| r.bytes_done).collect();
    assert_eq!(done, vec![1024, 2048, 3072]);
}
