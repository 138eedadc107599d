//! Loopback audio capture on a dedicated thread

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, StreamConfig};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;

/// Audio capture errors
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("No output device found")]
    NoOutputDevice,

    #[error("Failed to get device config: {0}")]
    ConfigError(String),

    #[error("Unsupported sample format: {0}")]
    UnsupportedSampleFormat(String),

    #[error("Failed to build audio stream: {0}")]
    StreamError(String),

    #[error("Failed to start stream: {0}")]
    PlayError(String),

    #[error("Thread error: {0}")]
    ThreadError(String),
}

/// Producer of chronologically ordered, interleaved audio frames.
///
/// The analyzer pulls one tick's worth of frames per update.
pub trait FrameSource: Send {
    fn channels(&self) -> usize;

    fn sample_rate(&self) -> u32;

    /// Fill `out` with whole interleaved frames and return how many were
    /// written. Zero means nothing is ready yet.
    fn read_frames(&mut self, out: &mut [f32]) -> usize;

    /// Reads that could not be served in full
    fn underruns(&self) -> u64 {
        0
    }

    /// Frames discarded because the reader fell behind
    fn dropped_frames(&self) -> u64 {
        0
    }
}

/// A source shared with another thread is read under its lock.
impl<S: FrameSource> FrameSource for Arc<Mutex<S>> {
    fn channels(&self) -> usize {
        self.lock().channels()
    }

    fn sample_rate(&self) -> u32 {
        self.lock().sample_rate()
    }

    fn read_frames(&mut self, out: &mut [f32]) -> usize {
        self.lock().read_frames(out)
    }

    fn underruns(&self) -> u64 {
        self.lock().underruns()
    }

    fn dropped_frames(&self) -> u64 {
        self.lock().dropped_frames()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferState {
    /// Waiting for `prepare_frames` before handing anything out
    Preparing,
    Playing,
}

/// Per-channel queue between the capture callback and the analyzer.
///
/// Reads are all-or-nothing: a request that cannot be served in full is an
/// underrun and leaves the queue untouched. The oldest frames are dropped
/// once more than `max_frames` are queued.
pub struct CaptureBuffer {
    queues: Vec<VecDeque<f32>>,
    sample_rate: u32,
    prepare_frames: usize,
    max_frames: usize,
    state: BufferState,
    underruns: u64,
    dropped_frames: u64,
}

impl CaptureBuffer {
    pub fn new(channels: usize, sample_rate: u32, prepare_frames: usize, max_frames: usize) -> Self {
        let max_frames = max_frames.max(prepare_frames).max(1);
        Self {
            queues: (0..channels)
                .map(|_| VecDeque::with_capacity(max_frames * 2))
                .collect(),
            sample_rate,
            prepare_frames,
            max_frames,
            state: BufferState::Preparing,
            underruns: 0,
            dropped_frames: 0,
        }
    }

    /// Frames currently queued
    pub fn available(&self) -> usize {
        self.queues.first().map(VecDeque::len).unwrap_or(0)
    }

    pub fn is_playing(&self) -> bool {
        self.state == BufferState::Playing
    }

    /// Deinterleave and queue captured samples; a trailing partial frame is ignored.
    pub fn push_interleaved(&mut self, data: &[f32]) {
        let channels = self.queues.len();
        if channels == 0 {
            return;
        }
        for frame in data.chunks_exact(channels) {
            for (queue, &sample) in self.queues.iter_mut().zip(frame) {
                queue.push_back(sample);
            }
        }

        let excess = self.available().saturating_sub(self.max_frames);
        if excess > 0 {
            for queue in &mut self.queues {
                queue.drain(..excess);
            }
            self.dropped_frames += excess as u64;
        }
    }

    /// Drop everything queued and wait for a fresh prepare period.
    pub fn clear(&mut self) {
        for queue in &mut self.queues {
            queue.clear();
        }
        self.state = BufferState::Preparing;
    }
}

impl FrameSource for CaptureBuffer {
    fn channels(&self) -> usize {
        self.queues.len()
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read_frames(&mut self, out: &mut [f32]) -> usize {
        let channels = self.queues.len();
        if channels == 0 {
            return 0;
        }
        let requested = out.len() / channels;
        let available = self.available();

        if self.state == BufferState::Preparing {
            if available < self.prepare_frames.max(requested) {
                return 0;
            }
            self.state = BufferState::Playing;
        }

        if available < requested {
            self.underruns += 1;
            return 0;
        }

        for (channel, queue) in self.queues.iter_mut().enumerate() {
            for (frame, sample) in queue.drain(..requested).enumerate() {
                out[frame * channels + channel] = sample;
            }
        }
        requested
    }

    fn underruns(&self) -> u64 {
        self.underruns
    }

    fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }
}

/// Commands sent to the capture thread
enum CaptureCommand {
    Stop,
}

type Ready = Result<(Arc<Mutex<CaptureBuffer>>, u32, usize), CaptureError>;

/// Loopback capture of the default output device.
///
/// The cpal stream is not `Send`, so a dedicated thread owns it for its whole
/// lifetime; this handle only talks to that thread and shares the buffer.
pub struct LoopbackCapture {
    command_tx: mpsc::Sender<CaptureCommand>,
    thread_handle: Option<JoinHandle<()>>,
    buffer: Arc<Mutex<CaptureBuffer>>,
    sample_rate: u32,
    channels: usize,
}

impl LoopbackCapture {
    /// Open the default output device for loopback capture.
    ///
    /// `prepare_ms` of audio is buffered before the first read succeeds and
    /// at most `max_ms` is kept queued.
    pub fn start(prepare_ms: u32, max_ms: u32) -> Result<Self, CaptureError> {
        let (command_tx, command_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel::<Ready>();

        let thread_handle = thread::Builder::new()
            .name("loopback-capture".to_string())
            .spawn(move || run_capture_thread(prepare_ms, max_ms, command_rx, ready_tx))
            .map_err(|e| CaptureError::ThreadError(e.to_string()))?;

        let ready = ready_rx.recv().map_err(|_| {
            CaptureError::ThreadError("capture thread exited before starting".to_string())
        });

        match ready {
            Ok(Ok((buffer, sample_rate, channels))) => Ok(Self {
                command_tx,
                thread_handle: Some(thread_handle),
                buffer,
                sample_rate,
                channels,
            }),
            Ok(Err(e)) | Err(e) => {
                let _ = thread_handle.join();
                Err(e)
            }
        }
    }

    /// Stop the capture thread
    pub fn stop(&mut self) {
        let _ = self.command_tx.send(CaptureCommand::Stop);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl FrameSource for LoopbackCapture {
    fn channels(&self) -> usize {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read_frames(&mut self, out: &mut [f32]) -> usize {
        self.buffer.read_frames(out)
    }

    fn underruns(&self) -> u64 {
        self.buffer.underruns()
    }

    fn dropped_frames(&self) -> u64 {
        self.buffer.dropped_frames()
    }
}

impl Drop for LoopbackCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Owns the stream until a stop command arrives or the handle goes away.
fn run_capture_thread(
    prepare_ms: u32,
    max_ms: u32,
    command_rx: mpsc::Receiver<CaptureCommand>,
    ready_tx: mpsc::Sender<Ready>,
) {
    let (stream, buffer, sample_rate, channels) = match open_stream(prepare_ms, max_ms) {
        Ok(opened) => opened,
        Err(e) => {
            log::error!("Loopback capture failed to start: {}", e);
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    if ready_tx.send(Ok((buffer, sample_rate, channels))).is_err() {
        return;
    }

    match command_rx.recv() {
        Ok(CaptureCommand::Stop) => log::info!("Loopback capture stopping"),
        Err(_) => log::info!("Loopback capture handle dropped"),
    }
    drop(stream);
}

fn open_stream(
    prepare_ms: u32,
    max_ms: u32,
) -> Result<(cpal::Stream, Arc<Mutex<CaptureBuffer>>, u32, usize), CaptureError> {
    let host = cpal::default_host();

    // WASAPI allows an input stream on an output device, which yields the mix
    let device = host
        .default_output_device()
        .ok_or(CaptureError::NoOutputDevice)?;
    let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());

    let config = device
        .default_output_config()
        .map_err(|e| CaptureError::ConfigError(format!("Loopback config: {}", e)))?;

    let sample_rate = config.sample_rate().0;
    let channels = config.channels() as usize;
    log::info!(
        "Loopback capture on {}: {} Hz, {} channels, {:?}",
        device_name,
        sample_rate,
        channels,
        config.sample_format()
    );

    let frames_for = |ms: u32| (sample_rate as u64 * ms as u64 / 1000) as usize;
    let buffer = Arc::new(Mutex::new(CaptureBuffer::new(
        channels,
        sample_rate,
        frames_for(prepare_ms),
        frames_for(max_ms),
    )));

    let stream_config: StreamConfig = config.clone().into();
    let stream = match config.sample_format() {
        SampleFormat::F32 => build_stream::<f32>(&device, &stream_config, buffer.clone()),
        SampleFormat::I16 => build_stream::<i16>(&device, &stream_config, buffer.clone()),
        SampleFormat::U16 => build_stream::<u16>(&device, &stream_config, buffer.clone()),
        other => return Err(CaptureError::UnsupportedSampleFormat(format!("{:?}", other))),
    }
    .map_err(|e| CaptureError::StreamError(e.to_string()))?;

    stream
        .play()
        .map_err(|e| CaptureError::PlayError(e.to_string()))?;

    log::info!("Loopback capture started");
    Ok((stream, buffer, sample_rate, channels))
}

/// Build the input stream for a given sample type
fn build_stream<T: cpal::Sample + cpal::SizedSample>(
    device: &Device,
    config: &StreamConfig,
    buffer: Arc<Mutex<CaptureBuffer>>,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    f32: cpal::FromSample<T>,
{
    let mut converted: Vec<f32> = Vec::new();
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            converted.clear();
            converted.extend(data.iter().map(|s| -> f32 { cpal::Sample::from_sample(*s) }));
            buffer.lock().push_interleaved(&converted);
        },
        |err| {
            log::error!("Audio stream error: {}", err);
        },
        None,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preparing_buffer_holds_back_until_filled() {
        let mut buffer = CaptureBuffer::new(2, 48000, 4, 64);
        let mut out = [0.0f32; 4];

        buffer.push_interleaved(&[1.0, -1.0, 2.0, -2.0, 3.0, -3.0]);
        assert_eq!(buffer.read_frames(&mut out), 0);
        assert!(!buffer.is_playing());
        assert_eq!(buffer.underruns(), 0);

        buffer.push_interleaved(&[4.0, -4.0]);
        assert_eq!(buffer.read_frames(&mut out), 2);
        assert!(buffer.is_playing());
        assert_eq!(out, [1.0, -1.0, 2.0, -2.0]);
    }

    #[test]
    fn frames_come_out_in_capture_order() {
        let mut buffer = CaptureBuffer::new(1, 48000, 0, 64);
        buffer.push_interleaved(&[1.0, 2.0, 3.0]);
        buffer.push_interleaved(&[4.0, 5.0, 6.0]);

        let mut out = [0.0f32; 4];
        assert_eq!(buffer.read_frames(&mut out), 4);
        assert_eq!(out, [1.0, 2.0, 3.0, 4.0]);
        assert_eq!(buffer.available(), 2);
    }

    #[test]
    fn short_read_while_playing_is_an_underrun() {
        let mut buffer = CaptureBuffer::new(1, 48000, 1, 64);
        buffer.push_interleaved(&[1.0, 2.0]);
        let mut out = [0.0f32; 2];
        assert_eq!(buffer.read_frames(&mut out), 2);

        buffer.push_interleaved(&[3.0]);
        assert_eq!(buffer.read_frames(&mut out), 0);
        assert_eq!(buffer.underruns(), 1);
        assert_eq!(buffer.available(), 1);
    }

    #[test]
    fn oldest_frames_are_dropped_past_max() {
        let mut buffer = CaptureBuffer::new(1, 48000, 0, 4);
        buffer.push_interleaved(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        assert_eq!(buffer.available(), 4);
        assert_eq!(buffer.dropped_frames(), 2);

        let mut out = [0.0f32; 4];
        buffer.read_frames(&mut out);
        assert_eq!(out, [3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn clear_returns_to_preparing() {
        let mut buffer = CaptureBuffer::new(1, 48000, 2, 16);
        buffer.push_interleaved(&[1.0, 2.0]);
        let mut out = [0.0f32; 2];
        buffer.read_frames(&mut out);
        assert!(buffer.is_playing());

        buffer.clear();
        assert!(!buffer.is_playing());
        assert_eq!(buffer.available(), 0);
    }

    #[test]
    fn shared_buffer_reads_through_lock() {
        let shared = Arc::new(Mutex::new(CaptureBuffer::new(2, 44100, 0, 64)));
        let mut reader = shared.clone();
        shared.lock().push_interleaved(&[0.1, 0.2, 0.3, 0.4]);

        let mut out = [0.0f32; 4];
        assert_eq!(reader.channels(), 2);
        assert_eq!(reader.sample_rate(), 44100);
        assert_eq!(reader.read_frames(&mut out), 2);
        assert_eq!(out, [0.1, 0.2, 0.3, 0.4]);
        assert_eq!(shared.lock().available(), 0);
    }
}
