use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

/// Rate the APU produces samples at: 800 samples per ~60 Hz frame.
pub const SOURCE_SAMPLE_RATE: u32 = 48_000;

const QUEUE_FRAMES: usize = 4;
const FRAME_WAIT: Duration = Duration::from_millis(20);

/// Mono i16 samples shared between the emulator thread and the device
/// callback. The callback signals `drained` whenever it consumes samples.
pub struct SampleQueue {
    samples: Mutex<VecDeque<i16>>,
    drained: Condvar,
    capacity: usize,
}

impl SampleQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            drained: Condvar::new(),
            capacity,
        }
    }

    /// Appends a frame, waiting up to `wait` for room. Anything that still
    /// does not fit pushes the oldest samples out. Returns how many were dropped.
    pub fn push_frame(&self, frame: &[i16], wait: Duration) -> usize {
        if frame.is_empty() {
            return 0;
        }
        let Ok(queue) = self.samples.lock() else {
            return 0;
        };
        let room_needed = self.capacity.saturating_sub(frame.len());
        let Ok((mut queue, _)) = self
            .drained
            .wait_timeout_while(queue, wait, |q| q.len() > room_needed)
        else {
            return 0;
        };

        let overflow = (queue.len() + frame.len()).saturating_sub(self.capacity);
        let dropped = overflow.min(queue.len());
        queue.drain(..dropped);
        queue.extend(frame.iter().copied());
        dropped
    }

    pub fn pop(&self) -> i16 {
        let Ok(mut queue) = self.samples.lock() else {
            return 0;
        };
        let sample = queue.pop_front().unwrap_or(0);
        self.drained.notify_one();
        sample
    }

    pub fn len(&self) -> usize {
        self.samples.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut queue) = self.samples.lock() {
            queue.clear();
        }
    }
}

pub struct AudioOutput {
    queue: Arc<SampleQueue>,
    _stream: cpal::Stream,
    sample_rate: u32,
    resampler: Resampler,
    scratch: Vec<i16>,
}

impl AudioOutput {
    /// Opens the default output device, preferring a 48 kHz config.
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| anyhow!("no default audio output device"))?;
        let supported = preferred_config(&device)?;

        let stream_config: cpal::StreamConfig = supported.config();
        let sample_rate = stream_config.sample_rate.0;
        let channels = stream_config.channels as usize;
        let frame_len = (sample_rate / 60) as usize;
        let queue = Arc::new(SampleQueue::new(frame_len * QUEUE_FRAMES));

        let err_fn = |err| {
            eprintln!("audio stream error: {err}");
        };

        let stream = match supported.sample_format() {
            cpal::SampleFormat::F32 => {
                let queue = Arc::clone(&queue);
                device.build_output_stream(
                    &stream_config,
                    move |data: &mut [f32], _| {
                        fill_output(data, channels, &queue, |s| s as f32 / 32768.0)
                    },
                    err_fn,
                    None,
                )?
            }
            cpal::SampleFormat::I16 => {
                let queue = Arc::clone(&queue);
                device.build_output_stream(
                    &stream_config,
                    move |data: &mut [i16], _| fill_output(data, channels, &queue, |s| s),
                    err_fn,
                    None,
                )?
            }
            cpal::SampleFormat::U16 => {
                let queue = Arc::clone(&queue);
                device.build_output_stream(
                    &stream_config,
                    move |data: &mut [u16], _| {
                        fill_output(data, channels, &queue, |s| (s as u16) ^ 0x8000)
                    },
                    err_fn,
                    None,
                )?
            }
            other => {
                return Err(anyhow!("unsupported audio sample format: {other:?}"));
            }
        };

        stream
            .play()
            .context("failed to start audio output stream")?;

        Ok(Self {
            queue,
            _stream: stream,
            sample_rate,
            resampler: Resampler::new(SOURCE_SAMPLE_RATE, sample_rate),
            scratch: Vec::with_capacity(frame_len + 1),
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Queues one emulated frame of samples. Blocks for a bounded time when
    /// the device is behind, which paces the caller to the audio clock.
    pub fn write_frame(&mut self, samples: &[i16]) {
        if self.sample_rate == SOURCE_SAMPLE_RATE {
            self.queue.push_frame(samples, FRAME_WAIT);
            return;
        }
        self.resampler.process(samples, &mut self.scratch);
        self.queue.push_frame(&self.scratch, FRAME_WAIT);
    }

    pub fn queued_samples(&self) -> usize {
        self.queue.len()
    }

    pub fn clear(&self) {
        self.queue.clear();
    }
}

fn preferred_config(device: &cpal::Device) -> Result<cpal::SupportedStreamConfig> {
    let wanted = cpal::SampleRate(SOURCE_SAMPLE_RATE);
    if let Ok(mut configs) = device.supported_output_configs() {
        if let Some(range) = configs.find(|range| {
            matches!(
                range.sample_format(),
                cpal::SampleFormat::F32 | cpal::SampleFormat::I16 | cpal::SampleFormat::U16
            ) && range.min_sample_rate() <= wanted
                && range.max_sample_rate() >= wanted
        }) {
            return Ok(range.with_sample_rate(wanted));
        }
    }
    device
        .default_output_config()
        .context("failed to query default audio config")
}

/// Nearest-sample rate conversion that keeps its phase between frames, so
/// rates that do not divide a frame evenly still average out exactly.
#[derive(Debug, Clone)]
pub struct Resampler {
    from_rate: u64,
    to_rate: u64,
    /// Source position of the next output sample, in 1/to_rate steps.
    phase: u64,
}

impl Resampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        Self {
            from_rate: u64::from(from_rate.max(1)),
            to_rate: u64::from(to_rate.max(1)),
            phase: 0,
        }
    }

    pub fn process(&mut self, input: &[i16], out: &mut Vec<i16>) {
        out.clear();
        let end = input.len() as u64 * self.to_rate;
        let mut pos = self.phase;
        while pos < end {
            out.push(input[(pos / self.to_rate) as usize]);
            pos += self.from_rate;
        }
        self.phase = pos.saturating_sub(end);
    }
}

fn fill_output<T: Copy>(
    data: &mut [T],
    channels: usize,
    queue: &SampleQueue,
    convert: impl Fn(i16) -> T,
) {
    for frame in data.chunks_mut(channels) {
        let sample = convert(queue.pop());
        for out in frame {
            *out = sample;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_frame_drops_oldest_when_full() {
        let queue = SampleQueue::new(8);
        assert_eq!(queue.push_frame(&[1, 2, 3, 4, 5, 6], Duration::ZERO), 0);
        assert_eq!(queue.push_frame(&[7, 8, 9, 10], Duration::ZERO), 2);
        assert_eq!(queue.len(), 8);
        assert_eq!(queue.pop(), 3);
    }

    #[test]
    fn empty_queue_plays_silence() {
        let queue = SampleQueue::new(4);
        assert!(queue.is_empty());
        assert_eq!(queue.pop(), 0);
    }

    #[test]
    fn writer_waits_for_the_reader() {
        let queue = Arc::new(SampleQueue::new(4));
        queue.push_frame(&[1, 2, 3, 4], Duration::ZERO);

        let reader = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                queue.pop();
                queue.pop();
            })
        };
        let dropped = queue.push_frame(&[5, 6], Duration::from_secs(2));
        reader.join().unwrap();
        assert_eq!(dropped, 0);
        assert_eq!(queue.len(), 4);
    }

    #[test]
    fn resampler_matches_rate_over_whole_frames() {
        let input: Vec<i16> = (0..800).map(|i| i as i16).collect();
        let mut out = Vec::new();

        let mut to_44k = Resampler::new(48_000, 44_100);
        to_44k.process(&input, &mut out);
        assert_eq!(out.len(), 735);
        assert_eq!(out[0], 0);
        assert!(out.windows(2).all(|w| w[0] <= w[1]));

        let mut to_96k = Resampler::new(48_000, 96_000);
        to_96k.process(&input, &mut out);
        assert_eq!(out.len(), 1600);
        assert_eq!(&out[..4], &[0, 0, 1, 1]);
    }

    #[test]
    fn resampler_carries_fractional_samples_between_frames() {
        let input = vec![1i16; 800];
        let mut out = Vec::new();
        let mut resampler = Resampler::new(48_000, 22_050);

        let mut lengths = Vec::new();
        for _ in 0..60 {
            resampler.process(&input, &mut out);
            lengths.push(out.len());
        }
        assert_eq!(&lengths[..2], &[368, 367]);
        assert_eq!(lengths.iter().sum::<usize>(), 22_050);
    }

    #[test]
    fn resampler_passes_matching_rates_through() {
        let input: Vec<i16> = (0..800).map(|i| (i * 3) as i16).collect();
        let mut out = Vec::new();
        let mut resampler = Resampler::new(48_000, 48_000);
        for _ in 0..3 {
            resampler.process(&input, &mut out);
            assert_eq!(out, input);
        }
    }
}
