//! # Capture Frame Buffer
//!
//! Collects the variable-sized blocks delivered by the capture device and cuts
//! them into fixed-size frames for the processing chain.
//!
//! ## Key Features:
//! - **Channel selection**: interleaved input is reduced to channel 0 (the
//!   outbound stream is mono)
//! - **Fixed frames**: `next_frame` only yields once a full frame is buffered
//! - **Bounded**: anything beyond `max_frames` worth of backlog is discarded
//!   from the front so a stalled consumer cannot grow memory without limit

use std::collections::VecDeque;

/// Buffer sizing.
#[derive(Debug, Clone)]
pub struct FrameBufferConfig {
    /// Samples per frame (per channel)
    pub frame_size: usize,

    /// Interleaved channel count of incoming blocks
    pub channels: u16,

    /// Frames of backlog kept before the oldest samples are dropped
    pub max_frames: usize,
}

impl Default for FrameBufferConfig {
    fn default() -> Self {
        Self {
            frame_size: 4096,
            channels: 2,
            max_frames: 8,
        }
    }
}

/// FIFO of channel-0 samples.
#[derive(Debug)]
pub struct FrameBuffer {
    samples: VecDeque<f32>,
    config: FrameBufferConfig,
    max_samples: usize,
    dropped_samples: u64,
}

impl FrameBuffer {
    pub fn new(config: FrameBufferConfig) -> Self {
        let max_samples = config.frame_size * config.max_frames.max(1);
        Self {
            samples: VecDeque::with_capacity(max_samples),
            config,
            max_samples,
            dropped_samples: 0,
        }
    }

    /// Append an interleaved block.
    ///
    /// ## Parameters:
    /// - **block**: interleaved samples
    /// - **channels**: channel count of this block; overrides the configured
    ///   count because devices may not honour the requested layout
    pub fn push_interleaved(&mut self, block: &[f32], channels: u16) {
        let stride = channels.max(1) as usize;
        for sample in block.iter().step_by(stride) {
            self.samples.push_back(*sample);
            if self.samples.len() > self.max_samples {
                self.samples.pop_front();
                self.dropped_samples += 1;
            }
        }
    }

    /// Take the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Option<Vec<f32>> {
        if self.samples.len() < self.config.frame_size {
            return None;
        }
        Some(self.samples.drain(..self.config.frame_size).collect())
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn dropped_samples(&self) -> u64 {
        self.dropped_samples
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn config(&self) -> &FrameBufferConfig {
        &self.config
    }
}
