//! Frame buffer for outbound STT audio.

/// Interleaved samples in one second of audio.
pub(crate) const SAMPLES_PER_SECOND: usize = crate::SAMPLE_RATE * crate::NUM_CHANNELS;

/// One second of silence at [`crate::SAMPLE_RATE`], sent to prime the server
/// lookahead and to keep its pipeline moving while draining.
pub(crate) static ONE_SECOND_OF_SILENCE: [f32; SAMPLES_PER_SECOND] = [0.0; SAMPLES_PER_SECOND];

/// Accumulates samples and cuts them into fixed-size frames.
#[derive(Debug)]
pub(crate) struct Framer {
    buffer: Vec<f32>,
    frame_size: usize,
    primed: bool,
}

impl Framer {
    /// Creates an empty frame buffer.
    ///
    /// # Panics
    ///
    /// Panics if frame_size is 0.
    pub fn new(frame_size: usize) -> Self {
        assert!(frame_size > 0, "frame_size must be greater than 0");
        Self {
            buffer: Vec::with_capacity(2 * frame_size),
            frame_size,
            primed: false,
        }
    }

    /// Returns true exactly once, on the first call.
    pub fn prime(&mut self) -> bool {
        !std::mem::replace(&mut self.primed, true)
    }

    /// Appends samples to the buffer.
    pub fn extend(&mut self, pcm: &[f32]) {
        self.buffer.extend_from_slice(pcm);
    }

    /// Removes and returns the next full frame, if one is buffered.
    pub fn next_frame(&mut self) -> Option<Vec<f32>> {
        if self.buffer.len() < self.frame_size {
            return None;
        }
        Some(self.buffer.drain(..self.frame_size).collect())
    }

    /// Removes the leftover samples and pads them with trailing silence
    /// to a full frame. Returns `None` if nothing is left.
    pub fn flush(&mut self) -> Option<Vec<f32>> {
        if self.buffer.is_empty() {
            return None;
        }
        let mut frame = std::mem::take(&mut self.buffer);
        frame.resize(self.frame_size.max(frame.len()), 0.0);
        Some(frame)
    }

    /// Returns the number of buffered samples.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }
}
