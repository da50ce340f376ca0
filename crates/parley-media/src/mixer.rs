//! Audio mixing graph for call recording.
//!
//! Each audio source (the local microphone and every connected remote)
//! feeds one input through an [`AudioTap`]. The graph is pulled at a fixed
//! rate: `render(n)` takes up to `n` buffered samples from every input,
//! pads missing samples with silence and mixes them into one output slice.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use parley_shared::UserId;

/// Frames queued per input between two renders.
const TAP_CAPACITY: usize = 512;

/// Mix multiple audio frames (f32 samples) into a single output frame.
/// Uses simple additive mixing with clipping prevention.
pub fn mix_frames(frames: &[Vec<f32>]) -> Vec<f32> {
    if frames.is_empty() {
        return Vec::new();
    }

    let max_len = frames.iter().map(|f| f.len()).max().unwrap_or(0);
    let mut output = vec![0.0f32; max_len];
    let num_sources = frames.len() as f32;

    for frame in frames {
        for (i, &sample) in frame.iter().enumerate() {
            output[i] += sample;
        }
    }

    if num_sources > 1.0 {
        let scale = 1.0 / num_sources.sqrt();
        for sample in &mut output {
            *sample *= scale;
        }
    }

    for sample in &mut output {
        *sample = sample.clamp(-1.0, 1.0);
    }

    output
}

/// Write end of one mixing-graph input.
#[derive(Clone, Debug)]
pub struct AudioTap {
    source: UserId,
    tx: mpsc::Sender<Vec<f32>>,
}

impl AudioTap {
    pub fn source(&self) -> &UserId {
        &self.source
    }

    /// Queue a frame. Returns false if it was dropped.
    pub fn push(&self, frame: Vec<f32>) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(source = %self.source, "Mixer input full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Where one link delivers decoded remote audio. The link writes into the
/// slot for its whole life while the recorder attaches, detaches or swaps
/// the tap behind it, so a recording started mid-call still hears links
/// that were opened before it.
#[derive(Clone, Debug, Default)]
pub struct TapSlot {
    tap: Arc<Mutex<Option<AudioTap>>>,
}

impl TapSlot {
    pub fn new(tap: Option<AudioTap>) -> Self {
        Self {
            tap: Arc::new(Mutex::new(tap)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<AudioTap>> {
        self.tap.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the tap. `None` stops delivery.
    pub fn set(&self, tap: Option<AudioTap>) {
        *self.lock() = tap;
    }

    pub fn is_attached(&self) -> bool {
        self.lock().as_ref().is_some_and(|tap| !tap.is_closed())
    }

    /// Queue a frame into the current tap. Returns false if there is none
    /// or the frame was dropped.
    pub fn push(&self, frame: Vec<f32>) -> bool {
        match self.lock().as_ref() {
            Some(tap) => tap.push(frame),
            None => false,
        }
    }
}

struct Input {
    rx: mpsc::Receiver<Vec<f32>>,
    buffer: VecDeque<f32>,
    closing: bool,
}

impl Input {
    fn drain(&mut self, max_buffered: usize) {
        while let Ok(frame) = self.rx.try_recv() {
            self.buffer.extend(frame);
        }
        if self.buffer.len() > max_buffered {
            let excess = self.buffer.len() - max_buffered;
            self.buffer.drain(..excess);
        }
    }
}

pub struct MixingGraph {
    inputs: BTreeMap<UserId, Input>,
    max_buffered: usize,
}

impl MixingGraph {
    /// `max_buffered` bounds the samples any one input may hold.
    pub fn new(max_buffered: usize) -> Self {
        Self {
            inputs: BTreeMap::new(),
            max_buffered,
        }
    }

    /// Add an input for `source`. Re-adding a source replaces its input;
    /// other inputs are untouched.
    pub fn add_input(&mut self, source: UserId) -> AudioTap {
        let (tx, rx) = mpsc::channel(TAP_CAPACITY);
        self.inputs.insert(
            source.clone(),
            Input {
                rx,
                buffer: VecDeque::new(),
                closing: false,
            },
        );
        debug!(source = %source, inputs = self.inputs.len(), "Mixer input added");
        AudioTap { source, tx }
    }

    /// Disconnect `source`. Samples already queued are still rendered.
    pub fn remove_input(&mut self, source: &UserId) -> bool {
        match self.inputs.get_mut(source) {
            Some(input) => {
                input.closing = true;
                input.rx.close();
                debug!(source = %source, "Mixer input disconnected");
                true
            }
            None => false,
        }
    }

    /// Inputs still attached.
    pub fn input_count(&self) -> usize {
        self.inputs.values().filter(|i| !i.closing).count()
    }

    /// Render exactly `samples` mixed samples.
    pub fn render(&mut self, samples: usize) -> Vec<f32> {
        let max_buffered = self.max_buffered.max(samples);
        let mut frames = Vec::with_capacity(self.inputs.len());

        for input in self.inputs.values_mut() {
            input.drain(max_buffered);
            let take = input.buffer.len().min(samples);
            let mut frame: Vec<f32> = input.buffer.drain(..take).collect();
            frame.resize(samples, 0.0);
            frames.push(frame);
        }

        self.inputs
            .retain(|_, input| !(input.closing && input.buffer.is_empty()));

        if frames.is_empty() {
            return vec![0.0; samples];
        }
        mix_frames(&frames)
    }
}
