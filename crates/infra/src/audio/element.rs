//! In-memory media element
//!
//! `MemoryElement` plays PCM clips registered under a source name. Clips are
//! resampled to the output rate when loaded so `read_frames` can hand out
//! blocks at the rate the output stream runs at.

use encore_core::domain::audio::{ElementId, MediaElement, MediaEvent, SharedElement};
use std::collections::HashMap;
use std::f32::consts::TAU;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Interleaved PCM audio
#[derive(Debug, Clone, PartialEq)]
pub struct Clip {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl Clip {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate: sample_rate.max(1),
            channels: channels.max(1),
        }
    }

    /// Sum of equal-level sines, peaking at `amplitude`
    pub fn tones(
        frequencies: &[f32],
        seconds: f32,
        sample_rate: u32,
        channels: u16,
        amplitude: f32,
    ) -> Self {
        let frames = (seconds.max(0.0) * sample_rate as f32) as usize;
        let level = amplitude / frequencies.len().max(1) as f32;
        let mut samples = Vec::with_capacity(frames * channels as usize);
        for frame in 0..frames {
            let t = frame as f32 / sample_rate as f32;
            let value: f32 = frequencies
                .iter()
                .map(|freq| (TAU * freq * t).sin() * level)
                .sum();
            samples.extend(std::iter::repeat(value).take(channels as usize));
        }
        Self::new(samples, sample_rate, channels)
    }

    pub fn sine(frequency: f32, seconds: f32, sample_rate: u32, channels: u16) -> Self {
        Self::tones(&[frequency], seconds, sample_rate, channels, 0.5)
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    pub fn duration_secs(&self) -> f64 {
        self.frames() as f64 / f64::from(self.sample_rate)
    }

    /// Linear-interpolation resample to `target_rate`
    pub fn resampled(&self, target_rate: u32) -> Clip {
        if target_rate == self.sample_rate || self.frames() == 0 {
            return Clip {
                sample_rate: target_rate.max(1),
                ..self.clone()
            };
        }

        debug!(
            "Resampling clip: {}Hz -> {}Hz, {} channels",
            self.sample_rate, target_rate, self.channels
        );

        let channels = self.channels as usize;
        let input_frames = self.frames();
        let step = f64::from(self.sample_rate) / f64::from(target_rate);
        let output_frames = (input_frames as f64 / step).floor() as usize;

        let mut samples = Vec::with_capacity(output_frames * channels);
        for frame in 0..output_frames {
            let position = frame as f64 * step;
            let i0 = position.floor() as usize;
            let i1 = (i0 + 1).min(input_frames - 1);
            let frac = (position - i0 as f64) as f32;
            for ch in 0..channels {
                let a = self.samples[i0 * channels + ch];
                let b = self.samples[i1 * channels + ch];
                samples.push(a + frac * (b - a));
            }
        }

        Clip::new(samples, target_rate, self.channels)
    }
}

/// Media element backed by clips held in memory
#[derive(Debug)]
pub struct MemoryElement {
    id: ElementId,
    output_rate: u32,
    output_channels: usize,
    library: HashMap<String, Clip>,
    src: Option<String>,
    clip: Option<Clip>,
    cursor: usize,
    paused: bool,
    volume: f32,
    muted: bool,
    events: Vec<MediaEvent>,
}

impl MemoryElement {
    pub fn new(output_rate: u32, output_channels: u16) -> Self {
        Self {
            id: ElementId::next(),
            output_rate: output_rate.max(1),
            output_channels: output_channels.max(1) as usize,
            library: HashMap::new(),
            src: None,
            clip: None,
            cursor: 0,
            paused: true,
            volume: 1.0,
            muted: false,
            events: Vec::new(),
        }
    }

    /// Make a clip playable under `name`
    pub fn register(&mut self, name: impl Into<String>, clip: Clip) {
        self.library.insert(name.into(), clip);
    }

    /// Wrap in the shared handle the player and effects chain use
    pub fn into_shared(self) -> (Arc<Mutex<MemoryElement>>, SharedElement) {
        let concrete = Arc::new(Mutex::new(self));
        let shared: SharedElement = concrete.clone();
        (concrete, shared)
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    /// Loaded clip length in seconds
    pub fn duration_secs(&self) -> Option<f64> {
        self.clip.as_ref().map(Clip::duration_secs)
    }

    fn frames_loaded(&self) -> usize {
        self.clip.as_ref().map_or(0, Clip::frames)
    }
}

impl MediaElement for MemoryElement {
    fn id(&self) -> ElementId {
        self.id
    }

    fn src(&self) -> Option<&str> {
        self.src.as_deref()
    }

    fn set_src(&mut self, src: &str) {
        self.src = Some(src.to_string());
        self.cursor = 0;
        self.clip = self
            .library
            .get(src)
            .map(|clip| clip.resampled(self.output_rate));

        match &self.clip {
            Some(clip) => {
                info!(src, duration = clip.duration_secs(), "Media loaded");
                self.events.push(MediaEvent::MetadataReady {
                    duration_secs: clip.duration_secs(),
                });
            }
            None => warn!(src, "No clip registered for source"),
        }
    }

    fn current_time(&self) -> f64 {
        self.cursor as f64 / f64::from(self.output_rate)
    }

    fn set_current_time(&mut self, seconds: f64) {
        let frame = (seconds.max(0.0) * f64::from(self.output_rate)) as usize;
        self.cursor = frame.min(self.frames_loaded());
    }

    fn play(&mut self) {
        self.paused = false;
    }

    fn pause(&mut self) {
        self.paused = true;
    }

    fn is_paused(&self) -> bool {
        self.paused
    }

    fn volume(&self) -> f32 {
        self.volume
    }

    fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
    }

    fn muted(&self) -> bool {
        self.muted
    }

    fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    fn read_frames(&mut self, out: &mut [f32]) -> usize {
        out.fill(0.0);
        let Some(clip) = self.clip.as_ref().filter(|_| !self.paused) else {
            return 0;
        };

        let clip_channels = clip.channels as usize;
        let available = clip.frames().saturating_sub(self.cursor);
        let frames = (out.len() / self.output_channels).min(available);
        for (i, frame) in out
            .chunks_mut(self.output_channels)
            .take(frames)
            .enumerate()
        {
            let base = (self.cursor + i) * clip_channels;
            for (ch, sample) in frame.iter_mut().enumerate() {
                *sample = clip.samples[base + ch % clip_channels];
            }
        }
        self.cursor += frames;

        if self.cursor >= clip.frames() {
            debug!("Media ended");
            self.paused = true;
            self.events.push(MediaEvent::Ended);
        }
        frames * self.output_channels
    }

    fn take_events(&mut self) -> Vec<MediaEvent> {
        std::mem::take(&mut self.events)
    }
}
