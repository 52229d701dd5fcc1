//! Digital Signal Processing primitives for the effects chain
//!
//! This module provides the building blocks of the software audio graph:
//! - Biquad filters (low shelf, peaking, high shelf) for the equalizer
//! - Soft-knee dynamics compressor used for loudness normalization
//! - Automated gain parameter with click-free ramps
//!
//! Processors work in-place on interleaved f32 buffers normalized to
//! [-1.0, 1.0] and do not allocate once their per-channel state is sized.

use crate::domain::audio::{FilterInfo, FilterKind};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Timing of one render block
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockClock {
    /// Context time of the first frame, in seconds
    pub start_time: f64,
    pub sample_rate: u32,
    pub channels: usize,
}

impl BlockClock {
    pub fn new(start_time: f64, sample_rate: u32, channels: usize) -> Self {
        Self {
            start_time,
            sample_rate,
            channels: channels.max(1),
        }
    }

    /// Context time of the given frame within the block
    #[inline]
    pub fn frame_time(&self, frame: usize) -> f64 {
        self.start_time + frame as f64 / f64::from(self.sample_rate)
    }
}

/// Core trait for graph node processors
pub trait Effect: Send {
    /// Process an interleaved block in-place
    fn process(&mut self, buffer: &mut [f32], clock: BlockClock);

    /// Clear internal state (filter memory, envelopes)
    fn reset(&mut self);

    /// Effect name for debugging/display
    fn name(&self) -> &str;
}

/// Parameter constraints for DSP effects
pub mod params {
    /// Equalizer band gain range
    pub const EQ_GAIN_MIN: f32 = -12.0;
    pub const EQ_GAIN_MAX: f32 = 12.0;

    /// Floor used when converting silence to decibels
    pub const DB_FLOOR: f32 = -100.0;

    /// Compressor ranges (mirroring the usual dynamics-compressor node limits)
    pub const THRESHOLD_MIN: f32 = -100.0;
    pub const KNEE_MAX: f32 = 40.0;
    pub const RATIO_MIN: f32 = 1.0;
    pub const RATIO_MAX: f32 = 20.0;
    pub const ATTACK_MAX: f32 = 1.0;
    pub const RELEASE_MAX: f32 = 1.0;
    pub const MAKEUP_MAX: f32 = 24.0;
}

/// Convert linear amplitude to dB
#[inline]
pub fn amplitude_to_db(level: f32) -> f32 {
    if level <= 1e-5 {
        params::DB_FLOOR
    } else {
        20.0 * level.log10()
    }
}

/// Convert dB to linear amplitude
#[inline]
pub fn db_to_amplitude(db: f32) -> f32 {
    10.0_f32.powf(db / 20.0)
}

// ============================================================================
// BIQUAD FILTER
// ============================================================================

/// Biquad filter coefficients, normalized so that a0 == 1
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BiquadCoeffs {
    pub b0: f32,
    pub b1: f32,
    pub b2: f32,
    pub a1: f32,
    pub a2: f32,
}

impl Default for BiquadCoeffs {
    fn default() -> Self {
        // Unity gain (no filtering)
        Self {
            b0: 1.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
        }
    }
}

/// Intermediate terms shared by the cookbook formulas
struct Cookbook {
    a: f32,
    cos_w0: f32,
    alpha: f32,
}

impl Cookbook {
    fn new(sample_rate: f32, freq: f32, gain_db: f32, q: f32) -> Self {
        let gain_db = gain_db.clamp(params::EQ_GAIN_MIN, params::EQ_GAIN_MAX);
        // Keep the corner strictly below Nyquist so the filter stays stable
        let freq = freq.clamp(1.0, sample_rate * 0.49);
        let w0 = std::f32::consts::TAU * freq / sample_rate;
        Self {
            a: 10.0_f32.powf(gain_db / 40.0),
            cos_w0: w0.cos(),
            alpha: w0.sin() / (2.0 * q.max(0.01)),
        }
    }

    fn shelf_sqrt_term(&self) -> f32 {
        2.0 * self.a.sqrt() * self.alpha
    }
}

impl BiquadCoeffs {
    fn normalized(b: [f32; 3], a: [f32; 3]) -> Self {
        let a0 = a[0];
        Self {
            b0: b[0] / a0,
            b1: b[1] / a0,
            b2: b[2] / a0,
            a1: a[1] / a0,
            a2: a[2] / a0,
        }
    }

    /// Low shelf: boosts or cuts everything below `freq`
    #[must_use]
    pub fn low_shelf(sample_rate: f32, freq: f32, gain_db: f32, q: f32) -> Self {
        let terms = Cookbook::new(sample_rate, freq, gain_db, q);
        let (a, cos_w0, k) = (terms.a, terms.cos_w0, terms.shelf_sqrt_term());
        let (ap1, am1) = (a + 1.0, a - 1.0);

        Self::normalized(
            [
                a * (ap1 - am1 * cos_w0 + k),
                2.0 * a * (am1 - ap1 * cos_w0),
                a * (ap1 - am1 * cos_w0 - k),
            ],
            [
                ap1 + am1 * cos_w0 + k,
                -2.0 * (am1 + ap1 * cos_w0),
                ap1 + am1 * cos_w0 - k,
            ],
        )
    }

    /// High shelf: boosts or cuts everything above `freq`
    #[must_use]
    pub fn high_shelf(sample_rate: f32, freq: f32, gain_db: f32, q: f32) -> Self {
        let terms = Cookbook::new(sample_rate, freq, gain_db, q);
        let (a, cos_w0, k) = (terms.a, terms.cos_w0, terms.shelf_sqrt_term());
        let (ap1, am1) = (a + 1.0, a - 1.0);

        Self::normalized(
            [
                a * (ap1 + am1 * cos_w0 + k),
                -2.0 * a * (am1 + ap1 * cos_w0),
                a * (ap1 + am1 * cos_w0 - k),
            ],
            [
                ap1 - am1 * cos_w0 + k,
                2.0 * (am1 - ap1 * cos_w0),
                ap1 - am1 * cos_w0 - k,
            ],
        )
    }

    /// Peaking: boosts or cuts a band around `freq`, width set by `q`
    #[must_use]
    pub fn peaking(sample_rate: f32, freq: f32, gain_db: f32, q: f32) -> Self {
        let Cookbook { a, cos_w0, alpha } = Cookbook::new(sample_rate, freq, gain_db, q);

        Self::normalized(
            [1.0 + alpha * a, -2.0 * cos_w0, 1.0 - alpha * a],
            [1.0 + alpha / a, -2.0 * cos_w0, 1.0 - alpha / a],
        )
    }
}

/// Stateful biquad filter using Direct Form I
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BiquadFilter {
    coeffs: BiquadCoeffs,
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

impl BiquadFilter {
    pub fn new(coeffs: BiquadCoeffs) -> Self {
        Self {
            coeffs,
            ..Self::default()
        }
    }

    /// Swap coefficients without clearing the delay line
    pub fn set_coeffs(&mut self, coeffs: BiquadCoeffs) {
        self.coeffs = coeffs;
    }

    #[inline]
    pub fn process_sample(&mut self, x: f32) -> f32 {
        let c = &self.coeffs;
        let y = c.b0 * x + c.b1 * self.x1 + c.b2 * self.x2 - c.a1 * self.y1 - c.a2 * self.y2;

        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        self.y1 = y;

        y
    }

    /// Process a mono buffer
    pub fn process(&mut self, buffer: &mut [f32]) {
        for sample in buffer.iter_mut() {
            *sample = self.process_sample(*sample);
        }
    }

    pub fn reset(&mut self) {
        self.x1 = 0.0;
        self.x2 = 0.0;
        self.y1 = 0.0;
        self.y2 = 0.0;
    }
}

/// One equalizer band: a biquad per channel over interleaved audio
#[derive(Debug, Clone)]
pub struct FilterStage {
    kind: FilterKind,
    frequency: f32,
    q: f32,
    gain_db: f32,
    sample_rate: u32,
    coeffs: BiquadCoeffs,
    channels: Vec<BiquadFilter>,
}

impl FilterStage {
    pub fn new(info: FilterInfo, sample_rate: u32) -> Self {
        let mut stage = Self {
            kind: info.kind,
            frequency: info.frequency,
            q: info.q,
            gain_db: info.gain_db.clamp(params::EQ_GAIN_MIN, params::EQ_GAIN_MAX),
            sample_rate,
            coeffs: BiquadCoeffs::default(),
            channels: Vec::new(),
        };
        stage.update_coefficients();
        stage
    }

    /// Change the band gain in place
    pub fn set_gain(&mut self, gain_db: f32) {
        self.gain_db = gain_db.clamp(params::EQ_GAIN_MIN, params::EQ_GAIN_MAX);
        self.update_coefficients();
    }

    pub fn info(&self) -> FilterInfo {
        FilterInfo {
            kind: self.kind,
            frequency: self.frequency,
            q: self.q,
            gain_db: self.gain_db,
        }
    }

    fn update_coefficients(&mut self) {
        let sr = self.sample_rate as f32;
        self.coeffs = match self.kind {
            FilterKind::LowShelf => BiquadCoeffs::low_shelf(sr, self.frequency, self.gain_db, self.q),
            FilterKind::Peaking => BiquadCoeffs::peaking(sr, self.frequency, self.gain_db, self.q),
            FilterKind::HighShelf => {
                BiquadCoeffs::high_shelf(sr, self.frequency, self.gain_db, self.q)
            }
        };
        for filter in &mut self.channels {
            filter.set_coeffs(self.coeffs);
        }

        trace!(
            "{} band @{:.0}Hz set to {:.1}dB",
            self.kind,
            self.frequency,
            self.gain_db
        );
    }
}

impl Effect for FilterStage {
    fn process(&mut self, buffer: &mut [f32], clock: BlockClock) {
        if self.channels.len() != clock.channels {
            self.channels = vec![BiquadFilter::new(self.coeffs); clock.channels];
        }
        for frame in buffer.chunks_mut(clock.channels) {
            for (sample, filter) in frame.iter_mut().zip(self.channels.iter_mut()) {
                *sample = filter.process_sample(*sample);
            }
        }
    }

    fn reset(&mut self) {
        for filter in &mut self.channels {
            filter.reset();
        }
    }

    fn name(&self) -> &str {
        "Filter"
    }
}

// ============================================================================
// DYNAMICS COMPRESSOR
// ============================================================================

/// Compressor parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompressorParams {
    pub threshold_db: f32,
    pub knee_db: f32,
    pub ratio: f32,
    pub attack_sec: f32,
    pub release_sec: f32,
    pub makeup_gain_db: f32,
}

impl CompressorParams {
    /// Fixed heuristic used for loudness normalization
    pub const fn normalization() -> Self {
        Self {
            threshold_db: -24.0,
            knee_db: 30.0,
            ratio: 12.0,
            attack_sec: 0.003,
            release_sec: 0.25,
            makeup_gain_db: 0.0,
        }
    }

    fn clamped(self) -> Self {
        Self {
            threshold_db: self.threshold_db.clamp(params::THRESHOLD_MIN, 0.0),
            knee_db: self.knee_db.clamp(0.0, params::KNEE_MAX),
            ratio: self.ratio.clamp(params::RATIO_MIN, params::RATIO_MAX),
            attack_sec: self.attack_sec.clamp(0.0, params::ATTACK_MAX),
            release_sec: self.release_sec.clamp(0.0, params::RELEASE_MAX),
            makeup_gain_db: self.makeup_gain_db.clamp(0.0, params::MAKEUP_MAX),
        }
    }
}

impl Default for CompressorParams {
    fn default() -> Self {
        Self::normalization()
    }
}

/// Feed-forward compressor with a soft knee
///
/// A peak envelope follower (separate attack and release) drives a
/// soft-knee gain computer; the resulting reduction is applied per channel.
#[derive(Debug, Clone)]
pub struct Compressor {
    params: CompressorParams,
    sample_rate: u32,
    attack_coeff: f32,
    release_coeff: f32,
    envelopes: Vec<f32>,
}

impl Compressor {
    pub fn new(params: CompressorParams, sample_rate: u32) -> Self {
        let mut comp = Self {
            params: params.clamped(),
            sample_rate,
            attack_coeff: 0.0,
            release_coeff: 0.0,
            envelopes: Vec::new(),
        };
        comp.update_coefficients();
        comp
    }

    pub fn params(&self) -> CompressorParams {
        self.params
    }

    pub fn set_params(&mut self, params: CompressorParams) {
        self.params = params.clamped();
        self.update_coefficients();
    }

    fn update_coefficients(&mut self) {
        let sr = self.sample_rate as f32;
        let coeff = |time: f32| {
            if time <= 0.0 {
                0.0
            } else {
                (-1.0 / (time * sr)).exp()
            }
        };
        self.attack_coeff = coeff(self.params.attack_sec);
        self.release_coeff = coeff(self.params.release_sec);
    }

    /// Gain change in dB (<= 0) for an input level in dB
    #[inline]
    pub fn gain_reduction_db(&self, level_db: f32) -> f32 {
        let CompressorParams {
            threshold_db,
            knee_db,
            ratio,
            ..
        } = self.params;
        let over = level_db - threshold_db;
        let slope = 1.0 - 1.0 / ratio;

        if knee_db > 0.0 && 2.0 * over.abs() <= knee_db {
            let x = over + knee_db / 2.0;
            -slope * x * x / (2.0 * knee_db)
        } else if over > 0.0 {
            -slope * over
        } else {
            0.0
        }
    }

    #[inline]
    fn follow(&self, input: f32, envelope: f32) -> f32 {
        let level = input.abs();
        let coeff = if level > envelope {
            self.attack_coeff
        } else {
            self.release_coeff
        };
        coeff * envelope + (1.0 - coeff) * level
    }
}

impl Effect for Compressor {
    fn process(&mut self, buffer: &mut [f32], clock: BlockClock) {
        if self.envelopes.len() != clock.channels {
            self.envelopes = vec![0.0; clock.channels];
        }
        let makeup = db_to_amplitude(self.params.makeup_gain_db);

        for frame in buffer.chunks_mut(clock.channels) {
            for (ch, sample) in frame.iter_mut().enumerate() {
                let envelope = self.follow(*sample, self.envelopes[ch]);
                self.envelopes[ch] = envelope;
                let reduction = self.gain_reduction_db(amplitude_to_db(envelope));
                *sample *= db_to_amplitude(reduction) * makeup;
            }
        }
    }

    fn reset(&mut self) {
        self.envelopes.iter_mut().for_each(|e| *e = 0.0);
    }

    fn name(&self) -> &str {
        "Compressor"
    }
}

// ============================================================================
// AUTOMATED GAIN
// ============================================================================

/// One scheduled change of an automated parameter
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ParamEvent {
    /// Jump to `value` at `time`
    SetValue { value: f32, time: f64 },
    /// Approach `target` exponentially from `start` with the given time constant
    SetTarget {
        target: f32,
        start: f64,
        time_constant: f64,
    },
    /// Ramp linearly from the previous event to `value`, arriving at `end_time`
    LinearRamp { value: f32, end_time: f64 },
}

impl ParamEvent {
    /// Time the event is ordered by
    pub fn time(&self) -> f64 {
        match *self {
            ParamEvent::SetValue { time, .. } => time,
            ParamEvent::SetTarget { start, .. } => start,
            ParamEvent::LinearRamp { end_time, .. } => end_time,
        }
    }
}

/// Parameter with a timeline of automation events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomatedParam {
    initial: f32,
    events: Vec<ParamEvent>,
}

impl AutomatedParam {
    pub fn new(initial: f32) -> Self {
        Self {
            initial,
            events: Vec::new(),
        }
    }

    /// Insert an event, keeping the timeline ordered
    pub fn schedule(&mut self, event: ParamEvent) {
        let at = self
            .events
            .partition_point(|existing| existing.time() <= event.time());
        self.events.insert(at, event);
    }

    /// Drop every event at or after `time`
    pub fn cancel_scheduled_values(&mut self, time: f64) {
        self.events.retain(|event| event.time() < time);
    }

    /// Freeze the parameter at its value at `time`, discarding the timeline
    pub fn cancel_and_hold(&mut self, time: f64) -> f32 {
        let held = self.value_at(time);
        self.events.clear();
        self.events.push(ParamEvent::SetValue { value: held, time });
        held
    }

    pub fn events(&self) -> &[ParamEvent] {
        &self.events
    }

    /// Evaluate the parameter at `time`
    pub fn value_at(&self, time: f64) -> f32 {
        let mut value = self.initial;
        let mut anchor = 0.0_f64;
        let mut approach: Option<(f32, f64)> = None;

        for event in &self.events {
            match *event {
                ParamEvent::SetValue { value: v, time: at } => {
                    if at > time {
                        break;
                    }
                    value = v;
                    anchor = at;
                    approach = None;
                }
                ParamEvent::SetTarget {
                    target,
                    start,
                    time_constant,
                } => {
                    if start > time {
                        break;
                    }
                    value = settle(value, anchor, approach, start);
                    anchor = start;
                    approach = Some((target, time_constant));
                }
                ParamEvent::LinearRamp {
                    value: end,
                    end_time,
                } => {
                    if end_time > time {
                        let span = end_time - anchor;
                        let progress = ((time - anchor) / span).clamp(0.0, 1.0) as f32;
                        return value + (end - value) * progress;
                    }
                    value = end;
                    anchor = end_time;
                    approach = None;
                }
            }
        }

        settle(value, anchor, approach, time)
    }
}

fn settle(value: f32, anchor: f64, approach: Option<(f32, f64)>, at: f64) -> f32 {
    match approach {
        Some((target, time_constant)) if time_constant > 0.0 => {
            let decay = (-(at - anchor).max(0.0) / time_constant).exp() as f32;
            target + (value - target) * decay
        }
        Some((target, _)) => target,
        None => value,
    }
}

/// Gain node: multiplies every frame by the automated parameter
#[derive(Debug, Clone)]
pub struct GainStage {
    param: AutomatedParam,
}

impl GainStage {
    pub fn new(initial: f32) -> Self {
        Self {
            param: AutomatedParam::new(initial),
        }
    }

    pub fn param(&self) -> &AutomatedParam {
        &self.param
    }

    pub fn param_mut(&mut self) -> &mut AutomatedParam {
        &mut self.param
    }
}

impl Effect for GainStage {
    fn process(&mut self, buffer: &mut [f32], clock: BlockClock) {
        for (i, frame) in buffer.chunks_mut(clock.channels).enumerate() {
            let gain = self.param.value_at(clock.frame_time(i));
            for sample in frame.iter_mut() {
                *sample *= gain;
            }
        }
    }

    fn reset(&mut self) {}

    fn name(&self) -> &str {
        "Gain"
    }
}

// ============================================================================
// TESTS
// ============================================================================
