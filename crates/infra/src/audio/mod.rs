//! Platform-side audio implementations
//!
//! - `software`: an `AudioContext` that renders the effects graph in software
//! - `element`: an in-memory PCM media element
//! - `stream`: the playback mix and the CPAL output stream driving it
//! - `cpal_backend`: output device discovery through CPAL, which abstracts
//!   WASAPI on Windows, ALSA/PulseAudio on Linux and CoreAudio on macOS

pub mod cpal_backend;
pub mod element;
pub mod software;
pub mod stream;

pub use cpal_backend::*;
pub use element::*;
pub use software::*;
pub use stream::*;
