//! Encore infrastructure: software audio graph, in-memory media and
//! CPAL playback

pub mod audio;
