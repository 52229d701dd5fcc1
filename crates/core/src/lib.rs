//! Encore core: the client-side audio effects chain
//!
//! The domain layer is platform-agnostic. Concrete audio contexts and media
//! elements live in the `encore-infra` crate.

pub mod domain;

pub use domain::*;
