//! Tonestream Library
//!
//! Lock-free streaming of generated audio from a producer thread
//! to a realtime device callback.

pub mod alloc;
pub mod audio;
pub mod engine;
pub mod source;
