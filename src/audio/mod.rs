//! # Audio Module
//!
//! Everything between raw audio fragments and the speakers, plus the
//! spectrum data the UI draws.
//!
//! ## Key Components:
//! - **fragment**: wire payload decoding (base64 WAV or raw PCM16) and PCM encoding
//! - **reorder**: releases out-of-order fragments strictly in index order
//! - **graph**: the audio graph abstraction playback renders through
//! - **software**: an in-process graph implementation with optional WAV recording
//! - **worklet**: the realtime rendering unit used by delegated playback
//! - **analyser** / **bands**: spectrum analysis and 24-band reduction
//! - **visualization**: frame-coalesced publication of band snapshots
//!
//! ## Audio Format:
//! - **Playback**: mono `f32` at the graph sample rate (48 kHz by default)
//! - **Microphone out**: 16-bit little-endian PCM, mono

pub mod analyser;
pub mod bands;
pub mod fragment;
pub mod graph;
pub mod reorder;
pub mod software;
pub mod visualization;
pub mod worklet;
