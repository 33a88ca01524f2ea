//! # Audio Processing Module
//!
//! Inbound segmentation and outbound playback for telephony audio.
//!
//! ## Key Components:
//! - **Segmenter**: per-call PCM accumulator with silence endpointing
//! - **Codec**: resampling, PCM byte conversion, G.711 mu-law
//! - **Call**: per-call session state and the registry that owns it
//! - **Playback**: paced real-time frame streaming to the carrier
//!
//! ## Audio Format:
//! Inbound media is 16-bit signed little-endian mono PCM at whatever rate
//! the carrier sends (the first, odd-rate frame of each call is discarded).
//! Outbound audio is always mono at the configured carrier rate (8kHz).

// The WebSocket handler is in src/websocket.rs at the root level
pub mod call;
pub mod codec;
pub mod playback;
pub mod segmenter;
