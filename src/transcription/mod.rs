//! # Transcription Module
//!
//! Gates and per-call transcript state around the external speech-to-text
//! service. Segments are validated before dispatch, results are validated
//! after, and accepted chunks accumulate into the call's transcript.

pub mod filter;
pub mod session;
