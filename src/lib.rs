//! DexPulse Backend Library
//!
//! Exposes the realtime distribution layer and HTTP surface for the
//! server binary and integration tests.

pub mod api;
pub mod realtime;
