//! Hardware-independent core library for airmux
//!
//! This crate contains all platform-agnostic logic for the airmux acquisition
//! agent: multiplexer channel discovery, SCD4x self-calibration tuning,
//! multi-pass sampling, trimmed averaging, failure accounting, cross-channel
//! deltas, the restart escalation policy and the upload record.
//!
//! It is `#![no_std]` with `extern crate alloc` so it compiles on both
//! embedded targets (ESP32) and desktop hosts (for the simulator and tests).

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod calibration;
pub mod channel;
pub mod config;
pub mod controller;
pub mod failures;
pub mod mux;
pub mod record;
pub mod sampling;
pub mod scanner;
pub mod sensors;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod stats;
pub mod upload;
