//! ESP32 firmware-specific modules for airmux
//!
//! This crate contains the code that cannot compile on desktop targets: board
//! wiring, the Wi-Fi uplink built on `esp-radio` and `embassy-net`, and the
//! chip reset used for restart escalation.

#![no_std]

extern crate alloc;

pub mod board;
pub mod network;
pub mod reset;
