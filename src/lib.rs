//! crt-overlay: real-time CRT shader overlay for live screen content
//!
//! Captures a display, runs every frame through a GPU shader simulating
//! scanlines, phosphor mask, bloom and gamma, and presents the result in a
//! transparent click-through window on top of the same display.

pub mod capture;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod frame;
pub mod shader;
pub mod surface;

#[cfg(test)]
mod testing;

pub use control::OverlayContext;
pub use error::{CrtError, Result};
