//! NES Core - NES Emulation Integration Layer.
//!
//! This crate provides the high-level NES emulation API, integrating the CPU,
//! PPU, and mapper components into a complete emulation core.
//!
//! # Architecture
//!
//! The core crate connects all NES components through a central bus:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Machine                               │
//! │  ┌─────────────────────────────────────────────────────┐   │
//! │  │                      NesBus                          │   │
//! │  │  ┌─────┐  ┌─────┐  ┌────────┐  ┌────────┐           │   │
//! │  │  │ RAM │  │ PPU │  │ Mapper │  │ Input  │           │   │
//! │  │  │ 2KB │  │     │  │        │  │        │           │   │
//! │  │  └─────┘  └─────┘  └────────┘  └────────┘           │   │
//! │  └─────────────────────────────────────────────────────┘   │
//! │                          ▲                                  │
//! │                          │                                  │
//! │                     ┌────┴────┐                             │
//! │                     │   CPU   │                             │
//! │                     │  6502   │                             │
//! │                     └─────────┘                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use nescore::{Machine, ControllerState};
//!
//! // Load a ROM file
//! let rom_data = std::fs::read("game.nes").expect("Failed to read ROM");
//! let mut machine = Machine::new(&rom_data).expect("Failed to create machine");
//!
//! // Power on and run
//! machine.power_on();
//!
//! loop {
//!     // Set controller input
//!     let mut input = ControllerState::default();
//!     input.buttons = ControllerState::A | ControllerState::START;
//!     machine.set_controller1(input);
//!
//!     // Run one frame
//!     machine.step_frame().expect("machine faulted");
//!
//!     // Get framebuffer for display (256x240 RGBA)
//!     let _framebuffer = machine.framebuffer();
//! }
//! ```
//!
//! # Features
//!
//! - `std` (default): Enable standard library support
//! - `serde`: Enable serialization for save states

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(not(feature = "std"))]
extern crate alloc;

pub mod bus;
pub mod input;
mod machine;

// Re-export main types
pub use bus::{BusFault, ControllerState, NesBus};
pub use input::{Button, Controller};
pub use machine::{Machine, MachineError, timing};

// Re-export commonly used types from dependencies
pub use nescore_cpu::Cpu;
pub use nescore_mappers::{Mapper, Mirroring, Rom, RomError, RomHeader, create_mapper};
pub use nescore_ppu::{NES_PALETTE, Ppu, palette_lookup};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// NES screen dimensions.
pub mod screen {
    /// Screen width in pixels.
    pub const WIDTH: u32 = 256;
    /// Screen height in pixels.
    pub const HEIGHT: u32 = 240;
    /// Total pixels per frame.
    pub const PIXELS: u32 = WIDTH * HEIGHT;
    /// Bytes per frame (RGBA).
    pub const FRAMEBUFFER_SIZE: usize = (PIXELS * 4) as usize;
}
