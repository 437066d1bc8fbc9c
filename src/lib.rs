#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
// Common patterns that make emulator code more readable
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::similar_names)]
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::if_not_else)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::verbose_bit_mask)]
// Nursery exemptions
#![allow(clippy::redundant_pub_crate)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::use_self)]
#![allow(clippy::cognitive_complexity)]

//! # vt100-core
//!
//! The core of a DEC VT100 terminal emulator: an Intel 8080 interpreter
//! running the terminal firmware against a dual-bus memory model that hosts
//! the VT100's peripheral chips — the DC011/DC012 timing and control chips,
//! the ER1400 non-volatile RAM, the keyboard scanner UART, the 8251 host
//! serial port — and a character-cell video processor that interprets the
//! VT100's self-linked display list.
//!
//! Rendering, key capture, ROM loading and persistence stay outside: the
//! host supplies a [`video::DrawingSurface`], a [`kbd::KeyboardHost`], ROM
//! bytes in the [`machine::MachineConfig`], and somewhere to keep the NVR
//! words. [`machine::Machine`] assembles and drives everything else.

pub mod bus;
pub mod chips;
pub mod cpu;
pub mod instructions;
pub mod kbd;
pub mod machine;
pub mod memory;
pub mod ports;
pub mod registers;
pub mod serial;
pub mod time;
pub mod video;

pub use bus::{Bus, BusError, BusKind};
pub use chips::{Chips, Nvr};
pub use cpu::{Cpu, IntrLine};
pub use kbd::{Keyboard, KeyboardHost, NullKeyboardHost};
pub use machine::{headless, Machine, MachineConfig, MachineError};
pub use memory::{Block, BlockType};
pub use registers::Registers;
pub use serial::{Serial, SerialConfig, SerialPeer};
pub use time::{Time, TimeConfig};
pub use video::{DrawingSurface, Font, NullSurface, Video, VideoConfig};
