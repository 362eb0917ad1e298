//! Virtual-memory introspection, signature scanning, and AArch64
//! PC-relative decoding for a Mach task.
//!
//! This crate is the building block for binary-patching, signature-based
//! hook installation, and runtime introspection tooling: it does not
//! itself rebind symbols, patch vtables, or remap libraries. Callers
//! compose [`Engine::read_memory`]/[`Engine::write_memory`]/
//! [`Engine::protect`] with [`PatternScanner`] and the [`signatures`]
//! shortcuts to build those higher-level flows.
#![allow(clippy::useless_conversion)]

#[cfg(not(target_os = "macos"))]
compile_error!("machprobe only supports macOS (Mach/XNU) task introspection");

#[cfg(target_pointer_width = "32")]
compile_error!("machprobe's Mach-O handling assumes a 64-bit architecture");

pub mod decoder;
pub mod error;
pub mod icache;
pub mod locator;
pub mod mach;
pub mod protection;
pub mod result_set;
pub mod scanner;
pub mod signatures;

mod engine;

pub use engine::{Engine, RegionInfo};
pub use error::{EngineError, ErrorKind};
pub use locator::{ImageDescriptor, Locator, SegmentRange};
pub use protection::Protection;
pub use result_set::{RegionHit, ResultSet};
pub use scanner::{Pattern, PatternScanner};
