//! Common types used across gothook components
//!
//! - `memory` - Addresses, address ranges and page protection flags
//! - `image` - Loaded image identity, mapping segments and image records
//! - `hooks` - Rule identifiers, relocation kinds, patch records and refresh reports

pub mod hooks;
pub mod image;
pub mod memory;

pub use hooks::*;
pub use image::*;
pub use memory::*;
