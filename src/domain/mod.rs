//! Domain layer - Core object model and port definitions
//!
//! This module defines the derived objects the reconciler manages and the
//! core traits (ports) that adapters implement, following hexagonal
//! architecture principles.

pub mod image;
pub mod objects;
pub mod ports;

pub use image::*;
pub use objects::*;
pub use ports::*;
