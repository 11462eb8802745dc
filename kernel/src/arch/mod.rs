//! Architecture-specific bring-up and primitives.
//!
//! The kernel targets x86_64 exclusively; there is no multi-architecture
//! abstraction layer to maintain.

pub mod barriers;
pub mod x86_64;

pub use self::x86_64::*;
