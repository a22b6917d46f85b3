//! Command implementations for the PXE CLI.

pub mod pack;
pub mod packages;
pub mod publication;
