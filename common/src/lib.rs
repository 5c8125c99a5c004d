//! SwapRail Common Types
//!
//! This crate contains shared types used across the SwapRail services,
//! including currencies and their network pairs, quotes, swaps, identifiers
//! and the error taxonomy surfaced to callers.

pub mod catalog;
pub mod currency;
pub mod error;
pub mod identifiers;
pub mod quote;
pub mod swap;
pub mod time;

pub use catalog::*;
pub use currency::*;
pub use error::*;
pub use identifiers::*;
pub use quote::*;
pub use swap::*;
pub use time::*;
