//! Data model types

pub mod events;
pub mod feature;
pub mod filter;
