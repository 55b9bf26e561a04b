//! Core types, config, errors, and conversation state for Cartwheel.

pub mod config;
pub mod error;
pub mod product_code;
pub mod protocol;
pub mod state;
pub mod stores;
pub mod types;
