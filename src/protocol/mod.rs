//! Protocol module for encoding commands and decoding the catalog.

pub mod codec;

pub use codec::{decode, encode, Command};
