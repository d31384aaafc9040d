// SPDX-License-Identifier: MIT OR Apache-2.0

//! Thin wrappers around external crates for all cryptographic primitives this crate needs.
//!
//! Nothing in here implements a primitive itself: signing and verification are done by
//! `ed25519-dalek` (see [`crate::identity`]), key wrapping by `hpke-rs`, key agreement keys by
//! `x25519-dalek` and key derivation by `hkdf`.
pub mod hkdf;
pub mod hpke;
mod rng;
mod secret;
pub mod sha2;
pub mod x25519;

pub use rng::{Rng, RngError};
pub use secret::Secret;
