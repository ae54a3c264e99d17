//! aud-quota
//!
//! Membership quota checker.
//!
//! Given the store's current counts and an ordered list of candidate joins,
//! decide which leading subset may be admitted without breaching the global,
//! per-owner, per-owner-per-buyer, or distinct-owner ceilings.
//!
//! Deterministic, pure logic. No IO, no time.

mod engine;
mod types;

pub use engine::admit;
pub use types::*;
