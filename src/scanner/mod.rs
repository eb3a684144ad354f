//! Credential scanning over repository history and trees
//!
//! [`AncestryScanner`] is the primitive every other component builds on:
//! it turns a commit range into exactly one persisted scan record. The
//! [`tree`] helpers sniff a whole snapshot and back the rescanner and the
//! head credential counter.

pub mod ancestry;
pub mod error;
pub mod tree;

#[cfg(test)]
mod tests;

pub use ancestry::{AncestryScanner, ScanOutcome, ScanUnit};
pub use error::{ScanError, ScanResult};
pub use tree::{sniff_blob, sniff_tree};
