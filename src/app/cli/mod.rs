//! CLI argument parsing

pub mod args;

#[cfg(test)]
mod tests;

pub use args::{Args, Command};
