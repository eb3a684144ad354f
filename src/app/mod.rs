//! Binary entry layer: argument parsing and process startup

pub mod cli;
pub mod startup;
