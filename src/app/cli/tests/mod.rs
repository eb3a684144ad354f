//! Tests for CLI argument parsing
