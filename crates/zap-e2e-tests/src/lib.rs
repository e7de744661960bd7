//! End-to-end integration tests for the Zap session controller.
//!
//! These tests exercise the full stack against the in-process vault:
//! - First-run setup and returning-user unlock
//! - Countdown, drift correction and expiry
//! - Fail-closed locking when the vault disappears
//! - Reveal, auto-hide and purge races
//! - Clipboard export

#![cfg(test)]
