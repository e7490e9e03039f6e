//! Shared types for the Skylink companion computer.
//!
//! Configuration records with documented defaults, the data models passed
//! between the network and media subsystems, and the bitrate profile table.
//! This crate performs no I/O.

pub mod config;
pub mod models;
pub mod profiles;
