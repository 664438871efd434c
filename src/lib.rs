// Library interface for the SNICKER toolkit
// Exposes public modules for the binary and for testing

extern crate hex;

pub mod blockchain_data;
pub mod cli;
pub mod config;
pub mod network;
pub mod relay;
pub mod snicker;
pub mod wallet;
