pub mod common;
pub mod config;
pub mod consensus;
pub mod network;
pub mod weights;
