pub mod cli;
pub mod config;
pub mod execution;
pub mod remote;
pub mod shared;
