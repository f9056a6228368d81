pub mod config;
pub mod ipc;
pub mod supervisor;
pub mod utils;
