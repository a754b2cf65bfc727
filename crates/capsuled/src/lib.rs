//! Capsule daemon library - exposes modules for testing.

pub mod activation;
pub mod block;
pub mod checkpoint;
pub mod config;
pub mod device;
pub mod mount_db;
pub mod recovery;
pub mod rpc_server;
pub mod session;
pub mod staging;
pub mod state;
pub mod verify;
