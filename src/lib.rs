#![warn(clippy::all)]

pub mod chatnode;
pub mod client;
pub mod coordinator;
pub mod datanode;
pub mod encoding;
pub mod error;
pub mod message;
pub mod rpc;

pub use chatnode::ChatNode;
pub use client::Client;
pub use coordinator::Coordinator;
pub use datanode::DataNode;
pub use error::{Error, Result};
