//! wshub core library: the channel relay, the reconnecting connector, and the
//! RPC facade a backend uses to answer requests on its channel.

pub mod config;
pub mod connector;
pub mod init;
pub mod protocol;
pub mod relay;
pub mod rpc;
