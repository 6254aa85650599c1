//! RPC dispatch facade: method handlers answering requests on a channel.

mod backend;
mod registry;

pub use backend::RpcBackend;
pub use registry::{HandlerError, HandlerRegistry, HandlerReply, HandlerResult, MessageHandler};
