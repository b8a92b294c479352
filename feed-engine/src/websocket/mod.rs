//! WebSocket connection management

mod client;
mod future;

pub use client::{
    Client, ClientConfig, ConnectedHandler, ConnectionState, ErrorHandler, Handlers,
    MessageHandler, PingHandler,
};
pub use future::MessageFuture;
