//! WebSocket gateway: the chat side of an order. Clients identify with a JWT,
//! receive prompts in their order channels and answer with commands.

pub mod connection;
pub mod dispatcher;

pub use dispatcher::Dispatcher;
