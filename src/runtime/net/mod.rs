pub mod codec;
pub mod connection;
pub mod message;
pub mod networker;

pub use connection::Connection;
pub use message::{Message, MessageType};
pub use networker::{Dispatcher, Networker};
