mod dispatcher;
mod message;
mod transport;

pub use dispatcher::{MessageHandler, OrderedDispatcher};
pub use message::SignalingMessage;
pub use transport::{SignalingTransport, TransportEvent, WebSocketTransport};
