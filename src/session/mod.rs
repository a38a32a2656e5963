pub mod entry;
pub mod peer;
pub mod registry;
pub mod room;
pub mod rtc_api;
pub mod stream;

pub use entry::{ConnectionSnapshot, NegotiationPhase, NegotiationRole, Transition};
pub use peer::{PeerSession, RtcSessionFactory, SessionEvent, SessionEventSender, SessionFactory};
pub use registry::ConnectionRegistry;
pub use room::Room;
pub use stream::{InboundStream, MediaTrack, RtpTrack};
