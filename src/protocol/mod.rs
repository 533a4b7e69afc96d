/// Wire packet shapes and the schema-driven binary codec.
pub mod packet;
/// Local-vs-remote routing decision table.
pub mod route;

pub use packet::{
    // ---
    Direction,
    HandshakeAck,
    HandshakeRequest,
    HandshakeResponse,
    Message,
    Metadata,
    Packet,
    Source,
    PROTOCOL_VERSION,
};
pub use route::{route, RouteAction};
