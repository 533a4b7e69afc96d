//! Routing decision table for the symmetric correlation engine.
//!
//! The same channel code runs on both endpoints; this table is the single
//! place that decides, for one invocation, whether it executes in-process,
//! crosses the wire as a CALL, or answers a wire CALL with a RETURN.

use super::packet::{Direction, Source};

/// What the channel must do with one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteAction {
    /// Run the local handler; the result stays in-process.
    ExecuteLocal,
    /// Replace local execution with a network round-trip; the caller gets
    /// whatever comes back across the wire.
    ForwardRemote,
    /// The invocation arrived from the wire; after local execution its
    /// result is encoded into a RETURN packet for the peer instead of being
    /// handed to the in-process caller.
    ReflectReturn,
}

/// Pure routing decision over `(direction, source, is_server)`.
///
/// - `Local` source never touches the wire, whatever the role.
/// - `Return` direction always executes locally: a RETURN's only job is to
///   complete the pending entry it is addressed to.
/// - A CALL whose source matches this endpoint's own role is an outbound
///   request; one sourced from the opposite role arrived from the wire and
///   must be answered.
pub fn route(direction: Direction, source: Source, is_server: bool) -> RouteAction {
    // ---
    match (direction, source) {
        (_, Source::Local) => RouteAction::ExecuteLocal,
        (Direction::Return, _) => RouteAction::ExecuteLocal,
        (Direction::Call, Source::Client) if !is_server => RouteAction::ForwardRemote,
        (Direction::Call, Source::Server) if is_server => RouteAction::ForwardRemote,
        (Direction::Call, _) => RouteAction::ReflectReturn,
    }
}
