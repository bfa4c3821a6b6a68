//! Design-Time Wiring Model
//!
//! Describes which actors exist, which typed ports they expose, and how
//! those ports are linked — before any of them runs. The model is split
//! in two layers:
//!
//! - **Catalog**: the configuration-time registry of actor kinds, their
//!   port declarations, and the shared component contracts (net, rpc,
//!   event, pipe) those ports reference. Immutable once registered.
//! - **Graph instance**: a concrete wiring built from catalog entries —
//!   actor instances, port instances, and realized links, stored as
//!   index-addressed arenas. Mutable only through [`GraphBuilder`];
//!   read-only once built.
//!
//! Connection legality is a diagnostic, not an error: a port whose link
//! count violates its component's multiplicity is flagged invalid and
//! reported to whoever built the graph, but construction proceeds.
//!
//! This crate is pure data and pure validation. The runtime crate
//! consumes a finished [`GraphInstance`] to resolve message routing.

pub mod catalog;
pub mod message;
pub mod multiplicity;
pub mod wiring;

pub use catalog::{
    ActorKind, ActorKindId, Catalog, ComponentKind, ComponentKindId, PortDecl, PortDeclId,
    PortDirection,
};
pub use message::MessageKey;
pub use multiplicity::Multiplicity;
pub use wiring::{
    ActorId, ActorNode, DiagnosticKind, GraphBuilder, GraphInstance, LinkId, LinkNode, PortId,
    PortNode, WiringDiagnostic, WiringError,
};

/// The standard component contracts every catalog starts from.
pub mod components {
    use uuid::Uuid;

    use crate::catalog::ComponentKindId;

    /// Point-to-point and fan-out delivery across links.
    pub const NET: ComponentKindId =
        ComponentKindId(Uuid::from_u128(0x1b938da3_daf8_433c_acd6_1da100a73887));

    /// Correlated request/response. Output ports must have exactly one link.
    pub const RPC: ComponentKindId =
        ComponentKindId(Uuid::from_u128(0xc7a05dee_b8a6_427f_b093_3e977c61b66d));

    /// Dynamic pub/sub. Event ports carry no static links at all.
    pub const EVENT: ComponentKindId =
        ComponentKindId(Uuid::from_u128(0x3381977f_4318_4c84_8545_dacea1dcde7e));

    /// Ordered interception chain with explicit continuation.
    pub const PIPE: ComponentKindId =
        ComponentKindId(Uuid::from_u128(0x03137b05_eb1c_4cab_90c3_2835663696f7));
}
