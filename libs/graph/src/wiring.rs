//! Graph instances: actor, port, and link arenas plus the builder that
//! assembles them from catalog entries.
//!
//! Instances are addressed by plain indices rather than references, so a
//! teardown or rebuild is a wholesale arena swap and links can never
//! dangle: a link is stored once and referenced by exactly the two ports
//! it connects.

use std::fmt;

use tracing::warn;

use crate::catalog::{
    ActorKindId, Catalog, ComponentKindId, PortDeclId, PortDirection,
};
use crate::message::MessageKey;
use crate::multiplicity;

/// Handle to an actor instance in a graph. Index into the actor arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActorId(u32);

impl ActorId {
    /// Builds a handle from a raw index. Normally handles come from
    /// [`GraphBuilder::add_actor`]; the runtime uses this to address its
    /// built-in service actors past the end of the graph arena.
    pub fn from_index(index: usize) -> Self {
        Self(index as u32)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "actor-{}", self.0)
    }
}

/// Handle to a port instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortId(u32);

impl PortId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Handle to a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(u32);

impl LinkId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One actor instance.
#[derive(Debug, Clone)]
pub struct ActorNode {
    pub kind: ActorKindId,
    pub name: String,
    pub inputs: Vec<PortId>,
    pub outputs: Vec<PortId>,
}

/// One port instance. Holds its links and the validity flag computed at
/// build time from the multiplicity validator.
#[derive(Debug, Clone)]
pub struct PortNode {
    pub owner: ActorId,
    pub decl: PortDeclId,
    pub direction: PortDirection,
    pub component: ComponentKindId,
    pub message: MessageKey,
    pub links: Vec<LinkId>,
    pub valid: bool,
}

/// A realized connection between one output port and one input port.
#[derive(Debug, Clone)]
pub struct LinkNode {
    pub output: PortId,
    pub input: PortId,
    /// Marks links that would cross a process boundary. Representable
    /// only; this runtime never routes across one.
    pub remote: bool,
}

/// Wiring problems reported to the graph author. Never fatal to the
/// runtime; the authoring layer decides what to surface.
#[derive(Debug, thiserror::Error)]
pub enum WiringError {
    #[error("actor kind {id} is not in the catalog")]
    UnknownActorKind { id: ActorKindId },

    #[error("component kind {id:?} is not in the catalog")]
    UnknownComponent { id: ComponentKindId },

    #[error("a kind named '{name}' with this id is already registered")]
    DuplicateKind { name: String },

    #[error("{actor_kind} has no {direction:?} port for component '{component}' carrying {message}")]
    NoMatchingPort {
        actor_kind: String,
        direction: PortDirection,
        component: String,
        message: MessageKey,
    },

    #[error("{actor_kind} declares more than one {direction:?} port for component '{component}' carrying {message}")]
    AmbiguousPort {
        actor_kind: String,
        direction: PortDirection,
        component: String,
        message: MessageKey,
    },

    #[error("actor {actor} is not part of this graph")]
    UnknownActor { actor: ActorId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// The port's link count fails its component's multiplicity.
    MultiplicityViolation,
}

/// One build-time diagnostic, addressed to whoever assembled the graph.
#[derive(Debug, Clone)]
pub struct WiringDiagnostic {
    pub actor: ActorId,
    pub port: PortId,
    pub kind: DiagnosticKind,
    pub detail: String,
}

/// Assembles a [`GraphInstance`] from catalog entries.
///
/// All mutation of the wiring happens here, single-threaded, before the
/// runtime ever sees it.
pub struct GraphBuilder {
    catalog: Catalog,
    actors: Vec<ActorNode>,
    ports: Vec<PortNode>,
    links: Vec<LinkNode>,
}

impl GraphBuilder {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            catalog,
            actors: Vec::new(),
            ports: Vec::new(),
            links: Vec::new(),
        }
    }

    /// Adds an actor instance, materialising one port instance per
    /// declaration on its kind.
    pub fn add_actor(&mut self, kind: ActorKindId) -> Result<ActorId, WiringError> {
        let kind_entry = self
            .catalog
            .actor(kind)
            .ok_or(WiringError::UnknownActorKind { id: kind })?;

        let actor = ActorId(self.actors.len() as u32);
        let mut node = ActorNode {
            kind,
            name: kind_entry.name.clone(),
            inputs: Vec::with_capacity(kind_entry.inputs.len()),
            outputs: Vec::with_capacity(kind_entry.outputs.len()),
        };

        let decls: Vec<_> = kind_entry
            .inputs
            .iter()
            .chain(kind_entry.outputs.iter())
            .cloned()
            .collect();
        for decl in decls {
            let port = PortId(self.ports.len() as u32);
            self.ports.push(PortNode {
                owner: actor,
                decl: decl.id,
                direction: decl.direction,
                component: decl.component,
                message: decl.message,
                links: Vec::new(),
                valid: true,
            });
            match decl.direction {
                PortDirection::Input => node.inputs.push(port),
                PortDirection::Output => node.outputs.push(port),
            }
        }

        self.actors.push(node);
        Ok(actor)
    }

    /// Connects the unique matching output port on `output_actor` to the
    /// unique matching input port on `input_actor`.
    ///
    /// Port lookup is by (component, message type), which must be unique
    /// per direction per actor kind. Re-connecting an already linked pair
    /// is a no-op returning the existing link.
    pub fn connect(
        &mut self,
        output_actor: ActorId,
        input_actor: ActorId,
        component: ComponentKindId,
        message: MessageKey,
    ) -> Result<LinkId, WiringError> {
        let output_port =
            self.find_port(output_actor, PortDirection::Output, component, message)?;
        let input_port = self.find_port(input_actor, PortDirection::Input, component, message)?;

        if let Some(existing) = self.ports[output_port.index()]
            .links
            .iter()
            .copied()
            .find(|l| self.links[l.index()].input == input_port)
        {
            return Ok(existing);
        }

        let link = LinkId(self.links.len() as u32);
        self.links.push(LinkNode {
            output: output_port,
            input: input_port,
            remote: false,
        });
        self.ports[output_port.index()].links.push(link);
        self.ports[input_port.index()].links.push(link);
        Ok(link)
    }

    /// Removes the link between the matching port pair, from both sides.
    pub fn disconnect(
        &mut self,
        output_actor: ActorId,
        input_actor: ActorId,
        component: ComponentKindId,
        message: MessageKey,
    ) -> Result<(), WiringError> {
        let output_port =
            self.find_port(output_actor, PortDirection::Output, component, message)?;
        let input_port = self.find_port(input_actor, PortDirection::Input, component, message)?;

        let removed: Vec<LinkId> = self.ports[output_port.index()]
            .links
            .iter()
            .copied()
            .filter(|l| self.links[l.index()].input == input_port)
            .collect();
        self.ports[output_port.index()]
            .links
            .retain(|l| !removed.contains(l));
        self.ports[input_port.index()]
            .links
            .retain(|l| !removed.contains(l));
        Ok(())
    }

    pub fn connect_net<M: 'static>(
        &mut self,
        output_actor: ActorId,
        input_actor: ActorId,
    ) -> Result<LinkId, WiringError> {
        self.connect(output_actor, input_actor, crate::components::NET, MessageKey::of::<M>())
    }

    pub fn connect_rpc<M: 'static>(
        &mut self,
        output_actor: ActorId,
        input_actor: ActorId,
    ) -> Result<LinkId, WiringError> {
        self.connect(output_actor, input_actor, crate::components::RPC, MessageKey::of::<M>())
    }

    pub fn connect_pipe<M: 'static>(
        &mut self,
        output_actor: ActorId,
        input_actor: ActorId,
    ) -> Result<LinkId, WiringError> {
        self.connect(output_actor, input_actor, crate::components::PIPE, MessageKey::of::<M>())
    }

    /// Freezes the wiring, computing every port's validity flag.
    ///
    /// An invalid port does not abort the build; it is reported in the
    /// diagnostics and flagged on the port instance.
    pub fn build(mut self) -> GraphInstance {
        let mut diagnostics = Vec::new();

        for (index, port) in self.ports.iter_mut().enumerate() {
            let Some(component) = self.catalog.component(port.component) else {
                continue;
            };
            let expected = match port.direction {
                PortDirection::Input => component.input_multiplicity,
                PortDirection::Output => component.output_multiplicity,
            };
            let optional = self
                .catalog
                .actor(self.actors[port.owner.index()].kind)
                .and_then(|kind| {
                    kind.inputs
                        .iter()
                        .chain(kind.outputs.iter())
                        .find(|d| d.id == port.decl)
                })
                .is_some_and(|d| d.optional);

            port.valid = multiplicity::is_valid(expected, port.links.len())
                || (optional && port.links.is_empty());
            if !port.valid {
                let diagnostic = WiringDiagnostic {
                    actor: port.owner,
                    port: PortId(index as u32),
                    kind: DiagnosticKind::MultiplicityViolation,
                    detail: format!(
                        "port '{}' on {} has {} link(s), expected {:?}",
                        port.message,
                        self.actors[port.owner.index()].name,
                        port.links.len(),
                        expected,
                    ),
                };
                warn!(actor = %port.owner, detail = %diagnostic.detail, "wiring diagnostic");
                diagnostics.push(diagnostic);
            }
        }

        GraphInstance {
            catalog: self.catalog,
            actors: self.actors,
            ports: self.ports,
            links: self.links,
            diagnostics,
        }
    }

    fn find_port(
        &self,
        actor: ActorId,
        direction: PortDirection,
        component: ComponentKindId,
        message: MessageKey,
    ) -> Result<PortId, WiringError> {
        let node = self
            .actors
            .get(actor.index())
            .ok_or(WiringError::UnknownActor { actor })?;

        let port_set = match direction {
            PortDirection::Input => &node.inputs,
            PortDirection::Output => &node.outputs,
        };
        let mut matches = port_set.iter().copied().filter(|p| {
            let port = &self.ports[p.index()];
            port.component == component && port.message == message
        });

        let component_name = self
            .catalog
            .component(component)
            .map(|c| c.name.clone())
            .unwrap_or_else(|| format!("{component:?}"));

        match (matches.next(), matches.next()) {
            (Some(port), None) => Ok(port),
            (None, _) => Err(WiringError::NoMatchingPort {
                actor_kind: node.name.clone(),
                direction,
                component: component_name,
                message,
            }),
            (Some(_), Some(_)) => Err(WiringError::AmbiguousPort {
                actor_kind: node.name.clone(),
                direction,
                component: component_name,
                message,
            }),
        }
    }
}

/// A frozen wiring: read-only after [`GraphBuilder::build`], safe for
/// concurrent reads by the message bus.
#[derive(Debug)]
pub struct GraphInstance {
    catalog: Catalog,
    actors: Vec<ActorNode>,
    ports: Vec<PortNode>,
    links: Vec<LinkNode>,
    diagnostics: Vec<WiringDiagnostic>,
}

impl GraphInstance {
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn actor_count(&self) -> usize {
        self.actors.len()
    }

    pub fn actor(&self, id: ActorId) -> Option<&ActorNode> {
        self.actors.get(id.index())
    }

    pub fn actor_ids(&self) -> impl Iterator<Item = ActorId> + '_ {
        (0..self.actors.len() as u32).map(ActorId)
    }

    pub fn port(&self, id: PortId) -> Option<&PortNode> {
        self.ports.get(id.index())
    }

    pub fn link(&self, id: LinkId) -> Option<&LinkNode> {
        self.links.get(id.index())
    }

    /// Finds an actor's port by component and message type.
    pub fn find_port(
        &self,
        actor: ActorId,
        direction: PortDirection,
        component: ComponentKindId,
        message: MessageKey,
    ) -> Option<PortId> {
        let node = self.actors.get(actor.index())?;
        let port_set = match direction {
            PortDirection::Input => &node.inputs,
            PortDirection::Output => &node.outputs,
        };
        port_set.iter().copied().find(|p| {
            let port = &self.ports[p.index()];
            port.component == component && port.message == message
        })
    }

    /// Receivers of an output port, in link-registration order.
    ///
    /// The order is significant for deterministic delivery; receivers
    /// must not depend on their siblings' relative order beyond that.
    pub fn receivers(&self, output: PortId) -> Vec<ActorId> {
        let Some(port) = self.ports.get(output.index()) else {
            return Vec::new();
        };
        port.links
            .iter()
            .map(|l| {
                let link = &self.links[l.index()];
                self.ports[link.input.index()].owner
            })
            .collect()
    }

    /// Whether every port in the graph passed multiplicity validation.
    pub fn is_fully_valid(&self) -> bool {
        self.diagnostics.is_empty()
    }

    pub fn diagnostics(&self) -> &[WiringDiagnostic] {
        &self.diagnostics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ActorKind, ActorKindId, Catalog};
    use crate::components;
    use uuid::Uuid;

    struct Foo;
    struct Bar;

    fn kind_id(n: u128) -> ActorKindId {
        ActorKindId(Uuid::from_u128(n))
    }

    fn two_actor_graph() -> (GraphBuilder, ActorId, ActorId) {
        let mut catalog = Catalog::with_standard_components();
        catalog
            .add_actor(
                ActorKind::new(kind_id(1), "Producer")
                    .with_output::<Foo>(components::NET)
                    .with_output::<Bar>(components::RPC),
            )
            .unwrap();
        catalog
            .add_actor(
                ActorKind::new(kind_id(2), "Consumer")
                    .with_input::<Foo>(components::NET)
                    .with_input::<Bar>(components::RPC),
            )
            .unwrap();

        let mut builder = GraphBuilder::new(catalog);
        let producer = builder.add_actor(kind_id(1)).unwrap();
        let consumer = builder.add_actor(kind_id(2)).unwrap();
        (builder, producer, consumer)
    }

    #[test]
    fn connect_links_both_ports_once() {
        let (mut builder, producer, consumer) = two_actor_graph();
        builder.connect_net::<Foo>(producer, consumer).unwrap();
        let graph = builder.build();

        let out = graph
            .find_port(producer, PortDirection::Output, components::NET, MessageKey::of::<Foo>())
            .unwrap();
        let inp = graph
            .find_port(consumer, PortDirection::Input, components::NET, MessageKey::of::<Foo>())
            .unwrap();
        assert_eq!(graph.port(out).unwrap().links.len(), 1);
        assert_eq!(graph.port(inp).unwrap().links.len(), 1);
        assert_eq!(graph.receivers(out), vec![consumer]);
    }

    #[test]
    fn reconnect_is_a_no_op() {
        let (mut builder, producer, consumer) = two_actor_graph();
        let first = builder.connect_net::<Foo>(producer, consumer).unwrap();
        let second = builder.connect_net::<Foo>(producer, consumer).unwrap();
        assert_eq!(first, second);

        let graph = builder.build();
        let out = graph
            .find_port(producer, PortDirection::Output, components::NET, MessageKey::of::<Foo>())
            .unwrap();
        assert_eq!(graph.port(out).unwrap().links.len(), 1);
    }

    #[test]
    fn missing_port_is_a_diagnostic_error() {
        let (mut builder, producer, consumer) = two_actor_graph();
        // Consumer has no Foo output; connecting in reverse must fail.
        let err = builder.connect_net::<Foo>(consumer, producer).unwrap_err();
        assert!(matches!(err, WiringError::NoMatchingPort { .. }));
    }

    #[test]
    fn unlinked_rpc_output_is_flagged_invalid() {
        let (builder, producer, _) = two_actor_graph();
        let graph = builder.build();

        assert!(!graph.is_fully_valid());
        let diagnostic = &graph.diagnostics()[0];
        assert_eq!(diagnostic.kind, DiagnosticKind::MultiplicityViolation);
        assert_eq!(diagnostic.actor, producer);

        let rpc_out = graph
            .find_port(producer, PortDirection::Output, components::RPC, MessageKey::of::<Bar>())
            .unwrap();
        assert!(!graph.port(rpc_out).unwrap().valid);
    }

    #[test]
    fn linked_rpc_output_is_valid() {
        let (mut builder, producer, consumer) = two_actor_graph();
        builder.connect_net::<Foo>(producer, consumer).unwrap();
        builder.connect_rpc::<Bar>(producer, consumer).unwrap();
        let graph = builder.build();
        assert!(graph.is_fully_valid());
    }

    #[test]
    fn disconnect_removes_link_from_both_sides() {
        let (mut builder, producer, consumer) = two_actor_graph();
        builder.connect_net::<Foo>(producer, consumer).unwrap();
        builder
            .disconnect(producer, consumer, components::NET, MessageKey::of::<Foo>())
            .unwrap();
        let graph = builder.build();

        let out = graph
            .find_port(producer, PortDirection::Output, components::NET, MessageKey::of::<Foo>())
            .unwrap();
        let inp = graph
            .find_port(consumer, PortDirection::Input, components::NET, MessageKey::of::<Foo>())
            .unwrap();
        assert!(graph.port(out).unwrap().links.is_empty());
        assert!(graph.port(inp).unwrap().links.is_empty());
    }

    #[test]
    fn disconnecting_an_exactly_one_port_flags_it_again() {
        let (mut builder, producer, consumer) = two_actor_graph();
        builder.connect_net::<Foo>(producer, consumer).unwrap();
        builder.connect_rpc::<Bar>(producer, consumer).unwrap();
        builder
            .disconnect(producer, consumer, components::RPC, MessageKey::of::<Bar>())
            .unwrap();
        let graph = builder.build();

        assert!(!graph.is_fully_valid());
        let rpc_out = graph
            .find_port(producer, PortDirection::Output, components::RPC, MessageKey::of::<Bar>())
            .unwrap();
        assert!(!graph.port(rpc_out).unwrap().valid);
    }

    #[test]
    fn optional_output_may_stay_unlinked() {
        let mut catalog = Catalog::with_standard_components();
        catalog
            .add_actor(
                ActorKind::new(kind_id(7), "Optional")
                    .with_optional_output::<Bar>(components::RPC),
            )
            .unwrap();
        let mut builder = GraphBuilder::new(catalog);
        builder.add_actor(kind_id(7)).unwrap();
        let graph = builder.build();
        assert!(graph.is_fully_valid());
    }

    #[test]
    fn broadcast_receivers_follow_registration_order() {
        let mut catalog = Catalog::with_standard_components();
        catalog
            .add_actor(ActorKind::new(kind_id(1), "Source").with_output::<Foo>(components::NET))
            .unwrap();
        catalog
            .add_actor(ActorKind::new(kind_id(2), "Sink").with_input::<Foo>(components::NET))
            .unwrap();

        let mut builder = GraphBuilder::new(catalog);
        let source = builder.add_actor(kind_id(1)).unwrap();
        let sinks: Vec<_> = (0..3).map(|_| builder.add_actor(kind_id(2)).unwrap()).collect();
        // Wire out of order on purpose.
        builder.connect_net::<Foo>(source, sinks[1]).unwrap();
        builder.connect_net::<Foo>(source, sinks[0]).unwrap();
        builder.connect_net::<Foo>(source, sinks[2]).unwrap();
        let graph = builder.build();

        let out = graph
            .find_port(source, PortDirection::Output, components::NET, MessageKey::of::<Foo>())
            .unwrap();
        assert_eq!(graph.receivers(out), vec![sinks[1], sinks[0], sinks[2]]);
    }
}
