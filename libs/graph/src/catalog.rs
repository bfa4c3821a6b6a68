//! Configuration-time registry of actor kinds and component contracts.

use std::fmt;

use uuid::Uuid;

use crate::message::MessageKey;
use crate::multiplicity::Multiplicity;
use crate::wiring::WiringError;

/// Stable identity of a reusable component contract (net, rpc, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComponentKindId(pub Uuid);

/// Stable identity of an actor kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActorKindId(pub Uuid);

/// Stable identity of a port declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortDeclId(pub Uuid);

impl fmt::Display for ActorKindId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kind-{}", self.0.simple())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortDirection {
    Input,
    Output,
}

/// A reusable capability contract that port declarations reference.
///
/// The component decides the default link cardinality for ports on each
/// side. Event ports declare `Zero` on both sides because event wiring is
/// dynamic (subscribe/unsubscribe), not part of the static graph.
#[derive(Debug, Clone)]
pub struct ComponentKind {
    pub id: ComponentKindId,
    pub name: String,
    pub input_multiplicity: Multiplicity,
    pub output_multiplicity: Multiplicity,
}

/// A typed, directional endpoint declared on an actor kind.
///
/// Declarations are configuration-time data; port *instances* live in the
/// graph arena and reference back here by id.
#[derive(Debug, Clone)]
pub struct PortDecl {
    pub id: PortDeclId,
    pub component: ComponentKindId,
    pub direction: PortDirection,
    pub message: MessageKey,
    pub display_name: String,
    /// Optional ports may legally stay unlinked even when the component
    /// multiplicity would demand a link; the runtime synthesizes a
    /// no-endpoint failure instead.
    pub optional: bool,
}

/// An actor kind: identity, declared ports, and scheduling metadata.
#[derive(Debug, Clone)]
pub struct ActorKind {
    pub id: ActorKindId,
    pub name: String,
    pub inputs: Vec<PortDecl>,
    pub outputs: Vec<PortDecl>,
    /// Lifecycle callbacks and handlers must run on the designated main
    /// execution context.
    pub main_thread: bool,
    /// Display grouping for graph tooling.
    pub group: Option<String>,
}

impl ActorKind {
    pub fn new(id: ActorKindId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            main_thread: false,
            group: None,
        }
    }

    pub fn with_input<M: 'static>(mut self, component: ComponentKindId) -> Self {
        self.inputs.push(Self::decl::<M>(component, PortDirection::Input, false));
        self
    }

    pub fn with_output<M: 'static>(mut self, component: ComponentKindId) -> Self {
        self.outputs.push(Self::decl::<M>(component, PortDirection::Output, false));
        self
    }

    /// Declares an output that may legally stay unlinked.
    pub fn with_optional_output<M: 'static>(mut self, component: ComponentKindId) -> Self {
        self.outputs.push(Self::decl::<M>(component, PortDirection::Output, true));
        self
    }

    pub fn on_main_thread(mut self) -> Self {
        self.main_thread = true;
        self
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    fn decl<M: 'static>(
        component: ComponentKindId,
        direction: PortDirection,
        optional: bool,
    ) -> PortDecl {
        let message = MessageKey::of::<M>();
        PortDecl {
            id: PortDeclId(Uuid::new_v4()),
            component,
            direction,
            message,
            display_name: message.name().rsplit("::").next().unwrap_or("").to_string(),
            optional,
        }
    }
}

/// The catalogue of actor kinds and component contracts.
///
/// Produced once during configuration, read by graph construction and the
/// runtime. Never mutated afterwards.
#[derive(Debug, Default)]
pub struct Catalog {
    components: Vec<ComponentKind>,
    actors: Vec<ActorKind>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A catalog pre-seeded with the standard component contracts.
    pub fn with_standard_components() -> Self {
        Self {
            components: standard_components(),
            actors: Vec::new(),
        }
    }

    pub fn add_component(&mut self, component: ComponentKind) -> Result<(), WiringError> {
        if self.components.iter().any(|c| c.id == component.id) {
            return Err(WiringError::DuplicateKind {
                name: component.name.clone(),
            });
        }
        self.components.push(component);
        Ok(())
    }

    pub fn add_actor(&mut self, kind: ActorKind) -> Result<ActorKindId, WiringError> {
        if self.actors.iter().any(|a| a.id == kind.id) {
            return Err(WiringError::DuplicateKind { name: kind.name.clone() });
        }
        for decl in kind.inputs.iter().chain(&kind.outputs) {
            if self.component(decl.component).is_none() {
                return Err(WiringError::UnknownComponent { id: decl.component });
            }
        }
        let id = kind.id;
        self.actors.push(kind);
        Ok(id)
    }

    pub fn component(&self, id: ComponentKindId) -> Option<&ComponentKind> {
        self.components.iter().find(|c| c.id == id)
    }

    pub fn actor(&self, id: ActorKindId) -> Option<&ActorKind> {
        self.actors.iter().find(|a| a.id == id)
    }

    pub fn actors(&self) -> impl Iterator<Item = &ActorKind> {
        self.actors.iter()
    }
}

fn standard_components() -> Vec<ComponentKind> {
    use crate::components;

    vec![
        ComponentKind {
            id: components::NET,
            name: "net".to_string(),
            input_multiplicity: Multiplicity::Any,
            output_multiplicity: Multiplicity::Any,
        },
        ComponentKind {
            id: components::RPC,
            name: "rpc".to_string(),
            input_multiplicity: Multiplicity::Any,
            output_multiplicity: Multiplicity::ExactlyOne,
        },
        ComponentKind {
            id: components::EVENT,
            name: "event".to_string(),
            input_multiplicity: Multiplicity::Zero,
            output_multiplicity: Multiplicity::Zero,
        },
        ComponentKind {
            id: components::PIPE,
            name: "pipe".to_string(),
            input_multiplicity: Multiplicity::Any,
            output_multiplicity: Multiplicity::ZeroOrOne,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components;

    struct Ping;

    fn kind_id(n: u128) -> ActorKindId {
        ActorKindId(Uuid::from_u128(n))
    }

    #[test]
    fn standard_components_are_present() {
        let catalog = Catalog::with_standard_components();
        assert_eq!(catalog.component(components::NET).unwrap().name, "net");
        assert_eq!(
            catalog.component(components::RPC).unwrap().output_multiplicity,
            Multiplicity::ExactlyOne
        );
        assert_eq!(
            catalog.component(components::EVENT).unwrap().input_multiplicity,
            Multiplicity::Zero
        );
    }

    #[test]
    fn duplicate_actor_kind_is_rejected() {
        let mut catalog = Catalog::with_standard_components();
        catalog
            .add_actor(ActorKind::new(kind_id(1), "a"))
            .unwrap();
        let err = catalog
            .add_actor(ActorKind::new(kind_id(1), "a"))
            .unwrap_err();
        assert!(matches!(err, WiringError::DuplicateKind { .. }));
    }

    #[test]
    fn actor_with_unknown_component_is_rejected() {
        let mut catalog = Catalog::new();
        let kind = ActorKind::new(kind_id(2), "b").with_output::<Ping>(components::NET);
        assert!(matches!(
            catalog.add_actor(kind),
            Err(WiringError::UnknownComponent { .. })
        ));
    }

    #[test]
    fn port_display_name_strips_path() {
        let kind = ActorKind::new(kind_id(3), "c").with_output::<Ping>(components::NET);
        assert_eq!(kind.outputs[0].display_name, "Ping");
    }
}
