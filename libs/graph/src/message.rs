//! Runtime type tags for port message types.

use std::any::{type_name, TypeId};
use std::fmt;

/// Identifies the payload type a port carries.
///
/// Dispatch at runtime is by the message's concrete type, not its declared
/// type, so the key pairs the `TypeId` (for lookup) with the type name
/// (for diagnostics only — never for identity).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageKey {
    id: TypeId,
    name: &'static str,
}

impl MessageKey {
    pub fn of<M: 'static>() -> Self {
        Self {
            id: TypeId::of::<M>(),
            name: type_name::<M>(),
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.id
    }

    /// Human-readable type name, for logs and diagnostics.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageKey({})", self.name)
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}
