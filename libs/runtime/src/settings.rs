//! Typed settings-change requests, broadcast as events.
//!
//! Settings objects are keyed by a stable identifier. A change request
//! names its target identity and field and carries a typed apply
//! function; receiving actors filter by their own settings id before
//! applying, so one broadcast reaches every actor holding that settings
//! type and only the addressed one reacts.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

/// Stable identity of one actor's settings object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SettingsId(Arc<str>);

impl SettingsId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SettingsId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl fmt::Display for SettingsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A request to change one field of the settings object identified by
/// `target`. The mutation itself is a typed function — no field names
/// mapped to boxed values.
pub struct SettingChange<T> {
    target: SettingsId,
    field: &'static str,
    apply: Arc<dyn Fn(&mut T) + Send + Sync>,
}

impl<T> Clone for SettingChange<T> {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
            field: self.field,
            apply: Arc::clone(&self.apply),
        }
    }
}

impl<T> SettingChange<T> {
    pub fn new(
        target: SettingsId,
        field: &'static str,
        apply: impl Fn(&mut T) + Send + Sync + 'static,
    ) -> Self {
        Self {
            target,
            field,
            apply: Arc::new(apply),
        }
    }

    pub fn target(&self) -> &SettingsId {
        &self.target
    }

    pub fn field(&self) -> &'static str {
        self.field
    }

    /// Applies the change when `id` matches the target identity.
    /// Returns whether it applied.
    pub fn apply_to(&self, id: &SettingsId, settings: &mut T) -> bool {
        if *id != self.target {
            debug!(target = %self.target, actual = %id, field = self.field, "setting change for another identity ignored");
            return false;
        }
        (self.apply)(settings);
        true
    }
}

impl<T> fmt::Debug for SettingChange<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettingChange")
            .field("target", &self.target)
            .field("field", &self.field)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct LightSettings {
        id: SettingsId,
        intensity: f32,
    }

    #[test]
    fn change_applies_only_to_its_target() {
        let mut mine = LightSettings {
            id: SettingsId::from("light-1"),
            intensity: 0.5,
        };
        let mut other = LightSettings {
            id: SettingsId::from("light-2"),
            intensity: 0.5,
        };

        let change =
            SettingChange::<LightSettings>::new(SettingsId::from("light-1"), "intensity", |s| {
                s.intensity = 1.0;
            });

        let mine_id = mine.id.clone();
        let other_id = other.id.clone();
        assert!(change.apply_to(&mine_id, &mut mine));
        assert!(!change.apply_to(&other_id, &mut other));
        assert_eq!(mine.intensity, 1.0);
        assert_eq!(other.intensity, 0.5);
    }
}
