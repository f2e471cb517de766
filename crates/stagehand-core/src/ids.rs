//! Identifier newtypes
//!
//! All ids are strings on disk; the newtypes keep unit ids, escalation ids
//! and stage ids from being mixed up in signatures.

use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing id
            #[inline]
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow as `&str`
            #[inline]
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id! {
    /// Unit-of-work (agent) identifier, `<type>-<ULID>` when generated
    UnitId
}

string_id! {
    /// Escalation case identifier, `ESC-<ULID>` when generated
    EscalationId
}

string_id! {
    /// Stage (phase) identifier
    StageId
}

impl UnitId {
    /// Generate a fresh id for a unit of the given type
    #[inline]
    #[must_use]
    pub fn generate(unit_type: &str) -> Self {
        Self(format!("{unit_type}-{}", Ulid::new()))
    }
}

impl EscalationId {
    /// Generate a fresh escalation id
    #[inline]
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("ESC-{}", Ulid::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_unit_ids_carry_type_prefix_and_are_unique() {
        let a = UnitId::generate("coder");
        let b = UnitId::generate("coder");
        assert!(a.as_str().starts_with("coder-"));
        assert_ne!(a, b);
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = StageId::new("phase_01_vision_strategy");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"phase_01_vision_strategy\"");
    }
}
