//! Type-derived routing keys.

use std::any::{type_name, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Identity of a payload type, used to route payloads to their handlers.
///
/// Equality and hashing use the type's `TypeId`, so two values of the same
/// declared type always resolve to the same key no matter how they reached
/// the bus. The fully qualified type name is kept for display only.
#[derive(Clone, Copy)]
pub struct HandlerKey {
    type_id: TypeId,
    type_name: &'static str,
}

impl HandlerKey {
    /// Returns the key for type `T`.
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
        }
    }

    /// Fully qualified name of the keyed type.
    pub const fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// `TypeId` of the keyed type.
    pub const fn type_id(&self) -> TypeId {
        self.type_id
    }
}

impl PartialEq for HandlerKey {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for HandlerKey {}

impl Hash for HandlerKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
    }
}

impl fmt::Debug for HandlerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HandlerKey").field(&self.type_name).finish()
    }
}

impl fmt::Display for HandlerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    struct OpenAccount;
    struct CloseAccount;

    mod other {
        pub struct OpenAccount;
    }

    #[test]
    fn same_type_yields_equal_keys() {
        assert_eq!(HandlerKey::of::<OpenAccount>(), HandlerKey::of::<OpenAccount>());
    }

    #[test]
    fn distinct_types_yield_distinct_keys() {
        assert_ne!(HandlerKey::of::<OpenAccount>(), HandlerKey::of::<CloseAccount>());
    }

    #[test]
    fn same_name_in_other_module_is_a_different_key() {
        let local = HandlerKey::of::<OpenAccount>();
        let foreign = HandlerKey::of::<other::OpenAccount>();

        assert_ne!(local, foreign);
        assert!(foreign.type_name().ends_with("other::OpenAccount"));
    }

    #[test]
    fn keys_hash_by_type_identity() {
        let keys: HashSet<_> = [
            HandlerKey::of::<OpenAccount>(),
            HandlerKey::of::<OpenAccount>(),
            HandlerKey::of::<CloseAccount>(),
        ]
        .into_iter()
        .collect();

        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn display_is_the_type_name() {
        let key = HandlerKey::of::<CloseAccount>();

        assert_eq!(key.to_string(), key.type_name());
        assert!(key.to_string().ends_with("CloseAccount"));
    }
}
