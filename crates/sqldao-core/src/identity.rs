//! Entity identities.

use crate::value::{Value, format_uuid};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which kind of identity column a table declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdKind {
    /// 32-bit auto-increment integer.
    Int,
    /// 64-bit auto-increment integer.
    Long,
    /// Client-generated UUID.
    Uuid,
}

impl IdKind {
    /// Whether the database generates identities for this kind.
    pub const fn is_auto_increment(self) -> bool {
        matches!(self, IdKind::Int | IdKind::Long)
    }

    /// Generate a fresh client-side identity, for kinds that need one.
    pub fn generate(self) -> Option<EntityId> {
        match self {
            IdKind::Uuid => Some(EntityId::Uuid(uuid::Uuid::now_v7().into_bytes())),
            IdKind::Int | IdKind::Long => None,
        }
    }
}

/// The normalized identity of an entity row.
///
/// Integer identities are widened to `i64` so that a key read back as
/// `Value::Int` and one assigned as `Value::BigInt` hash to the same slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityId {
    Int(i64),
    Uuid([u8; 16]),
    Text(String),
}

impl EntityId {
    /// Normalize a column value into an identity. NULL and non-key values
    /// yield `None`.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(v) => Some(EntityId::Int(i64::from(*v))),
            Value::BigInt(v) => Some(EntityId::Int(*v)),
            Value::Uuid(u) => Some(EntityId::Uuid(*u)),
            Value::Bytes(b) if b.len() == 16 => {
                let mut arr = [0u8; 16];
                arr.copy_from_slice(b);
                Some(EntityId::Uuid(arr))
            }
            Value::Text(s) => Some(EntityId::Text(s.clone())),
            _ => None,
        }
    }

    /// The value bound as a parameter for this identity.
    pub fn to_value(&self) -> Value {
        match self {
            EntityId::Int(v) => Value::BigInt(*v),
            EntityId::Uuid(u) => Value::Uuid(*u),
            EntityId::Text(s) => Value::Text(s.clone()),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            EntityId::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityId::Int(v) => write!(f, "{}", v),
            EntityId::Uuid(u) => write!(f, "{}", format_uuid(u)),
            EntityId::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for EntityId {
    fn from(v: i64) -> Self {
        EntityId::Int(v)
    }
}

impl From<i32> for EntityId {
    fn from(v: i32) -> Self {
        EntityId::Int(i64::from(v))
    }
}

impl From<EntityId> for Value {
    fn from(id: EntityId) -> Self {
        id.to_value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_int_widths_normalize() {
        let a = EntityId::from_value(&Value::Int(5));
        let b = EntityId::from_value(&Value::BigInt(5));
        assert_eq!(a, b);

        let mut map = HashMap::new();
        map.insert(a.unwrap(), "row");
        assert_eq!(map.get(&EntityId::Int(5)), Some(&"row"));
    }

    #[test]
    fn test_null_is_not_an_identity() {
        assert_eq!(EntityId::from_value(&Value::Null), None);
        assert_eq!(EntityId::from_value(&Value::Double(1.0)), None);
    }

    #[test]
    fn test_uuid_generation() {
        let first = IdKind::Uuid.generate().unwrap();
        let second = IdKind::Uuid.generate().unwrap();
        assert_ne!(first, second);
        assert!(IdKind::Long.generate().is_none());
        assert_eq!(first.to_string().len(), 36);
    }

    #[test]
    fn test_serde_round_trip_keeps_kind() {
        let id = EntityId::Int(42);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "{\"Int\":42}");
        let back: EntityId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
