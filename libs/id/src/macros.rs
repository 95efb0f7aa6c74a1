use crate::{IdError, Ulid};

/// Split `value` into its ULID, requiring `prefix`.
#[doc(hidden)]
pub fn parse_prefixed(
    entity: &'static str,
    prefix: &'static str,
    value: &str,
) -> Result<Ulid, IdError> {
    let (actual, ulid) = value.split_once('_').ok_or_else(|| IdError::Malformed {
        entity,
        value: value.to_string(),
    })?;

    if actual.is_empty() || ulid.is_empty() {
        return Err(IdError::Malformed {
            entity,
            value: value.to_string(),
        });
    }

    if actual != prefix {
        return Err(IdError::WrongKind {
            entity,
            expected: prefix,
            value: value.to_string(),
        });
    }

    ulid.parse::<Ulid>().map_err(|e| IdError::BadUlid {
        entity,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// Defines a ULID newtype rendered as `{prefix}_{ulid}`.
///
/// `entity` names the kind in parse errors.
///
/// ```ignore
/// define_id!(CheckId, "chk", "check");
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident, $prefix:literal, $entity:literal) => {
        #[doc = concat!("ID of a ", $entity, ", rendered as `", $prefix, "_{ulid}`.")]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name($crate::Ulid);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            /// A fresh ID. IDs created later sort after earlier ones.
            #[must_use]
            pub fn new() -> Self {
                Self($crate::Ulid::new())
            }

            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                $crate::macros::parse_prefixed($entity, $prefix, s).map(Self)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
                Self::parse(&raw).map_err(serde::de::Error::custom)
            }
        }
    };
}
