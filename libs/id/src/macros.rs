//! Macro for declaring prefixed identifier types.

/// Declares a typed identifier backed by a ULID.
///
/// The generated type renders as `{prefix}_{ulid}`, parses strictly, orders
/// by creation time (then randomness), and serializes as its string form.
///
/// ```ignore
/// define_id!(NodeId, "node");
///
/// let id = NodeId::new();
/// let parsed: NodeId = id.to_string().parse()?;
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name($crate::Ulid);

        impl $name {
            /// Prefix rendered before the ULID.
            pub const PREFIX: &'static str = $prefix;

            /// Generates a fresh identifier.
            #[must_use]
            pub fn new() -> Self {
                Self($crate::Ulid::new())
            }

            /// Wraps an existing ULID.
            #[must_use]
            pub const fn from_ulid(ulid: $crate::Ulid) -> Self {
                Self(ulid)
            }

            /// Builds an identifier from a raw 128-bit value.
            ///
            /// Mostly useful for fixtures that need a stable ordering.
            #[must_use]
            pub const fn from_u128(value: u128) -> Self {
                Self($crate::Ulid(value))
            }

            #[must_use]
            pub const fn ulid(&self) -> $crate::Ulid {
                self.0
            }

            /// Short form used in log lines: the last eight ULID characters.
            #[must_use]
            pub fn short(&self) -> String {
                let full = self.0.to_string();
                full[full.len() - 8..].to_string()
            }

            /// Parses `{prefix}_{ulid}`.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                if s.is_empty() {
                    return Err($crate::IdError::Empty);
                }

                let Some((prefix, ulid_str)) = s.split_once('_') else {
                    return Err($crate::IdError::MissingSeparator);
                };

                if prefix != Self::PREFIX {
                    return Err($crate::IdError::InvalidPrefix {
                        expected: Self::PREFIX,
                        actual: prefix.to_string(),
                    });
                }

                ulid_str
                    .parse::<$crate::Ulid>()
                    .map(Self)
                    .map_err(|e| $crate::IdError::InvalidUlid(e.to_string()))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<$crate::Ulid> for $name {
            fn from(ulid: $crate::Ulid) -> Self {
                Self(ulid)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}_{}", Self::PREFIX, self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.collect_str(self)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}
