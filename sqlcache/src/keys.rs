use std::fmt::{self, Display, Write};

/// Default key separator.
pub const DEFAULT_SEPARATOR: &str = ":";

/// Builds hierarchical store keys: `prefix{sep}part{sep}part...`.
///
/// Pure and deterministic; the same inputs always give the same key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KeyBuilder {
    prefix: String,
    separator: String,
}

impl KeyBuilder {
    /// Creates a builder rooted at `namespace`.
    pub fn new(namespace: impl Into<String>, separator: impl Into<String>) -> Self {
        KeyBuilder {
            prefix: namespace.into(),
            separator: separator.into(),
        }
    }

    /// A builder for a sub-keyspace; its keys start with this builder's
    /// prefix, the separator and `name`.
    pub fn sub(&self, name: impl Display) -> KeyBuilder {
        KeyBuilder {
            prefix: self.key(name),
            separator: self.separator.clone(),
        }
    }

    /// The key for a single id part.
    pub fn key(&self, part: impl Display) -> String {
        self.build(&[&part])
    }

    /// The key for a sequence of id parts.
    pub fn build(&self, parts: &[&dyn Display]) -> String {
        let mut key = self.prefix.clone();
        for part in parts {
            key.push_str(&self.separator);
            // Writing into a String cannot fail.
            let _ = write!(key, "{part}");
        }
        key
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }
}

impl Display for KeyBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::QueryId;
    use quickcheck::quickcheck;

    #[test]
    fn builds_namespaced_keys() {
        let keys = KeyBuilder::new("app", ":");
        assert_eq!(keys.key("config"), "app:config");
        assert_eq!(keys.build(&[&"cache", &QueryId(42)]), "app:cache:42");
        assert_eq!(keys.build(&[]), "app");
    }

    #[test]
    fn sub_keyspaces_compose() {
        let cache = KeyBuilder::new("app", "/").sub("cache");
        assert_eq!(cache.prefix(), "app/cache");
        assert_eq!(cache.key(QueryId(7)), "app/cache/7");
        assert_eq!(cache.sub("v2").key(1), "app/cache/v2/1");
    }

    quickcheck! {
        fn keys_are_deterministic(ns: String, id: u32) -> bool {
            let keys = KeyBuilder::new(ns, ":");
            keys.build(&[&"cache", &id]) == keys.build(&[&"cache", &id])
        }

        fn distinct_ids_give_distinct_keys(ns: String, a: u32, b: u32) -> bool {
            let keys = KeyBuilder::new(ns, ":").sub("cache");
            (a == b) == (keys.key(a) == keys.key(b))
        }
    }
}
