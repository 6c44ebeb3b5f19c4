use std::{fmt, sync::Arc};

use serde::{
    de::{MapAccess, Visitor},
    Deserialize, Deserializer,
};
use tracing::debug;

use crate::{config::ConfigProvider, SamlError, SamlResult};

/// Attribute name to values, in configuration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeMap {
    entries: Vec<(String, Vec<String>)>,
}

impl AttributeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the values of an existing attribute in place, or appends it.
    pub fn insert(&mut self, name: impl Into<String>, values: Vec<String>) {
        let name = name.into();
        match self.entries.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, existing)) => *existing = values,
            None => self.entries.push((name, values)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, values)| values.as_slice())
    }

    pub fn first(&self, name: &str) -> Option<&str> {
        self.get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
        let index = self.entries.iter().position(|(existing, _)| existing == name)?;
        Some(self.entries.remove(index).1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    fn values_mut(&mut self, name: &str) -> Option<&mut Vec<String>> {
        self.entries
            .iter_mut()
            .find(|(existing, _)| existing == name)
            .map(|(_, values)| values)
    }

    /// Renames in place. Values merge into `to` when it already exists.
    fn rename(&mut self, from: &str, to: &str) {
        if from == to {
            return;
        }
        let Some(index) = self.entries.iter().position(|(name, _)| name == from) else {
            return;
        };
        if let Some(target) = self.entries.iter().position(|(name, _)| name == to) {
            let (_, values) = self.entries.remove(index);
            let target = if target > index { target - 1 } else { target };
            self.entries[target].1.extend(values);
        } else {
            self.entries[index].0 = to.to_string();
        }
    }
}

impl FromIterator<(String, Vec<String>)> for AttributeMap {
    fn from_iter<T: IntoIterator<Item = (String, Vec<String>)>>(iter: T) -> Self {
        let mut map = AttributeMap::new();
        for (name, values) in iter {
            map.insert(name, values);
        }
        map
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl<'de> Deserialize<'de> for AttributeMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct AttributeMapVisitor;

        impl<'de> Visitor<'de> for AttributeMapVisitor {
            type Value = AttributeMap;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of attribute names to a string or a list of strings")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut map = AttributeMap::new();
                while let Some((name, values)) = access.next_entry::<String, OneOrMany>()? {
                    let values = match values {
                        OneOrMany::One(value) => vec![value],
                        OneOrMany::Many(values) => values,
                    };
                    if values.is_empty() {
                        return Err(serde::de::Error::custom(format!(
                            "attribute {name} has no values"
                        )));
                    }
                    if map.get(&name).is_some() {
                        return Err(serde::de::Error::custom(format!(
                            "attribute {name} is listed twice"
                        )));
                    }
                    map.insert(name, values);
                }
                Ok(map)
            }
        }

        deserializer.deserialize_map(AttributeMapVisitor)
    }
}

/// Pure transformations applied to resolved attributes, in configured order.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AttributeFilter {
    Rename { from: String, to: String },
    SingleValue { name: String },
    Scope { name: String, domain: String },
    Allow { names: Vec<String> },
    MapValue { name: String, from: String, to: String },
}

impl AttributeFilter {
    pub fn apply(&self, attributes: &mut AttributeMap) {
        match self {
            AttributeFilter::Rename { from, to } => attributes.rename(from, to),
            AttributeFilter::SingleValue { name } => {
                if let Some(values) = attributes.values_mut(name) {
                    values.truncate(1);
                }
            }
            AttributeFilter::Scope { name, domain } => {
                if let Some(values) = attributes.values_mut(name) {
                    for value in values.iter_mut().filter(|value| !value.contains('@')) {
                        value.push('@');
                        value.push_str(domain);
                    }
                }
            }
            AttributeFilter::Allow { names } => {
                attributes.entries.retain(|(name, _)| names.contains(name));
            }
            AttributeFilter::MapValue { name, from, to } => {
                if let Some(values) = attributes.values_mut(name) {
                    for value in values.iter_mut().filter(|value| *value == from) {
                        value.clone_from(to);
                    }
                }
            }
        }
    }
}

/// Friendly names of the eduPerson / inetOrgPerson attributes commonly
/// released by campus IdPs.
pub fn friendly_name(name: &str) -> Option<&'static str> {
    let friendly = match name {
        "urn:oid:2.16.840.1.113730.3.1.241" => "displayName",
        "urn:oid:1.3.6.1.4.1.5923.1.1.1.9" => "eduPersonScopedAffiliation",
        "urn:oid:1.3.6.1.4.1.5923.1.1.1.1" => "eduPersonAffiliation",
        "urn:oid:0.9.2342.19200300.100.1.3" => "mail",
        "urn:oid:0.9.2342.19200300.100.1.1" => "uid",
        "urn:oid:1.3.6.1.4.1.5923.1.1.1.6" => "eduPersonPrincipalName",
        "urn:oid:1.3.6.1.4.1.5923.1.1.1.10" => "eduPersonTargetedID",
        "urn:oid:1.3.6.1.4.1.5923.1.1.1.13" => "eduPersonUniqueId",
        "urn:oid:2.5.4.42" => "givenName",
        "urn:oid:2.5.4.4" => "sn",
        "urn:oid:2.5.4.3" => "cn",
        "urn:oid:2.16.840.1.113730.3.1.3" => "employeeNumber",
        _ => return None,
    };
    Some(friendly)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    pub key: String,
    /// Login name, the part of the key before the first `:`.
    pub username: String,
    /// Attributes as configured, before any filter ran.
    pub raw: AttributeMap,
    pub attributes: AttributeMap,
}

pub struct AttributeResolver {
    provider: Arc<dyn ConfigProvider>,
    filters: Vec<AttributeFilter>,
}

impl AttributeResolver {
    pub fn new(provider: Arc<dyn ConfigProvider>, filters: Vec<AttributeFilter>) -> Self {
        AttributeResolver { provider, filters }
    }

    pub fn resolve(&self, identity_key: &str) -> SamlResult<AttributeMap> {
        self.resolve_identity(identity_key)
            .map(|identity| identity.attributes)
    }

    pub fn resolve_identity(&self, identity_key: &str) -> SamlResult<ResolvedIdentity> {
        let record = self
            .provider
            .lookup_identity(identity_key)
            .ok_or_else(|| SamlError::UnknownIdentity(username(identity_key).to_string()))?;

        let mut attributes = record.attributes.clone();
        for filter in &self.filters {
            filter.apply(&mut attributes);
        }
        debug!(
            identity = username(identity_key),
            attributes = attributes.len(),
            "resolved attributes"
        );

        Ok(ResolvedIdentity {
            key: record.key.clone(),
            username: username(&record.key).to_string(),
            raw: record.attributes.clone(),
            attributes,
        })
    }
}

impl fmt::Debug for AttributeResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttributeResolver")
            .field("filters", &self.filters)
            .finish_non_exhaustive()
    }
}

fn username(identity_key: &str) -> &str {
    identity_key
        .split_once(':')
        .map_or(identity_key, |(user, _)| user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IdentityRecord, StaticConfig};

    fn values(list: &[&str]) -> Vec<String> {
        list.iter().map(|value| value.to_string()).collect()
    }

    fn provider() -> Arc<dyn ConfigProvider> {
        let attributes: AttributeMap = [
            ("urn:oid:0.9.2342.19200300.100.1.3".to_string(), values(&["sally@jhu.edu"])),
            (
                "urn:oid:1.3.6.1.4.1.5923.1.1.1.9".to_string(),
                values(&["FACULTY", "staff@johnshopkins.edu"]),
            ),
            ("urn:oid:2.5.4.42".to_string(), values(&["Sally", "Sal"])),
        ]
        .into_iter()
        .collect();
        Arc::new(StaticConfig::new(
            vec![IdentityRecord {
                key: "user1:password".into(),
                attributes,
            }],
            Vec::new(),
        ))
    }

    #[test]
    fn unknown_identity() {
        let resolver = AttributeResolver::new(provider(), Vec::new());
        assert!(matches!(
            resolver.resolve("nobody:password"),
            Err(SamlError::UnknownIdentity(name)) if name == "nobody"
        ));
    }

    #[test]
    fn filters_apply_in_order() {
        let resolver = AttributeResolver::new(
            provider(),
            vec![
                AttributeFilter::Rename {
                    from: "urn:oid:0.9.2342.19200300.100.1.3".into(),
                    to: "mail".into(),
                },
                AttributeFilter::SingleValue {
                    name: "urn:oid:2.5.4.42".into(),
                },
                AttributeFilter::Scope {
                    name: "urn:oid:1.3.6.1.4.1.5923.1.1.1.9".into(),
                    domain: "johnshopkins.edu".into(),
                },
            ],
        );
        let attributes = resolver.resolve("user1:password").unwrap();

        let names: Vec<_> = attributes.names().collect();
        assert_eq!(
            names,
            [
                "mail",
                "urn:oid:1.3.6.1.4.1.5923.1.1.1.9",
                "urn:oid:2.5.4.42"
            ]
        );
        assert_eq!(attributes.get("urn:oid:2.5.4.42").unwrap(), ["Sally"]);
        assert_eq!(
            attributes.get("urn:oid:1.3.6.1.4.1.5923.1.1.1.9").unwrap(),
            ["FACULTY@johnshopkins.edu", "staff@johnshopkins.edu"]
        );
    }

    #[test]
    fn resolution_is_deterministic() {
        let resolver = AttributeResolver::new(
            provider(),
            vec![AttributeFilter::Allow {
                names: vec!["urn:oid:2.5.4.42".into()],
            }],
        );
        let first = resolver.resolve("user1:password").unwrap();
        for _ in 0..10 {
            assert_eq!(resolver.resolve("user1:password").unwrap(), first);
        }
        assert_eq!(first.len(), 1);
    }

    #[test]
    fn rename_merges_into_existing() {
        let mut map: AttributeMap = [
            ("a".to_string(), values(&["1"])),
            ("b".to_string(), values(&["2"])),
        ]
        .into_iter()
        .collect();
        AttributeFilter::Rename {
            from: "b".into(),
            to: "a".into(),
        }
        .apply(&mut map);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("a").unwrap(), ["1", "2"]);
    }

    #[test]
    fn map_value_rewrites_matching_values_only() {
        let mut map: AttributeMap = [("affiliation".to_string(), values(&["FACULTY", "member"]))]
            .into_iter()
            .collect();
        AttributeFilter::MapValue {
            name: "affiliation".into(),
            from: "FACULTY".into(),
            to: "faculty".into(),
        }
        .apply(&mut map);
        assert_eq!(map.get("affiliation").unwrap(), ["faculty", "member"]);
    }

    #[test]
    fn deserializes_mixed_values_in_order() {
        let map: AttributeMap =
            serde_json::from_str(r#"{"z": "one", "a": ["two", "three"]}"#).unwrap();
        let names: Vec<_> = map.names().collect();
        assert_eq!(names, ["z", "a"]);
        assert_eq!(map.get("a").unwrap(), ["two", "three"]);
        assert!(serde_json::from_str::<AttributeMap>(r#"{"a": []}"#).is_err());
    }

    #[test]
    fn friendly_names_cover_fixture_oids() {
        assert_eq!(friendly_name("urn:oid:2.5.4.4"), Some("sn"));
        assert_eq!(friendly_name("mail"), None);
    }
}
