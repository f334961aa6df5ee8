//! Identity key resolution.
//!
//! A record's identity is the first present of its external id, namespace,
//! and human name, trimmed and lower-cased. Namespace and name keys are
//! scoped by the owning entity (a plugin's marketplace) because they are only
//! unique within it; external ids are global.

use crate::error::RecordError;
use crate::models::RawRecord;

/// Trim and lower-case a key component. Empty values are absent.
pub fn normalize(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_lowercase())
    }
}

/// Normalized lookup values of one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordKeys {
    pub ext: Option<String>,
    pub ns: Option<String>,
    pub name: Option<String>,
    pub scope: String,
}

/// Strength of an identity key. Higher wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum KeyRank {
    Name = 1,
    Namespace = 2,
    External = 3,
}

impl KeyRank {
    /// Rank of a rendered key as stored in `entities.identity_key`.
    pub fn of_rendered(key: &str) -> KeyRank {
        if key.starts_with("id:") {
            KeyRank::External
        } else if key.starts_with("ns:") {
            KeyRank::Namespace
        } else {
            KeyRank::Name
        }
    }
}

impl RecordKeys {
    pub fn from_record(record: &RawRecord, scope: &str) -> Result<Self, RecordError> {
        let keys = Self {
            ext: record.external_id.as_deref().and_then(normalize),
            ns: record.namespace.as_deref().and_then(normalize),
            name: record.name.as_deref().and_then(normalize),
            scope: scope.to_string(),
        };
        if keys.ext.is_none() && keys.ns.is_none() && keys.name.is_none() {
            return Err(RecordError::MissingIdentity);
        }
        Ok(keys)
    }

    pub fn rank(&self) -> KeyRank {
        if self.ext.is_some() {
            KeyRank::External
        } else if self.ns.is_some() {
            KeyRank::Namespace
        } else {
            KeyRank::Name
        }
    }

    /// The rendered primary identity key.
    pub fn render(&self) -> String {
        if let Some(ext) = &self.ext {
            return format!("id:{}", ext);
        }
        let (prefix, value) = match (&self.ns, &self.name) {
            (Some(ns), _) => ("ns", ns.as_str()),
            (None, Some(name)) => ("name", name.as_str()),
            // unreachable through from_record
            (None, None) => ("name", ""),
        };
        if self.scope.is_empty() {
            format!("{}:{}", prefix, value)
        } else {
            format!("{}:{}/{}", prefix, self.scope, value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ext: Option<&str>, ns: Option<&str>, name: Option<&str>) -> RawRecord {
        RawRecord {
            external_id: ext.map(String::from),
            namespace: ns.map(String::from),
            name: name.map(String::from),
            ..Default::default()
        }
    }

    #[test]
    fn external_id_wins_over_namespace_and_name() {
        let keys = RecordKeys::from_record(
            &record(Some(" ABC-1 "), Some("acme/tools"), Some("Tools")),
            "",
        )
        .unwrap();
        assert_eq!(keys.render(), "id:abc-1");
        assert_eq!(keys.rank(), KeyRank::External);
    }

    #[test]
    fn namespace_then_name_with_scope() {
        let ns = RecordKeys::from_record(&record(None, Some("Acme/Lint"), Some("Lint")), "m1")
            .unwrap();
        assert_eq!(ns.render(), "ns:m1/acme/lint");

        let name = RecordKeys::from_record(&record(None, Some("  "), Some("Lint")), "").unwrap();
        assert_eq!(name.render(), "name:lint");
        assert_eq!(name.rank(), KeyRank::Name);
    }

    #[test]
    fn external_ids_ignore_scope() {
        let keys = RecordKeys::from_record(&record(Some("p-9"), None, None), "m1").unwrap();
        assert_eq!(keys.render(), "id:p-9");
    }

    #[test]
    fn empty_identity_is_a_record_error() {
        let err = RecordKeys::from_record(&record(Some(""), None, Some("   ")), "").unwrap_err();
        assert_eq!(err, RecordError::MissingIdentity);
    }

    #[test]
    fn rank_of_rendered_keys() {
        assert_eq!(KeyRank::of_rendered("id:x"), KeyRank::External);
        assert_eq!(KeyRank::of_rendered("ns:x"), KeyRank::Namespace);
        assert_eq!(KeyRank::of_rendered("name:x"), KeyRank::Name);
    }
}
