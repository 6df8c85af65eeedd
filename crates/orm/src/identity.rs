//! Tagged identifiers
//!
//! A raw primary-key value paired with the tag of its entity type, so that ids
//! from different tables never collide as registry or batch keys.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{OrmError, OrmResult};
use crate::value::DatabaseValue;

/// Primary key tagged with its entity type, e.g. `a:1`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaggedId {
    tag: String,
    raw: String,
}

impl TaggedId {
    pub fn new(tag: impl Into<String>, raw: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            raw: raw.into(),
        }
    }

    /// Tag an untagged value coming out of a row
    pub fn from_value(tag: &str, value: &DatabaseValue) -> OrmResult<Self> {
        value
            .to_key_string()
            .map(|raw| Self::new(tag, raw))
            .ok_or_else(|| OrmError::InvalidId(format!("{:?} cannot be used as a '{}' id", value, tag)))
    }

    /// Accept either a tagged (`a:1`) or bare (`1`) id for the expected tag
    pub fn parse_for(tag: &str, input: &str) -> OrmResult<Self> {
        match input.split_once(':') {
            Some((found, raw)) if found == tag => Ok(Self::new(tag, raw)),
            Some((found, _)) => Err(OrmError::InvalidId(format!(
                "expected a '{}' id but got tag '{}' in '{}'",
                tag, found, input
            ))),
            None if input.is_empty() => Err(OrmError::InvalidId("empty id".into())),
            None => Ok(Self::new(tag, input)),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tag == tag
    }
}

impl fmt::Display for TaggedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tag, self.raw)
    }
}

impl FromStr for TaggedId {
    type Err = OrmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((tag, raw)) if !tag.is_empty() && !raw.is_empty() => Ok(Self::new(tag, raw)),
            _ => Err(OrmError::InvalidId(format!("'{}' is not a tagged id", s))),
        }
    }
}

/// Column type of a primary key. Decides how the raw part of a [`TaggedId`]
/// is written back to the database and what its canonical spelling is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum KeyKind {
    #[default]
    Integer,
    Text,
    Uuid,
}

impl KeyKind {
    /// Kind for a SQL column type name
    pub fn from_data_type(data_type: &str) -> Self {
        match data_type.to_ascii_lowercase().as_str() {
            "int" | "int2" | "int4" | "int8" | "integer" | "smallint" | "bigint" | "serial"
            | "bigserial" | "smallserial" => KeyKind::Integer,
            "uuid" => KeyKind::Uuid,
            _ => KeyKind::Text,
        }
    }

    /// The untagged value as it is stored in the database
    pub fn value_of(self, id: &TaggedId) -> OrmResult<DatabaseValue> {
        let raw = id.raw();
        match self {
            KeyKind::Integer => raw
                .parse::<i64>()
                .map(DatabaseValue::Int64)
                .map_err(|_| OrmError::InvalidId(format!("{} does not have an integer key", id))),
            KeyKind::Uuid => Uuid::parse_str(raw)
                .map(DatabaseValue::Uuid)
                .map_err(|_| OrmError::InvalidId(format!("{} does not have a uuid key", id))),
            KeyKind::Text => Ok(DatabaseValue::String(raw.to_string())),
        }
    }

    /// Rewrite `id` so that every spelling of one key compares equal
    /// (`a:01` becomes `a:1`)
    pub fn canonical(self, id: TaggedId) -> OrmResult<TaggedId> {
        match self {
            KeyKind::Text => Ok(id),
            _ => {
                let value = self.value_of(&id)?;
                TaggedId::from_value(id.tag(), &value)
            }
        }
    }
}

/// Strip tags from a batch of ids, checking they all belong to `tag`
pub fn untag_all(tag: &str, kind: KeyKind, ids: &[TaggedId]) -> OrmResult<Vec<DatabaseValue>> {
    ids.iter()
        .map(|id| {
            if id.has_tag(tag) {
                kind.value_of(id)
            } else {
                Err(OrmError::InvalidId(format!("{} is not a '{}' id", id, tag)))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_needs_both_parts() {
        assert_eq!(TaggedId::new("a", "1"), TaggedId::new("a", "1"));
        assert_ne!(TaggedId::new("a", "1"), TaggedId::new("b", "1"));
        assert_ne!(TaggedId::new("a", "1"), TaggedId::new("a", "2"));
    }

    #[test]
    fn test_display_and_parse() {
        let id: TaggedId = "a:12".parse().unwrap();
        assert_eq!(id.tag(), "a");
        assert_eq!(id.raw(), "12");
        assert_eq!(id.to_string(), "a:12");
        assert!("12".parse::<TaggedId>().is_err());
        assert!(":12".parse::<TaggedId>().is_err());
    }

    #[test]
    fn test_parse_for_expected_tag() {
        assert_eq!(TaggedId::parse_for("a", "4").unwrap(), TaggedId::new("a", "4"));
        assert_eq!(TaggedId::parse_for("a", "a:4").unwrap(), TaggedId::new("a", "4"));
        assert!(TaggedId::parse_for("a", "b:4").is_err());
        assert!(TaggedId::parse_for("a", "").is_err());
    }

    #[test]
    fn test_value_follows_key_kind() {
        let id = TaggedId::new("a", "007");
        assert_eq!(KeyKind::Integer.value_of(&id).unwrap(), DatabaseValue::Int64(7));
        assert_eq!(KeyKind::Text.value_of(&id).unwrap(), DatabaseValue::String("007".into()));
        assert!(KeyKind::Uuid.value_of(&id).is_err());
        assert!(KeyKind::Integer.value_of(&TaggedId::new("a", "abc")).is_err());

        let uuid = Uuid::new_v4();
        assert_eq!(
            KeyKind::Uuid.value_of(&TaggedId::new("a", uuid.to_string())).unwrap(),
            DatabaseValue::Uuid(uuid)
        );
    }

    #[test]
    fn test_canonical_spelling() {
        assert_eq!(
            KeyKind::Integer.canonical(TaggedId::new("a", "01")).unwrap(),
            TaggedId::new("a", "1")
        );
        assert_eq!(
            KeyKind::Text.canonical(TaggedId::new("c", "007")).unwrap(),
            TaggedId::new("c", "007")
        );
        let uuid = Uuid::new_v4();
        let upper = TaggedId::new("u", uuid.to_string().to_uppercase());
        assert_eq!(
            KeyKind::Uuid.canonical(upper).unwrap(),
            TaggedId::new("u", uuid.to_string())
        );
    }

    #[test]
    fn test_kind_from_column_type() {
        assert_eq!(KeyKind::from_data_type("BIGINT"), KeyKind::Integer);
        assert_eq!(KeyKind::from_data_type("uuid"), KeyKind::Uuid);
        assert_eq!(KeyKind::from_data_type("varchar"), KeyKind::Text);
    }

    #[test]
    fn test_from_value() {
        let id = TaggedId::from_value("b", &DatabaseValue::Int32(3)).unwrap();
        assert_eq!(id, TaggedId::new("b", "3"));
        assert!(TaggedId::from_value("b", &DatabaseValue::Null).is_err());
    }

    #[test]
    fn test_untag_all_rejects_foreign_tags() {
        let ids = vec![TaggedId::new("a", "1"), TaggedId::new("a", "2")];
        assert_eq!(
            untag_all("a", KeyKind::Integer, &ids).unwrap(),
            vec![DatabaseValue::Int64(1), DatabaseValue::Int64(2)]
        );
        assert_eq!(
            untag_all("a", KeyKind::Text, &ids).unwrap(),
            vec![DatabaseValue::from("1"), DatabaseValue::from("2")]
        );
        let mixed = vec![TaggedId::new("a", "1"), TaggedId::new("b", "2")];
        assert!(untag_all("a", KeyKind::Integer, &mixed).is_err());
    }
}
