// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topic Schema
//!
//! A `TopicSchema` is an ordered list of enumerated attributes. It encodes an
//! attribute map into a topic routing key of one token per field: the letter
//! `A + index` of the value in its field's value list, or a fill token for the
//! fields the map leaves out.
//!
//! ```text
//! schema:   region [us, eu]   priority [low, high]
//! publish   {region: eu}      -> "B._"
//! subscribe {priority: high}  -> "*.B"
//! ```
//!
//! One letter per value limits every field to 26 values. The order of a field's
//! values is its encoding table: reordering it breaks compatibility with keys
//! already in use.

use crate::errors::AmqpError;
use serde::Deserialize;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
};

/// Separator between the tokens of a routing key
pub const DELIM_TOKEN: &str = ".";
/// Most values a single field can encode
pub const MAX_FIELD_VALUES: usize = 26;

const FIRST_LETTER: u8 = b'A';

/// Token written for the fields an attribute map leaves out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FillToken {
    /// `_`: a concrete "don't care" segment of a published key.
    Null,
    /// `*`: the single-segment wildcard of a subscription pattern.
    Any,
}

impl FillToken {
    pub fn as_str(&self) -> &'static str {
        match self {
            FillToken::Null => "_",
            FillToken::Any => "*",
        }
    }

    fn matches(token: &str) -> bool {
        token == FillToken::Null.as_str() || token == FillToken::Any.as_str()
    }
}

impl fmt::Display for FillToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One enumerated attribute of a schema.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SchemaField {
    pub key: String,
    pub values: Vec<String>,
    #[serde(default)]
    pub description: String,
}

impl SchemaField {
    pub fn new(key: &str, values: &[&str], description: &str) -> SchemaField {
        SchemaField {
            key: key.to_owned(),
            values: values.iter().map(|v| (*v).to_owned()).collect(),
            description: description.to_owned(),
        }
    }

    fn position(&self, value: &str) -> Option<usize> {
        self.values.iter().position(|v| v == value)
    }
}

/// An immutable, validated list of schema fields.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "Vec<SchemaField>")]
pub struct TopicSchema {
    fields: Vec<SchemaField>,
    slots: HashMap<String, usize>,
}

impl TopicSchema {
    /// Builds a schema, the field order giving each field its key slot.
    ///
    /// Fails with `InvalidSchemaError` when there are no fields, on duplicate keys,
    /// duplicate values within a field, or a field with no values or more than
    /// `MAX_FIELD_VALUES`.
    pub fn new(fields: Vec<SchemaField>) -> Result<TopicSchema, AmqpError> {
        // an empty schema would encode every message to the empty key
        if fields.is_empty() {
            return Err(AmqpError::InvalidSchemaError(
                "schema has no fields".to_owned(),
            ));
        }

        let mut slots = HashMap::with_capacity(fields.len());

        for (slot, field) in fields.iter().enumerate() {
            if slots.insert(field.key.clone(), slot).is_some() {
                return Err(AmqpError::InvalidSchemaError(format!(
                    "duplicate key \"{}\"",
                    field.key
                )));
            }

            if field.values.is_empty() || field.values.len() > MAX_FIELD_VALUES {
                return Err(AmqpError::InvalidSchemaError(format!(
                    "\"{}\" must have between 1 and {} values, got {}",
                    field.key,
                    MAX_FIELD_VALUES,
                    field.values.len()
                )));
            }

            let mut seen = HashSet::with_capacity(field.values.len());
            if let Some(dup) = field.values.iter().find(|v| !seen.insert(v.as_str())) {
                return Err(AmqpError::InvalidSchemaError(format!(
                    "duplicate value \"{}\" in \"{}\"",
                    dup, field.key
                )));
            }
        }

        Ok(TopicSchema { fields, slots })
    }

    /// Parses the JSON definition format: `[{"key", "values", "description"}]`.
    pub fn from_json(definition: &str) -> Result<TopicSchema, AmqpError> {
        serde_json::from_str(definition).map_err(|err| AmqpError::InvalidSchemaError(err.to_string()))
    }

    /// Number of fields, which is the number of tokens of every key.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &[SchemaField] {
        &self.fields
    }

    pub fn field(&self, key: &str) -> Option<&SchemaField> {
        self.slots.get(key).map(|slot| &self.fields[*slot])
    }

    /// Encodes `attributes` into a key, writing `fill` where no attribute is given.
    ///
    /// Fails with `SchemaViolationError` on the first unknown key or value.
    pub fn encode_key<I, K, V>(&self, attributes: I, fill: FillToken) -> Result<String, AmqpError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut tokens = vec![fill.as_str().to_owned(); self.fields.len()];

        for (key, value) in attributes {
            let (key, value) = (key.as_ref(), value.as_ref());

            let Some(slot) = self.slots.get(key).copied() else {
                return Err(AmqpError::SchemaViolationError(format!(
                    "no key \"{}\" in schema",
                    key
                )));
            };

            let Some(position) = self.fields[slot].position(value) else {
                return Err(AmqpError::SchemaViolationError(format!(
                    "no value \"{}\" in \"{}\"",
                    value, key
                )));
            };

            tokens[slot] = letter(position).to_string();
        }

        Ok(tokens.join(DELIM_TOKEN))
    }

    /// Recovers the attributes encoded in a key or pattern; fill tokens are skipped.
    pub fn decode_key(&self, key: &str) -> Result<BTreeMap<String, String>, AmqpError> {
        let tokens: Vec<&str> = key.split(DELIM_TOKEN).collect();

        if tokens.len() != self.fields.len() {
            return Err(AmqpError::SchemaViolationError(format!(
                "key \"{}\" has {} tokens, schema has {} fields",
                key,
                tokens.len(),
                self.fields.len()
            )));
        }

        let mut attributes = BTreeMap::new();

        for (field, token) in self.fields.iter().zip(tokens) {
            if FillToken::matches(token) {
                continue;
            }

            let value = position(token)
                .and_then(|position| field.values.get(position))
                .ok_or_else(|| {
                    AmqpError::SchemaViolationError(format!(
                        "invalid token \"{}\" for \"{}\"",
                        token, field.key
                    ))
                })?;

            attributes.insert(field.key.clone(), value.clone());
        }

        Ok(attributes)
    }
}

impl TryFrom<Vec<SchemaField>> for TopicSchema {
    type Error = AmqpError;

    fn try_from(fields: Vec<SchemaField>) -> Result<Self, Self::Error> {
        TopicSchema::new(fields)
    }
}

fn letter(position: usize) -> char {
    // positions are bounded by MAX_FIELD_VALUES at construction
    char::from(FIRST_LETTER + position as u8)
}

fn position(token: &str) -> Option<usize> {
    match token.as_bytes() {
        [byte] if byte.is_ascii_uppercase() => Some(usize::from(byte - FIRST_LETTER)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> TopicSchema {
        TopicSchema::new(vec![
            SchemaField::new("region", &["us", "eu"], "deployment region"),
            SchemaField::new("priority", &["low", "high"], ""),
        ])
        .unwrap()
    }

    /// Topic matching restricted to `*`, which is all the encoder emits.
    fn matches(pattern: &str, key: &str) -> bool {
        let pattern: Vec<&str> = pattern.split('.').collect();
        let key: Vec<&str> = key.split('.').collect();
        pattern.len() == key.len() && pattern.iter().zip(key).all(|(p, k)| *p == "*" || *p == k)
    }

    #[test]
    fn encodes_documented_example() {
        let schema = schema();

        assert_eq!(
            schema.encode_key([("region", "eu")], FillToken::Null).unwrap(),
            "B._"
        );
        assert_eq!(
            schema.encode_key([("priority", "high")], FillToken::Any).unwrap(),
            "*.B"
        );
        assert_eq!(
            schema
                .encode_key([("priority", "low"), ("region", "us")], FillToken::Null)
                .unwrap(),
            "A.A"
        );
    }

    #[test]
    fn empty_attributes_fill_every_slot() {
        let schema = schema();
        let none: [(&str, &str); 0] = [];

        assert_eq!(schema.encode_key(none, FillToken::Null).unwrap(), "_._");
        assert_eq!(schema.encode_key(none, FillToken::Any).unwrap(), "*.*");
    }

    #[test]
    fn encoding_is_deterministic() {
        let schema = schema();
        let attributes = HashMap::from([
            ("region".to_owned(), "eu".to_owned()),
            ("priority".to_owned(), "high".to_owned()),
        ]);

        let first = schema.encode_key(&attributes, FillToken::Null).unwrap();
        let second = schema.encode_key(&attributes, FillToken::Null).unwrap();

        assert_eq!(first, "B.B");
        assert_eq!(first, second);
    }

    #[test]
    fn rejects_unknown_keys_and_values() {
        let schema = schema();

        assert_eq!(
            schema.encode_key([("color", "red")], FillToken::Null),
            Err(AmqpError::SchemaViolationError(
                "no key \"color\" in schema".to_owned()
            ))
        );
        assert_eq!(
            schema.encode_key([("region", "eu"), ("priority", "urgent")], FillToken::Any),
            Err(AmqpError::SchemaViolationError(
                "no value \"urgent\" in \"priority\"".to_owned()
            ))
        );
    }

    #[test]
    fn publish_keys_match_subscribe_patterns_of_subsets() {
        let schema = schema();

        for region in ["us", "eu"] {
            for priority in ["low", "high"] {
                let key = schema
                    .encode_key([("region", region), ("priority", priority)], FillToken::Null)
                    .unwrap();

                let subsets: [Vec<(&str, &str)>; 4] = [
                    vec![],
                    vec![("region", region)],
                    vec![("priority", priority)],
                    vec![("region", region), ("priority", priority)],
                ];

                for subset in subsets {
                    let pattern = schema.encode_key(subset, FillToken::Any).unwrap();
                    assert!(matches(&pattern, &key), "{} should match {}", pattern, key);
                }
            }
        }
    }

    #[test]
    fn last_letter_is_z() {
        let values: Vec<String> = (0..MAX_FIELD_VALUES).map(|i| format!("v{}", i)).collect();
        let values: Vec<&str> = values.iter().map(String::as_str).collect();
        let schema = TopicSchema::new(vec![SchemaField::new("shard", &values, "")]).unwrap();

        assert_eq!(schema.encode_key([("shard", "v0")], FillToken::Null).unwrap(), "A");
        assert_eq!(schema.encode_key([("shard", "v25")], FillToken::Null).unwrap(), "Z");
    }

    #[test]
    fn validates_schema_definition() {
        let too_many: Vec<String> = (0..=MAX_FIELD_VALUES).map(|i| i.to_string()).collect();
        let too_many: Vec<&str> = too_many.iter().map(String::as_str).collect();

        let invalid = [
            vec![
                SchemaField::new("region", &["us"], ""),
                SchemaField::new("region", &["eu"], ""),
            ],
            vec![SchemaField::new("region", &["us", "us"], "")],
            vec![SchemaField::new("region", &[], "")],
            vec![SchemaField::new("region", &too_many, "")],
        ];

        for fields in invalid {
            assert!(matches!(
                TopicSchema::new(fields),
                Err(AmqpError::InvalidSchemaError(_))
            ));
        }

        assert_eq!(
            TopicSchema::new(vec![]),
            Err(AmqpError::InvalidSchemaError(
                "schema has no fields".to_owned()
            ))
        );
        assert!(matches!(
            TopicSchema::from_json("[]"),
            Err(AmqpError::InvalidSchemaError(_))
        ));
    }

    #[test]
    fn parses_json_definition() {
        let schema = TopicSchema::from_json(
            r#"[
                {"key": "region", "values": ["us", "eu"], "description": "deployment region"},
                {"key": "priority", "values": ["low", "high"]}
            ]"#,
        )
        .unwrap();

        assert_eq!(schema, self::schema());
        assert_eq!(schema.len(), 2);
        assert_eq!(
            schema.field("region").map(|f| f.description.as_str()),
            Some("deployment region")
        );

        assert!(matches!(
            TopicSchema::from_json(r#"[{"key": "a", "values": ["x", "x"]}]"#),
            Err(AmqpError::InvalidSchemaError(_))
        ));
    }

    #[test]
    fn decodes_keys_and_patterns() {
        let schema = schema();

        assert_eq!(
            schema.decode_key("B._").unwrap(),
            BTreeMap::from([("region".to_owned(), "eu".to_owned())])
        );
        assert_eq!(
            schema.decode_key("*.B").unwrap(),
            BTreeMap::from([("priority".to_owned(), "high".to_owned())])
        );
        assert!(schema.decode_key("_._").unwrap().is_empty());

        for malformed in ["B", "B._.A", "C._", "b._", "AB._", "#._"] {
            assert!(
                matches!(
                    schema.decode_key(malformed),
                    Err(AmqpError::SchemaViolationError(_))
                ),
                "{} should be rejected",
                malformed
            );
        }
    }
}
