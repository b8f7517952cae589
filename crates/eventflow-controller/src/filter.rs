//! Subscription filter tree.
//!
//! A filter node speaks exactly one dialect. The wire form
//! ([`FilterSpec`]) carries every dialect as an optional field, the way
//! the API receives it; validation converts it into the tagged [`Filter`]
//! variant, rejecting nodes that set more than one dialect or carry empty
//! attribute names/values.
//!
//! `Sql` and `Cel` expressions are validated here only for presence; their
//! evaluation engines are external collaborators.

use std::collections::HashMap;

use eventflow_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Wire-level filter node: all dialects optional, at most one set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterSpec {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub exact: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub prefix: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub suffix: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub contains: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub all: Vec<FilterSpec>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub any: Vec<FilterSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not: Option<Box<FilterSpec>>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sql: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cel: String,
}

/// Validated filter: one dialect per node by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Exact(HashMap<String, String>),
    Prefix(HashMap<String, String>),
    Suffix(HashMap<String, String>),
    Contains(HashMap<String, String>),
    All(Vec<Filter>),
    Any(Vec<Filter>),
    Not(Box<Filter>),
    Sql(String),
    Cel(String),
}

impl FilterSpec {
    fn dialect_count(&self) -> usize {
        usize::from(!self.exact.is_empty())
            + usize::from(!self.prefix.is_empty())
            + usize::from(!self.suffix.is_empty())
            + usize::from(!self.contains.is_empty())
            + usize::from(!self.all.is_empty())
            + usize::from(!self.any.is_empty())
            + usize::from(self.not.is_some())
            + usize::from(!self.sql.is_empty())
            + usize::from(!self.cel.is_empty())
    }

    /// Validate this node and its children into a [`Filter`].
    pub fn validate(&self) -> Result<Filter> {
        match self.dialect_count() {
            0 => {
                return Err(Error::InvalidRequest(
                    "filter must have a dialect".to_string(),
                ))
            }
            1 => {}
            _ => {
                return Err(Error::InvalidRequest(
                    "filters can have only one dialect".to_string(),
                ))
            }
        }
        if !self.exact.is_empty() {
            validate_attributes("exact", &self.exact)?;
            return Ok(Filter::Exact(self.exact.clone()));
        }
        if !self.prefix.is_empty() {
            validate_attributes("prefix", &self.prefix)?;
            return Ok(Filter::Prefix(self.prefix.clone()));
        }
        if !self.suffix.is_empty() {
            validate_attributes("suffix", &self.suffix)?;
            return Ok(Filter::Suffix(self.suffix.clone()));
        }
        if !self.contains.is_empty() {
            validate_attributes("contains", &self.contains)?;
            return Ok(Filter::Contains(self.contains.clone()));
        }
        if !self.all.is_empty() {
            let children = self
                .all
                .iter()
                .map(FilterSpec::validate)
                .collect::<Result<Vec<_>>>()
                .map_err(|e| Error::InvalidRequest(format!("all filter dialect invalid: {e}")))?;
            return Ok(Filter::All(children));
        }
        if !self.any.is_empty() {
            let children = self
                .any
                .iter()
                .map(FilterSpec::validate)
                .collect::<Result<Vec<_>>>()
                .map_err(|e| Error::InvalidRequest(format!("any filter dialect invalid: {e}")))?;
            return Ok(Filter::Any(children));
        }
        if let Some(not) = &self.not {
            let child = not
                .validate()
                .map_err(|e| Error::InvalidRequest(format!("not filter dialect invalid: {e}")))?;
            return Ok(Filter::Not(Box::new(child)));
        }
        if !self.sql.is_empty() {
            return Ok(Filter::Sql(self.sql.clone()));
        }
        Ok(Filter::Cel(self.cel.clone()))
    }
}

/// Validate a list of filter specs; an empty list is allowed and means
/// "no filtering".
pub fn validate_filter_list(specs: &[FilterSpec]) -> Result<Vec<Filter>> {
    specs.iter().map(FilterSpec::validate).collect()
}

fn validate_attributes(dialect: &str, attributes: &HashMap<String, String>) -> Result<()> {
    for (name, value) in attributes {
        if name.is_empty() {
            return Err(Error::InvalidRequest(format!(
                "{dialect} filter dialect attribute name must not be empty"
            )));
        }
        if value.is_empty() {
            return Err(Error::InvalidRequest(format!(
                "{dialect} filter dialect attribute value must not be empty"
            )));
        }
    }
    Ok(())
}

impl Filter {
    /// Evaluate against an event's attribute map. `Sql` and `Cel` nodes
    /// are opaque here and evaluate to `true`; their engines run
    /// elsewhere.
    pub fn evaluate(&self, event: &HashMap<String, String>) -> bool {
        match self {
            Filter::Exact(attrs) => attrs
                .iter()
                .all(|(k, v)| event.get(k).map(|e| e == v).unwrap_or(false)),
            Filter::Prefix(attrs) => attrs
                .iter()
                .all(|(k, v)| event.get(k).map(|e| e.starts_with(v)).unwrap_or(false)),
            Filter::Suffix(attrs) => attrs
                .iter()
                .all(|(k, v)| event.get(k).map(|e| e.ends_with(v)).unwrap_or(false)),
            Filter::Contains(attrs) => attrs
                .iter()
                .all(|(k, v)| event.get(k).map(|e| e.contains(v)).unwrap_or(false)),
            Filter::All(children) => children.iter().all(|f| f.evaluate(event)),
            Filter::Any(children) => children.iter().any(|f| f.evaluate(event)),
            Filter::Not(child) => !child.evaluate(event),
            Filter::Sql(_) | Filter::Cel(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventflow_core::ErrorKind;

    fn attrs(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_single_dialect_validates() {
        let spec = FilterSpec {
            exact: attrs(&[("type", "order.created")]),
            ..FilterSpec::default()
        };
        let filter = spec.validate().unwrap();
        assert_eq!(filter, Filter::Exact(attrs(&[("type", "order.created")])));
    }

    #[test]
    fn test_two_dialects_rejected_with_message() {
        let spec = FilterSpec {
            exact: attrs(&[("type", "a")]),
            prefix: attrs(&[("source", "b")]),
            ..FilterSpec::default()
        };
        let err = spec.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        assert!(err.to_string().contains("filters can have only one dialect"));
    }

    #[test]
    fn test_empty_node_rejected() {
        let err = FilterSpec::default().validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }

    #[test]
    fn test_empty_attribute_name_rejected() {
        let spec = FilterSpec {
            exact: attrs(&[("", "x")]),
            ..FilterSpec::default()
        };
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("attribute name"));
    }

    #[test]
    fn test_empty_attribute_value_rejected() {
        let spec = FilterSpec {
            contains: attrs(&[("subject", "")]),
            ..FilterSpec::default()
        };
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("attribute value"));
    }

    #[test]
    fn test_nested_invalid_child_rejected() {
        let spec = FilterSpec {
            all: vec![
                FilterSpec {
                    exact: attrs(&[("type", "a")]),
                    ..FilterSpec::default()
                },
                FilterSpec {
                    exact: attrs(&[("type", "b")]),
                    cel: "event.type == 'b'".to_string(),
                    ..FilterSpec::default()
                },
            ],
            ..FilterSpec::default()
        };
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("all filter dialect invalid"));
    }

    #[test]
    fn test_not_wraps_child() {
        let spec = FilterSpec {
            not: Some(Box::new(FilterSpec {
                exact: attrs(&[("type", "heartbeat")]),
                ..FilterSpec::default()
            })),
            ..FilterSpec::default()
        };
        let filter = spec.validate().unwrap();

        let heartbeat = attrs(&[("type", "heartbeat")]);
        let order = attrs(&[("type", "order.created")]);
        assert!(!filter.evaluate(&heartbeat));
        assert!(filter.evaluate(&order));
    }

    #[test]
    fn test_evaluate_dialects() {
        let event = attrs(&[
            ("type", "order.created"),
            ("source", "/web/checkout"),
            ("subject", "order-12345"),
        ]);

        assert!(Filter::Exact(attrs(&[("type", "order.created")])).evaluate(&event));
        assert!(!Filter::Exact(attrs(&[("type", "order.paid")])).evaluate(&event));
        assert!(Filter::Prefix(attrs(&[("source", "/web")])).evaluate(&event));
        assert!(Filter::Suffix(attrs(&[("subject", "345")])).evaluate(&event));
        assert!(Filter::Contains(attrs(&[("subject", "-123")])).evaluate(&event));
        assert!(!Filter::Contains(attrs(&[("subject", "xyz")])).evaluate(&event));
        // Missing attribute never matches.
        assert!(!Filter::Exact(attrs(&[("missing", "x")])).evaluate(&event));
    }

    #[test]
    fn test_evaluate_combinators() {
        let event = attrs(&[("type", "order.created"), ("source", "/web/checkout")]);

        let all = Filter::All(vec![
            Filter::Exact(attrs(&[("type", "order.created")])),
            Filter::Prefix(attrs(&[("source", "/web")])),
        ]);
        assert!(all.evaluate(&event));

        let any = Filter::Any(vec![
            Filter::Exact(attrs(&[("type", "order.paid")])),
            Filter::Prefix(attrs(&[("source", "/web")])),
        ]);
        assert!(any.evaluate(&event));

        let none = Filter::Any(vec![
            Filter::Exact(attrs(&[("type", "order.paid")])),
            Filter::Prefix(attrs(&[("source", "/mobile")])),
        ]);
        assert!(!none.evaluate(&event));
    }

    #[test]
    fn test_wire_roundtrip() {
        let json = r#"{"all":[{"exact":{"type":"order.created"}},{"prefix":{"source":"/web"}}]}"#;
        let spec: FilterSpec = serde_json::from_str(json).unwrap();
        let filter = spec.validate().unwrap();
        match &filter {
            Filter::All(children) => assert_eq!(children.len(), 2),
            other => panic!("expected All, got {other:?}"),
        }
        // Serialization drops empty dialects.
        let back = serde_json::to_string(&spec).unwrap();
        assert!(!back.contains("suffix"));
    }

    #[test]
    fn test_multi_dialect_wire_rejected() {
        let json = r#"{"exact":{"type":"a"},"prefix":{"source":"b"}}"#;
        let spec: FilterSpec = serde_json::from_str(json).unwrap();
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("filters can have only one dialect"));
    }

    #[test]
    fn test_validate_filter_list() {
        let specs = vec![
            FilterSpec {
                exact: attrs(&[("type", "a")]),
                ..FilterSpec::default()
            },
            FilterSpec {
                sql: "type = 'a'".to_string(),
                ..FilterSpec::default()
            },
            FilterSpec {
                cel: "event.type == 'a'".to_string(),
                ..FilterSpec::default()
            },
        ];
        let filters = validate_filter_list(&specs).unwrap();
        assert_eq!(filters.len(), 3);
        assert!(matches!(filters[1], Filter::Sql(_)));
        assert!(matches!(filters[2], Filter::Cel(_)));

        assert!(validate_filter_list(&[]).unwrap().is_empty());
    }
}
