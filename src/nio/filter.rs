//! Packet filters attached to a link.
//!
//! Filters are opaque to the compute core: a filter is a type name (`delay`,
//! `packet_loss`, `frequency_drop`, `corrupt`, `bpf`...) plus its arguments,
//! handed to the bridge helper unchanged. On the wire they are a JSON object
//! whose key order is the application order, so (de)serialization keeps the
//! order rather than going through a sorted map.

use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// One named filter with its arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct NioFilter {
    /// Filter type understood by the bridge helper.
    pub kind: String,
    /// Arguments in order.
    pub args: Vec<Value>,
}

impl NioFilter {
    /// Create a filter.
    pub fn new(kind: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            kind: kind.into(),
            args,
        }
    }

    /// Whether the filter does anything.
    ///
    /// A filter with no arguments, or only zero/empty arguments, is how
    /// controllers express "filter disabled".
    pub fn is_active(&self) -> bool {
        self.args.iter().any(|arg| match arg {
            Value::Null => false,
            Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
            Value::String(s) => !s.trim().is_empty(),
            Value::Bool(b) => *b,
            _ => true,
        })
    }

    /// Arguments rendered for the helper command line.
    ///
    /// BPF expressions are quoted as one argument; everything else is joined
    /// with spaces.
    pub fn command_args(&self) -> String {
        let rendered: Vec<String> = self.args.iter().map(render_arg).collect();
        if self.kind == "bpf" {
            let expr = rendered.join(" ").replace('"', "\\\"");
            format!("\"{expr}\"")
        } else {
            rendered.join(" ")
        }
    }
}

fn render_arg(arg: &Value) -> String {
    match arg {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Ordered filter list with JSON object (de)serialization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NioFilters(pub Vec<NioFilter>);

impl NioFilters {
    /// Filters that are switched on, in order.
    pub fn active(&self) -> impl Iterator<Item = &NioFilter> {
        self.0.iter().filter(|f| f.is_active())
    }

    /// Whether no filter is configured.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of configured filters.
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl From<Vec<NioFilter>> for NioFilters {
    fn from(filters: Vec<NioFilter>) -> Self {
        Self(filters)
    }
}

impl Serialize for NioFilters {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for filter in &self.0 {
            map.serialize_entry(&filter.kind, &filter.args)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for NioFilters {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FiltersVisitor;

        impl<'de> Visitor<'de> for FiltersVisitor {
            type Value = NioFilters;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of filter name to argument list")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<NioFilters, A::Error> {
                let mut filters = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((kind, value)) = access.next_entry::<String, Value>()? {
                    let args = match value {
                        Value::Array(items) => items,
                        Value::Null => Vec::new(),
                        single => vec![single],
                    };
                    filters.push(NioFilter { kind, args });
                }
                Ok(NioFilters(filters))
            }

            fn visit_unit<E: serde::de::Error>(self) -> Result<NioFilters, E> {
                Ok(NioFilters::default())
            }
        }

        deserializer.deserialize_any(FiltersVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_order_is_preserved() {
        let filters: NioFilters = serde_json::from_str(
            r#"{"packet_loss": [10], "delay": [50, 10], "corrupt": [5]}"#,
        )
        .unwrap();

        let kinds: Vec<&str> = filters.0.iter().map(|f| f.kind.as_str()).collect();
        assert_eq!(kinds, vec!["packet_loss", "delay", "corrupt"]);

        let back = serde_json::to_string(&filters).unwrap();
        assert_eq!(back, r#"{"packet_loss":[10],"delay":[50,10],"corrupt":[5]}"#);
    }

    #[test]
    fn test_inactive_filters() {
        assert!(!NioFilter::new("delay", vec![json!(0), json!(0)]).is_active());
        assert!(!NioFilter::new("bpf", vec![json!("  ")]).is_active());
        assert!(!NioFilter::new("delay", vec![]).is_active());
        assert!(NioFilter::new("delay", vec![json!(0), json!(5)]).is_active());
    }

    #[test]
    fn test_command_args() {
        assert_eq!(
            NioFilter::new("delay", vec![json!(50), json!(10)]).command_args(),
            "50 10"
        );
        assert_eq!(
            NioFilter::new("bpf", vec![json!("icmp and host 10.0.0.1")]).command_args(),
            "\"icmp and host 10.0.0.1\""
        );
    }

    #[test]
    fn test_scalar_argument_is_wrapped() {
        let filters: NioFilters = serde_json::from_str(r#"{"frequency_drop": 5}"#).unwrap();
        assert_eq!(filters.0[0].args, vec![json!(5)]);
    }
}
