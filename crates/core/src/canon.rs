//! Canonical JSON used for identifier computation.
//!
//! Object identifiers hash a JSON description of a stage invocation. Two
//! semantically equal descriptions must hash identically, so the JSON is
//! rendered in a canonical form: object keys sorted bytewise, no whitespace,
//! and serde_json's stable number formatting.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::Result;

/// Render `value` in canonical form.
pub fn to_string(value: &Value) -> Result<String> {
  let mut out = String::new();
  write_value(value, &mut out)?;
  Ok(out)
}

fn write_value(value: &Value, out: &mut String) -> Result<()> {
  match value {
    Value::Null => out.push_str("null"),
    Value::Bool(true) => out.push_str("true"),
    Value::Bool(false) => out.push_str("false"),
    Value::Number(n) => out.push_str(&n.to_string()),
    Value::String(s) => out.push_str(&serde_json::to_string(s)?),
    Value::Array(items) => {
      out.push('[');
      for (i, item) in items.iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        write_value(item, out)?;
      }
      out.push(']');
    }
    Value::Object(map) => {
      // BTreeMap gives the bytewise key order.
      let sorted: BTreeMap<&String, &Value> = map.iter().collect();
      out.push('{');
      for (i, (key, item)) in sorted.into_iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        out.push_str(&serde_json::to_string(key)?);
        out.push(':');
        write_value(item, out)?;
      }
      out.push('}');
    }
  }
  Ok(())
}
