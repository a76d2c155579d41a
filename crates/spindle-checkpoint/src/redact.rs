//! Secret redaction for recorded props and outputs.

use serde_json::Value;

/// Placeholder written in place of secret values.
pub const SECRET_PLACEHOLDER: &str = "[secret]";

/// Secrets shorter than this are only masked where a string equals them
/// exactly; longer ones are masked wherever they occur.
pub const MIN_SUBSTRING_SECRET_LEN: usize = 4;

/// Replace the values of `secret_keys` (at any depth) with the placeholder.
///
/// Returns the redacted props and every string found under a secret key, so
/// the caller can mask those strings if they later appear in an output.
pub fn redact_props(props: &Value, secret_keys: &[String]) -> (Value, Vec<String>) {
  let mut found = Vec::new();
  let redacted = redact_value(props, secret_keys, &mut found);
  (redacted, found)
}

fn redact_value(value: &Value, secret_keys: &[String], found: &mut Vec<String>) -> Value {
  match value {
    Value::Object(map) => Value::Object(
      map
        .iter()
        .map(|(key, item)| {
          if secret_keys.iter().any(|secret| secret == key) {
            collect_strings(item, found);
            (key.clone(), Value::String(SECRET_PLACEHOLDER.to_string()))
          } else {
            (key.clone(), redact_value(item, secret_keys, found))
          }
        })
        .collect(),
    ),
    Value::Array(items) => Value::Array(
      items
        .iter()
        .map(|item| redact_value(item, secret_keys, found))
        .collect(),
    ),
    other => other.clone(),
  }
}

fn collect_strings(value: &Value, found: &mut Vec<String>) {
  match value {
    Value::String(s) if !s.is_empty() => found.push(s.clone()),
    Value::Array(items) => items.iter().for_each(|item| collect_strings(item, found)),
    Value::Object(map) => map.values().for_each(|item| collect_strings(item, found)),
    _ => {}
  }
}

/// Mask occurrences of secret strings inside `value`.
///
/// See [`MIN_SUBSTRING_SECRET_LEN`] for how short secrets are treated.
pub fn mask_secrets(value: &Value, secrets: &[String]) -> Value {
  if secrets.is_empty() {
    return value.clone();
  }
  match value {
    Value::String(s) => {
      if secrets.iter().any(|secret| secret == s) {
        return Value::String(SECRET_PLACEHOLDER.to_string());
      }
      let mut masked = s.clone();
      for secret in secrets {
        if secret.chars().count() >= MIN_SUBSTRING_SECRET_LEN && masked.contains(secret.as_str()) {
          masked = masked.replace(secret.as_str(), SECRET_PLACEHOLDER);
        }
      }
      Value::String(masked)
    }
    Value::Array(items) => Value::Array(items.iter().map(|item| mask_secrets(item, secrets)).collect()),
    Value::Object(map) => Value::Object(
      map
        .iter()
        .map(|(key, item)| (key.clone(), mask_secrets(item, secrets)))
        .collect(),
    ),
    other => other.clone(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_redacts_nested_secret_keys() {
    let props = json!({
      "prompt": "hi",
      "auth": { "apiKey": "sk-123", "region": "us" },
    });
    let (redacted, found) = redact_props(&props, &["apiKey".to_string()]);

    assert_eq!(redacted["auth"]["apiKey"], SECRET_PLACEHOLDER);
    assert_eq!(redacted["auth"]["region"], "us");
    assert_eq!(redacted["prompt"], "hi");
    assert_eq!(found, vec!["sk-123".to_string()]);
  }

  #[test]
  fn test_masks_secrets_in_output() {
    let output = json!({ "echo": "key was sk-123", "n": 3 });
    let masked = mask_secrets(&output, &["sk-123".to_string()]);

    assert_eq!(masked["echo"], "key was [secret]");
    assert_eq!(masked["n"], 3);
  }

  #[test]
  fn test_short_secrets_only_mask_exact_matches() {
    let secrets = vec!["1".to_string(), "a".to_string()];
    let output = json!({ "summary": "10 items in a batch", "code": "1", "flag": "a" });
    let masked = mask_secrets(&output, &secrets);

    assert_eq!(masked["summary"], "10 items in a batch");
    assert_eq!(masked["code"], SECRET_PLACEHOLDER);
    assert_eq!(masked["flag"], SECRET_PLACEHOLDER);
  }
}
