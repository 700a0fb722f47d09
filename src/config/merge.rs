//! Field-by-field merging of configuration tiers.

use serde_json::Value;

/// Merge `overlay` onto `base`.
///
/// Objects merge key by key. A `null` in the overlay means "not specified"
/// and keeps the base value. Anything else in the overlay replaces the base,
/// arrays included.
///
/// ```
/// use serde_json::json;
/// use task_relay::config::deep_merge;
///
/// let base = json!({"server": {"port": 8000, "bind": "127.0.0.1"}});
/// let overlay = json!({"server": {"port": 9000}});
/// assert_eq!(
///     deep_merge(base, overlay),
///     json!({"server": {"port": 9000, "bind": "127.0.0.1"}})
/// );
/// ```
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => overlay_value,
                };
                base_map.insert(key, merged);
            }
            Value::Object(base_map)
        }
        (base, Value::Null) => base,
        (_, overlay) => overlay,
    }
}

/// Fold [`deep_merge`] over tiers given lowest priority first.
pub fn deep_merge_all(values: impl IntoIterator<Item = Value>) -> Value {
    values.into_iter().fold(Value::Null, deep_merge)
}
