use serde_json::Value;

use crate::config::NETWORK_ARRAY_KEYS;

/// Nesting levels searched for a known array key (e.g. `{"data":{"content":[...]}}`).
const MAX_ARRAY_DEPTH: usize = 3;

/// Returns the raw `Authorization` value when it uses the bearer scheme.
/// Header names are compared case-insensitively.
pub fn bearer_header<'a, I>(headers: I) -> Option<&'a str>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    headers
        .into_iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("authorization"))
        .map(|(_, value)| value.trim())
        .filter(|value| is_bearer(value))
}

fn is_bearer(value: &str) -> bool {
    value.len() > "bearer ".len()
        && value
            .get(..7)
            .is_some_and(|scheme| scheme.eq_ignore_ascii_case("bearer "))
}

/// True if `url` targets one of the known operation query endpoints.
pub fn matches_query_path(url: &str, query_paths: &[String]) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    query_paths.iter().any(|p| path.contains(p.as_str()))
}

/// Finds the operation array in a response body, tolerating schema drift:
/// a bare array, or an array under any known key, possibly nested.
pub fn operation_batch(body: &Value) -> Option<&Vec<Value>> {
    find_array(body, 0)
}

fn find_array(value: &Value, depth: usize) -> Option<&Vec<Value>> {
    match value {
        Value::Array(items) if depth == 0 => Some(items),
        Value::Object(map) if depth < MAX_ARRAY_DEPTH => {
            for key in NETWORK_ARRAY_KEYS {
                match map.get(*key) {
                    Some(Value::Array(items)) => return Some(items),
                    Some(nested @ Value::Object(_)) => {
                        if let Some(items) = find_array(nested, depth + 1) {
                            return Some(items);
                        }
                    }
                    _ => {}
                }
            }
            None
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bearer_header_is_case_insensitive() {
        let headers = [("Content-Type", "application/json"), ("authorization", "Bearer abc123")];
        assert_eq!(bearer_header(headers), Some("Bearer abc123"));

        let headers = [("AUTHORIZATION", "bearer xyz")];
        assert_eq!(bearer_header(headers), Some("bearer xyz"));
    }

    #[test]
    fn non_bearer_schemes_are_ignored() {
        assert_eq!(bearer_header([("Authorization", "Basic dXNlcjpwYXNz")]), None);
        assert_eq!(bearer_header([("Authorization", "Bearer ")]), None);
        assert_eq!(bearer_header([("X-Other", "Bearer abc")]), None);
    }

    #[test]
    fn query_path_ignores_query_string() {
        let paths = vec!["/p2p/operations".to_string()];
        assert!(matches_query_path("https://x.test/api/p2p/operations?page=1", &paths));
        assert!(!matches_query_path("https://x.test/api/profile?next=/p2p/operations", &paths));
    }

    #[test]
    fn operation_batch_tolerates_schema_drift() {
        assert_eq!(operation_batch(&json!([{"id": 1}])).map(Vec::len), Some(1));
        assert_eq!(operation_batch(&json!({"operations": [{}, {}]})).map(Vec::len), Some(2));
        assert_eq!(operation_batch(&json!({"data": {"content": [{}]}})).map(Vec::len), Some(1));
        assert!(operation_batch(&json!({"unexpected": []})).is_none());
        assert!(operation_batch(&json!("text")).is_none());
    }
}
