use std::collections::HashMap;

use http::HeaderMap;

/// All query parameters of a raw query string as a map. The first
/// occurrence of a repeated parameter wins.
pub fn query_map(query: Option<&str>) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Some(query) = query {
        for pair in query.split('&') {
            let (k, v) = match pair.split_once('=') {
                Some((k, v)) => (k, v),
                None => (pair, ""),
            };
            if !k.is_empty() {
                map.entry(k.to_string()).or_insert_with(|| v.trim().to_string());
            }
        }
    }
    map
}

/// Header lookup on a plain header map. Returns `None` when the header is
/// absent or its value is not valid UTF-8.
pub fn get_header_value<'a>(headers: &'a HeaderMap, key: &str) -> Option<&'a str> {
    headers.get(key).and_then(|value| value.to_str().ok())
}
