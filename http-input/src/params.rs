use std::collections::HashMap;

use percent_encoding::percent_decode;

/// Request parameters: the query string, later merged with form fields.
///
/// Values stay raw bytes, a `msgpack` form field is binary and must not go
/// through UTF-8 decoding.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Params(HashMap<String, Vec<u8>>);

impl Params {
    /// Parses `application/x-www-form-urlencoded` data, the last occurrence of a key wins.
    pub fn parse(input: &[u8]) -> Params {
        let mut params = Params::default();
        for pair in input.split(|b| *b == b'&') {
            if pair.is_empty() {
                continue;
            }
            let (key, value) = match pair.iter().position(|b| *b == b'=') {
                Some(idx) => (&pair[..idx], &pair[idx + 1..]),
                None => (pair, &b""[..]),
            };
            let key = String::from_utf8_lossy(&decode_component(key)).into_owned();
            params.insert(key, decode_component(value));
        }
        params
    }

    pub fn insert(&mut self, key: String, value: Vec<u8>) {
        self.0.insert(key, value);
    }

    /// Later values override existing keys.
    pub fn merge(&mut self, other: Params) {
        self.0.extend(other.0);
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.0.get(key).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn decode_component(raw: &[u8]) -> Vec<u8> {
    let spaced: Vec<u8> = raw
        .iter()
        .map(|b| if *b == b'+' { b' ' } else { *b })
        .collect();
    percent_decode(&spaced).collect()
}
