//! Dotted path access into JSON values.
//!
//! Paths are keys separated by `.` with optional `[n]` array indices, for
//! example `users[2].address.city`. A missing or empty path addresses the
//! whole value.

use serde_json::{Map, Value};
use tracing::warn;

/// A write may extend an array by at most this many slots.
const MAX_ARRAY_GROWTH: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Key(String),
    Index(usize),
}

fn tokenize(path: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    for part in path.split('.') {
        let mut rest = part;
        // A key may be followed by any number of `[n]` suffixes.
        let key_end = rest.find('[').unwrap_or(rest.len());
        if key_end > 0 {
            tokens.push(Token::Key(rest[..key_end].to_string()));
        }
        rest = &rest[key_end..];
        while let Some(open) = rest.strip_prefix('[') {
            let Some(close) = open.find(']') else {
                tokens.push(Token::Key(rest.to_string()));
                break;
            };
            match open[..close].trim().parse::<usize>() {
                Ok(index) => tokens.push(Token::Index(index)),
                Err(_) => tokens.push(Token::Key(open[..close].to_string())),
            }
            rest = &open[close + 1..];
        }
    }
    tokens
}

/// Returns a copy of the value at `path`, or `None` if it does not exist.
pub fn get(data: &Value, path: Option<&str>) -> Option<Value> {
    let Some(path) = path.filter(|p| !p.is_empty()) else {
        return Some(data.clone());
    };
    let mut node = data;
    for token in tokenize(path) {
        node = match (&token, node) {
            (Token::Key(key), Value::Object(map)) => map.get(key)?,
            (Token::Index(index), Value::Array(items)) => items.get(*index)?,
            _ => return None,
        };
    }
    Some(node.clone())
}

/// Returns a copy of `data` with `value` written at `path`.
///
/// Missing intermediate objects and arrays are created. A `None` value erases
/// the target: object keys are removed and array slots are set to null. With
/// no path the value replaces the whole document.
///
/// An index more than [`MAX_ARRAY_GROWTH`] slots past the end of its array
/// leaves `data` unchanged.
pub fn set(data: &Value, path: Option<&str>, value: Option<Value>) -> Value {
    let Some(path) = path.filter(|p| !p.is_empty()) else {
        return value.unwrap_or_else(|| Value::Object(Map::new()));
    };
    let tokens = tokenize(path);
    let mut root = data.clone();
    if !write(&mut root, &tokens, value) {
        warn!(path, "array index out of range, write skipped");
        return data.clone();
    }
    root
}

/// Returns false if an index is out of range.
fn write(node: &mut Value, tokens: &[Token], value: Option<Value>) -> bool {
    let Some((head, tail)) = tokens.split_first() else {
        return true;
    };

    match head {
        Token::Key(key) => {
            if !node.is_object() {
                if value.is_none() {
                    return true;
                }
                *node = Value::Object(Map::new());
            }
            let Value::Object(map) = node else {
                return true;
            };
            if tail.is_empty() {
                match value {
                    Some(value) => {
                        map.insert(key.clone(), value);
                    }
                    None => {
                        map.remove(key);
                    }
                }
                return true;
            }
            if value.is_none() && !map.contains_key(key) {
                return true;
            }
            let child = map
                .entry(key.clone())
                .or_insert_with(|| empty_container(&tail[0]));
            write(child, tail, value)
        }
        Token::Index(index) => {
            let index = *index;
            if !node.is_array() {
                if value.is_none() {
                    return true;
                }
                *node = Value::Array(Vec::new());
            }
            let Value::Array(items) = node else {
                return true;
            };
            if index >= items.len() {
                if value.is_none() {
                    return true;
                }
                if index - items.len() >= MAX_ARRAY_GROWTH {
                    return false;
                }
                items.resize(index + 1, Value::Null);
            }
            if tail.is_empty() {
                items[index] = value.unwrap_or(Value::Null);
                return true;
            }
            if items[index].is_null() {
                items[index] = empty_container(&tail[0]);
            }
            write(&mut items[index], tail, value)
        }
    }
}

fn empty_container(next: &Token) -> Value {
    match next {
        Token::Key(_) => Value::Object(Map::new()),
        Token::Index(_) => Value::Array(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn tokenizes_keys_and_indices() {
        assert_eq!(
            tokenize("a.b[2].c"),
            vec![
                Token::Key("a".into()),
                Token::Key("b".into()),
                Token::Index(2),
                Token::Key("c".into()),
            ]
        );
        assert_eq!(
            tokenize("grid[1][0]"),
            vec![Token::Key("grid".into()), Token::Index(1), Token::Index(0)]
        );
    }

    #[test]
    fn get_reads_nested_values() {
        let data = json!({"a": {"b": [10, {"c": true}]}});
        assert_eq!(get(&data, Some("a.b[0]")), Some(json!(10)));
        assert_eq!(get(&data, Some("a.b[1].c")), Some(json!(true)));
        assert_eq!(get(&data, Some("a.x")), None);
        assert_eq!(get(&data, Some("a.b[7]")), None);
        assert_eq!(get(&data, None), Some(data.clone()));
        assert_eq!(get(&data, Some("")), Some(data));
    }

    #[test]
    fn set_creates_intermediate_containers() {
        let data = json!({});
        let data = set(&data, Some("a.b"), Some(json!(1)));
        let data = set(&data, Some("a.c"), Some(json!(2)));
        assert_eq!(data, json!({"a": {"b": 1, "c": 2}}));

        let data = set(&json!({}), Some("list[2].name"), Some(json!("x")));
        assert_eq!(data, json!({"list": [null, null, {"name": "x"}]}));
    }

    #[test]
    fn set_leaves_input_untouched() {
        let original = json!({"a": 1});
        let updated = set(&original, Some("a"), Some(json!(2)));
        assert_eq!(original, json!({"a": 1}));
        assert_eq!(updated, json!({"a": 2}));
    }

    #[test]
    fn erase_removes_keys_and_nulls_slots() {
        let data = json!({"a": {"b": 1, "c": 2}, "l": [1, 2]});
        let data = set(&data, Some("a.b"), None);
        assert_eq!(data, json!({"a": {"c": 2}, "l": [1, 2]}));

        let data = set(&data, Some("l[0]"), None);
        assert_eq!(data, json!({"a": {"c": 2}, "l": [null, 2]}));

        // Erasing something that is not there changes nothing.
        assert_eq!(set(&data, Some("x.y"), None), data);
    }

    #[test]
    fn set_without_path_replaces_document() {
        assert_eq!(set(&json!({"a": 1}), None, Some(json!([1]))), json!([1]));
    }

    #[test]
    fn scalars_are_replaced_by_containers() {
        let data = set(&json!({"a": 5}), Some("a.b"), Some(json!(1)));
        assert_eq!(data, json!({"a": {"b": 1}}));
    }

    #[test]
    fn far_out_of_range_index_is_skipped() {
        let data = json!({"a": [1]});
        assert_eq!(set(&data, Some("a[18446744073709551615]"), Some(json!(2))), data);
        assert_eq!(set(&data, Some("a[100000000000].b"), Some(json!(2))), data);
        assert_eq!(set(&json!({}), Some("x.y[5000]"), Some(json!(2))), json!({}));

        let grown = set(&data, Some("a[3]"), Some(json!(2)));
        assert_eq!(grown, json!({"a": [1, null, null, 2]}));
    }

    proptest! {
        #[test]
        fn set_then_get_returns_the_value(
            keys in prop::collection::vec("k[a-z]{0,5}", 1..5),
            value in any::<i64>(),
        ) {
            let path = keys.join(".");
            let data = set(&json!({"other": true}), Some(&path), Some(json!(value)));
            prop_assert_eq!(get(&data, Some(&path)), Some(json!(value)));
            prop_assert_eq!(get(&data, Some("other")), Some(json!(true)));
        }
    }
}
