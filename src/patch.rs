use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// A single patch record extracted from the request body: the operation
/// name, a JSON-Pointer style path, and the value to apply.
#[derive(Debug, Clone)]
pub struct PatchOp {
    pub op: String,
    pub path: String,
    pub value: Value,
}

/// Diagnostic carried back to the client in the `message` field.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct PatchError(pub String);

impl PatchError {
    fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Extract the list of patch operations from a parsed request body. The body
/// must be a JSON array of `{op, path, value}` objects; anything else is a
/// parse-level failure (the request is answered 400).
pub fn parse_ops(body: &Value) -> Result<Vec<PatchOp>, PatchError> {
    let items = match body {
        Value::Array(items) => items,
        Value::Object(_) => return Err(PatchError::new("patch operations should not come as map")),
        Value::Bool(_) => return Err(PatchError::new("patch operations should not come as bool")),
        Value::Number(_) => {
            return Err(PatchError::new("patch operations should not come as float64"));
        }
        Value::String(_) => {
            return Err(PatchError::new("patch operations should not come as string"));
        }
        Value::Null => return Err(PatchError::new("patch operations should not come as null")),
    };
    items.iter().map(parse_op).collect()
}

fn parse_op(item: &Value) -> Result<PatchOp, PatchError> {
    let record = match item {
        Value::Object(record) => record,
        Value::Array(_) => {
            return Err(PatchError::new("patch operation should not come as slice"));
        }
        Value::Bool(_) => return Err(PatchError::new("patch operation should not come as bool")),
        Value::Number(_) => {
            return Err(PatchError::new("patch operation should not come as float64"));
        }
        Value::String(_) => {
            return Err(PatchError::new("patch operation should not come as string"));
        }
        Value::Null => return Err(PatchError::new("patch operation should not come as null")),
    };

    let op = record
        .get("op")
        .ok_or_else(|| PatchError::new("patch operation missing \"op\" property"))?;
    let path = record
        .get("path")
        .ok_or_else(|| PatchError::new("patch operation missing \"path\" property"))?;
    let value = record
        .get("value")
        .ok_or_else(|| PatchError::new("patch operation missing \"value\" property"))?
        .clone();

    let op = op
        .as_str()
        .ok_or_else(|| PatchError::new("value of \"op\" property not string"))?
        .to_string();
    let path = path
        .as_str()
        .ok_or_else(|| PatchError::new("value of \"path\" property not string"))?
        .to_string();

    Ok(PatchOp { op, path, value })
}

/// Apply one operation to a document value, returning the new value. The
/// path is split on `/`; each segment names an object key (after `~1` → `/`
/// and `~0` → `~` unescaping) or a decimal array index.
pub fn apply(document: Value, op: &PatchOp) -> Result<Value, PatchError> {
    let segments: Vec<&str> = if op.path.is_empty() {
        Vec::new()
    } else if let Some(rest) = op.path.strip_prefix('/') {
        rest.split('/').collect()
    } else {
        return Err(PatchError::new(
            "error applying patches: path should always start with /",
        ));
    };
    walk(document, op, &segments)
}

fn walk(value: Value, op: &PatchOp, segments: &[&str]) -> Result<Value, PatchError> {
    match value {
        Value::Object(mut fields) => {
            if segments.is_empty() {
                debug!("patch path ended in a map");
                return Err(PatchError::new("error applying patches: path ends in map"));
            }
            match op.op.as_str() {
                "ObjectAdd" if segments.len() == 1 => {
                    let key = unescape(segments[0]);
                    fields.entry(key).or_insert_with(|| op.value.clone());
                    Ok(Value::Object(fields))
                }
                "ArrayAdd" | "ArrayRemove" | "ObjectAdd" => {
                    let key = unescape(segments[0]);
                    match fields.remove(&key) {
                        Some(child) => {
                            let child = walk(child, op, &segments[1..])?;
                            fields.insert(key, child);
                            Ok(Value::Object(fields))
                        }
                        None => Err(PatchError::new("key not found in map")),
                    }
                }
                _ => Err(PatchError::new(
                    "error applying patches: invalid patch operation",
                )),
            }
        }
        Value::Array(entries) => match op.op.as_str() {
            "ArrayAdd" => {
                if segments.is_empty() {
                    Ok(array_add(entries, &op.value))
                } else {
                    descend_index(entries, op, segments)
                }
            }
            "ArrayRemove" => {
                if segments.is_empty() {
                    Ok(array_remove(entries, &op.value))
                } else {
                    descend_index(entries, op, segments)
                }
            }
            "ObjectAdd" => {
                if segments.is_empty() {
                    Err(PatchError::new(
                        "error applying patches: ObjectAdd path ends in slice",
                    ))
                } else {
                    descend_index(entries, op, segments)
                }
            }
            _ => Err(PatchError::new(
                "error applying patches: invalid patch operation",
            )),
        },
        Value::Bool(_) => Err(PatchError::new(
            "error applying patches: found bool along path",
        )),
        Value::Number(_) => Err(PatchError::new(
            "error applying patches: found float64 along path",
        )),
        Value::String(_) => Err(PatchError::new(
            "error applying patches: found string along path",
        )),
        Value::Null => Err(PatchError::new(
            "error applying patches: found null along path",
        )),
    }
}

fn descend_index(
    mut entries: Vec<Value>,
    op: &PatchOp,
    segments: &[&str],
) -> Result<Value, PatchError> {
    let index: usize = segments[0]
        .parse()
        .map_err(|_| PatchError::new("error applying patches: invalid index"))?;
    if index >= entries.len() {
        return Err(PatchError::new(
            "error applying patches: index exceeds array length",
        ));
    }
    let child = std::mem::take(&mut entries[index]);
    let child = walk(child, op, &segments[1..])?;
    entries[index] = child;
    Ok(Value::Array(entries))
}

/// Append unless an equal element is already present.
fn array_add(mut entries: Vec<Value>, value: &Value) -> Value {
    if !entries.iter().any(|entry| json_equal(entry, value)) {
        entries.push(value.clone());
    }
    Value::Array(entries)
}

/// Remove the first equal element, if any.
fn array_remove(mut entries: Vec<Value>, value: &Value) -> Value {
    if let Some(index) = entries.iter().position(|entry| json_equal(entry, value)) {
        entries.remove(index);
    }
    Value::Array(entries)
}

fn unescape(segment: &str) -> String {
    segment.replace("~1", "/").replace("~0", "~")
}

/// Fold a whole operation list over a document value. The first failing
/// operation aborts the rest; the caller decides whether to keep the
/// original document.
pub fn apply_all(mut document: Value, ops: &[PatchOp]) -> Result<Value, PatchError> {
    for op in ops {
        document = apply(document, op)?;
    }
    Ok(document)
}

/// Deep equality with numbers compared by numeric value, so `5` and `5.0`
/// are the same element.
pub fn json_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(v, w)| json_equal(v, w))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|w| json_equal(v, w)))
        }
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn op(op_name: &str, path: &str, value: Value) -> PatchOp {
        PatchOp {
            op: op_name.to_string(),
            path: path.to_string(),
            value,
        }
    }

    #[test]
    fn parse_requires_array_of_records() {
        let err = parse_ops(&json!({"op": "ObjectAdd"})).unwrap_err();
        assert_eq!(err.0, "patch operations should not come as map");

        let err = parse_ops(&json!("nope")).unwrap_err();
        assert_eq!(err.0, "patch operations should not come as string");

        let err = parse_ops(&json!([["nested"]])).unwrap_err();
        assert_eq!(err.0, "patch operation should not come as slice");

        let err = parse_ops(&json!([{"path": "/a", "value": 1}])).unwrap_err();
        assert_eq!(err.0, "patch operation missing \"op\" property");

        let err = parse_ops(&json!([{"op": 7, "path": "/a", "value": 1}])).unwrap_err();
        assert_eq!(err.0, "value of \"op\" property not string");

        let ops = parse_ops(&json!([{"op": "ObjectAdd", "path": "/a", "value": [1]}]))
            .expect("parses");
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].op, "ObjectAdd");
    }

    #[test]
    fn object_add_inserts_only_absent_keys() {
        let doc = json!({"prop1": "hello"});
        let patched = apply(doc, &op("ObjectAdd", "/prop4", json!(100))).expect("applies");
        assert_eq!(patched, json!({"prop1": "hello", "prop4": 100}));

        let patched = apply(patched, &op("ObjectAdd", "/prop4", json!(999))).expect("applies");
        assert_eq!(patched["prop4"], json!(100), "existing key untouched");
    }

    #[test]
    fn empty_path_fails_on_map() {
        let err = apply(json!({}), &op("ObjectAdd", "", json!([1, 5]))).unwrap_err();
        assert_eq!(err.0, "error applying patches: path ends in map");
    }

    #[test]
    fn path_must_start_with_slash() {
        let err = apply(json!({"a": 1}), &op("ObjectAdd", "a/b", json!(1))).unwrap_err();
        assert_eq!(err.0, "error applying patches: path should always start with /");
    }

    #[test]
    fn array_add_and_remove_use_numeric_equality() {
        let doc = json!({"nums": [1, 5, 9]});
        let doc = apply(doc, &op("ArrayRemove", "/nums", json!(5.0))).expect("applies");
        assert_eq!(doc["nums"], json!([1, 9]));

        let doc = apply(doc, &op("ArrayAdd", "/nums", json!(9.0))).expect("applies");
        assert_eq!(doc["nums"], json!([1, 9]), "equal element not re-added");

        let doc = apply(doc, &op("ArrayAdd", "/nums", json!(2))).expect("applies");
        assert_eq!(doc["nums"], json!([1, 9, 2]));
    }

    #[test]
    fn index_errors() {
        let doc = json!({"nums": [1, 2]});
        let err = apply(doc.clone(), &op("ArrayAdd", "/nums/9/x", json!(1))).unwrap_err();
        assert_eq!(err.0, "error applying patches: index exceeds array length");

        let err = apply(doc, &op("ArrayAdd", "/nums/one/x", json!(1))).unwrap_err();
        assert_eq!(err.0, "error applying patches: invalid index");
    }

    #[test]
    fn scalar_along_path_fails() {
        let doc = json!({"a": 5});
        let err = apply(doc, &op("ObjectAdd", "/a/b", json!(1))).unwrap_err();
        assert_eq!(err.0, "error applying patches: found float64 along path");
    }

    #[test]
    fn unknown_operation_fails() {
        let doc = json!({"a": {}});
        let err = apply(doc, &op("Replace", "/a/b", json!(1))).unwrap_err();
        assert_eq!(err.0, "error applying patches: invalid patch operation");
    }

    #[test]
    fn eight_step_scenario_builds_expected_document() {
        let seed = json!({"prop1": "hello", "prop2": 5, "prop3": true});
        let ops = vec![
            op("ObjectAdd", "/a~1b", json!([1, 5])),
            op("ArrayRemove", "/a~1b", json!(5)),
            op("ArrayAdd", "/a~1b", json!(2)),
            op(
                "ArrayAdd",
                "/a~1b",
                json!({"inner1": "bang", "c~d": {"inner2": "boom"}}),
            ),
            op("ObjectAdd", "/a~1b/2/c~0d/inner3", json!("pom")),
            op(
                "ObjectAdd",
                "/a~1b/2/c~0d/inner4",
                json!(["yessir", "no"]),
            ),
            op("ArrayRemove", "/a~1b/2/c~0d/inner4", json!("no")),
            op("ArrayAdd", "/a~1b/2/c~0d/inner4", json!("yes ma'am")),
        ];

        let patched = apply_all(seed, &ops).expect("all ops apply");
        assert_eq!(
            patched,
            json!({
                "prop1": "hello",
                "prop2": 5,
                "prop3": true,
                "a/b": [1, 2, {
                    "inner1": "bang",
                    "c~d": {
                        "inner2": "boom",
                        "inner3": "pom",
                        "inner4": ["yessir", "yes ma'am"]
                    }
                }]
            })
        );
    }

    #[test]
    fn failed_op_leaves_earlier_value_recoverable() {
        // The handler discards the working value on failure; the stored
        // document is only replaced after every op succeeds.
        let doc = json!({"nums": [1]});
        let ops = vec![
            op("ArrayAdd", "/nums", json!(2)),
            op("ArrayAdd", "/nums/9/x", json!(3)),
        ];
        let err = apply_all(doc.clone(), &ops).unwrap_err();
        assert_eq!(err.0, "error applying patches: index exceeds array length");
        assert_eq!(doc, json!({"nums": [1]}));
    }
}
