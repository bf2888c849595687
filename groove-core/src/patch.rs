//! A minimal RFC 6902 JSON Patch applier over `serde_json::Value`.
//!
//! The control surface's `applyPatch` command only ever needs `add`,
//! `remove`, `replace`, `move`, `copy`, and `test` against a document that is
//! always an object/array tree, so this sticks to what that needs rather
//! than pulling in a dedicated patch crate for it.

use serde_json::Value;

use crate::error::GrooveError;

/// One decoded patch operation, keeping the raw `path` string around for
/// structural-change classification.
pub struct Op {
    pub path: String,
    kind: OpKind,
}

enum OpKind {
    Add(Value),
    Remove,
    Replace(Value),
    Move(String),
    Copy(String),
    Test(Value),
}

/// Parse the wire `ops` array (each a `{op, path, value|from}` object) into
/// [`Op`]s. Any op missing its required fields is an invalid-ops error.
pub fn parse_ops(ops: &[Value]) -> Result<Vec<Op>, GrooveError> {
    ops.iter().map(parse_one).collect()
}

fn parse_one(raw: &Value) -> Result<Op, GrooveError> {
    let obj = raw
        .as_object()
        .ok_or_else(|| GrooveError::InvalidOps("patch op must be an object".to_string()))?;
    let op = obj
        .get("op")
        .and_then(Value::as_str)
        .ok_or_else(|| GrooveError::InvalidOps("patch op missing \"op\"".to_string()))?;
    let path = obj
        .get("path")
        .and_then(Value::as_str)
        .ok_or_else(|| GrooveError::InvalidOps("patch op missing \"path\"".to_string()))?
        .to_string();

    let kind = match op {
        "add" => OpKind::Add(value_field(obj)?),
        "replace" => OpKind::Replace(value_field(obj)?),
        "test" => OpKind::Test(value_field(obj)?),
        "remove" => OpKind::Remove,
        "move" => OpKind::Move(from_field(obj)?),
        "copy" => OpKind::Copy(from_field(obj)?),
        other => return Err(GrooveError::InvalidOps(format!("unsupported op \"{other}\""))),
    };
    Ok(Op { path, kind })
}

fn value_field(obj: &serde_json::Map<String, Value>) -> Result<Value, GrooveError> {
    obj.get("value")
        .cloned()
        .ok_or_else(|| GrooveError::InvalidOps("patch op missing \"value\"".to_string()))
}

fn from_field(obj: &serde_json::Map<String, Value>) -> Result<String, GrooveError> {
    obj.get("from")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| GrooveError::InvalidOps("patch op missing \"from\"".to_string()))
}

/// Apply every op in order, in place.
pub fn apply(doc: &mut Value, ops: &[Op]) -> Result<(), GrooveError> {
    for op in ops {
        apply_one(doc, op)?;
    }
    Ok(())
}

fn apply_one(doc: &mut Value, op: &Op) -> Result<(), GrooveError> {
    match &op.kind {
        OpKind::Add(v) => set_at(doc, &op.path, v.clone()),
        OpKind::Replace(v) => set_at(doc, &op.path, v.clone()),
        OpKind::Remove => remove_at(doc, &op.path),
        OpKind::Test(expected) => {
            let actual = get_at(doc, &op.path)?;
            if actual == expected {
                Ok(())
            } else {
                Err(GrooveError::PatchApply(format!("test failed at {}", op.path)))
            }
        }
        OpKind::Move(from) => {
            let v = get_at(doc, from)?.clone();
            remove_at(doc, from)?;
            set_at(doc, &op.path, v)
        }
        OpKind::Copy(from) => {
            let v = get_at(doc, from)?.clone();
            set_at(doc, &op.path, v)
        }
    }
}

fn tokens(path: &str) -> Result<Vec<String>, GrooveError> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    if !path.starts_with('/') {
        return Err(GrooveError::InvalidOps(format!("malformed pointer \"{path}\"")));
    }
    Ok(path[1..]
        .split('/')
        .map(|t| t.replace("~1", "/").replace("~0", "~"))
        .collect())
}

fn get_at<'a>(doc: &'a Value, path: &str) -> Result<&'a Value, GrooveError> {
    let toks = tokens(path)?;
    let mut cur = doc;
    for t in &toks {
        cur = index(cur, t)?;
    }
    Ok(cur)
}

fn index<'a>(v: &'a Value, token: &str) -> Result<&'a Value, GrooveError> {
    match v {
        Value::Object(map) => map
            .get(token)
            .ok_or_else(|| GrooveError::PatchApply(format!("no such key \"{token}\""))),
        Value::Array(arr) => {
            let i: usize = token
                .parse()
                .map_err(|_| GrooveError::PatchApply(format!("bad array index \"{token}\"")))?;
            arr.get(i)
                .ok_or_else(|| GrooveError::PatchApply(format!("index {i} out of bounds")))
        }
        _ => Err(GrooveError::PatchApply("cannot index into scalar".to_string())),
    }
}

fn set_at(doc: &mut Value, path: &str, value: Value) -> Result<(), GrooveError> {
    let toks = tokens(path)?;
    let Some((last, parents)) = toks.split_last() else {
        *doc = value;
        return Ok(());
    };
    let mut cur = doc;
    for t in parents {
        cur = index_mut(cur, t)?;
    }
    match cur {
        Value::Object(map) => {
            map.insert(last.clone(), value);
        }
        Value::Array(arr) => {
            if last == "-" {
                arr.push(value);
            } else {
                let i: usize = last
                    .parse()
                    .map_err(|_| GrooveError::PatchApply(format!("bad array index \"{last}\"")))?;
                if i > arr.len() {
                    return Err(GrooveError::PatchApply(format!("index {i} out of bounds")));
                }
                if i == arr.len() {
                    arr.push(value);
                } else {
                    arr[i] = value;
                }
            }
        }
        _ => return Err(GrooveError::PatchApply("cannot set into scalar".to_string())),
    }
    Ok(())
}

fn remove_at(doc: &mut Value, path: &str) -> Result<(), GrooveError> {
    let toks = tokens(path)?;
    let Some((last, parents)) = toks.split_last() else {
        return Err(GrooveError::PatchApply("cannot remove document root".to_string()));
    };
    let mut cur = doc;
    for t in parents {
        cur = index_mut(cur, t)?;
    }
    match cur {
        Value::Object(map) => {
            map.remove(last)
                .ok_or_else(|| GrooveError::PatchApply(format!("no such key \"{last}\"")))?;
        }
        Value::Array(arr) => {
            let i: usize = last
                .parse()
                .map_err(|_| GrooveError::PatchApply(format!("bad array index \"{last}\"")))?;
            if i >= arr.len() {
                return Err(GrooveError::PatchApply(format!("index {i} out of bounds")));
            }
            arr.remove(i);
        }
        _ => return Err(GrooveError::PatchApply("cannot remove from scalar".to_string())),
    }
    Ok(())
}

fn index_mut<'a>(v: &'a mut Value, token: &str) -> Result<&'a mut Value, GrooveError> {
    match v {
        Value::Object(map) => map
            .get_mut(token)
            .ok_or_else(|| GrooveError::PatchApply(format!("no such key \"{token}\""))),
        Value::Array(arr) => {
            let i: usize = token
                .parse()
                .map_err(|_| GrooveError::PatchApply(format!("bad array index \"{token}\"")))?;
            arr.get_mut(i)
                .ok_or_else(|| GrooveError::PatchApply(format!("index {i} out of bounds")))
        }
        _ => Err(GrooveError::PatchApply("cannot index into scalar".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn replace_and_add_and_remove() {
        let mut doc = json!({"meta": {"tempo": 120.0}, "tracks": []});
        let ops = parse_ops(&[
            json!({"op": "replace", "path": "/meta/tempo", "value": 140.0}),
            json!({"op": "add", "path": "/tracks/-", "value": {"id": "t1"}}),
        ])
        .unwrap();
        apply(&mut doc, &ops).unwrap();
        assert_eq!(doc["meta"]["tempo"], 140.0);
        assert_eq!(doc["tracks"][0]["id"], "t1");

        let remove = parse_ops(&[json!({"op": "remove", "path": "/tracks/0"})]).unwrap();
        apply(&mut doc, &remove).unwrap();
        assert_eq!(doc["tracks"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn test_op_fails_on_mismatch() {
        let mut doc = json!({"meta": {"tempo": 120.0}});
        let ops = parse_ops(&[json!({"op": "test", "path": "/meta/tempo", "value": 999.0})]).unwrap();
        assert!(apply(&mut doc, &ops).is_err());
    }

    #[test]
    fn unsupported_op_is_invalid_ops_error() {
        let err = parse_ops(&[json!({"op": "bogus", "path": "/meta/tempo"})]).unwrap_err();
        assert!(matches!(err, GrooveError::InvalidOps(_)));
    }
}
