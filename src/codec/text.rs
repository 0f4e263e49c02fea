//! JSON-like text format.
//!
//! The document is a JSON array holding the argument list. Scalars map to
//! their JSON counterparts, with nil written as `0`. A table whose keys are
//! exactly `1..n` in order becomes an array; any other table becomes an object
//! with stringified keys.
//!
//! References that JSON cannot express are written as sentinel strings of the
//! form `^X^payload`:
//!
//! - `^T^<index>`: a table already written in this document, by first-seen
//!   index starting at 0
//! - `^E^<id>`: an entity (serialized documents only)
//! - `^R^<name>`: a resource
//!
//! Object members are kept in document order, so the decoder assigns table
//! indices in the same order the encoder did.
//!
//! A user string that looks like `^X^...` or `^X~...` gets a `~` inserted at
//! its third byte, and the marker is removed again on read. Every user string
//! survives a round trip unchanged and is never mistaken for a sentinel.

use std::borrow::Cow;
use std::collections::HashMap;

use serde_json::{Map, Number, Value as Json};

use super::{Failure, Report};
use crate::config::{Limits, TextOptions};
use crate::directory::Directory;
use crate::error::WireError;
use crate::value::{EntityId, ForeignHandle, Table, TableId, Value, ValueKind, ValueList};

/// Largest magnitude at which every integer is exactly representable in f64.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

pub struct TextCodec<'d> {
    directory: &'d dyn Directory,
    options: TextOptions,
    limits: Limits,
}

impl<'d> TextCodec<'d> {
    pub fn new(directory: &'d dyn Directory, options: TextOptions) -> Self {
        Self {
            directory,
            options,
            limits: Limits::default(),
        }
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn encode(&self, list: &ValueList) -> (Json, Report) {
        let mut encoder = Encoder {
            codec: self,
            list,
            known: HashMap::new(),
            report: Report::default(),
        };
        let items = list.iter().map(|v| encoder.value(v, 0)).collect();
        (Json::Array(items), encoder.report)
    }

    pub fn encode_string(&self, list: &ValueList) -> Result<(String, Report), WireError> {
        let (document, report) = self.encode(list);
        let text = if self.options.pretty {
            serde_json::to_string_pretty(&document)?
        } else {
            serde_json::to_string(&document)?
        };
        Ok((text, report))
    }

    pub fn decode(&self, document: &Json) -> Result<(ValueList, Report), WireError> {
        let Json::Array(items) = document else {
            return Err(WireError::NotAnArray);
        };
        let mut decoder = Decoder {
            codec: self,
            list: ValueList::new(),
            registry: Vec::new(),
            report: Report::default(),
        };
        for item in items {
            let value = decoder.value(item, 0);
            decoder.list.push(value);
        }
        Ok((decoder.list, decoder.report))
    }

    pub fn decode_str(&self, text: &str) -> Result<(ValueList, Report), WireError> {
        let document: Json = serde_json::from_str(text)?;
        self.decode(&document)
    }
}

// ============================================================================
// Sentinels
// ============================================================================

/// Split `^X^payload` into `(X, payload)`.
fn sentinel(s: &str) -> Option<(u8, &str)> {
    let b = s.as_bytes();
    if b.len() > 3 && b[0] == b'^' && b[1] != b'^' && b[2] == b'^' {
        Some((b[1], &s[3..]))
    } else {
        None
    }
}

fn escape(s: &str) -> Cow<'_, str> {
    let b = s.as_bytes();
    if b.len() > 3 && b[0] == b'^' && b[1] != b'^' && (b[2] == b'^' || b[2] == b'~') {
        let mut escaped = String::with_capacity(s.len() + 1);
        escaped.push_str(&s[..2]);
        escaped.push('~');
        escaped.push_str(&s[2..]);
        Cow::Owned(escaped)
    } else {
        Cow::Borrowed(s)
    }
}

fn unescape(s: &str) -> Cow<'_, str> {
    let b = s.as_bytes();
    if b.len() > 3 && b[0] == b'^' && b[1] != b'^' && b[2] == b'~' && (b[3] == b'^' || b[3] == b'~')
    {
        let mut plain = String::with_capacity(s.len() - 1);
        plain.push_str(&s[..2]);
        plain.push_str(&s[3..]);
        Cow::Owned(plain)
    } else {
        Cow::Borrowed(s)
    }
}

// ============================================================================
// Encoding
// ============================================================================

struct Encoder<'a, 'd> {
    codec: &'a TextCodec<'d>,
    list: &'a ValueList,
    known: HashMap<TableId, usize>,
    report: Report,
}

impl<'a> Encoder<'a, '_> {
    fn fail(&mut self, failure: Failure) -> Json {
        self.report.record(failure);
        Json::Null
    }

    fn value(&mut self, value: &Value, depth: usize) -> Json {
        match value {
            Value::Nil => Json::from(0),
            Value::Boolean(b) => Json::Bool(*b),
            Value::Number(n) => match number(*n) {
                Some(n) => Json::Number(n),
                None => self.fail(Failure::Invalid {
                    what: "number",
                    detail: n.to_string(),
                }),
            },
            Value::String(s) => {
                let max = self.codec.limits.max_text_string;
                if s.len() > max {
                    return self.fail(Failure::Overflow { len: s.len(), max });
                }
                match utf8(s) {
                    Ok(s) => Json::String(escape(s).into_owned()),
                    Err(failure) => self.fail(failure),
                }
            }
            Value::Table(table) => {
                if let Some(index) = self.known.get(&table.id) {
                    return Json::String(format!("^T^{index}"));
                }
                if depth >= self.codec.limits.max_depth {
                    return self.fail(Failure::TooDeep(self.codec.limits.max_depth));
                }
                let list: &'a ValueList = self.list;
                let Some(body) = list.table(table.id) else {
                    return self.fail(Failure::BrokenReference(format!(
                        "table {}",
                        table.id.index()
                    )));
                };
                let index = self.known.len();
                self.known.insert(table.id, index);
                self.table(body, depth + 1)
            }
            Value::Handle(handle) => match self.handle(*handle) {
                Ok(text) => Json::String(text),
                Err(failure) => self.fail(failure),
            },
            Value::Callable(_) => self.fail(Failure::Unsupported(ValueKind::Callable)),
        }
    }

    fn table(&mut self, body: &Table, depth: usize) -> Json {
        let is_sequence = body
            .pairs()
            .enumerate()
            .all(|(i, (key, _))| matches!(key, Value::Number(n) if *n == (i + 1) as f64));
        if is_sequence {
            return Json::Array(body.pairs().map(|(_, v)| self.value(v, depth)).collect());
        }

        let mut object = Map::new();
        for (key, value) in body.pairs() {
            match self.key(key) {
                // a colliding key must not register tables it would drop
                Ok(key) if object.contains_key(&key) => self.report.record(Failure::Invalid {
                    what: "object key",
                    detail: format!("{key:?} appears twice once stringified"),
                }),
                Ok(key) => {
                    let value = self.value(value, depth);
                    object.insert(key, value);
                }
                Err(failure) => self.report.record(failure),
            }
        }
        Json::Object(object)
    }

    fn key(&self, key: &Value) -> Result<String, Failure> {
        match key {
            Value::Nil => Ok("0".to_string()),
            Value::Boolean(b) => Ok(b.to_string()),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
                    Ok(format!("{}", *n as i64))
                } else {
                    Ok(format!("{n:.6}"))
                }
            }
            Value::String(s) => utf8(s).map(str::to_string),
            Value::Handle(ForeignHandle::Entity(id)) => Ok(format!("#E#{}", id.0)),
            Value::Handle(ForeignHandle::Resource(id)) => self
                .codec
                .directory
                .resource_name(*id)
                .map(|name| format!("#R#{name}"))
                .ok_or_else(|| Failure::BrokenReference(id.to_string())),
            Value::Table(_) | Value::Callable(_) => Err(Failure::Invalid {
                what: "object key",
                detail: format!("{} keys cannot be stringified", key.kind()),
            }),
        }
    }

    fn handle(&self, handle: ForeignHandle) -> Result<String, Failure> {
        let directory = self.codec.directory;
        match handle {
            ForeignHandle::Entity(id) => {
                if !self.codec.options.serialize {
                    return Err(Failure::Unsupported(ValueKind::Handle));
                }
                if !directory.entity_exists(id) {
                    return Err(Failure::BrokenReference(id.to_string()));
                }
                Ok(format!("^E^{}", id.0))
            }
            ForeignHandle::Resource(id) => directory
                .resource_name(id)
                .map(|name| format!("^R^{name}"))
                .ok_or_else(|| Failure::BrokenReference(id.to_string())),
        }
    }
}

fn utf8(s: &[u8]) -> Result<&str, Failure> {
    std::str::from_utf8(s).map_err(|e| Failure::Invalid {
        what: "string",
        detail: e.to_string(),
    })
}

fn number(n: f64) -> Option<Number> {
    if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
        Some(Number::from(n as i64))
    } else {
        Number::from_f64(n)
    }
}

// ============================================================================
// Decoding
// ============================================================================

struct Decoder<'a, 'd> {
    codec: &'a TextCodec<'d>,
    list: ValueList,
    registry: Vec<TableId>,
    report: Report,
}

impl Decoder<'_, '_> {
    fn fail(&mut self, failure: Failure) -> Value {
        self.report.record(failure);
        Value::Nil
    }

    fn value(&mut self, json: &Json, depth: usize) -> Value {
        match json {
            Json::Null => Value::Nil,
            Json::Bool(b) => Value::Boolean(*b),
            Json::Number(n) => match n.as_f64() {
                Some(n) => Value::Number(n),
                None => self.fail(Failure::Invalid {
                    what: "number",
                    detail: n.to_string(),
                }),
            },
            Json::String(s) => self.string(s),
            Json::Array(items) => {
                let Some(id) = self.open_table(depth) else {
                    return self.fail(Failure::TooDeep(self.codec.limits.max_depth));
                };
                let slot = self.list.reference(id);
                for (i, item) in items.iter().enumerate() {
                    let value = self.value(item, depth + 1);
                    if let Some(table) = self.list.table_mut(id) {
                        table.insert((i + 1) as f64, value);
                    }
                }
                slot
            }
            Json::Object(object) => {
                let Some(id) = self.open_table(depth) else {
                    return self.fail(Failure::TooDeep(self.codec.limits.max_depth));
                };
                let slot = self.list.reference(id);
                for (key, item) in object {
                    let value = self.value(item, depth + 1);
                    if let Some(table) = self.list.table_mut(id) {
                        table.insert(key.as_str(), value);
                    }
                }
                slot
            }
        }
    }

    fn open_table(&mut self, depth: usize) -> Option<TableId> {
        if depth >= self.codec.limits.max_depth {
            return None;
        }
        let id = self.list.new_table();
        self.registry.push(id);
        Some(id)
    }

    fn string(&mut self, s: &str) -> Value {
        let max = self.codec.limits.max_text_string;
        let Some((kind, payload)) = sentinel(s) else {
            // the limit applies to the unescaped string
            let plain = unescape(s);
            if plain.len() > max {
                return self.fail(Failure::Overflow { len: plain.len(), max });
            }
            return Value::String(plain.into_owned().into_bytes());
        };
        if s.len() > max {
            return self.fail(Failure::Overflow { len: s.len(), max });
        }
        match kind {
            b'T' => match payload.parse::<usize>() {
                Ok(index) => match self.registry.get(index).copied() {
                    Some(id) => self.list.reference(id),
                    None => self.fail(Failure::BrokenReference(format!("table index {index}"))),
                },
                Err(e) => self.fail(Failure::Invalid {
                    what: "table reference",
                    detail: format!("{payload:?}: {e}"),
                }),
            },
            b'E' => {
                if !self.codec.options.serialize {
                    return self.fail(Failure::Unsupported(ValueKind::Handle));
                }
                match payload.parse::<u32>() {
                    Ok(id) if id != 0 && self.codec.directory.entity_exists(EntityId(id)) => {
                        Value::Handle(ForeignHandle::Entity(EntityId(id)))
                    }
                    Ok(id) => self.fail(Failure::BrokenReference(EntityId(id).to_string())),
                    Err(e) => self.fail(Failure::Invalid {
                        what: "entity reference",
                        detail: format!("{payload:?}: {e}"),
                    }),
                }
            }
            b'R' => match self.codec.directory.resource_by_name(payload) {
                Some(id) => Value::Handle(ForeignHandle::Resource(id)),
                None => self.fail(Failure::BrokenReference(format!("resource {payload:?}"))),
            },
            _ => Value::from(s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::Registry;
    use serde_json::json;

    fn codec(registry: &Registry) -> TextCodec<'_> {
        TextCodec::new(registry, TextOptions::serialized())
    }

    #[test]
    fn escape_is_reversible() {
        for s in ["^A^hello", "^A~^x", "^A~~", "^T^0", "^^^x", "^A^", "plain", "^é^x", "^A~b"] {
            assert_eq!(unescape(&escape(s)), s, "{s:?}");
        }
        assert_eq!(escape("^A^hello"), "^A~^hello");
        assert_eq!(escape("^A~b"), "^A~~b");
        assert!(sentinel(&escape("^E^1")).is_none());
    }

    #[test]
    fn scalars_and_nil() {
        let registry = Registry::new();
        let list: ValueList = [
            Value::Nil,
            Value::Boolean(false),
            Value::Number(5.0),
            Value::Number(5.5),
            Value::from("hi"),
        ]
        .into_iter()
        .collect();
        let (document, report) = codec(&registry).encode(&list);
        assert!(report.is_clean());
        assert_eq!(document, json!([0, false, 5, 5.5, "hi"]));
    }

    #[test]
    fn sequence_becomes_array_and_map_becomes_object() {
        let registry = Registry::new();
        let mut list = ValueList::new();
        let seq = list.new_table();
        list.table_mut(seq).unwrap().insert(1, "a");
        list.table_mut(seq).unwrap().insert(2, "b");
        let map = list.new_table();
        list.table_mut(map).unwrap().insert("x", 1);
        list.table_mut(map).unwrap().insert(3, true);
        list.table_mut(map).unwrap().insert(1.5, false);
        list.push_table(seq);
        list.push_table(map);

        let (document, _) = codec(&registry).encode(&list);
        assert_eq!(
            document,
            json!([["a", "b"], {"x": 1, "3": true, "1.500000": false}])
        );
    }

    #[test]
    fn shared_and_cyclic_tables_use_table_sentinels() {
        let registry = Registry::new();
        let mut list = ValueList::new();
        let outer = list.new_table();
        let inner = list.new_table();
        let me = list.reference(outer);
        let inner_ref = list.reference(inner);
        list.table_mut(outer).unwrap().insert("self", me);
        list.table_mut(outer).unwrap().insert("inner", inner_ref);
        list.push_table(outer);
        list.push_table(inner);

        let codec = codec(&registry);
        let (document, report) = codec.encode(&list);
        assert!(report.is_clean());
        assert_eq!(document, json!([{"self": "^T^0", "inner": []}, "^T^1"]));

        let (decoded, report) = codec.decode(&document).unwrap();
        assert!(report.is_clean());
        let root = decoded.get(0).unwrap().as_table().unwrap();
        let again = decoded.table(root).unwrap().get(&Value::from("self")).unwrap();
        assert_eq!(again.as_table(), Some(root));
        assert_eq!(decoded.table_count(), 2);
    }

    #[test]
    fn sentinel_lookalike_survives() {
        let registry = Registry::new();
        let codec = codec(&registry);
        let list: ValueList = ["^A^hello", "^T^0", "^E^5", "^R~x"]
            .into_iter()
            .map(Value::from)
            .collect();
        let (text, _) = codec.encode_string(&list).unwrap();
        let (decoded, report) = codec.decode_str(&text).unwrap();
        assert!(report.is_clean());
        assert_eq!(decoded, list);
    }

    #[test]
    fn oversized_string_is_rejected_alone() {
        let registry = Registry::new();
        let codec = codec(&registry);
        let list: ValueList = [Value::from("x".repeat(70_000)), Value::from("ok")]
            .into_iter()
            .collect();
        let (document, report) = codec.encode(&list);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(document, json!([null, "ok"]));

        let (decoded, report) = codec
            .decode(&json!(["y".repeat(70_000), "still here"]))
            .unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(decoded.values(), &[Value::Nil, Value::from("still here")]);
    }

    #[test]
    fn escaped_string_at_the_limit_survives() {
        let registry = Registry::new();
        let codec = codec(&registry);
        let edge = format!("^A^{}", "z".repeat(65_532));
        let list: ValueList = [Value::from(edge.as_str())].into_iter().collect();

        let (text, report) = codec.encode_string(&list).unwrap();
        assert!(report.is_clean());
        let (decoded, report) = codec.decode_str(&text).unwrap();
        assert!(report.is_clean());
        assert_eq!(decoded.get(0).and_then(Value::as_str), Some(edge.as_str()));
    }

    #[test]
    fn non_utf8_strings_fail_alone() {
        let registry = Registry::new();
        let mut list = ValueList::new();
        list.push_string(b"\xff\xfeAB".to_vec());
        list.push_string("ok");
        let key = list.new_table();
        list.table_mut(key).unwrap().insert(b"\xc3".to_vec(), 1);
        list.push_table(key);

        let (document, report) = codec(&registry).encode(&list);
        assert_eq!(report.failures.len(), 2);
        assert_eq!(document, json!([null, "ok", {}]));
    }

    #[test]
    fn colliding_object_keys_keep_table_indices() {
        let registry = Registry::new();
        let mut list = ValueList::new();
        let outer = list.new_table();
        let a = list.new_table();
        let b = list.new_table();
        list.table_mut(a).unwrap().insert("name", "A");
        list.table_mut(b).unwrap().insert("name", "B");
        let a_slot = list.reference(a);
        list.table_mut(outer).unwrap().insert(1, a_slot);
        list.table_mut(outer).unwrap().insert("1", "x");
        list.push_table(outer);
        list.push_table(b);
        list.push_table(a);

        let codec = codec(&registry);
        let (document, report) = codec.encode(&list);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(
            document,
            json!([{"1": {"name": "A"}}, {"name": "B"}, "^T^1"])
        );

        let (decoded, report) = codec.decode(&document).unwrap();
        assert!(report.is_clean());
        let root = decoded.table_of(decoded.get(0).unwrap()).unwrap();
        let nested = root.get(&Value::from("1")).and_then(Value::as_table);
        assert!(nested.is_some());
        assert_eq!(nested, decoded.get(2).and_then(Value::as_table));
    }

    #[test]
    fn entity_sentinels_follow_mode() {
        let registry = Registry::new();
        let car = registry.spawn_entity();
        let mut list = ValueList::new();
        list.push_handle(ForeignHandle::Entity(car));

        let serialized = TextCodec::new(&registry, TextOptions::serialized());
        let (document, _) = serialized.encode(&list);
        assert_eq!(document, json!([format!("^E^{}", car.0)]));
        let (decoded, _) = serialized.decode(&document).unwrap();
        assert_eq!(decoded, list);

        let plain = TextCodec::new(&registry, TextOptions::default());
        let (document, report) = plain.encode(&list);
        assert_eq!(document, json!([null]));
        assert_eq!(report.failures.len(), 1);
        let (decoded, report) = plain.decode(&json!([format!("^E^{}", car.0)])).unwrap();
        assert_eq!(decoded.get(0), Some(&Value::Nil));
        assert_eq!(report.failures.len(), 1);
    }

    #[test]
    fn resources_resolve_by_name() {
        let registry = Registry::new();
        let race = registry.add_resource("race");
        let codec = TextCodec::new(&registry, TextOptions::default());

        let mut list = ValueList::new();
        list.push_handle(ForeignHandle::Resource(race));
        let (document, _) = codec.encode(&list);
        assert_eq!(document, json!(["^R^race"]));
        let (decoded, _) = codec.decode(&document).unwrap();
        assert_eq!(decoded, list);
    }

    #[test]
    fn broken_sentinels_decode_to_nil() {
        let registry = Registry::new();
        let (decoded, report) = codec(&registry)
            .decode(&json!(["^T^3", "^E^0", "^E^x", "^R^missing", 7]))
            .unwrap();
        assert_eq!(report.failures.len(), 4);
        assert_eq!(
            decoded.values(),
            &[Value::Nil, Value::Nil, Value::Nil, Value::Nil, Value::Number(7.0)]
        );
    }

    #[test]
    fn object_keys_read_back_as_strings() {
        let registry = Registry::new();
        let (decoded, _) = codec(&registry).decode_str(r#"[{"1": "a"}, [10]]"#).unwrap();
        let object = decoded.table_of(decoded.get(0).unwrap()).unwrap();
        assert_eq!(object.get(&Value::from("1")), Some(&Value::from("a")));
        let array = decoded.table_of(decoded.get(1).unwrap()).unwrap();
        assert_eq!(array.get(&Value::Number(1.0)), Some(&Value::Number(10.0)));
    }

    #[test]
    fn non_array_document_is_an_error() {
        let registry = Registry::new();
        assert!(matches!(
            codec(&registry).decode(&json!({"a": 1})),
            Err(WireError::NotAnArray)
        ));
    }
}
