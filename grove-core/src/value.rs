//! Structurally typed, possibly partially unknown values.
//!
//! A [`Value`] is what configuration evaluates to, what providers plan and
//! return, and what gets persisted in the state. During planning, parts of a
//! value that are only determined at apply time are [`Value::Unknown`].

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt::Display};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Type {
    String,
    Number,
    Bool,
    /// Any type; the concrete type is taken from the value.
    #[default]
    Dynamic,
    List(Box<Type>),
    Set(Box<Type>),
    Map(Box<Type>),
    Object(BTreeMap<String, Type>),
}

impl Type {
    pub fn list(element: Type) -> Self {
        Type::List(Box::new(element))
    }
    pub fn set(element: Type) -> Self {
        Type::Set(Box::new(element))
    }
    pub fn map(element: Type) -> Self {
        Type::Map(Box::new(element))
    }
}

impl Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Type::String => write!(f, "string"),
            Type::Number => write!(f, "number"),
            Type::Bool => write!(f, "bool"),
            Type::Dynamic => write!(f, "dynamic"),
            Type::List(t) => write!(f, "list({})", t),
            Type::Set(t) => write!(f, "set({})", t),
            Type::Map(t) => write!(f, "map({})", t),
            Type::Object(attrs) => {
                write!(f, "object({{")?;
                for (i, (name, t)) in attrs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}={}", name, t)?;
                }
                write!(f, "}})")
            }
        }
    }
}

/// The tagged serialization (`{"kind": "...", "value": ...}`) is used in plan
/// files, where unknowns must survive. State uses [`Value::to_json`] instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Value {
    #[default]
    Null,
    Unknown,
    String(String),
    Number(serde_json::Number),
    Bool(bool),
    List(Vec<Value>),
    /// Kept sorted and de-duplicated; construct with [`Value::set`].
    Set(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Object(BTreeMap<String, Value>),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PathStep {
    Attr(String),
    Index(usize),
    Key(String),
    /// A set element. Set elements have no identity other than their value.
    SetElement,
}

impl Display for PathStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathStep::Attr(name) => write!(f, ".{}", name),
            PathStep::Index(i) => write!(f, "[{}]", i),
            PathStep::Key(k) => write!(f, "[\"{}\"]", k),
            PathStep::SetElement => write!(f, "[*]"),
        }
    }
}

pub fn format_path(path: &[PathStep]) -> String {
    if path.is_empty() {
        return "(root)".to_string();
    }
    path.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValueError {
    #[error("{path}: value is not yet known")]
    Unknown { path: String },
    #[error("{path}: expected {expected}, found {found}")]
    TypeMismatch {
        path: String,
        expected: String,
        found: String,
    },
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Value::String(s.into())
    }

    pub fn number(n: impl Into<serde_json::Number>) -> Self {
        Value::Number(n.into())
    }

    pub fn object<K: Into<String>>(attrs: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Object(attrs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Build a set, sorting and removing duplicates so that equality does not
    /// depend on insertion order.
    pub fn set(elements: impl IntoIterator<Item = Value>) -> Self {
        let mut elements: Vec<Value> = elements.into_iter().collect();
        elements.sort_by_cached_key(|v| v.sort_key());
        elements.dedup();
        Value::Set(elements)
    }

    fn sort_key(&self) -> String {
        // Serializing a Value cannot fail: all map keys are strings.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Value::Unknown)
    }

    /// Whether the value itself is known. Nested values may still be unknown.
    pub fn is_known(&self) -> bool {
        !self.is_unknown()
    }

    pub fn is_wholly_known(&self) -> bool {
        match self {
            Value::Unknown => false,
            Value::List(items) | Value::Set(items) => items.iter().all(Value::is_wholly_known),
            Value::Map(items) | Value::Object(items) => items.values().all(Value::is_wholly_known),
            _ => true,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Unknown => "unknown",
            Value::String(_) => "string",
            Value::Number(_) => "number",
            Value::Bool(_) => "bool",
            Value::List(_) => "list",
            Value::Set(_) => "set",
            Value::Map(_) => "map",
            Value::Object(_) => "object",
        }
    }

    /// Look up an attribute. Unknown objects have unknown attributes; anything
    /// else that is not an object yields null.
    pub fn get_attr(&self, name: &str) -> Value {
        match self {
            Value::Object(attrs) => attrs.get(name).cloned().unwrap_or(Value::Null),
            Value::Unknown => Value::Unknown,
            _ => Value::Null,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_attrs(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(attrs) | Value::Map(attrs) => Some(attrs),
            _ => None,
        }
    }

    /// The elements of a list or set.
    pub fn elements(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) | Value::Set(items) => Some(items),
            _ => None,
        }
    }

    /// Visit every value in the tree, parents before children. The callback
    /// returns whether to descend into the visited value.
    pub fn walk(&self, f: &mut dyn FnMut(&[PathStep], &Value) -> bool) {
        let mut path = Vec::new();
        self.walk_inner(&mut path, f);
    }

    fn walk_inner(&self, path: &mut Vec<PathStep>, f: &mut dyn FnMut(&[PathStep], &Value) -> bool) {
        if !f(path.as_slice(), self) {
            return;
        }
        match self {
            Value::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    path.push(PathStep::Index(i));
                    item.walk_inner(path, f);
                    path.pop();
                }
            }
            Value::Set(items) => {
                for item in items {
                    path.push(PathStep::SetElement);
                    item.walk_inner(path, f);
                    path.pop();
                }
            }
            Value::Map(items) => {
                for (k, item) in items {
                    path.push(PathStep::Key(k.clone()));
                    item.walk_inner(path, f);
                    path.pop();
                }
            }
            Value::Object(attrs) => {
                for (k, item) in attrs {
                    path.push(PathStep::Attr(k.clone()));
                    item.walk_inner(path, f);
                    path.pop();
                }
            }
            _ => {}
        }
    }

    /// Rebuild the tree bottom-up, replacing each value with the callback's
    /// result. Children are transformed before their parent sees them.
    pub fn transform(self, f: &mut dyn FnMut(&[PathStep], Value) -> Value) -> Value {
        let mut path = Vec::new();
        self.transform_inner(&mut path, f)
    }

    fn transform_inner(self, path: &mut Vec<PathStep>, f: &mut dyn FnMut(&[PathStep], Value) -> Value) -> Value {
        let rebuilt = match self {
            Value::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.into_iter().enumerate() {
                    path.push(PathStep::Index(i));
                    out.push(item.transform_inner(path, f));
                    path.pop();
                }
                Value::List(out)
            }
            Value::Set(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    path.push(PathStep::SetElement);
                    out.push(item.transform_inner(path, f));
                    path.pop();
                }
                Value::set(out)
            }
            Value::Map(items) => Value::Map(Self::transform_entries(items, path, f, PathStep::Key)),
            Value::Object(attrs) => Value::Object(Self::transform_entries(attrs, path, f, PathStep::Attr)),
            other => other,
        };
        f(path.as_slice(), rebuilt)
    }

    fn transform_entries(
        entries: BTreeMap<String, Value>,
        path: &mut Vec<PathStep>,
        f: &mut dyn FnMut(&[PathStep], Value) -> Value,
        step: fn(String) -> PathStep,
    ) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        for (k, item) in entries {
            path.push(step(k.clone()));
            let v = item.transform_inner(path, f);
            path.pop();
            out.insert(k, v);
        }
        out
    }

    /// Check that the value fits `ty`. Null and unknown fit every type.
    pub fn conforms_to(&self, ty: &Type) -> Result<(), ValueError> {
        self.conforms_inner(ty, &mut Vec::new())
    }

    fn conforms_inner(&self, ty: &Type, path: &mut Vec<PathStep>) -> Result<(), ValueError> {
        let mismatch = |path: &[PathStep]| ValueError::TypeMismatch {
            path: format_path(path),
            expected: ty.to_string(),
            found: self.type_name().to_string(),
        };
        match (self, ty) {
            (Value::Null | Value::Unknown, _) | (_, Type::Dynamic) => Ok(()),
            (Value::String(_), Type::String) | (Value::Number(_), Type::Number) | (Value::Bool(_), Type::Bool) => Ok(()),
            (Value::List(items), Type::List(elem)) | (Value::Set(items), Type::Set(elem)) => {
                for (i, item) in items.iter().enumerate() {
                    path.push(if matches!(ty, Type::Set(_)) {
                        PathStep::SetElement
                    } else {
                        PathStep::Index(i)
                    });
                    item.conforms_inner(elem, path)?;
                    path.pop();
                }
                Ok(())
            }
            (Value::Map(items), Type::Map(elem)) => {
                for (k, item) in items {
                    path.push(PathStep::Key(k.clone()));
                    item.conforms_inner(elem, path)?;
                    path.pop();
                }
                Ok(())
            }
            (Value::Object(attrs), Type::Object(attr_types)) => {
                for (name, item) in attrs {
                    path.push(PathStep::Attr(name.clone()));
                    match attr_types.get(name) {
                        Some(attr_ty) => item.conforms_inner(attr_ty, path)?,
                        None => {
                            return Err(ValueError::TypeMismatch {
                                path: format_path(path),
                                expected: "no such attribute".to_string(),
                                found: item.type_name().to_string(),
                            })
                        }
                    }
                    path.pop();
                }
                Ok(())
            }
            _ => Err(mismatch(path.as_slice())),
        }
    }

    /// Encode as plain JSON for persisting. Fails if anything is unknown.
    pub fn to_json(&self) -> Result<serde_json::Value, ValueError> {
        self.to_json_inner(&mut Vec::new())
    }

    fn to_json_inner(&self, path: &mut Vec<PathStep>) -> Result<serde_json::Value, ValueError> {
        Ok(match self {
            Value::Null => serde_json::Value::Null,
            Value::Unknown => {
                return Err(ValueError::Unknown {
                    path: format_path(path),
                })
            }
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Number(n) => serde_json::Value::Number(n.clone()),
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::List(items) | Value::Set(items) => {
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    path.push(PathStep::Index(i));
                    out.push(item.to_json_inner(path)?);
                    path.pop();
                }
                serde_json::Value::Array(out)
            }
            Value::Map(items) | Value::Object(items) => {
                let mut out = serde_json::Map::new();
                for (k, item) in items {
                    path.push(PathStep::Attr(k.clone()));
                    out.insert(k.clone(), item.to_json_inner(path)?);
                    path.pop();
                }
                serde_json::Value::Object(out)
            }
        })
    }

    /// Decode plain JSON under the given type.
    ///
    /// With [`Type::Dynamic`], arrays become lists and objects become
    /// objects.
    pub fn from_json(json: &serde_json::Value, ty: &Type) -> Result<Value, ValueError> {
        Self::from_json_inner(json, ty, &mut Vec::new())
    }

    fn from_json_inner(json: &serde_json::Value, ty: &Type, path: &mut Vec<PathStep>) -> Result<Value, ValueError> {
        use serde_json::Value as J;
        let mismatch = |path: &[PathStep], found: &str| ValueError::TypeMismatch {
            path: format_path(path),
            expected: ty.to_string(),
            found: found.to_string(),
        };
        Ok(match (json, ty) {
            (J::Null, _) => Value::Null,
            (J::String(s), Type::String | Type::Dynamic) => Value::String(s.clone()),
            (J::Number(n), Type::Number | Type::Dynamic) => Value::Number(n.clone()),
            (J::Bool(b), Type::Bool | Type::Dynamic) => Value::Bool(*b),
            // Primitive conversions, as configuration values are often
            // written as strings.
            (J::Number(n), Type::String) => Value::String(n.to_string()),
            (J::Bool(b), Type::String) => Value::String(b.to_string()),
            (J::String(s), Type::Number) => {
                let n: serde_json::Number = s.parse().map_err(|_| mismatch(path.as_slice(), "string"))?;
                Value::Number(n)
            }
            (J::String(s), Type::Bool) => match s.as_str() {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                _ => return Err(mismatch(path.as_slice(), "string")),
            },
            (J::Array(items), Type::List(_) | Type::Set(_) | Type::Dynamic) => {
                let elem = match ty {
                    Type::List(e) | Type::Set(e) => e.as_ref(),
                    _ => &Type::Dynamic,
                };
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    path.push(PathStep::Index(i));
                    out.push(Self::from_json_inner(item, elem, path)?);
                    path.pop();
                }
                if matches!(ty, Type::Set(_)) {
                    Value::set(out)
                } else {
                    Value::List(out)
                }
            }
            (J::Object(items), Type::Map(elem)) => {
                let mut out = BTreeMap::new();
                for (k, item) in items {
                    path.push(PathStep::Key(k.clone()));
                    out.insert(k.clone(), Self::from_json_inner(item, elem, path)?);
                    path.pop();
                }
                Value::Map(out)
            }
            (J::Object(items), Type::Dynamic) => {
                let mut out = BTreeMap::new();
                for (k, item) in items {
                    path.push(PathStep::Attr(k.clone()));
                    out.insert(k.clone(), Self::from_json_inner(item, &Type::Dynamic, path)?);
                    path.pop();
                }
                Value::Object(out)
            }
            (J::Object(items), Type::Object(attr_types)) => {
                let mut out = BTreeMap::new();
                for (k, attr_ty) in attr_types {
                    path.push(PathStep::Attr(k.clone()));
                    let v = match items.get(k) {
                        Some(item) => Self::from_json_inner(item, attr_ty, path)?,
                        None => Value::Null,
                    };
                    path.pop();
                    out.insert(k.clone(), v);
                }
                if let Some(extra) = items.keys().find(|k| !attr_types.contains_key(*k)) {
                    path.push(PathStep::Attr(extra.clone()));
                    return Err(ValueError::TypeMismatch {
                        path: format_path(path),
                        expected: "no such attribute".to_string(),
                        found: "attribute".to_string(),
                    });
                }
                Value::Object(out)
            }
            (other, _) => return Err(mismatch(path.as_slice(), json_type_name(other))),
        })
    }
}

impl Value {
    /// Convert an evaluated value to `ty`, the way [`Value::from_json`]
    /// decodes JSON. Unknowns stay unknown wherever they appear.
    pub fn convert(self, ty: &Type) -> Result<Value, ValueError> {
        self.convert_inner(ty, &mut Vec::new())
    }

    fn convert_inner(self, ty: &Type, path: &mut Vec<PathStep>) -> Result<Value, ValueError> {
        let mismatch = |path: &[PathStep], found: &str| ValueError::TypeMismatch {
            path: format_path(path),
            expected: ty.to_string(),
            found: found.to_string(),
        };
        Ok(match (self, ty) {
            (v @ (Value::Null | Value::Unknown), _) => v,
            (v, Type::Dynamic) => v,
            (v @ Value::String(_), Type::String) | (v @ Value::Number(_), Type::Number) | (v @ Value::Bool(_), Type::Bool) => v,
            (Value::Number(n), Type::String) => Value::String(n.to_string()),
            (Value::Bool(b), Type::String) => Value::String(b.to_string()),
            (Value::String(s), Type::Number) => {
                let n: serde_json::Number = s.parse().map_err(|_| mismatch(path.as_slice(), "string"))?;
                Value::Number(n)
            }
            (Value::String(s), Type::Bool) => match s.as_str() {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                _ => return Err(mismatch(path.as_slice(), "string")),
            },
            (Value::List(items) | Value::Set(items), Type::List(elem) | Type::Set(elem)) => {
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.into_iter().enumerate() {
                    path.push(PathStep::Index(i));
                    out.push(item.convert_inner(elem, path)?);
                    path.pop();
                }
                if matches!(ty, Type::Set(_)) {
                    Value::set(out)
                } else {
                    Value::List(out)
                }
            }
            (Value::Map(items) | Value::Object(items), Type::Map(elem)) => {
                let mut out = BTreeMap::new();
                for (k, item) in items {
                    path.push(PathStep::Key(k.clone()));
                    out.insert(k, item.convert_inner(elem, path)?);
                    path.pop();
                }
                Value::Map(out)
            }
            (Value::Object(mut items), Type::Object(attr_types)) => {
                if let Some(extra) = items.keys().find(|k| !attr_types.contains_key(*k)) {
                    path.push(PathStep::Attr(extra.clone()));
                    return Err(ValueError::TypeMismatch {
                        path: format_path(path),
                        expected: "no such attribute".to_string(),
                        found: "attribute".to_string(),
                    });
                }
                let mut out = BTreeMap::new();
                for (k, attr_ty) in attr_types {
                    path.push(PathStep::Attr(k.clone()));
                    let v = items.remove(k).unwrap_or(Value::Null).convert_inner(attr_ty, path)?;
                    path.pop();
                    out.insert(k.clone(), v);
                }
                Value::Object(out)
            }
            (other, _) => return Err(mismatch(path.as_slice(), other.type_name())),
        })
    }
}

fn json_type_name(json: &serde_json::Value) -> &'static str {
    match json {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n.into())
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Unknown => write!(f, "(known after apply)"),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Number(n) => write!(f, "{}", n),
            Value::Bool(b) => write!(f, "{}", b),
            Value::List(items) | Value::Set(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Map(items) | Value::Object(items) => {
                write!(f, "{{")?;
                for (i, (k, item)) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{} = {}", k, item)?;
                }
                write!(f, "}}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sets_are_order_insensitive() {
        let a = Value::set(vec![Value::from("b"), Value::from("a"), Value::from("b")]);
        let b = Value::set(vec![Value::from("a"), Value::from("b")]);
        assert_eq!(a, b);
        assert_eq!(a.elements().unwrap().len(), 2);
    }

    #[test]
    fn unknowns_never_encode_to_state_json() {
        let v = Value::object([("id", Value::Unknown), ("name", Value::from("x"))]);
        let err = v.to_json().unwrap_err();
        assert_eq!(
            err,
            ValueError::Unknown {
                path: ".id".to_string()
            }
        );
    }

    #[test]
    fn tagged_encoding_preserves_unknowns() {
        let v = Value::object([("id", Value::Unknown), ("n", Value::from(3))]);
        let s = serde_json::to_string(&v).unwrap();
        let back: Value = serde_json::from_str(&s).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn from_json_fills_missing_attributes_with_null() {
        let ty = Type::Object(BTreeMap::from([
            ("a".to_string(), Type::String),
            ("b".to_string(), Type::list(Type::Number)),
        ]));
        let v = Value::from_json(&json!({"b": [1, 2]}), &ty).unwrap();
        assert_eq!(
            v,
            Value::object([
                ("a", Value::Null),
                ("b", Value::List(vec![Value::from(1), Value::from(2)]))
            ])
        );
        assert!(Value::from_json(&json!({"c": 1}), &ty).is_err());
        assert!(Value::from_json(&json!({"a": [1]}), &ty).is_err());
    }

    #[test]
    fn from_json_decodes_arrays_by_collection_type() {
        let items = json!(["b", "a", "b"]);
        let strings = |xs: &[&str]| xs.iter().map(|x| Value::string(*x)).collect::<Vec<_>>();
        assert_eq!(
            Value::from_json(&items, &Type::list(Type::String)).unwrap(),
            Value::List(strings(&["b", "a", "b"]))
        );
        assert_eq!(
            Value::from_json(&items, &Type::set(Type::String)).unwrap(),
            Value::set(strings(&["a", "b"]))
        );
        assert_eq!(
            Value::from_json(&json!([1, "x"]), &Type::Dynamic).unwrap(),
            Value::List(vec![Value::from(1), Value::string("x")])
        );
        assert!(Value::from_json(&json!([1]), &Type::list(Type::Bool)).is_err());
    }

    #[test]
    fn conforms_to_reports_path() {
        let ty = Type::Object(BTreeMap::from([("a".to_string(), Type::list(Type::Bool))]));
        let v = Value::object([("a", Value::List(vec![Value::Bool(true), Value::from("no")]))]);
        match v.conforms_to(&ty) {
            Err(ValueError::TypeMismatch { path, .. }) => assert_eq!(path, ".a[1]"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn transform_is_bottom_up() {
        let v = Value::object([("a", Value::object([("b", Value::from("x"))]))]);
        let mut seen = Vec::new();
        let out = v.transform(&mut |path, v| {
            seen.push(format_path(path));
            match v {
                Value::String(_) => Value::Null,
                other => other,
            }
        });
        assert_eq!(seen, vec![".a.b", ".a", "(root)"]);
        assert_eq!(out, Value::object([("a", Value::object([("b", Value::Null)]))]));
    }

    #[test]
    fn get_attr_of_unknown_is_unknown() {
        assert_eq!(Value::Unknown.get_attr("x"), Value::Unknown);
        assert_eq!(Value::Null.get_attr("x"), Value::Null);
    }

    #[test]
    fn convert_coerces_evaluated_values_and_keeps_unknowns() {
        let ty = Type::Object(BTreeMap::from([
            ("tags".to_string(), Type::map(Type::String)),
            ("ports".to_string(), Type::set(Type::Number)),
            ("id".to_string(), Type::String),
        ]));
        let v = Value::object([
            ("tags", Value::object([("a", Value::from(1))])),
            ("ports", Value::List(vec![Value::from(2), Value::Unknown, Value::from("1")])),
        ]);
        let out = v.convert(&ty).unwrap();
        assert_eq!(out.get_attr("tags"), Value::Map(BTreeMap::from([("a".to_string(), Value::from("1"))])));
        assert_eq!(
            out.get_attr("ports"),
            Value::set(vec![Value::from(1), Value::from(2), Value::Unknown])
        );
        assert_eq!(out.get_attr("id"), Value::Null);

        let extra = Value::object([("nope", Value::from(true))]);
        assert!(extra.convert(&ty).is_err());
    }
}
