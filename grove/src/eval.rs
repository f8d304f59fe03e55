//! Evaluation of configuration expressions.
//!
//! An expression is a JSON value. A few single-key objects are special:
//!
//! | expression | value |
//! |---|---|
//! | `{"$ref": "local_file.a.id"}` | an attribute of another resource in the same module |
//! | `{"$ref": "module.net.subnet"}` | an output of a child module |
//! | `{"$count_index": true}` | the index of the instance, in a resource with `count` |
//! | `{"$each_key": true}`, `{"$each_value": true}` | the key and value, in a resource with `for_each` |
//!
//! Everything else is literal.

use grove_core::{
    addrs::{parse_instance_prefix, InstanceKey, ModulePath, ResourceAddr, ResourceInstanceAddr},
    states::EachMode,
    value::{PathStep, Value},
};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvalError {
    #[error("invalid reference {reference:?}: {reason}")]
    InvalidReference { reference: String, reason: String },
    #[error("invalid expression {0}: special objects must have exactly one key")]
    InvalidSpecial(String),
    #[error("{0} is not available here")]
    NotInScope(&'static str),
    #[error("{reference}: {reason}")]
    Traversal { reference: String, reason: String },
    #[error("{0} has no value yet")]
    NotEvaluated(String),
}

/// What a `$ref` refers to. Addresses are absolute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Resource {
        addr: ResourceAddr,
        key: Option<InstanceKey>,
        path: Vec<PathStep>,
    },
    ModuleOutput {
        module: ModulePath,
        name: String,
        path: Vec<PathStep>,
    },
    CountIndex,
    EachKey,
    EachValue,
}

impl Reference {
    /// The resource referenced, directly.
    pub fn resource(&self) -> Option<&ResourceAddr> {
        match self {
            Reference::Resource { addr, .. } => Some(addr),
            _ => None,
        }
    }
}

const SPECIALS: [&str; 4] = ["$ref", "$count_index", "$each_key", "$each_value"];

fn split_ident(s: &str) -> (&str, &str) {
    let end = s
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
        .unwrap_or(s.len());
    s.split_at(end)
}

fn parse_path(reference: &str, mut rest: &str) -> Result<Vec<PathStep>, EvalError> {
    let invalid = |reason: &str| EvalError::InvalidReference {
        reference: reference.to_string(),
        reason: reason.to_string(),
    };
    let mut path = Vec::new();
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix('.') {
            let (name, after) = split_ident(after);
            if name.is_empty() {
                return Err(invalid("expected an attribute name after '.'"));
            }
            path.push(PathStep::Attr(name.to_string()));
            rest = after;
        } else if let Some(after) = rest.strip_prefix("[\"") {
            let end = after.find("\"]").ok_or_else(|| invalid("unterminated key"))?;
            path.push(PathStep::Key(after[..end].to_string()));
            rest = &after[end + 2..];
        } else if let Some(after) = rest.strip_prefix('[') {
            let end = after.find(']').ok_or_else(|| invalid("expected ']'"))?;
            let index: usize = after[..end].parse().map_err(|_| invalid("invalid index"))?;
            path.push(PathStep::Index(index));
            rest = &after[end + 1..];
        } else {
            return Err(invalid("unexpected characters"));
        }
    }
    Ok(path)
}

/// Parse the string of a `$ref`, relative to `module`.
pub fn parse_reference(module: &ModulePath, s: &str) -> Result<Reference, EvalError> {
    if let Some(after) = s.strip_prefix("module.") {
        let (child, after) = split_ident(after);
        let output = after.strip_prefix('.').map(split_ident);
        return match output {
            Some((name, rest)) if !child.is_empty() && !name.is_empty() => Ok(Reference::ModuleOutput {
                module: module.child(child),
                name: name.to_string(),
                path: parse_path(s, rest)?,
            }),
            _ => Err(EvalError::InvalidReference {
                reference: s.to_string(),
                reason: "expected module.NAME.OUTPUT".to_string(),
            }),
        };
    }
    let (addr, key, rest) = parse_instance_prefix(s).map_err(|e| EvalError::InvalidReference {
        reference: s.to_string(),
        reason: e.reason,
    })?;
    Ok(Reference::Resource {
        addr: ResourceAddr::new(module.clone(), &addr.type_, &addr.name),
        key,
        path: parse_path(s, rest)?,
    })
}

fn special(obj: &serde_json::Map<String, serde_json::Value>) -> Option<&str> {
    if obj.len() != 1 {
        return None;
    }
    obj.keys().next().map(String::as_str).filter(|k| SPECIALS.contains(k))
}

/// Every reference in `expr`, in document order.
pub fn references(module: &ModulePath, expr: &serde_json::Value) -> Result<Vec<Reference>, EvalError> {
    let mut out = Vec::new();
    collect_references(module, expr, &mut out)?;
    Ok(out)
}

fn collect_references(
    module: &ModulePath,
    expr: &serde_json::Value,
    out: &mut Vec<Reference>,
) -> Result<(), EvalError> {
    match expr {
        serde_json::Value::Array(items) => {
            for item in items {
                collect_references(module, item, out)?;
            }
        }
        serde_json::Value::Object(obj) => match special(obj) {
            Some(key) => out.push(parse_special(module, key, &obj[key])?),
            None => {
                if obj.keys().any(|k| SPECIALS.contains(&k.as_str())) {
                    return Err(EvalError::InvalidSpecial(expr.to_string()));
                }
                for item in obj.values() {
                    collect_references(module, item, out)?;
                }
            }
        },
        _ => {}
    }
    Ok(())
}

fn parse_special(module: &ModulePath, key: &str, arg: &serde_json::Value) -> Result<Reference, EvalError> {
    match key {
        "$ref" => match arg.as_str() {
            Some(s) => parse_reference(module, s),
            None => Err(EvalError::InvalidReference {
                reference: arg.to_string(),
                reason: "$ref takes a string".to_string(),
            }),
        },
        "$count_index" => Ok(Reference::CountIndex),
        "$each_key" => Ok(Reference::EachKey),
        _ => Ok(Reference::EachValue),
    }
}

/// The values of resource instances and module outputs evaluated so far in
/// a walk. During planning these are planned values, which may contain
/// unknowns; during apply they are the new objects.
#[derive(Debug, Clone, Default)]
pub struct NamedValues {
    resources: BTreeMap<ResourceAddr, ResourceValues>,
    outputs: BTreeMap<(ModulePath, String), Value>,
}

#[derive(Debug, Clone, Default)]
struct ResourceValues {
    each_mode: EachMode,
    instances: BTreeMap<InstanceKey, Value>,
}

impl NamedValues {
    /// Declare a resource, so that it evaluates to an empty collection even
    /// without instances.
    pub fn set_resource(&mut self, addr: &ResourceAddr, each_mode: EachMode) {
        self.resources.entry(addr.clone()).or_default().each_mode = each_mode;
    }

    pub fn set_instance(&mut self, addr: &ResourceInstanceAddr, each_mode: EachMode, value: Value) {
        let rv = self.resources.entry(addr.resource.clone()).or_default();
        rv.each_mode = each_mode;
        rv.instances.insert(addr.key.clone(), value);
    }

    pub fn set_output(&mut self, module: &ModulePath, name: &str, value: Value) {
        self.outputs.insert((module.clone(), name.to_string()), value);
    }

    pub fn output(&self, module: &ModulePath, name: &str) -> Option<&Value> {
        self.outputs.get(&(module.clone(), name.to_string()))
    }

    fn resource_value(&self, addr: &ResourceAddr, key: Option<&InstanceKey>) -> Result<Value, EvalError> {
        let rv = self
            .resources
            .get(addr)
            .ok_or_else(|| EvalError::NotEvaluated(addr.to_string()))?;
        match key {
            Some(key) => rv.instances.get(key).cloned().ok_or_else(|| EvalError::Traversal {
                reference: addr.to_string(),
                reason: format!("no instance with key {}", key),
            }),
            None => Ok(match rv.each_mode {
                EachMode::NoEach => rv.instances.get(&InstanceKey::NoKey).cloned().unwrap_or_default(),
                EachMode::Count => Value::List(rv.instances.values().cloned().collect()),
                EachMode::ForEach => Value::Map(
                    rv.instances
                        .iter()
                        .filter_map(|(k, v)| match k {
                            InstanceKey::Str(s) => Some((s.clone(), v.clone())),
                            _ => None,
                        })
                        .collect(),
                ),
            }),
        }
    }
}

/// The `count`/`for_each` context of one instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Repetition {
    pub count_index: Option<i64>,
    pub each: Option<(String, Value)>,
}

impl Repetition {
    pub fn key(&self) -> InstanceKey {
        match (&self.count_index, &self.each) {
            (Some(i), _) => InstanceKey::Int(*i),
            (None, Some((k, _))) => InstanceKey::Str(k.clone()),
            (None, None) => InstanceKey::NoKey,
        }
    }
}

pub struct Scope<'a> {
    pub module: &'a ModulePath,
    pub values: &'a NamedValues,
    pub repetition: &'a Repetition,
}

/// Evaluate `expr`. Unknown values propagate: an attribute of an unknown
/// object is unknown.
pub fn evaluate(expr: &serde_json::Value, scope: &Scope) -> Result<Value, EvalError> {
    use serde_json::Value as J;
    Ok(match expr {
        J::Null => Value::Null,
        J::Bool(b) => Value::Bool(*b),
        J::Number(n) => Value::Number(n.clone()),
        J::String(s) => Value::String(s.clone()),
        J::Array(items) => Value::List(
            items
                .iter()
                .map(|item| evaluate(item, scope))
                .collect::<Result<_, _>>()?,
        ),
        J::Object(obj) => match special(obj) {
            Some(key) => {
                let reference = parse_special(scope.module, key, &obj[key])?;
                resolve(&reference, expr, scope)?
            }
            None => {
                if obj.keys().any(|k| SPECIALS.contains(&k.as_str())) {
                    return Err(EvalError::InvalidSpecial(expr.to_string()));
                }
                Value::Object(
                    obj.iter()
                        .map(|(k, v)| Ok((k.clone(), evaluate(v, scope)?)))
                        .collect::<Result<_, EvalError>>()?,
                )
            }
        },
    })
}

/// Evaluate `expr` with every reference unknown, as when validating a
/// configuration before anything has been planned.
pub fn evaluate_unresolved(expr: &serde_json::Value) -> Result<Value, EvalError> {
    use serde_json::Value as J;
    Ok(match expr {
        J::Array(items) => Value::List(items.iter().map(evaluate_unresolved).collect::<Result<_, _>>()?),
        J::Object(obj) => match special(obj) {
            Some(_) => Value::Unknown,
            None => {
                if obj.keys().any(|k| SPECIALS.contains(&k.as_str())) {
                    return Err(EvalError::InvalidSpecial(expr.to_string()));
                }
                Value::Object(
                    obj.iter()
                        .map(|(k, v)| Ok((k.clone(), evaluate_unresolved(v)?)))
                        .collect::<Result<_, EvalError>>()?,
                )
            }
        },
        J::Null => Value::Null,
        J::Bool(b) => Value::Bool(*b),
        J::Number(n) => Value::Number(n.clone()),
        J::String(s) => Value::String(s.clone()),
    })
}

fn resolve(reference: &Reference, expr: &serde_json::Value, scope: &Scope) -> Result<Value, EvalError> {
    match reference {
        Reference::CountIndex => scope
            .repetition
            .count_index
            .map(Value::from)
            .ok_or(EvalError::NotInScope("$count_index")),
        Reference::EachKey => scope
            .repetition
            .each
            .as_ref()
            .map(|(k, _)| Value::from(k.as_str()))
            .ok_or(EvalError::NotInScope("$each_key")),
        Reference::EachValue => scope
            .repetition
            .each
            .as_ref()
            .map(|(_, v)| v.clone())
            .ok_or(EvalError::NotInScope("$each_value")),
        Reference::Resource { addr, key, path } => {
            let value = scope.values.resource_value(addr, key.as_ref())?;
            traverse(value, path, expr)
        }
        Reference::ModuleOutput { module, name, path } => {
            let value = scope
                .values
                .output(module, name)
                .cloned()
                .ok_or_else(|| EvalError::NotEvaluated(format!("{}.{}", module, name)))?;
            traverse(value, path, expr)
        }
    }
}

fn traverse(mut value: Value, path: &[PathStep], expr: &serde_json::Value) -> Result<Value, EvalError> {
    let fail = |reason: String| EvalError::Traversal {
        reference: expr.to_string(),
        reason,
    };
    for step in path {
        value = match (value, step) {
            (Value::Unknown, _) => return Ok(Value::Unknown),
            (Value::Object(mut attrs) | Value::Map(mut attrs), PathStep::Attr(name) | PathStep::Key(name)) => attrs
                .remove(name)
                .ok_or_else(|| fail(format!("no attribute or key {:?}", name)))?,
            (Value::List(items), PathStep::Index(i)) => items
                .into_iter()
                .nth(*i)
                .ok_or_else(|| fail(format!("index {} out of range", i)))?,
            (Value::Null, _) => return Err(fail(format!("cannot look up {} in a null value", step))),
            (other, _) => return Err(fail(format!("cannot look up {} in a {}", step, other.type_name()))),
        };
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn root() -> ModulePath {
        ModulePath::root()
    }

    #[test]
    fn parse_references() {
        assert_eq!(
            parse_reference(&root(), "local_file.a[0].id").unwrap(),
            Reference::Resource {
                addr: ResourceAddr::new(root(), "local_file", "a"),
                key: Some(InstanceKey::Int(0)),
                path: vec![PathStep::Attr("id".to_string())],
            }
        );
        let in_child = root().child("net");
        assert_eq!(
            parse_reference(&in_child, "module.sub.ids[1]").unwrap(),
            Reference::ModuleOutput {
                module: in_child.child("sub"),
                name: "ids".to_string(),
                path: vec![PathStep::Index(1)],
            }
        );
        assert!(parse_reference(&root(), "module.sub").is_err());
        assert!(parse_reference(&root(), "local_file").is_err());
    }

    #[test]
    fn unresolved_references_are_unknown() {
        let expr = json!({"name": "a", "size": {"$ref": "x.one.size"}, "tags": [{"$each_key": true}]});
        let v = evaluate_unresolved(&expr).unwrap();
        assert_eq!(v.get_attr("name"), Value::from("a"));
        assert_eq!(v.get_attr("size"), Value::Unknown);
        assert_eq!(v.get_attr("tags"), Value::List(vec![Value::Unknown]));
    }

    #[test]
    fn collect_references_in_document_order() {
        let expr = json!({
            "a": [{"$ref": "x.one.id"}, "literal"],
            "b": {"$count_index": true},
        });
        let refs = references(&root(), &expr).unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].resource().unwrap().to_string(), "x.one");
        assert_eq!(refs[1], Reference::CountIndex);

        let ambiguous = json!({"$ref": "x.one", "other": 1});
        assert!(matches!(references(&root(), &ambiguous), Err(EvalError::InvalidSpecial(_))));
    }

    #[test]
    fn evaluate_resource_references() {
        let mut values = NamedValues::default();
        let one = ResourceAddr::new(root(), "x", "one");
        values.set_instance(
            &one.instance(InstanceKey::Int(0)),
            EachMode::Count,
            Value::object([("id", Value::from("i-0"))]),
        );
        values.set_instance(
            &one.instance(InstanceKey::Int(1)),
            EachMode::Count,
            Value::object([("id", Value::Unknown)]),
        );
        let rep = Repetition {
            count_index: Some(3),
            each: None,
        };
        let scope = Scope {
            module: &ModulePath::root(),
            values: &values,
            repetition: &rep,
        };

        let v = evaluate(
            &json!({
                "first": {"$ref": "x.one[0].id"},
                "second": {"$ref": "x.one[1].id"},
                "all": {"$ref": "x.one[1]"},
                "n": {"$count_index": true},
            }),
            &scope,
        )
        .unwrap();
        assert_eq!(v.get_attr("first"), Value::from("i-0"));
        assert_eq!(v.get_attr("second"), Value::Unknown);
        assert_eq!(v.get_attr("n"), Value::from(3));

        let whole = evaluate(&json!({"$ref": "x.one"}), &scope).unwrap();
        assert_eq!(whole.elements().unwrap().len(), 2);

        assert!(matches!(
            evaluate(&json!({"$each_key": true}), &scope),
            Err(EvalError::NotInScope("$each_key"))
        ));
        assert!(matches!(
            evaluate(&json!({"$ref": "x.two.id"}), &scope),
            Err(EvalError::NotEvaluated(_))
        ));
        assert!(evaluate(&json!({"$ref": "x.one[5].id"}), &scope).is_err());
    }

    #[test]
    fn evaluate_module_outputs() {
        let mut values = NamedValues::default();
        values.set_output(&root().child("net"), "cidr", Value::from("10.0.0.0/8"));
        let rep = Repetition::default();
        let scope = Scope {
            module: &ModulePath::root(),
            values: &values,
            repetition: &rep,
        };
        assert_eq!(
            evaluate(&json!({"$ref": "module.net.cidr"}), &scope).unwrap(),
            Value::from("10.0.0.0/8")
        );
    }
}
