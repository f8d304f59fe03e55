use crate::value::{format_path, PathStep, Type, Value, ValueError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The schemas of everything a provider offers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSchema {
    /// Schema for the provider configuration itself
    #[serde(default)]
    pub provider: Option<Schema>,
    /// Schemas for each resource type this provider supports
    #[serde(default)]
    pub resource_schemas: BTreeMap<String, Schema>,
}

impl ProviderSchema {
    pub fn get_resource_schema(&self, type_: &str) -> Option<&Schema> {
        self.resource_schemas.get(type_)
    }
}

/// Schema definition for a resource or provider configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    /// Version of this schema. Objects in the state that were written under an
    /// older version are upgraded by the provider before use.
    #[serde(default)]
    pub version: u64,
    pub block: Block,
}

/// A configuration block containing attributes and nested blocks
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    #[serde(default)]
    pub attributes: BTreeMap<String, Attribute>,
    #[serde(default)]
    pub block_types: BTreeMap<String, NestedBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Schema for a single attribute.
///
/// Exactly one of these flag combinations is valid: `required`, `optional`,
/// `computed`, or `optional` + `computed`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    /// Ignored when `nested_type` is set.
    #[serde(rename = "type", default)]
    pub type_: Type,
    /// Structural attribute type with its own per-attribute flags.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nested_type: Option<Object>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub computed: bool,
    #[serde(default)]
    pub sensitive: bool,
}

impl Attribute {
    pub fn required(type_: Type) -> Self {
        Attribute {
            type_,
            required: true,
            ..Default::default()
        }
    }

    pub fn optional(type_: Type) -> Self {
        Attribute {
            type_,
            optional: true,
            ..Default::default()
        }
    }

    pub fn computed(type_: Type) -> Self {
        Attribute {
            type_,
            computed: true,
            ..Default::default()
        }
    }

    pub fn optional_computed(type_: Type) -> Self {
        Attribute {
            type_,
            optional: true,
            computed: true,
            ..Default::default()
        }
    }

    pub fn with_nested_type(mut self, object: Object) -> Self {
        self.nested_type = Some(object);
        self
    }

    pub fn implied_type(&self) -> Type {
        match &self.nested_type {
            Some(object) => object.implied_type(),
            None => self.type_.clone(),
        }
    }
}

/// A nested attribute type: a set of attributes, nested as one object or as
/// a collection of objects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Object {
    pub attributes: BTreeMap<String, Attribute>,
    pub nesting: NestingMode,
}

impl Object {
    fn object_type(&self) -> Type {
        Type::Object(
            self.attributes
                .iter()
                .map(|(name, attr)| (name.clone(), attr.implied_type()))
                .collect(),
        )
    }

    pub fn implied_type(&self) -> Type {
        self.nesting.wrap(self.object_type())
    }

    pub fn attribute_by_path(&self, path: &[PathStep]) -> Option<&Attribute> {
        attribute_by_path(SchemaNode::Object(self), path)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NestedBlock {
    pub block: Block,
    pub nesting: NestingMode,
    /// Zero means no limit.
    #[serde(default)]
    pub min_items: u64,
    /// Zero means no limit.
    #[serde(default)]
    pub max_items: u64,
}

/// How nested blocks and nested attribute types are structured
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NestingMode {
    /// At most one instance, null when absent
    #[default]
    Single,
    /// Exactly one instance, with its attributes null when absent
    Group,
    List,
    Set,
    /// Keyed by string
    Map,
}

impl NestingMode {
    fn wrap(self, element: Type) -> Type {
        match self {
            NestingMode::Single | NestingMode::Group => element,
            NestingMode::List => Type::list(element),
            NestingMode::Set => Type::set(element),
            NestingMode::Map => Type::map(element),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("invalid schema at {path}: {message}")]
    InvalidSchema { path: String, message: String },
    #[error("{path}: the argument is required, but no definition was found")]
    MissingRequired { path: String },
    #[error("{path}: the attribute is computed by the provider and cannot be set in configuration")]
    ComputedOnly { path: String },
    #[error("{path}: an argument named {name:?} is not expected here")]
    Unsupported { path: String, name: String },
    #[error("{path}: at least {min} blocks are required, found {found}")]
    TooFewBlocks { path: String, min: u64, found: u64 },
    #[error("{path}: no more than {max} blocks are allowed, found {found}")]
    TooManyBlocks { path: String, max: u64, found: u64 },
    #[error(transparent)]
    Type(ValueError),
}

/// A point in the schema tree: a block, or a nested attribute type.
#[derive(Debug, Clone, Copy)]
enum SchemaNode<'a> {
    Block(&'a Block),
    Object(&'a Object),
}

// Primitive attributes have no children; only element steps may follow them.
static EMPTY_OBJECT: Object = Object {
    attributes: BTreeMap::new(),
    nesting: NestingMode::Single,
};

/// Find the attribute a value path leads to. Element steps (indices, keys and
/// set elements) do not change the schema position and are skipped.
fn attribute_by_path<'a>(mut node: SchemaNode<'a>, path: &[PathStep]) -> Option<&'a Attribute> {
    let mut found = None;
    for step in path {
        let PathStep::Attr(name) = step else {
            continue;
        };
        match node {
            SchemaNode::Block(block) => {
                if let Some(attr) = block.attributes.get(name) {
                    found = Some(attr);
                    node = SchemaNode::Object(attr.nested_type.as_ref().unwrap_or(&EMPTY_OBJECT));
                } else if let Some(nested) = block.block_types.get(name) {
                    found = None;
                    node = SchemaNode::Block(&nested.block);
                } else {
                    return None;
                }
            }
            SchemaNode::Object(object) => {
                let attr = object.attributes.get(name)?;
                found = Some(attr);
                node = SchemaNode::Object(attr.nested_type.as_ref().unwrap_or(&EMPTY_OBJECT));
            }
        }
    }
    found
}

impl Block {
    pub fn implied_type(&self) -> Type {
        let mut attrs: BTreeMap<String, Type> = self
            .attributes
            .iter()
            .map(|(name, attr)| (name.clone(), attr.implied_type()))
            .collect();
        for (name, nested) in &self.block_types {
            attrs.insert(name.clone(), nested.nesting.wrap(nested.block.implied_type()));
        }
        Type::Object(attrs)
    }

    /// The value of this block when nothing is configured: null attributes,
    /// absent single blocks, empty collections of blocks.
    pub fn empty_value(&self) -> Value {
        let mut attrs: BTreeMap<String, Value> =
            self.attributes.keys().map(|name| (name.clone(), Value::Null)).collect();
        for (name, nested) in &self.block_types {
            let v = match nested.nesting {
                NestingMode::Single => Value::Null,
                NestingMode::Group => nested.block.empty_value(),
                NestingMode::List => Value::List(Vec::new()),
                NestingMode::Set => Value::Set(Vec::new()),
                NestingMode::Map => Value::Map(BTreeMap::new()),
            };
            attrs.insert(name.clone(), v);
        }
        Value::Object(attrs)
    }

    pub fn attribute_by_path(&self, path: &[PathStep]) -> Option<&Attribute> {
        attribute_by_path(SchemaNode::Block(self), path)
    }

    /// Check that the schema itself is well formed.
    pub fn internal_validate(&self) -> Result<(), SchemaError> {
        self.internal_validate_at(&mut Vec::new())
    }

    fn internal_validate_at(&self, path: &mut Vec<PathStep>) -> Result<(), SchemaError> {
        for (name, attr) in &self.attributes {
            path.push(PathStep::Attr(name.clone()));
            validate_name(name, path)?;
            if self.block_types.contains_key(name) {
                return Err(invalid(path, "name is used both for an attribute and a block type"));
            }
            validate_attribute_flags(attr, path)?;
            path.pop();
        }
        for (name, nested) in &self.block_types {
            path.push(PathStep::Attr(name.clone()));
            validate_name(name, path)?;
            if nested.max_items != 0 && nested.min_items > nested.max_items {
                return Err(invalid(path, "min_items is greater than max_items"));
            }
            match nested.nesting {
                NestingMode::Single | NestingMode::Group if nested.min_items > 1 || nested.max_items > 1 => {
                    return Err(invalid(path, "single and group blocks may have at most one item"));
                }
                NestingMode::Map if nested.min_items != 0 || nested.max_items != 0 => {
                    return Err(invalid(path, "map blocks cannot restrict the number of items"));
                }
                _ => {}
            }
            nested.block.internal_validate_at(path)?;
            path.pop();
        }
        Ok(())
    }

    /// Check a configuration value against the schema, collecting every
    /// problem rather than stopping at the first.
    pub fn validate_config_value(&self, config: &Value) -> Vec<SchemaError> {
        let mut errors = Vec::new();
        validate_block(self, config, &mut Vec::new(), &mut errors);
        errors
    }
}

fn invalid(path: &[PathStep], message: &str) -> SchemaError {
    SchemaError::InvalidSchema {
        path: format_path(path),
        message: message.to_string(),
    }
}

fn validate_name(name: &str, path: &[PathStep]) -> Result<(), SchemaError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(invalid(path, "names must be lowercase identifiers"))
    }
}

fn validate_attribute_flags(attr: &Attribute, path: &mut Vec<PathStep>) -> Result<(), SchemaError> {
    match (attr.required, attr.optional, attr.computed) {
        (true, false, false) | (false, true, false) | (false, false, true) | (false, true, true) => {}
        (false, false, false) => return Err(invalid(path, "must set one of required, optional or computed")),
        _ => {
            return Err(invalid(
                path,
                "required cannot be combined with optional or computed",
            ))
        }
    }
    if let Some(object) = &attr.nested_type {
        for (name, nested_attr) in &object.attributes {
            path.push(PathStep::Attr(name.clone()));
            validate_name(name, path)?;
            validate_attribute_flags(nested_attr, path)?;
            path.pop();
        }
    }
    Ok(())
}

fn validate_block(block: &Block, value: &Value, path: &mut Vec<PathStep>, errors: &mut Vec<SchemaError>) {
    let attrs = match value {
        Value::Null | Value::Unknown => return,
        Value::Object(attrs) => attrs,
        other => {
            errors.push(SchemaError::Type(ValueError::TypeMismatch {
                path: format_path(path),
                expected: "block".to_string(),
                found: other.type_name().to_string(),
            }));
            return;
        }
    };
    for name in attrs.keys() {
        if !block.attributes.contains_key(name) && !block.block_types.contains_key(name) {
            errors.push(SchemaError::Unsupported {
                path: format_path(path),
                name: name.clone(),
            });
        }
    }
    validate_attributes(&block.attributes, value, path, errors);
    for (name, nested) in &block.block_types {
        path.push(PathStep::Attr(name.clone()));
        let v = value.get_attr(name);
        let count = match (&v, nested.nesting) {
            (Value::Unknown, _) => None,
            (Value::Null, _) => Some(0),
            (_, NestingMode::Single | NestingMode::Group) => Some(1),
            (Value::List(items) | Value::Set(items), _) => Some(items.len() as u64),
            (Value::Map(items), _) => Some(items.len() as u64),
            _ => None,
        };
        if let Some(found) = count {
            if found < nested.min_items {
                errors.push(SchemaError::TooFewBlocks {
                    path: format_path(path),
                    min: nested.min_items,
                    found,
                });
            }
            if nested.max_items != 0 && found > nested.max_items {
                errors.push(SchemaError::TooManyBlocks {
                    path: format_path(path),
                    max: nested.max_items,
                    found,
                });
            }
        }
        for_each_nested(&v, nested.nesting, path, &mut |element, path| {
            validate_block(&nested.block, element, path, errors)
        });
        path.pop();
    }
}

fn validate_attributes(
    attributes: &BTreeMap<String, Attribute>,
    value: &Value,
    path: &mut Vec<PathStep>,
    errors: &mut Vec<SchemaError>,
) {
    for (name, attr) in attributes {
        path.push(PathStep::Attr(name.clone()));
        let v = value.get_attr(name);
        if attr.required && v.is_null() {
            errors.push(SchemaError::MissingRequired {
                path: format_path(path),
            });
        } else if attr.computed && !attr.optional && !v.is_null() {
            errors.push(SchemaError::ComputedOnly {
                path: format_path(path),
            });
        } else if let Some(object) = &attr.nested_type {
            for_each_nested(&v, object.nesting, path, &mut |element, path| {
                if let Some(element_attrs) = element.as_attrs() {
                    for extra in element_attrs.keys().filter(|k| !object.attributes.contains_key(*k)) {
                        errors.push(SchemaError::Unsupported {
                            path: format_path(path),
                            name: extra.clone(),
                        });
                    }
                }
                validate_attributes(&object.attributes, element, path, errors)
            });
        } else if let Err(err) = v.conforms_to(&attr.type_) {
            errors.push(SchemaError::Type(prefixed(err, path)));
        }
        path.pop();
    }
}

/// Re-anchor an error from [`Value::conforms_to`] at `prefix`.
fn prefixed(err: ValueError, prefix: &[PathStep]) -> ValueError {
    let join = |inner: String| {
        if inner == format_path(&[]) {
            format_path(prefix)
        } else {
            format!("{}{}", format_path(prefix), inner)
        }
    };
    match err {
        ValueError::Unknown { path } => ValueError::Unknown { path: join(path) },
        ValueError::TypeMismatch { path, expected, found } => ValueError::TypeMismatch {
            path: join(path),
            expected,
            found,
        },
    }
}

/// Call `f` with each element of a nested block or nested attribute value.
fn for_each_nested(
    value: &Value,
    nesting: NestingMode,
    path: &mut Vec<PathStep>,
    f: &mut dyn FnMut(&Value, &mut Vec<PathStep>),
) {
    match (value, nesting) {
        (Value::Null | Value::Unknown, _) => {}
        (_, NestingMode::Single | NestingMode::Group) => f(value, path),
        (Value::List(items), _) => {
            for (i, item) in items.iter().enumerate() {
                path.push(PathStep::Index(i));
                f(item, path);
                path.pop();
            }
        }
        (Value::Set(items), _) => {
            for item in items {
                path.push(PathStep::SetElement);
                f(item, path);
                path.pop();
            }
        }
        (Value::Map(items), _) => {
            for (k, item) in items {
                path.push(PathStep::Key(k.clone()));
                f(item, path);
                path.pop();
            }
        }
        _ => {}
    }
}
