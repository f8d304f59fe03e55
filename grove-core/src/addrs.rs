//! Addresses of modules, resources, resource instances, providers and
//! deposed objects.
//!
//! Every address has a canonical string form, used both for display and for
//! (de)serialization, so that addresses can be keys of JSON objects in the
//! state and plan files:
//!
//! ```text
//! module.network.local_file.config["primary"]
//! ^^^^^^^^^^^^^^ ^^^^^^^^^^ ^^^^^^ ^^^^^^^^^^^
//! module path    type       name   instance key
//! ```

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt::Display, str::FromStr};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid address {input:?}: {reason}")]
pub struct ParseError {
    pub input: String,
    pub reason: String,
}

impl ParseError {
    fn new(input: &str, reason: impl Into<String>) -> Self {
        ParseError {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

macro_rules! serde_via_string {
    ($t:ty) => {
        impl Serialize for $t {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }
        impl<'de> Deserialize<'de> for $t {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

/// The path of a module instance, from the root module downwards.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ModulePath(pub Vec<String>);

impl ModulePath {
    pub fn root() -> Self {
        ModulePath(Vec::new())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn child(&self, name: &str) -> Self {
        let mut path = self.0.clone();
        path.push(name.to_string());
        ModulePath(path)
    }

    /// Whether `other` is this module or one of its descendants.
    pub fn contains(&self, other: &ModulePath) -> bool {
        other.0.starts_with(&self.0)
    }
}

impl Display for ModulePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for name in &self.0 {
            if !first {
                write!(f, ".")?;
            }
            first = false;
            write!(f, "module.{}", name)?;
        }
        Ok(())
    }
}

impl FromStr for ModulePath {
    type Err = ParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, rest) = parse_module_prefix(s)?;
        if !rest.is_empty() {
            return Err(ParseError::new(s, "unexpected trailing characters"));
        }
        Ok(path)
    }
}
serde_via_string!(ModulePath);

/// A resource, as declared in configuration, before count/for_each expansion.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceAddr {
    pub module: ModulePath,
    pub type_: String,
    pub name: String,
}

impl ResourceAddr {
    pub fn new(module: ModulePath, type_: &str, name: &str) -> Self {
        ResourceAddr {
            module,
            type_: type_.to_string(),
            name: name.to_string(),
        }
    }

    pub fn instance(&self, key: InstanceKey) -> ResourceInstanceAddr {
        ResourceInstanceAddr {
            resource: self.clone(),
            key,
        }
    }
}

impl Display for ResourceAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.module.is_root() {
            write!(f, "{}.", self.module)?;
        }
        write!(f, "{}.{}", self.type_, self.name)
    }
}

impl FromStr for ResourceAddr {
    type Err = ParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match parse_instance_prefix(s)? {
            (addr, None, "") => Ok(addr),
            (_, Some(_), _) => Err(ParseError::new(
                s,
                "resource address must not have an instance key",
            )),
            (_, None, _) => Err(ParseError::new(s, "unexpected trailing characters")),
        }
    }
}
serde_via_string!(ResourceAddr);

/// The key that distinguishes the instances of a resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InstanceKey {
    /// The resource has neither `count` nor `for_each`.
    NoKey,
    /// An index from `count`.
    Int(i64),
    /// A key from `for_each`.
    Str(String),
}

impl Display for InstanceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceKey::NoKey => Ok(()),
            InstanceKey::Int(i) => write!(f, "[{}]", i),
            InstanceKey::Str(s) => write!(f, "[\"{}\"]", s),
        }
    }
}

impl FromStr for InstanceKey {
    type Err = ParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(InstanceKey::NoKey);
        }
        let (key, rest) = parse_key(s).map_err(|reason| ParseError::new(s, reason))?;
        if !rest.is_empty() {
            return Err(ParseError::new(s, "unexpected trailing characters"));
        }
        Ok(key)
    }
}
serde_via_string!(InstanceKey);

/// One concrete instance of a resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceInstanceAddr {
    pub resource: ResourceAddr,
    pub key: InstanceKey,
}

impl Display for ResourceInstanceAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.resource, self.key)
    }
}

impl FromStr for ResourceInstanceAddr {
    type Err = ParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match parse_instance_prefix(s)? {
            (resource, key, "") => Ok(ResourceInstanceAddr {
                resource,
                key: key.unwrap_or(InstanceKey::NoKey),
            }),
            _ => Err(ParseError::new(s, "unexpected trailing characters")),
        }
    }
}
serde_via_string!(ResourceInstanceAddr);

/// A provider configuration. Provider configurations are declared in the
/// root module and inherited by child modules.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProviderAddr {
    pub name: String,
}

impl ProviderAddr {
    pub fn new(name: &str) -> Self {
        ProviderAddr {
            name: name.to_string(),
        }
    }
}

impl Display for ProviderAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "provider.{}", self.name)
    }
}

impl FromStr for ProviderAddr {
    type Err = ParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s
            .strip_prefix("provider.")
            .ok_or_else(|| ParseError::new(s, "provider address must start with 'provider.'"))?;
        let (ident, rest) = split_ident(name);
        if ident.is_empty() || !rest.is_empty() {
            return Err(ParseError::new(s, "invalid provider name"));
        }
        Ok(ProviderAddr::new(ident))
    }
}
serde_via_string!(ProviderAddr);

/// Identifies one deposed object of a resource instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeposedKey(String);

impl DeposedKey {
    /// Allocate a fresh random key.
    ///
    /// Keys only need to be unique within one resource instance; callers
    /// retry when the key is already taken.
    pub fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4();
        DeposedKey(uuid.simple().to_string()[..8].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for DeposedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DeposedKey {
    type Err = ParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 8 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ParseError::new(s, "deposed key must be 8 hexadecimal digits"));
        }
        Ok(DeposedKey(s.to_ascii_lowercase()))
    }
}
serde_via_string!(DeposedKey);

/// A `--target` argument: a module, a whole resource, or a single instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Target {
    Module(ModulePath),
    Resource(ResourceAddr),
    Instance(ResourceInstanceAddr),
}

impl Target {
    pub fn matches_resource(&self, addr: &ResourceAddr) -> bool {
        match self {
            Target::Module(path) => path.contains(&addr.module),
            Target::Resource(target) => target == addr,
            // A resource is relevant if any of its instances is targeted
            Target::Instance(target) => &target.resource == addr,
        }
    }

    pub fn matches_instance(&self, addr: &ResourceInstanceAddr) -> bool {
        match self {
            Target::Module(path) => path.contains(&addr.resource.module),
            Target::Resource(target) => target == &addr.resource,
            Target::Instance(target) => target == addr,
        }
    }
}

impl Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Module(m) => write!(f, "{}", m),
            Target::Resource(r) => write!(f, "{}", r),
            Target::Instance(i) => write!(f, "{}", i),
        }
    }
}

impl FromStr for Target {
    type Err = ParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (module, rest) = parse_module_prefix(s)?;
        if rest.is_empty() {
            if module.is_root() {
                return Err(ParseError::new(s, "empty target"));
            }
            return Ok(Target::Module(module));
        }
        match parse_instance_prefix(s)? {
            (resource, None, "") => Ok(Target::Resource(resource)),
            (resource, Some(key), "") => Ok(Target::Instance(ResourceInstanceAddr { resource, key })),
            _ => Err(ParseError::new(s, "unexpected trailing characters")),
        }
    }
}
serde_via_string!(Target);

fn split_ident(s: &str) -> (&str, &str) {
    let end = s
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
        .unwrap_or(s.len());
    s.split_at(end)
}

fn parse_key(s: &str) -> Result<(InstanceKey, &str), String> {
    let inner = s
        .strip_prefix('[')
        .ok_or_else(|| "expected '['".to_string())?;
    if let Some(quoted) = inner.strip_prefix('"') {
        let end = quoted
            .find('"')
            .ok_or_else(|| "unterminated string key".to_string())?;
        let rest = quoted[end + 1..]
            .strip_prefix(']')
            .ok_or_else(|| "expected ']' after string key".to_string())?;
        Ok((InstanceKey::Str(quoted[..end].to_string()), rest))
    } else {
        let end = inner.find(']').ok_or_else(|| "expected ']'".to_string())?;
        let index: i64 = inner[..end]
            .parse()
            .map_err(|_| format!("invalid instance index {:?}", &inner[..end]))?;
        Ok((InstanceKey::Int(index), &inner[end + 1..]))
    }
}

fn parse_module_prefix(s: &str) -> Result<(ModulePath, &str), ParseError> {
    let mut path = Vec::new();
    let mut rest = s;
    while let Some(after) = rest.strip_prefix("module.") {
        let (name, after) = split_ident(after);
        if name.is_empty() {
            return Err(ParseError::new(s, "expected a module name after 'module.'"));
        }
        path.push(name.to_string());
        if after.is_empty() {
            rest = after;
            break;
        }
        rest = after
            .strip_prefix('.')
            .ok_or_else(|| ParseError::new(s, "expected '.' after module name"))?;
    }
    Ok((ModulePath(path), rest))
}

/// Parse the leading resource (and optional instance key) of `s`, returning
/// the remainder, which is empty for plain addresses and holds an attribute
/// path (`.id`) for references.
pub fn parse_instance_prefix(s: &str) -> Result<(ResourceAddr, Option<InstanceKey>, &str), ParseError> {
    let (module, rest) = parse_module_prefix(s)?;
    let (type_, rest) = split_ident(rest);
    if type_.is_empty() {
        return Err(ParseError::new(s, "expected a resource type"));
    }
    let rest = rest
        .strip_prefix('.')
        .ok_or_else(|| ParseError::new(s, "expected '.' after resource type"))?;
    let (name, rest) = split_ident(rest);
    if name.is_empty() {
        return Err(ParseError::new(s, "expected a resource name"));
    }
    let (key, rest) = if rest.starts_with('[') {
        let (key, rest) = parse_key(rest).map_err(|reason| ParseError::new(s, reason))?;
        (Some(key), rest)
    } else {
        (None, rest)
    };
    Ok((ResourceAddr::new(module, type_, name), key, rest))
}
