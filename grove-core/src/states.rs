//! The state: the record of every real-world object that grove manages.
//!
//! The in-memory [`State`] is a plain tree, mutated through the methods below.
//! Persisting it, and sharing it between concurrently running vertices, is
//! the business of the engine.

use crate::{
    addrs::{DeposedKey, InstanceKey, ModulePath, ProviderAddr, ResourceAddr, ResourceInstanceAddr},
    value::{Type, Value, ValueError},
};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub const STATE_FORMAT_VERSION: u64 = 4;
const STATE_TYPE: &str = "groveState";

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("unsupported state format version {0}, expected {STATE_FORMAT_VERSION}")]
    UnsupportedVersion(u64),
    #[error("could not parse state: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{addr}: {source}")]
    Value {
        addr: ResourceInstanceAddr,
        source: ValueError,
    },
}

/// The root of a state file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    #[serde(rename = "_type", deserialize_with = "type_is_grove_state")]
    type_: String,
    pub format_version: u64,
    /// Identifies a series of snapshots of the same deployment. Assigned once
    /// when the state is created.
    pub lineage: String,
    /// Incremented every time the state is persisted.
    pub serial: u64,
    #[serde(default)]
    pub modules: BTreeMap<ModulePath, ModuleState>,
}

fn type_is_grove_state<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    if s == STATE_TYPE {
        Ok(s)
    } else {
        Err(serde::de::Error::custom(format!(
            "unexpected _type in grove state: expected '{}', got '{}'",
            STATE_TYPE, s
        )))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleState {
    #[serde(default)]
    pub resources: BTreeMap<ResourceAddr, ResourceState>,
    #[serde(default)]
    pub outputs: BTreeMap<String, OutputValue>,
}

impl ModuleState {
    fn is_empty(&self) -> bool {
        self.resources.is_empty() && self.outputs.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputValue {
    pub value: serde_json::Value,
    #[serde(default)]
    pub sensitive: bool,
}

/// How the instances of a resource are keyed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EachMode {
    #[default]
    NoEach,
    Count,
    ForEach,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceState {
    /// The provider configuration that manages the objects of this resource.
    /// Needed to destroy them after the resource is removed from configuration.
    pub provider: ProviderAddr,
    #[serde(default)]
    pub each_mode: EachMode,
    #[serde(default)]
    pub instances: BTreeMap<InstanceKey, ResourceInstance>,
}

/// The objects tracked for one instance address: at most one current object
/// and any number of deposed ones awaiting destruction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInstance {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<ResourceInstanceObjectSrc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub deposed: BTreeMap<DeposedKey, ResourceInstanceObjectSrc>,
}

impl ResourceInstance {
    pub fn has_objects(&self) -> bool {
        self.current.is_some() || !self.deposed.is_empty()
    }

    /// A key that no deposed object of this instance uses yet.
    pub fn fresh_deposed_key(&self) -> DeposedKey {
        loop {
            let key = DeposedKey::generate();
            if !self.deposed.contains_key(&key) {
                return key;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectStatus {
    #[default]
    Ready,
    /// The object may be in an inconsistent state. It is replaced, never
    /// updated.
    Tainted,
    /// Exists only during planning, as a placeholder for an object that will
    /// be created.
    Planned,
}

/// The persisted form of an object: its attributes are plain JSON, to be
/// decoded under the resource type's schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInstanceObjectSrc {
    #[serde(default)]
    pub status: ObjectStatus,
    #[serde(default)]
    pub schema_version: u64,
    pub attributes: serde_json::Value,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub dependencies: BTreeSet<ResourceAddr>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub create_before_destroy: bool,
}

impl ResourceInstanceObjectSrc {
    pub fn decode(&self, ty: &Type) -> Result<ResourceInstanceObject, ValueError> {
        Ok(ResourceInstanceObject {
            status: self.status,
            value: Value::from_json(&self.attributes, ty)?,
            dependencies: self.dependencies.clone(),
            create_before_destroy: self.create_before_destroy,
        })
    }
}

/// A decoded object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInstanceObject {
    pub status: ObjectStatus,
    pub value: Value,
    pub dependencies: BTreeSet<ResourceAddr>,
    pub create_before_destroy: bool,
}

impl ResourceInstanceObject {
    /// Encode for persisting. Objects containing unknown values cannot be
    /// persisted.
    pub fn encode(&self, schema_version: u64) -> Result<ResourceInstanceObjectSrc, ValueError> {
        Ok(ResourceInstanceObjectSrc {
            status: self.status,
            schema_version,
            attributes: self.value.to_json()?,
            dependencies: self.dependencies.clone(),
            create_before_destroy: self.create_before_destroy,
        })
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    /// An empty state with a fresh lineage.
    pub fn new() -> Self {
        State {
            type_: STATE_TYPE.to_string(),
            format_version: STATE_FORMAT_VERSION,
            lineage: uuid::Uuid::new_v4().to_string(),
            serial: 0,
            modules: BTreeMap::from([(ModulePath::root(), ModuleState::default())]),
        }
    }

    pub fn from_json(json: serde_json::Value) -> Result<Self, StateError> {
        let version = json
            .get("format_version")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        if version != STATE_FORMAT_VERSION {
            return Err(StateError::UnsupportedVersion(version));
        }
        Ok(serde_json::from_value(json)?)
    }

    pub fn to_json(&self) -> Result<serde_json::Value, StateError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn is_empty(&self) -> bool {
        self.modules.values().all(|m| m.resources.is_empty())
    }

    pub fn module(&self, path: &ModulePath) -> Option<&ModuleState> {
        self.modules.get(path)
    }

    pub fn ensure_module(&mut self, path: &ModulePath) -> &mut ModuleState {
        self.modules.entry(path.clone()).or_default()
    }

    pub fn resource(&self, addr: &ResourceAddr) -> Option<&ResourceState> {
        self.module(&addr.module)?.resources.get(addr)
    }

    pub fn resource_instance(&self, addr: &ResourceInstanceAddr) -> Option<&ResourceInstance> {
        self.resource(&addr.resource)?.instances.get(&addr.key)
    }

    pub fn current_object(&self, addr: &ResourceInstanceAddr) -> Option<&ResourceInstanceObjectSrc> {
        self.resource_instance(addr)?.current.as_ref()
    }

    pub fn deposed_object(&self, addr: &ResourceInstanceAddr, key: &DeposedKey) -> Option<&ResourceInstanceObjectSrc> {
        self.resource_instance(addr)?.deposed.get(key)
    }

    /// Every resource in every module, in address order.
    pub fn all_resources(&self) -> impl Iterator<Item = (&ResourceAddr, &ResourceState)> {
        self.modules.values().flat_map(|m| m.resources.iter())
    }

    /// Every instance that has at least one object, in address order.
    pub fn all_instances(&self) -> impl Iterator<Item = (ResourceInstanceAddr, &ResourceInstance)> {
        self.all_resources().flat_map(|(addr, rs)| {
            rs.instances
                .iter()
                .filter(|(_, inst)| inst.has_objects())
                .map(move |(key, inst)| (addr.instance(key.clone()), inst))
        })
    }

    fn ensure_resource(&mut self, addr: &ResourceAddr, provider: &ProviderAddr) -> &mut ResourceState {
        let rs = self
            .ensure_module(&addr.module)
            .resources
            .entry(addr.clone())
            .or_insert_with(|| ResourceState {
                provider: provider.clone(),
                each_mode: EachMode::NoEach,
                instances: BTreeMap::new(),
            });
        rs.provider = provider.clone();
        rs
    }

    fn instance_mut(&mut self, addr: &ResourceInstanceAddr) -> Option<&mut ResourceInstance> {
        self.modules
            .get_mut(&addr.resource.module)?
            .resources
            .get_mut(&addr.resource)?
            .instances
            .get_mut(&addr.key)
    }

    /// Record how the instances of a resource are keyed, creating the
    /// resource if needed.
    pub fn set_each_mode(&mut self, addr: &ResourceAddr, mode: EachMode, provider: &ProviderAddr) {
        self.ensure_resource(addr, provider).each_mode = mode;
    }

    /// Set or (with `None`) remove the current object of an instance. An
    /// instance left without objects is removed.
    pub fn set_current(
        &mut self,
        addr: &ResourceInstanceAddr,
        obj: Option<ResourceInstanceObjectSrc>,
        provider: &ProviderAddr,
    ) {
        match obj {
            Some(obj) => {
                self.ensure_resource(&addr.resource, provider)
                    .instances
                    .entry(addr.key.clone())
                    .or_default()
                    .current = Some(obj);
            }
            None => {
                if let Some(inst) = self.instance_mut(addr) {
                    inst.current = None;
                }
                self.prune_instance(addr);
            }
        }
    }

    /// Set or (with `None`) remove a deposed object of an instance.
    pub fn set_deposed(
        &mut self,
        addr: &ResourceInstanceAddr,
        key: &DeposedKey,
        obj: Option<ResourceInstanceObjectSrc>,
        provider: &ProviderAddr,
    ) {
        match obj {
            Some(obj) => {
                self.ensure_resource(&addr.resource, provider)
                    .instances
                    .entry(addr.key.clone())
                    .or_default()
                    .deposed
                    .insert(key.clone(), obj);
            }
            None => self.forget_deposed(addr, key),
        }
    }

    /// Move the current object of an instance to its deposed set, returning
    /// the freshly allocated key, or `None` if there was no current object.
    pub fn depose_current(&mut self, addr: &ResourceInstanceAddr) -> Option<DeposedKey> {
        let key = self.resource_instance(addr)?.fresh_deposed_key();
        self.depose_current_as(addr, &key).then_some(key)
    }

    /// Like [`State::depose_current`], with a key allocated beforehand.
    /// Returns false if there is no current object or the key is taken.
    pub fn depose_current_as(&mut self, addr: &ResourceInstanceAddr, key: &DeposedKey) -> bool {
        let Some(inst) = self.instance_mut(addr) else {
            return false;
        };
        if inst.deposed.contains_key(key) {
            return false;
        }
        match inst.current.take() {
            Some(current) => {
                inst.deposed.insert(key.clone(), current);
                true
            }
            None => false,
        }
    }

    /// Remove a deposed object without destroying it.
    pub fn forget_deposed(&mut self, addr: &ResourceInstanceAddr, key: &DeposedKey) {
        if let Some(inst) = self.instance_mut(addr) {
            inst.deposed.remove(key);
        }
        self.prune_instance(addr);
    }

    /// Make a deposed object current again, if the instance has no current
    /// object. This undoes a deposal after its replacement failed to be
    /// created. Returns whether the object was restored.
    pub fn maybe_restore_deposed(&mut self, addr: &ResourceInstanceAddr, key: &DeposedKey) -> bool {
        let Some(inst) = self.instance_mut(addr) else {
            return false;
        };
        if inst.current.is_some() {
            return false;
        }
        match inst.deposed.remove(key) {
            Some(obj) => {
                inst.current = Some(obj);
                true
            }
            None => false,
        }
    }

    pub fn remove_instance(&mut self, addr: &ResourceInstanceAddr) {
        if let Some(rs) = self
            .modules
            .get_mut(&addr.resource.module)
            .and_then(|m| m.resources.get_mut(&addr.resource))
        {
            rs.instances.remove(&addr.key);
        }
        self.prune_instance(addr);
    }

    fn prune_instance(&mut self, addr: &ResourceInstanceAddr) {
        let Some(module) = self.modules.get_mut(&addr.resource.module) else {
            return;
        };
        let Some(rs) = module.resources.get_mut(&addr.resource) else {
            return;
        };
        if rs.instances.get(&addr.key).is_some_and(|inst| !inst.has_objects()) {
            rs.instances.remove(&addr.key);
        }
        if rs.instances.is_empty() {
            module.resources.remove(&addr.resource);
        }
    }

    /// Remove instances without objects, resources without instances, and
    /// empty non-root modules.
    pub fn prune_empty(&mut self) {
        for module in self.modules.values_mut() {
            for rs in module.resources.values_mut() {
                rs.instances.retain(|_, inst| inst.has_objects());
            }
            module.resources.retain(|_, rs| !rs.instances.is_empty());
        }
        self.modules.retain(|path, module| path.is_root() || !module.is_empty());
    }

    pub fn set_output(&mut self, module: &ModulePath, name: &str, value: Option<OutputValue>) {
        match value {
            Some(value) => {
                self.ensure_module(module).outputs.insert(name.to_string(), value);
            }
            None => {
                if let Some(m) = self.modules.get_mut(module) {
                    m.outputs.remove(name);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn addr(s: &str) -> ResourceInstanceAddr {
        s.parse().unwrap()
    }

    fn obj(id: &str) -> ResourceInstanceObjectSrc {
        ResourceInstanceObjectSrc {
            status: ObjectStatus::Ready,
            schema_version: 0,
            attributes: json!({ "id": id }),
            dependencies: BTreeSet::new(),
            create_before_destroy: false,
        }
    }

    fn local() -> ProviderAddr {
        ProviderAddr::new("local")
    }

    #[test]
    fn set_and_remove_current() {
        let mut state = State::new();
        let a = addr("local_file.a[0]");
        state.set_current(&a, Some(obj("1")), &local());
        assert_eq!(state.current_object(&a).unwrap().attributes, json!({"id": "1"}));
        assert_eq!(state.all_instances().count(), 1);

        state.set_current(&a, None, &local());
        assert!(state.resource(&a.resource).is_none());
        assert!(state.is_empty());
    }

    #[test]
    fn depose_and_restore() {
        let mut state = State::new();
        let a = addr("local_file.a");
        state.set_current(&a, Some(obj("old")), &local());

        let key = state.depose_current(&a).unwrap();
        assert!(state.current_object(&a).is_none());
        assert_eq!(state.deposed_object(&a, &key).unwrap().attributes, json!({"id": "old"}));
        assert!(state.depose_current(&a).is_none());

        assert!(state.maybe_restore_deposed(&a, &key));
        assert_eq!(state.current_object(&a).unwrap().attributes, json!({"id": "old"}));
        assert!(state.resource_instance(&a).unwrap().deposed.is_empty());
    }

    #[test]
    fn restore_refuses_to_replace_current() {
        let mut state = State::new();
        let a = addr("local_file.a");
        state.set_current(&a, Some(obj("old")), &local());
        let key = state.depose_current(&a).unwrap();
        state.set_current(&a, Some(obj("new")), &local());

        assert!(!state.maybe_restore_deposed(&a, &key));
        assert_eq!(state.current_object(&a).unwrap().attributes, json!({"id": "new"}));
        assert!(state.deposed_object(&a, &key).is_some());

        state.forget_deposed(&a, &key);
        assert!(state.deposed_object(&a, &key).is_none());
        assert!(state.current_object(&a).is_some());
    }

    #[test]
    fn deposed_keys_are_unique_per_instance() {
        let mut state = State::new();
        let a = addr("local_file.a");
        let mut keys = BTreeSet::new();
        for i in 0..20 {
            state.set_current(&a, Some(obj(&i.to_string())), &local());
            keys.insert(state.depose_current(&a).unwrap());
        }
        assert_eq!(keys.len(), 20);
        assert_eq!(state.resource_instance(&a).unwrap().deposed.len(), 20);
    }

    #[test]
    fn prune_empty_removes_husks() {
        let mut state = State::new();
        let a = addr("module.net.local_file.a");
        state.set_each_mode(&a.resource, EachMode::Count, &local());
        state.ensure_module(&ModulePath::root().child("empty"));
        assert!(state.resource(&a.resource).is_some());

        state.prune_empty();
        assert!(state.resource(&a.resource).is_none());
        assert_eq!(state.modules.len(), 1);
        assert!(state.module(&ModulePath::root()).is_some());
    }

    #[test]
    fn json_roundtrip() {
        let mut state = State::new();
        let a = addr("module.net.local_file.a[\"x\"]");
        state.set_current(&a, Some(obj("1")), &local());
        state.set_deposed(&a, &"0badcafe".parse().unwrap(), Some(obj("0")), &local());
        state.set_output(
            &ModulePath::root(),
            "greeting",
            Some(OutputValue {
                value: json!("hi"),
                sensitive: false,
            }),
        );
        let json = state.to_json().unwrap();
        assert_eq!(json["_type"], "groveState");
        let back = State::from_json(json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn rejects_foreign_documents() {
        let mut json = State::new().to_json().unwrap();
        json["_type"] = json!("somethingElse");
        assert!(State::from_json(json).is_err());

        let mut json = State::new().to_json().unwrap();
        json["format_version"] = json!(3);
        assert!(matches!(State::from_json(json), Err(StateError::UnsupportedVersion(3))));
    }

    #[test]
    fn objects_with_unknowns_cannot_be_encoded() {
        let obj = ResourceInstanceObject {
            status: ObjectStatus::Ready,
            value: Value::object([("id", Value::Unknown)]),
            dependencies: BTreeSet::new(),
            create_before_destroy: false,
        };
        assert!(obj.encode(0).is_err());
    }
}
