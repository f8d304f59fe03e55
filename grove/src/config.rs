//! The configuration document.
//!
//! grove does not define a configuration language; it consumes the JSON
//! document that a language front end produces. See [`crate::eval`] for the
//! expressions that may appear in it.

use crate::{
    diagnostics::{Diagnostic, Diagnostics},
    eval::{references, Reference},
};
use anyhow::{Context as _, Result};
use grove_core::{
    addrs::{ModulePath, ProviderAddr, ResourceAddr},
    states::EachMode,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Provider configurations, by provider name. Only the root module
    /// declares providers; child modules inherit them.
    #[serde(default)]
    pub providers: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
    #[serde(default)]
    pub outputs: BTreeMap<String, OutputConfig>,
    /// Module calls, by name.
    #[serde(default)]
    pub modules: BTreeMap<String, Config>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceConfig {
    #[serde(rename = "type")]
    pub type_: String,
    pub name: String,
    /// Defaults to the resource type up to its first `_`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub for_each: Option<serde_json::Value>,
    /// Resources in the same module, as `type.name`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub lifecycle: Lifecycle,
    #[serde(default = "empty_object")]
    pub config: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Lifecycle {
    #[serde(default)]
    pub create_before_destroy: bool,
    /// Any plan that would destroy the object is an error.
    #[serde(default)]
    pub prevent_destroy: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    pub value: serde_json::Value,
    #[serde(default)]
    pub sensitive: bool,
}

impl ResourceConfig {
    pub fn provider_addr(&self) -> ProviderAddr {
        match &self.provider {
            Some(name) => ProviderAddr::new(name),
            None => ProviderAddr::new(self.type_.split('_').next().unwrap_or(&self.type_)),
        }
    }

    pub fn each_mode(&self) -> EachMode {
        match (&self.count, &self.for_each) {
            (Some(_), _) => EachMode::Count,
            (None, Some(_)) => EachMode::ForEach,
            (None, None) => EachMode::NoEach,
        }
    }

    /// All expressions of the resource: its body, `count` and `for_each`.
    fn expressions(&self) -> impl Iterator<Item = &serde_json::Value> {
        std::iter::once(&self.config)
            .chain(self.count.iter())
            .chain(self.for_each.iter())
    }
}

impl Config {
    pub fn from_json(json: serde_json::Value) -> Result<Config, Diagnostic> {
        serde_json::from_value(json).map_err(|e| Diagnostic::config(format!("invalid configuration: {}", e)))
    }

    pub fn load(path: &Path) -> Result<(Config, serde_json::Value)> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Could not read configuration file {}", path.display()))?;
        let json: serde_json::Value = serde_json::from_str(&text)
            .with_context(|| format!("Could not parse configuration file {}", path.display()))?;
        let config = Config::from_json(json.clone())?;
        Ok((config, json))
    }

    /// The root module and all module calls, parents before children.
    pub fn modules(&self) -> Vec<(ModulePath, &Config)> {
        let mut out = Vec::new();
        self.collect_modules(ModulePath::root(), &mut out);
        out
    }

    fn collect_modules<'a>(&'a self, path: ModulePath, out: &mut Vec<(ModulePath, &'a Config)>) {
        out.push((path.clone(), self));
        for (name, child) in &self.modules {
            child.collect_modules(path.child(name), out);
        }
    }

    pub fn module(&self, path: &ModulePath) -> Option<&Config> {
        let mut module = self;
        for name in &path.0 {
            module = module.modules.get(name)?;
        }
        Some(module)
    }

    /// Every resource of every module, with its absolute address.
    pub fn resources(&self) -> Vec<(ResourceAddr, &ResourceConfig)> {
        self.modules()
            .into_iter()
            .flat_map(|(path, module)| {
                module
                    .resources
                    .iter()
                    .map(move |rc| (ResourceAddr::new(path.clone(), &rc.type_, &rc.name), rc))
            })
            .collect()
    }

    pub fn resource(&self, addr: &ResourceAddr) -> Option<&ResourceConfig> {
        self.module(&addr.module)?
            .resources
            .iter()
            .find(|rc| rc.type_ == addr.type_ && rc.name == addr.name)
    }

    /// Every output of every module.
    pub fn outputs(&self) -> Vec<(ModulePath, &str, &OutputConfig)> {
        self.modules()
            .into_iter()
            .flat_map(|(path, module)| {
                module
                    .outputs
                    .iter()
                    .map(move |(name, oc)| (path.clone(), name.as_str(), oc))
            })
            .collect()
    }

    /// The references made by a resource, plus its `depends_on`, as
    /// references without attribute paths.
    pub fn resource_references(&self, addr: &ResourceAddr, rc: &ResourceConfig) -> Result<Vec<Reference>, Diagnostic> {
        let mut refs = Vec::new();
        for expr in rc.expressions() {
            refs.extend(references(&addr.module, expr).map_err(|e| Diagnostic::config_at(addr, e.to_string()))?);
        }
        for dep in &rc.depends_on {
            let target: ResourceAddr = dep
                .parse()
                .map_err(|e: grove_core::addrs::ParseError| Diagnostic::config_at(addr, format!("depends_on: {}", e)))?;
            if !target.module.is_root() {
                return Err(Diagnostic::config_at(
                    addr,
                    format!("depends_on: {} must name a resource in the same module", dep),
                ));
            }
            refs.push(Reference::Resource {
                addr: ResourceAddr::new(addr.module.clone(), &target.type_, &target.name),
                key: None,
                path: vec![],
            });
        }
        Ok(refs)
    }

    pub fn output_references(&self, module: &ModulePath, name: &str, oc: &OutputConfig) -> Result<Vec<Reference>, Diagnostic> {
        references(module, &oc.value).map_err(|e| Diagnostic::config_at(output_display(module, name), e.to_string()))
    }

    /// The resources a resource depends on, following references to module
    /// outputs down to the resources behind them.
    pub fn resource_dependencies(&self, addr: &ResourceAddr, rc: &ResourceConfig) -> Result<BTreeSet<ResourceAddr>, Diagnostic> {
        let mut deps = BTreeSet::new();
        let mut seen_outputs = BTreeSet::new();
        let mut pending = self.resource_references(addr, rc)?;
        while let Some(reference) = pending.pop() {
            match reference {
                Reference::Resource { addr: dep, .. } => {
                    deps.insert(dep);
                }
                Reference::ModuleOutput { module, name, .. } => {
                    if !seen_outputs.insert((module.clone(), name.clone())) {
                        continue;
                    }
                    if let Some(oc) = self.module(&module).and_then(|m| m.outputs.get(&name)) {
                        pending.extend(self.output_references(&module, &name, oc)?);
                    }
                }
                _ => {}
            }
        }
        Ok(deps)
    }

    /// Whether replacements of `addr` create the new object first. A resource
    /// inherits this from every resource that depends on it, so that a
    /// dependent's deposed object is destroyed while its dependencies still
    /// exist.
    pub fn create_before_destroy(&self, addr: &ResourceAddr) -> bool {
        let mut forced: BTreeSet<ResourceAddr> = self
            .resources()
            .into_iter()
            .filter(|(_, rc)| rc.lifecycle.create_before_destroy)
            .map(|(a, _)| a)
            .collect();
        let mut pending: Vec<ResourceAddr> = forced.iter().cloned().collect();
        while let Some(next) = pending.pop() {
            let Some(rc) = self.resource(&next) else {
                continue;
            };
            // Broken references are reported by `check`.
            let Ok(deps) = self.resource_dependencies(&next, rc) else {
                continue;
            };
            for dep in deps {
                if forced.insert(dep.clone()) {
                    pending.push(dep);
                }
            }
        }
        forced.contains(addr)
    }

    /// Static checks that need neither providers nor state: duplicate
    /// declarations, misplaced `count`/`for_each` expressions, and references
    /// to things that are not declared.
    pub fn check(&self) -> Diagnostics {
        let mut diags = Diagnostics::new();
        for (path, module) in self.modules() {
            if !path.is_root() && !module.providers.is_empty() {
                diags.push(Diagnostic::config_at(
                    &path,
                    "providers can only be configured in the root module",
                ));
            }
            let mut names = BTreeSet::new();
            for rc in &module.resources {
                let addr = ResourceAddr::new(path.clone(), &rc.type_, &rc.name);
                if !names.insert((rc.type_.as_str(), rc.name.as_str())) {
                    diags.push(Diagnostic::config_at(&addr, "duplicate resource declaration"));
                }
                if rc.count.is_some() && rc.for_each.is_some() {
                    diags.push(Diagnostic::config_at(&addr, "count and for_each are mutually exclusive"));
                }
                if !rc.config.is_object() {
                    diags.push(Diagnostic::config_at(&addr, "config must be an object"));
                }
                match self.resource_references(&addr, rc) {
                    Ok(refs) => {
                        for r in refs {
                            if let Some(d) = self.check_reference(&addr.to_string(), rc.each_mode(), &r) {
                                diags.push(d);
                            }
                        }
                    }
                    Err(d) => diags.push(d),
                }
                for expr in rc.count.iter().chain(rc.for_each.iter()) {
                    if let Ok(refs) = references(&path, expr) {
                        if refs.iter().any(|r| matches!(r, Reference::CountIndex | Reference::EachKey | Reference::EachValue)) {
                            diags.push(Diagnostic::config_at(
                                &addr,
                                "count and for_each cannot refer to the instance being expanded",
                            ));
                        }
                    }
                }
            }
            for (name, oc) in &module.outputs {
                let display = output_display(&path, name);
                match self.output_references(&path, name, oc) {
                    Ok(refs) => {
                        for r in refs {
                            if let Some(d) = self.check_reference(&display, EachMode::NoEach, &r) {
                                diags.push(d);
                            }
                        }
                    }
                    Err(d) => diags.push(d),
                }
            }
        }
        diags
    }

    fn check_reference(&self, from: &str, each_mode: EachMode, r: &Reference) -> Option<Diagnostic> {
        match r {
            Reference::Resource { addr, .. } => match self.resource(addr) {
                Some(_) => None,
                None => Some(Diagnostic::config_at(
                    from,
                    format!("reference to undeclared resource {}", addr),
                )),
            },
            Reference::ModuleOutput { module, name, .. } => match self.module(module) {
                None => Some(Diagnostic::config_at(
                    from,
                    format!("reference to undeclared module {}", module),
                )),
                Some(m) if !m.outputs.contains_key(name) => Some(Diagnostic::config_at(
                    from,
                    format!("module {} has no output {:?}", module, name),
                )),
                Some(_) => None,
            },
            Reference::CountIndex if each_mode != EachMode::Count => Some(Diagnostic::config_at(
                from,
                "$count_index can only be used in a resource with count",
            )),
            Reference::EachKey | Reference::EachValue if each_mode != EachMode::ForEach => Some(
                Diagnostic::config_at(from, "$each_key and $each_value can only be used in a resource with for_each"),
            ),
            _ => None,
        }
    }
}

/// How outputs are named in diagnostics: `output.NAME`, prefixed by the
/// module path outside the root module.
pub fn output_display(module: &ModulePath, name: &str) -> String {
    if module.is_root() {
        format!("output.{}", name)
    } else {
        format!("{}.output.{}", module, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(json: serde_json::Value) -> Config {
        Config::from_json(json).unwrap()
    }

    #[test]
    fn parse_and_address() {
        let c = config(json!({
            "resources": [
                {"type": "local_file", "name": "a", "config": {"filename": "a", "content": "x"}},
            ],
            "modules": {
                "net": {
                    "resources": [{"type": "local_id", "name": "n", "provider": "other"}],
                    "outputs": {"id": {"value": {"$ref": "local_id.n.id"}}},
                },
            },
        }));
        let addrs: Vec<String> = c.resources().iter().map(|(a, _)| a.to_string()).collect();
        assert_eq!(addrs, vec!["local_file.a", "module.net.local_id.n"]);
        let (a, rc) = &c.resources()[0];
        assert_eq!(rc.provider_addr(), ProviderAddr::new("local"));
        assert_eq!(c.resource(a).unwrap().name, "a");
        let (_, n) = &c.resources()[1];
        assert_eq!(n.provider_addr(), ProviderAddr::new("other"));
        assert_eq!(n.config, json!({}));
        assert!(c.check().is_empty());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(Config::from_json(json!({"resource": []})).is_err());
    }

    #[test]
    fn dependencies_follow_module_outputs() {
        let c = config(json!({
            "resources": [
                {"type": "x_a", "name": "a"},
                {"type": "x_b", "name": "b", "depends_on": ["x_a.a"],
                 "config": {"v": {"$ref": "module.m.out"}}},
            ],
            "modules": {
                "m": {
                    "resources": [{"type": "x_c", "name": "c"}],
                    "outputs": {"out": {"value": {"$ref": "x_c.c.id"}}},
                },
            },
        }));
        let b = ResourceAddr::new(ModulePath::root(), "x_b", "b");
        let deps = c.resource_dependencies(&b, c.resource(&b).unwrap()).unwrap();
        let deps: Vec<String> = deps.iter().map(|a| a.to_string()).collect();
        assert_eq!(deps, vec!["x_a.a", "module.m.x_c.c"]);
    }

    #[test]
    fn create_before_destroy_spreads_to_dependencies() {
        let c = config(json!({
            "resources": [
                {"type": "x_a", "name": "a"},
                {"type": "x_b", "name": "b", "config": {"v": {"$ref": "x_a.a.id"}}},
                {"type": "x_c", "name": "c", "depends_on": ["x_b.b"],
                 "lifecycle": {"create_before_destroy": true}},
                {"type": "x_d", "name": "d", "config": {"v": {"$ref": "x_c.c.id"}}},
            ],
        }));
        let cbd = |t: &str, n: &str| c.create_before_destroy(&ResourceAddr::new(ModulePath::root(), t, n));
        assert!(cbd("x_a", "a"));
        assert!(cbd("x_b", "b"));
        assert!(cbd("x_c", "c"));
        assert!(!cbd("x_d", "d"));
    }

    #[test]
    fn check_reports_all_problems() {
        let c = config(json!({
            "resources": [
                {"type": "x_a", "name": "a", "count": 2, "for_each": ["k"]},
                {"type": "x_a", "name": "a"},
                {"type": "x_b", "name": "b", "config": {
                    "missing": {"$ref": "x_nope.nope.id"},
                    "idx": {"$count_index": true},
                }},
            ],
            "outputs": {"o": {"value": {"$ref": "module.none.x"}}},
            "modules": {"m": {"providers": {"x": {}}}},
        }));
        let diags = c.check();
        let messages: Vec<String> = diags.iter().map(|d| d.to_string()).collect();
        assert_eq!(diags.len(), 6, "{:#?}", messages);
        assert!(messages.iter().any(|m| m.contains("duplicate")));
        assert!(messages.iter().any(|m| m.contains("mutually exclusive")));
        assert!(messages.iter().any(|m| m.contains("undeclared resource x_nope.nope")));
        assert!(messages.iter().any(|m| m.contains("$count_index")));
        assert!(messages.iter().any(|m| m.starts_with("output.o: reference to undeclared module")));
        assert!(messages.iter().any(|m| m.contains("root module")));
    }
}
