//! The dependency graphs that operations walk.
//!
//! An edge `u -> v` means that `u` must be evaluated before `v`.

use crate::{
    config::Config,
    diagnostics::{Diagnostic, Diagnostics},
    eval::Reference,
};
use grove_core::{
    addrs::{DeposedKey, ModulePath, ProviderAddr, ResourceAddr, ResourceInstanceAddr, Target},
    plans::{Action, Plan},
    states::State,
};
use petgraph::{
    graph::{DiGraph, NodeIndex},
    Direction,
};
use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    fmt::Display,
};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Vertex {
    /// Configure a provider.
    Provider(ProviderAddr),
    /// Enter a module.
    ModuleExpand(ModulePath),
    /// Expand a configured resource into instances and plan each.
    Resource(ResourceAddr),
    /// Plan the removal of an object that is no longer configured.
    PlanOrphan(ResourceInstanceAddr),
    /// Plan the removal of a deposed object.
    PlanDeposed(ResourceInstanceAddr, DeposedKey),
    /// Create, update or keep the current object of an instance.
    ApplyInstance(ResourceInstanceAddr),
    /// Destroy the current object of an instance.
    DestroyInstance(ResourceInstanceAddr),
    DestroyDeposed(ResourceInstanceAddr, DeposedKey),
    RefreshInstance(ResourceInstanceAddr),
    Output(ModulePath, String),
}

impl Display for Vertex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Vertex::Provider(p) => write!(f, "{}", p),
            Vertex::ModuleExpand(m) if m.is_root() => write!(f, "root module"),
            Vertex::ModuleExpand(m) => write!(f, "{}", m),
            Vertex::Resource(r) => write!(f, "{}", r),
            Vertex::PlanOrphan(i) => write!(f, "{} (orphan)", i),
            Vertex::PlanDeposed(i, k) => write!(f, "{} (deposed object {})", i, k),
            Vertex::ApplyInstance(i) => write!(f, "{}", i),
            Vertex::DestroyInstance(i) => write!(f, "{} (destroy)", i),
            Vertex::DestroyDeposed(i, k) => write!(f, "{} (destroy deposed object {})", i, k),
            Vertex::RefreshInstance(i) => write!(f, "{} (refresh)", i),
            Vertex::Output(m, name) => write!(f, "{}", crate::config::output_display(m, name)),
        }
    }
}

impl Vertex {
    /// The instance this vertex operates on, if any.
    pub fn instance(&self) -> Option<&ResourceInstanceAddr> {
        match self {
            Vertex::PlanOrphan(i)
            | Vertex::PlanDeposed(i, _)
            | Vertex::ApplyInstance(i)
            | Vertex::DestroyInstance(i)
            | Vertex::DestroyDeposed(i, _)
            | Vertex::RefreshInstance(i) => Some(i),
            _ => None,
        }
    }

    fn matches(&self, targets: &[Target]) -> bool {
        match self {
            Vertex::Resource(r) => targets.iter().any(|t| t.matches_resource(r)),
            _ => match self.instance() {
                Some(i) => targets.iter().any(|t| t.matches_instance(i)),
                None => false,
            },
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Graph {
    graph: DiGraph<Vertex, ()>,
    index: BTreeMap<Vertex, NodeIndex>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a vertex, unless it is already present.
    pub fn add(&mut self, v: Vertex) -> NodeIndex {
        if let Some(ix) = self.index.get(&v) {
            return *ix;
        }
        let ix = self.graph.add_node(v.clone());
        self.index.insert(v, ix);
        ix
    }

    /// Order `before` before `after`. Ignored unless both are present.
    pub fn connect(&mut self, before: &Vertex, after: &Vertex) {
        if before == after {
            return;
        }
        if let (Some(b), Some(a)) = (self.index.get(before), self.index.get(after)) {
            self.graph.update_edge(*b, *a, ());
        }
    }

    pub fn contains(&self, v: &Vertex) -> bool {
        self.index.contains_key(v)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// All vertices, in the order they were added.
    pub fn vertices(&self) -> impl Iterator<Item = &Vertex> {
        self.graph.node_indices().map(|ix| &self.graph[ix])
    }

    /// The vertices that must be evaluated before `v`.
    pub fn dependencies(&self, v: &Vertex) -> Vec<&Vertex> {
        self.neighbors(v, Direction::Incoming)
    }

    /// The vertices that wait for `v`.
    pub fn dependents(&self, v: &Vertex) -> Vec<&Vertex> {
        self.neighbors(v, Direction::Outgoing)
    }

    fn neighbors(&self, v: &Vertex, direction: Direction) -> Vec<&Vertex> {
        let Some(ix) = self.index.get(v) else {
            return vec![];
        };
        let mut ixs: Vec<NodeIndex> = self.graph.neighbors_directed(*ix, direction).collect();
        ixs.sort();
        ixs.into_iter().map(|ix| &self.graph[ix]).collect()
    }

    pub(crate) fn inner(&self) -> &DiGraph<Vertex, ()> {
        &self.graph
    }

    /// Fail with the first cycle found, as `a -> b -> a`.
    pub fn check_acyclic(&self) -> Result<(), Diagnostic> {
        let sccs = petgraph::algo::tarjan_scc(&self.graph);
        let Some(scc) = sccs.into_iter().find(|scc| scc.len() > 1) else {
            return Ok(());
        };
        let members: BTreeSet<NodeIndex> = scc.iter().copied().collect();
        let start = *members.iter().next().unwrap_or(&scc[0]);
        let cycle = self.cycle_through(start, &members);
        let path: Vec<String> = cycle.iter().map(|ix| self.graph[*ix].to_string()).collect();
        Err(Diagnostic::config(format!("dependency cycle: {}", path.join(" -> "))))
    }

    /// A shortest cycle from `start` back to itself through `members`, which
    /// must be a strongly connected component.
    fn cycle_through(&self, start: NodeIndex, members: &BTreeSet<NodeIndex>) -> Vec<NodeIndex> {
        let mut parent: BTreeMap<NodeIndex, NodeIndex> = BTreeMap::new();
        let mut queue = VecDeque::from([start]);
        while let Some(ix) = queue.pop_front() {
            if self.graph.contains_edge(ix, start) {
                let mut path = vec![start];
                let mut at = ix;
                while at != start {
                    path.push(at);
                    at = parent[&at];
                }
                path.push(start);
                let end = path.len() - 1;
                path[1..end].reverse();
                return path;
            }
            let mut next: Vec<NodeIndex> = self.graph.neighbors(ix).collect();
            next.sort();
            for n in next {
                if members.contains(&n) && n != start && !parent.contains_key(&n) {
                    parent.insert(n, ix);
                    queue.push_back(n);
                }
            }
        }
        vec![start, start]
    }

    /// Keep only the vertices for which `keep` holds, plus everything they
    /// transitively depend on.
    pub fn retain_with_dependencies(&self, keep: impl Fn(&Vertex) -> bool) -> Graph {
        let mut kept: BTreeSet<NodeIndex> = BTreeSet::new();
        let mut queue: VecDeque<NodeIndex> = self.graph.node_indices().filter(|ix| keep(&self.graph[*ix])).collect();
        while let Some(ix) = queue.pop_front() {
            if kept.insert(ix) {
                queue.extend(self.graph.neighbors_directed(ix, Direction::Incoming));
            }
        }
        let mut out = Graph::new();
        for ix in self.graph.node_indices().filter(|ix| kept.contains(ix)) {
            out.add(self.graph[ix].clone());
        }
        for edge in self.graph.raw_edges() {
            if kept.contains(&edge.source()) && kept.contains(&edge.target()) {
                out.connect(&self.graph[edge.source()], &self.graph[edge.target()]);
            }
        }
        out
    }
}

/// Order `to` after the resource vertex of each referenced resource and the
/// output vertex of each referenced module output.
fn reference_edges(graph: &mut Graph, refs: &[Reference], to: &Vertex) {
    for r in refs {
        match r {
            Reference::Resource { addr, .. } => graph.connect(&Vertex::Resource(addr.clone()), to),
            Reference::ModuleOutput { module, name, .. } => {
                graph.connect(&Vertex::Output(module.clone(), name.clone()), to)
            }
            _ => {}
        }
    }
}

fn state_dependencies(state: &State, addr: &ResourceInstanceAddr) -> BTreeSet<ResourceAddr> {
    state
        .resource_instance(addr)
        .map(|inst| {
            inst.current
                .iter()
                .chain(inst.deposed.values())
                .flat_map(|obj| obj.dependencies.iter().cloned())
                .collect()
        })
        .unwrap_or_default()
}

/// The graph of a plan.
///
/// Configured resources become [`Vertex::Resource`], ordered by their
/// references. Objects in the state without configuration, and every object
/// in destroy mode, become [`Vertex::PlanOrphan`], ordered in reverse of
/// their recorded dependencies.
pub fn plan_graph(config: &Config, state: &State, destroy: bool, targets: &[Target]) -> Result<Graph, Diagnostics> {
    let mut graph = Graph::new();
    let mut diags = Diagnostics::new();

    if !destroy {
        for (path, _) in config.modules() {
            graph.add(Vertex::ModuleExpand(path.clone()));
            if let Some((_, parent)) = path.0.split_last() {
                let parent = ModulePath(parent.to_vec());
                graph.connect(&Vertex::ModuleExpand(parent), &Vertex::ModuleExpand(path));
            }
        }
        for (addr, rc) in config.resources() {
            let provider = Vertex::Provider(rc.provider_addr());
            graph.add(provider.clone());
            let v = Vertex::Resource(addr.clone());
            graph.add(v.clone());
            graph.connect(&provider, &v);
            graph.connect(&Vertex::ModuleExpand(addr.module.clone()), &v);
        }
        for (module, name, _) in config.outputs() {
            let v = Vertex::Output(module.clone(), name.to_string());
            graph.add(v.clone());
            graph.connect(&Vertex::ModuleExpand(module), &v);
        }
        for (addr, rc) in config.resources() {
            match config.resource_references(&addr, rc) {
                Ok(refs) => reference_edges(&mut graph, &refs, &Vertex::Resource(addr.clone())),
                Err(d) => diags.push(d),
            }
        }
        for (module, name, oc) in config.outputs() {
            match config.output_references(&module, name, oc) {
                Ok(refs) => reference_edges(&mut graph, &refs, &Vertex::Output(module.clone(), name.to_string())),
                Err(d) => diags.push(d),
            }
        }
    }

    let mut orphans: BTreeMap<ResourceAddr, Vec<ResourceInstanceAddr>> = BTreeMap::new();
    for (addr, inst) in state.all_instances() {
        let Some(rs) = state.resource(&addr.resource) else {
            continue;
        };
        let provider = Vertex::Provider(rs.provider.clone());
        let configured = config.resource(&addr.resource).is_some();
        if inst.current.is_some() && (destroy || !configured) {
            graph.add(provider.clone());
            let v = Vertex::PlanOrphan(addr.clone());
            graph.add(v.clone());
            graph.connect(&provider, &v);
            orphans.entry(addr.resource.clone()).or_default().push(addr.clone());
        }
        for key in inst.deposed.keys() {
            graph.add(provider.clone());
            let v = Vertex::PlanDeposed(addr.clone(), key.clone());
            graph.add(v.clone());
            graph.connect(&provider, &v);
        }
    }
    // Dependents are destroyed before their dependencies.
    for instances in orphans.values() {
        for addr in instances {
            let mut deps = state_dependencies(state, addr);
            if let Some(rc) = config.resource(&addr.resource) {
                if let Ok(config_deps) = config.resource_dependencies(&addr.resource, rc) {
                    deps.extend(config_deps);
                }
            }
            for dep in deps {
                for dep_addr in orphans.get(&dep).into_iter().flatten() {
                    graph.connect(&Vertex::PlanOrphan(addr.clone()), &Vertex::PlanOrphan(dep_addr.clone()));
                }
            }
        }
    }

    diags.into_result()?;
    graph.check_acyclic()?;
    if targets.is_empty() {
        Ok(graph)
    } else {
        Ok(graph.retain_with_dependencies(|v| v.matches(targets)))
    }
}

/// The graph that applies `plan`.
///
/// `replace_keys` holds the key under which each create-before-destroy
/// replacement deposes the current object.
pub fn apply_graph(
    config: &Config,
    plan: &Plan,
    replace_keys: &BTreeMap<ResourceInstanceAddr, DeposedKey>,
) -> Result<Graph, Diagnostics> {
    let mut graph = Graph::new();
    let mut by_resource: BTreeMap<ResourceAddr, Vec<Vertex>> = BTreeMap::new();
    let mut pure_deletes: BTreeSet<ResourceInstanceAddr> = BTreeSet::new();
    let mut diags = Diagnostics::new();

    for change in &plan.changes {
        let provider = Vertex::Provider(change.provider.clone());
        graph.add(provider.clone());
        let addr = &change.addr;
        let mut vertices = Vec::new();
        match (&change.deposed_key, change.action) {
            (Some(key), _) => vertices.push(Vertex::DestroyDeposed(addr.clone(), key.clone())),
            (None, Action::Delete) => {
                vertices.push(Vertex::DestroyInstance(addr.clone()));
                pure_deletes.insert(addr.clone());
            }
            (None, Action::DeleteThenCreate) => {
                vertices.push(Vertex::DestroyInstance(addr.clone()));
                vertices.push(Vertex::ApplyInstance(addr.clone()));
            }
            (None, Action::CreateThenDelete) => {
                vertices.push(Vertex::ApplyInstance(addr.clone()));
                match replace_keys.get(addr) {
                    Some(key) => vertices.push(Vertex::DestroyDeposed(addr.clone(), key.clone())),
                    None => diags.push(Diagnostic::internal(format!("no deposed key allocated for {}", addr))),
                }
            }
            (None, Action::NoOp | Action::Create | Action::Update | Action::Read) => {
                vertices.push(Vertex::ApplyInstance(addr.clone()))
            }
        }
        for v in &vertices {
            graph.add(v.clone());
            graph.connect(&provider, v);
        }
        if let [first, second] = vertices.as_slice() {
            graph.connect(first, second);
        }
        by_resource.entry(addr.resource.clone()).or_default().extend(vertices);
    }

    for oc in &plan.output_changes {
        if oc.action != Action::Delete {
            graph.add(Vertex::Output(oc.module.clone(), oc.name.clone()));
        }
    }

    let instances_of = |dep: &ResourceAddr| by_resource.get(dep).cloned().unwrap_or_default();

    for change in &plan.changes {
        let addr = &change.addr;
        let apply = Vertex::ApplyInstance(addr.clone());
        let destroy = Vertex::DestroyInstance(addr.clone());
        let has_apply = graph.contains(&apply) && change.deposed_key.is_none();
        let has_destroy = graph.contains(&destroy) && change.deposed_key.is_none();

        if let Some(key) = &change.deposed_key {
            let own = Vertex::DestroyDeposed(addr.clone(), key.clone());
            for dep in state_dependencies(&plan.prior_state, addr) {
                for v in instances_of(&dep) {
                    if matches!(v, Vertex::DestroyInstance(_) | Vertex::DestroyDeposed(..)) {
                        graph.connect(&own, &v);
                    }
                }
            }
            continue;
        }
        let replaced = match change.action {
            Action::CreateThenDelete => replace_keys.get(addr).map(|key| Vertex::DestroyDeposed(addr.clone(), key.clone())),
            _ => None,
        };

        if has_apply {
            for dep in &change.dependencies {
                for v in instances_of(dep) {
                    if matches!(v, Vertex::ApplyInstance(_)) {
                        graph.connect(&v, &apply);
                    }
                }
            }
            if let Some(rc) = config.resource(&addr.resource) {
                match config.resource_references(&addr.resource, rc) {
                    Ok(refs) => {
                        for r in refs {
                            if let Reference::ModuleOutput { module, name, .. } = r {
                                graph.connect(&Vertex::Output(module, name), &apply);
                            }
                        }
                    }
                    Err(d) => diags.push(d),
                }
            }
        }

        let mut all_deps = change.dependencies.clone();
        all_deps.extend(state_dependencies(&plan.prior_state, addr));
        for dep in &all_deps {
            for v in instances_of(dep) {
                match &v {
                    Vertex::DestroyInstance(dep_addr) => {
                        if has_destroy {
                            graph.connect(&destroy, &v);
                        }
                        if let Some(replaced) = &replaced {
                            graph.connect(replaced, &v);
                        }
                        if has_apply && pure_deletes.contains(dep_addr) {
                            graph.connect(&apply, &v);
                        }
                    }
                    Vertex::DestroyDeposed(..) => {
                        if has_apply {
                            graph.connect(&apply, &v);
                        }
                        if has_destroy {
                            graph.connect(&destroy, &v);
                        }
                        if let Some(replaced) = &replaced {
                            graph.connect(replaced, &v);
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    for oc in &plan.output_changes {
        let v = Vertex::Output(oc.module.clone(), oc.name.clone());
        if !graph.contains(&v) {
            continue;
        }
        let Some(output) = config.module(&oc.module).and_then(|m| m.outputs.get(&oc.name)) else {
            continue;
        };
        match config.output_references(&oc.module, &oc.name, output) {
            Ok(refs) => {
                for r in refs {
                    match r {
                        Reference::Resource { addr, .. } => {
                            for dep in instances_of(&addr) {
                                if matches!(dep, Vertex::ApplyInstance(_)) {
                                    graph.connect(&dep, &v);
                                }
                            }
                        }
                        Reference::ModuleOutput { module, name, .. } => {
                            graph.connect(&Vertex::Output(module, name), &v)
                        }
                        _ => {}
                    }
                }
            }
            Err(d) => diags.push(d),
        }
    }

    diags.into_result()?;
    graph.check_acyclic()?;
    Ok(graph)
}

/// Refresh every current object, after configuring its provider.
pub fn refresh_graph(state: &State, targets: &[Target]) -> Graph {
    let mut graph = Graph::new();
    for (addr, inst) in state.all_instances() {
        if inst.current.is_none() {
            continue;
        }
        if !targets.is_empty() && !targets.iter().any(|t| t.matches_instance(&addr)) {
            continue;
        }
        let Some(rs) = state.resource(&addr.resource) else {
            continue;
        };
        let provider = Vertex::Provider(rs.provider.clone());
        graph.add(provider.clone());
        let v = Vertex::RefreshInstance(addr);
        graph.add(v.clone());
        graph.connect(&provider, &v);
    }
    graph
}

#[cfg(test)]
mod tests {
    use super::*;
    use grove_core::states::{ObjectStatus, ResourceInstanceObjectSrc};
    use serde_json::json;

    fn out(name: &str) -> Vertex {
        Vertex::Output(ModulePath::root(), name.to_string())
    }

    fn object(deps: &[&str]) -> ResourceInstanceObjectSrc {
        ResourceInstanceObjectSrc {
            status: ObjectStatus::Ready,
            schema_version: 0,
            attributes: json!({}),
            dependencies: deps.iter().map(|d| d.parse().unwrap()).collect(),
            create_before_destroy: false,
        }
    }

    #[test]
    fn cycles_are_reported_as_a_path() {
        let mut g = Graph::new();
        for n in ["a", "b", "c"] {
            g.add(out(n));
        }
        g.connect(&out("a"), &out("b"));
        g.connect(&out("b"), &out("c"));
        assert!(g.check_acyclic().is_ok());
        g.connect(&out("c"), &out("b"));
        let err = g.check_acyclic().unwrap_err().to_string();
        assert_eq!(err, "dependency cycle: output.b -> output.c -> output.b");
    }

    #[test]
    fn retain_keeps_dependencies_only() {
        let mut g = Graph::new();
        for n in ["a", "b", "c", "d"] {
            g.add(out(n));
        }
        g.connect(&out("a"), &out("b"));
        g.connect(&out("b"), &out("c"));
        g.connect(&out("c"), &out("d"));
        let kept = g.retain_with_dependencies(|v| v == &out("b"));
        let names: Vec<String> = kept.vertices().map(|v| v.to_string()).collect();
        assert_eq!(names, vec!["output.a", "output.b"]);
        assert_eq!(kept.dependencies(&out("b")), vec![&out("a")]);
    }

    #[test]
    fn plan_graph_orders_by_references() {
        let config = Config::from_json(json!({
            "resources": [
                {"type": "x_a", "name": "a"},
                {"type": "x_b", "name": "b", "config": {"v": {"$ref": "x_a.a.id"}}},
            ],
            "outputs": {"o": {"value": {"$ref": "x_b.b.id"}}},
        }))
        .unwrap();
        let g = plan_graph(&config, &State::new(), false, &[]).unwrap();
        let a = Vertex::Resource("x_a.a".parse().unwrap());
        let b = Vertex::Resource("x_b.b".parse().unwrap());
        assert!(g.dependencies(&b).contains(&&a));
        assert!(g.dependencies(&out("o")).contains(&&b));
        assert!(g.dependencies(&a).contains(&&Vertex::Provider(ProviderAddr::new("x"))));

        let targeted = plan_graph(&config, &State::new(), false, &["x_a.a".parse().unwrap()]).unwrap();
        assert!(targeted.contains(&a));
        assert!(!targeted.contains(&b));
        assert!(!targeted.contains(&out("o")));
    }

    #[test]
    fn reference_cycle_is_a_config_error() {
        let config = Config::from_json(json!({
            "resources": [
                {"type": "x_a", "name": "a", "config": {"v": {"$ref": "x_b.b.id"}}},
                {"type": "x_b", "name": "b", "config": {"v": {"$ref": "x_a.a.id"}}},
            ],
        }))
        .unwrap();
        let diags = plan_graph(&config, &State::new(), false, &[]).unwrap_err();
        assert!(diags.iter().all(Diagnostic::is_config));
        assert_eq!(diags.to_string(), "dependency cycle: x_a.a -> x_b.b -> x_a.a");
    }

    #[test]
    fn destroy_plan_reverses_recorded_dependencies() {
        let mut state = State::new();
        let x = ProviderAddr::new("x");
        let a: ResourceInstanceAddr = "x_a.a".parse().unwrap();
        let b: ResourceInstanceAddr = "x_b.b".parse().unwrap();
        state.set_current(&a, Some(object(&[])), &x);
        state.set_current(&b, Some(object(&["x_a.a"])), &x);
        let key = state.depose_current(&a).unwrap();
        state.set_current(&a, Some(object(&[])), &x);

        let g = plan_graph(&Config::default(), &state, true, &[]).unwrap();
        assert_eq!(
            g.dependencies(&Vertex::PlanOrphan(a.clone())),
            vec![&Vertex::Provider(x.clone()), &Vertex::PlanOrphan(b.clone())]
        );
        assert!(g.contains(&Vertex::PlanDeposed(a.clone(), key)));

        // Targeting the dependency keeps its dependents
        let g = plan_graph(&Config::default(), &state, true, &["x_a.a".parse().unwrap()]).unwrap();
        assert!(g.contains(&Vertex::PlanOrphan(b)));
    }
}
