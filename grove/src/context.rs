//! The operations: validate, plan, apply and refresh.

use crate::{
    config::Config,
    diagnostics::{Diagnostic, Diagnostics},
    eval,
    graph::{apply_graph, plan_graph, refresh_graph, Graph, Vertex},
    hooks::Hook,
    interrupt::InterruptState,
    lifecycle::{self, Phase, WalkContext},
    providers::{Providers, Schemas},
    state_sync::SyncState,
    walk::{walk, WalkOutcome, WalkReport},
};
use grove_core::{
    addrs::{DeposedKey, ResourceInstanceAddr, Target},
    plans::{Action, OutputChange, Plan},
    states::State,
    value::{Type, Value},
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{info, info_span, Instrument};

pub const DEFAULT_PARALLELISM: usize = 10;

#[derive(Debug, Clone)]
pub struct PlanOptions {
    pub targets: Vec<Target>,
    /// Plan to destroy everything in scope.
    pub destroy: bool,
    /// Refresh every object in the state before planning.
    pub refresh: bool,
    pub parallelism: usize,
}

impl Default for PlanOptions {
    fn default() -> Self {
        PlanOptions {
            targets: Vec::new(),
            destroy: false,
            refresh: true,
            parallelism: DEFAULT_PARALLELISM,
        }
    }
}

#[derive(Debug)]
pub struct PlanResult {
    pub plan: Plan,
    pub diagnostics: Diagnostics,
    /// Planning was interrupted; the plan is incomplete.
    pub cancelled: bool,
}

#[derive(Debug)]
pub struct OperationResult {
    /// The state after the operation, with everything that completed.
    pub state: State,
    pub diagnostics: Diagnostics,
    pub cancelled: bool,
}

impl OperationResult {
    fn failed(state: State, diagnostics: Diagnostics) -> Self {
        OperationResult {
            state,
            diagnostics,
            cancelled: false,
        }
    }
}

/// The providers, hooks and interrupt handling that operations run with.
pub struct Context {
    providers: Providers,
    hooks: Vec<Arc<dyn Hook>>,
    interrupt: InterruptState,
    parallelism: usize,
}

impl Context {
    pub fn new(providers: Providers) -> Self {
        Context {
            providers,
            hooks: Vec::new(),
            interrupt: InterruptState::new(),
            parallelism: DEFAULT_PARALLELISM,
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn Hook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn with_interrupt(mut self, interrupt: InterruptState) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// The parallelism of apply and refresh; plans take theirs from
    /// [`PlanOptions`].
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn interrupt(&self) -> &InterruptState {
        &self.interrupt
    }

    fn walk_context(&self, phase: Phase, config: Arc<Config>, schemas: Schemas, state: SyncState) -> WalkContext {
        let mut ctx = WalkContext::new(phase, config, self.providers.clone(), schemas, state);
        ctx.hooks = self.hooks.clone();
        ctx.cancel = self.interrupt.token().clone();
        ctx
    }

    async fn run(&self, graph: &Graph, parallelism: usize, ctx: Arc<WalkContext>) -> WalkReport {
        walk(graph, parallelism, self.interrupt.token(), move |v| lifecycle::evaluate(ctx.clone(), v)).await
    }

    async fn notify_all(&self, state: &State) -> Diagnostics {
        let mut diags = Diagnostics::new();
        for hook in &self.hooks {
            if let Err(e) = hook.post_state_update(state).await {
                diags.push(Diagnostic::internal(format!("could not record state: {:#}", e)));
            }
        }
        diags
    }

    /// Check a configuration against the provider schemas, with every
    /// reference treated as unknown.
    pub async fn validate(&self, config: &Config) -> Diagnostics {
        let mut diags = config.check();
        let schemas = match self.providers.schemas() {
            Ok(schemas) => schemas,
            Err(d) => {
                diags.push(d);
                return diags;
            }
        };
        for name in config.providers.keys() {
            let addr = grove_core::addrs::ProviderAddr::new(name);
            if !self.providers.contains(&addr) {
                diags.push(Diagnostic::config(format!("{} is not available", addr)));
            }
        }
        for (addr, rc) in config.resources() {
            let provider_addr = rc.provider_addr();
            let schema = match schemas.resource(&provider_addr, &addr.type_) {
                Ok(schema) => schema,
                Err(_) if !self.providers.contains(&provider_addr) => {
                    diags.push(Diagnostic::config_at(&addr, format!("{} is not available", provider_addr)));
                    continue;
                }
                Err(d) => {
                    diags.push(Diagnostic::config_at(&addr, d.to_string()));
                    continue;
                }
            };
            let value = match eval::evaluate_unresolved(&rc.config) {
                Ok(v) => v,
                Err(e) => {
                    diags.push(Diagnostic::config_at(&addr, e.to_string()));
                    continue;
                }
            };
            let value = match value.convert(&schema.block.implied_type()) {
                Ok(v) => v,
                Err(e) => {
                    diags.push(Diagnostic::config_at(&addr, e.to_string()));
                    continue;
                }
            };
            let errors = schema.block.validate_config_value(&value);
            if !errors.is_empty() {
                diags.extend(errors.into_iter().map(|e| Diagnostic::config_at(&addr, e.to_string())).collect());
                continue;
            }
            if let Ok(provider) = self.providers.get(&provider_addr) {
                if let Err(e) = provider.validate_resource_config(&addr.type_, &value).await {
                    diags.push(Diagnostic::config_at(&addr, format!("{:#}", e)));
                }
            }
            if let Some(count) = &rc.count {
                let count = eval::evaluate_unresolved(count).unwrap_or(Value::Unknown);
                if count.is_known() && !count.as_i64().is_some_and(|n| n >= 0) {
                    diags.push(Diagnostic::config_at(&addr, "count must be a non-negative whole number"));
                }
            }
        }
        diags
    }

    /// Work out the changes that would bring the real world in line with
    /// `config`.
    ///
    /// Unless disabled, every object in `state` is refreshed first. The
    /// refreshed state becomes the plan's prior state; it is not persisted.
    pub async fn plan(&self, config: &Config, config_json: serde_json::Value, state: State, options: &PlanOptions) -> PlanResult {
        let mut plan = Plan::new(config_json, state.clone());
        plan.destroy = options.destroy;
        plan.targets = options.targets.clone();
        let mut result = PlanResult {
            plan,
            diagnostics: Diagnostics::new(),
            cancelled: false,
        };

        result.diagnostics = if options.destroy {
            config.check()
        } else {
            self.validate(config).await
        };
        if result.diagnostics.has_errors() {
            return result;
        }
        let schemas = match self.providers.schemas() {
            Ok(schemas) => schemas,
            Err(d) => {
                result.diagnostics.push(d);
                return result;
            }
        };
        let config = Arc::new(config.clone());
        let working = SyncState::new(state);

        if options.refresh {
            let snapshot = working.snapshot().await;
            let graph = refresh_graph(&snapshot, &options.targets);
            if !graph.is_empty() {
                let ctx = Arc::new(self.walk_context(Phase::Refresh, config.clone(), schemas.clone(), working.clone()));
                let report = self
                    .run(&graph, options.parallelism, ctx)
                    .instrument(info_span!("refreshing"))
                    .await;
                result.diagnostics.extend(report.diagnostics);
                if report.outcome != WalkOutcome::Completed {
                    result.cancelled = report.outcome == WalkOutcome::Cancelled;
                    return result;
                }
            }
        }
        let prior_state = working.snapshot().await;

        let graph = match plan_graph(&config, &prior_state, options.destroy, &options.targets) {
            Ok(graph) => graph,
            Err(diags) => {
                result.diagnostics.extend(diags);
                return result;
            }
        };
        let mut ctx = self.walk_context(Phase::Plan, config.clone(), schemas, working);
        ctx.destroy = options.destroy;
        ctx.targets = targets_in_scope(&graph, &options.targets);
        let ctx = Arc::new(ctx);
        let report = self
            .run(&graph, options.parallelism, ctx.clone())
            .instrument(info_span!("planning"))
            .await;
        result.diagnostics.extend(report.diagnostics);
        result.cancelled = report.outcome == WalkOutcome::Cancelled;

        let (mut changes, mut output_changes) = ctx.take_changes();
        changes.sort_by(|a, b| (&a.addr, &a.deposed_key).cmp(&(&b.addr, &b.deposed_key)));
        if options.targets.is_empty() {
            output_changes.extend(removed_outputs(&config, &prior_state, options.destroy));
        }
        output_changes.sort_by(|a, b| (&a.module, &a.name).cmp(&(&b.module, &b.name)));
        info!(
            changes = changes.iter().filter(|c| c.action != Action::NoOp).count(),
            errors = result.diagnostics.len(),
            "plan finished"
        );
        result.plan.prior_state = prior_state;
        result.plan.changes = changes;
        result.plan.output_changes = output_changes;
        result
    }

    /// Carry out `plan`, which must have been made against `state`.
    ///
    /// Every change to the working state is reported to the hooks as it
    /// happens, so a persisting hook always has the latest known state even
    /// if the operation fails half way.
    pub async fn apply(&self, plan: &Plan, state: &State) -> OperationResult {
        if let Err(e) = plan.check_state_unchanged(state) {
            return OperationResult::failed(
                state.clone(),
                Diagnostic::config(format!("the plan cannot be applied: {}", e)).into(),
            );
        }
        let config = match Config::from_json(plan.config.clone()) {
            Ok(config) => Arc::new(config),
            Err(d) => return OperationResult::failed(state.clone(), d.into()),
        };
        let schemas = match self.providers.schemas() {
            Ok(schemas) => schemas,
            Err(d) => return OperationResult::failed(state.clone(), d.into()),
        };
        let replace_keys = replace_keys(plan);
        let graph = match apply_graph(&config, plan, &replace_keys) {
            Ok(graph) => graph,
            Err(diags) => return OperationResult::failed(state.clone(), diags),
        };

        let working = SyncState::new(plan.prior_state.clone());
        let mut ctx = self.walk_context(Phase::Apply, config.clone(), schemas, working.clone());
        ctx.notify_hooks = true;
        ctx.destroy = plan.destroy;
        ctx.targets = plan.targets.clone();
        ctx.plan = Some(Arc::new(plan.clone()));
        ctx.replace_keys = replace_keys;
        {
            let mut values = ctx.values.write().unwrap_or_else(std::sync::PoisonError::into_inner);
            for (addr, rc) in config.resources() {
                values.set_resource(&addr, rc.each_mode());
            }
        }
        let report = self
            .run(&graph, self.parallelism, Arc::new(ctx))
            .instrument(info_span!("applying"))
            .await;

        let mut diagnostics = report.diagnostics;
        if report.outcome == WalkOutcome::Completed {
            working
                .write(|s| {
                    for oc in plan.output_changes.iter().filter(|oc| oc.action == Action::Delete) {
                        s.set_output(&oc.module, &oc.name, None);
                    }
                })
                .await;
        }
        working.write(State::prune_empty).await;
        let state = working.snapshot().await;
        diagnostics.extend(self.notify_all(&state).await);
        info!(outcome = ?report.outcome, errors = diagnostics.len(), "apply finished");
        OperationResult {
            state,
            diagnostics,
            cancelled: report.outcome == WalkOutcome::Cancelled,
        }
    }

    /// Update every object in `state` from the real world. Objects that no
    /// longer exist are removed.
    pub async fn refresh(&self, config: &Config, state: State) -> OperationResult {
        let diags = config.check();
        if diags.has_errors() {
            return OperationResult::failed(state, diags);
        }
        let schemas = match self.providers.schemas() {
            Ok(schemas) => schemas,
            Err(d) => return OperationResult::failed(state, d.into()),
        };
        let graph = refresh_graph(&state, &[]);
        let working = SyncState::new(state);
        let mut ctx = self.walk_context(Phase::Refresh, Arc::new(config.clone()), schemas, working.clone());
        ctx.notify_hooks = true;
        let report = self
            .run(&graph, self.parallelism, Arc::new(ctx))
            .instrument(info_span!("refreshing"))
            .await;
        working.write(State::prune_empty).await;
        let state = working.snapshot().await;
        let mut diagnostics = report.diagnostics;
        diagnostics.extend(self.notify_all(&state).await);
        OperationResult {
            state,
            diagnostics,
            cancelled: report.outcome == WalkOutcome::Cancelled,
        }
    }
}

/// Allocate the deposed key of each create-before-destroy replacement up
/// front, so the apply graph can name the vertex that destroys it.
fn replace_keys(plan: &Plan) -> BTreeMap<ResourceInstanceAddr, DeposedKey> {
    plan.changes
        .iter()
        .filter(|c| c.action == Action::CreateThenDelete && c.deposed_key.is_none())
        .map(|c| {
            let key = plan
                .prior_state
                .resource_instance(&c.addr)
                .map(|inst| inst.fresh_deposed_key())
                .unwrap_or_else(DeposedKey::generate);
            (c.addr.clone(), key)
        })
        .collect()
}

/// The targets widened to every resource the targeted graph kept, since the
/// dependencies of a target are planned as well.
fn targets_in_scope(graph: &Graph, targets: &[Target]) -> Vec<Target> {
    if targets.is_empty() {
        return Vec::new();
    }
    let mut scope = targets.to_vec();
    for vertex in graph.vertices() {
        if let Vertex::Resource(addr) = vertex {
            if !targets.iter().any(|t| t.matches_resource(addr)) {
                scope.push(Target::Resource(addr.clone()));
            }
        }
    }
    scope
}

/// Outputs in the state that the plan removes: all of them when destroying,
/// otherwise those no longer configured.
fn removed_outputs(config: &Config, state: &State, destroy: bool) -> Vec<OutputChange> {
    let mut out = Vec::new();
    for (module, ms) in &state.modules {
        for (name, output) in &ms.outputs {
            let configured = config.module(module).is_some_and(|m| m.outputs.contains_key(name));
            if destroy || !configured {
                out.push(OutputChange {
                    module: module.clone(),
                    name: name.clone(),
                    action: Action::Delete,
                    before: Value::from_json(&output.value, &Type::Dynamic).unwrap_or_default(),
                    after: Value::Null,
                    sensitive: output.sensitive,
                });
            }
        }
    }
    out
}
