//! What each graph vertex does when it is evaluated: the life cycle of a
//! resource instance from planning to apply or destroy.

use crate::{
    config::{output_display, Config, ResourceConfig},
    diagnostics::{Diagnostic, Diagnostics},
    eval::{self, NamedValues, Repetition, Scope},
    graph::Vertex,
    hooks::Hook,
    providers::{Providers, Schemas},
    state_sync::SyncState,
};
use grove_core::{
    addrs::{DeposedKey, InstanceKey, ModulePath, ProviderAddr, ResourceAddr, ResourceInstanceAddr, Target},
    objchange::proposed_new,
    plans::{Action, ActionReason, OutputChange, Plan, ResourceInstanceChange},
    schema::Schema,
    states::{ObjectStatus, OutputValue, ResourceInstanceObject, ResourceInstanceObjectSrc},
    value::{Type, Value},
};
use grove_resource::provider::{
    ApplyResourceChangeRequest, PlanResourceChangeRequest, PlanResourceChangeResponse, ReadResourceRequest,
    ResourceProvider, UpgradeResourceStateRequest,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Plan,
    Apply,
    Refresh,
}

/// Everything the vertices of one walk share.
pub(crate) struct WalkContext {
    pub phase: Phase,
    pub config: Arc<Config>,
    pub providers: Providers,
    pub schemas: Schemas,
    pub state: SyncState,
    pub hooks: Vec<Arc<dyn Hook>>,
    /// Whether [`Hook::post_state_update`] is called. Off while planning,
    /// where the working state is a scratch copy.
    pub notify_hooks: bool,
    pub cancel: CancellationToken,
    pub destroy: bool,
    pub targets: Vec<Target>,
    /// Set when applying.
    pub plan: Option<Arc<Plan>>,
    /// The keys under which create-before-destroy replacements depose the
    /// current object.
    pub replace_keys: BTreeMap<ResourceInstanceAddr, DeposedKey>,
    pub values: RwLock<NamedValues>,
    pub changes: Mutex<Vec<ResourceInstanceChange>>,
    pub output_changes: Mutex<Vec<OutputChange>>,
    notify: tokio::sync::Mutex<()>,
}

impl WalkContext {
    pub fn new(phase: Phase, config: Arc<Config>, providers: Providers, schemas: Schemas, state: SyncState) -> Self {
        WalkContext {
            phase,
            config,
            providers,
            schemas,
            state,
            hooks: Vec::new(),
            notify_hooks: false,
            cancel: CancellationToken::new(),
            destroy: false,
            targets: Vec::new(),
            plan: None,
            replace_keys: BTreeMap::new(),
            values: RwLock::new(NamedValues::default()),
            changes: Mutex::new(Vec::new()),
            output_changes: Mutex::new(Vec::new()),
            notify: tokio::sync::Mutex::new(()),
        }
    }

    fn values(&self) -> RwLockReadGuard<'_, NamedValues> {
        self.values.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn values_mut(&self) -> RwLockWriteGuard<'_, NamedValues> {
        self.values.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn changes(&self) -> MutexGuard<'_, Vec<ResourceInstanceChange>> {
        self.changes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn output_changes(&self) -> MutexGuard<'_, Vec<OutputChange>> {
        self.output_changes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn take_changes(&self) -> (Vec<ResourceInstanceChange>, Vec<OutputChange>) {
        (
            std::mem::take(&mut *self.changes()),
            std::mem::take(&mut *self.output_changes()),
        )
    }

    fn targeted(&self, addr: &ResourceInstanceAddr) -> bool {
        self.targets.is_empty() || self.targets.iter().any(|t| t.matches_instance(addr))
    }

    fn plan(&self) -> Result<&Plan, Diagnostic> {
        self.plan
            .as_deref()
            .ok_or_else(|| Diagnostic::internal("apply walk without a plan"))
    }

    /// Hand a snapshot of the working state to the hooks.
    ///
    /// Snapshots are taken and delivered one at a time, so hooks see them in
    /// the order the state changed.
    async fn notify(&self) -> Result<(), Diagnostic> {
        if !self.notify_hooks || self.hooks.is_empty() {
            return Ok(());
        }
        let _guard = self.notify.lock().await;
        let snapshot = self.state.snapshot().await;
        for hook in &self.hooks {
            hook.post_state_update(&snapshot)
                .await
                .map_err(|e| Diagnostic::internal(format!("could not record state: {:#}", e)))?;
        }
        Ok(())
    }

    async fn each_hook<F, Fut>(&self, f: F) -> Result<(), Diagnostic>
    where
        F: Fn(Arc<dyn Hook>) -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<()>>,
    {
        for hook in &self.hooks {
            f(hook.clone())
                .await
                .map_err(|e| Diagnostic::internal(format!("hook failed: {:#}", e)))?;
        }
        Ok(())
    }

    fn evaluate_expr(
        &self,
        at: &dyn std::fmt::Display,
        module: &ModulePath,
        expr: &serde_json::Value,
        repetition: &Repetition,
    ) -> Result<Value, Diagnostic> {
        let values = self.values();
        let scope = Scope {
            module,
            values: &values,
            repetition,
        };
        eval::evaluate(expr, &scope).map_err(|e| Diagnostic::config_at(at, e.to_string()))
    }

    /// Decode an object from the state, upgrading it first if it was written
    /// under an older schema version.
    async fn decode_object(
        &self,
        provider: &Arc<dyn ResourceProvider>,
        addr: &ResourceInstanceAddr,
        src: &ResourceInstanceObjectSrc,
        schema: &Schema,
    ) -> Result<ResourceInstanceObject, Diagnostic> {
        let mut src = src.clone();
        if src.schema_version > schema.version {
            return Err(Diagnostic::config_at(
                addr,
                format!(
                    "object was written with schema version {}, newer than the provider's version {}",
                    src.schema_version, schema.version
                ),
            ));
        }
        if src.schema_version < schema.version {
            debug!(%addr, from = src.schema_version, to = schema.version, "upgrading object");
            src.attributes = provider
                .upgrade_resource_state(UpgradeResourceStateRequest {
                    type_name: addr.resource.type_.clone(),
                    version: src.schema_version,
                    raw: src.attributes,
                })
                .await
                .map_err(|e| Diagnostic::provider(addr, &e))?;
            src.schema_version = schema.version;
        }
        src.decode(&schema.block.implied_type())
            .map_err(|e| Diagnostic::internal(format!("{}: could not decode object: {}", addr, e)))
    }

    /// Record an object as current or deposed (`None` removes it), then
    /// notify the hooks.
    async fn write_object(
        &self,
        addr: &ResourceInstanceAddr,
        deposed: Option<&DeposedKey>,
        obj: Option<&ResourceInstanceObject>,
        schema: &Schema,
        provider: &ProviderAddr,
    ) -> Result<(), Diagnostic> {
        let src = match obj {
            Some(obj) => Some(
                obj.encode(schema.version)
                    .map_err(|e| Diagnostic::provider_msg(addr, format!("provider returned an invalid object: {}", e)))?,
            ),
            None => None,
        };
        self.state
            .write(|s| match deposed {
                Some(key) => s.set_deposed(addr, key, src, provider),
                None => s.set_current(addr, src, provider),
            })
            .await;
        debug!(%addr, deposed = ?deposed.map(|k| k.to_string()), removed = obj.is_none(), "wrote object");
        self.notify().await
    }

    async fn plan_with_provider(
        &self,
        provider: &Arc<dyn ResourceProvider>,
        addr: &ResourceInstanceAddr,
        schema: &Schema,
        prior: &Value,
        config: &Value,
    ) -> Result<PlanResourceChangeResponse, Diagnostic> {
        let proposed = proposed_new(&schema.block, prior, config);
        let response = provider
            .plan_resource_change(PlanResourceChangeRequest {
                type_name: addr.resource.type_.clone(),
                prior: prior.clone(),
                proposed,
                config: config.clone(),
            })
            .await
            .map_err(|e| Diagnostic::provider(addr, &e))?;
        check_planned(addr, schema, config, &response.planned)?;
        Ok(response)
    }
}

/// Check that a provider's plan fits the schema and keeps every configured
/// value of a non-computed attribute.
fn check_planned(addr: &ResourceInstanceAddr, schema: &Schema, config: &Value, planned: &Value) -> Result<(), Diagnostic> {
    planned
        .conforms_to(&schema.block.implied_type())
        .map_err(|e| Diagnostic::provider_msg(addr, format!("provider produced an invalid plan: {}", e)))?;
    for (name, attr) in &schema.block.attributes {
        if attr.computed {
            continue;
        }
        let configured = config.get_attr(name);
        if configured.is_wholly_known() && configured != planned.get_attr(name) {
            return Err(Diagnostic::provider_msg(
                addr,
                format!("provider produced an invalid plan: planned value for {} does not match configuration", name),
            ));
        }
    }
    Ok(())
}

/// Whether `actual` is a possible outcome of `planned`: equal wherever the
/// plan was known.
fn compatible(planned: &Value, actual: &Value) -> bool {
    match (planned, actual) {
        (Value::Unknown, _) => true,
        (Value::List(p), Value::List(a)) => p.len() == a.len() && p.iter().zip(a).all(|(p, a)| compatible(p, a)),
        // Set elements with unknowns cannot be matched up, and may collapse.
        (Value::Set(_), Value::Set(_)) if !planned.is_wholly_known() => true,
        (Value::Map(p), Value::Map(a)) | (Value::Object(p), Value::Object(a)) => {
            p.len() == a.len() && p.iter().all(|(k, p)| a.get(k).is_some_and(|a| compatible(p, a)))
        }
        _ => planned == actual,
    }
}

fn repetitions_for_each(addr: &ResourceAddr, value: Value) -> Result<Vec<Repetition>, Diagnostic> {
    let each = |key: String, value: Value| Repetition {
        count_index: None,
        each: Some((key, value)),
    };
    match value {
        Value::Unknown => Err(Diagnostic::unknown_value(
            addr,
            "for_each depends on values that are only known after apply",
        )),
        Value::Null => Err(Diagnostic::config_at(addr, "for_each must not be null")),
        Value::Map(items) | Value::Object(items) => Ok(items.into_iter().map(|(k, v)| each(k, v)).collect()),
        Value::Set(items) | Value::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(s) => out.push(each(s.clone(), Value::String(s))),
                    Value::Unknown => {
                        return Err(Diagnostic::unknown_value(
                            addr,
                            "for_each depends on values that are only known after apply",
                        ))
                    }
                    other => {
                        return Err(Diagnostic::config_at(
                            addr,
                            format!("for_each elements must be strings, found {}", other.type_name()),
                        ))
                    }
                }
            }
            Ok(out)
        }
        other => Err(Diagnostic::config_at(
            addr,
            format!("for_each must be a map or a set of strings, found {}", other.type_name()),
        )),
    }
}

impl WalkContext {
    /// The instances `count`/`for_each` expand a resource into.
    fn expand(&self, addr: &ResourceAddr, rc: &ResourceConfig) -> Result<Vec<Repetition>, Diagnostic> {
        let none = Repetition::default();
        if let Some(expr) = &rc.count {
            let count = self.evaluate_expr(addr, &addr.module, expr, &none)?;
            return match count {
                Value::Unknown => Err(Diagnostic::unknown_value(
                    addr,
                    "count depends on values that are only known after apply",
                )),
                v => match v.as_i64() {
                    Some(n) if n >= 0 => Ok((0..n)
                        .map(|i| Repetition {
                            count_index: Some(i),
                            each: None,
                        })
                        .collect()),
                    _ => Err(Diagnostic::config_at(addr, "count must be a non-negative whole number")),
                },
            };
        }
        if let Some(expr) = &rc.for_each {
            let value = self.evaluate_expr(addr, &addr.module, expr, &none)?;
            return repetitions_for_each(addr, value);
        }
        Ok(vec![none])
    }

    /// The repetition of a single instance, for evaluating its configuration
    /// at apply time.
    fn repetition_of(&self, addr: &ResourceInstanceAddr, rc: &ResourceConfig) -> Result<Repetition, Diagnostic> {
        match &addr.key {
            InstanceKey::NoKey => Ok(Repetition::default()),
            InstanceKey::Int(i) => Ok(Repetition {
                count_index: Some(*i),
                each: None,
            }),
            InstanceKey::Str(_) => self
                .expand(&addr.resource, rc)?
                .into_iter()
                .find(|r| r.key() == addr.key)
                .ok_or_else(|| Diagnostic::config_at(addr, "instance key is no longer produced by for_each")),
        }
    }

    fn evaluate_resource_config(
        &self,
        addr: &ResourceInstanceAddr,
        rc: &ResourceConfig,
        schema: &Schema,
        repetition: &Repetition,
    ) -> Result<Value, Diagnostics> {
        let value = self
            .evaluate_expr(addr, &addr.resource.module, &rc.config, repetition)?
            .convert(&schema.block.implied_type())
            .map_err(|e| Diagnostic::config_at(addr, e.to_string()))?;
        let errors: Diagnostics = schema
            .block
            .validate_config_value(&value)
            .into_iter()
            .map(|e| Diagnostic::config_at(addr, e.to_string()))
            .collect();
        errors.into_result()?;
        Ok(value)
    }
}

/// Evaluate one vertex.
pub(crate) async fn evaluate(ctx: Arc<WalkContext>, vertex: Vertex) -> Result<(), Diagnostics> {
    match (&vertex, ctx.phase) {
        (Vertex::Provider(addr), _) => configure_provider(&ctx, addr)
            .instrument(info_span!("configuring provider", provider = %addr))
            .await
            .map_err(Diagnostics::from),
        (Vertex::ModuleExpand(_), _) => Ok(()),
        (Vertex::Resource(addr), _) => plan_resource(&ctx, addr)
            .instrument(info_span!("planning resource", resource = %addr))
            .await,
        (Vertex::PlanOrphan(addr), _) => plan_orphan(&ctx, addr)
            .instrument(info_span!("planning resource instance", instance = %addr))
            .await
            .map_err(Diagnostics::from),
        (Vertex::PlanDeposed(addr, key), _) => {
            plan_delete(&ctx, addr, Some(key), ActionReason::None)
                .instrument(info_span!("planning deposed object", instance = %addr, deposed = %key))
                .await
                .map_err(Diagnostics::from)
        }
        (Vertex::ApplyInstance(addr), _) => apply_instance(&ctx, addr)
            .instrument(info_span!("applying resource instance", instance = %addr))
            .await,
        (Vertex::DestroyInstance(addr), _) => destroy_object(&ctx, addr, None)
            .instrument(info_span!("destroying resource instance", instance = %addr))
            .await
            .map_err(Diagnostics::from),
        (Vertex::DestroyDeposed(addr, key), _) => destroy_object(&ctx, addr, Some(key))
            .instrument(info_span!("destroying deposed object", instance = %addr, deposed = %key))
            .await
            .map_err(Diagnostics::from),
        (Vertex::RefreshInstance(addr), _) => refresh_instance(&ctx, addr)
            .instrument(info_span!("refreshing resource instance", instance = %addr))
            .await
            .map_err(Diagnostics::from),
        (Vertex::Output(module, name), Phase::Apply) => apply_output(&ctx, module, name)
            .instrument(info_span!("applying output", output = %output_display(module, name)))
            .await
            .map_err(Diagnostics::from),
        (Vertex::Output(module, name), _) => plan_output(&ctx, module, name)
            .instrument(info_span!("planning output", output = %output_display(module, name)))
            .await
            .map_err(Diagnostics::from),
    }
}

async fn configure_provider(ctx: &WalkContext, addr: &ProviderAddr) -> Result<(), Diagnostic> {
    let provider = ctx.providers.get(addr)?;
    let json = ctx
        .config
        .providers
        .get(&addr.name)
        .cloned()
        .unwrap_or_else(|| serde_json::json!({}));
    let mut value = ctx.evaluate_expr(addr, &ModulePath::root(), &json, &Repetition::default())?;
    if let Some(schema) = ctx.schemas.provider(addr) {
        value = value
            .convert(&schema.block.implied_type())
            .map_err(|e| Diagnostic::config_at(addr, e.to_string()))?;
        if let Some(e) = schema.block.validate_config_value(&value).into_iter().next() {
            return Err(Diagnostic::config_at(addr, e.to_string()));
        }
    }
    provider
        .configure(value)
        .await
        .map_err(|e| Diagnostic::provider(addr, &e))?;
    debug!("configured");
    Ok(())
}

async fn plan_resource(ctx: &WalkContext, addr: &ResourceAddr) -> Result<(), Diagnostics> {
    let rc = ctx
        .config
        .resource(addr)
        .ok_or_else(|| Diagnostic::internal(format!("{} is not configured", addr)))?;
    let provider_addr = rc.provider_addr();
    let schema = ctx.schemas.resource(&provider_addr, &addr.type_)?.clone();
    let each_mode = rc.each_mode();
    let dependencies = ctx.config.resource_dependencies(addr, rc)?;
    let repetitions = ctx.expand(addr, rc)?;
    ctx.values_mut().set_resource(addr, each_mode);

    let mut diags = Diagnostics::new();
    let mut wanted = BTreeSet::new();
    for repetition in &repetitions {
        let instance = addr.instance(repetition.key());
        wanted.insert(instance.key.clone());
        if !ctx.targeted(&instance) {
            // Keep references to untargeted instances resolvable.
            let prior = ctx.state.read(|s| s.current_object(&instance).cloned()).await;
            let value = match prior {
                Some(src) => src.decode(&schema.block.implied_type()).map(|o| o.value).unwrap_or(Value::Unknown),
                None => Value::Unknown,
            };
            ctx.values_mut().set_instance(&instance, each_mode, value);
            continue;
        }
        let planned = plan_instance(ctx, &instance, rc, &schema, &provider_addr, repetition, &dependencies)
            .instrument(info_span!("planning resource instance", instance = %instance))
            .await;
        if let Err(d) = planned {
            diags.extend(d);
        }
    }

    let stale: Vec<ResourceInstanceAddr> = ctx
        .state
        .read(|s| {
            s.resource(addr)
                .map(|rs| {
                    rs.instances
                        .iter()
                        .filter(|(key, inst)| !wanted.contains(*key) && inst.current.is_some())
                        .map(|(key, _)| addr.instance(key.clone()))
                        .collect()
                })
                .unwrap_or_default()
        })
        .await;
    for instance in stale {
        if !ctx.targeted(&instance) {
            continue;
        }
        let reason = match instance.key {
            InstanceKey::Int(_) => ActionReason::DeleteCountIndexOutOfRange,
            InstanceKey::Str(_) => ActionReason::DeleteEachKeyMissing,
            InstanceKey::NoKey => ActionReason::DeleteNoConfig,
        };
        if rc.lifecycle.prevent_destroy {
            diags.push(prevented(&instance));
            continue;
        }
        if let Err(d) = plan_delete(ctx, &instance, None, reason).await {
            diags.push(d);
        }
    }
    diags.into_result()
}

fn prevented(addr: &ResourceInstanceAddr) -> Diagnostic {
    Diagnostic::config_at(
        addr,
        "lifecycle.prevent_destroy is set, but the plan would destroy this object",
    )
}

async fn plan_instance(
    ctx: &WalkContext,
    addr: &ResourceInstanceAddr,
    rc: &ResourceConfig,
    schema: &Schema,
    provider_addr: &ProviderAddr,
    repetition: &Repetition,
    dependencies: &BTreeSet<ResourceAddr>,
) -> Result<(), Diagnostics> {
    let provider = ctx.providers.get(provider_addr)?;
    let prior_src = ctx.state.read(|s| s.current_object(addr).cloned()).await;
    let prior_obj = match &prior_src {
        Some(src) => Some(ctx.decode_object(&provider, addr, src, schema).await?),
        None => None,
    };
    let prior = prior_obj.as_ref().map(|o| o.value.clone()).unwrap_or_default();
    let tainted = prior_obj.as_ref().is_some_and(|o| o.status == ObjectStatus::Tainted);

    let config = ctx.evaluate_resource_config(addr, rc, schema, repetition)?;
    provider
        .validate_resource_config(&addr.resource.type_, &config)
        .await
        .map_err(|e| Diagnostic::config_at(addr, format!("{:#}", e)))?;

    let (action, reason, after, requires_replace) = if prior.is_null() {
        let planned = ctx.plan_with_provider(&provider, addr, schema, &prior, &config).await?;
        (Action::Create, ActionReason::None, planned.planned, vec![])
    } else if tainted {
        let planned = ctx.plan_with_provider(&provider, addr, schema, &Value::Null, &config).await?;
        (Action::DeleteThenCreate, ActionReason::Tainted, planned.planned, vec![])
    } else {
        let planned = ctx.plan_with_provider(&provider, addr, schema, &prior, &config).await?;
        if !planned.requires_replace.is_empty() {
            let fresh = ctx.plan_with_provider(&provider, addr, schema, &Value::Null, &config).await?;
            (
                Action::DeleteThenCreate,
                ActionReason::RequiresReplace,
                fresh.planned,
                planned.requires_replace,
            )
        } else if planned.planned == prior {
            (Action::NoOp, ActionReason::None, planned.planned, vec![])
        } else {
            (Action::Update, ActionReason::None, planned.planned, vec![])
        }
    };

    let cbd = ctx.config.create_before_destroy(&addr.resource);
    let action = match action {
        Action::DeleteThenCreate if cbd => Action::CreateThenDelete,
        other => other,
    };
    if action.deletes() && rc.lifecycle.prevent_destroy {
        return Err(prevented(addr).into());
    }
    info!(%action, reason = ?reason, "planned");

    ctx.values_mut().set_instance(addr, rc.each_mode(), after.clone());
    ctx.changes().push(ResourceInstanceChange {
        addr: addr.clone(),
        deposed_key: None,
        provider: provider_addr.clone(),
        action,
        action_reason: reason,
        before: prior,
        after,
        requires_replace,
        create_before_destroy: cbd,
        dependencies: dependencies.clone(),
    });
    Ok(())
}

async fn plan_orphan(ctx: &WalkContext, addr: &ResourceInstanceAddr) -> Result<(), Diagnostic> {
    if ctx.destroy {
        if ctx
            .config
            .resource(&addr.resource)
            .is_some_and(|rc| rc.lifecycle.prevent_destroy)
        {
            return Err(prevented(addr));
        }
        plan_delete(ctx, addr, None, ActionReason::DeleteByDestroyMode).await
    } else {
        plan_delete(ctx, addr, None, ActionReason::DeleteNoConfig).await
    }
}

/// Plan the removal of a current or deposed object.
async fn plan_delete(
    ctx: &WalkContext,
    addr: &ResourceInstanceAddr,
    deposed: Option<&DeposedKey>,
    reason: ActionReason,
) -> Result<(), Diagnostic> {
    let found = ctx
        .state
        .read(|s| {
            let obj = match deposed {
                Some(key) => s.deposed_object(addr, key),
                None => s.current_object(addr),
            };
            obj.cloned().zip(s.resource(&addr.resource).map(|rs| rs.provider.clone()))
        })
        .await;
    let Some((src, provider_addr)) = found else {
        return Ok(());
    };
    let provider = ctx.providers.get(&provider_addr)?;
    let schema = ctx.schemas.resource(&provider_addr, &addr.resource.type_)?;
    let obj = ctx.decode_object(&provider, addr, &src, schema).await?;
    info!(action = %Action::Delete, reason = ?reason, "planned");
    ctx.changes().push(ResourceInstanceChange {
        addr: addr.clone(),
        deposed_key: deposed.cloned(),
        provider: provider_addr,
        action: Action::Delete,
        action_reason: reason,
        before: obj.value,
        after: Value::Null,
        requires_replace: vec![],
        create_before_destroy: obj.create_before_destroy,
        dependencies: obj.dependencies,
    });
    Ok(())
}

async fn plan_output(ctx: &WalkContext, module: &ModulePath, name: &str) -> Result<(), Diagnostic> {
    let display = output_display(module, name);
    let oc = ctx
        .config
        .module(module)
        .and_then(|m| m.outputs.get(name))
        .ok_or_else(|| Diagnostic::internal(format!("{} is not configured", display)))?;
    let value = ctx.evaluate_expr(&display, module, &oc.value, &Repetition::default())?;
    ctx.values_mut().set_output(module, name, value.clone());
    let before = ctx
        .state
        .read(|s| s.module(module).and_then(|m| m.outputs.get(name)).map(|o| o.value.clone()))
        .await;
    let before = match before {
        Some(json) => Some(
            Value::from_json(&json, &Type::Dynamic).map_err(|e| Diagnostic::internal(format!("{}: {}", display, e)))?,
        ),
        None => None,
    };
    let action = match &before {
        None => Action::Create,
        Some(b) if *b == value => Action::NoOp,
        Some(_) => Action::Update,
    };
    ctx.output_changes().push(OutputChange {
        module: module.clone(),
        name: name.to_string(),
        action,
        before: before.unwrap_or_default(),
        after: value,
        sensitive: oc.sensitive,
    });
    Ok(())
}

async fn apply_output(ctx: &WalkContext, module: &ModulePath, name: &str) -> Result<(), Diagnostic> {
    let display = output_display(module, name);
    let oc = ctx
        .config
        .module(module)
        .and_then(|m| m.outputs.get(name))
        .ok_or_else(|| Diagnostic::internal(format!("{} is not configured", display)))?;
    let value = ctx.evaluate_expr(&display, module, &oc.value, &Repetition::default())?;
    let json = value
        .to_json()
        .map_err(|e| Diagnostic::config_at(&display, format!("value is not known after apply: {}", e)))?;
    ctx.values_mut().set_output(module, name, value);
    ctx.state
        .write(|s| {
            s.set_output(
                module,
                name,
                Some(OutputValue {
                    value: json,
                    sensitive: oc.sensitive,
                }),
            )
        })
        .await;
    ctx.notify().await
}

async fn apply_instance(ctx: &WalkContext, addr: &ResourceInstanceAddr) -> Result<(), Diagnostics> {
    let plan = ctx.plan()?;
    let change = plan
        .change(addr, None)
        .ok_or_else(|| Diagnostic::internal(format!("no planned change for {}", addr)))?;
    let rc = ctx
        .config
        .resource(&addr.resource)
        .ok_or_else(|| Diagnostic::internal(format!("{} is not configured", addr.resource)))?;
    let each_mode = rc.each_mode();
    let provider = ctx.providers.get(&change.provider)?;
    let schema = ctx.schemas.resource(&change.provider, &addr.resource.type_)?;

    let current = ctx.state.read(|s| s.current_object(addr).cloned()).await;
    let current = match &current {
        Some(src) => Some(ctx.decode_object(&provider, addr, src, schema).await?),
        None => None,
    };

    if change.action == Action::NoOp {
        let value = current.map(|o| o.value).unwrap_or_else(|| change.after.clone());
        ctx.values_mut().set_instance(addr, each_mode, value);
        return Ok(());
    }

    let repetition = ctx.repetition_of(addr, rc)?;
    let config = ctx.evaluate_resource_config(addr, rc, schema, &repetition)?;
    if !config.is_wholly_known() {
        return Err(Diagnostic::internal(format!("{}: configuration is not known at apply time", addr)).into());
    }
    let prior = match change.action {
        Action::Update => current.as_ref().map(|o| o.value.clone()).unwrap_or_default(),
        _ => Value::Null,
    };
    let planned = ctx.plan_with_provider(&provider, addr, schema, &prior, &config).await?;
    if !compatible(&change.after, &planned.planned) {
        return Err(Diagnostic::provider_msg(
            addr,
            "provider produced an inconsistent final plan: the planned value changed since the plan was made",
        )
        .into());
    }

    let mut deposed_as = None;
    if change.action == Action::CreateThenDelete {
        let key = ctx
            .replace_keys
            .get(addr)
            .ok_or_else(|| Diagnostic::internal(format!("no deposed key allocated for {}", addr)))?;
        if ctx.state.write(|s| s.depose_current_as(addr, key)).await {
            info!(deposed = %key, "deposed current object");
            deposed_as = Some(key.clone());
            ctx.notify().await?;
        }
    }

    ctx.each_hook(|h| async move { h.pre_apply(addr, None, change.action).await })
        .await?;
    let response = provider
        .apply_resource_change(ApplyResourceChangeRequest {
            type_name: addr.resource.type_.clone(),
            prior: prior.clone(),
            planned: planned.planned,
            config: config.clone(),
            cancel: ctx.cancel.clone(),
        })
        .await;

    let new_state = response.new_state;
    if let Some(err) = response.error {
        let mut diags = Diagnostics::from(Diagnostic::provider(addr, &err));
        if !new_state.is_null() {
            // Whatever the provider reports to exist must stay tracked.
            let obj = ResourceInstanceObject {
                status: if change.action.creates() {
                    ObjectStatus::Tainted
                } else {
                    ObjectStatus::Ready
                },
                value: new_state.transform(&mut |_, v| if v.is_unknown() { Value::Null } else { v }),
                dependencies: change.dependencies.clone(),
                create_before_destroy: change.create_before_destroy,
            };
            info!(status = ?obj.status, "recording partial object after failed apply");
            if let Err(d) = ctx.write_object(addr, None, Some(&obj), schema, &change.provider).await {
                diags.push(d);
            }
        } else if let Some(key) = &deposed_as {
            if ctx.state.write(|s| s.maybe_restore_deposed(addr, key)).await {
                info!(deposed = %key, "restored deposed object");
                if let Err(d) = ctx.notify().await {
                    diags.push(d);
                }
            }
        }
        let message = format!("{:#}", err);
        ctx.each_hook(|h| {
            let message = message.clone();
            async move { h.post_apply(addr, None, change.action, Some(&message)).await }
        })
        .await?;
        return Err(diags);
    }

    if new_state.is_null() || !new_state.is_wholly_known() {
        return Err(Diagnostic::provider_msg(addr, "provider returned an incomplete object after apply").into());
    }
    if !compatible(&change.after, &new_state) {
        warn!("provider produced an object that differs from the plan");
    }
    let obj = ResourceInstanceObject {
        status: ObjectStatus::Ready,
        value: new_state,
        dependencies: change.dependencies.clone(),
        create_before_destroy: change.create_before_destroy,
    };
    ctx.state
        .write(|s| s.set_each_mode(&addr.resource, each_mode, &change.provider))
        .await;
    ctx.write_object(addr, None, Some(&obj), schema, &change.provider).await?;
    ctx.each_hook(|h| async move { h.post_apply(addr, None, change.action, None).await })
        .await?;
    ctx.values_mut().set_instance(addr, each_mode, obj.value);
    info!(action = %change.action, "applied");
    Ok(())
}

async fn destroy_object(
    ctx: &WalkContext,
    addr: &ResourceInstanceAddr,
    deposed: Option<&DeposedKey>,
) -> Result<(), Diagnostic> {
    let plan = ctx.plan()?;
    let provider_addr = plan
        .change(addr, deposed)
        .or_else(|| plan.change(addr, None))
        .map(|c| c.provider.clone())
        .ok_or_else(|| Diagnostic::internal(format!("no planned change for {}", addr)))?;
    let src = ctx
        .state
        .read(|s| match deposed {
            Some(key) => s.deposed_object(addr, key).cloned(),
            None => s.current_object(addr).cloned(),
        })
        .await;
    let Some(src) = src else {
        debug!("nothing to destroy");
        return Ok(());
    };
    let provider = ctx.providers.get(&provider_addr)?;
    let schema = ctx.schemas.resource(&provider_addr, &addr.resource.type_)?;
    let obj = ctx.decode_object(&provider, addr, &src, schema).await?;

    ctx.each_hook(|h| async move { h.pre_apply(addr, deposed, Action::Delete).await })
        .await?;
    let response = provider
        .apply_resource_change(ApplyResourceChangeRequest {
            type_name: addr.resource.type_.clone(),
            prior: obj.value,
            planned: Value::Null,
            config: Value::Null,
            cancel: ctx.cancel.clone(),
        })
        .await;
    let error = match (response.error, response.new_state.is_null()) {
        (Some(e), _) => Some(Diagnostic::provider(addr, &e)),
        (None, false) => Some(Diagnostic::provider_msg(addr, "provider returned an object after destroying it")),
        (None, true) => None,
    };
    if let Some(d) = error {
        // The object is left exactly as it was, to be retried.
        let message = d.to_string();
        ctx.each_hook(|h| {
            let message = message.clone();
            async move { h.post_apply(addr, deposed, Action::Delete, Some(&message)).await }
        })
        .await?;
        return Err(d);
    }
    ctx.write_object(addr, deposed, None, schema, &provider_addr).await?;
    ctx.each_hook(|h| async move { h.post_apply(addr, deposed, Action::Delete, None).await })
        .await?;
    info!("destroyed");
    Ok(())
}

async fn refresh_instance(ctx: &WalkContext, addr: &ResourceInstanceAddr) -> Result<(), Diagnostic> {
    let found = ctx
        .state
        .read(|s| {
            s.current_object(addr)
                .cloned()
                .zip(s.resource(&addr.resource).map(|rs| rs.provider.clone()))
        })
        .await;
    let Some((src, provider_addr)) = found else {
        return Ok(());
    };
    let provider = ctx.providers.get(&provider_addr)?;
    let schema = ctx.schemas.resource(&provider_addr, &addr.resource.type_)?;
    let obj = ctx.decode_object(&provider, addr, &src, schema).await?;

    ctx.each_hook(|h| async move { h.pre_refresh(addr).await }).await?;
    let value = provider
        .read_resource(ReadResourceRequest {
            type_name: addr.resource.type_.clone(),
            prior: obj.value.clone(),
            cancel: ctx.cancel.clone(),
        })
        .await
        .map_err(|e| Diagnostic::provider(addr, &e))?;
    let gone = value.is_null();
    if gone {
        info!("object no longer exists");
        ctx.write_object(addr, None, None, schema, &provider_addr).await?;
    } else {
        value
            .conforms_to(&schema.block.implied_type())
            .map_err(|e| Diagnostic::provider_msg(addr, format!("provider returned an invalid object: {}", e)))?;
        let refreshed = ResourceInstanceObject { value, ..obj };
        ctx.write_object(addr, None, Some(&refreshed), schema, &provider_addr).await?;
    }
    ctx.each_hook(|h| async move { h.post_refresh(addr, gone).await }).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn value(json: serde_json::Value) -> Value {
        Value::from_json(&json, &Type::Dynamic).unwrap()
    }

    #[test]
    fn unknowns_in_the_plan_accept_anything() {
        let planned = Value::object([("id", Value::Unknown), ("name", Value::string("a"))]);
        assert!(compatible(&planned, &value(json!({"id": "x1", "name": "a"}))));
        assert!(!compatible(&planned, &value(json!({"id": "x1", "name": "b"}))));
        assert!(!compatible(&planned, &value(json!({"name": "a"}))));
        assert!(compatible(&Value::Unknown, &Value::Null));
    }

    #[test]
    fn for_each_keys() {
        let addr: ResourceAddr = "local_file.f".parse().unwrap();
        let reps = repetitions_for_each(&addr, Value::set([Value::string("b"), Value::string("a")])).unwrap();
        let keys: Vec<InstanceKey> = reps.iter().map(Repetition::key).collect();
        assert_eq!(keys, vec![InstanceKey::Str("a".into()), InstanceKey::Str("b".into())]);

        let err = repetitions_for_each(&addr, Value::Unknown).unwrap_err();
        assert!(matches!(err, Diagnostic::UnknownValue { .. }));
        assert!(err.to_string().contains("--target"));

        let err = repetitions_for_each(&addr, Value::List(vec![Value::Bool(true)])).unwrap_err();
        assert!(err.is_config());
    }
}
