//! A scriptable in-memory provider and helpers for engine tests.

#![allow(dead_code)]

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use grove::{
    config::Config,
    context::{Context, OperationResult, PlanOptions, PlanResult},
    providers::Providers,
};
use grove_core::{
    schema::{Attribute, Block, ProviderSchema, Schema},
    states::State,
    value::{PathStep, Type, Value},
};
use grove_resource::provider::{
    ApplyResourceChangeRequest, ApplyResourceChangeResponse, PlanResourceChangeRequest, PlanResourceChangeResponse,
    ReadResourceRequest, ResourceProvider, UpgradeResourceStateRequest,
};
use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

/// Provider `mock` with the single resource type `mock_thing`.
///
/// Every call is recorded as `"<call> <name>"`. Changing `force` requires
/// replacement; `id` is computed on create. Schema version 0 called `value`
/// `label`; objects written under it are upgraded by renaming the attribute.
#[derive(Default)]
pub struct MockProvider {
    calls: Mutex<Vec<String>>,
    /// Names whose create fails, leaving a partial object behind.
    pub fail_create: Mutex<BTreeSet<String>>,
    /// Ids whose destroy fails.
    pub fail_destroy: Mutex<BTreeSet<String>>,
    /// Names that no longer exist when read.
    pub gone: Mutex<BTreeSet<String>>,
    pub schema_version: AtomicU64,
    next_id: Mutex<u64>,
}

impl MockProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Recorded calls of one kind, e.g. `"create"`, in order.
    pub fn calls_of(&self, kind: &str) -> Vec<String> {
        let prefix = format!("{} ", kind);
        self.calls()
            .into_iter()
            .filter_map(|c| c.strip_prefix(&prefix).map(str::to_owned))
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn record(&self, call: &str, name: &str) {
        self.calls.lock().unwrap().push(format!("{} {}", call, name));
    }

    fn fresh_id(&self, name: &str) -> String {
        let mut next = self.next_id.lock().unwrap();
        *next += 1;
        format!("id-{}-{}", name, next)
    }
}

fn name_of(v: &Value) -> String {
    v.get_attr("name").as_str().unwrap_or("?").to_string()
}

fn with_attr(v: Value, name: &str, attr: Value) -> Value {
    match v {
        Value::Object(mut attrs) => {
            attrs.insert(name.to_string(), attr);
            Value::Object(attrs)
        }
        other => other,
    }
}

pub fn thing_schema() -> Schema {
    Schema {
        version: 0,
        block: Block {
            attributes: [
                ("name", Attribute::required(Type::String)),
                ("value", Attribute::optional(Type::String)),
                ("force", Attribute::optional(Type::String)),
                ("id", Attribute::computed(Type::String)),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
            block_types: Default::default(),
            description: None,
        },
    }
}

#[async_trait]
impl ResourceProvider for MockProvider {
    fn schema(&self) -> ProviderSchema {
        ProviderSchema {
            provider: None,
            resource_schemas: [(
                "mock_thing".to_string(),
                Schema {
                    version: self.schema_version.load(Ordering::SeqCst),
                    ..thing_schema()
                },
            )]
            .into_iter()
            .collect(),
        }
    }

    async fn upgrade_resource_state(&self, request: UpgradeResourceStateRequest) -> Result<serde_json::Value> {
        let mut raw = request.raw;
        self.record("upgrade", raw["name"].as_str().unwrap_or("?"));
        if request.version == 0 {
            if let Some(attrs) = raw.as_object_mut() {
                if let Some(label) = attrs.remove("label") {
                    attrs.insert("value".to_string(), label);
                }
            }
        }
        Ok(raw)
    }

    async fn read_resource(&self, request: ReadResourceRequest) -> Result<Value> {
        let name = name_of(&request.prior);
        self.record("read", &name);
        if self.gone.lock().unwrap().contains(&name) {
            return Ok(Value::Null);
        }
        Ok(request.prior)
    }

    async fn plan_resource_change(&self, request: PlanResourceChangeRequest) -> Result<PlanResourceChangeResponse> {
        if request.type_name != "mock_thing" {
            bail!("unknown resource type {}", request.type_name);
        }
        if request.proposed.is_null() {
            return Ok(PlanResourceChangeResponse {
                planned: Value::Null,
                requires_replace: vec![],
            });
        }
        self.record("plan", &name_of(&request.proposed));
        if request.prior.is_null() {
            return Ok(PlanResourceChangeResponse {
                planned: with_attr(request.proposed, "id", Value::Unknown),
                requires_replace: vec![],
            });
        }
        let requires_replace = if request.prior.get_attr("force") != request.proposed.get_attr("force") {
            vec![vec![PathStep::Attr("force".to_string())]]
        } else {
            vec![]
        };
        Ok(PlanResourceChangeResponse {
            planned: with_attr(request.proposed, "id", request.prior.get_attr("id")),
            requires_replace,
        })
    }

    async fn apply_resource_change(&self, request: ApplyResourceChangeRequest) -> ApplyResourceChangeResponse {
        if request.planned.is_null() {
            let id = request.prior.get_attr("id").as_str().unwrap_or_default().to_string();
            self.record("delete", &name_of(&request.prior));
            if self.fail_destroy.lock().unwrap().contains(&id) {
                return ApplyResourceChangeResponse::failed(request.prior, anyhow!("cannot delete {}", id));
            }
            return ApplyResourceChangeResponse::ok(Value::Null);
        }
        let name = name_of(&request.planned);
        if request.prior.is_null() {
            self.record("create", &name);
            if self.fail_create.lock().unwrap().contains(&name) {
                let partial = with_attr(request.planned, "id", Value::string(format!("partial-{}", name)));
                return ApplyResourceChangeResponse::failed(partial, anyhow!("{} was created but not configured", name));
            }
            let id = self.fresh_id(&name);
            ApplyResourceChangeResponse::ok(with_attr(request.planned, "id", Value::string(id)))
        } else {
            self.record("update", &name);
            ApplyResourceChangeResponse::ok(request.planned)
        }
    }
}

pub fn config(json: serde_json::Value) -> (Config, serde_json::Value) {
    (Config::from_json(json.clone()).unwrap(), json)
}

pub fn context(mock: &Arc<MockProvider>) -> Context {
    Context::new(Providers::new().with("mock", mock.clone()))
}

/// Plan, failing the test on any diagnostic.
pub async fn plan_ok(ctx: &Context, json: &serde_json::Value, state: State, options: &PlanOptions) -> PlanResult {
    let (config, json) = config(json.clone());
    let result = ctx.plan(&config, json, state, options).await;
    assert!(result.diagnostics.is_empty(), "unexpected diagnostics: {}", result.diagnostics);
    result
}

/// Plan and apply, failing the test on any diagnostic.
pub async fn plan_and_apply(ctx: &Context, json: &serde_json::Value, state: State) -> OperationResult {
    let planned = plan_ok(ctx, json, state.clone(), &PlanOptions::default()).await;
    let result = ctx.apply(&planned.plan, &state).await;
    assert!(result.diagnostics.is_empty(), "unexpected diagnostics: {}", result.diagnostics);
    result
}

pub fn thing(name: &str, body: serde_json::Value) -> serde_json::Value {
    let mut config = serde_json::json!({"name": name});
    if let (Some(config), Some(body)) = (config.as_object_mut(), body.as_object()) {
        config.extend(body.clone());
    }
    serde_json::json!({"type": "mock_thing", "name": name, "config": config})
}
