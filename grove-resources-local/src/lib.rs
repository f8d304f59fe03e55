//! The built-in `local` provider.
//!
//! - `local_file`: a file on the machine running grove.
//! - `local_id`: a random identifier, regenerated only when its `keepers`
//!   change.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use grove_core::{
    objchange::proposed_new,
    schema::{Attribute, Block, ProviderSchema, Schema},
    value::{PathStep, Type, Value},
};
use grove_resource::provider::{
    ApplyResourceChangeRequest, ApplyResourceChangeResponse, PlanResourceChangeRequest, PlanResourceChangeResponse,
    ReadResourceRequest, ResourceProvider,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::debug;

const DEFAULT_FILE_PERMISSION: &str = "0644";
const DEFAULT_BYTE_LENGTH: i64 = 8;

#[derive(Debug, Default)]
pub struct LocalProvider {}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
struct FileInProperties {
    filename: String,
    content: String,
    file_permission: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
struct IdInProperties {
    #[serde(default)]
    keepers: Option<BTreeMap<String, String>>,
    byte_length: Option<i64>,
}

fn attrs(list: Vec<(&str, Attribute)>) -> BTreeMap<String, Attribute> {
    list.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

fn file_schema() -> Schema {
    Schema {
        version: 0,
        block: Block {
            attributes: attrs(vec![
                ("filename", Attribute::required(Type::String)),
                ("content", Attribute::required(Type::String)),
                ("file_permission", Attribute::optional_computed(Type::String)),
                ("id", Attribute::computed(Type::String)),
            ]),
            block_types: BTreeMap::new(),
            description: Some("A file on the machine running grove".to_string()),
        },
    }
}

fn id_schema() -> Schema {
    Schema {
        version: 0,
        block: Block {
            attributes: attrs(vec![
                ("keepers", Attribute::optional(Type::map(Type::String))),
                ("byte_length", Attribute::optional_computed(Type::Number)),
                ("hex", Attribute::computed(Type::String)),
                ("id", Attribute::computed(Type::String)),
            ]),
            block_types: BTreeMap::new(),
            description: Some("A random identifier".to_string()),
        },
    }
}

fn parse_properties<T: for<'de> Deserialize<'de>>(value: &Value, resource_type: &str) -> Result<T> {
    let json = value
        .to_json()
        .with_context(|| format!("Configuration for {} resource is not fully known", resource_type))?;
    serde_json::from_value(json)
        .with_context(|| format!("Could not deserialize properties for {} resource", resource_type))
}

/// Mark every computed attribute that has no value yet as unknown.
fn unknown_computed(block: &Block, mut planned: Value) -> Value {
    if let Value::Object(attrs) = &mut planned {
        for (name, attr) in &block.attributes {
            if attr.computed && attrs.get(name).is_none_or(Value::is_null) {
                attrs.insert(name.clone(), Value::Unknown);
            }
        }
    }
    planned
}

fn attr_changed(prior: &Value, planned: &Value, name: &str) -> bool {
    let new = planned.get_attr(name);
    new.is_known() && prior.get_attr(name) != new
}

fn random_hex(byte_length: i64) -> String {
    let mut hex = String::new();
    while (hex.len() as i64) < byte_length * 2 {
        hex.push_str(&uuid::Uuid::new_v4().simple().to_string());
    }
    hex.truncate((byte_length * 2) as usize);
    hex
}

impl LocalProvider {
    pub fn new() -> Self {
        LocalProvider {}
    }

    fn schema_for(&self, type_name: &str) -> Result<Schema> {
        match type_name {
            "local_file" => Ok(file_schema()),
            "local_id" => Ok(id_schema()),
            t => bail!("LocalProvider: unknown resource type: {}", t),
        }
    }

    async fn apply_file(&self, request: &ApplyResourceChangeRequest) -> Result<Value> {
        if request.planned.is_null() {
            let filename = request
                .prior
                .get_attr("filename")
                .as_str()
                .map(str::to_owned)
                .ok_or_else(|| anyhow!("local_file state has no filename"))?;
            match tokio::fs::remove_file(&filename).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_context(|| format!("Could not remove {}", filename)),
            }
            debug!(filename, "removed file");
            return Ok(Value::Null);
        }

        let p: FileInProperties = parse_properties(&request.config, "local_file")?;
        let permission = p
            .file_permission
            .clone()
            .unwrap_or_else(|| DEFAULT_FILE_PERMISSION.to_string());
        let mode = u32::from_str_radix(&permission, 8)
            .with_context(|| format!("Invalid file_permission {:?}", permission))?;

        // The old file must go if the file moved.
        if let Some(old) = request.prior.get_attr("filename").as_str() {
            if old != p.filename {
                match tokio::fs::remove_file(old).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e).with_context(|| format!("Could not remove {}", old)),
                }
            }
        }

        tokio::fs::write(&p.filename, &p.content)
            .await
            .with_context(|| format!("Could not write {}", p.filename))?;
        set_mode(&p.filename, mode).await?;
        debug!(filename = p.filename, "wrote file");

        Ok(Value::object([
            ("filename", Value::from(p.filename.clone())),
            ("content", Value::from(p.content)),
            ("file_permission", Value::from(permission)),
            ("id", Value::from(p.filename)),
        ]))
    }

    fn apply_id(&self, request: &ApplyResourceChangeRequest) -> Result<Value> {
        if request.planned.is_null() {
            return Ok(Value::Null);
        }
        let p: IdInProperties = parse_properties(&request.config, "local_id")?;
        let byte_length = p.byte_length.unwrap_or(DEFAULT_BYTE_LENGTH);
        if byte_length < 1 {
            bail!("byte_length must be at least 1, got {}", byte_length);
        }
        // In-place updates keep the identifier.
        let hex = match request.prior.get_attr("hex") {
            Value::String(hex) if !request.prior.is_null() => hex,
            _ => random_hex(byte_length),
        };
        let keepers = match p.keepers {
            Some(keepers) => Value::Map(keepers.into_iter().map(|(k, v)| (k, Value::from(v))).collect()),
            None => Value::Null,
        };
        Ok(Value::object([
            ("keepers", keepers),
            ("byte_length", Value::from(byte_length)),
            ("id", Value::from(hex.clone())),
            ("hex", Value::from(hex)),
        ]))
    }
}

#[cfg(unix)]
async fn set_mode(filename: &str, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(filename, std::fs::Permissions::from_mode(mode))
        .await
        .with_context(|| format!("Could not set permissions of {}", filename))
}

#[cfg(not(unix))]
async fn set_mode(_filename: &str, _mode: u32) -> Result<()> {
    Ok(())
}

#[async_trait]
impl ResourceProvider for LocalProvider {
    fn schema(&self) -> ProviderSchema {
        ProviderSchema {
            provider: None,
            resource_schemas: BTreeMap::from([
                ("local_file".to_string(), file_schema()),
                ("local_id".to_string(), id_schema()),
            ]),
        }
    }

    async fn validate_resource_config(&self, type_name: &str, config: &Value) -> Result<()> {
        match type_name {
            "local_file" => {
                if let Some(permission) = config.get_attr("file_permission").as_str() {
                    u32::from_str_radix(permission, 8)
                        .with_context(|| format!("file_permission must be an octal mode, got {:?}", permission))?;
                }
                Ok(())
            }
            "local_id" => {
                if let Some(n) = config.get_attr("byte_length").as_i64() {
                    if n < 1 {
                        bail!("byte_length must be at least 1, got {}", n);
                    }
                }
                Ok(())
            }
            t => bail!("LocalProvider: unknown resource type: {}", t),
        }
    }

    async fn read_resource(&self, request: ReadResourceRequest) -> Result<Value> {
        match request.type_name.as_str() {
            "local_file" => {
                let Some(filename) = request.prior.get_attr("filename").as_str().map(str::to_owned) else {
                    return Ok(request.prior);
                };
                match tokio::fs::read_to_string(&filename).await {
                    Ok(content) => {
                        let mut refreshed = request.prior;
                        if let Value::Object(attrs) = &mut refreshed {
                            attrs.insert("content".to_string(), Value::from(content));
                        }
                        Ok(refreshed)
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        debug!(filename, "file is gone");
                        Ok(Value::Null)
                    }
                    Err(e) => Err(e).with_context(|| format!("Could not read {}", filename)),
                }
            }
            "local_id" => Ok(request.prior),
            t => bail!("LocalProvider::read_resource: unknown resource type: {}", t),
        }
    }

    async fn plan_resource_change(&self, request: PlanResourceChangeRequest) -> Result<PlanResourceChangeResponse> {
        let schema = self.schema_for(&request.type_name)?;
        if request.proposed.is_null() {
            return Ok(PlanResourceChangeResponse {
                planned: Value::Null,
                requires_replace: vec![],
            });
        }

        let mut planned = request.proposed.clone();
        let defaults: &[(&str, Value)] = match request.type_name.as_str() {
            "local_file" => &[("file_permission", Value::String(DEFAULT_FILE_PERMISSION.to_string()))],
            _ => &[("byte_length", Value::Number(DEFAULT_BYTE_LENGTH.into()))],
        };
        if let Value::Object(attrs) = &mut planned {
            for (name, default) in defaults {
                if attrs.get(*name).is_none_or(Value::is_null) {
                    attrs.insert(name.to_string(), default.clone());
                }
            }
        }

        if request.prior.is_null() {
            return Ok(PlanResourceChangeResponse {
                planned: unknown_computed(&schema.block, planned),
                requires_replace: vec![],
            });
        }

        let replace_attrs: &[&str] = match request.type_name.as_str() {
            "local_file" => &["filename"],
            _ => &["keepers", "byte_length"],
        };
        let requires_replace: Vec<Vec<PathStep>> = replace_attrs
            .iter()
            .filter(|name| attr_changed(&request.prior, &planned, name))
            .map(|name| vec![PathStep::Attr(name.to_string())])
            .collect();

        if !requires_replace.is_empty() {
            // The replacement computes everything afresh.
            let fresh = proposed_new(&schema.block, &Value::Null, &request.config);
            let mut fresh = unknown_computed(&schema.block, fresh);
            if let Value::Object(attrs) = &mut fresh {
                for (name, default) in defaults {
                    if attrs.get(*name).is_none_or(|v| v.is_null() || v.is_unknown()) {
                        attrs.insert(name.to_string(), default.clone());
                    }
                }
            }
            return Ok(PlanResourceChangeResponse {
                planned: fresh,
                requires_replace,
            });
        }

        if request.type_name == "local_file" && attr_changed(&request.prior, &planned, "content") {
            // The id is derived from the filename, which did not change.
            debug!("local_file content changes in place");
        }
        Ok(PlanResourceChangeResponse {
            planned,
            requires_replace,
        })
    }

    async fn apply_resource_change(&self, request: ApplyResourceChangeRequest) -> ApplyResourceChangeResponse {
        if request.cancel.is_cancelled() {
            return ApplyResourceChangeResponse::failed(request.prior.clone(), anyhow!("operation cancelled"));
        }
        let result = match request.type_name.as_str() {
            "local_file" => self.apply_file(&request).await,
            "local_id" => self.apply_id(&request),
            t => Err(anyhow!("LocalProvider::apply_resource_change: unknown resource type: {}", t)),
        };
        match result {
            Ok(new_state) => ApplyResourceChangeResponse::ok(new_state),
            // Nothing was changed; the prior object is still what exists.
            Err(e) => ApplyResourceChangeResponse::failed(request.prior.clone(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grove_core::objchange::proposed_new;
    use tokio_util::sync::CancellationToken;

    fn file_config(filename: &str, content: &str) -> Value {
        Value::object([
            ("filename", Value::from(filename)),
            ("content", Value::from(content)),
            ("file_permission", Value::Null),
            ("id", Value::Null),
        ])
    }

    async fn plan(provider: &LocalProvider, type_name: &str, prior: &Value, config: &Value) -> PlanResourceChangeResponse {
        let schema = provider.schema_for(type_name).unwrap();
        let proposed = proposed_new(&schema.block, prior, config);
        provider
            .plan_resource_change(PlanResourceChangeRequest {
                type_name: type_name.to_string(),
                prior: prior.clone(),
                proposed,
                config: config.clone(),
            })
            .await
            .unwrap()
    }

    async fn apply(provider: &LocalProvider, type_name: &str, prior: &Value, planned: &Value, config: &Value) -> ApplyResourceChangeResponse {
        provider
            .apply_resource_change(ApplyResourceChangeRequest {
                type_name: type_name.to_string(),
                prior: prior.clone(),
                planned: planned.clone(),
                config: config.clone(),
                cancel: CancellationToken::new(),
            })
            .await
    }

    #[tokio::test]
    async fn file_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        let filename = path.to_str().unwrap();
        let provider = LocalProvider::new();

        let config = file_config(filename, "hi");
        let planned = plan(&provider, "local_file", &Value::Null, &config).await;
        assert_eq!(planned.planned.get_attr("id"), Value::Unknown);
        assert_eq!(planned.planned.get_attr("file_permission"), Value::from("0644"));

        let created = apply(&provider, "local_file", &Value::Null, &planned.planned, &config).await;
        assert!(created.error.is_none());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hi");
        let state = created.new_state;
        assert_eq!(state.get_attr("id"), Value::from(filename));

        // Same configuration: planned equals prior
        let again = plan(&provider, "local_file", &state, &config).await;
        assert_eq!(again.planned, state);
        assert!(again.requires_replace.is_empty());

        // Content changes in place
        let config2 = file_config(filename, "bye");
        let update = plan(&provider, "local_file", &state, &config2).await;
        assert!(update.requires_replace.is_empty());
        let updated = apply(&provider, "local_file", &state, &update.planned, &config2).await;
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "bye");

        // Drift is detected by read
        std::fs::write(&path, "tampered").unwrap();
        let read = provider
            .read_resource(ReadResourceRequest {
                type_name: "local_file".to_string(),
                prior: updated.new_state.clone(),
                cancel: CancellationToken::new(),
            })
            .await
            .unwrap();
        assert_eq!(read.get_attr("content"), Value::from("tampered"));

        let destroyed = apply(&provider, "local_file", &read, &Value::Null, &Value::Null).await;
        assert!(destroyed.error.is_none());
        assert_eq!(destroyed.new_state, Value::Null);
        assert!(!path.exists());

        let gone = provider
            .read_resource(ReadResourceRequest {
                type_name: "local_file".to_string(),
                prior: read,
                cancel: CancellationToken::new(),
            })
            .await
            .unwrap();
        assert_eq!(gone, Value::Null);
    }

    #[tokio::test]
    async fn renaming_a_file_requires_replacement() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let provider = LocalProvider::new();
        let config = file_config(a.to_str().unwrap(), "x");
        let planned = plan(&provider, "local_file", &Value::Null, &config).await;
        let state = apply(&provider, "local_file", &Value::Null, &planned.planned, &config)
            .await
            .new_state;

        let moved = plan(&provider, "local_file", &state, &file_config(b.to_str().unwrap(), "x")).await;
        assert_eq!(moved.requires_replace, vec![vec![PathStep::Attr("filename".to_string())]]);
        assert_eq!(moved.planned.get_attr("id"), Value::Unknown);
    }

    #[tokio::test]
    async fn id_is_stable_until_keepers_change() {
        let provider = LocalProvider::new();
        let config = |k: &str| {
            Value::object([
                ("keepers", Value::Map(BTreeMap::from([("k".to_string(), Value::from(k))]))),
                ("byte_length", Value::Null),
                ("hex", Value::Null),
                ("id", Value::Null),
            ])
        };
        let planned = plan(&provider, "local_id", &Value::Null, &config("1")).await;
        assert_eq!(planned.planned.get_attr("hex"), Value::Unknown);
        let state = apply(&provider, "local_id", &Value::Null, &planned.planned, &config("1"))
            .await
            .new_state;
        assert_eq!(state.get_attr("hex").as_str().unwrap().len(), 16);

        let same = plan(&provider, "local_id", &state, &config("1")).await;
        assert_eq!(same.planned, state);

        let changed = plan(&provider, "local_id", &state, &config("2")).await;
        assert_eq!(changed.requires_replace, vec![vec![PathStep::Attr("keepers".to_string())]]);
    }

    #[tokio::test]
    async fn cancelled_apply_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("never");
        let provider = LocalProvider::new();
        let config = file_config(path.to_str().unwrap(), "x");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let response = provider
            .apply_resource_change(ApplyResourceChangeRequest {
                type_name: "local_file".to_string(),
                prior: Value::Null,
                planned: config.clone(),
                config,
                cancel,
            })
            .await;
        assert!(response.error.is_some());
        assert_eq!(response.new_state, Value::Null);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn validation() {
        let provider = LocalProvider::new();
        let bad = Value::object([("file_permission", Value::from("rwx"))]);
        assert!(provider.validate_resource_config("local_file", &bad).await.is_err());
        let bad = Value::object([("byte_length", Value::from(0))]);
        assert!(provider.validate_resource_config("local_id", &bad).await.is_err());
        assert!(provider
            .validate_resource_config("local_nothing", &Value::Null)
            .await
            .is_err());
    }
}
