//! Plan and apply against the real local provider, persisting the state.

use grove::{
    config::Config,
    context::{Context, PlanOptions},
    hooks::StatePersister,
    providers::Providers,
};
use grove_resource::state::{read_state, StateFile};
use grove_resources_local::LocalProvider;
use serde_json::json;
use std::sync::Arc;

fn context(file: StateFile) -> Context {
    Context::new(Providers::new().with("local", Arc::new(LocalProvider::new())))
        .with_hook(Arc::new(StatePersister::new(file)))
}

#[tokio::test]
async fn files_are_created_and_destroyed() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("grove.state");
    let target = dir.path().join("hello.txt");
    let json = json!({
        "resources": [
            {"type": "local_id", "name": "tag"},
            {
                "type": "local_file",
                "name": "hello",
                "config": {
                    "filename": target.to_str().unwrap(),
                    "content": {"$ref": "local_id.tag.hex"},
                },
            },
        ],
        "outputs": {"file_id": {"value": {"$ref": "local_file.hello.id"}}},
    });
    let config = Config::from_json(json.clone()).unwrap();

    let (file, state) = StateFile::open_or_create(&state_path).unwrap();
    let ctx = context(file);
    let planned = ctx.plan(&config, json.clone(), state.clone(), &PlanOptions::default()).await;
    assert!(planned.diagnostics.is_empty(), "{}", planned.diagnostics);
    assert_eq!(planned.plan.changes.len(), 2);

    let applied = ctx.apply(&planned.plan, &state).await;
    assert!(applied.diagnostics.is_empty(), "{}", applied.diagnostics);
    let persisted = read_state(&state_path).unwrap();
    let tag = persisted.current_object(&"local_id.tag".parse().unwrap()).unwrap();
    let hex = tag.attributes["hex"].as_str().unwrap().to_string();
    assert_eq!(std::fs::read_to_string(&target).unwrap(), hex);
    assert!(persisted.module(&Default::default()).unwrap().outputs.contains_key("file_id"));
    drop(ctx);

    let (file, state) = StateFile::open(&state_path).unwrap();
    let ctx = context(file);
    let options = PlanOptions {
        destroy: true,
        ..Default::default()
    };
    let planned = ctx.plan(&config, json, state.clone(), &options).await;
    assert!(planned.diagnostics.is_empty(), "{}", planned.diagnostics);
    let destroyed = ctx.apply(&planned.plan, &state).await;
    assert!(destroyed.diagnostics.is_empty(), "{}", destroyed.diagnostics);
    assert!(!target.exists());
    assert!(read_state(&state_path).unwrap().is_empty());
}
