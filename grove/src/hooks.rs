//! Observers of an operation's progress.

use anyhow::Result;
use grove_core::{
    addrs::{DeposedKey, ResourceInstanceAddr},
    plans::Action,
    states::State,
};
use grove_resource::state::StateFile;
use tokio::sync::Mutex;

/// Called around every provider side effect.
///
/// Hooks receive copies; nothing they do can change the operation's state.
/// A hook that fails makes the operation fail for the object in question.
#[async_trait::async_trait]
pub trait Hook: Send + Sync {
    async fn pre_apply(&self, _addr: &ResourceInstanceAddr, _deposed: Option<&DeposedKey>, _action: Action) -> Result<()> {
        Ok(())
    }

    async fn post_apply(
        &self,
        _addr: &ResourceInstanceAddr,
        _deposed: Option<&DeposedKey>,
        _action: Action,
        _error: Option<&str>,
    ) -> Result<()> {
        Ok(())
    }

    async fn pre_refresh(&self, _addr: &ResourceInstanceAddr) -> Result<()> {
        Ok(())
    }

    /// `gone` is set when the provider reported that the object no longer
    /// exists.
    async fn post_refresh(&self, _addr: &ResourceInstanceAddr, _gone: bool) -> Result<()> {
        Ok(())
    }

    /// Called with a snapshot after every change to the working state, in
    /// the order the changes were made.
    async fn post_state_update(&self, _state: &State) -> Result<()> {
        Ok(())
    }
}

/// Appends every state snapshot to a state file.
pub struct StatePersister {
    file: Mutex<StateFile>,
}

impl StatePersister {
    pub fn new(file: StateFile) -> Self {
        StatePersister { file: Mutex::new(file) }
    }

    pub fn into_inner(self) -> StateFile {
        self.file.into_inner()
    }
}

#[async_trait::async_trait]
impl Hook for StatePersister {
    async fn post_state_update(&self, state: &State) -> Result<()> {
        let mut file = self.file.lock().await;
        file.persist(state)?;
        Ok(())
    }
}

/// Prints a line per provider side effect to stderr.
#[derive(Debug, Default)]
pub struct UiHook;

fn object_display(addr: &ResourceInstanceAddr, deposed: Option<&DeposedKey>) -> String {
    match deposed {
        Some(key) => format!("{} (deposed object {})", addr, key),
        None => addr.to_string(),
    }
}

fn progressive(action: Action) -> &'static str {
    match action {
        Action::Create => "Creating",
        Action::Update => "Modifying",
        Action::Delete => "Destroying",
        Action::DeleteThenCreate | Action::CreateThenDelete => "Replacing",
        Action::Read => "Reading",
        Action::NoOp => "Checking",
    }
}

fn completed(action: Action) -> &'static str {
    match action {
        Action::Create => "Creation complete",
        Action::Update => "Modifications complete",
        Action::Delete => "Destruction complete",
        Action::DeleteThenCreate | Action::CreateThenDelete => "Replacement complete",
        Action::Read => "Read complete",
        Action::NoOp => "No changes",
    }
}

#[async_trait::async_trait]
impl Hook for UiHook {
    async fn pre_apply(&self, addr: &ResourceInstanceAddr, deposed: Option<&DeposedKey>, action: Action) -> Result<()> {
        eprintln!("{}: {}...", object_display(addr, deposed), progressive(action));
        Ok(())
    }

    async fn post_apply(
        &self,
        addr: &ResourceInstanceAddr,
        deposed: Option<&DeposedKey>,
        action: Action,
        error: Option<&str>,
    ) -> Result<()> {
        match error {
            Some(e) => eprintln!("{}: {} failed: {}", object_display(addr, deposed), progressive(action), e),
            None => eprintln!("{}: {}", object_display(addr, deposed), completed(action)),
        }
        Ok(())
    }

    async fn pre_refresh(&self, addr: &ResourceInstanceAddr) -> Result<()> {
        eprintln!("{}: Refreshing state...", addr);
        Ok(())
    }

    async fn post_refresh(&self, addr: &ResourceInstanceAddr, gone: bool) -> Result<()> {
        if gone {
            eprintln!("{}: Object no longer exists", addr);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grove_resource::state::read_state;

    #[tokio::test]
    async fn persister_appends_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grove.state");
        let mut state = State::new();
        let file = StateFile::create(&path, &state).unwrap();
        let persister = StatePersister::new(file);

        state.set_output(
            &grove_core::addrs::ModulePath::root(),
            "greeting",
            Some(grove_core::states::OutputValue {
                value: serde_json::json!("hello"),
                sensitive: false,
            }),
        );
        persister.post_state_update(&state).await.unwrap();
        assert_eq!(persister.into_inner().serial(), 1);

        let read = read_state(&path).unwrap();
        assert_eq!(read.serial, 1);
        assert_eq!(read.lineage, state.lineage);
        assert!(read.module(&Default::default()).unwrap().outputs.contains_key("greeting"));
    }
}
