use anyhow::Context;
use tokio_util::sync::CancellationToken;

/// Whether the operator asked to stop. Walks stop starting new work once
/// this is set, and providers receive the token to abort long requests.
#[derive(Clone, Debug, Default)]
pub struct InterruptState {
    token: CancellationToken,
}

#[derive(Clone, Debug, thiserror::Error)]
#[error("interrupted")]
pub struct InterruptedError {}

impl InterruptState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_interrupted(&self) {
        self.token.cancel();
    }

    pub fn is_interrupted(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn check_interrupted_raw(&self) -> Result<(), InterruptedError> {
        if self.is_interrupted() {
            Err(InterruptedError {})
        } else {
            Ok(())
        }
    }

    pub fn check_interrupted(&self) -> anyhow::Result<()> {
        self.check_interrupted_raw().map_err(|x| x.into())
    }
}

fn set_process_interrupt_handler(interrupted: &InterruptState) -> anyhow::Result<()> {
    let interrupted = interrupted.clone();
    ctrlc::set_handler(move || {
        if interrupted.is_interrupted() {
            eprintln!("Interrupted again; exiting without waiting for running operations");
            std::process::exit(130);
        }
        eprintln!("Interrupt received; waiting for running operations to finish");
        interrupted.set_interrupted();
    })
    .context("Error setting interrupt handler")
}

pub fn set_up_process_interrupt_handler() -> anyhow::Result<InterruptState> {
    let interrupt_state = InterruptState::new();
    set_process_interrupt_handler(&interrupt_state)?;
    Ok(interrupt_state)
}
