use crate::logging;
use crate::options::Options;
use anyhow::{Context as _, Result};
use grove::{
    context::Context,
    interrupt::{self, InterruptState},
    providers::Providers,
};
use grove_core::states::State;
use grove_resource::state::read_state;
use grove_resources_local::LocalProvider;
use std::{path::Path, process::exit, sync::Arc};

/// Create the single-threaded tokio runtime used by the CLI.
pub fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to initialize tokio runtime")
}

/// Handle a Result, printing the error and exiting with code 1 on failure.
pub fn handle_result(r: Result<()>) {
    match r {
        Ok(()) => {}
        Err(e) => {
            eprintln!("grove error: {:?}", e);
            exit(1);
        }
    }
}

pub fn set_up_logging(options: &Options) -> Result<Box<dyn logging::Frontend>> {
    logging::set_up(logging::Options {
        verbose: options.verbose,
        color: options.use_color(),
    })
}

/// The providers built into the binary.
pub fn providers() -> Providers {
    Providers::new().with("local", Arc::new(LocalProvider::new()))
}

/// A [`Context`] with the built-in providers and Ctrl-C handling.
pub fn context(options: &Options) -> Result<(Context, InterruptState)> {
    let interrupt_state = interrupt::set_up_process_interrupt_handler()?;
    let context = Context::new(providers())
        .with_interrupt(interrupt_state.clone())
        .with_parallelism(options.parallelism);
    Ok((context, interrupt_state))
}

/// The current state, or an empty one if there is no state file yet.
pub fn current_state(path: &Path) -> Result<State> {
    if path.exists() {
        read_state(path)
    } else {
        Ok(State::new())
    }
}
