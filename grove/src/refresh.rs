use crate::{application, options::Options};
use anyhow::Result;
use grove::{
    config::Config,
    hooks::{StatePersister, UiHook},
};
use grove_resource::state::StateFile;
use std::{path::PathBuf, sync::Arc};

#[derive(clap::Parser, Debug)]
pub(crate) struct Args {
    /// The configuration file
    #[arg(long, default_value = "grove.json")]
    config: PathBuf,
}

/// Run the `refresh` command.
pub(crate) fn refresh(options: &Options, args: &Args) -> Result<()> {
    let _logging = application::set_up_logging(options)?;
    let (config, _) = Config::load(&args.config)?;
    let (file, state) = StateFile::open_or_create(&options.state)?;

    let (context, interrupt_state) = application::context(options)?;
    let context = context
        .with_hook(Arc::new(UiHook))
        .with_hook(Arc::new(StatePersister::new(file)));
    let result = application::runtime()?.block_on(context.refresh(&config, state));

    interrupt_state.check_interrupted()?;
    result.diagnostics.into_result()?;
    eprintln!("Refreshed {} resource(s).", result.state.all_instances().count());
    Ok(())
}
