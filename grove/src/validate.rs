use crate::{application, options::Options};
use anyhow::Result;
use grove::{config::Config, context::Context};
use std::path::PathBuf;

#[derive(clap::Parser, Debug)]
pub(crate) struct Args {
    /// The configuration file
    #[arg(long, default_value = "grove.json")]
    config: PathBuf,
}

/// Run the `validate` command.
pub(crate) fn validate(options: &Options, args: &Args) -> Result<()> {
    let _logging = application::set_up_logging(options)?;
    let (config, _) = Config::load(&args.config)?;
    let context = Context::new(application::providers());
    let diagnostics = application::runtime()?.block_on(context.validate(&config));
    diagnostics.into_result()?;
    eprintln!("The configuration is valid.");
    Ok(())
}
