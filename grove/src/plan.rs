use crate::{application, options::Options, render};
use anyhow::{Context as _, Result};
use grove::{config::Config, context::PlanOptions};
use grove_core::addrs::Target;
use grove_resource::state::StateFile;
use std::path::PathBuf;

#[derive(clap::Parser, Debug)]
pub(crate) struct Args {
    /// The configuration file
    #[arg(long, default_value = "grove.json")]
    config: PathBuf,

    /// Limit planning to these resources or instances and what they depend on
    #[arg(long = "target", value_name = "ADDRESS")]
    targets: Vec<Target>,

    /// Plan to destroy all resources in the state
    #[arg(long, default_value_t = false)]
    destroy: bool,

    /// Skip reading the current state of the resources before planning
    #[arg(long, default_value_t = false)]
    no_refresh: bool,

    /// Write the plan to this file, for `grove apply`
    #[arg(long)]
    out: Option<PathBuf>,
}

/// Run the `plan` command.
pub(crate) fn plan(options: &Options, args: &Args) -> Result<()> {
    let _logging = application::set_up_logging(options)?;
    let (config, config_json) = Config::load(&args.config)?;
    // The plan records the lineage of the state it was made for, so the state
    // file must exist before planning.
    let (_, state) = StateFile::open_or_create(&options.state)?;
    let (context, interrupt_state) = application::context(options)?;
    let plan_options = PlanOptions {
        targets: args.targets.clone(),
        destroy: args.destroy,
        refresh: !args.no_refresh,
        parallelism: options.parallelism,
    };

    let result = application::runtime()?.block_on(context.plan(&config, config_json, state, &plan_options));
    interrupt_state.check_interrupted()?;
    result.diagnostics.into_result()?;

    print!("{}", render::plan(&result.plan));
    if !args.targets.is_empty() {
        eprintln!("Note: the plan is limited to the targeted resources and may be incomplete.");
    }
    if let Some(out) = &args.out {
        let text = result.plan.to_json_string()?;
        std::fs::write(out, text).with_context(|| format!("Could not write plan to {}", out.display()))?;
        eprintln!("Saved the plan to {}. Run `grove apply {}` to carry it out.", out.display(), out.display());
    }
    Ok(())
}
