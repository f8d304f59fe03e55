use crate::{application, options::Options, render};
use anyhow::{Context as _, Result};
use grove::hooks::{StatePersister, UiHook};
use grove_core::plans::Plan;
use grove_resource::state::StateFile;
use std::{path::PathBuf, sync::Arc};

#[derive(clap::Parser, Debug)]
pub(crate) struct Args {
    /// A plan file written by `grove plan --out`
    plan: PathBuf,
}

/// Run the `apply` command.
pub(crate) fn apply(options: &Options, args: &Args) -> Result<()> {
    let _logging = application::set_up_logging(options)?;
    let text = std::fs::read_to_string(&args.plan)
        .with_context(|| format!("Could not read plan file {}", args.plan.display()))?;
    let plan = Plan::from_json_str(&text).with_context(|| format!("Could not load plan file {}", args.plan.display()))?;
    let (file, state) = StateFile::open_or_create(&options.state)?;

    let (context, interrupt_state) = application::context(options)?;
    let context = context
        .with_hook(Arc::new(UiHook))
        .with_hook(Arc::new(StatePersister::new(file)));
    let result = application::runtime()?.block_on(context.apply(&plan, &state));

    interrupt_state.check_interrupted()?;
    result.diagnostics.into_result()?;
    let (add, change, destroy) = render::counts(&plan);
    eprintln!(
        "Apply complete! Resources: {} added, {} changed, {} destroyed.",
        add, change, destroy
    );
    for (name, output) in result.state.module(&Default::default()).iter().flat_map(|m| m.outputs.iter()) {
        if output.sensitive {
            println!("{} = (sensitive value)", name);
        } else {
            println!("{} = {}", name, output.value);
        }
    }
    Ok(())
}
