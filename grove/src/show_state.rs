use crate::{application, options::Options};
use anyhow::Result;

#[derive(clap::Parser, Debug)]
pub(crate) struct Args {
    /// Print the state document as JSON rather than a list of objects
    #[arg(long, default_value_t = false)]
    json: bool,
}

/// Run the `show-state` command.
pub(crate) fn show_state(options: &Options, args: &Args) -> Result<()> {
    let state = application::current_state(&options.state)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&state.to_json()?)?);
        return Ok(());
    }
    println!("# lineage {}, serial {}", state.lineage, state.serial);
    for (addr, instance) in state.all_instances() {
        if let Some(current) = &instance.current {
            println!("{} ({:?})", addr, current.status);
        }
        for key in instance.deposed.keys() {
            println!("{} (deposed object {})", addr, key);
        }
    }
    for (module, ms) in &state.modules {
        for (name, output) in &ms.outputs {
            let shown = if output.sensitive {
                "(sensitive value)".to_string()
            } else {
                output.value.to_string()
            };
            println!("{} = {}", grove::config::output_display(module, name), shown);
        }
    }
    Ok(())
}
