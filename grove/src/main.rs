mod application;
mod apply;
mod logging;
mod options;
mod plan;
mod refresh;
mod render;
mod show_state;
mod validate;

use anyhow::Result;
use application::handle_result;
use clap::{CommandFactory as _, Parser, Subcommand};
use options::Options;

fn main() {
    let args = Args::parse();
    handle_result(run_args(args));
}

fn run_args(args: Args) -> Result<()> {
    match &args.command {
        Commands::Validate(subargs) => validate::validate(&args.options, subargs),
        Commands::Plan(subargs) => plan::plan(&args.options, subargs),
        Commands::Apply(subargs) => apply::apply(&args.options, subargs),
        Commands::Refresh(subargs) => refresh::refresh(&args.options, subargs),
        Commands::ShowState(subargs) => show_state::show_state(&args.options, subargs),
        Commands::GenerateMan => (|| {
            let cmd = Args::command();
            let man = clap_mangen::Man::new(cmd);
            let mut buffer: Vec<u8> = Default::default();
            man.render(&mut buffer)?;
            println!("{}", String::from_utf8(buffer)?);
            Ok(())
        })(),
        Commands::GenerateMarkdown => {
            let opts = clap_markdown::MarkdownOptions::new().show_footer(false);
            let markdown: String = clap_markdown::help_markdown_custom::<Args>(&opts);
            println!("{}", markdown);
            Ok(())
        }
        Commands::GenerateCompletion { shell } => {
            let mut cmd = Args::command();
            clap_complete::generate(*shell, &mut cmd, "grove", &mut std::io::stdout());
            Ok(())
        }
    }
}

/// Grove: plan and apply changes to declaratively configured resources
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    options: Options,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check the configuration without contacting any resources
    #[command()]
    Validate(validate::Args),

    /// Show the changes needed to bring the resources in line with the configuration
    #[command()]
    Plan(plan::Args),

    /// Carry out a plan created by `grove plan --out`
    #[command()]
    Apply(apply::Args),

    /// Update the state from the real resources, without changing them
    #[command()]
    Refresh(refresh::Args),

    /// Print the current state
    #[command()]
    ShowState(show_state::Args),

    /// Generate markdown documentation for grove
    #[command(hide = true)]
    GenerateMarkdown,

    /// Generate a manpage for grove
    #[command(hide = true)]
    GenerateMan,

    /// Generate shell completion for grove
    #[command(hide = true)]
    GenerateCompletion {
        /// The shell to generate completion for
        #[arg(long)]
        shell: clap_complete::Shell,
    },
}
