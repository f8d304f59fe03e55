use clap::{ColorChoice, Parser};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
pub struct Options {
    #[arg(short, long, global = true, default_value = "false")]
    pub verbose: bool,

    #[arg(long, global = true, default_value_t = ColorChoice::Auto)]
    pub color: ColorChoice,

    /// How many resource operations may run at the same time
    #[arg(long, global = true, default_value_t = grove::context::DEFAULT_PARALLELISM)]
    pub parallelism: usize,

    /// The state file to read and update
    #[arg(long, global = true, default_value = "grove.state")]
    pub state: PathBuf,
}

impl Options {
    pub fn use_color(&self) -> bool {
        match self.color {
            ColorChoice::Always => true,
            ColorChoice::Never => false,
            ColorChoice::Auto => std::io::IsTerminal::is_terminal(&std::io::stderr()),
        }
    }
}
