//! Defines `catnipd`'s CLI surface through clap types.

mod serve;

use std::str::FromStr;

use clap::Parser;
use thiserror::Error;

pub use self::serve::ServeCommand;

/// Command line options that `catnipd` accepts.
#[derive(Debug, Parser)]
#[clap(name = "catnipd", version, about)]
pub struct Options {
    #[clap(flatten)]
    pub global: GlobalOptions,

    /// Subcommand to run in this invocation; defaults to `serve`.
    #[clap(subcommand)]
    pub subcommand: Option<Subcommand>,
}

impl Options {
    pub fn run(self) -> anyhow::Result<()> {
        match self.subcommand.unwrap_or(Subcommand::Serve(ServeCommand::default())) {
            Subcommand::Serve(subcommand) => subcommand.run_with_global(self.global),
            Subcommand::Version => {
                println!("catnipd {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }

    pub fn command_name(&self) -> &'static str {
        match &self.subcommand {
            Some(Subcommand::Version) => "version",
            _ => "serve",
        }
    }
}

#[derive(Debug, Parser)]
pub struct GlobalOptions {
    /// Sets verbosity level. Can be specified multiple times.
    #[clap(long("verbose"), short, global(true), action = clap::ArgAction::Count)]
    pub verbosity: u8,

    /// Set color behavior. Valid values are auto, always, and never.
    #[clap(long("color"), global(true), default_value("auto"))]
    pub color: ColorChoice,
}

#[derive(Debug, Clone, Copy)]
pub enum ColorChoice {
    Auto,
    Always,
    Never,
}

impl FromStr for ColorChoice {
    type Err = ColorChoiceParseError;

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        match source {
            "auto" => Ok(ColorChoice::Auto),
            "always" => Ok(ColorChoice::Always),
            "never" => Ok(ColorChoice::Never),
            _ => Err(ColorChoiceParseError {
                attempted: source.to_owned(),
            }),
        }
    }
}

#[derive(Debug, Error)]
#[error("invalid color choice '{attempted}'. Valid values are: auto, always, never")]
pub struct ColorChoiceParseError {
    attempted: String,
}

#[derive(Debug, Parser)]
pub enum Subcommand {
    Serve(ServeCommand),
    /// Print the daemon version and exit.
    Version,
}
