//! Command line surface. jailfs is a mount helper: one invocation, one
//! mount, held until a signal or the parent process goes away.

use std::path::PathBuf;

use clap::{CommandFactory, Parser};

use crate::Result;

pub mod mount;

#[derive(Parser, Debug)]
#[command(
    name = "jailfs",
    version,
    about = "Sandbox overlay filesystem with encrypted upper-layer storage"
)]
struct Cli {
    /// Mount options, comma separated key[=value] pairs (repeatable)
    #[arg(short = 'o', value_name = "OPTIONS")]
    options: Vec<String>,

    /// Stay in the foreground
    #[arg(short = 'f', long)]
    foreground: bool,

    /// Enable debug logging
    #[arg(short = 'd', long)]
    debug: bool,

    /// Mount target directory
    mountpoint: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    pub options: Vec<String>,
    pub foreground: bool,
    pub debug: bool,
    pub mountpoint: Option<PathBuf>,
}

/// Parse CLI arguments into internal representation.
pub fn parse_args<I, S>(args: I) -> Result<CliArgs>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let argv: Vec<String> = args.into_iter().map(Into::into).collect();
    let cli = Cli::parse_from(argv);
    Ok(CliArgs {
        options: cli.options,
        foreground: cli.foreground,
        debug: cli.debug,
        mountpoint: cli.mountpoint,
    })
}

pub fn dispatch(args: CliArgs) -> Result<()> {
    mount::execute(args)
}

/// Build the underlying clap `Command` (useful for help/usage contract tests).
pub fn clap_command() -> clap::Command {
    Cli::command()
}
