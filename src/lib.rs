use thiserror::Error;

pub mod cli;
pub mod config;
pub mod crypto;
pub mod fs;
pub mod gate;
pub mod idmap;
pub mod logging;
pub mod profile;

pub type Result<T> = anyhow::Result<T>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("no mountpoint specified")]
    MissingMountpoint,
    #[error("lowerdir is required")]
    MissingLowerDir,
    #[error("workdir not specified")]
    MissingWorkDir,
    #[error("only redirect_dir=off is supported, got {0}")]
    RedirectDirUnsupported(String),
    #[error("invalid mount option: {0}")]
    InvalidMountOption(String),
    #[error("invalid mapping specified: {0}")]
    InvalidMapping(String),
    #[error("invalid value for xattr_permissions: {0}")]
    InvalidXattrPermissions(u32),
    #[error("cannot open layer directory: {0}")]
    InvalidLayerDir(String),
    #[error("parent process is init; refusing to start")]
    ParentIsInit,
    #[error("serialization error")]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("cli error: {0}")]
    Cli(String),
}

/// Entry point for the library, called by the CLI thin wrapper.
pub fn run<I, S>(args: I) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let cli_args = cli::parse_args(args.into_iter().map(Into::into))?;

    logging::init_logging(logging::LoggingConfig {
        format: logging::LogFormat::Human,
        sink: logging::LogSink::Console,
        debug: cli_args.debug,
    })?;

    cli::dispatch(cli_args)
}
