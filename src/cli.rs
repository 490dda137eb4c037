use std::{path::PathBuf, sync::OnceLock};

use clap::Parser;

use crate::source::SourceKind;

/// Forwards container logs to a Fluentd collector.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Route to forward to, e.g. `fluentd://127.0.0.1:24224` or
    /// `fluentd-forwarder+unix:///var/run/fluentd.sock`.
    pub route: String,

    /// Where log records come from.
    #[arg(short, long, value_enum, default_value_t = SourceKind::Docker)]
    pub source: SourceKind,

    /// Optional file with `KEY=value` settings, loaded before the environment is read.
    #[arg(short, long)]
    pub env_file: Option<PathBuf>,
}

static ARGS: OnceLock<Args> = OnceLock::new();

pub fn get_cli_args() -> &'static Args {
    ARGS.get_or_init(Args::parse)
}
