//! Interface de linha de comando do `relaunch` baseada em clap.
//!
//! Define a struct [`Cli`] com as flags --config, --bind e --verbose.

use std::path::PathBuf;

use clap::Parser;

use crate::config::DEFAULT_CONFIG_FILE;

/// Fila de jobs em segundo plano que se relança sozinha, servida por HTTP.
#[derive(Debug, Parser)]
#[command(name = "relaunch", version, about)]
pub struct Cli {
    /// Arquivo de configuração.
    #[arg(long, short, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Endereço de escuta, sobrepondo a configuração.
    #[arg(long)]
    pub bind: Option<String>,

    /// Ativa logs de depuração.
    #[arg(long, short, default_value_t = false)]
    pub verbose: bool,
}
