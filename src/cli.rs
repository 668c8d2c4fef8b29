//! Interface de linha de comando do Spectra baseada em clap.
//!
//! Define a struct [`Cli`] com os subcomandos [`Command`] (serve, generate)
//! e a flag global `--verbose`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Spectra: geração de Dockerfile, docker-compose e pipeline de CI.
#[derive(Debug, Parser)]
#[command(name = "spectra", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Habilita logs de depuração quando `RUST_LOG` não está definido.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Inicia o servidor HTTP.
    Serve {
        /// Endereço de escuta; sobrescreve `bind` do `spectra.toml`.
        #[arg(long)]
        bind: Option<String>,
    },

    /// Gera os artefatos para um contexto de projeto e imprime o JSON.
    Generate {
        /// Arquivo JSON com `stack` e `files`.
        #[arg(long)]
        file: PathBuf,
    },
}
