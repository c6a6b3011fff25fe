mod cli;
mod config;
mod download;
mod error;
mod game;
mod importer;
mod layout;
mod library;
mod logging;
mod metadata;
mod modpack;
mod update;

use std::process::ExitCode;

fn main() -> ExitCode {
    cli::run()
}
