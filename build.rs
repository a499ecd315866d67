//! Renders the `hoist` manual pages into `OUT_DIR`.
//!
//! Besides `hoist.1`, each subcommand gets its own `hoist-<subcommand>.1`
//! page so `man hoist-reconcile` works once the pages are installed.

use std::env;
use std::error::Error;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use clap::{Command, CommandFactory};
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
mod cli;

const BIN_NAME: &str = env!("CARGO_PKG_NAME");

fn main() -> Result<(), Box<dyn Error>> {
    for watched in ["build.rs", "src/cli/mod.rs"] {
        writeln!(io::stdout(), "cargo:rerun-if-changed={watched}")?;
    }
    let out_dir = env::var_os("OUT_DIR")
        .map(PathBuf::from)
        .ok_or("OUT_DIR is not set for the build script")?;

    let root = cli::Cli::command()
        .name(BIN_NAME)
        .version(env!("CARGO_PKG_VERSION"));
    for sub in root.get_subcommands() {
        let page = format!("{BIN_NAME}-{}", sub.get_name());
        write_page(&out_dir, &page, sub.clone().name(page.clone()))?;
    }
    write_page(&out_dir, BIN_NAME, root)
}

fn write_page(out_dir: &Path, page: &str, command: Command) -> Result<(), Box<dyn Error>> {
    let mut rendered = Vec::new();
    Man::new(command).render(&mut rendered)?;
    fs::write(out_dir.join(format!("{page}.1")), rendered)?;
    Ok(())
}
