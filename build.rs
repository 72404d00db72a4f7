//! Build script rendering the `stratus` manual pages.
//!
//! One page covers the top-level command and one page is written per
//! subcommand (`stratus-bootstrap.1`, `stratus-scale.1`, ...), all into the
//! build output directory.

use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use clap::CommandFactory;
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
#[expect(dead_code, reason = "the build script only renders the parser")]
mod cli;

fn render(command: clap::Command, title: &str, target: &Path) -> io::Result<()> {
    let mut buffer = Vec::new();
    Man::new(command).title(title).render(&mut buffer)?;
    fs::write(target, buffer)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut stdout = io::stdout();
    writeln!(stdout, "cargo:rerun-if-changed=build.rs")?;
    writeln!(stdout, "cargo:rerun-if-changed=src/cli/mod.rs")?;

    let out_dir = env::var_os("OUT_DIR")
        .map(PathBuf::from)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "OUT_DIR was not set"))?;

    let command = cli::Cli::command();
    for sub in command.get_subcommands() {
        let page = format!("stratus-{}", sub.get_name());
        let target = out_dir.join(format!("{page}.1"));
        render(sub.clone(), &page, &target)?;
    }
    render(command, "stratus", &out_dir.join("stratus.1"))?;

    Ok(())
}
