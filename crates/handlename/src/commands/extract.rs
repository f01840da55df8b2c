use std::io::Read;
use std::path::Path;
use std::process::ExitCode;

use anyhow::Context;
use handlename_core::extract::extract_with_source;

pub fn run(file: Option<&Path>) -> anyhow::Result<ExitCode> {
    let html = match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("failed to read stdin")?;
            buf
        }
    };

    match extract_with_source(&html) {
        Some((name, source)) => {
            tracing::debug!(?source, "display name extracted");
            println!("{name}");
            Ok(ExitCode::SUCCESS)
        }
        None => {
            eprintln!("no display name found");
            Ok(ExitCode::FAILURE)
        }
    }
}
