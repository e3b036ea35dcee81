//! Compose a release's values references

use console::style;

use crate::context::Context;
use crate::error::{CliError, Result};

pub async fn run(ctx: &Context, release: &str, refs: &[String], record: bool) -> Result<()> {
    if refs.is_empty() {
        return Err(CliError::input("at least one --ref is required"));
    }

    let composer = ctx.composer();
    let composed = if record {
        composer.compose(release, refs).await?
    } else {
        composer.preview(refs).await?
    };

    for missing in &composed.missing_roots {
        eprintln!("{} values reference '{}' not found, skipped", style("warning:").yellow().bold(), missing);
    }
    for overflow in &composed.overflows {
        eprintln!(
            "{} dropped '{}' under '{}': {} ({})",
            style("warning:").yellow().bold(),
            overflow.reference,
            overflow.parent,
            overflow.kind,
            overflow.path.join(" -> ")
        );
    }

    print!("{}", composed.values.to_yaml()?);
    Ok(())
}
