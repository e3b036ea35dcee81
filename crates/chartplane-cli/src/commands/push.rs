//! Push a package archive or directory into a registry's content

use chartplane_core::archive::load_dir;
use chartplane_core::{ArchiveLoader, PackageVersion, TarballLoader};
use console::style;
use std::path::Path;

use crate::context::Context;
use crate::error::Result;

/// Load a package from a `.tgz` archive or an unpacked directory
pub fn load_package(path: &Path) -> Result<PackageVersion> {
    if path.is_dir() {
        return Ok(load_dir(path)?);
    }
    let bytes = std::fs::read(path)?;
    Ok(TarballLoader.load(&bytes)?)
}

pub async fn run(ctx: &Context, archive: &Path, registry: &str) -> Result<()> {
    let registry = ctx.catalog.require(registry)?;
    let package = load_package(archive)?;
    let key = package.key();

    let summary = ctx.source()?.push(registry, package, None).await?;

    println!(
        "{} {} to {}",
        style("Pushed").green().bold(),
        style(&key).cyan(),
        registry.name
    );
    println!(
        "  {} created, {} updated, {} unchanged, {} removed",
        summary.created, summary.updated, summary.unchanged, summary.removed
    );
    for file in &summary.dropped {
        println!("  {} {} (nested too deep)", style("skipped").yellow(), file);
    }
    Ok(())
}
