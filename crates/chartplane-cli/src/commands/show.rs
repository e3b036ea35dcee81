//! Show a stored package version

use chartplane_repo::{IndexCache, RepoError, resolve_entries};
use console::style;

use crate::context::Context;
use crate::error::Result;

pub async fn run(ctx: &Context, registry: &str, package: &str, version: &str, show_values: bool) -> Result<()> {
    let registry = ctx.catalog.require(registry)?;
    let source = ctx.source()?;

    let entries = source.entries(registry, package, &mut IndexCache::new()).await?;
    let entry = resolve_entries(&entries, version)?.ok_or_else(|| RepoError::VersionNotFound {
        name: package.to_string(),
        constraint: version.to_string(),
        registry: registry.name.clone(),
    })?;
    let loaded = source.load(registry, entry).await?;
    let meta = &loaded.metadata;

    println!("{}", style(&meta.name).cyan().bold());
    println!("{}", style("=".repeat(meta.name.len())).dim());
    println!();
    println!("{}: {}", style("Version").bold(), meta.version);
    println!("{}: {}", style("Registry").bold(), loaded.registry);
    if let Some(desc) = &meta.description {
        println!("{}: {}", style("Description").bold(), desc);
    }
    if let Some(app_version) = &meta.app_version {
        println!("{}: {}", style("App Version").bold(), app_version);
    }
    if let Some(url) = &loaded.download_url {
        println!("{}: {}", style("Source").bold(), url);
    }

    if !meta.dependencies.is_empty() {
        println!();
        println!("{}:", style("Dependencies").bold());
        for dep in &meta.dependencies {
            let alias = dep
                .alias
                .as_ref()
                .map(|a| format!(" (alias: {a})"))
                .unwrap_or_default();
            println!("  - {} @ {}{}", dep.name, dep.version, alias);
            if let Some(condition) = &dep.condition {
                println!("    condition: {condition}");
            }
        }
    }

    println!();
    println!("{}:", style("Templates").bold());
    for file in &loaded.templates {
        println!("  - {}", file.name);
    }
    if !loaded.schema_defs.is_empty() {
        println!("{}:", style("Schema definitions").bold());
        for file in &loaded.schema_defs {
            println!("  - {}", file.name);
        }
    }

    if show_values {
        println!();
        println!("{}:", style("Default values").bold());
        print!("{}", loaded.default_values.to_yaml()?);
    }
    Ok(())
}
