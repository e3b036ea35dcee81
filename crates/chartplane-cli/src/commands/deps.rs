//! Resolve and print a package's dependency tree

use chartplane_repo::ReleaseRequest;
use console::style;

use crate::context::Context;
use crate::error::Result;

pub async fn run(
    ctx: &Context,
    registry: &str,
    package: &str,
    constraint: &str,
    release: Option<&str>,
    refs: &[String],
) -> Result<()> {
    let mut request = ReleaseRequest::new(release.unwrap_or(package), registry, package, constraint)
        .with_namespace(&ctx.config.namespace);
    if release.is_none() {
        request = request.without_recording();
    }
    for name in refs {
        request = request.with_ref(name);
    }

    let prepared = ctx.planner()?.plan(&request).await?;
    println!("{}", prepared.report.render_tree());

    let errors = prepared.report.condition_errors();
    if !errors.is_empty() {
        eprintln!();
        eprintln!(
            "{} {} dependency condition(s) could not be evaluated",
            style("warning:").yellow().bold(),
            errors.len()
        );
    }
    Ok(())
}
