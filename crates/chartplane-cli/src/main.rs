//! chartplane CLI - inspect and drive chart distribution on a cluster

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod context;
mod error;
mod exit_codes;

use context::Context;
use error::Result;

#[derive(Parser)]
#[command(name = "chartplane")]
#[command(author = "chartplane Contributors")]
#[command(version)]
#[command(about = "Chart distribution and values composition for Kubernetes", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Namespace holding chart content and values references
    #[arg(short, long, global = true, env = "CHARTPLANE_NAMESPACE")]
    namespace: Option<String>,

    /// Engine configuration file
    #[arg(long, global = true, env = "CHARTPLANE_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug output
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve a version constraint against a local index.yaml
    ResolveVersion {
        /// Index file
        index: PathBuf,

        /// Package name
        package: String,

        /// Version constraint (e.g. "^1.2", ">=2, <3")
        constraint: String,
    },

    /// Store a package archive or directory in a registry's content
    Push {
        /// Archive (.tgz) or unpacked package directory
        archive: PathBuf,

        /// Registry to store under
        #[arg(short, long)]
        registry: String,
    },

    /// Show a stored package version
    Show {
        registry: String,
        package: String,
        version: String,

        /// Also print default values
        #[arg(long)]
        values: bool,
    },

    /// Compose a release's values references and print the result
    Values {
        /// Release name, recorded on every visited reference
        release: String,

        /// Root values reference (repeatable, later roots win)
        #[arg(short = 'r', long = "ref")]
        refs: Vec<String>,

        /// Do not record the release on the composed references
        #[arg(long)]
        no_record: bool,
    },

    /// Resolve a package's dependencies and print the tree
    Deps {
        registry: String,
        package: String,

        /// Version constraint
        #[arg(default_value = "*")]
        constraint: String,

        /// Release whose values references gate the dependencies; recorded on
        /// the references when given
        #[arg(long)]
        release: Option<String>,

        /// Root values reference (repeatable)
        #[arg(short = 'r', long = "ref")]
        refs: Vec<String>,
    },
}

fn init_tracing(debug: bool) {
    let default = if debug { "chartplane=debug" } else { "chartplane=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let namespace = cli.namespace.as_deref();
    let config = cli.config.as_deref();

    match cli.command {
        Commands::ResolveVersion {
            index,
            package,
            constraint,
        } => commands::resolve_version::run(&index, &package, &constraint),

        Commands::Push { archive, registry } => {
            let ctx = Context::connect(config, namespace).await?;
            commands::push::run(&ctx, &archive, &registry).await
        }

        Commands::Show {
            registry,
            package,
            version,
            values,
        } => {
            let ctx = Context::connect(config, namespace).await?;
            commands::show::run(&ctx, &registry, &package, &version, values).await
        }

        Commands::Values {
            release,
            refs,
            no_record,
        } => {
            let ctx = Context::connect(config, namespace).await?;
            commands::values::run(&ctx, &release, &refs, !no_record).await
        }

        Commands::Deps {
            registry,
            package,
            constraint,
            release,
            refs,
        } => {
            let ctx = Context::connect(config, namespace).await?;
            commands::deps::run(&ctx, &registry, &package, &constraint, release.as_deref(), &refs)
                .await
        }
    }
}

#[tokio::main]
async fn main() {
    // Setup miette for nice error display
    miette::set_panic_hook();

    let cli = Cli::parse();
    init_tracing(cli.debug);

    if let Err(err) = run(cli).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}
