// Purpose: Command-line front end: parse args, install logging, dispatch to `KpmClient`.
// Inputs/Outputs: Process args in; exit code out (0 ok, 1 on any error, 2 on usage errors).
// Invariants: Errors are printed once, here; library code never prints them itself.
// Gotchas: `run_cli` takes the full argv (program name first) so clap can render usage.

use std::path::PathBuf;
use std::sync::OnceLock;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::pkg::client::{KpmClient, PullOptions};
use crate::settings::Settings;

pub const LOG_ENV: &str = "KPM_LOG";

fn long_version() -> &'static str {
    static VERSION: OnceLock<String> = OnceLock::new();
    VERSION.get_or_init(|| match option_env!("KPM_GIT_COMMIT") {
        Some(commit) => format!("{} ({commit})", env!("CARGO_PKG_VERSION")),
        None => env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[derive(Debug, Parser)]
#[command(name = "kpm", version = long_version(), about = "KCL package manager")]
struct Cli {
    /// Skip TLS certificate verification for registries and git remotes
    #[arg(long, global = true)]
    insecure_skip_tls_verify: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create kcl.mod and kcl.mod.lock in a directory
    Init {
        /// Package name (defaults to the directory name)
        name: Option<String>,
        /// Package directory (default: current directory)
        #[arg(long, value_name = "DIR")]
        path: Option<PathBuf>,
    },
    /// Download a package from a git, OCI or local source
    Pull {
        /// Source, e.g. oci://ghcr.io/kcl-lang/helloworld?tag=0.1.0
        source: String,
        /// Directory the package is placed under (default: current directory)
        #[arg(long, value_name = "DIR")]
        path: Option<PathBuf>,
    },
    /// Resolve dependencies and move kcl.mod / kcl.mod.lock forward
    Update {
        /// Package directory (default: current directory)
        #[arg(long, value_name = "DIR")]
        path: Option<PathBuf>,
    },
    /// Print direct and transitive dependencies
    Graph {
        /// Package directory (default: current directory)
        #[arg(long, value_name = "DIR")]
        path: Option<PathBuf>,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn package_dir(path: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    match path {
        Some(p) => Ok(p),
        None => std::env::current_dir().context("resolve current directory"),
    }
}

fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let mut settings = Settings::load()?;
    if cli.insecure_skip_tls_verify {
        settings.set_insecure_skip_tls_verify(true);
    }
    let client = KpmClient::new(settings);

    match cli.command {
        Command::Init { name, path } => {
            let dir = package_dir(path)?;
            client.init(&dir, name.as_deref())?;
        }
        Command::Pull { source, path } => {
            let opts = PullOptions::from_source_url(&source)?.with_local_path(package_dir(path)?);
            client.pull(&opts)?;
        }
        Command::Update { path } => {
            let dir = package_dir(path)?;
            let kpkg = client.load_package(&dir)?;
            client.update(&kpkg)?;
        }
        Command::Graph { path } => {
            let dir = package_dir(path)?;
            let kpkg = client.load_package(&dir)?;
            print!("{}", client.graph(&kpkg));
        }
    }
    Ok(())
}

pub fn run_cli<I>(args: I) -> i32
where
    I: IntoIterator<Item = String>,
{
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(err) => {
            let code = if err.use_stderr() { 2 } else { 0 };
            let _ = err.print();
            return code;
        }
    };
    init_logging();
    match dispatch(cli) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("error: {err:#}");
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Cli, Command, run_cli};
    use clap::Parser;
    use std::path::PathBuf;

    fn argv(args: &[&str]) -> Vec<String> {
        std::iter::once("kpm")
            .chain(args.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn global_insecure_flag_is_accepted_after_the_subcommand() {
        let cli = Cli::try_parse_from(argv(&[
            "pull",
            "oci://ghcr.io/kcl-lang/helloworld",
            "--insecure-skip-tls-verify",
        ]))
        .expect("parse");
        assert!(cli.insecure_skip_tls_verify);
        match cli.command {
            Command::Pull { source, path } => {
                assert_eq!(source, "oci://ghcr.io/kcl-lang/helloworld");
                assert_eq!(path, None);
            }
            other => panic!("expected pull, got {other:?}"),
        }
    }

    #[test]
    fn update_takes_an_optional_package_dir() {
        let cli = Cli::try_parse_from(argv(&["update", "--path", "demo"])).expect("parse");
        assert!(matches!(
            cli.command,
            Command::Update { path: Some(p) } if p == PathBuf::from("demo")
        ));
    }

    #[test]
    fn usage_errors_exit_with_two() {
        assert_eq!(run_cli(argv(&["frobnicate"])), 2);
        assert_eq!(run_cli(argv(&[])), 2);
    }

    #[test]
    fn version_exits_cleanly() {
        assert_eq!(run_cli(argv(&["--version"])), 0);
    }
}
