//! Developer tasks for the mssql-connect workspace.
//!
//! ```bash
//! cargo xtask ci                 # fmt check, clippy, tests, docs
//! cargo xtask test -p tds-protocol
//! cargo xtask fuzz parse_feature_ack --max-time 300
//! ```

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use xshell::{Shell, cmd};

/// Targets under `fuzz/fuzz_targets`.
const FUZZ_TARGETS: [&str; 5] = [
    "parse_env_change",
    "parse_feature_ack",
    "parse_session_state",
    "parse_login_response",
    "connection_string",
];

#[derive(Parser)]
#[command(name = "xtask", about = "Developer tasks for mssql-connect")]
struct Cli {
    #[command(subcommand)]
    command: Task,
}

#[derive(Subcommand)]
enum Task {
    /// fmt check, clippy, tests and docs, stopping at the first failure
    Ci,
    /// Check formatting, or apply it with --fix
    Fmt {
        /// Rewrite files instead of checking
        #[arg(long)]
        fix: bool,
    },
    /// Lint every target with warnings denied
    Clippy,
    /// Run the test suites
    Test {
        /// Restrict to one package
        #[arg(short, long)]
        package: Option<String>,
    },
    /// Build the API docs with broken intra-doc links denied
    Doc {
        /// Open the docs afterwards
        #[arg(long)]
        open: bool,
    },
    /// Run one cargo-fuzz target on nightly
    Fuzz {
        /// Target name; see --list
        #[arg(default_value = FUZZ_TARGETS[0])]
        target: String,
        /// Stop after this many seconds
        #[arg(long, default_value_t = 60)]
        max_time: u64,
        /// Print the known targets and exit
        #[arg(long)]
        list: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let sh = Shell::new()?;
    sh.change_dir(env!("CARGO_MANIFEST_DIR"));
    sh.change_dir("..");

    match cli.command {
        Task::Ci => {
            fmt(&sh, false)?;
            clippy(&sh)?;
            test(&sh, None)?;
            doc(&sh, false)?;
            eprintln!("ci: all checks passed");
        }
        Task::Fmt { fix } => fmt(&sh, fix)?,
        Task::Clippy => clippy(&sh)?,
        Task::Test { package } => test(&sh, package.as_deref())?,
        Task::Doc { open } => doc(&sh, open)?,
        Task::Fuzz {
            target,
            max_time,
            list,
        } => {
            if list {
                FUZZ_TARGETS.iter().for_each(|t| println!("{t}"));
            } else {
                fuzz(&sh, &target, max_time)?;
            }
        }
    }
    Ok(())
}

fn fmt(sh: &Shell, fix: bool) -> Result<()> {
    let check = (!fix).then_some(["--", "--check"]).into_iter().flatten();
    cmd!(sh, "cargo fmt --all {check...}")
        .run()
        .context("formatting")
}

fn clippy(sh: &Shell) -> Result<()> {
    cmd!(
        sh,
        "cargo clippy --workspace --all-features --all-targets -- -D warnings"
    )
    .run()
    .context("clippy")
}

fn test(sh: &Shell, package: Option<&str>) -> Result<()> {
    let scope: Vec<&str> = match package {
        Some(name) => vec!["-p", name],
        None => vec!["--workspace"],
    };
    cmd!(sh, "cargo test {scope...} --all-features")
        .run()
        .context("tests")
}

fn doc(sh: &Shell, open: bool) -> Result<()> {
    let open = open.then_some("--open");
    cmd!(sh, "cargo doc --workspace --all-features --no-deps {open...}")
        .env("RUSTDOCFLAGS", "-D rustdoc::broken_intra_doc_links")
        .run()
        .context("docs")
}

fn fuzz(sh: &Shell, target: &str, max_time: u64) -> Result<()> {
    if !FUZZ_TARGETS.contains(&target) {
        bail!("unknown fuzz target `{target}`; known: {}", FUZZ_TARGETS.join(", "));
    }
    let max_time = max_time.to_string();
    cmd!(
        sh,
        "cargo +nightly fuzz run {target} -- -max_total_time={max_time}"
    )
    .run()
    .with_context(|| format!("fuzz target {target}"))
}
