use crate::config::types::{
    default_probe_candidates, BindSpec, EchrootError, SessionConfig, SubstitutionSpec,
};
use crate::probe::probe_root;
use crate::session::{recover, ChrootSession, Host};
use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// What to set up around the root; shared by `enter` and `recover`
#[derive(Args, Debug)]
struct PlanArgs {
    /// Chroot target directory
    root: PathBuf,
    /// JSON session file; flags below are added on top of it
    #[arg(long)]
    config: Option<PathBuf>,
    /// Bind a host directory into the root: SOURCE=TARGET[:opt,opt]
    #[arg(long = "bind", value_name = "SPEC")]
    binds: Vec<String>,
    /// Substitute a file inside the root: SOURCE=DEST
    #[arg(long = "dup", value_name = "SPEC")]
    dups: Vec<String>,
    /// Seconds to wait for a busy root (default: wait indefinitely)
    #[arg(long)]
    timeout: Option<u64>,
    /// Directory for lock markers
    #[arg(long)]
    lock_dir: Option<PathBuf>,
}

impl PlanArgs {
    fn into_config(self) -> crate::config::types::Result<SessionConfig> {
        let mut config = match &self.config {
            Some(path) => SessionConfig::load_from_file(path)?,
            None => SessionConfig::default(),
        };
        config.root = self.root;

        for spec in &self.binds {
            config.binds.push(BindSpec::parse(spec)?);
        }
        for spec in &self.dups {
            config.substitutions.push(SubstitutionSpec::parse(spec)?);
        }
        if self.timeout.is_some() {
            config.lock.timeout_secs = self.timeout;
        }
        if self.lock_dir.is_some() {
            config.lock.lock_dir = self.lock_dir;
        }
        Ok(config)
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Set up the root, run a command inside it, tear everything down
    Enter {
        #[command(flatten)]
        plan: PlanArgs,
        /// Script run as `sh SCRIPT BINARY ROOT` when no local emulator is found
        #[arg(long)]
        fetch_script: Option<PathBuf>,
        /// Print the session report as JSON
        #[arg(long)]
        json: bool,
        /// Command to run inside the root (default: /bin/sh)
        #[arg(last = true)]
        command: Vec<String>,
    },
    /// Print the architecture of a root
    Probe {
        root: PathBuf,
        /// Executable inside the root to probe (repeatable, tried in order)
        #[arg(long = "candidate")]
        candidates: Vec<PathBuf>,
    },
    /// Undo what a killed session left behind
    Recover {
        #[command(flatten)]
        plan: PlanArgs,
        /// Print the teardown report as JSON
        #[arg(long)]
        json: bool,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn fail(err: EchrootError) -> ! {
    eprintln!("Error: {}", err);
    std::process::exit(err.exit_code());
}

pub fn run() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Enter {
            plan,
            fetch_script,
            json,
            command,
        } => {
            let mut config = plan.into_config().unwrap_or_else(|e| fail(e));
            if !command.is_empty() {
                config.command = command;
            }
            if fetch_script.is_some() {
                config.emulator.fetch_script = fetch_script;
            }

            if !nix::unistd::geteuid().is_root() {
                eprintln!(
                    "Warning: mount, chroot and binfmt_misc registration need root privileges"
                );
            }

            let host = Host::system(&config);
            let mut session = ChrootSession::new(config, host);
            let result = session.run();
            if json {
                print_json(session.report())?;
            }

            match result {
                Ok(report) => {
                    for failure in report.teardown.failures() {
                        eprintln!("Warning: teardown step '{}' failed", failure.step);
                    }
                    std::process::exit(report.exit_code());
                }
                Err(e) => fail(e),
            }
        }
        Commands::Probe { root, candidates } => {
            let candidates = if candidates.is_empty() {
                default_probe_candidates()
            } else {
                candidates
            };
            match probe_root(&root, &candidates) {
                Some((path, arch)) => {
                    println!("{} ({})", arch, path.display());
                    Ok(())
                }
                None => fail(EchrootError::ArchitectureUnresolved { root, candidates }),
            }
        }
        Commands::Recover { plan, json } => {
            let config = plan.into_config().unwrap_or_else(|e| fail(e));
            let host = Host::system(&config);
            let report = recover(&config, &host).unwrap_or_else(|e| fail(e));

            if json {
                print_json(&report)?;
            } else {
                for step in &report.steps {
                    println!("{}: {:?}", step.step, step.outcome);
                }
            }
            if !report.is_clean() {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}
