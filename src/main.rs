//! bootc-devvm: boot bootc disk images in short-lived local VMs.
//!
//! A thin CLI over [`bootc_devvm::vm::Orchestrator`]. Ctrl-C cancels any
//! in-flight wait; the VM itself is left running.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use bootc_devvm::config::{DevVmConfig, OrchestratorConfig};
use bootc_devvm::logging;
use bootc_devvm::paths::DevVmPaths;
use bootc_devvm::vm::hypervisor;
use bootc_devvm::vm::remote;
use bootc_devvm::vm::{Gvproxy, Orchestrator, RemovalPlan, StartRequest, VmStatus};

/// Local VM lifecycle for bootc disk images
#[derive(Parser, Debug)]
#[command(name = "bootc-devvm", version, about = "Boot bootc disk images in local VMs")]
struct Args {
    /// Log progress to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Show what would run without copying, spawning, or saving anything
    #[arg(long, global = true)]
    dry_run: bool,

    /// Config file (default: ~/.config/bootc-devvm/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a VM, provisioning it from a disk image on first use
    Start {
        name: String,
        /// Disk image produced by the convert stage
        #[arg(long)]
        disk: Option<PathBuf>,
        #[arg(long)]
        cpus: Option<u32>,
        /// Memory in MiB
        #[arg(long)]
        memory: Option<u32>,
        #[arg(long)]
        pipeline: Option<String>,
        #[arg(long)]
        pipeline_file: Option<PathBuf>,
        #[arg(long)]
        image_tag: Option<String>,
    },
    /// Stop a running VM
    Stop { name: String },
    /// Show the live status of one VM
    Status {
        name: String,
        #[arg(long)]
        json: bool,
    },
    /// List all known VMs
    List {
        #[arg(long)]
        json: bool,
    },
    /// Remove a VM and its disk copy
    Rm {
        name: String,
        /// Kill immediately and skip confirmation
        #[arg(short, long)]
        force: bool,
    },
    /// Open a shell (or run a command) in the guest
    Ssh {
        name: String,
        #[arg(last = true)]
        command: Vec<String>,
    },
    /// Run `bootc` in the guest
    Bootc {
        name: String,
        #[arg(last = true, required = true)]
        args: Vec<String>,
    },
    /// Forward an additional guest port to the host
    Expose {
        name: String,
        guest_port: u16,
        #[arg(long)]
        host_port: Option<u16>,
    },
    /// Print the guest console log
    Logs {
        name: String,
        /// Only the last N lines
        #[arg(long)]
        tail: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let paths = DevVmPaths::resolve().context("HOME is not set")?;
    let _log_guard = logging::init(args.verbose, Some(&paths.logs));
    paths
        .ensure()
        .with_context(|| format!("create state directories under {}", paths.data.display()))?;

    let config_path = args.config.clone().unwrap_or_else(|| paths.config_file());
    let config = DevVmConfig::load(&config_path)?;
    let config = OrchestratorConfig::from_config(config, args.dry_run);

    let orchestrator = Orchestrator::new(
        paths,
        config.clone(),
        hypervisor::detect(&config.binaries),
        Arc::new(Gvproxy::new(&config.binaries)),
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                debug!("interrupt received, cancelling waits");
                cancel.cancel();
            }
        });
    }

    match args.command {
        Command::Start {
            name,
            disk,
            cpus,
            memory,
            pipeline,
            pipeline_file,
            image_tag,
        } => {
            let req = StartRequest {
                name,
                source_disk: disk,
                cpus,
                memory_mb: memory,
                pipeline_name: pipeline,
                pipeline_file,
                image_tag,
            };
            let outcome = orchestrator.start(req, &cancel).await?;
            if !outcome.commands.is_empty() {
                println!("Would {} VM {}:", outcome.path, outcome.name);
                for cmd in &outcome.commands {
                    println!("  {cmd}");
                }
                return Ok(());
            }
            let c = &outcome.connection;
            println!(
                "VM {} {} ({}@{}:{})",
                outcome.name, outcome.path, c.user, c.host, c.port
            );
            for warning in &outcome.warnings {
                eprintln!("warning: {warning}");
            }
            if outcome.is_degraded() {
                eprintln!(
                    "VM is running but not fully ready; retry `bootc-devvm ssh {}` shortly",
                    outcome.name
                );
            }
        }
        Command::Stop { name } => {
            orchestrator.stop(&name, &cancel).await?;
            println!("VM {name} stopped");
        }
        Command::Status { name, json } => {
            let status = orchestrator.status(&name).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status);
            }
        }
        Command::List { json } => {
            let statuses = orchestrator.list().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&statuses)?);
            } else if statuses.is_empty() {
                println!("No VMs");
            } else {
                println!("{:<20} {:<8} {:<6} {:<4}", "NAME", "STATE", "PORT", "SSH");
                for s in &statuses {
                    println!(
                        "{:<20} {:<8} {:<6} {:<4}",
                        s.name,
                        s.state,
                        s.connection.port,
                        if s.ssh_reachable { "up" } else { "-" }
                    );
                }
            }
        }
        Command::Rm { name, force } => {
            let plan = orchestrator
                .remove(&name, force, &cancel, |plan| {
                    print_removal_plan(plan);
                    force || confirm()
                })
                .await?;
            println!("VM {} removed ({} files)", plan.name, plan.files.len());
            for path in &plan.kept {
                println!("kept {} (outside the VM directory)", path.display());
            }
        }
        Command::Ssh { name, command } => {
            let conn = orchestrator.connection_info(&name)?;
            let status = remote::run_remote(&remote::ssh_command(&conn, &command)).await?;
            std::process::exit(status.code().unwrap_or(1));
        }
        Command::Bootc { name, args } => {
            let conn = orchestrator.connection_info(&name)?;
            let status = remote::run_remote(&remote::bootc_command(&conn, &args)).await?;
            std::process::exit(status.code().unwrap_or(1));
        }
        Command::Expose {
            name,
            guest_port,
            host_port,
        } => {
            let port = orchestrator.expose(&name, guest_port, host_port).await?;
            println!("guest port {guest_port} -> localhost:{port}");
        }
        Command::Logs { name, tail } => {
            let path = orchestrator.console_log(&name)?;
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("read console log {}", path.display()))?;
            let lines: Vec<&str> = content.lines().collect();
            let start = tail.map_or(0, |n| lines.len().saturating_sub(n));
            for line in &lines[start..] {
                println!("{line}");
            }
        }
    }

    Ok(())
}

fn print_status(s: &VmStatus) {
    println!("Name:       {}", s.name);
    println!("State:      {}", s.state);
    if let Some(pid) = s.hypervisor_pid {
        println!("Hypervisor: pid {pid}");
    }
    match s.proxy_pid {
        Some(pid) => println!("Proxy:      pid {pid}"),
        None if s.running => println!("Proxy:      down (restart the VM)"),
        None => {}
    }
    let c = &s.connection;
    let reach = if s.ssh_reachable { "reachable" } else { "unreachable" };
    println!("SSH:        {}@{}:{} ({reach})", c.user, c.host, c.port);
    println!("Disk:       {}", s.disk_image_path.display());
}

/// Print the plan and ask for `y` on stdin.
fn print_removal_plan(plan: &RemovalPlan) {
    if plan.running {
        println!("VM {} is running and will be stopped.", plan.name);
    }
    println!("The following will be deleted:");
    for file in &plan.files {
        println!("  {}", file.display());
    }
    if !plan.kept.is_empty() {
        println!("Referenced but not deleted:");
        for file in &plan.kept {
            println!("  {}", file.display());
        }
    }
}

fn confirm() -> bool {
    print!("Continue? [y/N] ");
    let _ = std::io::stdout().flush();

    let mut answer = String::new();
    if std::io::stdin().lock().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim(), "y" | "Y" | "yes")
}
