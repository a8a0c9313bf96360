//! Driver CLI surface. The three internal re-entry
//! subcommands are real `clap` subcommands so the same binary's argv
//! parsing handles them, but `hide = true` keeps them out of `--help`: they
//! are not part of the public contract, only this binary's own
//! self-invocation protocol.

use clap::{Args, Parser, Subcommand};

use crate::cgroup::Quotas;

#[derive(Parser)]
#[command(name = "gocker", about = "A minimal Linux container runtime")]
pub struct Cli {
    #[command(subcommand)]
    pub command: GockerCommand,
}

#[derive(Subcommand)]
pub enum GockerCommand {
    /// Launch a container from an image reference.
    Run(RunArgs),
    /// Run a command inside a live container.
    Exec(ExecArgs),
    /// List running containers.
    Ps,
    /// List locally stored images.
    Images,
    /// Delete a local image by ID.
    Rmi(RmiArgs),
    #[command(hide = true, name = "child-mode")]
    ChildMode(ChildModeArgs),
    #[command(hide = true, name = "setup-netns")]
    SetupNetns(ContainerIdArg),
    #[command(hide = true, name = "setup-veth")]
    SetupVeth(ContainerIdArg),
}

#[derive(Args)]
pub struct QuotaArgs {
    #[arg(long)]
    pub mem: Option<i64>,
    #[arg(long)]
    pub swap: Option<i64>,
    #[arg(long)]
    pub pids: Option<i64>,
    #[arg(long)]
    pub cpus: Option<f64>,
}

impl From<QuotaArgs> for Quotas {
    fn from(q: QuotaArgs) -> Self {
        Quotas {
            mem_mib: q.mem,
            swap_mib: q.swap,
            pids: q.pids,
            cpus: q.cpus,
        }
    }
}

#[derive(Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub quotas: QuotaArgs,
    pub image: String,
    #[arg(trailing_var_arg = true, required = true, num_args = 1..)]
    pub command: Vec<String>,
}

#[derive(Args)]
pub struct ExecArgs {
    pub container_id: String,
    #[arg(trailing_var_arg = true, required = true, num_args = 1..)]
    pub command: Vec<String>,
}

#[derive(Args)]
pub struct RmiArgs {
    pub image_id: String,
}

#[derive(Args)]
pub struct ContainerIdArg {
    pub container_id: String,
}

#[derive(Args)]
pub struct ChildModeArgs {
    #[command(flatten)]
    pub quotas: QuotaArgs,
    #[arg(long = "img")]
    pub img: String,
    pub container_id: String,
    #[arg(trailing_var_arg = true, required = true, num_args = 1..)]
    pub command: Vec<String>,
}
