//! Driver: top-level dispatch. Refuses to run unprivileged,
//! ensures the on-disk directory skeleton exists, then routes to the
//! component responsible for each command.

mod cgroup;
mod cli;
mod error;
mod fsassembler;
mod image;
mod index;
mod inspector;
mod network;
mod paths;
mod supervisor;
mod tarball;

use clap::Parser;
use nix::unistd::geteuid;

use cli::GockerCommand;
use error::GockerError;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if !geteuid().is_root() {
        eprintln!("gocker: you need root privileges to run this program");
        std::process::exit(1);
    }

    if let Err(e) = paths::init_dirs() {
        eprintln!("gocker: failed to initialize directories: {e}");
        std::process::exit(1);
    }

    let cli = match cli::Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            eprint!("{e}");
            std::process::exit(1);
        }
    };
    let exit_code = dispatch(cli.command);
    std::process::exit(exit_code);
}

fn dispatch(command: GockerCommand) -> i32 {
    let result = match command {
        GockerCommand::Run(args) => run_blocking(args),
        GockerCommand::Exec(args) => run_exec(args),
        GockerCommand::Ps => inspector::print_running_containers().map(|()| 0),
        GockerCommand::Images => image::print_available_images().map(|()| 0),
        GockerCommand::Rmi(args) => run_rmi(args),
        GockerCommand::ChildMode(args) => run_child_mode(args),
        GockerCommand::SetupNetns(arg) => network::setup_netns(&arg.container_id).map(|()| 0),
        GockerCommand::SetupVeth(arg) => run_setup_veth(&arg.container_id),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("gocker: {e}");
            1
        }
    }
}

fn tokio_runtime() -> Result<tokio::runtime::Runtime, GockerError> {
    tokio::runtime::Runtime::new().map_err(|source| GockerError::Io {
        context: "start async runtime".to_string(),
        source,
    })
}

fn run_blocking(args: cli::RunArgs) -> Result<i32, GockerError> {
    let rt = tokio_runtime()?;
    rt.block_on(supervisor::run(&args.image, args.quotas.into(), &args.command))
}

fn run_setup_veth(container_id: &str) -> Result<i32, GockerError> {
    let rt = tokio_runtime()?;
    rt.block_on(network::setup_veth_ns(container_id))?;
    Ok(0)
}

fn run_exec(args: cli::ExecArgs) -> Result<i32, GockerError> {
    let pid = inspector::pid_for_container(&args.container_id)?
        .ok_or_else(|| GockerError::NoSuchContainer(args.container_id.clone()))?;
    supervisor::exec_in_container(&args.container_id, pid, &args.command)
}

fn run_rmi(args: cli::RmiArgs) -> Result<i32, GockerError> {
    let running = inspector::running_images()?;
    image::delete(&args.image_id, &running)?;
    Ok(0)
}

fn run_child_mode(args: cli::ChildModeArgs) -> Result<i32, GockerError> {
    supervisor::child_mode(
        &args.container_id,
        &args.img,
        args.quotas.into(),
        &args.command,
    )
}
