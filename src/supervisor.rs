//! Supervisor: orchestrates `run`'s two-phase child launch
//! and `exec`'s namespace-entry path.
//!
//! `run` re-enters its own binary twice for network setup (`setup-netns`,
//! `setup-veth`, real process boundaries since a persistent namespace file
//! must outlive the phase that creates it) and once more for `child-mode`,
//! this last re-entry driven through `nix::sched::clone` rather than a
//! plain fork+exec: `clone(2)` with the namespace flags set creates the new
//! task already inside the fresh namespaces, so the `execv` that follows
//! keeps that placement — a plain `unshare`-then-`exec` would not, since
//! `unshare(CLONE_NEWPID)` only affects a task's *future* children.

use std::env;
use std::ffi::CString;
use std::fs;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::process::Command;

use hex::encode;
use nix::fcntl::{open, OFlag};
use nix::mount::{mount, umount, MsFlags};
use nix::sched::{clone, setns, CloneFlags};
use nix::sys::signal::Signal;
use nix::sys::stat::Mode;
use nix::sys::wait::waitpid;
use nix::unistd::{chdir, chroot, close, sethostname};
use rand::Rng;

use crate::cgroup::{self, Quotas};
use crate::error::{log_teardown_failure, GockerError, Result};
use crate::fsassembler;
use crate::image;
use crate::network;
use crate::paths::container_mnt_dir;

const CHILD_STACK_SIZE: usize = 1024 * 1024;

fn self_exe() -> Result<PathBuf> {
    env::current_exe().map_err(|source| GockerError::Io {
        context: "resolve current executable path".to_string(),
        source,
    })
}

fn generate_container_id() -> String {
    let bytes: [u8; 6] = rand::thread_rng().gen();
    encode(bytes)
}

fn run_self_blocking(args: &[&str]) -> Result<()> {
    let exe = self_exe()?;
    let status = Command::new(&exe)
        .args(args)
        .status()
        .map_err(|source| GockerError::Io {
            context: format!("re-invoke self as {}", args.join(" ")),
            source,
        })?;
    if !status.success() {
        return Err(GockerError::Network(format!(
            "{} exited with {}",
            args.join(" "),
            status
        )));
    }
    Ok(())
}

fn quota_args(quotas: Quotas) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(m) = quotas.mem_mib {
        out.push(format!("--mem={m}"));
    }
    if let Some(s) = quotas.swap_mib {
        out.push(format!("--swap={s}"));
    }
    if let Some(p) = quotas.pids {
        out.push(format!("--pids={p}"));
    }
    if let Some(c) = quotas.cpus {
        out.push(format!("--cpus={c}"));
    }
    out
}

/// Step 7: clone into fresh PID/mount/IPC/UTS namespaces and, as the
/// first thing the cloned task does, re-exec this same binary dispatched to
/// `child-mode`. Returns once that process (the container's namespace-1
/// task) has exited, with its exit status.
fn spawn_child_mode(
    container_id: &str,
    image_id: &str,
    quotas: Quotas,
    argv: &[String],
) -> Result<i32> {
    let exe = self_exe()?;
    let mut args: Vec<String> = vec!["child-mode".to_string()];
    args.extend(quota_args(quotas));
    args.push(format!("--img={image_id}"));
    args.push(container_id.to_string());
    args.extend(argv.iter().cloned());

    let exe_display = exe.to_string_lossy().into_owned();
    let exe_c = CString::new(exe_display)
        .map_err(|_| GockerError::Precondition("executable path contains a NUL byte".into()))?;
    let arg_cstrings: Vec<CString> = args
        .iter()
        .map(|a| CString::new(a.as_str()).expect("cli argument must not contain NUL"))
        .collect();

    let mut stack = vec![0u8; CHILD_STACK_SIZE];
    let clone_flags = CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWIPC
        | CloneFlags::CLONE_NEWUTS;

    let child_fn = Box::new(|| -> isize {
        let mut full_argv = vec![exe_c.clone()];
        full_argv.extend(arg_cstrings.clone());
        match nix::unistd::execv(&exe_c, &full_argv) {
            Ok(_) => 0,
            Err(_) => 1,
        }
    });

    let pid = unsafe { clone(child_fn, &mut stack, clone_flags, Some(Signal::SIGCHLD as i32)) }
        .map_err(|source| GockerError::Kernel {
            context: "clone child-mode task".to_string(),
            source,
        })?;

    let status = waitpid(pid, None).map_err(|source| GockerError::Kernel {
        context: "wait for child-mode task".to_string(),
        source,
    })?;

    Ok(match status {
        nix::sys::wait::WaitStatus::Exited(_, code) => code,
        nix::sys::wait::WaitStatus::Signaled(_, signal, _) => 128 + signal as i32,
        _ => -1,
    })
}

/// `run`'s full orchestration (steps 1-8). Any step's failure aborts
/// the remainder and triggers best-effort teardown of whatever was already
/// set up.
pub async fn run(image_ref: &str, quotas: Quotas, argv: &[String]) -> Result<i32> {
    let container_id = generate_container_id();
    tracing::info!(id = %container_id, "new container id");

    let image_id = image::resolve(image_ref).await?;
    tracing::info!(image = %image_id, "image resolved, overlay will be assembled on it");

    let outcome = run_steps(&container_id, &image_id, quotas, argv).await;
    teardown(&container_id);
    outcome
}

async fn run_steps(
    container_id: &str,
    image_id: &str,
    quotas: Quotas,
    argv: &[String],
) -> Result<i32> {
    fsassembler::create_container_dirs(container_id)?;
    fsassembler::mount_overlay(container_id, image_id)?;

    network::ensure_bridge().await?;
    network::setup_veth_host(container_id).await?;

    run_self_blocking(&["setup-netns", container_id])?;
    run_self_blocking(&["setup-veth", container_id])?;

    spawn_child_mode(container_id, image_id, quotas, argv)
}

/// Step 8: unwind in reverse dependency order. Each step is
/// independent and best-effort; a failure here is logged, not propagated,
/// per the teardown-failure policy: log and keep going.
fn teardown(container_id: &str) {
    if let Err(e) = network::delete_netns(container_id) {
        log_teardown_failure("unmount/delete netns file", e);
    }
    if let Err(e) = fsassembler::umount_overlay(container_id) {
        log_teardown_failure("unmount overlay", e);
    }
    if let Err(e) = cgroup::remove(container_id) {
        log_teardown_failure("remove cgroups", e);
    }
    if let Err(e) = fsassembler::remove_container_dirs(container_id) {
        log_teardown_failure("remove container directory tree", e);
    }
}

fn copy_resolver_config(container_id: &str) {
    const CANDIDATES: [&str; 2] = [
        "/var/run/systemd/resolve/resolv.conf",
        "/etc/resolv.conf",
    ];
    for candidate in CANDIDATES {
        if !PathBuf::from(candidate).exists() {
            continue;
        }
        let dst = container_mnt_dir(container_id).join("etc/resolv.conf");
        if let Some(parent) = dst.parent() {
            let _ = fs::create_dir_all(parent);
        }
        if let Err(e) = fs::copy(candidate, &dst) {
            tracing::warn!(error = %e, "copying resolv.conf failed, continuing without it");
        }
        return;
    }
}

fn mount_container_fs() -> Result<()> {
    fs::create_dir_all("/proc").ok();
    mount_fs("proc", "/proc", "proc")?;
    mount_fs("tmpfs", "/tmp", "tmpfs")?;
    mount_fs("tmpfs", "/dev", "tmpfs")?;
    fs::create_dir_all("/dev/pts").ok();
    mount_fs("devpts", "/dev/pts", "devpts")?;
    fs::create_dir_all("/sys").ok();
    mount_fs("sysfs", "/sys", "sysfs")?;
    Ok(())
}

fn mount_fs(source: &str, target: &str, fstype: &str) -> Result<()> {
    mount(
        Some(source),
        target,
        Some(fstype),
        MsFlags::empty(),
        None::<&str>,
    )
    .map_err(|src| GockerError::Kernel {
        context: format!("mount {fstype} on {target}"),
        source: src,
    })
}

fn unmount_container_fs() {
    for target in ["/dev/pts", "/dev", "/sys", "/proc", "/tmp"] {
        if let Err(e) = umount(target) {
            log_teardown_failure(&format!("unmount {target}"), e);
        }
    }
}

/// The `child-mode` subcommand body: runs as the container's PID-1 task,
/// inside namespaces `clone`d by the parent `run` invocation. Spawns the
/// target program as its own child and waits for it, mirroring the original
/// `execContainerCommand`'s use of a blocking `cmd.Run()` rather than
/// replacing its own image — that leaves this task alive to unmount on the
/// way out.
pub fn child_mode(container_id: &str, image_id: &str, quotas: Quotas, argv: &[String]) -> Result<i32> {
    sethostname(container_id).map_err(|source| GockerError::Kernel {
        context: "set container hostname".to_string(),
        source,
    })?;

    network::join(container_id)?;

    cgroup::create(container_id, true)?;
    cgroup::configure(container_id, quotas)?;

    copy_resolver_config(container_id);

    let mnt = container_mnt_dir(container_id);
    chroot(&mnt).map_err(|source| GockerError::Kernel {
        context: format!("chroot into {}", mnt.display()),
        source,
    })?;
    chdir("/").map_err(|source| GockerError::Kernel {
        context: "chdir to /".to_string(),
        source,
    })?;

    mount_container_fs()?;

    let rt = tokio::runtime::Runtime::new().map_err(|source| GockerError::Io {
        context: "start loopback-configuration runtime".to_string(),
        source,
    })?;
    rt.block_on(network::bring_up_loopback())?;

    let config = image::config(image_id)?;
    if argv.is_empty() {
        return Err(GockerError::Precondition("no command given to run".into()));
    }
    let status = Command::new(&argv[0])
        .args(&argv[1..])
        .env_clear()
        .envs(config.env.iter().filter_map(|kv| kv.split_once('=')))
        .status();

    unmount_container_fs();

    match status {
        Ok(status) => Ok(status.code().unwrap_or(-1)),
        Err(source) => Err(GockerError::Io {
            context: format!("execute {}", argv[0]),
            source,
        }),
    }
}

fn open_ns_fd(pid: u32, kind: &str) -> Result<RawFd> {
    let path = format!("/proc/{pid}/ns/{kind}");
    open(path.as_str(), OFlag::O_RDONLY, Mode::empty()).map_err(|source| GockerError::Kernel {
        context: format!("open {path}"),
        source,
    })
}

/// `exec`'s path: enter every namespace of the target container's
/// supervised task, re-enroll in its existing cgroups, chroot, and run.
pub fn exec_in_container(container_id: &str, pid: u32, argv: &[String]) -> Result<i32> {
    let namespaces: [(&str, CloneFlags); 5] = [
        ("ipc", CloneFlags::CLONE_NEWIPC),
        ("mnt", CloneFlags::CLONE_NEWNS),
        ("net", CloneFlags::CLONE_NEWNET),
        ("pid", CloneFlags::CLONE_NEWPID),
        ("uts", CloneFlags::CLONE_NEWUTS),
    ];

    for (kind, flag) in namespaces {
        let fd = open_ns_fd(pid, kind)?;
        setns(fd, flag).map_err(|source| GockerError::Kernel {
            context: format!("setns into {kind} namespace of pid {pid}"),
            source,
        })?;
        close(fd).ok();
    }

    cgroup::join_existing(container_id)?;

    let mnt = container_mnt_dir(container_id);
    chroot(&mnt).map_err(|source| GockerError::Kernel {
        context: format!("chroot into {}", mnt.display()),
        source,
    })?;
    chdir("/").map_err(|source| GockerError::Kernel {
        context: "chdir to /".to_string(),
        source,
    })?;

    if argv.is_empty() {
        return Err(GockerError::Precondition("no command given to exec".into()));
    }
    let status = Command::new(&argv[0])
        .args(&argv[1..])
        .status()
        .map_err(|source| GockerError::Io {
            context: format!("execute {}", argv[0]),
            source,
        })?;
    Ok(status.code().unwrap_or(-1))
}
