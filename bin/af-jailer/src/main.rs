//! The sandbox launcher. Spawned by `af-container::Container::run`, never
//! invoked directly by a human. Unshares a user namespace (plus mount, pid,
//! ipc, uts, cgroup, and optionally network), waits for the parent to write
//! its uid/gid maps, performs the bind-mount sequence, sets up the build
//! environment, and execs the requested command.

use anyhow::{bail, Context, Result};
use clap::Parser;
use nix::mount::{mount, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::unistd::{chdir, chroot, Gid, Uid};
use std::collections::BTreeMap;
use std::os::fd::{FromRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;

#[derive(Debug, Parser)]
struct Args {
    #[clap(long)]
    cdir: PathBuf,

    #[clap(long)]
    uid: u32,

    #[clap(long)]
    gid: u32,

    #[clap(long)]
    root: bool,

    #[clap(long)]
    network: bool,

    #[clap(long)]
    writable_root: bool,

    #[clap(long = "mount")]
    mounts: Vec<String>,

    #[clap(long)]
    rootd_socket: Option<PathBuf>,

    #[clap(long)]
    setarch: Option<String>,

    #[clap(long = "env")]
    env: Vec<String>,

    /// Fd the parent writes a single ready byte to once uid_map/gid_map have
    /// been applied via `newuidmap`/`newgidmap`.
    #[clap(long)]
    sync_fd: RawFd,

    /// Fd this process writes its own pid to, so the parent knows which pid
    /// to pass to `newuidmap`/`newgidmap`.
    #[clap(long)]
    info_fd: RawFd,

    #[clap(long = "host-libexec", default_value = "/usr/lib/af/libexec")]
    host_libexec: PathBuf,

    /// When set (by the root daemon forwarding a request's three fds), the
    /// executed command's stdio is redirected onto these instead of ours.
    #[clap(long)]
    stdio_in: Option<RawFd>,
    #[clap(long)]
    stdio_out: Option<RawFd>,
    #[clap(long)]
    stdio_err: Option<RawFd>,

    #[clap(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

const CAPS: &[caps::Capability] = &[
    caps::Capability::CAP_CHOWN,
    caps::Capability::CAP_FOWNER,
    caps::Capability::CAP_DAC_OVERRIDE,
    caps::Capability::CAP_SETFCAP,
    caps::Capability::CAP_SYS_CHROOT,
    caps::Capability::CAP_SETUID,
    caps::Capability::CAP_SETGID,
];

fn main() -> Result<()> {
    let args = Args::parse();

    let mut flags = CloneFlags::CLONE_NEWUSER
        | CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWIPC
        | CloneFlags::CLONE_NEWUTS
        | CloneFlags::CLONE_NEWCGROUP;
    if !args.network {
        flags |= CloneFlags::CLONE_NEWNET;
    }
    unshare(flags).context("failed to unshare namespaces")?;

    report_pid(args.info_fd)?;
    wait_for_idmap_ready(args.sync_fd)?;

    bind_mounts(&args)?;
    chroot(&args.cdir).context("failed to chroot into the container")?;
    chdir("/").context("failed to chdir into the new root")?;

    set_environment(&args);

    if args.root {
        nix::unistd::setuid(Uid::from_raw(0)).context("failed to setuid(0)")?;
        nix::unistd::setgid(Gid::from_raw(0)).context("failed to setgid(0)")?;
        grant_capabilities()?;
    }

    exec_command(&args)
}

/// Writes this process's pid (as seen by the parent's pid namespace, i.e.
/// before `CLONE_NEWPID` affects any children this process forks) so the
/// parent knows which pid to target with `newuidmap`/`newgidmap`.
fn report_pid(info_fd: RawFd) -> Result<()> {
    use std::io::Write;
    let pid = std::process::id();
    let mut f = unsafe { std::fs::File::from_raw_fd(info_fd) };
    // Newline-terminated: the parent reads one line rather than waiting for
    // EOF, since this write end stays open (inherited, not CLOEXEC) for the
    // lifetime of the sandboxed command.
    write!(f, "{pid}\n").context("failed to report pid to parent")?;
    f.flush().context("failed to report pid to parent")?;
    std::mem::forget(f); // the fd is owned by our caller's pipe bookkeeping
    Ok(())
}

fn wait_for_idmap_ready(sync_fd: RawFd) -> Result<()> {
    use std::io::Read;
    let mut f = unsafe { std::fs::File::from_raw_fd(sync_fd) };
    let mut buf = [0u8; 1];
    f.read_exact(&mut buf)
        .context("failed to read idmap-ready signal from parent")?;
    std::mem::forget(f);
    Ok(())
}

fn bind_mounts(args: &Args) -> Result<()> {
    let none: Option<&str> = None;

    mount(
        none,
        "/",
        none,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        none,
    )
    .context("failed to make the mount namespace private")?;

    let root_flags = if args.writable_root {
        MsFlags::MS_BIND | MsFlags::MS_REC
    } else {
        MsFlags::MS_BIND | MsFlags::MS_REC | MsFlags::MS_RDONLY
    };
    mount(Some(&args.cdir), &args.cdir, none, root_flags, none)
        .context("failed to bind the container root onto itself")?;

    let dev = args.cdir.join("dev");
    mount(Some("/dev"), &dev, none, MsFlags::MS_BIND | MsFlags::MS_REC, none)
        .context("failed to bind /dev")?;

    let proc = args.cdir.join("proc");
    std::fs::create_dir_all(&proc).ok();
    mount(Some("proc"), &proc, Some("proc"), MsFlags::empty(), none)
        .context("failed to mount a fresh /proc")?;

    for name in &args.mounts {
        let link = args.cdir.join("af/config").join(name);
        let target = std::fs::read_link(&link)
            .with_context(|| format!("failed to resolve mount symlink {}", link.display()))?;
        let dest = args.cdir.join("af").join(name);
        mount(Some(&target), &dest, none, MsFlags::MS_BIND | MsFlags::MS_REC, none)
            .with_context(|| format!("failed to bind-mount {name}"))?;
    }

    for overlay in ["af/config", "af/libexec"] {
        let dest = args.cdir.join(overlay);
        let src = if overlay == "af/libexec" {
            args.host_libexec.clone()
        } else {
            args.cdir.join(overlay)
        };
        if src.exists() {
            mount(Some(&src), &dest, none, MsFlags::MS_BIND | MsFlags::MS_RDONLY, none)
                .with_context(|| format!("failed to bind-mount {overlay}"))?;
        }
    }

    for etc_file in ["/etc/hosts", "/etc/resolv.conf"] {
        let dest = args.cdir.join(etc_file.trim_start_matches('/'));
        if std::path::Path::new(etc_file).exists() && dest.exists() {
            mount(Some(etc_file), &dest, none, MsFlags::MS_BIND, none)
                .with_context(|| format!("failed to bind-mount {etc_file}"))?;
        }
    }

    Ok(())
}

fn set_environment(args: &Args) {
    std::env::set_var("LOGNAME", args.uid.to_string());
    std::env::set_var("USER", args.uid.to_string());
    std::env::set_var("UID", args.uid.to_string());
    std::env::set_var("PATH", "/usr/bin:/bin:/usr/sbin:/sbin");
    std::env::set_var("APORTSDIR", "/af/aports");
    std::env::set_var("REPODEST", "/af/repos");
    std::env::set_var("SRCDEST", "/af/distfiles");
    std::env::set_var("HOME", std::env::temp_dir());

    if args.rootd_socket.is_some() {
        for (name, target) in [
            ("ABUILD_FETCH", "abuild-fetch"),
            ("ADDGROUP", "abuild-addgroup"),
            ("ADDUSER", "abuild-adduser"),
            ("SUDO_APK", "abuild-apk"),
            ("APK_FETCH", "apk"),
        ] {
            std::env::set_var(name, format!("/af/libexec/af-sudo {target}"));
        }
    }

    let extra: BTreeMap<&str, &str> = args
        .env
        .iter()
        .filter_map(|kv| kv.split_once('='))
        .collect();
    for (k, v) in extra {
        std::env::set_var(k, v);
    }
}

fn grant_capabilities() -> Result<()> {
    use caps::{CapSet, Capability};
    let set: std::collections::HashSet<Capability> = CAPS.iter().copied().collect();
    caps::set(None, CapSet::Permitted, &set).context("failed to set permitted capabilities")?;
    caps::set(None, CapSet::Effective, &set).context("failed to set effective capabilities")?;
    Ok(())
}

fn exec_command(args: &Args) -> Result<()> {
    let (program, rest): (&str, &[String]) = match &args.setarch {
        Some(variant) => ("setarch", std::slice::from_ref(variant)),
        None => {
            if args.command.is_empty() {
                bail!("no command given to run inside the sandbox");
            }
            (args.command[0].as_str(), &args.command[1..])
        }
    };

    let mut cmd = Command::new(program);
    if args.setarch.is_some() {
        cmd.args(rest).args(&args.command);
    } else {
        cmd.args(rest);
    }

    redirect_stdio(&mut cmd, args.stdio_in, 0);
    redirect_stdio(&mut cmd, args.stdio_out, 1);
    redirect_stdio(&mut cmd, args.stdio_err, 2);

    let err = cmd.exec();
    Err(err).context("failed to exec the sandboxed command")
}

/// Dup2s `fd` onto the child's `target` stdio slot just before exec, so a
/// fd forwarded in from the root daemon's caller becomes the executed
/// command's stdin/stdout/stderr instead of this process's own.
fn redirect_stdio(cmd: &mut Command, fd: Option<RawFd>, target: RawFd) {
    if let Some(fd) = fd {
        unsafe {
            cmd.pre_exec(move || {
                nix::unistd::dup2(fd, target)
                    .map(|_| ())
                    .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
            });
        }
    }
}
