use crate::error::{self, Result};
use af_config::{ProjectConfig, SiteConfig};
use snafu::{ensure, OptionExt, ResultExt};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::os::fd::{FromRawFd, RawFd};
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::process::Command;

/// The four bind-mount points every container carries, named after the
/// symlinks created under `af/config/` that point at them.
pub const MOUNTS: &[&str] = &["aportsdir", "builddir", "repodest", "srcdest"];

/// A container directory: the on-disk tree owned by one uid that hosts a
/// single sandbox. Cheap to construct; all state lives on disk under `cdir`.
#[derive(Debug, Clone)]
pub struct Container {
    cdir: PathBuf,
    uid: u32,
    gid: u32,
    subordinate_base: u32,
    arch: String,
    branch: String,
    repo: String,
    setarch: Option<String>,
    rootd_socket: Option<PathBuf>,
}

impl Container {
    pub fn cdir(&self) -> &Path {
        &self.cdir
    }

    pub fn arch(&self) -> &str {
        &self.arch
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    pub fn set_repo(&mut self, repo: impl Into<String>) {
        self.repo = repo.into();
    }

    /// `cont_make` doesn't know the target arch yet (rootfs selection
    /// happens afterwards in `cont_bootstrap`), so callers that build a
    /// fresh container set it here once known.
    pub fn set_arch(&mut self, arch: impl Into<String>) {
        self.arch = arch.into();
    }

    pub fn set_rootd_socket(&mut self, socket: Option<PathBuf>) {
        self.rootd_socket = socket;
    }

    /// Opens an already-built container, reading its metadata back from
    /// `af/config/`. Refuses to operate on a cdir the caller does not own.
    pub fn open(
        cdir: impl Into<PathBuf>,
        uid: u32,
        gid: u32,
        arch: &str,
        site: &SiteConfig,
    ) -> Result<Self> {
        let cdir = cdir.into();
        check_owner(&cdir, uid)?;

        let config_dir = cdir.join("af/config");
        let branch = read_trimmed(&config_dir.join("branch"))?;
        let repo = read_trimmed(&config_dir.join("repo"))?;
        let setarch = config_dir
            .join("setarch")
            .exists()
            .then(|| read_trimmed(&config_dir.join("setarch")))
            .transpose()?;

        Ok(Self {
            cdir,
            uid,
            gid,
            subordinate_base: site.subid_base,
            arch: arch.to_string(),
            branch,
            repo,
            setarch,
            rootd_socket: None,
        })
    }
}

fn read_trimmed(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .context(error::FileReadSnafu { path })
}

fn check_owner(cdir: &Path, caller: u32) -> Result<()> {
    use std::os::unix::fs::MetadataExt;
    if !cdir.exists() {
        return Ok(());
    }
    let owner = fs::metadata(cdir)
        .context(error::FileReadSnafu { path: cdir })?
        .uid();
    ensure!(
        owner == caller || caller == 0,
        error::NotOwnedSnafu {
            cdir: cdir.to_path_buf(),
            owner,
            caller,
        }
    );
    Ok(())
}

/// Options controlling how `cont_make` lays out external mounts.
#[derive(Debug, Clone, Default)]
pub struct MakeOptions {
    /// External path for each of `aportsdir`/`builddir`/`repodest`/`srcdest`;
    /// when absent, the internal mount-point directory under `af/` is used
    /// instead, so later code never needs to distinguish internal vs.
    /// external mounts.
    pub external_mounts: BTreeMap<String, PathBuf>,
    pub cache: Option<PathBuf>,
    pub setarch: Option<String>,
}

/// Builds the mandatory skeleton for a fresh container directory: `af/`,
/// `af/config/`, the four mount points, and the branch/repo/setarch
/// metadata files, with symlinks under `af/config/` pointing at each mount.
pub fn cont_make(
    cdir: impl Into<PathBuf>,
    branch: &str,
    repo: &str,
    opts: &MakeOptions,
    site: &SiteConfig,
) -> Result<Container> {
    let cdir = cdir.into();
    let config_dir = cdir.join("af/config");
    fs::create_dir_all(&config_dir).context(error::DirectoryCreateSnafu { path: &config_dir })?;

    for mount in MOUNTS {
        let internal = cdir.join("af").join(mount);
        fs::create_dir_all(&internal).context(error::DirectoryCreateSnafu { path: &internal })?;

        let target = opts
            .external_mounts
            .get(*mount)
            .cloned()
            .unwrap_or(internal);
        let link = config_dir.join(mount);
        let _ = fs::remove_file(&link);
        symlink(&target, &link).context(error::SymlinkCreateSnafu {
            link: link.clone(),
            target,
        })?;
    }

    if let Some(cache) = &opts.cache {
        let link = config_dir.join("cache");
        let _ = fs::remove_file(&link);
        symlink(cache, &link).context(error::SymlinkCreateSnafu {
            link: link.clone(),
            target: cache.clone(),
        })?;
    }

    write_metadata(&config_dir.join("branch"), branch)?;
    write_metadata(&config_dir.join("repo"), repo)?;
    if let Some(setarch) = &opts.setarch {
        write_metadata(&config_dir.join("setarch"), setarch)?;
    }

    let uid = nix::unistd::getuid().as_raw();
    let gid = nix::unistd::getgid().as_raw();

    Ok(Container {
        cdir,
        uid,
        gid,
        subordinate_base: site.subid_base,
        arch: String::new(),
        branch: branch.to_string(),
        repo: repo.to_string(),
        setarch: opts.setarch.clone(),
        rootd_socket: None,
    })
}

fn write_metadata(path: &Path, contents: &str) -> Result<()> {
    let mut f = fs::File::create(path).context(error::FileWriteSnafu { path })?;
    writeln!(f, "{contents}").context(error::FileWriteSnafu { path })?;
    Ok(())
}

/// Downloads and extracts the arch's rootfs tarball into `cdir`, verifying
/// its SHA-256 digest before extraction; on mismatch the partial download is
/// removed and the build fails.
pub fn cont_bootstrap(container: &Container, project: &ProjectConfig) -> Result<()> {
    let source = project
        .rootfs
        .get(&container.arch)
        .ok_or_else(|| error::Error::NoRootfs {
            arch: container.arch.clone(),
        })?;

    let bytes = reqwest::blocking::get(&source.url)
        .and_then(|r| r.bytes())
        .context(error::DownloadSnafu {
            url: source.url.clone(),
        })?;

    use sha2::Digest;
    let mut digest = sha2::Sha256::new();
    digest.update(&bytes);
    let actual = hex_encode(&digest.finalize());
    ensure!(
        actual.eq_ignore_ascii_case(&source.sha256),
        error::DigestMismatchSnafu {
            arch: container.arch.clone(),
            expected: source.sha256.clone(),
            actual,
        }
    );

    let decompressed = flate2::read::GzDecoder::new(&bytes[..]);
    let mut archive = tar::Archive::new(decompressed);
    archive
        .unpack(&container.cdir)
        .context(error::ExtractSnafu {
            path: container.cdir.clone(),
        })?;

    run_project_script(container, "bootstrap", RunOptions::privileged())?;
    cont_refresh_skeleton(container, project)
}

/// Re-applies `<branchdir>/refresh` with root and network access. Callers
/// must do this before any build task to pick up newly installed deps.
pub fn cont_refresh(container: &Container) -> Result<()> {
    let status = run_project_script(container, "refresh", RunOptions::privileged())?;
    ensure!(status == 0, error::RefreshFailedSnafu { status });
    Ok(())
}

/// Copies the project's `skel*` trees over the container root, most to least
/// specific: `skel`, `skel.<repo>`, `skel..<arch>`, `skel.<repo>.<arch>`,
/// then the branch's `abuild.conf` if one is provided. Missing directories
/// are skipped, not an error. Callers must do this before any privileged
/// re-entry into the container (spec's cont_bootstrap step 6 and the root
/// daemon's per-request refresh).
pub fn cont_refresh_skeleton(container: &Container, _project: &ProjectConfig) -> Result<()> {
    let conf_d = container
        .cdir
        .join("af/config/aportsdir/.apkfoundry")
        .join(&container.branch);

    let skels = [
        conf_d.join("skel"),
        conf_d.join(format!("skel.{}", container.repo)),
        conf_d.join(format!("skel..{}", container.arch)),
        conf_d.join(format!("skel.{}.{}", container.repo, container.arch)),
    ];
    for skel in &skels {
        if !skel.is_dir() {
            log::debug!("could not find {}", skel.display());
            continue;
        }
        force_copytree(skel, &container.cdir)?;
    }

    let abuild_conf = conf_d.join("abuild.conf");
    if abuild_conf.is_file() {
        let dest = container.cdir.join("etc/abuild.conf");
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).context(error::DirectoryCreateSnafu { path: parent.to_path_buf() })?;
        }
        fs::copy(&abuild_conf, &dest).context(error::FileWriteSnafu { path: dest })?;
    }

    Ok(())
}

/// `_force_copytree`: recursively copies `src` onto `dst`, overwriting
/// existing files, creating directories as needed.
fn force_copytree(src: &Path, dst: &Path) -> Result<()> {
    for entry in fs::read_dir(src).context(error::FileReadSnafu { path: src.to_path_buf() })? {
        let entry = entry.context(error::FileReadSnafu { path: src.to_path_buf() })?;
        let file_type = entry
            .file_type()
            .context(error::FileReadSnafu { path: entry.path() })?;
        let dest = dst.join(entry.file_name());

        if file_type.is_dir() {
            fs::create_dir_all(&dest).context(error::DirectoryCreateSnafu { path: dest.clone() })?;
            force_copytree(&entry.path(), &dest)?;
        } else {
            log::debug!("cp {} -> {}", entry.path().display(), dest.display());
            fs::copy(entry.path(), &dest).context(error::FileWriteSnafu { path: dest })?;
        }
    }
    Ok(())
}

fn run_project_script(container: &Container, name: &str, opts: RunOptions) -> Result<i32> {
    let argv = vec![format!("/af/config/{name}")];
    container.run(&argv, opts)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Policy for one sandbox invocation.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub root: bool,
    pub network: bool,
    pub writable_root: bool,
    pub extra_env: BTreeMap<String, String>,
    /// Redirect the sandboxed command's stdin/stdout/stderr onto these three
    /// inherited fds instead of this process's own. Used by the root daemon
    /// to forward the three fds a request arrived with (spec §4.2/§6.2).
    pub stdio: Option<[RawFd; 3]>,
}

impl RunOptions {
    pub fn unprivileged() -> Self {
        Self {
            root: false,
            network: false,
            writable_root: false,
            extra_env: BTreeMap::new(),
            stdio: None,
        }
    }

    /// Root, networking, writable root — used for bootstrap/refresh and for
    /// the root daemon's re-entry into the container.
    pub fn privileged() -> Self {
        Self {
            root: true,
            network: true,
            writable_root: true,
            extra_env: BTreeMap::new(),
            stdio: None,
        }
    }

    pub fn with_stdio(mut self, stdio: [RawFd; 3]) -> Self {
        self.stdio = Some(stdio);
        self
    }
}

impl Container {
    fn prepare_jailer(&self, argv: &[String], opts: &RunOptions, sync_r: RawFd, info_w: RawFd) -> Command {
        let mut cmd = Command::new("af-jailer");
        cmd.arg("--cdir").arg(&self.cdir);
        cmd.arg("--uid").arg(self.uid.to_string());
        cmd.arg("--gid").arg(self.gid.to_string());
        cmd.arg("--sync-fd").arg(sync_r.to_string());
        cmd.arg("--info-fd").arg(info_w.to_string());

        if opts.root {
            cmd.arg("--root");
        }
        if opts.network {
            cmd.arg("--network");
        }
        if opts.writable_root {
            cmd.arg("--writable-root");
        }
        for mount in MOUNTS {
            cmd.arg("--mount").arg(mount);
        }
        if let Some(socket) = &self.rootd_socket {
            cmd.arg("--rootd-socket").arg(socket);
        }
        if let Some(setarch) = &self.setarch {
            cmd.arg("--setarch").arg(setarch);
        }
        for (k, v) in &opts.extra_env {
            cmd.arg("--env").arg(format!("{k}={v}"));
        }
        if let Some([in_fd, out_fd, err_fd]) = opts.stdio {
            cmd.arg("--stdio-in").arg(in_fd.to_string());
            cmd.arg("--stdio-out").arg(out_fd.to_string());
            cmd.arg("--stdio-err").arg(err_fd.to_string());
        }

        cmd.arg("--");
        cmd.args(argv);
        cmd
    }

    /// Performs the idmap handshake with an already-spawned jailer: reads
    /// its reported pid off `info_r`, derives and applies the uid/gid maps
    /// via `newuidmap`/`newgidmap`, then signals readiness on `sync_w`.
    fn idmap_handshake(&self, sync_r: RawFd, sync_w: RawFd, info_r: RawFd, info_w: RawFd) -> Result<()> {
        let _ = nix::unistd::close(sync_r);
        let _ = nix::unistd::close(info_w);

        let pid = read_pid(info_r)?;
        let _ = nix::unistd::close(info_r);

        let uid_map = crate::idmap::derive(self.uid, self.subordinate_base)?;
        let gid_map = crate::idmap::derive(self.gid, self.subordinate_base)?;
        run_idmap_helper("newuidmap", pid, &uid_map)?;
        run_idmap_helper("newgidmap", pid, &gid_map)?;

        signal_ready(sync_w)?;
        let _ = nix::unistd::close(sync_w);
        Ok(())
    }

    /// Launches the sandbox (`af-jailer`) with the given argv and policy.
    ///
    /// The jailer blocks after unsharing its namespaces until this function
    /// has derived and applied the uid/gid maps via the external
    /// `newuidmap`/`newgidmap` helpers; a pair of pipes carries the jailer's
    /// pid to us and our ready signal back to it. Returns the first nonzero
    /// exit code among `{newuidmap, newgidmap, child}`.
    pub fn run(&self, argv: &[String], opts: RunOptions) -> Result<i32> {
        let (sync_r, sync_w) = nix::unistd::pipe().context(error::PipeSnafu)?;
        let (info_r, info_w) = nix::unistd::pipe().context(error::PipeSnafu)?;

        let mut cmd = self.prepare_jailer(argv, &opts, sync_r, info_w);
        let mut child = cmd.spawn().context(error::JailerSpawnSnafu)?;

        self.idmap_handshake(sync_r, sync_w, info_r, info_w)?;

        let status = child.wait().context(error::JailerWaitSnafu)?;
        Ok(status.code().unwrap_or(-1))
    }

    /// Like [`Container::run`], but captures the sandboxed command's stdout
    /// instead of inheriting it. Used by `af-depgen` to read `af-deps`'
    /// `o`/`d` record stream (spec §4.4).
    pub fn run_captured(&self, argv: &[String], opts: RunOptions) -> Result<(i32, String)> {
        use std::process::Stdio;

        let (sync_r, sync_w) = nix::unistd::pipe().context(error::PipeSnafu)?;
        let (info_r, info_w) = nix::unistd::pipe().context(error::PipeSnafu)?;

        let mut cmd = self.prepare_jailer(argv, &opts, sync_r, info_w);
        cmd.stdout(Stdio::piped());
        let mut child = cmd.spawn().context(error::JailerSpawnSnafu)?;

        self.idmap_handshake(sync_r, sync_w, info_r, info_w)?;

        let output = child.wait_with_output().context(error::JailerWaitSnafu)?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        Ok((output.status.code().unwrap_or(-1), stdout))
    }
}

fn read_pid(fd: RawFd) -> Result<u32> {
    use std::io::BufRead;
    let f = unsafe { std::fs::File::from_raw_fd(fd) };
    // The jailer's `--info-fd` write end stays open (inherited by the
    // sandboxed command, not CLOEXEC) past the single pid report, so a
    // read-to-EOF here would block until the whole command exits. Read the
    // one newline-terminated line the jailer reports instead.
    let mut reader = std::io::BufReader::new(f);
    let mut buf = String::new();
    reader.read_line(&mut buf).context(error::HandshakeSnafu)?;
    std::mem::forget(reader.into_inner());
    buf.trim()
        .parse()
        .ok()
        .context(error::JailerPidSnafu { pid: buf.trim().to_string() })
}

fn signal_ready(fd: RawFd) -> Result<()> {
    use std::io::Write;
    let mut f = unsafe { std::fs::File::from_raw_fd(fd) };
    f.write_all(&[1u8]).context(error::HandshakeSnafu)?;
    std::mem::forget(f);
    Ok(())
}

fn run_idmap_helper(helper: &'static str, pid: u32, triples: &[crate::idmap::IdmapTriple]) -> Result<()> {
    let mut cmd = Command::new(helper);
    cmd.arg(pid.to_string());
    for (inside, outside, count) in triples {
        cmd.arg(inside.to_string())
            .arg(outside.to_string())
            .arg(count.to_string());
    }

    let status = cmd
        .status()
        .context(error::IdmapHelperSnafu { helper, pid })?;
    ensure!(status.success(), error::IdmapHelperFailedSnafu { helper, status });
    Ok(())
}

/// Reads the deployment's subordinate-id base from the site config. Exposed
/// here (rather than only in `af-config`) since it is always consumed
/// alongside `idmap::derive`.
pub fn subordinate_base(site: &SiteConfig) -> u32 {
    site.subid_base
}
