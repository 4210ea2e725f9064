//! `af-buildrepo` — builds a container, computes the dependency-ordered
//! build list, and runs it to completion (spec §6.1, §4.6).

use af_config::{ProjectConfig, SiteConfig};
use af_container::{cont_bootstrap, cont_make, MakeOptions};
use anyhow::{bail, Context, Result};
use clap::Parser;
use log::LevelFilter;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

const DEFAULT_REPO: &str = "main";

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum DeletePolicy {
    Always,
    OnSuccess,
    Never,
}

/// Build a set of startdirs inside a fresh container.
#[derive(Debug, Parser)]
#[clap(about, long_about = None, version)]
struct Args {
    #[clap(long = "log-level")]
    log_level: Option<LevelFilter>,

    /// APK architecture name (default: the host's own).
    #[clap(long)]
    arch: Option<String>,

    /// External APK cache directory.
    #[clap(long = "cache-apk")]
    cache_apk: Option<PathBuf>,

    /// External source file cache directory.
    #[clap(long = "cache-src")]
    cache_src: Option<PathBuf>,

    /// Use this directory as the container root instead of a fresh
    /// temporary one.
    #[clap(long = "directory")]
    directory: Option<PathBuf>,

    /// setarch(8) architecture name (default: from site configuration).
    #[clap(long)]
    setarch: Option<String>,

    /// Project git working tree to build from.
    #[clap(short = 'a', long = "aportsdir")]
    aportsdir: Option<PathBuf>,

    /// Git repository URL to clone if `--aportsdir` is not given.
    #[clap(short = 'g', long = "git-url")]
    git_url: Option<String>,

    /// Branch to build; detected from `--aportsdir` if omitted.
    #[clap(long)]
    branch: Option<String>,

    /// Deployment-wide site configuration.
    #[clap(long, default_value = "/etc/af/site.toml")]
    site_config: PathBuf,

    /// Per-branch project configuration.
    #[clap(long)]
    project_config: PathBuf,

    /// When to delete the container.
    #[clap(short = 'D', long, value_enum, default_value = "never")]
    delete: DeletePolicy,

    /// Only show what would be built, then exit.
    #[clap(long)]
    dry_run: bool,

    /// Accepted for CLI-surface parity; dropping into an interactive shell
    /// on task failure is not supported by this build driver.
    #[clap(short = 'i', long)]
    interactive: bool,

    /// Git revision range to compute changed APKBUILDs from.
    #[clap(short = 'r', long = "rev-range")]
    rev_range: Option<String>,

    /// Alternative build script, an absolute path under the container root.
    #[clap(long)]
    build_script: Option<String>,

    /// Package destination directory.
    repodest: PathBuf,

    /// STARTDIRs to build, in addition to any discovered via `--rev-range`.
    startdirs: Vec<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    af_config::logging::init(env!("CARGO_CRATE_NAME"), args.log_level);

    let rc = run(args)?;
    std::process::exit(rc);
}

fn run(mut args: Args) -> Result<i32> {
    if args.dry_run {
        args.delete = DeletePolicy::Always;
    }

    if args.aportsdir.is_some() == args.git_url.is_some() {
        bail!("specify exactly one of --aportsdir or --git-url");
    }
    if args.interactive {
        bail!("--interactive is not supported");
    }

    let site = SiteConfig::load(&args.site_config)
        .with_context(|| format!("failed to load site config {}", args.site_config.display()))?;

    let cdir = match &args.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            dir.clone()
        }
        None => tempfile::Builder::new()
            .prefix("af-buildrepo-")
            .suffix(".af")
            .tempdir()
            .context("failed to create a temporary container directory")?
            .into_path(),
    };

    if let Some(url) = &args.git_url {
        let branch = args.branch.clone().unwrap_or_else(|| "master".to_string());
        let aportsdir = cdir.join("af/aportsdir");
        std::fs::create_dir_all(&aportsdir)?;
        log::info!("cloning {url}");
        duct::cmd!("git", "clone", url, &aportsdir).run().context("git clone failed")?;
        duct::cmd!("git", "-C", &aportsdir, "checkout", &branch)
            .run()
            .context("git checkout failed")?;
        args.aportsdir = Some(aportsdir);
        args.branch = Some(branch);
    }

    let aportsdir = args.aportsdir.clone().expect("validated above");
    let branch = match &args.branch {
        Some(b) => b.clone(),
        None => detect_branch(&aportsdir)?,
    };

    let project = ProjectConfig::load(&args.project_config)
        .with_context(|| format!("failed to load project config {}", args.project_config.display()))?;

    let arch = args.arch.clone().unwrap_or_else(default_arch);
    let build_script = args
        .build_script
        .clone()
        .unwrap_or_else(|| format!("/af/config/aportsdir/.apkfoundry/{branch}/build"));

    let mut startdirs: BTreeSet<String> = args.startdirs.iter().cloned().collect();
    if let Some(rev_range) = &args.rev_range {
        let changed = changed_startdirs(&aportsdir, rev_range)?;
        for startdir in filter_startdirs(&project, &arch, changed, &startdirs) {
            startdirs.insert(startdir);
        }
    }

    if startdirs.is_empty() {
        log::info!("no packages to build");
        return cleanup(0, None, args.delete);
    }

    if args.dry_run {
        for s in &startdirs {
            log::info!("would build: {s}");
        }
        return cleanup(0, None, args.delete);
    }

    std::fs::create_dir_all(&args.repodest).context("failed to create repodest")?;

    let mut opts = MakeOptions {
        setarch: args.setarch.clone().or_else(|| site.setarch.get(&arch).cloned()),
        ..Default::default()
    };
    opts.external_mounts.insert("aportsdir".to_string(), aportsdir.clone());
    opts.external_mounts.insert("repodest".to_string(), args.repodest.clone());
    if let Some(cache_src) = &args.cache_src {
        opts.external_mounts.insert("srcdest".to_string(), cache_src.clone());
    }
    opts.cache = args.cache_apk.clone();

    log::info!("bootstrapping container");
    // `cont_make`'s `repo` argument is only the initial default written to
    // `af/config/repo`; every task overrides it via `Container::set_repo`
    // once its own startdir (and thus real repo) is known (spec §4.5 step 5).
    let mut container = cont_make(&cdir, &branch, DEFAULT_REPO, &opts, &site)
        .context("failed to create container skeleton")?;
    container.set_arch(&arch);
    if let Err(e) = cont_bootstrap(&container, &project) {
        log::error!("failed to bootstrap container: {e}");
        return cleanup(1, Some(&cdir), args.delete);
    }

    log::info!("generating dependency graph");
    let mut graph = match af_depgen::generate_graph(&container, &[]) {
        Ok(graph) => graph,
        Err(e) => {
            log::error!("failed to generate dependency graph: {e}");
            return cleanup(1, Some(&cdir), args.delete);
        }
    };

    let cancel = AtomicBool::new(false);
    let run_opts = af_scheduler::RunGraphOptions {
        build_script: &build_script,
        on_failure: project.build.on_failure,
    };

    let done = af_scheduler::run_graph(&mut container, &project, &mut graph, &startdirs, &run_opts, &cancel, |_, _| {});
    af_scheduler::report(&done);
    let rc = af_scheduler::exit_code(&done);

    cleanup(rc, Some(&cdir), args.delete)
}

fn default_arch() -> String {
    std::env::consts::ARCH.to_string()
}

fn detect_branch(aportsdir: &Path) -> Result<String> {
    let out = duct::cmd!("git", "-C", aportsdir, "rev-parse", "--abbrev-ref", "HEAD")
        .read()
        .context("failed to detect branch from aportsdir")?;
    Ok(out.trim().to_string())
}

/// `build.py::changed_pkgs`: `git diff-tree` over `*/*/APKBUILD` paths in
/// `rev_range`, stripped back down to startdirs.
fn changed_startdirs(aportsdir: &Path, rev_range: &str) -> Result<Vec<String>> {
    let mut args: Vec<String> = vec![
        "-C".into(),
        aportsdir.display().to_string(),
        "diff-tree".into(),
        "-r".into(),
        "--name-only".into(),
        "--diff-filter".into(),
        "dxu".into(),
    ];
    args.extend(rev_range.split_whitespace().map(str::to_string));
    args.push("--".into());
    args.push("*/*/APKBUILD".into());

    let out = duct::cmd("git", &args).read().context("git diff-tree failed")?;
    Ok(out
        .lines()
        .filter_map(|l| l.strip_suffix("/APKBUILD"))
        .map(str::to_string)
        .collect())
}

/// `build.py::_filter_list`: drop startdirs whose arch isn't enabled for
/// this branch, or that are in the skip list.
fn filter_startdirs(
    project: &ProjectConfig,
    arch: &str,
    startdirs: Vec<String>,
    already: &BTreeSet<String>,
) -> Vec<String> {
    startdirs
        .into_iter()
        .filter(|s| !already.contains(s))
        .filter(|s| {
            if !project.repo.arch.iter().any(|a| a == arch) {
                log::debug!("{s} - not enabled for {arch}");
                return false;
            }
            if project.is_skipped(s) {
                log::debug!("{s} - package skipped for {arch}");
                return false;
            }
            true
        })
        .collect()
}

fn cleanup(rc: i32, cdir: Option<&Path>, delete: DeletePolicy) -> Result<i32> {
    let should_delete = match (delete, rc) {
        (DeletePolicy::Always, _) => true,
        (DeletePolicy::OnSuccess, 0) => true,
        _ => false,
    };
    if should_delete {
        if let Some(cdir) = cdir {
            log::info!("deleting container {}", cdir.display());
            let _ = std::fs::remove_dir_all(cdir);
        }
    }
    Ok(rc)
}
