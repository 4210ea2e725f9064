//! `af-mkchroot` — builds a container directory from scratch: skeleton,
//! mount symlinks, rootfs download/verify/extract, and the project
//! bootstrap script (spec §6.1, §4.3.2).

use af_config::{ProjectConfig, SiteConfig};
use af_container::{cont_bootstrap, cont_make, MakeOptions};
use anyhow::{Context, Result};
use clap::Parser;
use log::LevelFilter;
use std::path::PathBuf;

const DEFAULT_REPO: &str = "main";

/// Build a container directory (cdir) ready for use by `af-buildrepo`.
#[derive(Debug, Parser)]
#[clap(about, long_about = None, version)]
struct Args {
    /// Set the logging level. One of [off|error|warn|info|debug|trace].
    /// Defaults to info. You can also leave this unset and use RUST_LOG.
    #[clap(long = "log-level")]
    log_level: Option<LevelFilter>,

    /// Target build architecture; defaults to the host's own.
    #[clap(long)]
    arch: Option<String>,

    /// Branch of the recipe tree this container targets.
    #[clap(long, default_value = "master")]
    branch: String,

    /// External APK cache directory, symlinked at `af/config/cache`.
    #[clap(long)]
    cache: Option<PathBuf>,

    /// External repodest directory; internal mount point used if absent.
    #[clap(long)]
    repodest: Option<PathBuf>,

    /// Setarch personality to run the sandbox under, e.g. `linux32`.
    #[clap(long)]
    setarch: Option<String>,

    /// External srcdest directory; internal mount point used if absent.
    #[clap(long)]
    srcdest: Option<PathBuf>,

    /// Deployment-wide site configuration (subordinate-id base, setarch
    /// table, MQTT credentials).
    #[clap(long, default_value = "/etc/af/site.toml")]
    site_config: PathBuf,

    /// Per-branch project configuration (repo arches, rootfs source).
    #[clap(long)]
    project_config: PathBuf,

    /// The container directory to create.
    cdir: PathBuf,

    /// External aportsdir (recipe tree checkout) to bind into the
    /// container.
    aportsdir: PathBuf,
}

fn main() -> Result<()> {
    let args = Args::parse();
    af_config::logging::init(env!("CARGO_CRATE_NAME"), args.log_level);

    let site = SiteConfig::load(&args.site_config)
        .with_context(|| format!("failed to load site config {}", args.site_config.display()))?;
    let project = ProjectConfig::load(&args.project_config)
        .with_context(|| format!("failed to load project config {}", args.project_config.display()))?;

    let mut external_mounts = std::collections::BTreeMap::new();
    external_mounts.insert("aportsdir".to_string(), args.aportsdir.clone());
    if let Some(repodest) = &args.repodest {
        external_mounts.insert("repodest".to_string(), repodest.clone());
    }
    if let Some(srcdest) = &args.srcdest {
        external_mounts.insert("srcdest".to_string(), srcdest.clone());
    }

    let opts = MakeOptions {
        external_mounts,
        cache: args.cache.clone(),
        setarch: args.setarch.clone().or_else(|| {
            args.arch.as_ref().and_then(|arch| site.setarch.get(arch).cloned())
        }),
    };

    log::info!("building container at {}", args.cdir.display());
    let mut container = cont_make(&args.cdir, &args.branch, DEFAULT_REPO, &opts, &site)
        .context("failed to create the container skeleton")?;
    if let Some(arch) = &args.arch {
        container.set_arch(arch);
    }

    log::info!("bootstrapping rootfs for {}", args.arch.as_deref().unwrap_or("host"));
    cont_bootstrap(&container, &project).context("bootstrap failed")?;

    log::info!("container ready at {}", args.cdir.display());
    Ok(())
}
