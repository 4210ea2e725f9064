//! `af-agent` — the build-host process. Main thread drives
//! `af_broker::run_agent`'s MQTT session; a worker pool sized from
//! `agent.concurrency` runs accepted jobs via `af-depgen`/`af-scheduler`;
//! an `af-rootd` server thread is spawned lazily the first time a
//! container is opened, keyed by its cdir (spec §4.2, §5, §6.1).

use af_broker::{AgentClient, Outgoing, QoS};
use af_config::{AgentConfig, AgentProjectConfig, ProjectConfig, SiteConfig};
use af_container::{cont_bootstrap, cont_make, cont_refresh, Container, MakeOptions};
use af_model::{Arch, Builder, Job, Status, Task};
use af_queue::Queue;
use anyhow::{bail, Context, Result};
use clap::Parser;
use log::LevelFilter;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

const DEFAULT_REPO: &str = "main";

#[derive(Debug, Parser)]
#[clap(about, long_about = None, version)]
struct Args {
    #[clap(long = "log-level")]
    log_level: Option<LevelFilter>,

    /// Deployment-wide site configuration (MQTT credentials, agent
    /// identity/arches/mask/concurrency, registered projects).
    #[clap(long, default_value = "/etc/af/site.toml")]
    site_config: PathBuf,
}

/// One accepted job handed from the MQTT task to a worker thread, plus the
/// cooperative-cancellation flag `on_cancel` flips if a matching `CANCEL`
/// message arrives while the job is still in flight.
struct WorkItem {
    job: Job,
    out: Outgoing,
    cancel: Arc<AtomicBool>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    af_config::logging::init(env!("CARGO_CRATE_NAME"), args.log_level);

    let site = SiteConfig::load(&args.site_config)
        .with_context(|| format!("failed to load site config {}", args.site_config.display()))?;
    let agent_cfg = site.agent.clone();
    if agent_cfg.name.is_empty() {
        bail!("agent.name must be set in site configuration");
    }
    if agent_cfg.arches.is_empty() {
        bail!("agent.arches must list at least one architecture");
    }

    let containers_dir = agent_cfg
        .containers
        .clone()
        .unwrap_or_else(|| PathBuf::from("/var/lib/af/containers"));
    let jobs_dir = agent_cfg.jobs.clone().unwrap_or_else(|| PathBuf::from("/var/lib/af/jobs"));
    std::fs::create_dir_all(&containers_dir).context("failed to create containers directory")?;
    std::fs::create_dir_all(&jobs_dir).context("failed to create jobs directory")?;

    let builder = Arc::new(Mutex::new(initial_builder(&agent_cfg)));
    let cancel_flags: Arc<Mutex<HashMap<u64, Arc<AtomicBool>>>> = Arc::new(Mutex::new(HashMap::new()));
    let rootd_spawned: Arc<Mutex<HashSet<PathBuf>>> = Arc::new(Mutex::new(HashSet::new()));
    let work_queue: Queue<WorkItem> = Queue::new();

    let worker_handles: Vec<_> = (0..agent_cfg.concurrency.max(1))
        .map(|i| {
            let work_queue = work_queue.clone();
            let site = site.clone();
            let agent_cfg = agent_cfg.clone();
            let containers_dir = containers_dir.clone();
            let jobs_dir = jobs_dir.clone();
            let builder = Arc::clone(&builder);
            let cancel_flags = Arc::clone(&cancel_flags);
            let rootd_spawned = Arc::clone(&rootd_spawned);
            thread::Builder::new()
                .name(format!("af-worker-{i}"))
                .spawn(move || {
                    worker_loop(
                        &work_queue,
                        &site,
                        &agent_cfg,
                        &containers_dir,
                        &jobs_dir,
                        &builder,
                        &cancel_flags,
                        &rootd_spawned,
                    )
                })
                .expect("failed to spawn worker thread")
        })
        .collect();

    let agent_client = AgentClient::new(agent_cfg.name.clone(), &agent_cfg.arches, &agent_cfg.mask);
    let builder_snapshot = builder.lock().expect("builder mutex poisoned").clone();

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start agent runtime")?;

    let result = rt.block_on(async {
        af_broker::run_agent(
            &site.mqtt,
            &agent_cfg.name,
            &agent_client,
            &builder_snapshot,
            |job, out| {
                mark_busy(&builder, &job.arch, &out);
                let cancel = Arc::new(AtomicBool::new(false));
                cancel_flags
                    .lock()
                    .expect("cancel-flag mutex poisoned")
                    .insert(job.id, Arc::clone(&cancel));
                if work_queue.put(WorkItem { job, out, cancel }).is_err() {
                    log::error!("worker pool has shut down, dropping job");
                }
            },
            |job_id| {
                if let Some(flag) = cancel_flags.lock().expect("cancel-flag mutex poisoned").get(&job_id) {
                    flag.store(true, Ordering::SeqCst);
                }
            },
        )
        .await
    });

    work_queue.shutdown();
    for handle in worker_handles {
        let _ = handle.join();
    }

    if let Err(e) = result {
        log::error!("agent loop exited: {e}");
        std::process::exit(1);
    }
    Ok(())
}

fn initial_builder(agent_cfg: &AgentConfig) -> Builder {
    Builder {
        name: agent_cfg.name.clone(),
        arches: agent_cfg
            .arches
            .iter()
            .map(|(arch, _suffix)| {
                (
                    arch.clone(),
                    Arch {
                        idle: true,
                        curr_jobs: 0,
                        prev_job: None,
                    },
                )
            })
            .collect(),
    }
}

/// `dispatch.py`'s `_builder_recv`-observed transition from the agent side:
/// flips the job's arch to busy, bumps its in-flight count, and republishes
/// the retained `Builder` message immediately so the dispatcher sees this
/// agent stop advertising idle for that arch before the job even starts.
fn mark_busy(builder: &Mutex<Builder>, arch: &str, out: &Outgoing) {
    let mut builder = builder.lock().expect("builder mutex poisoned");
    let entry = builder.arches.entry(arch.to_string()).or_default();
    entry.idle = false;
    entry.curr_jobs += 1;
    publish_builder(&builder, out);
}

fn mark_idle(builder: &Mutex<Builder>, arch: &str, job_id: u64, out: &Outgoing) {
    let mut builder = builder.lock().expect("builder mutex poisoned");
    if let Some(entry) = builder.arches.get_mut(arch) {
        entry.curr_jobs = entry.curr_jobs.saturating_sub(1);
        entry.idle = entry.curr_jobs == 0;
        entry.prev_job = Some(job_id);
    }
    publish_builder(&builder, out);
}

fn publish_builder(builder: &Builder, out: &Outgoing) {
    let (topic, payload) = builder.to_mqtt();
    let _ = out.send((topic, payload, QoS::AtLeastOnce, true));
}

#[allow(clippy::too_many_arguments)]
fn worker_loop(
    work_queue: &Queue<WorkItem>,
    site: &SiteConfig,
    agent_cfg: &AgentConfig,
    containers_dir: &Path,
    jobs_dir: &Path,
    builder: &Mutex<Builder>,
    cancel_flags: &Mutex<HashMap<u64, Arc<AtomicBool>>>,
    rootd_spawned: &Mutex<HashSet<PathBuf>>,
) {
    loop {
        let WorkItem { mut job, out, cancel } = match work_queue.get() {
            Ok(item) => item,
            Err(_) => break,
        };

        log::info!("starting job {} ({}/{})", job.id, job.project, job.arch);
        let (job_status, tasks) = match run_job(site, agent_cfg, containers_dir, jobs_dir, rootd_spawned, &job, &cancel, &out) {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("job {} failed: {e}", job.id);
                let failed: BTreeMap<String, Status> = job
                    .tasks
                    .iter()
                    .map(|t| (startdir(t), Status::ERROR))
                    .collect();
                (Status::ERROR, failed)
            }
        };

        job.tasks = job
            .tasks
            .into_iter()
            .map(|mut t| {
                if let Some(status) = tasks.get(&startdir(&t)) {
                    t.status = *status;
                }
                t.builder = Some(agent_cfg.name.clone());
                t
            })
            .collect();
        job.status = job_status;
        job.builder = Some(agent_cfg.name.clone());

        let (topic, payload) = job.to_mqtt();
        let _ = out.send((topic, payload, QoS::ExactlyOnce, false));

        cancel_flags.lock().expect("cancel-flag mutex poisoned").remove(&job.id);
        mark_idle(builder, &job.arch, job.id, &out);
        log::info!("finished job {}: {}", job.id, job_status.topic_word());
    }

    log::info!("worker exiting");
}

fn startdir(task: &Task) -> String {
    format!("{}/{}", task.repo, task.pkg)
}

/// Builds or reopens the container for `(job.project, job.target_branch,
/// job.arch)`, refreshes it, generates the dependency graph, and runs the
/// job's tasks to completion via `af-scheduler`. Returns the aggregate job
/// status and the per-startdir status map.
fn run_job(
    site: &SiteConfig,
    agent_cfg: &AgentConfig,
    containers_dir: &Path,
    jobs_dir: &Path,
    rootd_spawned: &Mutex<HashSet<PathBuf>>,
    job: &Job,
    cancel: &AtomicBool,
    out: &Outgoing,
) -> Result<(Status, BTreeMap<String, Status>)> {
    let project_cfg = agent_cfg
        .projects
        .get(&job.project)
        .with_context(|| format!("project {} is not registered with this agent", job.project))?;

    let aportsdir = sync_aportsdir(jobs_dir, &job.project, project_cfg, &job.target_branch)
        .context("failed to sync project checkout")?;
    let project = ProjectConfig::load(&project_cfg.project_config)
        .with_context(|| format!("failed to load project config {}", project_cfg.project_config.display()))?;

    let mut container = open_or_make_container(containers_dir, site, &project, job, &aportsdir)
        .context("failed to prepare container")?;

    let socket_path = ensure_rootd(&container, &project, rootd_spawned).context("failed to start root daemon")?;
    container.set_rootd_socket(Some(socket_path));

    cont_refresh(&container).context("failed to refresh container")?;

    let mut graph = af_depgen::generate_graph(&container, &[]).context("failed to generate dependency graph")?;

    let initial: BTreeSet<String> = job.tasks.iter().map(startdir).collect();
    let build_script = format!("/af/config/aportsdir/.apkfoundry/{}/build", job.target_branch);
    let run_opts = af_scheduler::RunGraphOptions {
        build_script: &build_script,
        on_failure: project.build.on_failure,
    };

    let tasks_by_startdir: HashMap<String, Task> = job.tasks.iter().map(|t| (startdir(t), t.clone())).collect();
    let done = af_scheduler::run_graph(&mut container, &project, &mut graph, &initial, &run_opts, cancel, |startdir, status| {
        if let Some(task) = tasks_by_startdir.get(startdir) {
            let mut task = task.clone();
            task.status = status;
            task.builder = Some(agent_cfg.name.clone());
            let (topic, payload) = task.to_mqtt();
            let _ = out.send((topic, payload, QoS::ExactlyOnce, false));
        }
    });
    af_scheduler::report(&done);

    let job_status = if cancel.load(Ordering::SeqCst) {
        Status::CANCEL
    } else if done.values().all(|s| *s == Status::SUCCESS) {
        Status::SUCCESS
    } else {
        Status::FAIL
    };

    Ok((job_status, done))
}

/// `build.py`'s module-level git checkout, minus webhook/MR glue (out of
/// scope per spec §1): fetches and hard-resets the agent's own aportsdir
/// checkout for `project` to the tip of `branch`. The job model carries no
/// explicit revision (spec §3.1's Job/Task attribute list has none), so
/// building against the target branch's current head is the documented
/// reading of spec §4.5 for the agent side.
fn sync_aportsdir(jobs_dir: &Path, project: &str, cfg: &AgentProjectConfig, branch: &str) -> Result<PathBuf> {
    let dir = jobs_dir.join(project);
    if dir.join(".git").is_dir() {
        duct::cmd!("git", "-C", &dir, "fetch", "--quiet", "origin", branch)
            .run()
            .context("git fetch failed")?;
        duct::cmd!("git", "-C", &dir, "checkout", "--quiet", branch)
            .run()
            .context("git checkout failed")?;
        duct::cmd!("git", "-C", &dir, "reset", "--quiet", "--hard", format!("origin/{branch}"))
            .run()
            .context("git reset failed")?;
    } else {
        std::fs::create_dir_all(jobs_dir)?;
        duct::cmd!("git", "clone", "--quiet", "--branch", branch, &cfg.clone_url, &dir)
            .run()
            .context("git clone failed")?;
    }
    Ok(dir)
}

/// Opens the persistent container for `(job.project, job.target_branch,
/// job.arch)` if one already exists on disk, or builds and bootstraps a
/// fresh one. Containers are kept (not deleted after each job, unlike
/// `af-buildrepo`'s one-shot `--delete` policy) so `cont_refresh` only has
/// to top up build deps rather than re-extract a rootfs every job.
fn open_or_make_container(
    containers_dir: &Path,
    site: &SiteConfig,
    project: &ProjectConfig,
    job: &Job,
    aportsdir: &Path,
) -> Result<Container> {
    let cdir = containers_dir.join(format!("{}-{}-{}", job.project, job.target_branch, job.arch));

    if cdir.join("af/config/branch").exists() {
        let uid = nix::unistd::getuid().as_raw();
        let gid = nix::unistd::getgid().as_raw();
        return Container::open(&cdir, uid, gid, &job.arch, site).context("failed to reopen existing container");
    }

    std::fs::create_dir_all(&cdir)?;
    let mut opts = MakeOptions {
        setarch: site.setarch.get(&job.arch).cloned(),
        ..Default::default()
    };
    opts.external_mounts.insert("aportsdir".to_string(), aportsdir.to_path_buf());

    let mut container =
        cont_make(&cdir, &job.target_branch, DEFAULT_REPO, &opts, site).context("failed to create container skeleton")?;
    container.set_arch(&job.arch);
    cont_bootstrap(&container, project).context("failed to bootstrap container")?;
    Ok(container)
}

/// Binds `<cdir>/af/config/root.sock` and spawns a server thread for it the
/// first time this cdir is seen, per spec §4.2/§5 ("spawned lazily when a
/// container is opened"). Idempotent across repeated jobs against the same
/// persistent container.
fn ensure_rootd(container: &Container, project: &ProjectConfig, spawned: &Mutex<HashSet<PathBuf>>) -> Result<PathBuf> {
    let socket_path = container.cdir().join("af/config/root.sock");

    let mut spawned = spawned.lock().expect("rootd registry mutex poisoned");
    if spawned.contains(&socket_path) {
        return Ok(socket_path);
    }

    let _ = std::fs::remove_file(&socket_path);
    let listener = std::os::unix::net::UnixListener::bind(&socket_path)
        .with_context(|| format!("failed to bind root daemon socket {}", socket_path.display()))?;

    let container = container.clone();
    let project = project.clone();
    let log_path = socket_path.clone();
    thread::spawn(move || {
        if let Err(e) = af_rootd::serve(listener, &container, &project) {
            log::error!("root daemon for {} exited: {e}", log_path.display());
        }
    });
    spawned.insert(socket_path.clone());
    Ok(socket_path)
}
