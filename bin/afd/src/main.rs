//! `afd` — the dispatcher process. Three threads per spec §5: an inbound
//! receiver that watches the events-notify FIFO for webhook-dropped JSON
//! event files, a database worker that owns the single `Store` handle, and
//! a dispatcher that drives the MQTT broker session.

use af_config::{MqttConfig, SiteConfig};
use af_model::{Builder, Event, Job, Task};
use af_queue::Queue;
use anyhow::{Context, Result};
use clap::Parser;
use log::LevelFilter;
use std::path::{Path, PathBuf};
use std::thread;

/// Build a container directory (cdir) ready for use by `af-buildrepo`.
#[derive(Debug, Parser)]
#[clap(about, long_about = None, version)]
struct Args {
    #[clap(long = "log-level")]
    log_level: Option<LevelFilter>,

    /// Deployment-wide site configuration (MQTT credentials, agent
    /// defaults).
    #[clap(long, default_value = "/etc/af/site.toml")]
    site_config: PathBuf,

    /// Path to the SQLite database file.
    #[clap(long)]
    db: PathBuf,

    /// Directory webhook-dropped JSON event files and `notify.fifo` live
    /// in (spec §6.5).
    #[clap(long = "events-dir")]
    events_dir: PathBuf,

    /// Directory project working trees are checked out into for changeset
    /// analysis.
    #[clap(long = "checkouts-dir")]
    checkouts_dir: PathBuf,
}

/// Everything the DB worker thread might be asked to persist: either a
/// freshly arrived event to fully materialize, or a status update read off
/// the broker. Folding both into one queue keeps the single-writer-thread
/// invariant (spec §5) intact — `af-events::materialize` touches `Store`
/// just as much as the broker status updates do, so both have to land on
/// the same thread.
enum DbWork {
    Materialize(Event),
    Builder(Builder),
    Job(Job),
    Task(Task),
}

fn main() -> Result<()> {
    let args = Args::parse();
    af_config::logging::init(env!("CARGO_CRATE_NAME"), args.log_level);

    let site = SiteConfig::load(&args.site_config)
        .with_context(|| format!("failed to load site config {}", args.site_config.display()))?;

    std::fs::create_dir_all(&args.events_dir).context("failed to create events directory")?;
    std::fs::create_dir_all(&args.checkouts_dir).context("failed to create checkouts directory")?;
    let notify_path = args.events_dir.join("notify.fifo");
    ensure_fifo(&notify_path)?;

    let db_queue: Queue<DbWork> = Queue::new();
    let dispatch_queue: Queue<Job> = Queue::new();

    let db_thread = {
        let db_queue = db_queue.clone();
        let dispatch_queue = dispatch_queue.clone();
        let db_path = args.db.clone();
        let checkout = GitCheckout::new(args.checkouts_dir.clone());
        thread::spawn(move || run_db_worker(db_path, db_queue, dispatch_queue, checkout))
    };

    let _dispatcher_thread = {
        let mqtt = site.mqtt.clone();
        let dispatch_queue = dispatch_queue.clone();
        let db_queue = db_queue.clone();
        thread::spawn(move || run_dispatcher_thread(mqtt, dispatch_queue, db_queue))
    };

    inbound_loop(&notify_path, &args.events_dir, &db_queue)?;

    // The dispatcher thread blocks forever on the MQTT event loop with no
    // internal exit path short of a connection error; process exit tears
    // it down rather than joining it here.
    dispatch_queue.shutdown();
    db_queue.shutdown();
    let _ = db_thread.join();

    Ok(())
}

fn ensure_fifo(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    nix::unistd::mkfifo(path, nix::sys::stat::Mode::from_bits_truncate(0o660))
        .with_context(|| format!("failed to create notify fifo {}", path.display()))
}

/// `recv.py::recv`'s loop, minus the `startup_flush` nonblocking drain
/// (there is nothing stale to discard the first time this process opens
/// the fifo for read). Writer codes: `"1"` poll, `"0"` shutdown, `"2"`
/// liveness probe; any byte other than `"0"` just triggers a rescan.
fn inbound_loop(notify_path: &Path, events_dir: &Path, db_queue: &Queue<DbWork>) -> Result<()> {
    scan_events(events_dir, db_queue);
    loop {
        let bytes = read_fifo(notify_path)?;
        if bytes.contains(&b'0') {
            log::info!("received stop request");
            break;
        }
        log::debug!("maybe {} new payload(s)", bytes.len());
        scan_events(events_dir, db_queue);
    }
    Ok(())
}

fn read_fifo(path: &Path) -> Result<Vec<u8>> {
    use std::io::Read;
    // Opening a fifo for read blocks until a writer opens it; once that
    // writer closes, the next read returns EOF, so the fifo is reopened
    // every iteration to keep waiting for the next writer.
    let mut f = std::fs::OpenOptions::new()
        .read(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut buf = [0u8; 4096];
    let n = f.read(&mut buf).context("failed to read notify fifo")?;
    Ok(buf[..n].to_vec())
}

/// `recv.py::_load_eventpath` over every `*.json` file currently in
/// `events_dir`: parse, hand off to the DB worker, then unlink regardless
/// of whether parsing succeeded (a malformed file left in place would be
/// reprocessed, and fail, on every future poke).
fn scan_events(events_dir: &Path, db_queue: &Queue<DbWork>) {
    let Ok(entries) = std::fs::read_dir(events_dir) else {
        return;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }

        match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<Event>(&contents) {
                Ok(event) => {
                    log::info!("[{}] received event from {}", path.display(), event.project);
                    if db_queue.put(DbWork::Materialize(event)).is_err() {
                        log::error!("{}: db worker has shut down", path.display());
                    }
                }
                Err(e) => log::warn!("{}: invalid event payload: {e}", path.display()),
            },
            Err(e) => log::warn!("{}: failed to read: {e}", path.display()),
        }

        let _ = std::fs::remove_file(&path);
    }
}

/// The sole thread that ever touches `Store` (spec §5's single-writer-
/// thread rule): drains `db_queue`, persisting status updates directly and
/// routing freshly materialized events through `af_events::materialize`,
/// which both writes the Event/Job/Task rows and pushes the resulting jobs
/// onto `dispatch_queue`.
fn run_db_worker(db_path: PathBuf, db_queue: Queue<DbWork>, dispatch_queue: Queue<Job>, checkout: GitCheckout) {
    let store = match af_persistence::Store::open(&db_path) {
        Ok(store) => store,
        Err(e) => {
            log::error!("failed to open database {}: {e}", db_path.display());
            return;
        }
    };

    loop {
        let work = match db_queue.get() {
            Ok(work) => work,
            Err(_) => break,
        };

        match work {
            DbWork::Materialize(event) => match af_events::materialize(&store, &checkout, &dispatch_queue, event) {
                Ok(jobs) => log::info!("materialized {} job(s)", jobs.len()),
                Err(e) => log::error!("failed to materialize event: {e}"),
            },
            DbWork::Builder(builder) => {
                if let Err(e) = store.record_builder(&builder) {
                    log::error!("failed to persist builder {}: {e}", builder.name);
                }
            }
            DbWork::Job(job) => {
                if let Err(e) = store.set_job_status(job.id, job.status) {
                    log::error!("failed to persist job {} status: {e}", job.id);
                }
                if let Err(e) = store.set_job_builder(job.id, job.builder.as_deref()) {
                    log::error!("failed to persist job {} builder: {e}", job.id);
                }
            }
            DbWork::Task(task) => {
                if let Err(e) = store.set_task_status(task.id, task.status, task.tail.as_deref()) {
                    log::error!("failed to persist task {} status: {e}", task.id);
                }
            }
        }
    }

    log::info!("db worker exiting");
}

/// Owns its own single-threaded `tokio` runtime (spec §5's "dispatcher,
/// running the broker client loop on its own network thread"). Bridges
/// `dispatch_queue` (a blocking `af-queue::Queue`) onto the async MQTT loop
/// via a blocking task and an mpsc channel, per `af_broker::run_dispatcher`'s
/// `new_jobs` parameter.
fn run_dispatcher_thread(mqtt: MqttConfig, dispatch_queue: Queue<Job>, db_queue: Queue<DbWork>) {
    let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("failed to start dispatcher runtime: {e}");
            return;
        }
    };

    rt.block_on(async move {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Job>();
        tokio::task::spawn_blocking(move || loop {
            match dispatch_queue.get() {
                Ok(job) => {
                    if tx.send(job).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        });

        let mut dispatcher = af_broker::Dispatcher::new();
        let on_db_write = move |incoming: &af_broker::Incoming| {
            let work = match incoming {
                af_broker::Incoming::Builder(b) => DbWork::Builder(b.clone()),
                af_broker::Incoming::Job(j) => DbWork::Job(j.clone()),
                af_broker::Incoming::Task(t) => DbWork::Task(t.clone()),
            };
            let _ = db_queue.put(work);
        };

        if let Err(e) = af_broker::run_dispatcher(&mqtt, "afd", &mut dispatcher, Some(rx), on_db_write).await {
            log::error!("dispatcher loop exited: {e}");
        }
    });
}

/// Minimal `af_events::Checkout`: `git clone`/`git fetch` + `git checkout`
/// into `root/<project>`, grounded on the source's module-level `git_init`
/// function. Git hosting/webhook translation itself stays out of scope
/// (spec §1's "git clone glue... out of scope"); this is just enough shell-
/// out to give `af-events` a working tree to run `af-changes`/`af-maintainer`/
/// `af-arch` against.
struct GitCheckout {
    root: PathBuf,
}

impl GitCheckout {
    fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

impl af_events::Checkout for GitCheckout {
    fn sync(&self, event: &Event) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let dir = self.dir(event);
        if dir.join(".git").exists() {
            duct::cmd!("git", "-C", &dir, "fetch", "--quiet", &event.clone_url, &event.revision).run()?;
        } else {
            std::fs::create_dir_all(&self.root)?;
            duct::cmd!("git", "clone", "--quiet", &event.clone_url, &dir).run()?;
        }
        duct::cmd!("git", "-C", &dir, "checkout", "--quiet", &event.revision).run()?;
        Ok(())
    }

    fn dir(&self, event: &Event) -> PathBuf {
        self.root.join(&event.project)
    }
}
