//! Event materialization: turns one incoming `Event` into its `Job`/`Task`
//! rows and enqueues the resulting jobs for dispatch (spec §4.7). Grounded
//! on `apkfoundry/objects.py::Event.db_process` and the `Push`/
//! `MergeRequest` `_calc_startdirs` split.

use af_model::{Event, EventType, Job};
use af_persistence::Store;
use af_queue::Queue;
use snafu::{ResultExt, Snafu};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to sync the project checkout"))]
    Checkout { source: Box<dyn std::error::Error + Send + Sync> },

    #[snafu(display("{helper} exited with a failure status"))]
    HelperFailed { helper: &'static str, source: std::io::Error },

    #[snafu(display("failed to parse {helper} output"))]
    HelperOutput { helper: &'static str },

    #[snafu(display("persistence error during event materialization"))]
    Store { source: af_persistence::Error },

    #[snafu(display("failed to enqueue job {job_id} for dispatch"))]
    Enqueue { job_id: u64 },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The external seam for obtaining a working tree at a given revision.
/// `af-events`'s job is producing rows and enqueuing dispatch, not owning
/// clone machinery (spec §1's "git clone glue" stays out of core); callers
/// supply a `Checkout` implementation that does the actual `git fetch`/
/// `git checkout` work, mirroring the source's direct call to its own
/// module-level `git_init` function.
pub trait Checkout {
    fn sync(&self, event: &Event) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;
    fn dir(&self, event: &Event) -> std::path::PathBuf;
}

fn run_helper(helper: &'static str, dir: &Path, args: &[&str]) -> Result<String> {
    duct::cmd(helper, args)
        .dir(dir)
        .stdout_capture()
        .run()
        .map(|output| String::from_utf8_lossy(&output.stdout).into_owned())
        .context(HelperFailedSnafu { helper })
}

/// `af-changes -p <target> <before> <after>` (push) /
/// `af-changes -m <target> <revision>` (merge request), per
/// `Push._calc_startdirs`/`MergeRequest._calc_startdirs`.
fn calc_startdirs(event: &Event, dir: &Path) -> Result<Vec<String>> {
    let args: Vec<&str> = match event.event_type {
        EventType::Push => {
            let before = event.before.as_deref().unwrap_or(&event.revision);
            vec!["-p", &event.target_branch, before, &event.revision]
        }
        EventType::Mr => vec!["-m", &event.target_branch, &event.revision],
        EventType::Manual => vec!["-p", &event.target_branch, &event.revision, &event.revision],
    };

    let stdout = run_helper("af-changes", dir, &args)?;
    Ok(stdout.lines().map(str::trim).filter(|l| !l.is_empty()).map(str::to_string).collect())
}

/// `af-maintainer <startdir>/APKBUILD ...`, per `Event._calc_maintainers`.
fn calc_maintainers(startdirs: &[String], dir: &Path) -> Result<BTreeMap<String, String>> {
    if startdirs.is_empty() {
        return Ok(BTreeMap::new());
    }

    let apkbuilds: Vec<String> = startdirs.iter().map(|s| format!("{s}/APKBUILD")).collect();
    let args: Vec<&str> = apkbuilds.iter().map(String::as_str).collect();
    let stdout = run_helper("af-maintainer", dir, &args)?;

    let mut maintainers = BTreeMap::new();
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((startdir, maintainer)) = line.split_once(char::is_whitespace) else {
            continue;
        };
        maintainers.insert(startdir.to_string(), maintainer.trim().to_string());
    }
    Ok(maintainers)
}

/// `af-arch <target> <startdir> ...`, per `Event._calc_arches`.
fn calc_arches(event: &Event, startdirs: &[String], dir: &Path) -> Result<BTreeMap<String, Vec<String>>> {
    if startdirs.is_empty() {
        return Ok(BTreeMap::new());
    }

    let mut args: Vec<&str> = vec![&event.target_branch];
    args.extend(startdirs.iter().map(String::as_str));
    let stdout = run_helper("af-arch", dir, &args)?;

    let mut arches: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((arch, startdir)) = line.split_once(char::is_whitespace) else {
            continue;
        };
        arches.entry(arch.to_string()).or_default().push(startdir.trim().to_string());
    }
    Ok(arches)
}

/// Materializes one event into its Job/Task rows and enqueues the resulting
/// jobs on `dispatch_queue`, per the six numbered steps of spec §4.7:
/// persist the event row, sync the checkout, compute changed startdirs,
/// look up maintainers and target arches, generate jobs, generate tasks.
pub fn materialize(
    store: &Store,
    checkout: &dyn Checkout,
    dispatch_queue: &Queue<Job>,
    event: Event,
) -> Result<Vec<Job>> {
    let event = store.record_event(event).context(StoreSnafu)?;
    log::info!("[{}] persisted event", event.id);

    checkout.sync(&event).context(CheckoutSnafu)?;
    let dir = checkout.dir(&event);

    log::info!("[{}] analyzing changeset", event.id);
    let startdirs = calc_startdirs(&event, &dir)?;

    log::info!("[{}] retrieving maintainers", event.id);
    let maintainers = calc_maintainers(&startdirs, &dir)?;

    log::info!("[{}] generating architecture list", event.id);
    let arches = calc_arches(&event, &startdirs, &dir)?;

    if arches.is_empty() {
        log::info!("[{}] no jobs generated", event.id);
        return Ok(Vec::new());
    }

    log::info!("[{}] adding jobs to database", event.id);
    let mut jobs = Vec::with_capacity(arches.len());
    for (arch, arch_startdirs) in &arches {
        let mut job = store.record_job(&event, arch).context(StoreSnafu)?;

        log::info!("[{}] adding tasks to database", event.id);
        for startdir in arch_startdirs {
            let Some((repo, pkg)) = startdir.split_once('/') else {
                log::warn!("malformed startdir {startdir:?}, skipping");
                continue;
            };
            let maintainer = maintainers.get(startdir).map(String::as_str);
            let task = store.record_task(&job, repo, pkg, maintainer).context(StoreSnafu)?;
            job.tasks.push(task);
        }

        jobs.push(job);
    }

    for job in &jobs {
        dispatch_queue.put(job.clone()).map_err(|_| Error::Enqueue { job_id: job.id })?;
    }

    Ok(jobs)
}

#[cfg(test)]
mod test {
    use super::*;
    use af_model::Status;
    use std::path::PathBuf;

    struct NoopCheckout;
    impl Checkout for NoopCheckout {
        fn sync(&self, _event: &Event) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Ok(())
        }
        fn dir(&self, _event: &Event) -> PathBuf {
            PathBuf::from(".")
        }
    }

    fn sample_event() -> Event {
        Event {
            id: 0,
            project: "core".into(),
            event_type: EventType::Mr,
            clone_url: "https://example.invalid/core.git".into(),
            target_branch: "3.18-stable".into(),
            revision: "deadbeef".into(),
            user: "tester".into(),
            reason: "merge request".into(),
            mr_id: Some(7),
            mr_clone_url: None,
            mr_branch: None,
            before: None,
            status: Status::NEW,
        }
    }

    #[test]
    fn arches_group_startdirs_by_architecture() {
        let event = sample_event();
        let stdout = "x86_64 main/pkgconf\naarch64 main/pkgconf\nx86_64 main/libfoo\n";
        let mut arches: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for line in stdout.lines() {
            let (arch, startdir) = line.split_once(char::is_whitespace).unwrap();
            arches.entry(arch.to_string()).or_default().push(startdir.to_string());
        }
        assert_eq!(arches.get("x86_64").unwrap().len(), 2);
        assert_eq!(arches.get("aarch64").unwrap().len(), 1);
        let _ = event;
    }

    #[test]
    fn maintainers_parse_one_entry_per_line() {
        let stdout = "main/pkgconf Jane Doe <jane@example.invalid>\n";
        let (startdir, maintainer) = stdout.trim().split_once(char::is_whitespace).unwrap();
        assert_eq!(startdir, "main/pkgconf");
        assert_eq!(maintainer, "Jane Doe <jane@example.invalid>");
    }
}
