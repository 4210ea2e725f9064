//! SQLite-backed store for Event/Job/Task/Builder rows, driven from a single
//! dedicated thread (spec §5: "the SQL store is touched from one thread
//! only"). Grounded on the per-entity `db_process`/`_db_add`/`db_search`
//! methods of `apkfoundry/objects.py`, generalized into one typed `Store`
//! rather than one `db_process` per entity class.

use af_model::{Arch, Builder, Event, EventType, Job, Status, Task};
use rusqlite::{params, Connection, OptionalExtension};
use snafu::{ResultExt, Snafu};
use std::cell::Cell;
use std::marker::PhantomData;
use std::path::Path;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to open the database at {path}"))]
    Open { path: String, source: rusqlite::Error },

    #[snafu(display("database query failed"))]
    Query { source: rusqlite::Error },

    #[snafu(display("unknown event type discriminant {value}"))]
    UnknownEventType { value: i64 },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS events (
    id            INTEGER PRIMARY KEY,
    project       TEXT NOT NULL,
    event_type    INTEGER NOT NULL,
    clone_url     TEXT NOT NULL,
    target_branch TEXT NOT NULL,
    revision      TEXT NOT NULL,
    user          TEXT NOT NULL,
    reason        TEXT NOT NULL,
    mr_id         INTEGER,
    mr_clone_url  TEXT,
    mr_branch     TEXT,
    before        TEXT,
    status        INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS jobs (
    id       INTEGER PRIMARY KEY,
    event_id INTEGER NOT NULL REFERENCES events(id),
    arch     TEXT NOT NULL,
    builder  TEXT,
    status   INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS tasks (
    id         INTEGER PRIMARY KEY,
    job_id     INTEGER NOT NULL REFERENCES jobs(id),
    repo       TEXT NOT NULL,
    pkg        TEXT NOT NULL,
    maintainer TEXT,
    status     INTEGER NOT NULL,
    tail       TEXT
);
CREATE TABLE IF NOT EXISTS builder_arches (
    builder   TEXT NOT NULL,
    arch      TEXT NOT NULL,
    idle      INTEGER NOT NULL,
    curr_jobs INTEGER NOT NULL,
    prev_job  INTEGER,
    PRIMARY KEY (builder, arch)
);
";

fn event_type_to_i64(t: EventType) -> i64 {
    t as i64
}

fn event_type_from_i64(value: i64) -> Result<EventType> {
    match value {
        0 => Ok(EventType::Push),
        1 => Ok(EventType::Mr),
        2 => Ok(EventType::Manual),
        other => UnknownEventTypeSnafu { value: other }.fail(),
    }
}

fn status_to_i64(s: Status) -> i64 {
    s.bits() as i64
}

fn status_from_i64(value: i64) -> Status {
    Status::from_bits_truncate(value as u16)
}

/// A handle to one SQLite-backed store. Deliberately `!Sync` (it owns a
/// `rusqlite::Connection`, which has no internal locking) so the type system
/// enforces the single-writer-thread discipline rather than relying on
/// caller discipline alone.
pub struct Store {
    conn: Connection,
    _not_sync: PhantomData<Cell<()>>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).context(OpenSnafu { path: path.display().to_string() })?;
        conn.execute_batch(SCHEMA).context(QuerySnafu)?;
        Ok(Store { conn, _not_sync: PhantomData })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context(OpenSnafu { path: ":memory:".to_string() })?;
        conn.execute_batch(SCHEMA).context(QuerySnafu)?;
        Ok(Store { conn, _not_sync: PhantomData })
    }

    /// Inserts `event`'s row, mirroring `objects.py::Event._db_add`, and
    /// returns the same event with `id` set to the assigned rowid.
    pub fn record_event(&self, mut event: Event) -> Result<Event> {
        self.conn
            .execute(
                "INSERT INTO events (
                    project, event_type, clone_url, target_branch, revision,
                    user, reason, mr_id, mr_clone_url, mr_branch, before, status
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    event.project,
                    event_type_to_i64(event.event_type),
                    event.clone_url,
                    event.target_branch,
                    event.revision,
                    event.user,
                    event.reason,
                    event.mr_id.map(|v| v as i64),
                    event.mr_clone_url,
                    event.mr_branch,
                    event.before,
                    status_to_i64(event.status),
                ],
            )
            .context(QuerySnafu)?;

        event.id = self.conn.last_insert_rowid() as u64;
        log::info!("[{}] recorded event", event.id);
        Ok(event)
    }

    /// Inserts one `jobs` row for `event_id`/`arch`, mirroring
    /// `objects.py::Event._generate_jobs`'s per-row insert.
    pub fn record_job(&self, event: &Event, arch: &str) -> Result<Job> {
        self.conn
            .execute(
                "INSERT INTO jobs (event_id, arch, builder, status) VALUES (?1, ?2, NULL, ?3)",
                params![event.id as i64, arch, status_to_i64(Status::NEW)],
            )
            .context(QuerySnafu)?;

        Ok(Job {
            id: self.conn.last_insert_rowid() as u64,
            event_id: event.id,
            project: event.project.clone(),
            event_type: event.event_type,
            target_branch: event.target_branch.clone(),
            builder: None,
            arch: arch.to_string(),
            status: Status::NEW,
            tasks: Vec::new(),
        })
    }

    /// Inserts one `tasks` row under `job`, mirroring
    /// `objects.py::Event._generate_tasks`'s per-row insert.
    pub fn record_task(&self, job: &Job, repo: &str, pkg: &str, maintainer: Option<&str>) -> Result<Task> {
        self.conn
            .execute(
                "INSERT INTO tasks (job_id, repo, pkg, maintainer, status, tail)
                 VALUES (?1, ?2, ?3, ?4, ?5, NULL)",
                params![job.id as i64, repo, pkg, maintainer, status_to_i64(Status::NEW)],
            )
            .context(QuerySnafu)?;

        Ok(Task {
            id: self.conn.last_insert_rowid() as u64,
            job_id: job.id,
            project: job.project.clone(),
            event_type: job.event_type,
            target_branch: job.target_branch.clone(),
            event_id: job.event_id,
            builder: job.builder.clone(),
            arch: job.arch.clone(),
            repo: repo.to_string(),
            pkg: pkg.to_string(),
            maintainer: maintainer.map(str::to_string),
            status: Status::NEW,
            tail: None,
        })
    }

    pub fn set_event_status(&self, id: u64, status: Status) -> Result<()> {
        self.conn
            .execute("UPDATE events SET status = ?1 WHERE id = ?2", params![status_to_i64(status), id as i64])
            .context(QuerySnafu)?;
        Ok(())
    }

    pub fn set_job_status(&self, id: u64, status: Status) -> Result<()> {
        self.conn
            .execute("UPDATE jobs SET status = ?1 WHERE id = ?2", params![status_to_i64(status), id as i64])
            .context(QuerySnafu)?;
        Ok(())
    }

    pub fn set_job_builder(&self, id: u64, builder: Option<&str>) -> Result<()> {
        self.conn
            .execute("UPDATE jobs SET builder = ?1 WHERE id = ?2", params![builder, id as i64])
            .context(QuerySnafu)?;
        Ok(())
    }

    pub fn set_task_status(&self, id: u64, status: Status, tail: Option<&str>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE tasks SET status = ?1, tail = ?2 WHERE id = ?3",
                params![status_to_i64(status), tail, id as i64],
            )
            .context(QuerySnafu)?;
        Ok(())
    }

    /// Upserts the retained set of per-arch `Arch` rows for `builder`.
    pub fn record_builder(&self, builder: &Builder) -> Result<()> {
        for (arch, state) in &builder.arches {
            self.conn
                .execute(
                    "INSERT INTO builder_arches (builder, arch, idle, curr_jobs, prev_job)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT (builder, arch) DO UPDATE SET
                        idle = excluded.idle,
                        curr_jobs = excluded.curr_jobs,
                        prev_job = excluded.prev_job",
                    params![
                        builder.name,
                        arch,
                        state.idle as i64,
                        state.curr_jobs as i64,
                        state.prev_job.map(|v| v as i64),
                    ],
                )
                .context(QuerySnafu)?;
        }
        Ok(())
    }

    pub fn event_by_id(&self, id: u64) -> Result<Option<Event>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, project, event_type, clone_url, target_branch, revision,
                        user, reason, mr_id, mr_clone_url, mr_branch, before, status
                 FROM events WHERE id = ?1",
                params![id as i64],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                        row.get::<_, Option<i64>>(8)?,
                        row.get::<_, Option<String>>(9)?,
                        row.get::<_, Option<String>>(10)?,
                        row.get::<_, Option<String>>(11)?,
                        row.get::<_, i64>(12)?,
                    ))
                },
            )
            .optional()
            .context(QuerySnafu)?;

        let Some((id, project, event_type, clone_url, target_branch, revision, user, reason, mr_id, mr_clone_url, mr_branch, before, status)) = row
        else {
            return Ok(None);
        };

        Ok(Some(Event {
            id: id as u64,
            project,
            event_type: event_type_from_i64(event_type)?,
            clone_url,
            target_branch,
            revision,
            user,
            reason,
            mr_id: mr_id.map(|v| v as u64),
            mr_clone_url,
            mr_branch,
            before,
            status: status_from_i64(status),
        }))
    }

    /// Jobs whose status is a superset of `prefix` (spec §3.2's "status &
    /// DONE == DONE" style prefix queries), joined against their owning
    /// event for the denormalized fields `Job` carries.
    pub fn jobs_by_status_prefix(&self, prefix: Status) -> Result<Vec<Job>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT jobs.id, jobs.event_id, events.project, events.event_type,
                        events.target_branch, jobs.builder, jobs.arch, jobs.status
                 FROM jobs JOIN events ON events.id = jobs.event_id
                 WHERE jobs.status & ?1 = ?1",
            )
            .context(QuerySnafu)?;

        let rows = stmt
            .query_map(params![status_to_i64(prefix)], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, i64>(7)?,
                ))
            })
            .context(QuerySnafu)?;

        let mut jobs = Vec::new();
        for row in rows {
            let (id, event_id, project, event_type, target_branch, builder, arch, status) =
                row.context(QuerySnafu)?;
            jobs.push(Job {
                id: id as u64,
                event_id: event_id as u64,
                project,
                event_type: event_type_from_i64(event_type)?,
                target_branch,
                builder,
                arch,
                status: status_from_i64(status),
                tasks: Vec::new(),
            });
        }
        Ok(jobs)
    }

    pub fn tasks_by_job(&self, job: &Job) -> Result<Vec<Task>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, repo, pkg, maintainer, status, tail FROM tasks WHERE job_id = ?1")
            .context(QuerySnafu)?;

        let rows = stmt
            .query_map(params![job.id as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })
            .context(QuerySnafu)?;

        let mut tasks = Vec::new();
        for row in rows {
            let (id, repo, pkg, maintainer, status, tail) = row.context(QuerySnafu)?;
            tasks.push(Task {
                id: id as u64,
                job_id: job.id,
                project: job.project.clone(),
                event_type: job.event_type,
                target_branch: job.target_branch.clone(),
                event_id: job.event_id,
                builder: job.builder.clone(),
                arch: job.arch.clone(),
                repo,
                pkg,
                maintainer,
                status: status_from_i64(status),
                tail,
            });
        }
        Ok(tasks)
    }

    /// Reconstructs one arch's `Arch{idle, curr_jobs, prev_job}` state for
    /// `builder`, or its default (offline) state if no row exists yet.
    pub fn builder_arch(&self, builder: &str, arch: &str) -> Result<Arch> {
        self.conn
            .query_row(
                "SELECT idle, curr_jobs, prev_job FROM builder_arches WHERE builder = ?1 AND arch = ?2",
                params![builder, arch],
                |row| {
                    Ok(Arch {
                        idle: row.get::<_, i64>(0)? != 0,
                        curr_jobs: row.get::<_, i64>(1)? as u32,
                        prev_job: row.get::<_, Option<i64>>(2)?.map(|v| v as u64),
                    })
                },
            )
            .optional()
            .context(QuerySnafu)
            .map(|found| found.unwrap_or_default())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_event() -> Event {
        Event {
            id: 0,
            project: "core".into(),
            event_type: EventType::Push,
            clone_url: "https://example.invalid/core.git".into(),
            target_branch: "3.18-stable".into(),
            revision: "deadbeef".into(),
            user: "tester".into(),
            reason: "push".into(),
            mr_id: None,
            mr_clone_url: None,
            mr_branch: None,
            before: None,
            status: Status::NEW,
        }
    }

    #[test]
    fn record_event_assigns_an_id() {
        let store = Store::open_in_memory().unwrap();
        let event = store.record_event(sample_event()).unwrap();
        assert_ne!(event.id, 0);
        let fetched = store.event_by_id(event.id).unwrap().unwrap();
        assert_eq!(fetched.project, "core");
    }

    #[test]
    fn jobs_by_status_prefix_matches_done_superset() {
        let store = Store::open_in_memory().unwrap();
        let event = store.record_event(sample_event()).unwrap();
        let job = store.record_job(&event, "x86_64").unwrap();
        store.set_job_status(job.id, Status::SUCCESS).unwrap();

        let done = store.jobs_by_status_prefix(Status::DONE).unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].status, Status::SUCCESS);
    }

    #[test]
    fn builder_arch_defaults_to_offline_when_missing() {
        let store = Store::open_in_memory().unwrap();
        let arch = store.builder_arch("builder1", "x86_64").unwrap();
        assert!(!arch.idle);
        assert_eq!(arch.curr_jobs, 0);
    }

    #[test]
    fn record_task_round_trips_through_tasks_by_job() {
        let store = Store::open_in_memory().unwrap();
        let event = store.record_event(sample_event()).unwrap();
        let job = store.record_job(&event, "x86_64").unwrap();
        store.record_task(&job, "main", "pkgconf", Some("maint@example.invalid")).unwrap();

        let tasks = store.tasks_by_job(&job).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].pkg, "pkgconf");
    }
}
