//! MQTT client glue: the dispatcher's claim rule and the agent's mask
//! matching, plus the `rumqttc` wiring both ride on. Grounded on
//! `apkfoundry/dispatch.py::Dispatcher` and `apkfoundry/agent.py::Agent`.
//!
//! The claim-rule and mask-matching logic is kept free of the MQTT client
//! itself (`Dispatcher`/`AgentClient` below take and return plain
//! `af-model` values) so it can be exercised without a broker; `run_dispatcher`/
//! `run_agent` are the thin async loops that actually talk to one.

use af_config::MqttConfig;
use af_model::{Arch, Builder, Job, Status, Task};
pub use rumqttc::QoS;
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet};
use snafu::{ResultExt, Snafu};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("unrecognized topic {topic:?}"))]
    UnknownTopic { topic: String },

    #[snafu(display("failed to decode MQTT payload on {topic:?}"))]
    Decode { topic: String, source: af_model::ModelError },

    #[snafu(display("MQTT client error"))]
    Client { source: rumqttc::ClientError },

    #[snafu(display("MQTT connection error"))]
    Connection { source: rumqttc::ConnectionError },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A decoded message off one of the three subscribed topic trees, per
/// `dispatch.py::_TOPICS = [("_new_job", 1), ("builders/#", 1), ("jobs/#", 2),
/// ("tasks/#", 2)]`. `_new_job` carries no payload of interest — it only
/// exists to wake the claim-rule loop after `enqueue`, so it has no variant
/// here; callers `enqueue` directly instead of routing it through `classify`.
pub enum Incoming {
    Builder(Builder),
    Job(Job),
    Task(Task),
}

/// Routes a raw MQTT `(topic, payload)` pair to its decoded form, mirroring
/// `dispatch.py::_on_message`'s topic-prefix dispatch.
pub fn classify(topic: &str, payload: &[u8]) -> Result<Incoming> {
    if let Some(rest) = topic.strip_prefix("builders/") {
        let _ = rest;
        Ok(Incoming::Builder(Builder::from_mqtt(payload).context(DecodeSnafu { topic })?))
    } else if topic.starts_with("jobs/") {
        Ok(Incoming::Job(Job::from_mqtt(payload).context(DecodeSnafu { topic })?))
    } else if topic.starts_with("tasks/") {
        Ok(Incoming::Task(Task::from_mqtt(payload).context(DecodeSnafu { topic })?))
    } else {
        UnknownTopicSnafu { topic }.fail()
    }
}

/// Outcome of folding one `Job` status update into the per-arch head queue,
/// mirroring `dispatch.py::_job_recv`'s assertion-guarded head-of-queue
/// update.
#[derive(Debug)]
pub enum JobRecvOutcome {
    /// The message didn't reference the current head job for its arch (a
    /// stray retained message, or a status update for a job already retired
    /// from the queue) and changed nothing.
    Stale,
    /// The head job was rejected by its assigned builder; it stays at the
    /// head of the queue with `builder` cleared so the claim rule can try a
    /// different idle builder next tick.
    Rejected { job_id: u64 },
    /// The head job was claimed (`START`) by its assigned builder and is
    /// removed from the dispatch queue.
    Started { job: Job },
}

/// Per-arch job FIFOs and idle-builder-name pools, plus the claim rule that
/// pairs them up. Grounded on `dispatch.py::Dispatcher`'s `self.jobs` /
/// `self.builders` dicts and the claim-rule loop inside `_on_message`.
#[derive(Debug, Default)]
pub struct Dispatcher {
    jobs: BTreeMap<String, VecDeque<Job>>,
    idle: BTreeMap<String, VecDeque<String>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// `dispatch.py::_builder_recv`: a builder's retained status message
    /// replaces its membership in the arch's idle pool — present if idle,
    /// absent otherwise (covers both "gone busy" and "gone offline" via the
    /// last-will payload, which reports every arch `idle: false`).
    pub fn on_builder(&mut self, builder: &Builder) {
        for (arch, status) in &builder.arches {
            let pool = self.idle.entry(arch.clone()).or_default();
            pool.retain(|name| name != &builder.name);
            if status.idle {
                pool.push_back(builder.name.clone());
            }
        }
    }

    /// `dispatch.py::_job_recv`.
    pub fn on_job(&mut self, job: Job) -> JobRecvOutcome {
        let queue = self.jobs.entry(job.arch.clone()).or_default();
        let is_head = matches!(queue.front(), Some(head) if head.id == job.id);
        if !is_head {
            return JobRecvOutcome::Stale;
        }

        match job.status {
            Status::REJECT => {
                queue.front_mut().expect("checked above").builder = None;
                JobRecvOutcome::Rejected { job_id: job.id }
            }
            Status::START => {
                let job = queue.pop_front().expect("checked above");
                JobRecvOutcome::Started { job }
            }
            _ => JobRecvOutcome::Stale,
        }
    }

    /// Appends a freshly materialized job to its arch's dispatch queue.
    pub fn enqueue(&mut self, job: Job) {
        self.jobs.entry(job.arch.clone()).or_default().push_back(job);
    }

    /// The claim-rule loop at the end of `_on_message`: for every arch with a
    /// waiting, unassigned head job and an idle builder, assign one and
    /// return it for publishing. `just_touched` suppresses re-offering the
    /// job that was the subject of this same tick's incoming message (the
    /// source's `just_touched_job`), since a `START`/`REJECT` for it was
    /// already handled above and re-publishing in the same pass would race
    /// the builder's own next status update.
    pub fn ready_jobs(&mut self, just_touched: Option<u64>) -> Vec<Job> {
        let Dispatcher { jobs, idle } = self;
        let mut ready = Vec::new();
        for (arch, queue) in jobs.iter_mut() {
            let Some(head) = queue.front_mut() else {
                continue;
            };
            if Some(head.id) == just_touched || head.builder.is_some() {
                continue;
            }
            let Some(pool) = idle.get_mut(arch) else {
                continue;
            };
            let Some(builder) = pool.pop_front() else {
                continue;
            };
            head.builder = Some(builder);
            ready.push(head.clone());
        }
        ready
    }

    /// Folds one classified message into dispatcher state and runs the claim
    /// rule once, returning any jobs that should now be published.
    pub fn on_message(&mut self, incoming: Incoming) -> Vec<Job> {
        let just_touched = match incoming {
            Incoming::Builder(builder) => {
                self.on_builder(&builder);
                None
            }
            Incoming::Job(job) => match self.on_job(job) {
                JobRecvOutcome::Started { job } => Some(job.id),
                JobRecvOutcome::Rejected { job_id } => Some(job_id),
                JobRecvOutcome::Stale => None,
            },
            // Task status updates don't affect the dispatch queue; the
            // caller forwards them straight to the DB worker's queue.
            Incoming::Task(_) => None,
        };
        self.ready_jobs(just_touched)
    }
}

/// An MQTT topic mask pattern set (`+` one segment, `#` rest-of-topic),
/// matching `agent.py`'s `MQTTMatcher`-based `self._mask`. No crate in the
/// workspace's stack implements MQTT wildcard matching, so this is a small
/// hand-rolled one.
#[derive(Debug, Default)]
pub struct Mask {
    patterns: Vec<Vec<String>>,
}

impl Mask {
    pub fn new(patterns: &[String]) -> Self {
        Self {
            patterns: patterns.iter().map(|p| p.split('/').map(str::to_string).collect()).collect(),
        }
    }

    pub fn matches(&self, topic: &str) -> bool {
        let segs: Vec<&str> = topic.split('/').collect();
        self.patterns.iter().any(|pattern| mask_match(pattern, &segs))
    }
}

fn mask_match(pattern: &[String], topic: &[&str]) -> bool {
    let mut pi = 0;
    let mut ti = 0;
    loop {
        match (pattern.get(pi), topic.get(ti)) {
            (Some(p), _) if p == "#" => return true,
            (Some(p), Some(t)) if p == "+" || p == t => {
                pi += 1;
                ti += 1;
            }
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// One builder agent's view of which jobs it's willing to accept, mirroring
/// `agent.py::Agent`'s arch list and mask, minus the worker-pool submission
/// itself (left to the caller, since that's where `af-taskrunner`/
/// `af-scheduler` actually run the build).
pub struct AgentClient {
    pub name: String,
    arches: BTreeSet<String>,
    mask: Mask,
}

impl AgentClient {
    pub fn new(name: String, arches: &[(String, String)], mask_patterns: &[String]) -> Self {
        Self {
            name,
            arches: arches.iter().map(|(arch, _suffix)| arch.clone()).collect(),
            mask: Mask::new(mask_patterns),
        }
    }

    /// `agent.py::_on_message`'s `NEW`-job branch: `Some(reason)` if the job
    /// should be rejected outright (and `_reject_job` called with it),
    /// `None` if it should go to the worker pool.
    pub fn reject_reason(&self, job: &Job) -> Option<&'static str> {
        if !self.arches.contains(&job.arch) {
            return Some("unsupported architecture");
        }
        if !self.mask.matches(&job.topic()) {
            return Some("rejected by agent mask");
        }
        None
    }
}

fn mqtt_options(config: &MqttConfig, client_id: &str, will: Option<(String, Vec<u8>, QoS)>) -> MqttOptions {
    let mut opts = MqttOptions::new(client_id, config.host.clone(), config.port);
    opts.set_credentials(config.username.clone(), config.password.clone());
    opts.set_keep_alive(Duration::from_secs(30));
    if let Some((topic, payload, qos)) = will {
        opts.set_last_will(LastWill::new(topic, payload, qos, true));
    }
    opts
}

/// Drives one dispatcher's MQTT session: subscribes to the `_TOPICS` tree,
/// folds every incoming message through `Dispatcher::on_message`, and
/// publishes whatever the claim rule offers up. `on_db_write` receives every
/// `Builder`/`Job`/`Task` update so the caller can persist it — `af-broker`
/// itself holds no `af-persistence` dependency, matching the workspace's
/// single-writer-thread rule (spec §5) that only the DB worker touches the
/// store.
///
/// `new_jobs`, if given, is polled alongside the MQTT event loop via
/// `tokio::select!`: a job arriving on it is folded into the dispatcher and
/// the claim rule re-run, exactly as a freshly enqueued job from
/// `dispatch_queue` should be (spec §4.8's "when either a new job is
/// enqueued or a builder transitions to idle"). `dispatch.py::Dispatcher`
/// achieves the same effect across two OS threads by round-tripping a
/// dummy `_new_job` MQTT message to itself; since both branches here run
/// in the same cooperative task there's no need for the round trip — the
/// `_new_job` topic is kept in the subscription list below only so a
/// future out-of-process publisher (another dispatcher instance) can still
/// poke this one.
pub async fn run_dispatcher(
    config: &MqttConfig,
    client_id: &str,
    dispatcher: &mut Dispatcher,
    mut new_jobs: Option<tokio::sync::mpsc::UnboundedReceiver<Job>>,
    mut on_db_write: impl FnMut(&Incoming),
) -> Result<()> {
    let opts = mqtt_options(config, client_id, None);
    let (client, mut eventloop) = AsyncClient::new(opts, 64);

    client.subscribe("_new_job", QoS::AtLeastOnce).await.context(ClientSnafu)?;
    client.subscribe("builders/#", QoS::AtLeastOnce).await.context(ClientSnafu)?;
    client.subscribe("jobs/#", QoS::ExactlyOnce).await.context(ClientSnafu)?;
    client.subscribe("tasks/#", QoS::ExactlyOnce).await.context(ClientSnafu)?;

    loop {
        let incoming_job = async {
            match &mut new_jobs {
                Some(rx) => rx.recv().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            event = eventloop.poll() => {
                let Event::Incoming(Packet::Publish(publish)) = event.context(ConnectionSnafu)? else {
                    continue;
                };

                if publish.topic == "_new_job" {
                    for job in dispatcher.ready_jobs(None) {
                        publish_job(&client, &job).await?;
                    }
                    continue;
                }

                let incoming = match classify(&publish.topic, &publish.payload) {
                    Ok(incoming) => incoming,
                    Err(err) => {
                        log::warn!("discarding {}: {err}", publish.topic);
                        continue;
                    }
                };
                on_db_write(&incoming);

                for job in dispatcher.on_message(incoming) {
                    publish_job(&client, &job).await?;
                }
            }
            job = incoming_job => {
                let Some(job) = job else {
                    // The channel closed (inbound receiver shut down); stop
                    // polling it but keep serving the MQTT loop.
                    new_jobs = None;
                    continue;
                };
                dispatcher.enqueue(job);
                for job in dispatcher.ready_jobs(None) {
                    publish_job(&client, &job).await?;
                }
            }
        }
    }
}

async fn publish_job(client: &AsyncClient, job: &Job) -> Result<()> {
    let (topic, payload) = job.to_mqtt();
    client.publish(topic, QoS::ExactlyOnce, false, payload).await.context(ClientSnafu)
}

/// A `(topic, payload, qos, retain)` tuple queued for publication by the
/// worker thread that produced it. The worker pool `af-agent` runs jobs on
/// lives outside this `tokio` task, so task/job/builder status updates it
/// wants to publish have to cross back over a channel rather than calling
/// an async client directly — the same shape `run_dispatcher`'s `new_jobs`
/// parameter uses in the other direction. `retain` matters for `Builder`
/// messages, which must stay retained like the connect-time publish below.
pub type Outgoing = tokio::sync::mpsc::UnboundedSender<(String, Vec<u8>, QoS, bool)>;

/// Drives one agent's MQTT session. `handle_job` is invoked with every
/// accepted job and a sender it (or whatever thread ends up running the
/// job) can use to publish that job's and its tasks' status updates;
/// rejected jobs are republished with `Status::REJECT` directly. `on_cancel`
/// is invoked with the id of any in-flight job a `CANCEL` message names, so
/// the caller can flip whatever cooperative-cancellation flag it tracks for
/// that job — per spec §9's open question, this is best-effort only: there
/// is no mid-task preemption, so the job keeps running until its current
/// task boundary.
pub async fn run_agent(
    config: &MqttConfig,
    client_id: &str,
    agent: &AgentClient,
    builder: &Builder,
    mut handle_job: impl FnMut(Job, Outgoing),
    mut on_cancel: impl FnMut(u64),
) -> Result<()> {
    let (will_topic, will_payload) = builder.last_will();
    let opts = mqtt_options(config, client_id, Some((will_topic, will_payload, QoS::AtLeastOnce)));
    let (client, mut eventloop) = AsyncClient::new(opts, 64);

    client
        .subscribe(format!("jobs/new/+/+/+/+/{}/+/+", agent.name), QoS::ExactlyOnce)
        .await
        .context(ClientSnafu)?;
    client
        .subscribe(format!("jobs/cancel/+/+/+/+/{}/+/+", agent.name), QoS::ExactlyOnce)
        .await
        .context(ClientSnafu)?;

    let (topic, payload) = builder.to_mqtt();
    client.publish(topic, QoS::AtLeastOnce, true, payload).await.context(ClientSnafu)?;

    let (out_tx, mut out_rx) = tokio::sync::mpsc::unbounded_channel::<(String, Vec<u8>, QoS, bool)>();

    loop {
        tokio::select! {
            event = eventloop.poll() => {
                let Event::Incoming(Packet::Publish(publish)) = event.context(ConnectionSnafu)? else {
                    continue;
                };

                let mut job = match Job::from_mqtt(&publish.payload) {
                    Ok(job) => job,
                    Err(err) => {
                        log::warn!("discarding {}: {err}", publish.topic);
                        continue;
                    }
                };

                if publish.topic.starts_with("jobs/cancel/") {
                    log::info!("cancel requested for job {}, no mid-task preemption", job.id);
                    on_cancel(job.id);
                    continue;
                }

                match agent.reject_reason(&job) {
                    Some(reason) => {
                        log::info!("rejecting job {}: {reason}", job.id);
                        job.status = Status::REJECT;
                        let (topic, payload) = job.to_mqtt();
                        client.publish(topic, QoS::ExactlyOnce, false, payload).await.context(ClientSnafu)?;
                    }
                    None => handle_job(job, out_tx.clone()),
                }
            }
            outgoing = out_rx.recv() => {
                let Some((topic, payload, qos, retain)) = outgoing else {
                    continue;
                };
                client.publish(topic, qos, retain, payload).await.context(ClientSnafu)?;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use af_model::EventType;
    use std::collections::BTreeMap;

    fn sample_job(id: u64, arch: &str) -> Job {
        Job {
            id,
            event_id: 1,
            project: "core".into(),
            event_type: EventType::Push,
            target_branch: "3.18-stable".into(),
            builder: None,
            arch: arch.into(),
            status: Status::NEW,
            tasks: Vec::new(),
        }
    }

    fn sample_builder(name: &str, arch: &str, idle: bool) -> Builder {
        let mut arches = BTreeMap::new();
        arches.insert(arch.to_string(), Arch { idle, curr_jobs: if idle { 0 } else { 1 }, prev_job: None });
        Builder { name: name.into(), arches }
    }

    #[test]
    fn claims_a_waiting_job_for_an_idle_builder() {
        let mut d = Dispatcher::new();
        d.on_builder(&sample_builder("b1", "x86_64", true));
        d.enqueue(sample_job(1, "x86_64"));

        let ready = d.ready_jobs(None);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].builder.as_deref(), Some("b1"));
    }

    #[test]
    fn does_not_reclaim_an_already_assigned_head_job() {
        let mut d = Dispatcher::new();
        d.on_builder(&sample_builder("b1", "x86_64", true));
        d.on_builder(&sample_builder("b2", "x86_64", true));
        d.enqueue(sample_job(1, "x86_64"));

        let first = d.ready_jobs(None);
        assert_eq!(first.len(), 1);
        // without folding the assignment back into dispatcher.jobs the head
        // job is still unassigned from the dispatcher's point of view in
        // this unit test, so exercise the real flow via on_job/on_message
        // instead of calling ready_jobs twice on unmutated state.
        let mut job = first[0].clone();
        job.status = Status::START;
        assert!(matches!(d.on_job(job), JobRecvOutcome::Started { job } if job.id == 1));
        assert!(d.ready_jobs(None).is_empty());
    }

    #[test]
    fn rejected_job_stays_head_with_builder_cleared() {
        let mut d = Dispatcher::new();
        d.on_builder(&sample_builder("b1", "x86_64", true));
        d.enqueue(sample_job(1, "x86_64"));
        let mut assigned = d.ready_jobs(None).remove(0);
        assigned.status = Status::REJECT;

        let outcome = d.on_job(assigned);
        assert!(matches!(outcome, JobRecvOutcome::Rejected { job_id: 1 }));
        // b1 was consumed by the first ready_jobs call and not re-added, so
        // without a fresh idle report the job should not be reclaimed yet.
        assert!(d.ready_jobs(None).is_empty());
    }

    #[test]
    fn just_touched_job_is_not_reoffered_this_tick() {
        let mut d = Dispatcher::new();
        d.on_builder(&sample_builder("b1", "x86_64", true));
        d.on_builder(&sample_builder("b2", "x86_64", true));
        d.enqueue(sample_job(1, "x86_64"));
        d.enqueue(sample_job(2, "x86_64"));

        assert!(d.ready_jobs(Some(1)).is_empty());
    }

    #[test]
    fn stale_job_update_does_not_touch_the_queue() {
        let mut d = Dispatcher::new();
        d.enqueue(sample_job(1, "x86_64"));
        let mut other = sample_job(2, "x86_64");
        other.status = Status::START;
        assert!(matches!(d.on_job(other), JobRecvOutcome::Stale));
    }

    #[test]
    fn mask_plus_matches_one_segment() {
        let mask = Mask::new(&["jobs/new/core/+/+/+/agent1/+/+".to_string()]);
        assert!(mask.matches("jobs/new/core/push/3.18-stable/7/agent1/x86_64/42"));
        assert!(!mask.matches("jobs/new/other/push/3.18-stable/7/agent1/x86_64/42"));
    }

    #[test]
    fn mask_hash_wildcard_matches_rest_of_topic() {
        let mask = Mask::new(&["jobs/new/core/#".to_string()]);
        assert!(mask.matches("jobs/new/core/push/3.18-stable/7/agent1/x86_64/42"));
    }

    #[test]
    fn agent_rejects_unsupported_architecture() {
        let agent = AgentClient::new("agent1".into(), &[("x86_64".into(), "default".into())], &["#".to_string()]);
        let job = sample_job(1, "aarch64");
        assert_eq!(agent.reject_reason(&job), Some("unsupported architecture"));
    }

    #[test]
    fn agent_accepts_matching_job() {
        let agent = AgentClient::new("agent1".into(), &[("x86_64".into(), "default".into())], &["#".to_string()]);
        let job = sample_job(1, "x86_64");
        assert_eq!(agent.reject_reason(&job), None);
    }
}
