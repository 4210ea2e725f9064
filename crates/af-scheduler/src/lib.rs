//! The build scheduler: DAG traversal over a set of initial startdirs with
//! configurable STOP/RECALCULATE/IGNORE failure policies (spec §4.6).

use af_config::{OnFailure, ProjectConfig};
use af_container::Container;
use af_model::Status;
use digraph::Digraph;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

pub struct RunGraphOptions<'a> {
    pub build_script: &'a str,
    pub on_failure: OnFailure,
}

/// Runs every startdir in `initial` to completion following `graph`'s
/// dependency order, per spec §4.6. `cancel`, if observed set at a task
/// boundary, marks every not-yet-done initial startdir CANCEL and stops;
/// there is no mid-task preemption (spec §9's cancellation open question).
///
/// `on_status` is called once for every startdir as soon as its final
/// status is known, ahead of (and in addition to) the aggregate map this
/// function returns — `af-agent` uses it to republish each task's status
/// over MQTT as the job progresses rather than waiting for the whole job to
/// finish; `af-buildrepo`, which has no broker to publish to, passes a
/// no-op.
pub fn run_graph(
    container: &mut Container,
    project: &ProjectConfig,
    graph: &mut Digraph<String>,
    initial: &BTreeSet<String>,
    opts: &RunGraphOptions,
    cancel: &AtomicBool,
    mut on_status: impl FnMut(&str, Status),
) -> BTreeMap<String, Status> {
    let mut done: BTreeMap<String, Status> = BTreeMap::new();

    loop {
        if cancel.load(Ordering::SeqCst) {
            mark_remaining(&mut done, initial, Status::CANCEL, &mut on_status);
            break;
        }

        let order: Vec<String> = match graph.topological_sort() {
            Ok(order) => order
                .into_iter()
                .filter(|n| initial.contains(n) && !done.contains_key(n))
                .collect(),
            Err(e) => {
                log::error!("dependency graph has a cycle: {e:?}");
                mark_remaining(&mut done, initial, Status::ERROR, &mut on_status);
                break;
            }
        };

        if order.is_empty() {
            break;
        }

        let total = order.len();
        for (i, startdir) in order.iter().enumerate() {
            if cancel.load(Ordering::SeqCst) {
                break;
            }

            log::info!("({}/{total}) start: {startdir}", i + 1);
            let outcome = af_taskrunner::run_task(container, project, startdir, opts.build_script);

            let failed = match outcome {
                Ok(af_taskrunner::Outcome::Success) => {
                    log::info!("({}/{total}) success: {startdir}", i + 1);
                    done.insert(startdir.clone(), Status::SUCCESS);
                    on_status(startdir, Status::SUCCESS);
                    false
                }
                Ok(af_taskrunner::Outcome::Failure(rc)) => {
                    log::error!("({}/{total}) fail: {startdir} (status {rc})", i + 1);
                    done.insert(startdir.clone(), Status::FAIL);
                    on_status(startdir, Status::FAIL);
                    true
                }
                Err(e) => {
                    log::error!("({}/{total}) error: {startdir}: {e}", i + 1);
                    done.insert(startdir.clone(), Status::ERROR);
                    on_status(startdir, Status::ERROR);
                    true
                }
            };

            if !failed {
                continue;
            }

            match opts.on_failure {
                OnFailure::Stop => {
                    log::error!("stopping due to previous error");
                    mark_remaining(&mut done, initial, Status::DEPFAIL, &mut on_status);
                    graph.reset_graph();
                }
                OnFailure::Recalculate => {
                    log::info!("recalculating build order");
                    recalculate(graph, &mut done, initial, startdir, &mut on_status);
                }
                OnFailure::Ignore => {
                    log::info!("ignoring error and continuing");
                    continue;
                }
            }

            break;
        }
    }

    done
}

fn mark_remaining(
    done: &mut BTreeMap<String, Status>,
    initial: &BTreeSet<String>,
    status: Status,
    on_status: &mut impl FnMut(&str, Status),
) {
    for startdir in initial {
        if done.contains_key(startdir) {
            continue;
        }
        done.insert(startdir.clone(), status);
        on_status(startdir, status);
    }
}

fn recalculate(
    graph: &mut Digraph<String>,
    done: &mut BTreeMap<String, Status>,
    initial: &BTreeSet<String>,
    failed: &str,
    on_status: &mut impl FnMut(&str, Status),
) {
    let downstreams = graph.all_downstreams(&failed.to_string()).unwrap_or_default();
    for rdep in &downstreams {
        graph.delete_node(rdep);
    }
    graph.delete_node(&failed.to_string());

    for rdep in downstreams.iter().filter(|d| initial.contains(*d)) {
        log::error!("depfail: {rdep}");
        done.insert(rdep.clone(), Status::DEPFAIL);
        on_status(rdep, Status::DEPFAIL);
    }
}

/// Logs the per-status breakdown, mirroring `build.py`'s `_stats_builds`.
pub fn report(done: &BTreeMap<String, Status>) {
    log::info!("total: {}", done.len());
    for status in [Status::SUCCESS, Status::DEPFAIL, Status::FAIL, Status::ERROR, Status::CANCEL] {
        let startdirs: Vec<&String> = done
            .iter()
            .filter(|(_, s)| **s == status)
            .map(|(k, _)| k)
            .collect();
        if !startdirs.is_empty() {
            log::info!("{}: {}", status.topic_word(), startdirs.len());
        }
    }
}

/// The number of distinct non-success status classes present, per the
/// `af-buildrepo` CLI contract in spec §6.1.
pub fn exit_code(done: &BTreeMap<String, Status>) -> i32 {
    let classes: HashSet<Status> = done
        .values()
        .copied()
        .filter(|s| *s != Status::SUCCESS)
        .collect();
    classes.len() as i32
}

#[cfg(test)]
mod test {
    use super::*;

    fn chain_graph() -> Digraph<String> {
        let mut g = Digraph::new();
        g.add_edge("a".into(), "b".into());
        g.add_edge("b".into(), "c".into());
        g.add_node("d".into());
        g
    }

    #[test]
    fn recalculate_marks_only_initial_downstreams_as_depfail() {
        let mut graph = chain_graph();
        let mut done = BTreeMap::new();
        done.insert("b".to_string(), Status::FAIL);
        let initial: BTreeSet<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();

        recalculate(&mut graph, &mut done, &initial, "b", &mut |_, _| {});

        assert_eq!(done.get("c"), Some(&Status::DEPFAIL));
        assert!(!graph.contains_node(&"b".to_string()));
        assert!(!graph.contains_node(&"c".to_string()));
        assert!(graph.contains_node(&"d".to_string()));
    }

    #[test]
    fn exit_code_counts_distinct_non_success_classes() {
        let mut done = BTreeMap::new();
        done.insert("a".to_string(), Status::SUCCESS);
        done.insert("b".to_string(), Status::FAIL);
        done.insert("c".to_string(), Status::DEPFAIL);
        done.insert("d".to_string(), Status::DEPFAIL);
        assert_eq!(exit_code(&done), 2);
    }
}
