//! Dependency sequencer
//!
//! Runs a batch of named async operations in the partial order given by
//! their prerequisites. Operations whose prerequisites are all done form a
//! layer; a layer runs with at most `max_parallel` operations in flight.
//! A failure skips everything downstream of it but not its siblings.

use crate::error::{CtlError, Result};
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type Work = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

struct Operation {
    name: String,
    after: Vec<String>,
    work: Work,
}

/// Result of one operation
#[derive(Debug)]
pub enum Outcome {
    Done,
    Failed(CtlError),
    /// A prerequisite failed or was skipped
    Skipped,
}

/// Outcomes in execution order
#[derive(Debug, Default)]
pub struct Report {
    pub outcomes: Vec<(String, Outcome)>,
}

impl Report {
    pub fn failed(&self) -> bool {
        self.outcomes
            .iter()
            .any(|(_, o)| matches!(o, Outcome::Failed(_)))
    }

    pub fn outcome(&self, name: &str) -> Option<&Outcome> {
        self.outcomes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, o)| o)
    }

    /// `Ok` unless something failed; the error lists every failed and
    /// skipped operation
    pub fn into_result(self) -> Result<()> {
        if !self.failed() {
            return Ok(());
        }
        let mut failures = Vec::new();
        let mut skipped = Vec::new();
        for (name, outcome) in self.outcomes {
            match outcome {
                Outcome::Failed(err) => failures.push((name, err)),
                Outcome::Skipped => skipped.push(name),
                Outcome::Done => {}
            }
        }
        for name in skipped {
            failures.push((
                name,
                CtlError::usage("skipped because a dependency failed"),
            ));
        }
        if failures.len() == 1 {
            if let Some((_, err)) = failures.pop() {
                return Err(err);
            }
        }
        Err(CtlError::Multiple(failures))
    }
}

/// Batch of operations with prerequisites
pub struct Sequencer {
    ops: Vec<Operation>,
    max_parallel: usize,
}

impl Sequencer {
    /// `max_parallel` of 0 means unbounded
    pub fn new(max_parallel: usize) -> Self {
        Self {
            ops: Vec::new(),
            max_parallel,
        }
    }

    /// Register `name`, to run after every operation in `after`
    pub fn add<F>(&mut self, name: impl Into<String>, after: Vec<String>, work: F)
    where
        F: FnOnce() -> BoxFuture<'static, Result<()>> + Send + 'static,
    {
        self.ops.push(Operation {
            name: name.into(),
            after,
            work: Box::new(work),
        });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Group operations into layers; fails on unknown names and cycles
    fn layers(&self) -> Result<Vec<Vec<usize>>> {
        let index: BTreeMap<&str, usize> = self
            .ops
            .iter()
            .enumerate()
            .map(|(i, op)| (op.name.as_str(), i))
            .collect();
        if index.len() != self.ops.len() {
            return Err(CtlError::internal("duplicate operation name in batch"));
        }

        let mut pending: Vec<usize> = vec![0; self.ops.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.ops.len()];
        for (i, op) in self.ops.iter().enumerate() {
            let unique: BTreeSet<&str> = op.after.iter().map(String::as_str).collect();
            for dep in unique {
                let &d = index.get(dep).ok_or_else(|| {
                    CtlError::usage(format!("{} depends on undefined {}", op.name, dep))
                })?;
                pending[i] += 1;
                dependents[d].push(i);
            }
        }

        let mut layers = Vec::new();
        let mut ready: Vec<usize> = (0..self.ops.len()).filter(|&i| pending[i] == 0).collect();
        let mut placed = 0;
        while !ready.is_empty() {
            placed += ready.len();
            let mut next = Vec::new();
            for &i in &ready {
                for &d in &dependents[i] {
                    pending[d] -= 1;
                    if pending[d] == 0 {
                        next.push(d);
                    }
                }
            }
            next.sort_unstable();
            layers.push(std::mem::replace(&mut ready, next));
        }

        if placed < self.ops.len() {
            return Err(CtlError::DependencyCycle(self.cycle_members(&pending, &dependents)));
        }
        Ok(layers)
    }

    /// Unplaced operations minus those merely downstream of a cycle
    fn cycle_members(&self, pending: &[usize], dependents: &[Vec<usize>]) -> Vec<String> {
        let mut left: BTreeSet<usize> = (0..self.ops.len()).filter(|&i| pending[i] > 0).collect();
        loop {
            let tails: Vec<usize> = left
                .iter()
                .copied()
                .filter(|&i| !dependents[i].iter().any(|d| left.contains(d)))
                .collect();
            if tails.is_empty() {
                break;
            }
            for i in tails {
                left.remove(&i);
            }
        }
        left.into_iter().map(|i| self.ops[i].name.clone()).collect()
    }

    /// Run the batch
    ///
    /// A cycle fails the whole batch before anything runs. Cancellation stops
    /// scheduling new layers.
    pub async fn run(self, cancel: &CancellationToken) -> Result<Report> {
        let layers = self.layers()?;
        let limit = if self.max_parallel == 0 {
            self.ops.len().max(1)
        } else {
            self.max_parallel
        };

        let mut after: Vec<Vec<usize>> = Vec::with_capacity(self.ops.len());
        let mut names: Vec<String> = Vec::with_capacity(self.ops.len());
        let mut works: Vec<Option<Work>> = Vec::with_capacity(self.ops.len());
        for op in &self.ops {
            let deps = op
                .after
                .iter()
                .filter_map(|dep| self.ops.iter().position(|o| &o.name == dep))
                .collect();
            after.push(deps);
            names.push(op.name.clone());
        }
        for op in self.ops {
            works.push(Some(op.work));
        }

        let mut outcomes: Vec<Option<Outcome>> = (0..names.len()).map(|_| None).collect();
        let mut order = Vec::with_capacity(names.len());
        for layer in layers {
            if cancel.is_cancelled() {
                return Err(CtlError::Canceled { user: true });
            }
            let mut runnable = Vec::new();
            for i in layer {
                let blocked = after[i]
                    .iter()
                    .any(|&d| !matches!(outcomes[d], Some(Outcome::Done)));
                if blocked {
                    debug!("skipping {}: a dependency did not complete", names[i]);
                    outcomes[i] = Some(Outcome::Skipped);
                    order.push(i);
                } else if let Some(work) = works[i].take() {
                    runnable.push((i, work));
                }
            }

            let results: Vec<(usize, Result<()>)> = stream::iter(runnable)
                .map(|(i, work)| async move { (i, work().await) })
                .buffer_unordered(limit)
                .collect()
                .await;
            for (i, result) in results {
                outcomes[i] = Some(match result {
                    Ok(()) => Outcome::Done,
                    Err(e) => {
                        warn!("{} failed: {}", names[i], e);
                        Outcome::Failed(e)
                    }
                });
                order.push(i);
            }
        }

        let mut report = Report::default();
        for i in order {
            if let Some(outcome) = outcomes[i].take() {
                report.outcomes.push((names[i].clone(), outcome));
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn deps(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_runs_in_dependency_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut seq = Sequencer::new(0);
        for (name, after) in [("web", deps(&["db", "cache"])), ("db", vec![]), ("cache", deps(&["db"]))] {
            let log = log.clone();
            seq.add(name, after, move || {
                async move {
                    log.lock().unwrap().push(name);
                    Ok(())
                }
                .boxed()
            });
        }
        let report = seq.run(&CancellationToken::new()).await.unwrap();
        assert!(!report.failed());
        assert_eq!(*log.lock().unwrap(), vec!["db", "cache", "web"]);
    }

    #[tokio::test]
    async fn test_failure_skips_dependents_only() {
        let mut seq = Sequencer::new(2);
        seq.add("db", vec![], || async { Err(CtlError::usage("db broke")) }.boxed());
        seq.add("web", deps(&["db"]), || async { Ok(()) }.boxed());
        seq.add("worker", deps(&["web"]), || async { Ok(()) }.boxed());
        seq.add("cache", vec![], || async { Ok(()) }.boxed());
        let report = seq.run(&CancellationToken::new()).await.unwrap();
        assert!(report.failed());
        assert!(matches!(report.outcome("db"), Some(Outcome::Failed(_))));
        assert!(matches!(report.outcome("web"), Some(Outcome::Skipped)));
        assert!(matches!(report.outcome("worker"), Some(Outcome::Skipped)));
        assert!(matches!(report.outcome("cache"), Some(Outcome::Done)));

        let err = report.into_result().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("db broke"));
        assert!(message.contains("web"));
        assert!(message.contains("worker"));
    }

    #[tokio::test]
    async fn test_cycle_names_participants() {
        let mut seq = Sequencer::new(0);
        seq.add("a", deps(&["c"]), || async { Ok(()) }.boxed());
        seq.add("b", deps(&["a"]), || async { Ok(()) }.boxed());
        seq.add("c", deps(&["b"]), || async { Ok(()) }.boxed());
        seq.add("d", deps(&["c"]), || async { Ok(()) }.boxed());
        seq.add("e", vec![], || async { Ok(()) }.boxed());
        match seq.run(&CancellationToken::new()).await {
            Err(CtlError::DependencyCycle(members)) => assert_eq!(members, deps(&["a", "b", "c"])),
            other => panic!("expected a cycle, got {:?}", other.map(|_| ())),
        }

        let mut seq = Sequencer::new(0);
        seq.add("a", deps(&["missing"]), || async { Ok(()) }.boxed());
        assert!(seq.run(&CancellationToken::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_parallelism_bound() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut seq = Sequencer::new(2);
        for i in 0..6 {
            let running = running.clone();
            let peak = peak.clone();
            seq.add(format!("op{}", i), vec![], move || {
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
                .boxed()
            });
        }
        seq.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }
}
