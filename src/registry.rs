//! Unique work registry: logical name -> chain of graph runs
//!
//! Each name maps to the runs submitted under it, oldest first. Appended
//! runs extend the chain; a replacement cancels the chain and starts a new
//! one. The tail of a chain is what lookups by name report. All access is
//! serialized through one lock, so two submissions under the same name can
//! never both become active.

use crate::models::ExistingWorkPolicy;
use crate::state::GraphRun;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::info;

/// How a new run under a unique name gets started
#[derive(Debug, Clone)]
pub enum Admission {
    /// Nothing to wait for
    Start,
    /// Start once every replaced run has drained
    AfterReplaced(Vec<Arc<GraphRun>>),
    /// Start after `predecessor` finishes, consuming its output
    AfterAppended {
        predecessor: Arc<GraphRun>,
        /// Whether a failed or cancelled predecessor fails the new run
        inherit_failure: bool,
    },
}

/// Outcome of submitting a run under a unique name
#[derive(Debug, Clone)]
pub enum Resolution {
    /// The new run joined the chain and must be driven
    Launch(Admission),
    /// The new run was discarded in favour of this unfinished one
    Kept(Arc<GraphRun>),
}

#[derive(Debug, Default)]
pub struct UniqueWorkRegistry {
    chains: Mutex<HashMap<String, Vec<Arc<GraphRun>>>>,
}

impl UniqueWorkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `policy` for `run` submitted under `name`.
    ///
    /// Unless the result is [`Resolution::Kept`], `run` becomes the tail of
    /// the chain before this returns. A replaced chain is cancelled here.
    pub fn admit(&self, name: &str, policy: ExistingWorkPolicy, run: Arc<GraphRun>) -> Resolution {
        let mut chains = self.lock();
        let chain = chains.entry(name.to_string()).or_default();

        match policy {
            ExistingWorkPolicy::Replace => {
                let replaced: Vec<Arc<GraphRun>> = std::mem::take(chain)
                    .into_iter()
                    .filter(|old| !old.is_drained())
                    .collect();
                for old in &replaced {
                    if old.cancel() {
                        info!("Replaced graph {} under '{}'", old.id(), name);
                    }
                }
                chain.push(run);
                if replaced.is_empty() {
                    Resolution::Launch(Admission::Start)
                } else {
                    Resolution::Launch(Admission::AfterReplaced(replaced))
                }
            }
            ExistingWorkPolicy::Keep => {
                let active = chain.iter().any(|r| !r.is_terminal());
                if let (true, Some(tail)) = (active, chain.last()) {
                    info!("Keeping existing graph {} under '{}'", tail.id(), name);
                    return Resolution::Kept(tail.clone());
                }
                chain.clear();
                chain.push(run);
                Resolution::Launch(Admission::Start)
            }
            ExistingWorkPolicy::Append | ExistingWorkPolicy::AppendOrReplace => {
                let admission = match chain.last() {
                    Some(tail) => Admission::AfterAppended {
                        predecessor: tail.clone(),
                        inherit_failure: policy == ExistingWorkPolicy::Append,
                    },
                    None => Admission::Start,
                };
                chain.push(run);
                Resolution::Launch(admission)
            }
        }
    }

    /// Currently active run for `name`: the tail of its chain
    pub fn current(&self, name: &str) -> Option<Arc<GraphRun>> {
        self.lock().get(name).and_then(|chain| chain.last().cloned())
    }

    /// Every run under `name`, oldest first
    pub fn chain(&self, name: &str) -> Vec<Arc<GraphRun>> {
        self.lock().get(name).cloned().unwrap_or_default()
    }

    /// Cancel every unfinished run under `name`. Returns how many were cancelled.
    pub fn cancel(&self, name: &str) -> usize {
        let chains = self.lock();
        chains
            .get(name)
            .map(|chain| chain.iter().filter(|run| run.cancel()).count())
            .unwrap_or(0)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Forget finished runs whose drivers have exited; names whose chain
    /// empties are removed
    pub fn prune(&self) -> usize {
        let mut chains = self.lock();
        let mut removed = 0;
        for chain in chains.values_mut() {
            let before = chain.len();
            chain.retain(|run| !(run.is_terminal() && run.is_drained()));
            removed += before - chain.len();
        }
        chains.retain(|_, chain| !chain.is_empty());
        removed
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<Arc<GraphRun>>>> {
        self.chains.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
