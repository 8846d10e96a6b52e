//! # Scriptable in-process runtime.
//!
//! [`InMemoryRuntime`] simulates containers on the tokio clock. Each launch consumes the
//! next [`Behavior`] scripted for its image (or the default behavior), which decides how
//! long the container stays `starting`, how long it runs, its exit code and its output.
//!
//! Faults can be injected: transient failures per operation, launch errors, and external
//! removal of a container (the backend "forgets" it, so `status` reports `Missing`).

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream;
use tokio::time::Instant;

use super::{ContainerRuntime, ContainerStatus, LaunchSpec, LogLine, LogStream, RuntimeHandle};
use crate::error::RuntimeError;

/// Exit code reported for a container terminated by `stop`.
const STOPPED_EXIT_CODE: i32 = 143;
const TAIL_POLL: Duration = Duration::from_millis(250);

/// Scripted lifetime of one simulated container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Behavior {
    /// Time spent in `starting`.
    pub startup: Duration,
    /// Time spent `running` before exiting; `None` runs until stopped.
    pub run_for: Option<Duration>,
    pub exit_code: i32,
    /// Output printed right after start.
    pub output: Vec<String>,
    /// Launch fails with this error instead of creating a container.
    pub launch_error: Option<RuntimeError>,
}

impl Behavior {
    /// Starts immediately and runs until stopped.
    pub fn run_forever() -> Self {
        Self {
            startup: Duration::ZERO,
            run_for: None,
            exit_code: 0,
            output: Vec::new(),
            launch_error: None,
        }
    }

    /// Starts immediately and exits with `code` after `after`.
    pub fn exit_after(after: Duration, code: i32) -> Self {
        Self {
            run_for: Some(after),
            exit_code: code,
            ..Self::run_forever()
        }
    }

    /// Launch is rejected with `err`.
    pub fn fail_launch(err: RuntimeError) -> Self {
        Self {
            launch_error: Some(err),
            ..Self::run_forever()
        }
    }

    pub fn with_startup(mut self, startup: Duration) -> Self {
        self.startup = startup;
        self
    }

    pub fn with_output<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output = lines.into_iter().map(Into::into).collect();
        self
    }
}

impl Default for Behavior {
    fn default() -> Self {
        Self::run_forever()
    }
}

struct SimContainer {
    name: String,
    launched_at: Instant,
    behavior: Behavior,
    stopped: bool,
}

impl SimContainer {
    fn status(&self, now: Instant) -> ContainerStatus {
        if self.stopped {
            return ContainerStatus::Exited {
                code: STOPPED_EXIT_CODE,
            };
        }
        let elapsed = now.saturating_duration_since(self.launched_at);
        if elapsed < self.behavior.startup {
            return ContainerStatus::Starting;
        }
        match self.behavior.run_for {
            Some(run) if elapsed >= self.behavior.startup + run => ContainerStatus::Exited {
                code: self.behavior.exit_code,
            },
            _ => ContainerStatus::Running,
        }
    }
}

#[derive(Default)]
struct SimState {
    containers: HashMap<String, SimContainer>,
    by_name: HashMap<String, String>,
    scripts: HashMap<String, VecDeque<Behavior>>,
    default: Behavior,
    transient: HashMap<&'static str, u32>,
    launches: Vec<LaunchSpec>,
    launch_delay: Duration,
    next_id: u64,
}

impl SimState {
    fn take_transient(&mut self, op: &'static str) -> Result<(), RuntimeError> {
        match self.transient.get_mut(op) {
            Some(left) if *left > 0 => {
                *left -= 1;
                Err(RuntimeError::Transient {
                    op,
                    error: "simulated daemon hiccup".into(),
                })
            }
            _ => Ok(()),
        }
    }
}

/// Simulated container backend. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct InMemoryRuntime {
    state: Arc<Mutex<SimState>>,
}

impl InMemoryRuntime {
    /// Every container runs forever unless scripted otherwise.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every launch without a script uses `behavior`.
    pub fn with_default(behavior: Behavior) -> Self {
        let rt = Self::new();
        rt.lock().default = behavior;
        rt
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        // Poisoning is ignored; the simulated state stays usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queues behaviors for successive launches of `image`.
    pub fn script<I>(&self, image: &str, behaviors: I)
    where
        I: IntoIterator<Item = Behavior>,
    {
        self.lock()
            .scripts
            .entry(image.to_string())
            .or_default()
            .extend(behaviors);
    }

    /// Makes the next `times` calls of `op` (`launch`, `status`, `stop`, `logs`) fail
    /// transiently.
    pub fn fail_next(&self, op: &'static str, times: u32) {
        self.lock().transient.insert(op, times);
    }

    /// Every launch takes `by` before the container exists; models a slow image pull.
    pub fn delay_launches(&self, by: Duration) {
        self.lock().launch_delay = by;
    }

    /// Forgets a container as if it was deleted behind the orchestrator's back.
    pub fn remove_externally(&self, handle: &str) -> bool {
        let mut state = self.lock();
        match state.containers.remove(handle) {
            Some(c) => {
                state.by_name.remove(&c.name);
                true
            }
            None => false,
        }
    }

    /// All launch specs accepted or rejected so far, in order.
    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.lock().launches.clone()
    }

    pub fn launch_count(&self) -> usize {
        self.lock().launches.len()
    }

    /// Handle of the container with this name, if it exists.
    pub fn handle_for(&self, name: &str) -> Option<String> {
        self.lock().by_name.get(name).cloned()
    }

    /// Containers currently in `starting` or `running`.
    pub fn live_count(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .containers
            .values()
            .filter(|c| {
                matches!(
                    c.status(now),
                    ContainerStatus::Starting | ContainerStatus::Running
                )
            })
            .count()
    }
}

#[async_trait]
impl ContainerRuntime for InMemoryRuntime {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<RuntimeHandle, RuntimeError> {
        let delay = self.lock().launch_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.lock();
        state.take_transient("launch")?;

        if let Some(handle) = state.by_name.get(&spec.name) {
            return Err(RuntimeError::AlreadyExists {
                name: spec.name.clone(),
                handle: handle.clone(),
            });
        }

        state.launches.push(spec.clone());
        let behavior = match state.scripts.get_mut(&spec.image).and_then(VecDeque::pop_front) {
            Some(b) => b,
            None => state.default.clone(),
        };
        if let Some(err) = behavior.launch_error.clone() {
            return Err(err);
        }

        state.next_id += 1;
        let handle = format!("sim-{:06}", state.next_id);
        state.by_name.insert(spec.name.clone(), handle.clone());
        state.containers.insert(
            handle.clone(),
            SimContainer {
                name: spec.name.clone(),
                launched_at: Instant::now(),
                behavior,
                stopped: false,
            },
        );
        Ok(RuntimeHandle::new(handle))
    }

    async fn status(&self, handle: &RuntimeHandle) -> Result<ContainerStatus, RuntimeError> {
        let mut state = self.lock();
        state.take_transient("status")?;
        Ok(state
            .containers
            .get(handle.as_str())
            .map_or(ContainerStatus::Missing, |c| c.status(Instant::now())))
    }

    async fn stop(&self, handle: &RuntimeHandle, _grace: Duration) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        state.take_transient("stop")?;
        match state.containers.remove(handle.as_str()) {
            Some(mut c) => {
                c.stopped = true;
                state.by_name.remove(&c.name);
                Ok(())
            }
            None => Err(RuntimeError::NotFound {
                handle: handle.to_string(),
            }),
        }
    }

    async fn tail_logs(
        &self,
        handle: &RuntimeHandle,
        from_offset: u64,
    ) -> Result<LogStream, RuntimeError> {
        {
            let mut state = self.lock();
            state.take_transient("logs")?;
            if !state.containers.contains_key(handle.as_str()) {
                return Err(RuntimeError::NotFound {
                    handle: handle.to_string(),
                });
            }
        }

        let rt = self.clone();
        let handle = handle.as_str().to_string();
        let lines = stream::unfold(from_offset, move |offset| {
            let rt = rt.clone();
            let handle = handle.clone();
            async move {
                loop {
                    let wait = {
                        let state = rt.lock();
                        let container = state.containers.get(&handle)?;
                        if let Some(line) = container.behavior.output.get(offset as usize) {
                            let out = LogLine {
                                offset,
                                at: Utc::now(),
                                line: line.clone(),
                            };
                            return Some((out, offset + 1));
                        }
                        let now = Instant::now();
                        match container.status(now) {
                            ContainerStatus::Exited { .. } | ContainerStatus::Missing => {
                                return None;
                            }
                            _ => {}
                        }
                        match container.behavior.run_for {
                            Some(run) => (container.launched_at + container.behavior.startup + run)
                                .saturating_duration_since(now)
                                .min(TAIL_POLL),
                            None => TAIL_POLL,
                        }
                    };
                    tokio::time::sleep(wait).await;
                }
            }
        });
        Ok(Box::pin(lines))
    }
}
