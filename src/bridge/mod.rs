use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{error, info, warn};
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;

use crate::resolver::ResolutionResult;

/// Which iteration strategy the running pass uses. Callers that start a
/// repair pass reset to `VersionCheck` once the pass reports back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassKind {
    VersionCheck,
    Repair,
}

/// Terminal outcome of a pass. Cancellation discards any partial result
/// the resolver accumulated before the flag was observed.
#[derive(Debug)]
pub enum PassOutcome {
    Completed(ResolutionResult),
    Cancelled,
}

/// Handle to one resolution pass running on the Tokio runtime while the
/// owning thread stays responsive and polls. A handle only exists while
/// the pass is running; `finish` consumes it, so a fresh pass needs a
/// fresh handle.
pub struct UpdatePass {
    kind: PassKind,
    cancel: Arc<AtomicBool>,
    task: JoinHandle<ResolutionResult>,
}

impl UpdatePass {
    /// Spawn the resolution future in the background. The future must
    /// observe the same `cancel` flag at its per-mod checkpoints.
    pub fn spawn<F>(runtime: &Runtime, kind: PassKind, cancel: Arc<AtomicBool>, pass: F) -> Self
    where
        F: Future<Output = ResolutionResult> + Send + 'static,
    {
        info!("bridge: starting {kind:?} pass");
        let task = runtime.spawn(pass);
        Self { kind, cancel, task }
    }

    pub fn kind(&self) -> PassKind {
        self.kind
    }

    /// Raise the shared cancellation flag. The background task keeps
    /// running until its next checkpoint; the outcome becomes `Cancelled`
    /// regardless of what it returns.
    pub fn request_cancel(&self) {
        if !self.cancel.swap(true, Ordering::SeqCst) {
            warn!("bridge: cancellation requested");
        }
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Join the background task and classify the outcome. Blocks only for
    /// as long as the task still needs to reach its next checkpoint.
    pub fn finish(self, runtime: &Runtime) -> PassOutcome {
        let joined = runtime.block_on(self.task);
        if self.cancel.load(Ordering::SeqCst) {
            info!("bridge: {:?} pass cancelled", self.kind);
            return PassOutcome::Cancelled;
        }
        match joined {
            Ok(result) => {
                info!("bridge: {:?} pass completed", self.kind);
                PassOutcome::Completed(result)
            }
            Err(err) => {
                error!("bridge: {:?} pass aborted: {err}", self.kind);
                PassOutcome::Completed(ResolutionResult {
                    updates: Vec::new(),
                    errors: vec![format!("update pass aborted unexpectedly: {err}")],
                })
            }
        }
    }

    /// Poll loop for callers without their own event loop: runs `tick`
    /// between polls (cancellation checks, redraws) until the background
    /// task finishes, then delivers the outcome.
    pub fn supervise<T>(self, runtime: &Runtime, mut tick: T) -> PassOutcome
    where
        T: FnMut(&UpdatePass),
    {
        while !self.is_finished() {
            tick(&self);
            std::thread::sleep(Duration::from_millis(50));
        }
        self.finish(runtime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{DownloadKind, UpdateCandidate};

    fn runtime() -> Runtime {
        Runtime::new().expect("test runtime")
    }

    fn one_update() -> ResolutionResult {
        ResolutionResult {
            updates: vec![UpdateCandidate {
                dir_key: "TestMod".into(),
                name: "Test Mod".into(),
                kind: DownloadKind::Release {
                    tag: "1.3.0".into(),
                    url: "http://dl.example/TestMod.7z".into(),
                    size: 1,
                },
            }],
            errors: Vec::new(),
        }
    }

    #[test]
    fn completed_pass_delivers_the_result() {
        let rt = runtime();
        let cancel = Arc::new(AtomicBool::new(false));
        let pass = UpdatePass::spawn(&rt, PassKind::VersionCheck, cancel, async { one_update() });
        match pass.supervise(&rt, |_| {}) {
            PassOutcome::Completed(result) => {
                assert_eq!(result.updates.len(), 1);
                assert_eq!(result.updates[0].dir_key, "TestMod");
            }
            PassOutcome::Cancelled => panic!("pass should have completed"),
        }
    }

    #[test]
    fn cancellation_discards_partial_results() {
        let rt = runtime();
        let cancel = Arc::new(AtomicBool::new(false));
        let observed = cancel.clone();
        // Stand-in for a resolver that keeps hitting its per-mod
        // checkpoint until the flag is raised, then returns its partial
        // accumulation.
        let pass = UpdatePass::spawn(&rt, PassKind::VersionCheck, cancel, async move {
            while !observed.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            one_update()
        });

        let outcome = pass.supervise(&rt, |pass| pass.request_cancel());
        assert!(matches!(outcome, PassOutcome::Cancelled));
    }

    #[test]
    fn repair_kind_is_observable_for_mode_reset() {
        let rt = runtime();
        let cancel = Arc::new(AtomicBool::new(false));
        let pass = UpdatePass::spawn(&rt, PassKind::Repair, cancel, async {
            ResolutionResult::default()
        });
        assert_eq!(pass.kind(), PassKind::Repair);
        let _ = pass.supervise(&rt, |_| {});
    }
}
