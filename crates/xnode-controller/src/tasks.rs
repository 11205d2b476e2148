//! Periodic tasks.

use std::time::Duration;

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, RemoteHandle};
use futures::select_biased;
use futures::task::SpawnExt;
use tor_rtcompat::Runtime;
use tracing::debug;

use crate::{Error, Result};

/// A running periodic task.
pub(crate) struct PeriodicTask {
    /// The task's name, for logging.
    name: &'static str,
    /// Dropping or sending on this asks the task to stop.
    cancel: oneshot::Sender<()>,
    /// Resolves when the task has stopped.
    done: RemoteHandle<()>,
}

impl PeriodicTask {
    /// Spawn a task on `runtime` that runs `cycle` now and then every
    /// `interval`, until cancelled.
    ///
    /// Cycles never overlap: the next sleep starts when a cycle ends.
    pub(crate) fn spawn<R, F>(
        runtime: &R,
        name: &'static str,
        interval: Duration,
        mut cycle: F,
    ) -> Result<Self>
    where
        R: Runtime,
        F: FnMut() -> BoxFuture<'static, ()> + Send + 'static,
    {
        let (cancel, mut cancelled) = oneshot::channel::<()>();
        let sleeper = runtime.clone();
        let task = async move {
            loop {
                cycle().await;
                select_biased! {
                    _ = cancelled => break,
                    () = sleeper.sleep(interval).fuse() => {}
                }
            }
            debug!("{} task stopped", name);
        };
        let done = runtime
            .spawn_with_handle(task)
            .map_err(|e| Error::from_spawn(name, e))?;
        Ok(PeriodicTask { name, cancel, done })
    }

    /// Return the name of this task.
    pub(crate) fn name(&self) -> &'static str {
        self.name
    }

    /// Ask the task to stop, and wait until its current cycle (if any) is
    /// over.
    pub(crate) async fn stop(self) -> Result<()> {
        let PeriodicTask { name, cancel, done } = self;
        cancel
            .send(())
            .map_err(|()| Error::CancelFailed { task: name })?;
        done.await;
        Ok(())
    }
}

impl std::fmt::Debug for PeriodicTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicTask")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    //! <!-- @@ end test lint list @@ -->
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tor_rtcompat::SleepProvider;
    use tor_rtmock::MockRuntime;

    #[test]
    fn runs_every_interval() {
        MockRuntime::test_with_various(|rt| async move {
            let count = Arc::new(AtomicUsize::new(0));
            let c2 = Arc::clone(&count);
            let task = PeriodicTask::spawn(&rt, "count", Duration::from_secs(10), move || {
                let c = Arc::clone(&c2);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                }
                .boxed()
            })
            .unwrap();
            assert_eq!(task.name(), "count");

            rt.progress_until_stalled().await;
            assert_eq!(count.load(Ordering::SeqCst), 1);

            rt.advance_by(Duration::from_secs(9)).await;
            assert_eq!(count.load(Ordering::SeqCst), 1);
            rt.advance_by(Duration::from_secs(1)).await;
            assert_eq!(count.load(Ordering::SeqCst), 2);
            rt.advance_by(Duration::from_secs(30)).await;
            assert_eq!(count.load(Ordering::SeqCst), 5);

            task.stop().await.unwrap();
            rt.advance_by(Duration::from_secs(60)).await;
            assert_eq!(count.load(Ordering::SeqCst), 5);
        });
    }

    #[test]
    fn stop_waits_for_cycle() {
        MockRuntime::test_with_various(|rt| async move {
            let finished = Arc::new(AtomicUsize::new(0));
            let f2 = Arc::clone(&finished);
            let rt2 = rt.clone();
            let task = PeriodicTask::spawn(&rt, "slow", Duration::from_secs(60), move || {
                let f = Arc::clone(&f2);
                let rt = rt2.clone();
                async move {
                    rt.sleep(Duration::from_secs(5)).await;
                    f.fetch_add(1, Ordering::SeqCst);
                }
                .boxed()
            })
            .unwrap();
            rt.progress_until_stalled().await;
            assert_eq!(finished.load(Ordering::SeqCst), 0);

            let (stopped, ()) = futures::join!(task.stop(), async {
                rt.advance_by(Duration::from_secs(5)).await;
            });
            stopped.unwrap();
            assert_eq!(finished.load(Ordering::SeqCst), 1);
        });
    }
}
