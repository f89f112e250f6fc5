//! The `(run, stop)` actor-pair idiom (spec §9): start every actor,
//! capture the first failure, signal every other actor to stop, join, and
//! return that first error.

use std::future::Future;
use std::pin::Pin;

use futures_util::future::FutureExt;
use tokio::sync::watch;

type BoxFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// One actor: its run future plus the means to ask it to stop. `stop`
/// must be idempotent and safe to call while `run` is still executing.
pub struct Actor {
    name: String,
    run: BoxFuture,
    stop: Box<dyn FnOnce() + Send>,
}

impl Actor {
    pub fn new<F>(name: impl Into<String>, run: F, stop: impl FnOnce() + Send + 'static) -> Self
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Actor {
            name: name.into(),
            run: Box::pin(run),
            stop: Box::new(stop),
        }
    }
}

/// Starts a run future wired to a `watch` cancellation channel, the
/// pattern every actor in this crate (writer listeners, consumer,
/// compacter, HTTP API) follows.
pub fn actor_with_cancel<F, Fut>(name: impl Into<String>, cancel: watch::Sender<bool>, rx: watch::Receiver<bool>, make_run: F) -> Actor
where
    F: FnOnce(watch::Receiver<bool>) -> Fut,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let run = make_run(rx);
    Actor::new(name, run, move || {
        let _ = cancel.send(true);
    })
}

pub struct Supervisor {
    actors: Vec<Actor>,
}

impl Supervisor {
    pub fn new() -> Self {
        Supervisor { actors: Vec::new() }
    }

    pub fn add(&mut self, actor: Actor) {
        self.actors.push(actor);
    }

    /// Races every actor's run future. The first to return (success or
    /// error) triggers every stop function; the overall result is the
    /// first error encountered, or `Ok(())` if every actor exited clean.
    pub async fn run(self) -> anyhow::Result<()> {
        let Supervisor { actors } = self;
        let mut names = Vec::with_capacity(actors.len());
        let mut stops = Vec::with_capacity(actors.len());
        let mut futs = Vec::with_capacity(actors.len());
        for actor in actors {
            names.push(actor.name);
            stops.push(actor.stop);
            futs.push(actor.run);
        }

        let (result, index, remaining) = futures_util::future::select_all(futs).await;
        drop(remaining);

        match &result {
            Ok(()) => log::info!("actor {} exited", names[index]),
            Err(e) => log::error!("actor {} failed: {}", names[index], e),
        }

        for stop in stops {
            stop();
        }

        result
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// Adapts a future so a panic inside it becomes an error instead of
/// unwinding through the supervisor.
pub fn catch_unwind(fut: impl Future<Output = anyhow::Result<()>> + Send + 'static) -> BoxFuture {
    Box::pin(std::panic::AssertUnwindSafe(fut).catch_unwind().map(|r| match r {
        Ok(inner) => inner,
        Err(_) => Err(anyhow::anyhow!("actor panicked")),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn first_error_triggers_all_stops_and_is_returned() {
        let mut sup = Supervisor::new();
        let stopped_a = Arc::new(AtomicBool::new(false));
        let stopped_b = Arc::new(AtomicBool::new(false));

        {
            let stopped_a = stopped_a.clone();
            sup.add(Actor::new(
                "failing",
                async { anyhow::bail!("boom") },
                move || stopped_a.store(true, Ordering::SeqCst),
            ));
        }
        {
            let stopped_b = stopped_b.clone();
            sup.add(Actor::new(
                "long-runner",
                async {
                    tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
                    Ok(())
                },
                move || stopped_b.store(true, Ordering::SeqCst),
            ));
        }

        let result = sup.run().await;
        assert!(result.is_err());
        assert!(stopped_a.load(Ordering::SeqCst));
        assert!(stopped_b.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn clean_exit_returns_ok() {
        let mut sup = Supervisor::new();
        sup.add(Actor::new("clean", async { Ok(()) }, || {}));
        assert!(sup.run().await.is_ok());
    }
}
