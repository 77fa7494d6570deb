//! The public handle and its scheduler.
//!
//! Every instance runs one actor task owning the [`Core`]; a command queue
//! serialises reads, updates, rebase checks and the local side of compaction.
//! Background timers enqueue periodic compactions and rebase checks, and exit
//! when the queue closes.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Notify};

use crate::compact;
use crate::merge::Merge;
use crate::state::{Core, HookFn, Updater};
use crate::{Config, Error, Result};

/// Fired detached after a successful compaction with the merged value and
/// the base it was derived from. A panicking hook cannot affect the database.
pub type PostCompactionHook = Box<dyn Fn(Arc<Value>, Arc<Value>) + Send + Sync>;

enum Command {
    Get(oneshot::Sender<Arc<Value>>),
    Update(Updater, oneshot::Sender<Result<Arc<Value>>>),
    Compact(Option<oneshot::Sender<Result<()>>>),
    CheckRebase(Option<oneshot::Sender<Result<()>>>),
    Close(oneshot::Sender<()>),
}

/// Handle to one process's view of a fishtrap database.
///
/// Cheap to clone; all clones share the same instance and queue.
#[derive(Clone)]
pub struct Database {
    shared: Arc<Shared>,
}

struct Shared {
    cfg: Arc<Config>,
    initial: Arc<Value>,
    merger: Arc<dyn Merge>,
    hook: Option<Arc<HookFn>>,
    queue: Mutex<Option<mpsc::UnboundedSender<Command>>>,
}

impl Database {
    /// Open the database: run the open procedure against the base directory
    /// and start the instance's actor and timers.
    pub async fn new<M: Merge>(
        config: Config,
        initial: Value,
        merger: M,
        hook: Option<PostCompactionHook>,
    ) -> Result<Database> {
        let db = Database {
            shared: Arc::new(Shared {
                cfg: Arc::new(config),
                initial: Arc::new(initial),
                merger: Arc::new(merger),
                hook: hook.map(Arc::from),
                queue: Mutex::new(None),
            }),
        };
        db.spawn_actor().await?;
        Ok(db)
    }

    /// Current immutable value, after all previously enqueued work.
    pub async fn get(&self) -> Result<Arc<Value>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Get(reply))?;
        rx.await.map_err(|_| Error::DatabaseClosed)
    }

    /// Enqueue a mutation and resolve with the updated value. The updater
    /// runs over a working copy; returning an error leaves state unchanged.
    pub async fn update<F>(&self, updater: F) -> Result<Arc<Value>>
    where
        F: FnOnce(&mut Value) -> anyhow::Result<()> + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Update(Box::new(updater), reply))?;
        rx.await.map_err(|_| Error::DatabaseClosed)?
    }

    /// Attempt a compaction right now, surfacing the outcome.
    pub async fn force_compaction(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Compact(Some(reply)))?;
        rx.await.map_err(|_| Error::DatabaseClosed)?
    }

    /// Run a rebase check right now, surfacing the outcome.
    pub async fn force_check_rebase(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::CheckRebase(Some(reply)))?;
        rx.await.map_err(|_| Error::DatabaseClosed)?
    }

    /// Drain the queue, stop the actor and mark the handle closed. Every
    /// subsequent call rejects with [`Error::DatabaseClosed`] until `open`.
    pub async fn close(&self) -> Result<()> {
        let sender = self
            .shared
            .queue
            .lock()
            .unwrap()
            .take()
            .ok_or(Error::DatabaseClosed)?;
        let (reply, rx) = oneshot::channel();
        sender
            .send(Command::Close(reply))
            .map_err(|_| Error::DatabaseClosed)?;
        rx.await.map_err(|_| Error::DatabaseClosed)
    }

    /// Re-run the open procedure and restart the actor. A no-op when the
    /// handle is already open.
    pub async fn open(&self) -> Result<()> {
        self.spawn_actor().await
    }

    fn send(&self, command: Command) -> Result<()> {
        let guard = self.shared.queue.lock().unwrap();
        let sender = guard.as_ref().ok_or(Error::DatabaseClosed)?;
        sender.send(command).map_err(|_| Error::DatabaseClosed)
    }

    async fn spawn_actor(&self) -> Result<()> {
        let (sender, receiver) = mpsc::unbounded_channel();
        {
            let mut guard = self.shared.queue.lock().unwrap();
            if guard.is_some() {
                return Ok(());
            }
            *guard = Some(sender.clone());
        }

        let compact_soon = Arc::new(Notify::new());
        let core = match Core::open(
            self.shared.cfg.clone(),
            self.shared.initial.clone(),
            self.shared.merger.clone(),
            self.shared.hook.clone(),
            compact_soon.clone(),
        )
        .await
        {
            Ok(core) => core,
            Err(err) => {
                *self.shared.queue.lock().unwrap() = None;
                return Err(err);
            }
        };

        spawn_timers(&self.shared.cfg, &sender, compact_soon);
        tokio::spawn(run_actor(core, receiver));
        Ok(())
    }
}

async fn run_actor(mut core: Core, mut receiver: mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = receiver.recv().await {
        match command {
            Command::Get(reply) => {
                let _ = reply.send(core.data());
            }
            Command::Update(updater, reply) => {
                let _ = reply.send(core.update(updater).await);
            }
            Command::Compact(reply) => {
                let result = compact::compact(&mut core).await;
                match &result {
                    Ok(()) => {}
                    Err(err) if is_recoverable_abort(err) => {
                        tracing::info!(%err, "compaction yielded")
                    }
                    Err(err) => tracing::warn!(%err, "compaction failed"),
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            Command::CheckRebase(reply) => {
                let result = core.check_rebase().await;
                if let Err(err) = &result {
                    tracing::warn!(%err, "rebase check failed");
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            Command::Close(reply) => {
                let _ = reply.send(());
                return;
            }
        }
    }
}

/// Ordinary contention outcomes: another process got there first, or there
/// was nothing to do.
fn is_recoverable_abort(err: &Error) -> bool {
    matches!(
        err,
        Error::AlreadyLocked | Error::CouldNotLock | Error::NoShards
    )
}

fn spawn_timers(
    cfg: &Config,
    sender: &mpsc::UnboundedSender<Command>,
    compact_soon: Arc<Notify>,
) {
    if cfg.compaction_interval_minutes > 0 {
        let sender = sender.clone();
        let interval = Duration::from_secs(cfg.compaction_interval_minutes * 60);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sender.closed() => return,
                    _ = tokio::time::sleep(interval) => {}
                    _ = compact_soon.notified() => {
                        // The shard outgrew its threshold; compact early.
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
                if sender.send(Command::Compact(None)).is_err() {
                    return;
                }
            }
        });
    }

    if cfg.check_interval_minutes > 0 {
        let sender = sender.clone();
        let interval = Duration::from_secs(cfg.check_interval_minutes * 60);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sender.closed() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                if sender.send(Command::CheckRebase(None)).is_err() {
                    return;
                }
            }
        });
    }
}
