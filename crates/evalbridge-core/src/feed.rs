//! Change feed: re-evaluates watched files when they are written.
//!
//! The file set is a glob pattern, re-enumerated on a fixed interval so files
//! created later are picked up on the next tick. Only writes to files already
//! being watched are delivered promptly.
//!
//! Each modified file becomes an `eval` submission through the broker, in its
//! own task, so a slow reply for one file never holds up the next. File
//! errors are logged and never stop the feed.

use crate::broker::Broker;
use crate::cancel::{CallContext, CancellationToken};
use crate::config::FeedSettings;
use crate::envelope::Envelope;
use crate::error::{BridgeError, Result};
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// File-modification producer feeding `eval` envelopes into the broker.
pub struct ChangeFeed {
    broker: Arc<Broker>,
    settings: FeedSettings,
    watched: HashSet<PathBuf>,
}

impl ChangeFeed {
    /// Create a feed. Fails if the file pattern is not a valid glob.
    pub fn new(broker: Arc<Broker>, settings: FeedSettings) -> Result<Self> {
        glob::Pattern::new(&settings.pattern)?;
        Ok(Self {
            broker,
            settings,
            watched: HashSet::new(),
        })
    }

    pub fn settings(&self) -> &FeedSettings {
        &self.settings
    }

    /// Run the feed in a background task until `token` is cancelled.
    pub fn spawn(self, token: CancellationToken) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            let result = self.run(token).await;
            if let Err(e) = &result {
                error!("Change feed stopped: {}", e);
            }
            result
        })
    }

    /// Watch, rescan and submit until `token` is cancelled.
    ///
    /// Only failing to create the OS watcher is an error; everything after
    /// that is logged.
    pub async fn run(mut self, token: CancellationToken) -> Result<()> {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |event| {
            let _ = event_tx.send(event);
        })?;

        info!(
            "Change feed watching {} (rescan every {:?})",
            self.settings.pattern, self.settings.rescan_interval
        );
        self.rescan(&mut watcher, false);

        let mut ticker = tokio::time::interval(self.settings.rescan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!("Change feed stopping");
                    return Ok(());
                }
                event = event_rx.recv() => match event {
                    Some(Ok(event)) => self.on_event(event),
                    Some(Err(e)) => error!("File watcher error: {}", e),
                    None => {
                        warn!("File watcher channel closed");
                        return Ok(());
                    }
                },
                _ = ticker.tick() => {
                    self.rescan(&mut watcher, true);
                }
            }
        }
    }

    /// Watch every matching file. Returns how many were not watched before.
    ///
    /// Known files are re-armed too: an editor that saves by renaming over
    /// the original leaves the old watch pointing at a dead inode.
    fn rescan<W: Watcher>(&mut self, watcher: &mut W, quiet: bool) -> usize {
        let files = match matching_files(&self.settings.pattern) {
            Ok(files) => files,
            Err(e) => {
                error!("Enumerating {}: {}", self.settings.pattern, e);
                return 0;
            }
        };

        let mut added = 0;
        for path in files {
            if let Err(e) = watcher.watch(&path, RecursiveMode::NonRecursive) {
                error!("Watching {}: {}", path.display(), e);
                self.watched.remove(&path);
                continue;
            }
            if self.watched.contains(&path) {
                continue;
            }
            if !quiet {
                info!("watcher add {}", path.display());
            } else {
                debug!("watcher add {}", path.display());
            }
            self.watched.insert(path);
            added += 1;
        }
        added
    }

    fn on_event(&mut self, event: Event) {
        if is_removal(&event.kind) {
            // Let the next rescan pick the path up again if it comes back.
            for path in &event.paths {
                self.watched.remove(path);
            }
            return;
        }
        if !is_write_event(&event.kind) {
            return;
        }
        for path in event.paths {
            info!("modified {}", path.display());
            self.submit_file(path);
        }
    }

    /// Fire-and-forget evaluation of one file.
    fn submit_file(&self, path: PathBuf) -> JoinHandle<()> {
        let broker = self.broker.clone();
        let ctx = CallContext::with_timeout(self.settings.submit_timeout);
        tokio::spawn(async move {
            match eval_file(&broker, &path, &ctx).await {
                Ok(reply) => debug!("{} evaluated: {}", path.display(), reply.result()),
                Err(BridgeError::Io { message, .. }) => {
                    warn!("Reading {}: {}", path.display(), message)
                }
                Err(e) => warn!("Evaluating {}: {}", path.display(), e),
            }
        })
    }
}

/// Read `path` and submit its content as an `eval` envelope.
pub async fn eval_file(broker: &Broker, path: &Path, ctx: &CallContext) -> Result<Envelope> {
    let code = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| BridgeError::io_with_path(e, path))?;
    broker.eval(code, ctx).await
}

/// Enumerate the files matching `pattern`, skipping unreadable entries.
pub fn matching_files(pattern: &str) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in glob::glob(pattern)? {
        match entry {
            Ok(path) if path.is_file() => files.push(path),
            Ok(_) => {}
            Err(e) => warn!("Skipping {}: {}", e.path().display(), e.error()),
        }
    }
    Ok(files)
}

/// Whether a watcher event means the file content was written.
pub fn is_write_event(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any)
    )
}

fn is_removal(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Remove(_))
}
