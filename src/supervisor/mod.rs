//! Session supervision: one worker task per configured stream.
//!
//! The supervisor owns the run context: the parsed stream specs, the
//! shared-output registry, the source, and the root cancellation token.
//! Workers share nothing but the registry.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Local;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Config, StreamSpec};
use crate::flush::FlushState;
use crate::session::StreamSession;
use crate::sink::shared::SharedRegistry;
use crate::sink::{CsvFileSink, SinkTarget};
use crate::source::{discover_stream, Inlet, Source};

pub struct Supervisor<S: Source> {
    cfg: Arc<Config>,
    specs: Vec<StreamSpec>,
    source: Arc<S>,
    shared: Arc<SharedRegistry>,
    cancel: CancellationToken,
}

impl<S: Source> Supervisor<S> {
    /// Builds the run context. Shared outputs named anywhere in the specs
    /// are registered here, before any session starts.
    pub fn new(cfg: Config, specs: Vec<StreamSpec>, source: S) -> Self {
        let shared = Arc::new(SharedRegistry::new(
            cfg.output_dir.clone(),
            cfg.durability,
        ));

        for spec in &specs {
            if let Some(name) = &spec.shared_output {
                shared.ensure(name);
            }
        }

        Self {
            cfg: Arc::new(cfg),
            specs,
            source: Arc::new(source),
            shared,
            cancel: CancellationToken::new(),
        }
    }

    /// Token observed by every worker; cancelling it stalls all sessions.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Requests a global shutdown: every live session is marked stalled
    /// and given its trailing flush before the workers exit.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs every configured stream to completion. A stream that fails to
    /// start or crashes mid-run never takes the others down with it.
    pub async fn run(&self) -> Result<()> {
        std::fs::create_dir_all(&self.cfg.output_dir).with_context(|| {
            format!("creating output dir {}", self.cfg.output_dir.display())
        })?;

        let mut workers = Vec::with_capacity(self.specs.len());
        for spec in self.specs.iter().cloned() {
            let cfg = Arc::clone(&self.cfg);
            let source = Arc::clone(&self.source);
            let shared = Arc::clone(&self.shared);
            let cancel = self.cancel.clone();
            let name = spec.name.clone();

            let handle =
                tokio::spawn(async move { run_worker(cfg, spec, source, shared, cancel).await });
            workers.push((name, handle));
        }

        for (name, handle) in workers {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(stream = %name, error = %e, "stream worker failed"),
                Err(e) => error!(stream = %name, error = %e, "stream worker panicked"),
            }
        }

        Ok(())
    }
}

/// Drives one stream: discover, open, then pull/flush until the session
/// stalls, with exactly one trailing flush on the way out.
async fn run_worker<S: Source>(
    cfg: Arc<Config>,
    spec: StreamSpec,
    source: Arc<S>,
    shared: Arc<SharedRegistry>,
    cancel: CancellationToken,
) -> Result<()> {
    let Some(info) = discover_stream(
        &*source,
        &spec.name,
        spec.keep_searching,
        cfg.discovery_poll_interval,
        &cancel,
    )
    .await?
    else {
        info!(stream = %spec.name, "shutdown before discovery finished");
        return Ok(());
    };

    let inlet = source
        .open(&info)
        .with_context(|| format!("opening inlet for {:?}", spec.name))?;

    let target = match &spec.shared_output {
        Some(name) => SinkTarget::Shared(shared.register(
            name,
            inlet.nominal_rate(),
            inlet.channel_count(),
        )),
        None => {
            let started = Local::now().format("%Y-%m-%d_%H-%M-%S");
            let path = cfg.output_dir.join(format!("{}_{}.csv", spec.name, started));
            SinkTarget::File(CsvFileSink::new(path, cfg.durability))
        }
    };

    let mut session = StreamSession::new(
        spec.name.clone(),
        inlet,
        spec.chunk_size,
        cfg.acceptance_factor,
        target,
    );
    let mut flush_state = FlushState::new(cfg.flush.policy(), Instant::now());

    info!(
        stream = %spec.name,
        rate = session.nominal_rate(),
        channels = session.channel_count(),
        chunk_size = spec.chunk_size,
        shared = spec.shared_output.as_deref().unwrap_or(""),
        "stream started",
    );

    while session.is_live() {
        let pulled = tokio::select! {
            _ = cancel.cancelled() => None,
            outcome = session.pull() => Some(outcome),
        };

        let raw = match pulled {
            Some(Ok(raw)) => raw,
            Some(Err(e)) => {
                warn!(stream = %spec.name, error = %e, "pull failed, stopping stream");
                session.stall();
                break;
            }
            None => {
                session.stall();
                break;
            }
        };

        if spec.log_to_console && !raw.is_empty() {
            info!(
                stream = %spec.name,
                samples = ?raw.samples,
                timestamps = ?raw.timestamps,
                "pulled",
            );
        }

        if flush_state.on_pull(raw.len(), Instant::now()) {
            match session.flush() {
                Ok(()) => flush_state.mark_flushed(Instant::now()),
                Err(e) => {
                    warn!(stream = %spec.name, error = %e, "flush failed, keeping buffer for retry");
                }
            }
        }
    }

    // The one guaranteed persistence pass per session.
    if let Err(e) = session.flush() {
        error!(
            stream = %spec.name,
            error = %e,
            buffered = session.buffer_len(),
            "trailing flush failed, buffered records lost",
        );
    }

    if let SinkTarget::Shared(handle) = session.into_target() {
        if let Err(e) = handle.close() {
            error!(stream = %spec.name, error = %e, "closing shared output failed");
        }
    }

    info!(stream = %spec.name, "stream stopped");
    Ok(())
}
