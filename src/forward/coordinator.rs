use crate::config::RelayConfig;
use crate::error::Result;
use crate::forward::relay::{ChannelRelay, RelayOutcome};
use crate::forward::source::ChannelSource;
use std::sync::Arc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Counters reported when the coordinator stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoordinatorReport {
    /// Channels accepted and handed to a relay.
    pub accepted: u64,
    /// Relays that ran to completion.
    pub completed: u64,
    /// Relays that ended in an error (local connect failure, panic).
    pub failed: u64,
    /// Relays still running when the drain window closed.
    pub aborted: u64,
}

/// Runs the accept loop and owns every relay it spawns.
///
/// One relay task is spawned per accepted channel without waiting for earlier
/// ones. A failed relay is logged and counted; only cancellation or a
/// transport failure ends the loop. On the way out in-flight relays get one
/// drain window to finish before they are aborted, and only then is the
/// source closed.
pub struct RelayCoordinator<S: ChannelSource> {
    source: S,
    local_host: Arc<str>,
    local_port: u16,
    config: RelayConfig,
    cancel: CancellationToken,
    /// Child of `cancel` handed to relays, so a transport failure can stop
    /// them without touching the caller's token.
    relay_cancel: CancellationToken,
    relays: JoinSet<Result<RelayOutcome>>,
    next_id: u64,
    report: CoordinatorReport,
}

impl<S: ChannelSource> RelayCoordinator<S> {
    pub fn new(
        source: S,
        local_host: impl Into<String>,
        local_port: u16,
        config: RelayConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            local_host: Arc::from(local_host.into()),
            local_port,
            config,
            relay_cancel: cancel.child_token(),
            cancel,
            relays: JoinSet::new(),
            next_id: 0,
            report: CoordinatorReport::default(),
        }
    }

    /// The token that stops this coordinator.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Number of relays currently tracked.
    pub fn active_relays(&self) -> usize {
        self.relays.len()
    }

    /// Accept and relay until cancelled or the transport fails, then drain
    /// and close the source.
    pub async fn run(mut self) -> Result<CoordinatorReport> {
        info!(
            "Relaying tunnel connections to {}:{}",
            self.local_host, self.local_port
        );

        let accept_result = self.accept_loop().await;

        self.relay_cancel.cancel();
        self.drain().await;

        if let Err(e) = self.source.close().await {
            warn!("Error while closing tunnel: {}", e);
        }

        info!(
            accepted = self.report.accepted,
            completed = self.report.completed,
            failed = self.report.failed,
            aborted = self.report.aborted,
            "Tunnel closed"
        );

        accept_result.map(|()| self.report)
    }

    async fn accept_loop(&mut self) -> Result<()> {
        let cancel = self.cancel.clone();
        let poll_interval = self.config.poll_interval;

        loop {
            if cancel.is_cancelled() {
                info!("Shutdown requested, no longer accepting connections");
                return Ok(());
            }

            self.reap_finished();

            let accepted = tokio::select! {
                biased;
                _ = cancel.cancelled() => continue,
                accepted = self.source.accept_next(poll_interval) => accepted,
            };

            match accepted {
                Ok(Some(accepted)) => {
                    debug!("New tunnel connection from {}", accepted.peer);
                    self.spawn_relay(accepted.stream);
                }
                Ok(None) => {}
                Err(e) => {
                    error!("Tunnel transport failed: {}", e);
                    return Err(e);
                }
            }
        }
    }

    fn spawn_relay(&mut self, stream: S::Stream) {
        self.next_id += 1;
        self.report.accepted += 1;

        let relay = ChannelRelay::new(
            self.next_id,
            self.config.clone(),
            self.relay_cancel.clone(),
        );
        let local_host = self.local_host.clone();
        let local_port = self.local_port;

        self.relays
            .spawn(async move { relay.run(stream, &local_host, local_port).await });
    }

    /// Collect relays that already finished so the set does not grow with
    /// every connection ever accepted.
    fn reap_finished(&mut self) {
        while let Some(joined) = self.relays.try_join_next() {
            self.record(joined);
        }
    }

    async fn drain(&mut self) {
        if self.relays.is_empty() {
            return;
        }

        debug!(
            "Waiting up to {:?} for {} relays to finish",
            self.config.drain_timeout,
            self.relays.len()
        );

        let deadline = tokio::time::sleep(self.config.drain_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                joined = self.relays.join_next() => match joined {
                    Some(joined) => self.record(joined),
                    None => return,
                },
                _ = &mut deadline => break,
            }
        }

        warn!(
            "Aborting {} relays that did not finish in time",
            self.relays.len()
        );
        self.relays.abort_all();
        while let Some(joined) = self.relays.join_next().await {
            self.record(joined);
        }
    }

    fn record(&mut self, joined: std::result::Result<Result<RelayOutcome>, JoinError>) {
        match joined {
            Ok(Ok(outcome)) => {
                self.report.completed += 1;
                debug!(
                    relay = outcome.id,
                    to_local = outcome.to_local,
                    to_remote = outcome.to_remote,
                    "Relay finished: {}",
                    outcome.reason
                );
            }
            Ok(Err(e)) => {
                self.report.failed += 1;
                warn!("{}", e);
            }
            Err(e) if e.is_cancelled() => {
                self.report.aborted += 1;
            }
            Err(e) => {
                self.report.failed += 1;
                error!("Relay task panicked: {}", e);
            }
        }
    }
}
