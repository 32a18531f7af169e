//! Job poller
//!
//! Long-polls the server for work in `slots` parallel loops. Shutdown stops
//! the loops from pulling; jobs already running are finished and reported.

use convoy_core::dto::rpc::NextRequest;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::engine::ContainerEngine;
use crate::peer::{Peer, PeerError};
use crate::pipeline::Executor;
use crate::retry::RetryPolicy;
use crate::scheduler::JobRunner;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("slot {slot} stopped: {source}")]
    Slot {
        slot: usize,
        #[source]
        source: PeerError,
    },

    #[error("slot task failed: {0}")]
    Join(#[from] JoinError),
}

pub struct JobPoller {
    slots: usize,
    request: NextRequest,
    retry: RetryPolicy,
    peer: Arc<dyn Peer>,
    runner: Arc<JobRunner>,
}

impl JobPoller {
    pub fn new(config: &Config, peer: Arc<dyn Peer>, engine: Arc<dyn ContainerEngine>) -> Self {
        let executor = Executor::new(engine, config.agent_id.clone());
        let runner = Arc::new(JobRunner::new(config, peer.clone(), executor));
        Self {
            slots: config.slots,
            request: NextRequest {
                agent_id: config.agent_id.clone(),
                labels: config.labels.clone(),
            },
            retry: config.retry.clone(),
            peer,
            runner,
        }
    }

    /// Runs every slot until `shutdown` fires or a slot fails
    ///
    /// A failing slot stops the others too; its error is returned.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), AgentError> {
        info!(
            "Starting {} slot(s) for agent {}",
            self.slots, self.request.agent_id
        );

        let mut slots = JoinSet::new();
        for slot in 0..self.slots {
            let worker = Slot {
                index: slot,
                request: self.request.clone(),
                retry: self.retry.clone(),
                peer: self.peer.clone(),
                runner: self.runner.clone(),
            };
            slots.spawn(worker.run(shutdown.clone()));
        }

        let mut result = Ok(());
        while let Some(joined) = slots.join_next().await {
            let failure = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(e) => AgentError::Join(e),
            };
            error!("{}", failure);
            shutdown.cancel();
            if result.is_ok() {
                result = Err(failure);
            }
        }

        info!("All slots stopped");
        result
    }
}

struct Slot {
    index: usize,
    request: NextRequest,
    retry: RetryPolicy,
    peer: Arc<dyn Peer>,
    runner: Arc<JobRunner>,
}

impl Slot {
    async fn run(self, shutdown: CancellationToken) -> Result<(), AgentError> {
        debug!("Slot {} polling", self.index);

        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = self.retry.run("next", || self.peer.next(&self.request)) => next,
            };

            match next {
                Ok(Some(work)) => {
                    let job_id = work.job.id;
                    info!("Slot {} took job {}", self.index, job_id);
                    self.runner.run(work).await.map_err(|source| AgentError::Slot {
                        slot: self.index,
                        source,
                    })?;
                }
                Ok(None) => debug!("Slot {}: no work available", self.index),
                Err(source @ PeerError::Exhausted { .. }) => {
                    return Err(AgentError::Slot {
                        slot: self.index,
                        source,
                    });
                }
                Err(e) => {
                    warn!("Slot {}: next refused: {}", self.index, e);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.retry.max) => {}
                    }
                }
            }
        }

        debug!("Slot {} stopped", self.index);
        Ok(())
    }
}
