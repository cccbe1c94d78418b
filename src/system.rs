//! System wiring.
//!
//! Builds one transport, one coordinator, any number of workers and a
//! gateway, and starts each as its own actor. Nothing here is global: two
//! systems in the same process share no state.

use std::sync::Arc;
use std::time::Duration;

use crate::actors::{ActorHandle, Executor, Gateway, TreeOutcome, Worker};
use crate::config::Config;
use crate::core::task::TaskId;
use crate::decompose::{Decomposer, RuleDecomposer};
use crate::error::Result;
use crate::orchestration::{Coordinator, TaskRequest};
use crate::transport::{Envelope, ParticipantId, Payload, Transport};

pub const COORDINATOR_ID: &str = "coordinator";
pub const GATEWAY_ID: &str = "gateway";

struct WorkerSpec {
    id: ParticipantId,
    executors: Vec<(String, Arc<dyn Executor>)>,
    max_concurrent: Option<usize>,
}

/// Describes a system before it is started.
pub struct SystemBuilder {
    config: Config,
    decomposer: Arc<dyn Decomposer>,
    workers: Vec<WorkerSpec>,
}

impl SystemBuilder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn decomposer(mut self, decomposer: Arc<dyn Decomposer>) -> Self {
        self.decomposer = decomposer;
        self
    }

    /// Add a worker offering each `(capability, executor)` pair.
    pub fn worker<I, S>(mut self, id: impl Into<ParticipantId>, executors: I) -> Self
    where
        I: IntoIterator<Item = (S, Arc<dyn Executor>)>,
        S: Into<String>,
    {
        self.workers.push(WorkerSpec {
            id: id.into(),
            executors: executors.into_iter().map(|(c, e)| (c.into(), e)).collect(),
            max_concurrent: None,
        });
        self
    }

    /// Like `worker`, with its own concurrency bound instead of the
    /// configured default.
    pub fn worker_with_limit<I, S>(
        mut self,
        id: impl Into<ParticipantId>,
        max_concurrent: usize,
        executors: I,
    ) -> Self
    where
        I: IntoIterator<Item = (S, Arc<dyn Executor>)>,
        S: Into<String>,
    {
        self = self.worker(id, executors);
        if let Some(spec) = self.workers.last_mut() {
            spec.max_concurrent = Some(max_concurrent);
        }
        self
    }

    /// Start every actor. Must be called inside a tokio runtime.
    ///
    /// Every participant is registered on the transport before any actor is
    /// spawned, so a failed start leaves nothing running. Workers are
    /// registered with the coordinator before this returns.
    pub fn start(self) -> Result<System> {
        self.config.validate()?;
        let transport = Transport::new();

        let coordinator_mailbox = transport.register(COORDINATOR_ID)?;
        let gateway_mailbox = transport.register(GATEWAY_ID)?;
        let mut pending = Vec::with_capacity(self.workers.len());
        for spec in self.workers {
            let mailbox = transport.register(spec.id.clone())?;
            let mut worker = Worker::new(spec.id, COORDINATOR_ID, transport.clone())
                .with_max_concurrent(
                    spec.max_concurrent
                        .unwrap_or(self.config.worker_max_concurrent),
                );
            for (capability, executor) in spec.executors {
                worker = worker.with_executor(&capability, executor);
            }
            pending.push((worker, mailbox));
        }

        let mut workers = Vec::with_capacity(pending.len());
        for (worker, mailbox) in pending {
            match worker.spawn(mailbox) {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    for handle in &workers {
                        handle.shutdown();
                    }
                    return Err(e);
                }
            }
        }

        let coordinator = Coordinator::new(COORDINATOR_ID, transport.clone(), self.decomposer)
            .with_config(&self.config)
            .spawn(coordinator_mailbox);
        let gateway = Gateway::spawn(gateway_mailbox, COORDINATOR_ID, transport.clone());
        tracing::info!(
            workers = workers.len(),
            policy = %self.config.failure_policy,
            "system started"
        );

        Ok(System {
            transport,
            gateway,
            coordinator,
            workers,
        })
    }
}

/// A running system.
pub struct System {
    transport: Transport,
    gateway: Gateway,
    coordinator: ActorHandle,
    workers: Vec<ActorHandle>,
}

impl System {
    pub fn builder() -> SystemBuilder {
        SystemBuilder {
            config: Config::default(),
            decomposer: Arc::new(RuleDecomposer::with_builtin_rules()),
            workers: Vec::new(),
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub async fn submit(&self, request: TaskRequest) -> Result<TaskId> {
        self.gateway.submit(request).await
    }

    /// Submit and wait for the outcome.
    pub async fn execute(&self, request: TaskRequest) -> Result<(TaskId, TreeOutcome)> {
        let root = self.gateway.submit(request).await?;
        let outcome = self.gateway.wait(root).await?;
        Ok((root, outcome))
    }

    /// Like `execute`, giving up after `limit`.
    pub async fn execute_timeout(
        &self,
        request: TaskRequest,
        limit: Duration,
    ) -> Result<(TaskId, TreeOutcome)> {
        let root = self.gateway.submit(request).await?;
        let outcome = self.gateway.wait_timeout(root, limit).await?;
        Ok((root, outcome))
    }

    /// Broadcast `Shutdown`, then stop and join every actor.
    pub async fn shutdown(self) -> Result<()> {
        tracing::info!("system shutting down");
        let broadcast = Envelope::broadcast(ParticipantId::from(GATEWAY_ID), Payload::Shutdown);
        if let Err(e) = self.transport.send(broadcast) {
            tracing::warn!(error = %e, "shutdown broadcast failed");
        }

        self.gateway.shutdown().await?;
        for worker in self.workers {
            worker.stop().await?;
        }
        self.coordinator.stop().await
    }
}

impl std::fmt::Debug for System {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("System")
            .field("transport", &self.transport)
            .field("workers", &self.workers.len())
            .finish()
    }
}
