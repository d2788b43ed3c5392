//! Lifecycle of the relay.
//!
//! The listener and the delivery workers run as one unit. When any part of
//! the unit fails, the whole unit is stopped and started again, up to a
//! budget of restarts per rolling hour. The queue and send log belong to the
//! supervisor rather than the unit, so queued mail survives a restart.

use std::{future::Future, net::SocketAddr, sync::Arc};

use chrono::{DateTime, Utc};
use conduit_common::{Signal, clock::Clock, config::RelayConfig, internal};
use conduit_delivery::{DeliveryQueue, DeliveryWorker, EmailSender, RetryPolicy, SendLog};
use conduit_smtp::{ListenerError, SessionConfig, SmtpListener};
use thiserror::Error;
use tokio::{
    sync::{broadcast, watch},
    task::{JoinError, JoinSet},
};

use crate::{notify, restart::RestartWindow};

/// Why the listener/worker unit stopped.
#[derive(Debug, Error)]
pub enum UnitError {
    #[error("Listener failed: {0}")]
    Listener(#[from] ListenerError),

    #[error("Task failed: {0}")]
    Task(#[from] JoinError),

    #[error("A relay task stopped unexpectedly")]
    Stopped,
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Restarted more than {budget} times within an hour, last failure: {last}")]
    ExhaustedRestarts { budget: usize, last: String },
}

type Unit = JoinSet<Result<(), UnitError>>;

fn unit_error(finished: Option<Result<Result<(), UnitError>, JoinError>>) -> UnitError {
    match finished {
        Some(Ok(Err(err))) => err,
        Some(Err(err)) => UnitError::Task(err),
        Some(Ok(Ok(()))) | None => UnitError::Stopped,
    }
}

pub struct Supervisor {
    config: Arc<RelayConfig>,
    session: Arc<SessionConfig>,
    clock: Arc<dyn Clock>,
    queue: DeliveryQueue,
    send_log: SendLog,
    sender: Arc<dyn EmailSender>,
    restarts: RestartWindow,
    listening: watch::Sender<Option<SocketAddr>>,
}

impl Supervisor {
    pub fn new(config: RelayConfig, sender: Arc<dyn EmailSender>, clock: Arc<dyn Clock>) -> Self {
        let queue = DeliveryQueue::new(config.queue.max_length, Arc::clone(&clock));
        let send_log = SendLog::new(
            config.send_log.enabled,
            config.send_log.retention,
            Arc::clone(&clock),
        );
        let session = Arc::new(SessionConfig::from_relay(&config, Arc::clone(&clock)));
        let restarts = RestartWindow::new(config.supervisor.restart_budget);
        let (listening, _) = watch::channel(None);

        Self {
            config: Arc::new(config),
            session,
            clock,
            queue,
            send_log,
            sender,
            restarts,
            listening,
        }
    }

    pub const fn queue(&self) -> &DeliveryQueue {
        &self.queue
    }

    pub const fn send_log(&self) -> &SendLog {
        &self.send_log
    }

    pub const fn restarts(&self) -> &RestartWindow {
        &self.restarts
    }

    /// The address the listener is bound to, `None` while the unit is down
    pub fn listening(&self) -> watch::Receiver<Option<SocketAddr>> {
        self.listening.subscribe()
    }

    async fn start_unit(&self, signal: &broadcast::Sender<Signal>) -> Result<Unit, UnitError> {
        let listener = SmtpListener::bind(
            self.config.listen,
            Arc::clone(&self.session),
            self.queue.clone(),
        )
        .await?;
        let address = listener.local_addr().map_err(ListenerError::Accept)?;

        let mut unit = JoinSet::new();

        let shutdown = signal.subscribe();
        unit.spawn(async move {
            listener.serve(shutdown).await?;
            Ok(())
        });

        let policy = RetryPolicy::new(&self.config.delivery, &self.config.queue);
        for id in 0..self.config.delivery.workers {
            let worker = DeliveryWorker::new(
                self.queue.clone(),
                self.send_log.clone(),
                Arc::clone(&self.sender),
                policy,
                self.config.delivery.send_timeout,
            )
            .with_id(id);
            let shutdown = signal.subscribe();
            unit.spawn(async move {
                worker.serve(shutdown).await;
                Ok(())
            });
        }

        self.listening.send_replace(Some(address));
        Ok(unit)
    }

    /// Stop every task in `unit` and wait for them to finish.
    async fn stop_unit(signal: &broadcast::Sender<Signal>, unit: &mut Unit) {
        if signal.send(Signal::Shutdown).is_err() {
            internal!(level = DEBUG, "Relay unit already stopped");
        }

        while let Some(result) = unit.join_next().await {
            if let Err(err) = result {
                internal!(level = WARN, "Relay task failed while stopping: {err}");
            }
        }
    }

    /// Queue the failure report for the operator, if one is configured.
    fn report_failure(&self, at: DateTime<Utc>, failure: &UnitError) {
        let Some(to) = self.config.supervisor.notify.as_deref() else {
            return;
        };

        let report = notify::failure_report(&self.config.from_address, to, at, &failure.to_string());
        match self.queue.enqueue(report) {
            Ok(id) => internal!(level = INFO, envelope = %id, to, "Queued failure report"),
            Err(err) => internal!(level = ERROR, error = %err, "Unable to queue failure report"),
        }
    }

    /// Run the relay until `stop` resolves.
    ///
    /// # Errors
    /// [`SupervisorError::ExhaustedRestarts`] when the unit fails more often
    /// than the restart budget allows
    pub async fn run<F>(mut self, stop: F) -> Result<(), SupervisorError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(stop);

        internal!(
            level = INFO,
            address = %self.config.listen,
            workers = self.config.delivery.workers,
            budget = self.restarts.budget(),
            "Relay starting"
        );

        loop {
            let (signal, _) = broadcast::channel(1);

            let failure = match self.start_unit(&signal).await {
                Ok(mut unit) => {
                    let finished = tokio::select! {
                        () = &mut stop => None,
                        finished = unit.join_next() => Some(finished),
                    };

                    Self::stop_unit(&signal, &mut unit).await;

                    match finished {
                        Some(finished) => unit_error(finished),
                        None => {
                            internal!(level = INFO, "Relay stopped");
                            self.listening.send_replace(None);
                            return Ok(());
                        }
                    }
                }
                Err(err) => err,
            };

            self.listening.send_replace(None);

            let now = self.clock.now();
            internal!(level = ERROR, error = %failure, "Relay unit failed");

            if !self.restarts.record(now, failure.to_string()) {
                internal!(
                    level = ERROR,
                    budget = self.restarts.budget(),
                    "Too many restarts within an hour, giving up"
                );
                return Err(SupervisorError::ExhaustedRestarts {
                    budget: self.restarts.budget(),
                    last: failure.to_string(),
                });
            }

            tokio::select! {
                () = &mut stop => return Ok(()),
                () = tokio::time::sleep(self.config.supervisor.restart_delay) => {}
            }

            internal!(
                level = WARN,
                restarts = self.restarts.len(),
                budget = self.restarts.budget(),
                "Restarting relay unit"
            );
            self.report_failure(now, &failure);
        }
    }
}
