//! Request dispatch with account switching
//!
//! Wraps the lease cycle around an `AiExecutor` call: acquire, perform,
//! release with the classified outcome. A failed attempt switches to another
//! account until `max_switch_tries` attempts have been made.

use std::sync::Arc;

use automation::{AiExecutor, Artifact};
use common::Capability;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::scheduler::{Outcome, Scheduler};

pub struct Dispatcher {
    scheduler: Arc<Scheduler>,
    executor: Arc<dyn AiExecutor>,
    max_switch_tries: u32,
}

impl Dispatcher {
    pub fn new(
        scheduler: Arc<Scheduler>,
        executor: Arc<dyn AiExecutor>,
        max_switch_tries: u32,
    ) -> Self {
        Self {
            scheduler,
            executor,
            max_switch_tries: max_switch_tries.max(1),
        }
    }

    /// Run one AI request on the pool.
    ///
    /// `NoEligibleAccount` is returned as soon as the pool runs dry, even
    /// mid-retry. Otherwise gives up with `AttemptsExhausted`.
    pub async fn execute(
        &self,
        capability: Capability,
        prompt: &str,
        params: &serde_json::Value,
    ) -> Result<Artifact> {
        let mut last_error = String::new();

        for attempt in 1..=self.max_switch_tries {
            let lease = self.scheduler.acquire(capability).await?;
            debug!(account_id = %lease.account_id, %capability, attempt, "dispatching request");

            let result = self
                .executor
                .perform(lease.session.expose(), capability, prompt, params)
                .await;

            let outcome = match &result {
                Ok(_) => Outcome::Success,
                Err(e) => Outcome::from(e),
            };
            if let Err(e) = self.scheduler.release(&lease, outcome).await {
                warn!(account_id = %lease.account_id, error = %e, "failed to release lease");
            }

            match result {
                Ok(artifact) => return Ok(artifact),
                Err(e) => {
                    warn!(
                        account_id = %lease.account_id,
                        %capability,
                        attempt,
                        max_attempts = self.max_switch_tries,
                        kind = e.kind(),
                        error = %e,
                        "request failed, switching account"
                    );
                    last_error = e.to_string();
                }
            }
        }

        Err(Error::AttemptsExhausted {
            attempts: self.max_switch_tries,
            last_error,
        })
    }
}
