//! The caller-facing entry point

use std::time::Duration;

use tracing::{debug, instrument};

use crate::classify::classify;
use crate::config::Config;
use crate::isolate::{CallError, IsolationPolicy, run_in_process, run_isolated};
use crate::marshal::validate;
use crate::native::UnitRegistry;
use crate::redirect::StdStream;
use crate::types::{CallRequest, CallResult, Truncated};

/// High-level harness for calls into native units
#[derive(Debug, Clone)]
pub struct Harness {
    config: Config,
    registry: UnitRegistry,
}

impl Harness {
    /// Create a new harness with the given configuration and in-process units.
    ///
    /// The registry only serves [`IsolationPolicy::InProcess`] calls; process
    /// isolated calls resolve the unit inside the worker binary.
    pub fn new(config: Config, registry: UnitRegistry) -> Self {
        Self { config, registry }
    }

    /// Create a new harness with default configuration and the probe units
    pub fn with_defaults() -> Self {
        Self::new(Config::default(), UnitRegistry::with_probes())
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &UnitRegistry {
        &self.registry
    }

    /// Run one call with the configured policy and timeout
    pub async fn run(&self, request: CallRequest) -> Result<CallResult, CallError> {
        self.execute(request, self.config.policy, self.config.timeout())
            .await
    }

    /// Run one call of the configured unit.
    ///
    /// The request is checked before anything is spawned or redirected, so
    /// a [`CallError::Marshal`] never leaves a worker or a redirection
    /// behind. The caller's own stdout and stderr are the same before and
    /// after, whatever the outcome.
    #[instrument(skip(self, request), fields(unit = %self.config.unit))]
    pub async fn execute(
        &self,
        request: CallRequest,
        policy: IsolationPolicy,
        timeout: Option<Duration>,
    ) -> Result<CallResult, CallError> {
        validate(&request)?;
        let capacities = self.config.capacities;

        let raw = match policy {
            IsolationPolicy::InProcess => {
                let unit = self
                    .registry
                    .get(&self.config.unit)
                    .ok_or_else(|| CallError::UnknownUnit(self.config.unit.clone()))?;
                run_in_process(unit, request, capacities, timeout).await?
            }
            IsolationPolicy::Process => {
                run_isolated(
                    &self.config.worker_binary(),
                    &self.config.unit,
                    &request,
                    capacities,
                    timeout,
                    self.config.on_timeout,
                )
                .await?
            }
        };

        let overflow = self.config.overflow;
        let truncated = Truncated {
            output: overflow.settle(StdStream::Output, &raw.output, capacities.output)?,
            logs: overflow.settle(StdStream::Diagnostic, &raw.logs, capacities.logs)?,
        };
        let result = classify(&raw, truncated);

        debug!(
            status = result.status,
            structured = result.result.is_some(),
            truncated = truncated.any(),
            "call complete"
        );
        Ok(result)
    }
}
