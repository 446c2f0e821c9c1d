//! # Pipeline Orchestrator
//!
//! Turns endpoint definitions plus live responses into one [`Report`].
//!
//! ## Per endpoint
//!
//! 1. Fetch the live response through the [`ResponseFetcher`]
//! 2. Build the [`ValidationItem`]
//! 3. Run the validator chain in order (schema, test cases, global
//!    external validators)
//! 4. A failing fatal validator stops the chain for that endpoint only
//!
//! Endpoints are evaluated concurrently, bounded by a semaphore, and the
//! report keeps definition order regardless of completion order.
//!
//! Nothing in here returns an error: fetch failures, validator failures
//! and even panicking tasks end up as failed results in the report.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::config::PipelineLimits;
use crate::errors::ErrorCode;
use crate::fetcher::ResponseFetcher;
use crate::protocol::{
    EndpointDefinition, Report, TestCaseResult, ValidatedEndpoint, ValidationItem,
    ValidatorDefinition,
};
use crate::validators::{chain_for, Validator};

/// Name of the synthetic result recorded when the response cannot be fetched.
pub const FETCH_RESULT_NAME: &str = "fetch";

/// Immutable per-run inputs. Cheap to clone; everything is behind `Arc`.
#[derive(Clone)]
pub struct Pipeline {
    definitions: Arc<Vec<EndpointDefinition>>,
    validators: Arc<Vec<ValidatorDefinition>>,
    fetcher: Arc<dyn ResponseFetcher>,
    limits: PipelineLimits,
}

impl Pipeline {
    pub fn new(
        definitions: Vec<EndpointDefinition>,
        validators: Vec<ValidatorDefinition>,
        fetcher: Arc<dyn ResponseFetcher>,
        limits: PipelineLimits,
    ) -> Self {
        Self {
            definitions: Arc::new(definitions),
            validators: Arc::new(validators),
            fetcher,
            limits,
        }
    }

    pub fn endpoint_count(&self) -> usize {
        self.definitions.len()
    }

    /// Runs every endpoint once and assembles the report.
    #[instrument(name = "pipeline_run", skip(self), fields(endpoints = self.definitions.len()))]
    pub async fn run(&self) -> Report {
        let started = Utc::now();
        let timer = Instant::now();

        let max_parallel = if self.limits.max_parallel > 0 {
            self.limits.max_parallel
        } else {
            self.definitions.len().max(1)
        };
        let semaphore = Arc::new(Semaphore::new(max_parallel));
        debug!(max_parallel, "pipeline concurrency limit");

        let mut join_set = JoinSet::new();
        for index in 0..self.definitions.len() {
            let definitions = Arc::clone(&self.definitions);
            let validators = Arc::clone(&self.validators);
            let fetcher = Arc::clone(&self.fetcher);
            let semaphore = Arc::clone(&semaphore);
            let validator_timeout = self.limits.validator_timeout;

            join_set.spawn(async move {
                // The semaphore lives as long as this run and is never closed.
                let _permit = semaphore.acquire_owned().await.ok();
                let definition = &definitions[index];
                let endpoint = evaluate_endpoint(
                    definition,
                    &validators,
                    fetcher.as_ref(),
                    validator_timeout,
                )
                .await;
                (index, endpoint)
            });
        }

        let mut slots: Vec<Option<ValidatedEndpoint>> = vec![None; self.definitions.len()];
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, endpoint)) => slots[index] = Some(endpoint),
                Err(e) => {
                    error!(code = %ErrorCode::INTERNAL_ERROR, error = %e, "endpoint task failed")
                }
            }
        }

        // A slot is only empty when its task panicked or was cancelled.
        let endpoints: Vec<ValidatedEndpoint> = slots
            .into_iter()
            .zip(self.definitions.iter())
            .map(|(slot, definition)| {
                slot.unwrap_or_else(|| {
                    ValidatedEndpoint::new(
                        definition.name.clone(),
                        Utc::now(),
                        0,
                        vec![TestCaseResult::fail(
                            "internal",
                            "endpoint evaluation aborted unexpectedly",
                            true,
                        )],
                    )
                })
            })
            .collect();

        let report = Report::new(started, endpoints);
        let failed = report
            .endpoints
            .iter()
            .filter(|e| !e.status.is_passed())
            .count();
        info!(
            report_id = %report.id,
            status = ?report.status,
            failed_endpoints = failed,
            duration_ms = timer.elapsed().as_millis() as u64,
            "pipeline run finished"
        );
        report
    }
}

/// Fetches and validates a single endpoint.
#[instrument(name = "endpoint", skip_all, fields(endpoint = %definition.name))]
pub async fn evaluate_endpoint(
    definition: &EndpointDefinition,
    validators: &[ValidatorDefinition],
    fetcher: &dyn ResponseFetcher,
    validator_timeout: Option<Duration>,
) -> ValidatedEndpoint {
    let time = Utc::now();
    let timer = Instant::now();

    let response = match fetcher.fetch(definition).await {
        Ok(response) => response,
        Err(e) => {
            warn!(code = %e.code(), error = %e, "cannot fetch response");
            return ValidatedEndpoint::new(
                definition.name.clone(),
                time,
                timer.elapsed().as_millis() as u64,
                vec![TestCaseResult::fail(FETCH_RESULT_NAME, e.to_string(), true)],
            );
        }
    };

    let item = ValidationItem::new(&response, definition);
    let chain = chain_for(definition, validators, validator_timeout);
    let results = run_chain(&item, &chain).await;

    let endpoint = ValidatedEndpoint::new(
        definition.name.clone(),
        time,
        timer.elapsed().as_millis() as u64,
        results,
    );
    debug!(
        status = ?endpoint.status,
        results = endpoint.results.len(),
        "endpoint validated"
    );
    endpoint
}

/// Evaluates validators in order; a fatal failure ends the chain.
pub async fn run_chain(
    item: &ValidationItem<'_>,
    chain: &[Box<dyn Validator>],
) -> Vec<TestCaseResult> {
    let mut results = Vec::with_capacity(chain.len());

    for validator in chain {
        let name = validator.name();
        let fatal = validator.is_fatal();
        debug!(validator = %name, fatal, slim = validator.is_slim(), "running validator");

        match validator.validate(item).await {
            Ok(()) => results.push(TestCaseResult::pass(name, fatal)),
            Err(e) => {
                debug!(validator = %name, code = %e.code(), error = %e, "validator failed");
                results.push(TestCaseResult::fail(name.clone(), e.to_string(), fatal));
                if fatal {
                    info!(validator = %name, "fatal validator failed, skipping the rest");
                    break;
                }
            }
        }
    }

    results
}
