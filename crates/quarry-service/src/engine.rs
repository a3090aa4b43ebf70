//! Engine facade: plan execution requests, batch envelopes and the
//! interactive transaction lifecycle over one driver adapter.

use std::sync::Arc;

use futures::future::join_all;
use quarry_core::{
    CanonicalError, DriverAdapter, EngineResult, ErrorKind, IsolationLevel, Provider, QueryPlan,
    ResourceLimits, TransactionId,
};
use quarry_driver::NormalizerRegistry;
use quarry_query::{
    BatchOutcome, CancellationToken, InterpreterOptions, Output, QueryInterpreter,
    TransactionManager,
};
use quarry_sqlite::{create_sqlite_pool, SqliteAdapter, SqlitePoolConfig};
use serde::{Deserialize, Serialize};
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::config::Config;
use crate::telemetry::{request_span, TraceHeaders};

/// One plan to execute.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRequest {
    pub plan: QueryPlan,
    /// Interactive transaction to run in; `None` runs on the adapter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<TransactionId>,
    /// Correlates log lines; generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default)]
    pub trace_headers: TraceHeaders,
}

impl PlanRequest {
    pub fn new(plan: QueryPlan) -> Self {
        Self {
            plan,
            ..Self::default()
        }
    }

    pub fn in_transaction(mut self, id: TransactionId) -> Self {
        self.transaction_id = Some(id);
        self
    }
}

/// Several plans submitted together.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    pub batch: Vec<QueryPlan>,
    /// Run every plan in one transaction; the first failure rolls it back.
    #[serde(default)]
    pub transaction: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolation_level: Option<IsolationLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default)]
    pub trace_headers: TraceHeaders,
}

/// Options for an interactive transaction.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolation_level: Option<IsolationLevel>,
}

/// Errors raised while assembling an engine.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("no error normalizer is registered for provider `{0}`")]
    UnsupportedProvider(Provider),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error("failed to open database pool: {0}")]
    Database(#[from] sqlx::Error),
}

/// Query plan execution engine for one database.
pub struct Engine {
    adapter: Arc<dyn DriverAdapter>,
    registry: NormalizerRegistry,
    transactions: TransactionManager,
    interpreter: QueryInterpreter,
    default_isolation_level: Option<IsolationLevel>,
}

impl Engine {
    /// Builds an engine over `adapter`.
    ///
    /// # Errors
    ///
    /// `UnsupportedProvider` when `registry` cannot normalize the adapter's
    /// errors.
    pub fn new(
        adapter: Arc<dyn DriverAdapter>,
        registry: NormalizerRegistry,
        limits: ResourceLimits,
    ) -> Result<Self, ServiceError> {
        let provider = adapter.provider();
        if !registry.supports(provider) {
            return Err(ServiceError::UnsupportedProvider(provider));
        }

        let transactions =
            TransactionManager::new(Arc::clone(&adapter), registry.clone(), limits);
        let interpreter = QueryInterpreter::new(
            Arc::clone(&adapter),
            registry.clone(),
            transactions.clone(),
            limits,
        );
        info!(
            provider = provider.as_str(),
            adapter = adapter.adapter_name(),
            "Engine ready"
        );
        Ok(Self {
            adapter,
            registry,
            transactions,
            interpreter,
            default_isolation_level: None,
        })
    }

    /// Opens the configured SQLite database and builds an engine over it.
    pub async fn from_config(config: &Config) -> Result<Self, ServiceError> {
        config.validate()?;
        let pool = create_sqlite_pool(
            &config.database.url,
            &SqlitePoolConfig {
                max_connections: config.database.max_connections,
                acquire_timeout: config.database.acquire_timeout,
                ..SqlitePoolConfig::default()
            },
        )
        .await?;

        let engine = Self::new(
            Arc::new(SqliteAdapter::new(pool)),
            NormalizerRegistry::with_builtin(),
            config.limits,
        )?;
        Ok(engine.with_options(InterpreterOptions {
            batch_failure_policy: config.batch.failure_policy,
            default_isolation_level: config.transactions.isolation_level,
        }))
    }

    pub fn with_options(mut self, options: InterpreterOptions) -> Self {
        self.default_isolation_level = options.default_isolation_level;
        self.interpreter = self.interpreter.with_options(options);
        self
    }

    pub fn provider(&self) -> Provider {
        self.adapter.provider()
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    /// Executes one plan.
    ///
    /// When a request bound to a transaction is cancelled, the transaction
    /// is rolled back: its connection may be mid-statement.
    pub async fn execute(
        &self,
        request: PlanRequest,
        cancel: &CancellationToken,
    ) -> EngineResult<Output> {
        let PlanRequest {
            plan,
            transaction_id,
            request_id,
            trace_headers,
        } = request;
        let request_id = self::request_id(request_id);
        let span = request_span("execute", &request_id, &trace_headers);
        async {
            let result = self.interpreter.execute(&plan, transaction_id, cancel).await;
            if let (Err(error), Some(id)) = (&result, transaction_id) {
                if error.kind == ErrorKind::Cancelled {
                    warn!(transaction_id = %id, "Request cancelled, aborting its transaction");
                    if let Err(abort_error) = self.transactions.abort(id).await {
                        warn!(transaction_id = %id, error = %abort_error, "Abort failed");
                    }
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    /// Executes several plans.
    ///
    /// Without `transaction` the plans run concurrently and each reports its
    /// own outcome. With it they run in order inside one transaction; the
    /// first failure rolls everything back and is returned as the error.
    pub async fn execute_batch(
        &self,
        request: BatchRequest,
        cancel: &CancellationToken,
    ) -> EngineResult<Vec<BatchOutcome>> {
        let BatchRequest {
            batch,
            transaction,
            isolation_level,
            request_id,
            trace_headers,
        } = request;
        let request_id = self::request_id(request_id);
        let span = request_span("execute_batch", &request_id, &trace_headers);
        async {
            if !transaction {
                let results = join_all(
                    batch
                        .iter()
                        .map(|plan| self.interpreter.execute(plan, None, cancel)),
                )
                .await;
                return Ok(results
                    .into_iter()
                    .map(|result| match result {
                        Ok(output) => BatchOutcome::Data(output),
                        Err(error) => BatchOutcome::Error(error),
                    })
                    .collect());
            }

            let level = isolation_level.or(self.default_isolation_level);
            let id = self.transactions.start(level).await?;
            let mut outcomes = Vec::with_capacity(batch.len());
            for plan in &batch {
                match self.interpreter.execute(plan, Some(id), cancel).await {
                    Ok(output) => outcomes.push(BatchOutcome::Data(output)),
                    Err(error) => {
                        if let Err(rollback_error) = self.transactions.rollback(id).await {
                            warn!(
                                transaction_id = %id,
                                error = %rollback_error,
                                "Rollback after failed batch did not complete"
                            );
                        }
                        return Err(error);
                    }
                }
            }
            self.transactions.commit(id).await?;
            Ok::<_, CanonicalError>(outcomes)
        }
        .instrument(span)
        .await
    }

    /// Opens an interactive transaction.
    pub async fn start_transaction(
        &self,
        options: TransactionRequest,
        trace_headers: &TraceHeaders,
        request_id: Option<&str>,
    ) -> EngineResult<TransactionId> {
        let request_id = self::request_id(request_id.map(str::to_string));
        let level = options.isolation_level.or(self.default_isolation_level);
        self.transactions
            .start(level)
            .instrument(request_span("start_transaction", &request_id, trace_headers))
            .await
    }

    pub async fn commit_transaction(
        &self,
        id: TransactionId,
        trace_headers: &TraceHeaders,
        request_id: Option<&str>,
    ) -> EngineResult<()> {
        let request_id = self::request_id(request_id.map(str::to_string));
        self.transactions
            .commit(id)
            .instrument(request_span("commit_transaction", &request_id, trace_headers))
            .await
    }

    pub async fn rollback_transaction(
        &self,
        id: TransactionId,
        trace_headers: &TraceHeaders,
        request_id: Option<&str>,
    ) -> EngineResult<()> {
        let request_id = self::request_id(request_id.map(str::to_string));
        self.transactions
            .rollback(id)
            .instrument(request_span("rollback_transaction", &request_id, trace_headers))
            .await
    }

    /// Rolls back every open transaction and closes the adapter.
    pub async fn shutdown(&self) -> EngineResult<()> {
        self.transactions.cancel_all().await;
        self.adapter
            .dispose()
            .await
            .map_err(|error| self.registry.normalize(self.provider(), &error))?;
        info!(provider = self.provider().as_str(), "Engine shut down");
        Ok(())
    }
}

fn request_id(given: Option<String>) -> String {
    given.unwrap_or_else(|| Uuid::new_v4().to_string())
}
