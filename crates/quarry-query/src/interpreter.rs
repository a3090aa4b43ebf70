//! Query plan interpreter
//!
//! Evaluates a plan depth-first, post-order. Each node's output is kept in
//! a scope keyed by node id so later nodes can bind parameters from it.
//! Statements run on the adapter, or on the request's transaction when one
//! is active; every driver call goes through the resource governor and
//! every driver error through the normalizer registry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, FixedOffset, Utc};
use futures::future::{try_join_all, BoxFuture, FutureExt};
use quarry_core::metrics::{STATEMENTS_EXECUTED, STATEMENT_LATENCY};
use quarry_core::value::{correlation_key, get_path, record_size};
use quarry_core::{
    Arity, BatchMode, BatchNode, CanonicalError, DriverAdapter, EngineResult, ErrorKind,
    Generator, IsolationLevel, JoinChild, MapOp, NodeId, Param, PlanNode, PlanNodeKind,
    Predicate, Provider, QueryKind, QueryNode, QueryPlan, Record, ResourceLimits, ResultSet,
    SqlQuery, TransactionId, Value,
};
use quarry_driver::NormalizerRegistry;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, info_span, warn, Instrument};
use uuid::Uuid;

use crate::context::{BatchOutcome, Output};
use crate::governor::{ResourceGovernor, ResponseBudget};
use crate::render::render;
use crate::serializer::serialize;
use crate::transaction::TransactionManager;

/// What an independent batch does after one of its children fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchFailurePolicy {
    /// Later siblings still run; each reports its own outcome.
    #[default]
    Continue,
    /// Later siblings are skipped.
    Abort,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InterpreterOptions {
    pub batch_failure_policy: BatchFailurePolicy,
    /// Used by transactional batches and boundaries that name no level.
    pub default_isolation_level: Option<IsolationLevel>,
}

/// Outputs of evaluated nodes, plus the last insert id each one carries.
#[derive(Clone, Default)]
struct Scope {
    outputs: HashMap<NodeId, Arc<Output>>,
    last_insert_ids: HashMap<NodeId, Value>,
}

impl Scope {
    fn insert(&mut self, id: NodeId, output: Arc<Output>) {
        self.outputs.insert(id, output);
    }

    fn contains(&self, id: &NodeId) -> bool {
        self.outputs.contains_key(id)
    }

    /// Wrapper nodes pass their input's last insert id through.
    fn inherit_last_insert_id(&mut self, from: &NodeId, to: &NodeId) {
        if let Some(value) = self.last_insert_ids.get(from).cloned() {
            self.last_insert_ids.insert(to.clone(), value);
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Connection {
    Adapter,
    Transaction(TransactionId),
}

/// Per-request execution state threaded through node evaluation.
#[derive(Clone)]
struct Execution {
    connection: Connection,
    cancel: CancellationToken,
    budget: Arc<ResponseBudget>,
    /// Value of the `now` generator for the whole request.
    now: DateTime<FixedOffset>,
}

/// Interpreter for compiled query plans against one driver adapter.
pub struct QueryInterpreter {
    adapter: Arc<dyn DriverAdapter>,
    registry: NormalizerRegistry,
    transactions: TransactionManager,
    governor: ResourceGovernor,
    options: InterpreterOptions,
}

impl QueryInterpreter {
    pub fn new(
        adapter: Arc<dyn DriverAdapter>,
        registry: NormalizerRegistry,
        transactions: TransactionManager,
        limits: ResourceLimits,
    ) -> Self {
        Self {
            adapter,
            registry,
            transactions,
            governor: ResourceGovernor::new(limits),
            options: InterpreterOptions::default(),
        }
    }

    pub fn with_options(mut self, options: InterpreterOptions) -> Self {
        self.options = options;
        self
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    fn provider(&self) -> Provider {
        self.adapter.provider()
    }

    /// Executes a plan, inside `transaction` when given.
    ///
    /// An empty plan yields no records.
    ///
    /// # Errors
    ///
    /// `PlanError` for invalid plans, the normalized driver error of the
    /// failing statement, or a governor error (`SocketTimeout`,
    /// `ResponseTooLarge`, `Cancelled`).
    pub async fn execute(
        &self,
        plan: &QueryPlan,
        transaction: Option<TransactionId>,
        cancel: &CancellationToken,
    ) -> EngineResult<Output> {
        plan.validate()?;
        let Some(root) = &plan.root else {
            return Ok(Output::Records(Vec::new()));
        };

        let execution = Execution {
            connection: transaction.map_or(Connection::Adapter, Connection::Transaction),
            cancel: cancel.clone(),
            budget: Arc::new(self.governor.budget()),
            now: Utc::now().into(),
        };
        let span = info_span!(
            "execute_plan",
            root = %root.id,
            provider = self.provider().as_str(),
            transaction_id = ?transaction,
        );
        let mut scope = Scope::default();
        let output = self
            .evaluate(root, &execution, &mut scope)
            .instrument(span)
            .await?;
        debug!(bytes = execution.budget.used(), "Plan executed");
        Ok(Arc::try_unwrap(output).unwrap_or_else(|shared| shared.as_ref().clone()))
    }

    fn evaluate<'a>(
        &'a self,
        node: &'a PlanNode,
        execution: &'a Execution,
        scope: &'a mut Scope,
    ) -> BoxFuture<'a, EngineResult<Arc<Output>>> {
        let span = debug_span!("node", id = %node.id, kind = node.kind_name());
        async move {
            let output = match &node.kind {
                PlanNodeKind::Query(query) => {
                    self.run_query(&node.id, query, execution, scope).await?
                }
                PlanNodeKind::Filter(filter) => {
                    let input = self.evaluate(&filter.input, execution, scope).await?;
                    scope.inherit_last_insert_id(&filter.input.id, &node.id);
                    let records = records_of(&filter.input.id, &input)?;
                    Output::Records(
                        records
                            .iter()
                            .filter(|record| matches_predicate(record, &filter.predicate))
                            .cloned()
                            .collect(),
                    )
                }
                PlanNodeKind::MapResult(map) => {
                    let input = self.evaluate(&map.input, execution, scope).await?;
                    scope.inherit_last_insert_id(&map.input.id, &node.id);
                    let records = records_of(&map.input.id, &input)?.to_vec();
                    Output::Records(apply_ops(records, &map.ops)?)
                }
                PlanNodeKind::ApplyConstant(constant) => {
                    for record in &constant.records {
                        execution.budget.charge(record_size(record) as u64)?;
                    }
                    Output::Records(constant.records.clone())
                }
                PlanNodeKind::Join(join) => {
                    let parent = self.evaluate(&join.parent, execution, scope).await?;
                    scope.inherit_last_insert_id(&join.parent.id, &node.id);
                    let mut records = records_of(&join.parent.id, &parent)?.to_vec();
                    for child in &join.children {
                        self.attach(child, &join.parent.id, &mut records, execution, scope)
                            .await?;
                    }
                    Output::Records(records)
                }
                PlanNodeKind::Batch(batch) => match batch.mode {
                    BatchMode::Independent => {
                        self.run_independent(batch, execution, scope).await?
                    }
                    BatchMode::Transactional => {
                        let (inner, started) =
                            self.enter_transaction(batch.isolation_level, execution).await?;
                        let result = self.run_all(&batch.children, &inner, scope).await;
                        let outputs = self.leave_transaction(started, result).await?;
                        Output::Batch(outputs.into_iter().map(BatchOutcome::Data).collect())
                    }
                },
                PlanNodeKind::TransactionBoundary(boundary) => {
                    let (inner, started) = self
                        .enter_transaction(boundary.isolation_level, execution)
                        .await?;
                    let result = self
                        .evaluate(&boundary.body, &inner, scope)
                        .await
                        .map(|output| output.as_ref().clone());
                    let output = self.leave_transaction(started, result).await?;
                    scope.inherit_last_insert_id(&boundary.body.id, &node.id);
                    output
                }
            };
            let output = Arc::new(output);
            scope.insert(node.id.clone(), Arc::clone(&output));
            Ok::<_, CanonicalError>(output)
        }
        .instrument(span)
        .boxed()
    }

    async fn run_query(
        &self,
        id: &NodeId,
        query: &QueryNode,
        execution: &Execution,
        scope: &mut Scope,
    ) -> EngineResult<Output> {
        let Some(params) = resolve_params(id, query.statement.params(), scope, &execution.now)?
        else {
            debug!(node = %id, "Dependency produced no rows, statement skipped");
            return Ok(match query.kind {
                QueryKind::Read => Output::Records(Vec::new()),
                QueryKind::Write => Output::Affected(0),
            });
        };

        let max_bind_values = self
            .adapter
            .connection_info()
            .max_bind_values
            .unwrap_or_else(|| self.provider().default_max_bind_values());
        let statements = render(&query.statement, params, max_bind_values)?;

        match query.kind {
            QueryKind::Read => {
                let mut combined = ResultSet::default();
                for statement in &statements {
                    combined.append(self.query_raw(statement, execution).await?)?;
                }
                if let Some(last_insert_id) = combined.last_insert_id.as_deref() {
                    let value = Value::integer_from_str(last_insert_id)
                        .unwrap_or_else(|_| Value::from(last_insert_id));
                    scope.last_insert_ids.insert(id.clone(), value);
                }
                Ok(Output::Records(serialize(&combined)?))
            }
            QueryKind::Write => {
                let mut affected = 0;
                for statement in &statements {
                    affected += self.execute_raw(statement, execution).await?;
                }
                Ok(Output::Affected(affected))
            }
        }
    }

    async fn query_raw(&self, statement: &SqlQuery, execution: &Execution) -> EngineResult<ResultSet> {
        let started = Instant::now();
        let result = self
            .governor
            .run(self.provider(), &execution.cancel, async {
                let budget = execution.budget.as_ref();
                let outcome = match execution.connection {
                    Connection::Adapter => self.adapter.query_raw_within(statement, budget).await,
                    Connection::Transaction(id) => {
                        self.transactions.query_raw_within(id, statement, budget).await
                    }
                };
                outcome.map_err(|error| self.registry.normalize(self.provider(), &error))
            })
            .await;
        self.observe(QueryKind::Read, started, result.as_ref().err());
        result
    }

    async fn execute_raw(&self, statement: &SqlQuery, execution: &Execution) -> EngineResult<u64> {
        let started = Instant::now();
        let result = self
            .governor
            .run(self.provider(), &execution.cancel, async {
                let outcome = match execution.connection {
                    Connection::Adapter => self.adapter.execute_raw(statement).await,
                    Connection::Transaction(id) => {
                        self.transactions.execute_raw(id, statement).await
                    }
                };
                outcome.map_err(|error| self.registry.normalize(self.provider(), &error))
            })
            .await;
        self.observe(QueryKind::Write, started, result.as_ref().err());
        result
    }

    fn observe(&self, kind: QueryKind, started: Instant, error: Option<&CanonicalError>) {
        let provider = self.provider().as_str();
        let outcome = match error {
            None => "ok",
            Some(error) => {
                debug!(kind = error.kind.as_str(), message = %error.message, "Statement failed");
                "error"
            }
        };
        STATEMENTS_EXECUTED
            .with_label_values(&[provider, kind.as_str(), outcome])
            .inc();
        STATEMENT_LATENCY
            .with_label_values(&[provider, kind.as_str()])
            .observe(started.elapsed().as_secs_f64());
    }

    /// Fans a join child out once per distinct parent key and attaches the
    /// matching child records to every parent record.
    async fn attach(
        &self,
        child: &JoinChild,
        parent_id: &NodeId,
        records: &mut [Record],
        execution: &Execution,
        scope: &mut Scope,
    ) -> EngineResult<()> {
        let parent_fields: Vec<&str> = child.on.iter().map(|(parent, _)| parent.as_str()).collect();
        let child_fields: Vec<&str> = child.on.iter().map(|(_, child)| child.as_str()).collect();

        let mut keys = Vec::with_capacity(records.len());
        let mut groups: Vec<Vec<Record>> = Vec::new();
        let mut group_index: HashMap<String, usize> = HashMap::new();
        for record in records.iter() {
            // A null in any key field matches nothing.
            let key = key_of(record, &parent_fields);
            if let Some(key) = &key {
                let slot = *group_index.entry(key.clone()).or_insert_with(|| {
                    groups.push(Vec::new());
                    groups.len() - 1
                });
                groups[slot].push(record.clone());
            }
            keys.push(key);
        }

        let mut scopes: Vec<Scope> = groups
            .into_iter()
            .map(|group| {
                let mut group_scope = scope.clone();
                group_scope.insert(parent_id.clone(), Arc::new(Output::Records(group)));
                group_scope
            })
            .collect();
        debug!(
            child = %child.child.id,
            groups = scopes.len(),
            "Fanning out join child"
        );
        let outputs = try_join_all(
            scopes
                .iter_mut()
                .map(|group_scope| self.evaluate(&child.child, execution, group_scope)),
        )
        .await?;

        let mut related: HashMap<String, Vec<Record>> = HashMap::new();
        let mut all = Vec::new();
        for output in &outputs {
            for record in records_of(&child.child.id, output)? {
                if let Some(key) = key_of(record, &child_fields) {
                    related.entry(key).or_default().push(record.clone());
                }
                all.push(record.clone());
            }
        }
        scope.insert(child.child.id.clone(), Arc::new(Output::Records(all)));

        for (record, key) in records.iter_mut().zip(&keys) {
            let matches = key
                .as_ref()
                .and_then(|key| related.get(key))
                .cloned()
                .unwrap_or_default();
            let value = if child.unique {
                matches.into_iter().next().map_or(Value::Null, Value::Object)
            } else {
                Value::List(matches.into_iter().map(Value::Object).collect())
            };
            record.insert(child.attach_as.clone(), value);
        }
        Ok(())
    }

    async fn run_independent(
        &self,
        batch: &BatchNode,
        execution: &Execution,
        scope: &mut Scope,
    ) -> EngineResult<Output> {
        let mut outcomes = Vec::with_capacity(batch.children.len());
        let mut aborted = false;
        for child in &batch.children {
            if aborted {
                outcomes.push(BatchOutcome::Skipped);
                continue;
            }
            let missing = child
                .external_references()
                .into_iter()
                .find(|dependency| !scope.contains(dependency));
            if let Some(dependency) = missing {
                debug!(
                    node = %child.id,
                    dependency = %dependency,
                    "Dependency failed, batch child skipped"
                );
                outcomes.push(BatchOutcome::Skipped);
                continue;
            }
            match self.evaluate(child, execution, scope).await {
                Ok(output) => outcomes.push(BatchOutcome::Data(output.as_ref().clone())),
                Err(error) if is_fatal(&error) => return Err(error),
                Err(error) => {
                    warn!(
                        node = %child.id,
                        kind = error.kind.as_str(),
                        "Batch child failed"
                    );
                    aborted = self.options.batch_failure_policy == BatchFailurePolicy::Abort;
                    outcomes.push(BatchOutcome::Error(error));
                }
            }
        }
        Ok(Output::Batch(outcomes))
    }

    /// Evaluates children in declaration order, stopping at the first error.
    async fn run_all(
        &self,
        children: &[PlanNode],
        execution: &Execution,
        scope: &mut Scope,
    ) -> EngineResult<Vec<Output>> {
        let mut outputs = Vec::with_capacity(children.len());
        for child in children {
            let output = self.evaluate(child, execution, scope).await?;
            outputs.push(output.as_ref().clone());
        }
        Ok(outputs)
    }

    /// Starts a transaction unless the request already runs in one.
    async fn enter_transaction(
        &self,
        isolation_level: Option<IsolationLevel>,
        execution: &Execution,
    ) -> EngineResult<(Execution, Option<TransactionId>)> {
        if let Connection::Transaction(_) = execution.connection {
            return Ok((execution.clone(), None));
        }
        let level = isolation_level.or(self.options.default_isolation_level);
        let id = self.transactions.start(level).await?;
        let inner = Execution {
            connection: Connection::Transaction(id),
            ..execution.clone()
        };
        Ok((inner, Some(id)))
    }

    /// Commits a transaction started by [`enter_transaction`] on success and
    /// rolls it back on failure. Transactions owned by the caller are left
    /// alone.
    async fn leave_transaction<T>(
        &self,
        started: Option<TransactionId>,
        result: EngineResult<T>,
    ) -> EngineResult<T> {
        let Some(id) = started else {
            return result;
        };
        match result {
            Ok(value) => {
                self.transactions.commit(id).await?;
                Ok(value)
            }
            Err(error) => {
                if let Err(rollback_error) = self.transactions.rollback(id).await {
                    warn!(
                        transaction_id = %id,
                        error = %rollback_error,
                        "Rollback after failed batch did not complete"
                    );
                }
                Err(error)
            }
        }
    }
}

/// Errors that end the whole request instead of a single batch child.
fn is_fatal(error: &CanonicalError) -> bool {
    matches!(
        error.kind,
        ErrorKind::PlanError | ErrorKind::Cancelled | ErrorKind::ResponseTooLarge
    )
}

fn records_of<'o>(id: &NodeId, output: &'o Output) -> EngineResult<&'o [Record]> {
    output.records().ok_or_else(|| {
        CanonicalError::plan(format!("node `{id}` does not produce records"))
    })
}

fn key_of(record: &Record, fields: &[&str]) -> Option<String> {
    let values = fields
        .iter()
        .map(|field| get_path(record, field).filter(|value| !value.is_null()).cloned())
        .collect::<Option<Vec<_>>>()?;
    Some(correlation_key(&values))
}

fn not_evaluated(id: &NodeId, node: &NodeId) -> CanonicalError {
    CanonicalError::plan(format!(
        "node `{id}` references `{node}` which has not been evaluated"
    ))
}

/// Binds declared parameters. `None` means a referenced node produced no
/// rows, so the statement would match nothing.
fn resolve_params(
    id: &NodeId,
    params: &[Param],
    scope: &Scope,
    now: &DateTime<FixedOffset>,
) -> EngineResult<Option<Vec<Value>>> {
    let mut values = Vec::with_capacity(params.len());
    for param in params {
        match param {
            Param::Literal { value } => values.push(value.clone()),
            Param::Generator { generator } => values.push(match generator {
                Generator::Now => Value::DateTime(*now),
                Generator::Uuid => Value::Uuid(Uuid::new_v4()),
            }),
            Param::LastInsertId { node } => {
                if !scope.contains(node) {
                    return Err(not_evaluated(id, node));
                }
                values.push(scope.last_insert_ids.get(node).cloned().unwrap_or(Value::Null));
            }
            Param::Ref { node, field, arity } => {
                let output = scope
                    .outputs
                    .get(node)
                    .ok_or_else(|| not_evaluated(id, node))?;
                let records = records_of(node, output)?;
                if records.is_empty() {
                    return Ok(None);
                }
                let field_of = |record: &Record| {
                    get_path(record, field).cloned().ok_or_else(|| {
                        CanonicalError::plan(format!(
                            "node `{id}` binds `{node}.{field}` which is not in its output"
                        ))
                    })
                };
                values.push(match arity {
                    Arity::Scalar => field_of(&records[0])?,
                    Arity::List => Value::List(
                        records.iter().map(field_of).collect::<EngineResult<_>>()?,
                    ),
                });
            }
        }
    }
    Ok(Some(values))
}

fn matches_predicate(record: &Record, predicate: &Predicate) -> bool {
    let field_value = |field: &str| get_path(record, field).unwrap_or(&Value::Null);
    let ordered = |field: &str, value: &Value, accept: fn(std::cmp::Ordering) -> bool| {
        field_value(field).compare(value).map_or(false, accept)
    };
    match predicate {
        Predicate::And { predicates } => predicates.iter().all(|p| matches_predicate(record, p)),
        Predicate::Or { predicates } => predicates.iter().any(|p| matches_predicate(record, p)),
        Predicate::Not { predicate } => !matches_predicate(record, predicate),
        Predicate::Eq { field, value } => field_value(field).loosely_equals(value),
        Predicate::Ne { field, value } => !field_value(field).loosely_equals(value),
        Predicate::Gt { field, value } => ordered(field, value, |o| o.is_gt()),
        Predicate::Gte { field, value } => ordered(field, value, |o| o.is_ge()),
        Predicate::Lt { field, value } => ordered(field, value, |o| o.is_lt()),
        Predicate::Lte { field, value } => ordered(field, value, |o| o.is_le()),
        Predicate::In { field, values } => {
            let actual = field_value(field);
            values.iter().any(|candidate| actual.loosely_equals(candidate))
        }
        Predicate::IsNull { field } => field_value(field).is_null(),
        Predicate::NotNull { field } => !field_value(field).is_null(),
    }
}

fn apply_ops(mut records: Vec<Record>, ops: &[MapOp]) -> EngineResult<Vec<Record>> {
    for op in ops {
        match op {
            MapOp::Pick { fields } => {
                for record in &mut records {
                    record.retain(|key, _| fields.contains(key));
                }
            }
            MapOp::Omit { fields } => {
                for record in &mut records {
                    record.retain(|key, _| !fields.contains(key));
                }
            }
            MapOp::Rename { from, to } => {
                for record in &mut records {
                    if let Some(value) = record.remove(from) {
                        record.insert(to.clone(), value);
                    }
                }
            }
            MapOp::Set { field, value } => {
                for record in &mut records {
                    record.insert(field.clone(), value.clone());
                }
            }
            MapOp::Reverse => records.reverse(),
            MapOp::Skip { count } => {
                let count = (*count).min(records.len());
                records.drain(..count);
            }
            MapOp::Take { count } => records.truncate(*count),
            MapOp::Distinct { fields } => {
                let mut seen = HashSet::new();
                records.retain(|record| {
                    let values: Vec<Value> = fields
                        .iter()
                        .map(|field| get_path(record, field).cloned().unwrap_or(Value::Null))
                        .collect();
                    seen.insert(correlation_key(&values))
                });
            }
            MapOp::Unique => {
                if records.len() > 1 {
                    return Err(CanonicalError::new(
                        ErrorKind::Unknown,
                        format!("Expected zero or one element, got {}", records.len()),
                    ));
                }
            }
            MapOp::Required { message } => {
                if records.is_empty() {
                    return Err(CanonicalError::new(
                        ErrorKind::RecordNotFound,
                        message
                            .clone()
                            .unwrap_or_else(|| "No record was found for a query.".to_string()),
                    ));
                }
            }
        }
    }
    Ok(records)
}
