//! Compiled query plans as received from the upstream compiler.
//!
//! A plan is a finite tree. Nodes are evaluated depth-first, post-order;
//! a node may reference the output of any node evaluated before it (earlier
//! batch siblings and their descendants, the parent of a join) by id.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CanonicalError, EngineResult};
use crate::traits::IsolationLevel;
use crate::value::{Record, Value};

/// Identifier of a plan node, unique within one plan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Root of a compiled plan. An absent root is an empty plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    #[serde(default)]
    pub root: Option<PlanNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanNode {
    pub id: NodeId,
    #[serde(flatten)]
    pub kind: PlanNodeKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PlanNodeKind {
    Query(QueryNode),
    Filter(FilterNode),
    Join(JoinNode),
    Batch(BatchNode),
    TransactionBoundary(TransactionBoundaryNode),
    ApplyConstant(ApplyConstantNode),
    MapResult(MapResultNode),
}

/// Whether a statement returns rows or an affected-row count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueryKind {
    #[default]
    Read,
    Write,
}

impl QueryKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryNode {
    pub statement: Statement,
    #[serde(default)]
    pub kind: QueryKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Statement {
    /// Finished SQL with one bind value per parameter.
    Raw {
        sql: String,
        #[serde(default)]
        params: Vec<Param>,
    },
    /// SQL assembled from fragments; placeholders are numbered at render time.
    Template {
        fragments: Vec<Fragment>,
        #[serde(default)]
        params: Vec<Param>,
        #[serde(default)]
        placeholder: PlaceholderFormat,
        /// Whether an oversized list parameter may be split across statements.
        #[serde(default)]
        chunkable: bool,
    },
}

impl Statement {
    #[must_use]
    pub fn params(&self) -> &[Param] {
        match self {
            Self::Raw { params, .. } | Self::Template { params, .. } => params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Fragment {
    Text { chunk: String },
    /// One placeholder, consuming the next parameter.
    Param,
    /// `(p1,p2,...)` for the next (list) parameter, `NULL` when it is empty.
    ParamTuple,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceholderFormat {
    pub prefix: String,
    /// `$1, $2` when true, a bare `?` repeated when false.
    pub numbered: bool,
}

impl Default for PlaceholderFormat {
    fn default() -> Self {
        Self {
            prefix: "?".to_string(),
            numbered: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Arity {
    /// Field of the first referenced record.
    #[default]
    Scalar,
    /// Field of every referenced record, as a list.
    List,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Param {
    Literal {
        value: Value,
    },
    /// Value taken from the output of an already evaluated node.
    Ref {
        node: NodeId,
        field: String,
        #[serde(default)]
        arity: Arity,
    },
    /// Id generated by the last insert of an already evaluated node, or
    /// null when the driver reported none.
    LastInsertId { node: NodeId },
    /// Value produced at bind time.
    Generator { generator: Generator },
}

impl Param {
    /// Node whose output this parameter reads, if any.
    #[must_use]
    pub fn referenced_node(&self) -> Option<&NodeId> {
        match self {
            Self::Ref { node, .. } | Self::LastInsertId { node } => Some(node),
            Self::Literal { .. } | Self::Generator { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Generator {
    /// Request start time; every bind within one request sees the same
    /// instant.
    Now,
    /// Fresh random UUID per bind.
    Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterNode {
    pub input: Box<PlanNode>,
    pub predicate: Predicate,
}

/// In-memory row predicate over dotted field paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Predicate {
    And { predicates: Vec<Predicate> },
    Or { predicates: Vec<Predicate> },
    Not { predicate: Box<Predicate> },
    Eq { field: String, value: Value },
    Ne { field: String, value: Value },
    Gt { field: String, value: Value },
    Gte { field: String, value: Value },
    Lt { field: String, value: Value },
    Lte { field: String, value: Value },
    In { field: String, values: Vec<Value> },
    IsNull { field: String },
    NotNull { field: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinNode {
    pub parent: Box<PlanNode>,
    pub children: Vec<JoinChild>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinChild {
    pub child: PlanNode,
    /// `(parent field, child field)` pairs forming the correlation key.
    pub on: Vec<(String, String)>,
    pub attach_as: String,
    /// Attach a single record (or null) instead of a list.
    #[serde(default)]
    pub unique: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BatchMode {
    #[default]
    Independent,
    Transactional,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchNode {
    #[serde(default)]
    pub mode: BatchMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolation_level: Option<IsolationLevel>,
    pub children: Vec<PlanNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionBoundaryNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolation_level: Option<IsolationLevel>,
    pub body: Box<PlanNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyConstantNode {
    pub records: Vec<Record>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapResultNode {
    pub input: Box<PlanNode>,
    pub ops: Vec<MapOp>,
}

/// Pure reshaping step applied to a record list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum MapOp {
    Pick { fields: Vec<String> },
    Omit { fields: Vec<String> },
    Rename { from: String, to: String },
    Set { field: String, value: Value },
    Reverse,
    Skip { count: usize },
    Take { count: usize },
    /// Keeps the first record for each distinct combination of `fields`.
    Distinct { fields: Vec<String> },
    /// Passes zero or one record through; more is an error.
    Unique,
    /// Fails with `RecordNotFound` when there is no record.
    Required {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl QueryPlan {
    #[must_use]
    pub fn new(root: PlanNode) -> Self {
        Self { root: Some(root) }
    }

    /// Parses a plan from its JSON form.
    ///
    /// # Errors
    ///
    /// Returns `PlanError` for malformed JSON or unknown node shapes.
    pub fn from_json(json: &str) -> EngineResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| CanonicalError::plan(format!("malformed query plan: {e}")))
    }

    /// Checks id uniqueness and that every reference points backwards.
    ///
    /// # Errors
    ///
    /// Returns `PlanError` describing the first violation.
    pub fn validate(&self) -> EngineResult<()> {
        let Some(root) = &self.root else {
            return Ok(());
        };
        let mut ids = HashSet::new();
        root.collect_ids(&mut ids)?;
        let mut evaluated = HashSet::new();
        root.check_references(&mut evaluated)
    }
}

impl PlanNode {
    #[must_use]
    pub fn new(id: impl Into<String>, kind: PlanNodeKind) -> Self {
        Self {
            id: NodeId::new(id),
            kind,
        }
    }

    /// Short variant name for spans and error messages.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            PlanNodeKind::Query(_) => "query",
            PlanNodeKind::Filter(_) => "filter",
            PlanNodeKind::Join(_) => "join",
            PlanNodeKind::Batch(_) => "batch",
            PlanNodeKind::TransactionBoundary(_) => "transactionBoundary",
            PlanNodeKind::ApplyConstant(_) => "applyConstant",
            PlanNodeKind::MapResult(_) => "mapResult",
        }
    }

    /// Direct children in evaluation order.
    #[must_use]
    pub fn children(&self) -> Vec<&PlanNode> {
        match &self.kind {
            PlanNodeKind::Query(_) | PlanNodeKind::ApplyConstant(_) => Vec::new(),
            PlanNodeKind::Filter(node) => vec![node.input.as_ref()],
            PlanNodeKind::MapResult(node) => vec![node.input.as_ref()],
            PlanNodeKind::Join(node) => std::iter::once(node.parent.as_ref())
                .chain(node.children.iter().map(|c| &c.child))
                .collect(),
            PlanNodeKind::Batch(node) => node.children.iter().collect(),
            PlanNodeKind::TransactionBoundary(node) => vec![node.body.as_ref()],
        }
    }

    /// Nodes referenced by parameters in this subtree that are defined
    /// outside of it, in first-use order.
    #[must_use]
    pub fn external_references(&self) -> Vec<&NodeId> {
        let mut defined = HashSet::new();
        let mut referenced = Vec::new();
        self.walk(&mut |node| {
            defined.insert(&node.id);
            if let PlanNodeKind::Query(query) = &node.kind {
                referenced.extend(query.statement.params().iter().filter_map(Param::referenced_node));
            }
        });
        let mut seen = HashSet::new();
        referenced
            .into_iter()
            .filter(|id| !defined.contains(id) && seen.insert(*id))
            .collect()
    }

    fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a PlanNode)) {
        visit(self);
        for child in self.children() {
            child.walk(visit);
        }
    }

    fn collect_ids(&self, ids: &mut HashSet<NodeId>) -> EngineResult<()> {
        if !ids.insert(self.id.clone()) {
            return Err(CanonicalError::plan(format!(
                "duplicate node id `{}`",
                self.id
            )));
        }
        self.children()
            .into_iter()
            .try_for_each(|child| child.collect_ids(ids))
    }

    fn check_references(&self, evaluated: &mut HashSet<NodeId>) -> EngineResult<()> {
        for child in self.children() {
            child.check_references(evaluated)?;
        }

        match &self.kind {
            PlanNodeKind::Query(query) => {
                for param in query.statement.params() {
                    if let Some(node) = param.referenced_node() {
                        if !evaluated.contains(node) {
                            return Err(CanonicalError::plan(format!(
                                "node `{}` references `{node}` which is not evaluated before it",
                                self.id
                            )));
                        }
                    }
                }
                if let Statement::Template {
                    fragments, params, ..
                } = &query.statement
                {
                    let slots = fragments
                        .iter()
                        .filter(|f| !matches!(f, Fragment::Text { .. }))
                        .count();
                    if slots != params.len() {
                        return Err(CanonicalError::plan(format!(
                            "node `{}` has {slots} placeholders but {} parameters",
                            self.id,
                            params.len()
                        )));
                    }
                }
            }
            PlanNodeKind::Join(join) => {
                if let Some(child) = join.children.iter().find(|c| c.on.is_empty()) {
                    return Err(CanonicalError::plan(format!(
                        "join `{}` attaches `{}` without correlation fields",
                        self.id, child.attach_as
                    )));
                }
            }
            _ => {}
        }

        evaluated.insert(self.id.clone());
        Ok(())
    }
}
