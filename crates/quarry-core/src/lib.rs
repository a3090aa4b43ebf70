//! Core domain types and traits for the Quarry query plan execution engine.

pub mod error;
pub mod ids;
pub mod limits;
pub mod metrics;
pub mod plan;
pub mod result_set;
pub mod traits;
pub mod value;

pub use error::{CanonicalError, Constraint, DriverError, DriverResult, EngineResult, ErrorKind};
pub use ids::TransactionId;
pub use limits::ResourceLimits;
pub use plan::{
    ApplyConstantNode, Arity, BatchMode, BatchNode, FilterNode, Fragment, Generator, JoinChild,
    JoinNode, MapOp, MapResultNode, NodeId, Param, PlaceholderFormat, PlanNode, PlanNodeKind,
    Predicate, QueryKind, QueryNode, QueryPlan, Statement, TransactionBoundaryNode,
};
pub use result_set::{ColumnType, ResultSet};
pub use traits::{
    ConnectionInfo, DriverAdapter, IsolationLevel, Provider, Queryable, RowBudget, SqlQuery,
    Transaction, TransactionOptions,
};
pub use value::{parse_bigint, parse_decimal, BigInt, Decimal, Record, Value};
