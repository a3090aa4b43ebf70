pub mod context;
pub mod governor;
pub mod interpreter;
pub mod render;
pub mod serializer;
pub mod transaction;

pub use context::{BatchOutcome, Output};
pub use governor::{ResourceGovernor, ResponseBudget};
pub use interpreter::{BatchFailurePolicy, InterpreterOptions, QueryInterpreter};
pub use render::render;
pub use serializer::{coerce, serialize};
pub use transaction::{TransactionManager, TransactionState};
pub use tokio_util::sync::CancellationToken;
