//! `clamma-runtime` - the process-wide engine: model lifecycle, session
//! lifecycle, and the round-robin step driver (spec components H, I).

pub mod error;
pub mod model;
pub mod registry;
pub mod runtime;
pub mod session;

#[cfg(test)]
pub(crate) mod test_fixtures;

pub use error::{Result, RuntimeError};
pub use model::{Model, ModelInfo, ModelSummary, ModelType};
pub use registry::{ModelRegistry, SessionRegistry};
pub use runtime::Runtime;
pub use session::{IssueCallback, QueryInfo, Session, SessionId};
