pub mod catalog;
pub mod content;
pub mod engine;
pub mod error;
pub mod functions;
pub mod glob;
pub mod process;
pub mod provider;
pub mod providers;
pub mod session;
pub mod state;
pub mod transport;
pub mod variables;

pub use catalog::{ModelCatalog, ModelInfo};
pub use engine::{Engine, Runtime};
pub use error::{ExecError, RuntimeError};
pub use functions::{FunctionDescriptor, FunctionRegistry};
pub use provider::{AdapterRegistry, ProviderAdapter};
pub use session::{FileSessionStore, SessionRecord, SessionStore};
pub use state::{Counters, EngineStatus, ExecutionState};
pub use transport::{HttpTransport, ScriptedTransport, Transport};
pub use variables::VariableStore;
