//! Converge: the policy-evaluation core of a declarative
//! configuration-management agent.
//!
//! Administrators write policy describing the desired state of a host;
//! the engine expands that policy against a scoped variable store,
//! iterates promises over their list variables, and converges the system
//! through idempotent repair actions under persistent promise locks. File
//! content converges through a framed copy protocol with RSA
//! challenge-response authentication.
//!
//! The workspace splits along those lines: `core` holds the value and
//! promise model, `vars` the scope store and expander, `engine` the
//! iteration and dispatch machinery, `locks` the persistent lock
//! manager, `client` the copy protocol, and `config` the agent
//! configuration.

pub use converge_client as client;
pub use converge_config as config;
pub use converge_core as core;
pub use converge_engine as engine;
pub use converge_locks as locks;
pub use converge_vars as vars;

/// The common imports of an embedding application
pub mod prelude {
    pub use converge_client::{ClientContext, ConnectionPool, KeyPair, KeyStore};
    pub use converge_config::AgentConfig;
    pub use converge_core::{
        Bundle, ClassStore, CopyAttributes, DataType, Promise, PromiseResult, Rval,
        TransactionAttributes,
    };
    pub use converge_engine::{Actuator, ActuatorRegistry, EvalContext, ReportsActuator};
    pub use converge_locks::LockManager;
    pub use converge_vars::ScopeStore;
}
