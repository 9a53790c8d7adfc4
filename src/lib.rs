//! Mock API rule engine
//!
//! Evaluates incoming HTTP requests against a set of user-defined mock rules
//! and decides what response to synthesize. Meant for testing, development and
//! demos against APIs that are not there yet.
//!
//! # Features
//!
//! - **Request Matching**: Match by method, path, headers, query params, body
//! - **Priority Resolution**: Lowest priority number wins, first declared on ties
//! - **Fault Injection**: Probabilistic error responses
//! - **Latency Simulation**: Fixed or variable delays
//! - **Conditional Responses**: Variants keyed by a correlation header
//! - **Dynamic Templates**: Handlebars placeholders in bodies and headers
//!
//! # Example Configuration
//!
//! ```yaml
//! rules:
//!   - id: get-user
//!     priority: 10
//!     matcher:
//!       method: GET
//!       path: /users/{id}
//!     response:
//!       status: 200
//!       templating: true
//!       body:
//!         id: "{{path.id}}"
//!         name: "User {{path.id}}"
//!     fault:
//!       delay: variable
//!       min_ms: 50
//!       max_ms: 150
//!       error_probability: 5
//! ```

pub mod conditional;
pub mod config;
pub mod engine;
pub mod fault;
pub mod matcher;
pub mod pattern;
pub mod provider;
pub mod request;
pub mod template;

pub use config::{LoadError, Rule, RuleSetConfig};
pub use engine::{DispatchOutcome, Engine, ResolvedDispatch};
pub use matcher::RuleSet;
pub use provider::{FileRuleSetProvider, RuleSetProvider, StaticRuleSetProvider};
pub use request::IncomingRequest;
