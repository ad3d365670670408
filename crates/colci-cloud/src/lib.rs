//! External collaborators of a CI run
//!
//! The engine only talks to the outside world through the traits in
//! [`adapter`]:
//! - [`ModelCompiler`] compiles the current branch and reports modified nodes
//! - [`LineageSource`] serves the deferred environment's state and column lineage
//! - [`RunTrigger`] starts the CI job with a selection and waits for it
//! - [`RunReporter`] publishes the run summary
//!
//! Implementations: the dbt CLI ([`DbtCli`]), the dbt Cloud Admin and
//! Discovery APIs ([`DbtCloudClient`]), GitHub pull request comments
//! ([`GithubReporter`]), the console ([`ConsoleReporter`]) and in-memory mocks.

pub mod adapter;
pub mod mock;
pub mod dbt_cli;
pub mod dbt_cloud;
pub mod github;

pub use adapter::{
    CollaboratorError, CompiledProject, LineageSource, ModelCompiler, PreviousState, RunReporter,
    RunTrigger,
};
pub use mock::{MockCompiler, MockLineage, MockTrigger, MemoryReporter};
pub use dbt_cli::DbtCli;
pub use dbt_cloud::{DbtCloudClient, run_status_from_code};
pub use github::{GithubReporter, ConsoleReporter, reporter_from_config};
