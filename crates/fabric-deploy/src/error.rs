//! Error taxonomy for a deployment run.

use std::fmt;
use std::path::PathBuf;

use fabric_deploy_auth::AuthError;
use fabric_deploy_endpoint::InvokeError;
use fabric_deploy_retry::RetryExhausted;
use fabric_deploy_types::ItemKind;
use thiserror::Error;

use crate::graph::CycleError;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error(transparent)]
    Invoke(#[from] InvokeError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Cycle(#[from] CycleError),

    #[error(transparent)]
    Aggregate(#[from] AggregateFailure),

    /// Several kinds failed during one unpublish pass.
    #[error("{}", join_failures(.0))]
    Unpublish(Vec<AggregateFailure>),

    #[error(
        "Workspace {0} does not have an assigned capacity. Please assign a capacity before publishing items."
    )]
    CapacityMissing(String),

    #[error("{0}")]
    InvalidInput(String),

    #[error("{message}")]
    Repository { path: PathBuf, message: String },

    #[error("Cannot replace logical ID '{0}' as referenced item is not yet deployed.")]
    UnresolvedLogicalId(String),

    #[error("Publish {0} for Libraries")]
    EnvironmentPublish(String),

    #[error(transparent)]
    RetriesExhausted(#[from] RetryExhausted),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

impl DeployError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Json {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn repository(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Repository {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Request/response trace of the failed call, when the error came from one.
    pub fn trace(&self) -> Option<&str> {
        match self {
            DeployError::Invoke(err) => Some(err.trace()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Publish,
    Unpublish,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Publish => f.write_str("publish"),
            Operation::Unpublish => f.write_str("unpublish"),
        }
    }
}

/// One item's failure inside a kind pass.
#[derive(Debug)]
pub struct ItemFailure {
    pub name: String,
    pub error: DeployError,
}

/// Every per-item failure of one kind pass, raised once the pass has finished.
#[derive(Debug)]
pub struct AggregateFailure {
    pub operation: Operation,
    pub kind: ItemKind,
    /// Every item the pass attempted, in attempt order.
    pub attempted: Vec<String>,
    /// Failures in the order the items were attempted.
    pub failures: Vec<ItemFailure>,
}

impl AggregateFailure {
    pub fn failed_names(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.name.as_str()).collect()
    }

    /// Attempted items that did not fail.
    pub fn succeeded_names(&self) -> Vec<&str> {
        self.attempted
            .iter()
            .map(String::as_str)
            .filter(|name| !self.failures.iter().any(|f| f.name == *name))
            .collect()
    }
}

impl fmt::Display for AggregateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = self
            .failures
            .iter()
            .map(|failure| format!("'{}'", failure.name))
            .collect::<Vec<_>>()
            .join(", ");
        write!(
            f,
            "Failed to {} {} of {} {} item(s): {}",
            self.operation,
            self.failures.len(),
            self.attempted.len(),
            self.kind,
            names
        )?;
        for failure in &self.failures {
            write!(f, "\n  - {}: {}", failure.name, failure.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateFailure {}

fn join_failures(failures: &[AggregateFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}
