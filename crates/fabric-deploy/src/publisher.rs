//! Per-kind publish lifecycle.
//!
//! [`publish_all`] runs `pre_publish_all`, enumerates items, publishes each
//! one and finally runs `post_publish_all`. Items run in an explicit order
//! when the kind provides one, otherwise in a bounded worker pool when
//! parallelism is enabled, otherwise sequentially. A failed item never stops
//! its siblings; failures are raised together once every item was attempted.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use fabric_deploy_types::{Item, ItemKind, ReporterHandle};

use crate::error::{AggregateFailure, DeployError, ItemFailure, Operation};
use crate::workspace::Workspace;

/// Computes the publish order of a kind's items.
pub type OrderFn = fn(&Workspace) -> Result<Vec<String>, DeployError>;

/// Upper bound on the default worker count.
pub const MAX_DEFAULT_WORKERS: usize = 32;

#[derive(Debug, Clone, Copy)]
pub struct ParallelConfig {
    pub enabled: bool,
    /// `None` uses [`default_max_workers`].
    pub max_workers: Option<usize>,
    /// When set, items run sequentially in this order and `enabled` is ignored.
    pub ordered_items: Option<OrderFn>,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_workers: None,
            ordered_items: None,
        }
    }
}

impl ParallelConfig {
    pub fn sequential() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn ordered(order: OrderFn) -> Self {
        Self {
            enabled: false,
            max_workers: None,
            ordered_items: Some(order),
        }
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = Some(max_workers);
        self
    }

    /// Workers to start for `items` items; never zero, never more than items.
    pub fn worker_count(&self, items: usize) -> usize {
        self.max_workers
            .unwrap_or_else(default_max_workers)
            .min(items)
            .max(1)
    }
}

/// `min(32, cpus + 4)`
pub fn default_max_workers() -> usize {
    let cpus = thread::available_parallelism().map_or(1, |n| n.get());
    MAX_DEFAULT_WORKERS.min(cpus + 4)
}

/// Publishing behaviour of one item kind.
pub trait ItemPublisher: Send + Sync {
    fn kind(&self) -> ItemKind;

    fn parallel_config(&self) -> ParallelConfig {
        ParallelConfig::default()
    }

    fn pre_publish_all(&self, _workspace: &mut Workspace) -> Result<(), DeployError> {
        Ok(())
    }

    /// Candidate items, in enumeration order.
    fn items_to_publish<'w>(&self, workspace: &'w Workspace) -> Vec<&'w Item> {
        workspace.repository_items(self.kind()).collect()
    }

    fn publish_one(&self, workspace: &Workspace, item: &Item) -> Result<(), DeployError> {
        workspace.publish_item(item).map(|_| ())
    }

    fn post_publish_all(&self, _workspace: &mut Workspace) -> Result<(), DeployError> {
        Ok(())
    }

    /// Verifies remote completion once every item of the kind was dispatched.
    fn post_publish_all_check(&self, _workspace: &Workspace) -> Result<(), DeployError> {
        Ok(())
    }

    /// Order in which `names` are deleted. Defaults to the given order.
    fn unpublish_order(
        &self,
        _workspace: &Workspace,
        names: Vec<String>,
    ) -> Result<Vec<String>, DeployError> {
        Ok(names)
    }
}

/// What one kind pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishSummary {
    pub attempted: Vec<String>,
    pub skipped: Vec<String>,
}

/// Run the full publish lifecycle of `publisher`.
pub fn publish_all(
    publisher: &dyn ItemPublisher,
    workspace: &mut Workspace,
) -> Result<PublishSummary, DeployError> {
    publisher.pre_publish_all(workspace)?;

    let (summary, failures) = {
        let ws: &Workspace = workspace;
        let items = publisher.items_to_publish(ws);
        if items.is_empty() {
            (PublishSummary::default(), Vec::new())
        } else {
            let config = publisher.parallel_config();
            let attempted: Vec<&Item> = match config.ordered_items {
                Some(order) => {
                    let order = order(ws)?;
                    order
                        .iter()
                        .filter_map(|name| items.iter().find(|item| item.name() == name).copied())
                        .collect()
                }
                None => items,
            };

            let failures = if config.ordered_items.is_none() && config.enabled {
                publish_parallel(publisher, ws, &attempted, config.worker_count(attempted.len()))
            } else {
                attempted
                    .iter()
                    .filter_map(|item| publish_guarded(publisher, ws, item))
                    .collect()
            };

            let summary = PublishSummary {
                attempted: attempted.iter().map(|i| i.name().to_string()).collect(),
                skipped: attempted
                    .iter()
                    .filter(|i| i.is_skipped())
                    .map(|i| i.name().to_string())
                    .collect(),
            };
            (summary, failures)
        }
    };

    publisher.post_publish_all(workspace)?;

    if !failures.is_empty() {
        return Err(AggregateFailure {
            operation: Operation::Publish,
            kind: publisher.kind(),
            attempted: summary.attempted,
            failures,
        }
        .into());
    }
    Ok(summary)
}

fn publish_guarded(
    publisher: &dyn ItemPublisher,
    workspace: &Workspace,
    item: &Item,
) -> Option<ItemFailure> {
    match publisher.publish_one(workspace, item) {
        Ok(()) => None,
        Err(error) => {
            workspace.reporter().error(&format!(
                "Failed to publish {} '{}': {error}",
                publisher.kind(),
                item.name()
            ));
            Some(ItemFailure {
                name: item.name().to_string(),
                error,
            })
        }
    }
}

/// Fixed-size scoped pool pulling items by index. Failures come back in
/// enumeration order regardless of completion order.
fn publish_parallel(
    publisher: &dyn ItemPublisher,
    workspace: &Workspace,
    items: &[&Item],
    workers: usize,
) -> Vec<ItemFailure> {
    let next = AtomicUsize::new(0);
    let failures = Mutex::new(Vec::new());

    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                loop {
                    let index = next.fetch_add(1, Ordering::SeqCst);
                    let Some(item) = items.get(index) else {
                        break;
                    };
                    if let Some(failure) = publish_guarded(publisher, workspace, item) {
                        failures
                            .lock()
                            .unwrap_or_else(|p| p.into_inner())
                            .push((index, failure));
                    }
                }
            });
        }
    });

    let mut failures = failures.into_inner().unwrap_or_else(|p| p.into_inner());
    failures.sort_by_key(|(index, _)| *index);
    failures.into_iter().map(|(_, failure)| failure).collect()
}
