use fabric_deploy_types::ItemKind;

use crate::publisher::ItemPublisher;

/// Publishes items through the workspace's create-or-update primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenericPublisher {
    kind: ItemKind,
}

impl GenericPublisher {
    pub fn new(kind: ItemKind) -> Self {
        Self { kind }
    }
}

impl ItemPublisher for GenericPublisher {
    fn kind(&self) -> ItemKind {
        self.kind
    }
}
