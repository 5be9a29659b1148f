//! The shipped garbage policy: delete only objects explicitly opted in.
//!
//! What makes a fleet garbage is deliberately a plugin point; this policy is
//! the conservative default. An object of a watched kind is collected only
//! when it carries the label `fleetsweep.io/garbage: "true"`. Swap in a
//! different [`Reconciler`] registration for any other rule.

use std::sync::Arc;

use fleetsweep_core::{ObjectRef, Reconciler, ReconcileResult, WorkItemKey};
use fleetsweep_kube::KubeHub;
use kube::core::DynamicObject;
use tracing::{debug, info};

pub const GARBAGE_LABEL: &str = "fleetsweep.io/garbage";

pub struct LabelCollector {
    hub: Arc<KubeHub>,
}

impl LabelCollector {
    pub fn new(hub: Arc<KubeHub>) -> Self {
        Self { hub }
    }
}

fn is_marked(obj: &DynamicObject) -> bool {
    obj.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(GARBAGE_LABEL))
        .map(|v| v == "true")
        .unwrap_or(false)
}

#[async_trait::async_trait]
impl Reconciler for LabelCollector {
    async fn reconcile(&self, key: WorkItemKey) -> ReconcileResult {
        let object = ObjectRef { namespace: key.namespace.clone(), name: key.name.clone() };
        let obj = match self.hub.fetch(&key.kind, &object).await {
            Ok(Some(obj)) => obj,
            Ok(None) => {
                // Deletion events land here; nothing left to collect.
                debug!(key = %key, "object no longer exists");
                return ReconcileResult::Done;
            }
            Err(err) => return ReconcileResult::Error(err),
        };
        if !is_marked(&obj) {
            return ReconcileResult::Done;
        }
        match self.hub.delete(&key.kind, &object).await {
            Ok(()) => {
                info!(key = %key, "garbage object collected");
                ReconcileResult::Done
            }
            Err(err) => ReconcileResult::Error(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::{ApiResource, GroupVersionKind};

    fn fleet(labels: &[(&str, &str)]) -> DynamicObject {
        let ar = ApiResource::from_gvk(&GroupVersionKind {
            group: "agones.dev".into(),
            version: "v1".into(),
            kind: "Fleet".into(),
        });
        let mut obj = DynamicObject::new("lobby", &ar).within("game");
        if !labels.is_empty() {
            obj.metadata.labels = Some(
                labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            );
        }
        obj
    }

    #[test]
    fn only_the_exact_opt_in_label_marks_garbage() {
        assert!(!is_marked(&fleet(&[])));
        assert!(!is_marked(&fleet(&[("app", "lobby")])));
        assert!(!is_marked(&fleet(&[(GARBAGE_LABEL, "false")])));
        assert!(!is_marked(&fleet(&[(GARBAGE_LABEL, "yes")])));
        assert!(is_marked(&fleet(&[(GARBAGE_LABEL, "true")])));
    }
}
