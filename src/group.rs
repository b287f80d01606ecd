// Group - admission policy over a set of instances
//
// Two independent switches shape behavior. `swap` serializes launches within
// the group; `exclusive` additionally evicts every other member before the
// target may start. Groups with neither flag impose nothing and their lock
// is skipped entirely.
//
// Lock order is Group then Instance, never the reverse; instances never call
// back into their group.

use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::GroupConfig;
use crate::error::RouteError;
use crate::instance::{Instance, InstanceState, StopReason};

pub struct Group {
    config: GroupConfig,
    /// Config member order; eviction walks this order
    members: Vec<Arc<Instance>>,
    /// FIFO admission queue for swap groups. Dropping a waiting admission
    /// future releases its place with no side effects.
    admission: Mutex<()>,
}

impl Group {
    pub fn new(config: GroupConfig, members: Vec<Arc<Instance>>) -> Arc<Self> {
        Arc::new(Self {
            config,
            members,
            admission: Mutex::new(()),
        })
    }

    /// Admit a request targeting `target`, driving it to Ready under this
    /// group's policy. `target` must be a member.
    pub async fn admit(&self, target: &Arc<Instance>) -> Result<(), RouteError> {
        if !self.config.swap {
            // Members coexist freely; no group-level serialization
            return target.ensure_ready().await;
        }

        let _slot = self.admission.lock().await;

        if self.config.exclusive {
            // Evict peers before the target starts. Each stop returns only
            // once the peer is fully Stopped, so by the time ensure_ready
            // launches the target at most one member is non-stopped.
            for peer in &self.members {
                if peer.id() == target.id() {
                    continue;
                }
                if matches!(
                    peer.state(),
                    InstanceState::Ready | InstanceState::Starting
                ) {
                    tracing::info!(
                        "evicting `{}` from group `{}` to admit `{}`",
                        peer.id(),
                        self.config.name,
                        target.id()
                    );
                    peer.stop(StopReason::Evicted).await;
                }
            }
        }

        // The launch (if any) completes while the admission slot is held;
        // that is what serializes starts within a swap group.
        target.ensure_ready().await
    }
}
