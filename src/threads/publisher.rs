//! Publisher task: periodically serializes and publishes the incremental
//! pose-graph diff.
//!
//! Holds the reader lock while serializing; the diff clear upgrades to the
//! writer lock only after the message is built, so a publish never blocks
//! ingestion for longer than the serialization itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{tick, Sender};
use parking_lot::{RwLock, RwLockUpgradableReadGuard};

use crate::graph::{PoseGraph, PoseGraphMsg};

/// The publisher worker thread.
pub struct PublisherThread {
    handle: JoinHandle<()>,
}

impl PublisherThread {
    /// Spawn the publisher. Empty diffs are not published.
    pub fn spawn(
        graph: Arc<RwLock<PoseGraph>>,
        publish_tx: Sender<PoseGraphMsg>,
        period: Duration,
        running: Arc<AtomicBool>,
    ) -> Self {
        let handle = thread::Builder::new()
            .name("publisher".into())
            .spawn(move || {
                let ticker = tick(period);
                log::info!("publisher thread starting ({period:?} period)");
                while running.load(Ordering::Relaxed) {
                    if ticker.recv().is_err() {
                        break;
                    }
                    let msg = {
                        let guard = graph.upgradable_read();
                        let msg = guard.to_incremental_msg();
                        if msg.is_empty() {
                            continue;
                        }
                        let mut guard = RwLockUpgradableReadGuard::upgrade(guard);
                        guard.clear_incremental();
                        msg
                    };
                    if publish_tx.send(msg).is_err() {
                        log::warn!("pose-graph subscriber gone, publisher stopping");
                        break;
                    }
                }
                log::info!("publisher thread stopped");
            })
            .expect("failed to spawn publisher thread");
        Self { handle }
    }

    pub fn join(self) -> thread::Result<()> {
        self.handle.join()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GraphConfig;
    use crate::core::types::{Covariance6, Key, Pose3D};
    use crossbeam_channel::unbounded;

    #[test]
    fn test_publishes_diff_then_goes_quiet() {
        let graph = Arc::new(RwLock::new(PoseGraph::new(&GraphConfig::default())));
        graph
            .write()
            .initialize(
                1_000_000,
                Key::new('a', 0),
                Pose3D::identity(),
                Covariance6::from_sigmas(0.01, 0.01),
            )
            .unwrap();

        let (tx, rx) = unbounded();
        let running = Arc::new(AtomicBool::new(true));
        let publisher = PublisherThread::spawn(
            graph.clone(),
            tx,
            Duration::from_millis(10),
            running.clone(),
        );

        let msg = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("expected one incremental publication");
        assert!(msg.incremental);
        assert_eq!(msg.nodes.len(), 1);
        assert_eq!(msg.priors.len(), 1);

        // Diff cleared: no further messages while the graph is unchanged.
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        running.store(false, Ordering::Relaxed);
        publisher.join().unwrap();
    }
}
