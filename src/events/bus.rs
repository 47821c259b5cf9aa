//! # Event bus: single-producer fan-out of Info snapshots.
//!
//! Every lifecycle change publishes a full [`Info`] snapshot into the bus.
//! One pump task forwards each snapshot to the buffered outward channel
//! (the UI consumer) and hands it to an inline observer (the temp-service
//! reaper).
//!
//! ## Key characteristics
//! - **Non-blocking**: `publish` uses `try_send`; producers never wait.
//! - **Lossy outward**: a slow UI drops intermediate snapshots and catches
//!   up on the next one. Consumers must treat each event as a full
//!   snapshot, not a delta.
//! - **Ordered per service**: a single pump task preserves the order in
//!   which one service's snapshots were published. There is no
//!   cross-service ordering guarantee.

use tokio::sync::mpsc;

use super::info::Info;

/// Capacity of the outward updates channel.
pub const UPDATES_BUFFER: usize = 100;

/// Handle used by services and the registry to publish snapshots.
#[derive(Clone)]
pub struct Bus {
    tx: mpsc::Sender<Info>,
}

/// The receiving half of the bus, consumed once by [`BusPump::spawn`].
pub struct BusPump {
    rx_in: mpsc::Receiver<Info>,
    tx_out: mpsc::Sender<Info>,
}

impl Bus {
    /// Creates the bus, its pump, and the outward updates receiver.
    pub fn new() -> (Bus, BusPump, mpsc::Receiver<Info>) {
        let (tx_in, rx_in) = mpsc::channel(UPDATES_BUFFER);
        let (tx_out, rx_out) = mpsc::channel(UPDATES_BUFFER);

        (Bus { tx: tx_in }, BusPump { rx_in, tx_out }, rx_out)
    }

    /// Publishes a snapshot, best-effort.
    ///
    /// Dropped silently when the pump is saturated or gone; the system
    /// operates fine without observers.
    pub fn publish(&self, info: Info) {
        if let Err(err) = self.tx.try_send(info) {
            tracing::trace!(error = %err, "dropped service update");
        }
    }
}

impl BusPump {
    /// Starts the pump task.
    ///
    /// Each incoming snapshot is forwarded to the outward channel
    /// (drop-on-full) and then passed to `observe`. Runs until every `Bus`
    /// handle is dropped.
    pub fn spawn<F>(mut self, mut observe: F)
    where
        F: FnMut(&Info) + Send + 'static,
    {
        tokio::spawn(async move {
            while let Some(info) = self.rx_in.recv().await {
                match self.tx_out.try_send(info.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::trace!(service = info.name(), "updates consumer lagging, dropped");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                }
                observe(&info);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use crate::config::ServiceConfig;

    fn info(name: &str) -> Info {
        Info {
            config: ServiceConfig {
                name: name.to_string(),
                program: "true".to_string(),
                args: Vec::new(),
                dir: "/".into(),
                env: Default::default(),
                auto_start: false,
                restart_on_exit: false,
                temp: false,
                clean_after: Duration::ZERO,
            },
            running: false,
            pid: 0,
            succeeded: false,
            dead: false,
            start_time: None,
            end_time: None,
            runtime: Duration::ZERO,
            tail: Vec::new(),
        }
    }

    #[tokio::test]
    async fn pump_forwards_and_observes() {
        let (bus, pump, mut updates) = Bus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        pump.spawn(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(info("a"));
        bus.publish(info("b"));

        let first = tokio::time::timeout(Duration::from_secs(1), updates.recv())
            .await
            .expect("timed out")
            .expect("channel open");
        assert_eq!(first.name(), "a");
        let second = tokio::time::timeout(Duration::from_secs(1), updates.recv())
            .await
            .expect("timed out")
            .expect("channel open");
        assert_eq!(second.name(), "b");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn slow_consumer_never_blocks_publishers() {
        let (bus, pump, updates) = Bus::new();
        pump.spawn(|_| {});

        // Nobody reads `updates`; publishing far past both buffers must not
        // wedge.
        for i in 0..(UPDATES_BUFFER * 3) {
            bus.publish(info(&format!("svc-{i}")));
        }
        drop(updates);
        bus.publish(info("after-close"));
    }
}
