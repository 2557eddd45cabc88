//! Ordered work lanes for off-loop audio processing.
//!
//! A [`TaskLane`] is a bounded queue of boxed futures drained serially by one
//! worker task, so submissions never race on shared codec state and always
//! run in submission order.  Two lanes exist in practice: a foreground lane
//! for state-machine-critical work and a background lane for opportunistic
//! transcoding.  `join()` enqueues a marker and awaits it — the primitive
//! state transitions use to let in-flight work settle before applying side
//! effects.

use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::future::BoxFuture;
use log::debug;
use tokio::sync::{mpsc, oneshot};

const LANE_DEPTH: usize = 64;

enum LaneItem {
    Task(BoxFuture<'static, ()>),
    Join(oneshot::Sender<()>),
    Shutdown,
}

pub struct TaskLane {
    name: &'static str,
    tx: mpsc::Sender<LaneItem>,
    closed: AtomicBool,
}

impl TaskLane {
    pub fn new(name: &'static str) -> Self {
        let (tx, mut rx) = mpsc::channel::<LaneItem>(LANE_DEPTH);
        tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                match item {
                    LaneItem::Task(task) => task.await,
                    LaneItem::Join(done) => {
                        let _ = done.send(());
                    }
                    LaneItem::Shutdown => break,
                }
            }
        });
        Self {
            name,
            tx,
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue a task.  Awaits queue capacity (backpressure), never
    /// reordering.  Tasks submitted after `close()` are dropped.
    pub async fn submit<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        if self.closed.load(Ordering::Relaxed) {
            debug!("{} lane closed, dropping task", self.name);
            return;
        }
        let _ = self.tx.send(LaneItem::Task(Box::pin(task))).await;
    }

    /// Wait until every task submitted before this call has finished.
    pub async fn join(&self) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(LaneItem::Join(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Stop the worker after the queue drains.  Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        let _ = self.tx.send(LaneItem::Shutdown).await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[tokio::test]
    async fn tasks_run_in_submission_order() {
        let lane = TaskLane::new("test");
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..20 {
            let order = Arc::clone(&order);
            lane.submit(async move {
                // Stagger the early tasks so reordering would show up.
                if i < 3 {
                    tokio::time::sleep(Duration::from_millis(10 - 3 * i)).await;
                }
                order.lock().unwrap().push(i);
            })
            .await;
        }
        lane.join().await;

        let seen = order.lock().unwrap().clone();
        assert_eq!(seen, (0..20).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn join_waits_for_inflight_work() {
        let lane = TaskLane::new("test");
        let done = Arc::new(Mutex::new(false));

        let flag = Arc::clone(&done);
        lane.submit(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            *flag.lock().unwrap() = true;
        })
        .await;

        lane.join().await;
        assert!(*done.lock().unwrap(), "join returned before the task ran");
    }

    #[tokio::test]
    async fn join_on_empty_lane_returns_immediately() {
        let lane = TaskLane::new("test");
        tokio::time::timeout(Duration::from_secs(1), lane.join())
            .await
            .expect("join hung on an empty lane");
    }

    #[tokio::test]
    async fn close_is_idempotent_and_drops_later_tasks() {
        let lane = TaskLane::new("test");
        let ran = Arc::new(Mutex::new(false));

        lane.close().await;
        lane.close().await;

        let flag = Arc::clone(&ran);
        lane.submit(async move {
            *flag.lock().unwrap() = true;
        })
        .await;
        lane.join().await;

        assert!(!*ran.lock().unwrap(), "task ran on a closed lane");
    }

    #[tokio::test]
    async fn lanes_are_independent() {
        let fg = TaskLane::new("fg");
        let bg = TaskLane::new("bg");
        let log = Arc::new(Mutex::new(Vec::new()));

        let slow = Arc::clone(&log);
        bg.submit(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            slow.lock().unwrap().push("bg");
        })
        .await;

        let fast = Arc::clone(&log);
        fg.submit(async move {
            fast.lock().unwrap().push("fg");
        })
        .await;

        fg.join().await;
        // The foreground task must not be stuck behind the background one.
        assert_eq!(log.lock().unwrap().first(), Some(&"fg"));
        bg.join().await;
        assert_eq!(log.lock().unwrap().len(), 2);
    }
}
