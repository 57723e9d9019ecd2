use std::future::Future;

use async_trait::async_trait;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    Waiting,
    Running,
    Completed,
    Failed,
    /// Succeeded in an earlier round; carried through retry rounds so the
    /// totals stay stable.
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    Percent(u8),
    Tag(String),
}

#[derive(Debug, Clone)]
pub struct WorkItem {
    pub name: String,
    pub status: ItemStatus,
    pub progress: Option<Progress>,
    pub slot: Option<usize>,
}

/// Observer for a batch run; renders status and decides on retry rounds.
#[async_trait]
pub trait WorkerEvents: Send + Sync {
    fn on_update(&self, items: &[WorkItem]);
    async fn confirm_retry(&self, failed: &[String]) -> bool;
}

/// Lets an in-flight item publish progress back to the dispatcher.
#[derive(Clone)]
pub struct ProgressHandle {
    tx: mpsc::UnboundedSender<(usize, Progress)>,
}

impl ProgressHandle {
    pub fn report(&self, index: usize, progress: Progress) {
        let _ = self.tx.send((index, progress));
    }
}

/// Drive `names` through `execute` with at most `concurrency` in flight.
/// When a round drains with failures left, the observer may grant another
/// round; failed items reset to waiting while successes are kept out of the
/// next dispatch. Returns the final item table.
pub async fn run_items<F, Fut>(
    names: &[String],
    concurrency: usize,
    execute: F,
    events: &dyn WorkerEvents,
) -> Vec<WorkItem>
where
    F: Fn(usize, ProgressHandle) -> Fut,
    Fut: Future<Output = bool> + Send + 'static,
{
    let mut items: Vec<WorkItem> = names
        .iter()
        .map(|name| WorkItem {
            name: name.clone(),
            status: ItemStatus::Waiting,
            progress: None,
            slot: None,
        })
        .collect();
    if items.is_empty() {
        return items;
    }

    let concurrency = concurrency.max(1);
    let mut slots: Vec<Option<usize>> = vec![None; concurrency];
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(usize, bool)>();
    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<(usize, Progress)>();

    loop {
        // Fill free slots with waiting items, in order.
        let mut dispatched = false;
        for slot in 0..slots.len() {
            if slots[slot].is_some() {
                continue;
            }
            let Some(index) = items
                .iter()
                .position(|item| item.status == ItemStatus::Waiting)
            else {
                break;
            };
            items[index].status = ItemStatus::Running;
            items[index].slot = Some(slot);
            slots[slot] = Some(index);
            let fut = execute(
                index,
                ProgressHandle {
                    tx: progress_tx.clone(),
                },
            );
            let done = done_tx.clone();
            tokio::spawn(async move {
                let ok = fut.await;
                let _ = done.send((index, ok));
            });
            dispatched = true;
        }
        if dispatched {
            events.on_update(&items);
        }

        if slots.iter().all(Option::is_none) {
            let failed: Vec<String> = items
                .iter()
                .filter(|item| item.status == ItemStatus::Failed)
                .map(|item| item.name.clone())
                .collect();
            if failed.is_empty() || !events.confirm_retry(&failed).await {
                break;
            }
            for item in &mut items {
                match item.status {
                    ItemStatus::Failed => {
                        item.status = ItemStatus::Waiting;
                        item.progress = None;
                    }
                    ItemStatus::Completed | ItemStatus::Ignored => {
                        item.status = ItemStatus::Ignored;
                    }
                    _ => {}
                }
            }
            continue;
        }

        tokio::select! {
            Some((index, ok)) = done_rx.recv() => {
                if let Some(slot) = items[index].slot.take() {
                    slots[slot] = None;
                }
                items[index].status = if ok {
                    ItemStatus::Completed
                } else {
                    ItemStatus::Failed
                };
                events.on_update(&items);
            }
            Some((index, progress)) = progress_rx.recv() => {
                if items[index].status == ItemStatus::Running {
                    items[index].progress = Some(progress);
                    events.on_update(&items);
                }
            }
        }
    }
    items
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    struct Silent {
        retry_once: AtomicBool,
    }

    #[async_trait]
    impl WorkerEvents for Silent {
        fn on_update(&self, _items: &[WorkItem]) {}

        async fn confirm_retry(&self, _failed: &[String]) -> bool {
            self.retry_once.swap(false, Ordering::SeqCst)
        }
    }

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("item-{i}")).collect()
    }

    #[tokio::test]
    async fn concurrency_stays_bounded() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let events = Silent {
            retry_once: AtomicBool::new(false),
        };
        let items = run_items(
            &names(9),
            3,
            |_, _| {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    true
                }
            },
            &events,
        )
        .await;

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(items.iter().all(|i| i.status == ItemStatus::Completed));
    }

    #[tokio::test]
    async fn retry_round_reruns_only_failures() {
        let runs = Arc::new(AtomicUsize::new(0));
        let events = Silent {
            retry_once: AtomicBool::new(true),
        };
        let items = run_items(
            &names(3),
            2,
            |index, _| {
                let runs = Arc::clone(&runs);
                async move {
                    let attempt = runs.fetch_add(1, Ordering::SeqCst);
                    // item-1 fails its first run only
                    !(index == 1 && attempt < 3)
                }
            },
            &events,
        )
        .await;

        assert_eq!(items[1].status, ItemStatus::Completed);
        assert_eq!(items[0].status, ItemStatus::Ignored);
        assert_eq!(items[2].status, ItemStatus::Ignored);
        assert_eq!(runs.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn declined_retry_leaves_failures() {
        let events = Silent {
            retry_once: AtomicBool::new(false),
        };
        let items = run_items(&names(2), 2, |index, _| async move { index == 0 }, &events).await;

        assert_eq!(items[0].status, ItemStatus::Completed);
        assert_eq!(items[1].status, ItemStatus::Failed);
    }
}
