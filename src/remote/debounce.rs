//! Trailing-edge debouncing for slider input.

use std::time::Duration;

use tokio::{sync::mpsc, time};

/// Feeds values into a debouncing task.
#[derive(Debug, Clone)]
pub struct Debouncer<T> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T> Debouncer<T> {
    pub fn push(&self, value: T) {
        // the task only goes away with the runtime
        let _ = self.tx.send(value);
    }
}

/// Emits the last pushed value once `delay` passes with no newer push.
/// A pending value is still emitted when every `Debouncer` is dropped.
pub fn channel<T: Send + 'static>(delay: Duration) -> (Debouncer<T>, mpsc::UnboundedReceiver<T>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<T>();
    let (settled_tx, settled_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some(mut value) = rx.recv().await {
            loop {
                tokio::select! {
                    next = rx.recv() => match next {
                        Some(newer) => value = newer,
                        None => {
                            let _ = settled_tx.send(value);
                            return;
                        }
                    },
                    _ = time::sleep(delay) => {
                        if settled_tx.send(value).is_err() {
                            return;
                        }
                        break;
                    }
                }
            }
        }
    });

    (Debouncer { tx }, settled_rx)
}
