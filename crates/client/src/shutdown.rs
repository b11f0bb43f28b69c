use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::mpsc;

/// Counts Ctrl-C presses for the lifetime of the process.
#[derive(Debug, Default)]
pub struct InterruptCounter {
    presses: AtomicU8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// First press: ask the backend job to stop and wait for it.
    StopJob,
    /// Second press: leave right away; the job stays recoverable.
    Exit,
}

impl InterruptCounter {
    pub fn press(&self) -> Interrupt {
        let n = self.presses.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        if n == 1 {
            Interrupt::StopJob
        } else {
            Interrupt::Exit
        }
    }
}

pub fn spawn_ctrl_c_handler(counter: Arc<InterruptCounter>, tx: mpsc::UnboundedSender<Interrupt>) {
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            let interrupt = counter.press();
            if tx.send(interrupt).is_err() || interrupt == Interrupt::Exit {
                return;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_press_exits() {
        let counter = InterruptCounter::default();
        assert_eq!(counter.press(), Interrupt::StopJob);
        assert_eq!(counter.press(), Interrupt::Exit);
        assert_eq!(counter.press(), Interrupt::Exit);
    }
}
