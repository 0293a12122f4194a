//! Cleanup registry
//!
//! Teardown steps registered once per process and run for a judge when it
//! is discarded, whichever node discards it.

use std::sync::{PoisonError, RwLock};

use anyhow::Result;
use tracing::{info, warn};

use crate::core::JudgeId;

pub type CleanupStep = Box<dyn Fn(&JudgeId) -> Result<()> + Send + Sync>;

#[derive(Default)]
pub struct Janitor {
    steps: RwLock<Vec<CleanupStep>>,
}

impl Janitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, step: impl Fn(&JudgeId) -> Result<()> + Send + Sync + 'static) {
        self.steps
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(step));
    }

    /// Run every step for `owner`. All steps run even if some fail.
    pub fn clean_up(&self, owner: &JudgeId) -> Result<()> {
        let steps = self.steps.read().unwrap_or_else(PoisonError::into_inner);
        let mut failed = 0;

        for step in steps.iter() {
            if let Err(e) = step(owner) {
                warn!("Cleanup step failed for judge {}: {:#}", owner, e);
                failed += 1;
            }
        }

        if failed > 0 {
            anyhow::bail!("{} of {} cleanup steps failed for judge {}", failed, steps.len(), owner);
        }
        info!("Cleaned up judge {}", owner);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_all_steps_run_even_after_failure() {
        let janitor = Janitor::new();
        let calls = Arc::new(AtomicUsize::new(0));

        janitor.register(|_| anyhow::bail!("disk on fire"));
        let counter = calls.clone();
        janitor.register(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let err = janitor.clean_up(&JudgeId::new()).unwrap_err();
        assert!(err.to_string().contains("1 of 2"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_steps_receive_the_judge_id() {
        let janitor = Janitor::new();
        let judge = JudgeId::new();
        janitor.register(move |owner| {
            anyhow::ensure!(*owner == judge, "wrong judge");
            Ok(())
        });

        tokio_test::assert_ok!(janitor.clean_up(&judge));
        tokio_test::assert_err!(janitor.clean_up(&JudgeId::new()));
    }
}
