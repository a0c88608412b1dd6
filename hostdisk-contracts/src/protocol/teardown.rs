// SPDX-License-Identifier: GPL-3.0-only

use tracing::warn;

use super::error::{DiskError, DiskErrorKind};

/// Collects failures of teardown steps that must all run regardless
#[derive(Debug, Default)]
pub struct TeardownErrors {
    failures: Vec<(String, DiskError)>,
}

impl TeardownErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of one step, logging a failure
    pub fn check<T>(&mut self, step: impl Into<String>, result: Result<T, DiskError>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(error) => {
                let step = step.into();
                warn!(step = %step, "teardown step failed: {error}");
                self.failures.push((step, error));
                None
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn into_result(self) -> Result<(), DiskError> {
        if self.failures.is_empty() {
            return Ok(());
        }

        let summary = self
            .failures
            .iter()
            .map(|(step, error)| format!("{step}: {}", error.message))
            .collect::<Vec<_>>()
            .join("; ");
        Err(DiskError::new(
            DiskErrorKind::Teardown,
            format!("{} teardown step(s) failed: {summary}", self.failures.len()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_step_is_recorded_and_summarized() {
        let mut errors = TeardownErrors::new();
        errors.check("umount /dev/nbd0p1", Err::<(), _>(DiskError::timeout("busy")));
        errors.check("deactivate vg", Ok::<(), DiskError>(()));
        errors.check("qemu-nbd -d", Err::<(), _>(DiskError::command_failed("qemu-nbd", "x")));

        assert_eq!(errors.len(), 2);
        let error = errors.into_result().unwrap_err();
        assert_eq!(error.kind, DiskErrorKind::Teardown);
        assert!(error.message.starts_with("2 teardown step(s) failed"));
        assert!(error.message.contains("umount /dev/nbd0p1: busy"));
    }

    #[test]
    fn no_failures_is_ok() {
        assert!(TeardownErrors::new().into_result().is_ok());
    }
}
