use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::config::millis;
use crate::error::{CallError, Result};

/// When a bundle is flushed, and how many may be outstanding at once.
///
/// A bundle flushes when its delay threshold elapses, or as soon as its
/// element or byte count reaches the corresponding threshold, whichever comes
/// first. `blocking_call_count_threshold` bounds the number of bundles that
/// may be open or in flight at the same time; a caller that would need to open
/// another one waits until an earlier bundle completes. `None` or `0` means
/// unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundlingSettings {
    #[serde(rename = "delay_threshold_millis", with = "millis")]
    pub delay_threshold: Duration,

    #[serde(default)]
    pub element_count_threshold: Option<u64>,

    #[serde(default)]
    pub byte_threshold: Option<u64>,

    #[serde(default)]
    pub blocking_call_count_threshold: Option<u64>,
}

impl Default for BundlingSettings {
    fn default() -> Self {
        Self {
            delay_threshold: Duration::from_millis(10),
            element_count_threshold: None,
            byte_threshold: None,
            blocking_call_count_threshold: None,
        }
    }
}

impl BundlingSettings {
    pub fn builder() -> BundlingSettingsBuilder {
        BundlingSettingsBuilder::default()
    }

    /// Maximum number of concurrently unflushed bundles, if bounded.
    pub fn max_outstanding_bundles(&self) -> Option<usize> {
        match self.blocking_call_count_threshold {
            None | Some(0) => None,
            Some(n) => Some(
                usize::try_from(n)
                    .unwrap_or(usize::MAX)
                    .min(Semaphore::MAX_PERMITS),
            ),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.element_count_threshold == Some(0) {
            return Err(CallError::Config(
                "element count threshold must be positive".into(),
            ));
        }
        if self.byte_threshold == Some(0) {
            return Err(CallError::Config("byte threshold must be positive".into()));
        }
        if self
            .blocking_call_count_threshold
            .is_some_and(|n| n > Semaphore::MAX_PERMITS as u64)
        {
            return Err(CallError::Config(format!(
                "blocking call count threshold may not exceed {}",
                Semaphore::MAX_PERMITS
            )));
        }
        if self.delay_threshold.is_zero()
            && self.element_count_threshold.is_none()
            && self.byte_threshold.is_none()
        {
            return Err(CallError::Config(
                "bundling needs a delay, element count or byte threshold".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct BundlingSettingsBuilder {
    settings: BundlingSettings,
}

impl BundlingSettingsBuilder {
    pub fn delay_threshold(mut self, delay: Duration) -> Self {
        self.settings.delay_threshold = delay;
        self
    }

    pub fn element_count_threshold(mut self, count: u64) -> Self {
        self.settings.element_count_threshold = Some(count);
        self
    }

    pub fn byte_threshold(mut self, bytes: u64) -> Self {
        self.settings.byte_threshold = Some(bytes);
        self
    }

    pub fn blocking_call_count_threshold(mut self, count: u64) -> Self {
        self.settings.blocking_call_count_threshold = Some(count);
        self
    }

    pub fn build(self) -> Result<BundlingSettings> {
        self.settings.validate()?;
        Ok(self.settings)
    }
}
