use serde::{Deserialize, Serialize};

use crate::{ProfilerError, Result};

/// Hard upper bound on the number of frames captured per trace.
pub const MAX_FRAMES_CAP: usize = 128;

/// Start-time configuration of a [`Profiler`](crate::Profiler).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfilerConfig {
    /// Maximum number of frames stored per allocation trace, `0..=128`.
    pub max_frames: usize,
    /// Mean number of bytes between two samples. `0` records every allocation.
    pub sample_rate: u64,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            max_frames: MAX_FRAMES_CAP,
            sample_rate: 0,
        }
    }
}

impl ProfilerConfig {
    #[must_use]
    pub fn with_max_frames(mut self, max_frames: usize) -> Self {
        self.max_frames = max_frames;
        self
    }

    #[must_use]
    pub fn with_sample_rate(mut self, sample_rate: u64) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    /// Check the configuration against the supported ranges.
    pub fn validate(&self) -> Result<()> {
        if self.max_frames > MAX_FRAMES_CAP {
            return Err(ProfilerError::InvalidMaxFrames(self.max_frames));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_captures_full_depth_and_every_allocation() {
        let config = ProfilerConfig::default();

        assert_eq!(config.max_frames, MAX_FRAMES_CAP);
        assert_eq!(config.sample_rate, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_frames_above_cap() {
        let config = ProfilerConfig::default().with_max_frames(MAX_FRAMES_CAP + 1);

        assert_eq!(
            config.validate(),
            Err(ProfilerError::InvalidMaxFrames(MAX_FRAMES_CAP + 1))
        );

        assert!(ProfilerConfig::default().with_max_frames(0).validate().is_ok());
    }
}
