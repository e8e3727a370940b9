//! Volume and mute bookkeeping.
//!
//! The level is linear gain in `[0, 1]`. Muting keeps the level and makes
//! the audible gain zero; a level set while muted becomes the level that
//! unmute restores.

/// Volume level plus mute flag.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeControl {
    level: f32,
    muted: bool,
}

impl VolumeControl {
    pub fn new(level: f32) -> Self {
        Self {
            level: clamp_gain(level),
            muted: false,
        }
    }

    /// The recorded level, whether or not it is currently audible.
    pub const fn level(&self) -> f32 {
        self.level
    }

    /// Gain that should reach the output.
    pub const fn gain(&self) -> f32 {
        if self.muted {
            0.0
        } else {
            self.level
        }
    }

    pub const fn is_muted(&self) -> bool {
        self.muted
    }

    /// Set the level. Returns the clamped value that was stored.
    pub fn set_level(&mut self, level: f32) -> f32 {
        self.level = clamp_gain(level);
        self.level
    }

    /// Mute. Returns false if already muted.
    pub fn mute(&mut self) -> bool {
        if self.muted {
            return false;
        }
        self.muted = true;
        true
    }

    /// Unmute. Returns false if not muted.
    pub fn unmute(&mut self) -> bool {
        if !self.muted {
            return false;
        }
        self.muted = false;
        true
    }

    /// Flip the mute flag and return the new flag.
    pub fn toggle_mute(&mut self) -> bool {
        if self.muted {
            self.unmute();
        } else {
            self.mute();
        }
        self.muted
    }
}

impl Default for VolumeControl {
    fn default() -> Self {
        Self::new(1.0)
    }
}

/// Clamp a gain to `[0, 1]`; NaN becomes silence.
pub fn clamp_gain(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
