//! Deployment profiles and memory layout
//!
//! Resource caps differ between the desktop executive and the embedded
//! build; everything else consults these numbers instead of hardcoding.

/// Resource caps for one deployment profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Profile {
    /// Maximum live tasks.
    pub max_tasks: usize,
    /// Mailbox descriptor pool size.
    pub max_mailboxes: usize,
    /// Mailbox handles per task.
    pub max_handles_per_task: usize,
    /// Value registry capacity.
    pub max_values: usize,
    /// Command registry capacity.
    pub max_commands: usize,
    /// Registry string pool bytes.
    pub max_registry_strings: usize,
    /// Breakpoints per task.
    pub max_breakpoints: usize,
    /// Watches per task.
    pub max_watches: usize,
}

impl Profile {
    pub const fn desktop() -> Self {
        Self {
            max_tasks: 32,
            max_mailboxes: 256,
            max_handles_per_task: 64,
            max_values: 256,
            max_commands: 128,
            max_registry_strings: 16 * 1024,
            max_breakpoints: 100,
            max_watches: 50,
        }
    }

    pub const fn embedded() -> Self {
        Self {
            max_tasks: 4,
            max_mailboxes: 16,
            max_handles_per_task: 8,
            max_values: 64,
            max_commands: 16,
            max_registry_strings: 2 * 1024,
            max_breakpoints: 100,
            max_watches: 50,
        }
    }

    /// Parse a profile name as used by `HSXD_PROFILE`.
    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "desktop" => Some(Self::desktop()),
            "embedded" => Some(Self::embedded()),
            _ => None,
        }
    }
}

impl Default for Profile {
    fn default() -> Self {
        Self::desktop()
    }
}

/// Layout of one task's memory window inside the VM arena.
///
/// Guest addresses are window-relative: code at 0, rodata at `rodata_base`,
/// bss above rodata, heap above bss, stack descending from just below the
/// register file, and the 16-word register file in the top 64 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLayout {
    /// Bytes per task window.
    pub window_len: u32,
    /// Guest address of the rodata base.
    pub rodata_base: u32,
}

/// Bytes occupied by the register file at the top of a window.
pub const REG_FILE_BYTES: u32 = 64;

impl MemoryLayout {
    /// Offset of the register file within a window.
    pub fn reg_file_off(&self) -> u32 {
        self.window_len - REG_FILE_BYTES
    }

    /// Initial stack pointer (stack grows down from below the register file).
    pub fn stack_top(&self) -> u32 {
        self.window_len - REG_FILE_BYTES
    }
}

impl Default for MemoryLayout {
    fn default() -> Self {
        Self {
            window_len: 64 * 1024,
            rodata_base: 0x4000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_caps() {
        let d = Profile::desktop();
        let e = Profile::embedded();
        assert!(d.max_mailboxes > e.max_mailboxes);
        assert_eq!(e.max_mailboxes, 16);
        assert_eq!(e.max_handles_per_task, 8);
        assert_eq!(Profile::by_name("embedded"), Some(e));
        assert_eq!(Profile::by_name("bogus"), None);
    }

    #[test]
    fn test_layout_offsets() {
        let l = MemoryLayout::default();
        assert_eq!(l.reg_file_off(), 64 * 1024 - 64);
        assert_eq!(l.stack_top(), l.reg_file_off());
    }
}
