//! The two kernel-cache timeouts named in spec section 6: how long the
//! kernel may cache directory entries and inode attributes before asking
//! again. Both default to zero, meaning "don't cache" -- the safest
//! default for a filesystem the kernel can't observe changing underneath
//! it via any channel but its own requests.

use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct Options {
    pub entry_timeout: Duration,
    pub attr_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            entry_timeout: Duration::ZERO,
            attr_timeout: Duration::ZERO,
        }
    }
}
