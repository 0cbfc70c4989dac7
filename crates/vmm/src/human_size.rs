//! Human-readable size formatting for log output.

use core::fmt;

use crate::PAGE_SIZE;

/// Wraps a size in bytes and formats it with binary prefixes (KiB, MiB, ...).
///
/// Values below 1KiB print as plain bytes. Larger values print with at most one decimal
/// digit, truncated rather than rounded, and the decimal is omitted when it is zero.
///
/// # Examples
///
/// ```
/// use vmm::HumanSize;
///
/// assert_eq!(format!("{}", HumanSize(512)), "512B");
/// assert_eq!(format!("{}", HumanSize(1536)), "1.5KiB");
/// assert_eq!(format!("{}", HumanSize::from_pages(256)), "1MiB");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct HumanSize(pub usize);

impl HumanSize {
    /// Creates a size from a page count.
    #[inline]
    pub const fn from_pages(pages: usize) -> Self {
        Self(pages.saturating_mul(PAGE_SIZE))
    }

    /// Returns the raw byte count.
    #[inline]
    pub const fn bytes(self) -> usize {
        self.0
    }
}

impl From<usize> for HumanSize {
    #[inline]
    fn from(value: usize) -> Self {
        Self(value)
    }
}

impl fmt::Display for HumanSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];

        let mut unit = 0;
        let mut scale: u128 = 1;
        let bytes = self.0 as u128;
        while unit + 1 < UNITS.len() && bytes >= scale * 1024 {
            scale *= 1024;
            unit += 1;
        }

        let whole = bytes / scale;
        let tenths = (bytes % scale) * 10 / scale;
        if tenths == 0 {
            write!(f, "{}{}", whole, UNITS[unit])
        } else {
            write!(f, "{}.{}{}", whole, tenths, UNITS[unit])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_bytes() {
        assert_eq!(format!("{}", HumanSize(0)), "0B");
        assert_eq!(format!("{}", HumanSize(1023)), "1023B");
    }

    #[test]
    fn formats_binary_units() {
        assert_eq!(format!("{}", HumanSize(1024)), "1KiB");
        assert_eq!(format!("{}", HumanSize(1536)), "1.5KiB");
        assert_eq!(format!("{}", HumanSize(16 * 1024 * 1024)), "16MiB");
        assert_eq!(format!("{}", HumanSize(3 * 1024 * 1024 * 1024 / 2)), "1.5GiB");
    }

    #[test]
    fn truncates_to_one_decimal() {
        // 1.99 KiB
        assert_eq!(format!("{}", HumanSize(2038)), "1.9KiB");
    }

    #[test]
    fn from_pages_uses_page_size() {
        assert_eq!(HumanSize::from_pages(2).bytes(), 2 * PAGE_SIZE);
        assert_eq!(format!("{}", HumanSize::from_pages(1)), "4KiB");
    }
}
