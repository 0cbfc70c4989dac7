//! Conversions between x86_64 page table entry flags and [`PageFlags`].

use x86_64::structures::paging::PageTableFlags;

use crate::PageFlags;

impl From<PageTableFlags> for PageFlags {
    fn from(hw: PageTableFlags) -> Self {
        let mut flags = PageFlags::empty();
        flags.set(PageFlags::PRESENT, hw.contains(PageTableFlags::PRESENT));
        flags.set(PageFlags::WRITABLE, hw.contains(PageTableFlags::WRITABLE));
        flags.set(PageFlags::USER, hw.contains(PageTableFlags::USER_ACCESSIBLE));
        flags.set(PageFlags::EXECUTE, !hw.contains(PageTableFlags::NO_EXECUTE));
        flags.set(PageFlags::ACCESSED, hw.contains(PageTableFlags::ACCESSED));
        flags.set(PageFlags::MODIFIED, hw.contains(PageTableFlags::DIRTY));
        flags
    }
}

impl From<PageFlags> for PageTableFlags {
    fn from(flags: PageFlags) -> Self {
        let mut hw = PageTableFlags::empty();
        hw.set(PageTableFlags::PRESENT, flags.contains(PageFlags::PRESENT));
        hw.set(PageTableFlags::WRITABLE, flags.contains(PageFlags::WRITABLE));
        hw.set(PageTableFlags::USER_ACCESSIBLE, flags.contains(PageFlags::USER));
        hw.set(PageTableFlags::NO_EXECUTE, !flags.contains(PageFlags::EXECUTE));
        hw.set(PageTableFlags::ACCESSED, flags.contains(PageFlags::ACCESSED));
        hw.set(PageTableFlags::DIRTY, flags.contains(PageFlags::MODIFIED));
        hw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_bits_follow_the_hardware_names() {
        let hw = PageTableFlags::PRESENT | PageTableFlags::ACCESSED | PageTableFlags::DIRTY;
        let flags = PageFlags::from(hw);
        assert!(flags.contains(PageFlags::PRESENT | PageFlags::HARDWARE_STATUS));
        // No NX bit means executable.
        assert!(flags.contains(PageFlags::EXECUTE));
        assert!(!flags.contains(PageFlags::WRITABLE));
    }

    #[test]
    fn execute_is_the_inverse_of_no_execute() {
        let hw = PageTableFlags::from(PageFlags::PRESENT | PageFlags::USER);
        assert!(hw.contains(PageTableFlags::NO_EXECUTE));
        assert!(hw.contains(PageTableFlags::USER_ACCESSIBLE));

        let flags = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::EXECUTE;
        assert_eq!(PageFlags::from(PageTableFlags::from(flags)), flags);
    }
}
