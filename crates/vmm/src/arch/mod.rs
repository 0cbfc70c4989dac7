//! Architecture-specific glue.
//!
//! The x86_64 module translates between the hardware page-table flags and [`PageFlags`].
//! The software module emulates every collaborator the core consumes so the crate can run on
//! any host.
//!
//! [`PageFlags`]: crate::PageFlags

// Included on every x86_64 build, tests too, so the conversions stay checked.
#[cfg(target_arch = "x86_64")]
mod x86_64;

// Host emulation, for tests and hosted builds.
#[cfg(any(test, feature = "software-emulation"))]
pub mod software;
