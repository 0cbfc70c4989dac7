//! x86_64 architecture-specific implementation.
//!
//! Page tables themselves belong to the translation-map provider; this module only maps the
//! hardware entry bits onto the architecture-neutral flags used by the scanner.

mod flags;
