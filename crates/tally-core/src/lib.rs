//! Domain types shared by the tally crates.
//!
//! Nothing in here touches storage: the platform classifier, account kinds,
//! snapshot shapes and the day-granularity time helpers are all pure.

pub mod accounts;
pub mod platform;
pub mod stats;
pub mod time;

pub use accounts::{AccountKind, RegistrationType};
pub use platform::{classify, ClassifierVariant, PlatformTag};
pub use stats::{EngineInfo, UsageSnapshot, ALL_BUCKET};
