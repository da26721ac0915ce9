//! Short-TTL memoization of per-card package lists and STB numbers (§4.4).

mod cache;
mod error;

pub use cache::{PackageOption, ResourceCache, PACKAGE_TTL, STB_TTL};
pub use error::{ResourceCacheError, ResourceCacheResult};
