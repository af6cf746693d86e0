//! Module resolution.
//!
//! Two layers: [`version::VersionResolver`] picks the single best
//! version of one module URI against a set of criteria, and
//! [`graph::GraphResolver`] walks the transitive module graph, feeding
//! the version resolver with the monotonically tightening union of
//! every criterion seen for each module.

pub mod graph;
pub mod version;

pub use graph::GraphResolver;
pub use version::{Criterion, Version, VersionResolver, VirtualSource};
