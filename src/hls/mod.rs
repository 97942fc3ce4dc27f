pub mod resolver;

pub use resolver::{resolve, resolve_to_segments, ResolvedManifest};
