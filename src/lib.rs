pub mod common;
pub mod config;
pub mod diagnostics;
pub mod dma;
pub mod graph;
pub mod layout;
pub mod memorylimits;
pub mod ops;
pub mod pprint;
pub mod region;
pub mod rewrite;
pub mod search;
pub mod sparse;
pub mod tensorspec;
pub mod tiling;
pub mod utils;
#[cfg(feature = "verification")]
pub mod verification;

// Exported for the `shape!` macro.
// TODO: Wrap the Shape type instead.
pub use smallvec;
