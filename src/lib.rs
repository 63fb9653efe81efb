/// regilo — container init and process supervisor core library.
///
/// Provides configuration loading, the one-shot startup executor, the
/// service/periodic supervision engine, and the Unix plumbing they share.
/// The binary in `main.rs` wires these together behind a small CLI.
pub mod child;
pub mod config;
pub mod envfile;
pub mod identity;
pub mod output;
pub mod periodic;
pub mod signals;
pub mod startup;
pub mod supervisor;
pub mod template;
pub mod tree;
