//! In-process adapters for tests and local experimentation.

pub mod clock;
pub mod git;
pub mod id_gen;

pub use clock::FixedClock;
pub use git::MemoryGit;
pub use id_gen::SequentialIds;
