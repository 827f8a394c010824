//! Port traits defining external boundaries.
//!
//! Each trait represents a boundary between the proxy core and an external
//! system (time, session ids, upstream HTTP, git). Implementations live in
//! `src/adapters/`.

pub mod clock;
pub mod git;
pub mod id_gen;
pub mod upstream;

pub use clock::Clock;
pub use git::{GitError, GitPorcelain, RemoteTag};
pub use id_gen::IdGenerator;
pub use upstream::{UpstreamClient, UpstreamError, UpstreamFuture};
