//! Live adapters for real external interactions.

pub mod clock;
pub mod git;
pub mod id_gen;
pub mod upstream;

pub use clock::LiveClock;
pub use git::LiveGit;
pub use id_gen::LiveIdGenerator;
pub use upstream::{LiveUpstream, UpstreamOptions};
