pub mod pool;
pub mod source;

pub use pool::{PenaltyReason, ProxyPool, RefreshOutcome};
pub use source::{identity_source_from_config, FileIdentities, IdentitySource, StaticIdentities};
