//! Account records and the lockout state kept on them.

pub mod lockout;
pub mod model;
pub mod store;

pub use lockout::{
    AccountLockStatus, FailureOutcome, LockStatus, LockoutPolicy, LockoutTracker,
    DEFAULT_LOCKOUT_SECS, DEFAULT_THRESHOLD,
};
pub use model::{Account, AccountSummary, LockoutState, NewAccount};
pub use store::{AccountStore, JsonFileAccountStore, MemoryAccountStore, StoreError};
