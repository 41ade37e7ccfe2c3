//! Sabha registry core.
//!
//! This crate enforces membership-registry and event-participation rules with
//! an auditable change-request ledger, snapshot-based revert, atomic
//! capacity reservation, deterministic chest numbering, fee accrual, and
//! time-windowed appeals.

#![deny(unsafe_code)]

pub mod appeal;
pub mod capacity;
pub mod chest;
pub mod engine;
pub mod error;
pub mod fees;
pub mod memory;
pub mod postgres;
pub mod request;
pub mod snapshot;
pub mod store;
pub mod types;

pub use appeal::{Appeal, AppealEligibility, AppealStatus, AppealWindow};
pub use capacity::{
    CapacityDemand, CapacityPolicy, CapacityPool, PoolScope, SequenceScope,
};
pub use chest::{event_code, format_chest_number, next_chest_number};
pub use engine::{ChangeProposal, RegistryEngine};
pub use error::SabhaError;
pub use fees::{FeeSchedule, Payment, PaymentPurpose, PaymentStatus};
pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use request::{
    ChangeRequest, EntityKind, RequestKind, RequestStatus, TargetRef,
};
pub use snapshot::{FieldDiff, FieldSnapshot};
pub use store::{RegistryStore, StoreConfig};
pub use types::{Actor, ActorRole, EventConfig, EventKind, Participation};
