//! Domain types shared by the announcer and dispatcher roles

mod alive;
mod record;

pub use alive::{AliveSet, Target};
pub use record::{NodeRecord, identity_from_key, validate_endpoint, validate_identity};
