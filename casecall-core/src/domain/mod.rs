//! Domain model for the claim-and-dispatch pipeline.

pub mod case;
pub mod ids;
pub mod interaction;
pub mod policy;

pub use case::*;
pub use ids::*;
pub use interaction::*;
pub use policy::*;
