// ============================================================================
// User Domain - identity and email of a registered user
// ============================================================================

pub mod aggregate;
pub mod events;
pub mod value_objects;

pub use aggregate::*;
pub use events::*;
pub use value_objects::*;
