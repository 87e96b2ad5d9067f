pub mod clock;
pub mod error;
pub mod ids;
pub mod state;
pub mod value;

pub use clock::{Clock, ManualClock, Millis, SystemClock};
pub use error::CoreError;
pub use ids::*;
pub use state::{
    ConflictInfo, ConflictKind, ResolutionStrategy, UpdateContext, UserChoice, VersionedState,
};
pub use value::StateValue;
