mod recommendation;
mod store;
mod unlock_state;

pub use recommendation::{NewRecommendation, Recommendation, Scope, ValidationStatus};
pub use store::RecordStore;
pub use unlock_state::UnlockState;

#[cfg(test)]
pub(crate) use store::test_support;
