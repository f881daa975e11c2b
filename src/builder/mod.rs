//! L1 and L2 event builders.
//!
//! The builders are the state-machine drivers sitting between fragment
//! dispatch and the storage sink. Each invocation runs entirely on the
//! thread that delivered the fragment; whichever fragment completes an
//! expected set triggers the corresponding stage synchronously under the
//! slot lock.

pub mod l1;
pub mod l2;
pub mod trigger;

pub use l1::L1Builder;
pub use l2::L2Builder;
pub use trigger::{
    FixedL1, FixedL2, L1Trigger, L2Trigger, L1_REJECT, L1_REQUEST_NON_ZS, L2_REJECT,
};
