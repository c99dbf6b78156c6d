//! Progress stores that keep keel's bookkeeping on the entity itself.
//!
//! Everything a store writes goes into the cycle's [`keel_core::Patch`], so
//! progress and the handlers' own status updates land in one write. Nothing
//! is written when the stored data already matches.
//!
//! | Store | Handler states | Last handled essence |
//! |---|---|---|
//! | [`AnnotationsProgressStore`] | `<prefix>/<handler-id>` | `<prefix>/last-handled-configuration` |
//! | [`StatusProgressStore`] | `status.<field>.<handler-id>` | `status.<field>.last-handled-configuration` |
//! | [`SmartProgressStore`] | both, annotations win | both |

mod annotations;
mod codec;
mod smart;
mod status;

pub use annotations::{AnnotationsProgressStore, DELETION_HANDLED, LAST_HANDLED_CONFIGURATION};
pub use codec::PersistedState;
pub use smart::SmartProgressStore;
pub use status::StatusProgressStore;
