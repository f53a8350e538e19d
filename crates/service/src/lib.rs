//! Business logic layer for checkout and address management.
//!
//! - [`OrderService`] places orders atomically and reads a user's order history.
//! - [`AddressService`] serves the address-management surface and keeps the
//!   "at most one primary address per user" invariant.
//!
//! Both services are generic over the store traits from the `repository`
//! crate, so the same code runs against PostgreSQL and the in-memory store.
//! Every write goes through one store transaction that is either committed
//! as a whole or rolled back.

use model::UserId;
use repository::{RepositoryError, StoreTransaction};
use thiserror::Error;
use tracing::{error, warn};

mod addresses;
mod orders;

pub use addresses::{AddressService, AddressServiceImpl, validate_address};
pub use orders::{OrderService, OrderServiceImpl};

/// The error type for all operations in [`OrderService`] and [`AddressService`].
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Missing identity, missing address reference, empty cart or missing fields.
    /// Rejected before touching the store.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    /// The address does not exist or belongs to someone else.
    #[error("Address not found for this user")]
    AddressNotFound,
    /// A store operation failed; nothing from the attempt was persisted.
    #[error("Persistence failure: {0}")]
    Persistence(#[from] RepositoryError),
    /// More than one primary address was observed for a user. A data bug.
    #[error("User {user_id} has {primaries} primary addresses")]
    PrimaryInvariantViolation { user_id: UserId, primaries: usize },
}

fn require_user(user_id: &UserId) -> Result<(), ServiceError> {
    if user_id.is_blank() {
        return Err(ServiceError::InvalidRequest("Missing userID".into()));
    }
    Ok(())
}

/// Commits `tx` if `outcome` succeeded, rolls it back otherwise.
///
/// A failed rollback is logged and never replaces the original error.
async fn settle<T, Tx>(tx: Tx, outcome: Result<T, ServiceError>) -> Result<T, ServiceError>
where
    Tx: StoreTransaction,
{
    match outcome {
        Ok(value) => match tx.commit().await {
            Ok(()) => Ok(value),
            Err(err) => {
                error!(error = %err, "commit failed");
                Err(err.into())
            }
        },
        Err(err) => {
            if let ServiceError::Persistence(cause) = &err {
                error!(error = %cause, "store operation failed, rolling back");
            }
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "rollback failed");
            }
            Err(err)
        }
    }
}

/// Logs and wraps a store error raised outside of a transaction.
fn store_failure(err: RepositoryError) -> ServiceError {
    error!(error = %err, "store operation failed");
    ServiceError::Persistence(err)
}
