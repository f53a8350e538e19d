//! Address validation and the primary-address invariant.
//!
//! A user has at most one primary address. Every change to the primary flag
//! clears the old primary and sets the new one inside a single transaction,
//! after serializing on the user's address set, so no reader ever sees zero
//! or two primaries mid-change.

use async_trait::async_trait;
use model::{Address, AddressId, NewAddress, UserId};
use repository::{AddressesRepository, StoreTransaction, TransactionalStore};
use tracing::{error, info, instrument};

use crate::{ServiceError, require_user, settle, store_failure};

/// Confirms that `address_id` exists and belongs to `user_id`.
///
/// Runs inside the caller's transaction and share-locks the address row, so
/// the check holds until that transaction ends.
///
/// # Errors
/// [`ServiceError::AddressNotFound`] if there is no such address for the user.
pub async fn validate_address<T>(
    tx: &mut T,
    user_id: &UserId,
    address_id: AddressId,
) -> Result<Address, ServiceError>
where
    T: StoreTransaction,
{
    tx.find_address(user_id, address_id)
        .await?
        .ok_or(ServiceError::AddressNotFound)
}

/// Address-management operations.
#[async_trait]
pub trait AddressService: Send + Sync {
    /// Addresses of a user, primary first, then newest first.
    async fn list_addresses(&self, user_id: &UserId) -> Result<Vec<Address>, ServiceError>;

    /// Creates an address. When it is marked primary, any previous primary of
    /// the user is cleared in the same transaction.
    async fn create_address(
        &self,
        user_id: &UserId,
        address: NewAddress,
    ) -> Result<Address, ServiceError>;

    /// Makes an existing address the user's only primary address.
    async fn set_primary(&self, user_id: &UserId, address_id: AddressId)
    -> Result<(), ServiceError>;

    /// The address checkout preselects: the primary one, else the newest, else none.
    async fn default_address(&self, user_id: &UserId) -> Result<Option<Address>, ServiceError>;
}

/// [`AddressService`] over a read repository and a transactional store.
pub struct AddressServiceImpl<A, S> {
    addresses_repo: A,
    store: S,
}

impl<A, S> AddressServiceImpl<A, S>
where
    A: AddressesRepository,
    S: TransactionalStore,
{
    pub fn new(addresses_repo: A, store: S) -> Self {
        Self {
            addresses_repo,
            store,
        }
    }

    async fn insert_address(
        tx: &mut S::Tx,
        user_id: &UserId,
        address: &NewAddress,
    ) -> Result<Address, ServiceError> {
        if address.is_primary {
            tx.lock_user_addresses(user_id).await?;
            tx.clear_primary(user_id).await?;
        }
        Ok(tx.insert_address(user_id, address).await?)
    }

    async fn promote(
        tx: &mut S::Tx,
        user_id: &UserId,
        address_id: AddressId,
    ) -> Result<(), ServiceError> {
        tx.lock_user_addresses(user_id).await?;
        validate_address(&mut *tx, user_id, address_id).await?;
        tx.clear_primary(user_id).await?;
        if !tx.mark_primary(user_id, address_id).await? {
            return Err(ServiceError::AddressNotFound);
        }
        Ok(())
    }
}

#[async_trait]
impl<A, S> AddressService for AddressServiceImpl<A, S>
where
    A: AddressesRepository,
    S: TransactionalStore,
{
    #[instrument(skip(self))]
    async fn list_addresses(&self, user_id: &UserId) -> Result<Vec<Address>, ServiceError> {
        require_user(user_id)?;
        self.addresses_repo
            .list_by_user(user_id)
            .await
            .map_err(store_failure)
    }

    #[instrument(skip(self, address), fields(is_primary = address.is_primary))]
    async fn create_address(
        &self,
        user_id: &UserId,
        address: NewAddress,
    ) -> Result<Address, ServiceError> {
        require_user(user_id)?;
        let missing = address.missing_fields();
        if !missing.is_empty() {
            return Err(ServiceError::InvalidRequest(format!(
                "Missing required fields: {}",
                missing.join(", ")
            )));
        }

        let mut tx = self.store.begin().await.map_err(store_failure)?;
        let outcome = Self::insert_address(&mut tx, user_id, &address).await;
        let created = settle(tx, outcome).await?;

        info!(address_id = %created.address_id, "address created");
        Ok(created)
    }

    #[instrument(skip(self))]
    async fn set_primary(
        &self,
        user_id: &UserId,
        address_id: AddressId,
    ) -> Result<(), ServiceError> {
        require_user(user_id)?;
        if address_id.0 <= 0 {
            return Err(ServiceError::InvalidRequest("Missing addressID".into()));
        }

        let mut tx = self.store.begin().await.map_err(store_failure)?;
        let outcome = Self::promote(&mut tx, user_id, address_id).await;
        settle(tx, outcome).await?;

        info!("primary address changed");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn default_address(&self, user_id: &UserId) -> Result<Option<Address>, ServiceError> {
        let addresses = self.list_addresses(user_id).await?;

        let primaries = addresses.iter().filter(|a| a.is_primary).count();
        if primaries > 1 {
            error!(primaries, "more than one primary address stored for user");
            return Err(ServiceError::PrimaryInvariantViolation {
                user_id: user_id.clone(),
                primaries,
            });
        }
        // Listing order is primary first, then newest.
        Ok(addresses.into_iter().next())
    }
}
