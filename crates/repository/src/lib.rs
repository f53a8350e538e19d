//! # Data Repository Layer
//!
//! Store interfaces for addresses, orders and order items, plus two
//! implementations:
//!
//! - [`PgStore`] backed by PostgreSQL through a deadpool connection pool;
//! - [`MemoryStore`], an in-process store with the same transactional
//!   guarantees, used for local runs and tests.
//!
//! Reads go through [`AddressesRepository`] and [`OrdersRepository`]. Every
//! write happens inside a [`StoreTransaction`] obtained from
//! [`TransactionalStore::begin`], and is only visible after `commit`.

use async_trait::async_trait;
use model::{
    Address, AddressId, NewAddress, NewOrder, NormalizedLine, Order, OrderId, OrderItem, UserId,
};
use thiserror::Error;

mod memory;
mod pg;

pub use memory::{FailPoint, MemoryStore, MemoryTransaction};
pub use pg::{PgStore, PgTransaction};

/// # RepositoryError
///
/// Error types that can occur during repository operations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Database-related errors, wrapping the underlying PostgreSQL error
    #[error("Database error: {0}")]
    Db(#[from] tokio_postgres::Error),
    /// Failed to obtain a connection from the pool.
    #[error("Pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),
    /// No result found.
    #[error("Not found")]
    NotFound,
    /// A store-level constraint rejected the write.
    #[error("Constraint violated: {0}")]
    Conflict(String),
    /// The store could not serve the request.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// # AddressesRepository
///
/// Read access to users' shipping addresses.
#[async_trait]
pub trait AddressesRepository: Send + Sync {
    /// All addresses of a user, primary first, then newest first.
    async fn list_by_user(&self, user_id: &UserId) -> Result<Vec<Address>, RepositoryError>;
}

/// # OrdersRepository
///
/// Read access to orders and their items.
#[async_trait]
pub trait OrdersRepository: Send + Sync {
    /// Order headers of a user, newest first by `order_id`. `items` is left empty.
    async fn query_by_user(&self, user_id: &UserId) -> Result<Vec<Order>, RepositoryError>;

    /// Items of all given orders, fetched in a single query.
    async fn query_items_by_order_ids(
        &self,
        order_ids: &[OrderId],
    ) -> Result<Vec<OrderItem>, RepositoryError>;
}

/// A store able to open atomic units of work.
#[async_trait]
pub trait TransactionalStore: Send + Sync {
    type Tx: StoreTransaction + 'static;

    /// Opens a transaction. The returned handle exclusively owns its
    /// connection until `commit`, `rollback` or drop.
    async fn begin(&self) -> Result<Self::Tx, RepositoryError>;
}

/// Writes (and locking reads) executed inside one transaction.
///
/// Dropping a transaction without committing discards all of its writes.
#[async_trait]
pub trait StoreTransaction: Send + Sized {
    /// Address `address_id` owned by `user_id`, share-locked until the transaction ends.
    async fn find_address(
        &mut self,
        user_id: &UserId,
        address_id: AddressId,
    ) -> Result<Option<Address>, RepositoryError>;

    /// Serializes primary-address changes of `user_id` until the transaction ends.
    async fn lock_user_addresses(&mut self, user_id: &UserId) -> Result<(), RepositoryError>;

    /// Clears the primary flag on every address of `user_id`. Returns the number of rows touched.
    async fn clear_primary(&mut self, user_id: &UserId) -> Result<u64, RepositoryError>;

    /// Sets the primary flag on one address. Returns `false` if the user has no such address.
    async fn mark_primary(
        &mut self,
        user_id: &UserId,
        address_id: AddressId,
    ) -> Result<bool, RepositoryError>;

    async fn insert_address(
        &mut self,
        user_id: &UserId,
        address: &NewAddress,
    ) -> Result<Address, RepositoryError>;

    /// Inserts an order header; the store assigns `order_id` and `created_at`.
    async fn insert_order(&mut self, order: &NewOrder) -> Result<Order, RepositoryError>;

    async fn insert_order_item(
        &mut self,
        order_id: OrderId,
        line: &NormalizedLine,
    ) -> Result<OrderItem, RepositoryError>;

    async fn commit(self) -> Result<(), RepositoryError>;

    async fn rollback(self) -> Result<(), RepositoryError>;
}
