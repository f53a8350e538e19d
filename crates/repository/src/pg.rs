//! PostgreSQL implementation of the store traits.

use async_trait::async_trait;
use deadpool_postgres::{Object, Pool};
use model::{
    Address, AddressId, NewAddress, NewOrder, NormalizedLine, Order, OrderId, OrderItem, UserId,
};
use tokio_postgres::Row;
use tokio_postgres::error::SqlState;
use tracing::{debug, warn};

use crate::{
    AddressesRepository, OrdersRepository, RepositoryError, StoreTransaction, TransactionalStore,
};

const ADDRESS_COLUMNS: &str = "address_id, user_id, full_name, country, address, unit, city, \
                               state, zip_code, phone_num, is_primary, created_at";

/// PostgreSQL-backed store.
///
/// Every call borrows a connection from the pool; a transaction keeps its
/// connection until it is committed, rolled back or dropped.
#[derive(Clone)]
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

fn address_from_row(row: &Row) -> Address {
    Address {
        address_id: row.get("address_id"),
        user_id: row.get("user_id"),
        full_name: row.get("full_name"),
        country: row.get("country"),
        address: row.get("address"),
        unit: row.get("unit"),
        city: row.get("city"),
        state: row.get("state"),
        zip_code: row.get("zip_code"),
        phone_num: row.get("phone_num"),
        is_primary: row.get("is_primary"),
        created_at: row.get("created_at"),
    }
}

fn order_from_row(row: &Row) -> Order {
    Order {
        order_id: row.get("order_id"),
        user_id: row.get("user_id"),
        address_id: row.get("address_id"),
        payment_id: row.get("payment_id"),
        total: row.get("total"),
        status: row.get("status"),
        created_at: row.get("created_at"),
        tracking_number: row.get("tracking_number"),
        items: Vec::new(),
    }
}

fn item_from_row(row: &Row) -> OrderItem {
    OrderItem {
        item_id: row.get("item_id"),
        order_id: row.get("order_id"),
        product_id: row.get("product_id"),
        name: row.get("name"),
        price: row.get("price"),
        quantity: row.get("quantity"),
    }
}

/// Unique violations (one primary per user) surface as [`RepositoryError::Conflict`].
fn constraint_aware(err: tokio_postgres::Error) -> RepositoryError {
    if err.code() == Some(&SqlState::UNIQUE_VIOLATION) {
        RepositoryError::Conflict(err.to_string())
    } else {
        RepositoryError::Db(err)
    }
}

#[async_trait]
impl AddressesRepository for PgStore {
    async fn list_by_user(&self, user_id: &UserId) -> Result<Vec<Address>, RepositoryError> {
        let client = self.pool.get().await?;
        let query = format!(
            "SELECT {ADDRESS_COLUMNS} FROM addresses WHERE user_id = $1 \
             ORDER BY is_primary DESC, address_id DESC"
        );
        let rows = client.query(query.as_str(), &[user_id]).await?;
        Ok(rows.iter().map(address_from_row).collect())
    }
}

#[async_trait]
impl OrdersRepository for PgStore {
    async fn query_by_user(&self, user_id: &UserId) -> Result<Vec<Order>, RepositoryError> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT order_id, user_id, address_id, payment_id, total, status, created_at, tracking_number
            FROM orders WHERE user_id = $1
            ORDER BY order_id DESC
        "#;
        let rows = client.query(query, &[user_id]).await?;
        Ok(rows.iter().map(order_from_row).collect())
    }

    async fn query_items_by_order_ids(
        &self,
        order_ids: &[OrderId],
    ) -> Result<Vec<OrderItem>, RepositoryError> {
        if order_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<i64> = order_ids.iter().map(|id| id.0).collect();
        let client = self.pool.get().await?;
        let query = r#"
            SELECT item_id, order_id, product_id, name, price, quantity
            FROM order_items WHERE order_id = ANY($1)
            ORDER BY order_id, item_id
        "#;
        let rows = client.query(query, &[&ids]).await?;
        Ok(rows.iter().map(item_from_row).collect())
    }
}

#[async_trait]
impl TransactionalStore for PgStore {
    type Tx = PgTransaction;

    async fn begin(&self) -> Result<PgTransaction, RepositoryError> {
        let client = self.pool.get().await?;
        // The handle owns its pooled connection, so the transaction is driven
        // with plain statements rather than a borrowed `Transaction<'_>`.
        client.batch_execute("BEGIN").await?;
        debug!("transaction opened");
        Ok(PgTransaction {
            client: Some(client),
        })
    }
}

/// An open PostgreSQL transaction holding one pooled connection.
///
/// If dropped while still open, the connection is detached from the pool and
/// closed, which makes the server abort the transaction.
pub struct PgTransaction {
    client: Option<Object>,
}

impl PgTransaction {
    fn client(&self) -> Result<&Object, RepositoryError> {
        self.client
            .as_ref()
            .ok_or_else(|| RepositoryError::Unavailable("transaction already finished".into()))
    }

    async fn finish(&mut self, statement: &str) -> Result<(), RepositoryError> {
        let client = self
            .client
            .take()
            .ok_or_else(|| RepositoryError::Unavailable("transaction already finished".into()))?;
        if let Err(err) = client.batch_execute(statement).await {
            // Unknown transaction state; never hand this connection out again.
            drop(Object::take(client));
            return Err(err.into());
        }
        Ok(())
    }
}

impl Drop for PgTransaction {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            warn!("transaction dropped while open; discarding its connection");
            drop(Object::take(client));
        }
    }
}

#[async_trait]
impl StoreTransaction for PgTransaction {
    async fn find_address(
        &mut self,
        user_id: &UserId,
        address_id: AddressId,
    ) -> Result<Option<Address>, RepositoryError> {
        let query = format!(
            "SELECT {ADDRESS_COLUMNS} FROM addresses WHERE address_id = $1 AND user_id = $2 FOR SHARE"
        );
        let row = self.client()?.query_opt(query.as_str(), &[&address_id, user_id]).await?;
        Ok(row.as_ref().map(address_from_row))
    }

    async fn lock_user_addresses(&mut self, user_id: &UserId) -> Result<(), RepositoryError> {
        // An advisory lock also covers users that have no address rows yet.
        self.client()?
            .execute(
                "SELECT pg_advisory_xact_lock(hashtext('addresses:' || $1::text))",
                &[user_id],
            )
            .await?;
        Ok(())
    }

    async fn clear_primary(&mut self, user_id: &UserId) -> Result<u64, RepositoryError> {
        let cleared = self
            .client()?
            .execute(
                "UPDATE addresses SET is_primary = FALSE WHERE user_id = $1 AND is_primary",
                &[user_id],
            )
            .await?;
        Ok(cleared)
    }

    async fn mark_primary(
        &mut self,
        user_id: &UserId,
        address_id: AddressId,
    ) -> Result<bool, RepositoryError> {
        let updated = self
            .client()?
            .execute(
                "UPDATE addresses SET is_primary = TRUE WHERE user_id = $1 AND address_id = $2",
                &[user_id, &address_id],
            )
            .await
            .map_err(constraint_aware)?;
        Ok(updated == 1)
    }

    async fn insert_address(
        &mut self,
        user_id: &UserId,
        address: &NewAddress,
    ) -> Result<Address, RepositoryError> {
        let query = format!(
            r#"
            INSERT INTO addresses
                (user_id, full_name, country, address, unit, city, state, zip_code, phone_num, is_primary)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {ADDRESS_COLUMNS}
            "#
        );
        let row = self
            .client()?
            .query_one(
                query.as_str(),
                &[
                    user_id,
                    &address.full_name,
                    &address.country,
                    &address.address,
                    &address.unit,
                    &address.city,
                    &address.state,
                    &address.zip_code,
                    &address.phone_num,
                    &address.is_primary,
                ],
            )
            .await
            .map_err(constraint_aware)?;
        Ok(address_from_row(&row))
    }

    async fn insert_order(&mut self, order: &NewOrder) -> Result<Order, RepositoryError> {
        let query = r#"
            INSERT INTO orders (user_id, address_id, payment_id, total, status, tracking_number)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING order_id, user_id, address_id, payment_id, total, status, created_at, tracking_number
        "#;
        let row = self
            .client()?
            .query_one(
                query,
                &[
                    &order.user_id,
                    &order.address_id,
                    &order.payment_id,
                    &order.total,
                    &order.status,
                    &order.tracking_number,
                ],
            )
            .await?;
        Ok(order_from_row(&row))
    }

    async fn insert_order_item(
        &mut self,
        order_id: OrderId,
        line: &NormalizedLine,
    ) -> Result<OrderItem, RepositoryError> {
        let query = r#"
            INSERT INTO order_items (order_id, product_id, name, price, quantity)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING item_id, order_id, product_id, name, price, quantity
        "#;
        let row = self
            .client()?
            .query_one(
                query,
                &[&order_id, &line.product_id, &line.name, &line.price, &line.quantity],
            )
            .await?;
        Ok(item_from_row(&row))
    }

    async fn commit(mut self) -> Result<(), RepositoryError> {
        self.finish("COMMIT").await?;
        debug!("transaction committed");
        Ok(())
    }

    async fn rollback(mut self) -> Result<(), RepositoryError> {
        self.finish("ROLLBACK").await?;
        debug!("transaction rolled back");
        Ok(())
    }
}
