//! In-process store with the same transactional guarantees as [`crate::PgStore`].
//!
//! A transaction holds the store lock for its whole lifetime and works on a
//! private copy of the tables, so transactions are serializable and readers
//! only ever observe committed state. Commit enforces the one-primary-per-user
//! constraint the same way the database's unique partial index does.
//!
//! Failures can be injected at named points with [`MemoryStore::fail_next`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use model::{
    Address, AddressId, NewAddress, NewOrder, NormalizedLine, Order, OrderId, OrderItem,
    OrderItemId, UserId,
};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::{
    AddressesRepository, OrdersRepository, RepositoryError, StoreTransaction, TransactionalStore,
};

/// Points at which [`MemoryStore::fail_next`] can inject a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    Begin,
    FindAddress,
    ClearPrimary,
    MarkPrimary,
    InsertAddress,
    InsertOrder,
    InsertOrderItem,
    Commit,
}

#[derive(Debug, Default, Clone)]
struct Tables {
    addresses: BTreeMap<AddressId, Address>,
    orders: BTreeMap<OrderId, Order>,
    items: BTreeMap<OrderItemId, OrderItem>,
    last_address_id: i64,
    last_order_id: i64,
    last_item_id: i64,
}

impl Tables {
    fn push_address(&mut self, user_id: &UserId, address: &NewAddress) -> Address {
        self.last_address_id += 1;
        let stored = Address {
            address_id: AddressId(self.last_address_id),
            user_id: user_id.clone(),
            full_name: address.full_name.clone(),
            country: address.country.clone(),
            address: address.address.clone(),
            unit: address.unit.clone(),
            city: address.city.clone(),
            state: address.state.clone(),
            zip_code: address.zip_code.clone(),
            phone_num: address.phone_num.clone(),
            is_primary: address.is_primary,
            created_at: Utc::now(),
        };
        self.addresses.insert(stored.address_id, stored.clone());
        stored
    }

    /// First user found with more than one primary address.
    fn primary_conflict(&self) -> Option<&UserId> {
        let mut primaries: HashMap<&UserId, usize> = HashMap::new();
        for address in self.addresses.values().filter(|a| a.is_primary) {
            let count = primaries.entry(&address.user_id).or_default();
            *count += 1;
            if *count > 1 {
                return Some(&address.user_id);
            }
        }
        None
    }
}

struct Inner {
    tables: Arc<AsyncMutex<Tables>>,
    faults: Mutex<HashSet<FailPoint>>,
    begun: AtomicUsize,
    committed: AtomicUsize,
    rolled_back: AtomicUsize,
}

impl Inner {
    fn trip(&self, point: FailPoint) -> Result<(), RepositoryError> {
        let armed = self
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&point);
        if armed {
            debug!(?point, "injected failure");
            return Err(RepositoryError::Unavailable(format!(
                "injected failure at {point:?}"
            )));
        }
        Ok(())
    }
}

/// In-memory store. Cloning yields another handle to the same tables.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                tables: Arc::new(AsyncMutex::new(Tables::default())),
                faults: Mutex::new(HashSet::new()),
                begun: AtomicUsize::new(0),
                committed: AtomicUsize::new(0),
                rolled_back: AtomicUsize::new(0),
            }),
        }
    }

    /// Makes the next operation at `point` fail once.
    pub fn fail_next(&self, point: FailPoint) {
        self.inner
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(point);
    }

    /// Inserts an address directly, bypassing transactions and constraints.
    pub async fn seed_address(&self, user_id: &UserId, address: &NewAddress) -> Address {
        self.inner.tables.lock().await.push_address(user_id, address)
    }

    pub fn transactions_begun(&self) -> usize {
        self.inner.begun.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.inner.committed.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.inner.rolled_back.load(Ordering::SeqCst)
    }

    /// `true` when no transaction currently holds the store.
    pub fn is_idle(&self) -> bool {
        self.inner.tables.try_lock().is_ok()
    }

    pub async fn order_count(&self) -> usize {
        self.inner.tables.lock().await.orders.len()
    }

    pub async fn item_count(&self) -> usize {
        self.inner.tables.lock().await.items.len()
    }
}

#[async_trait]
impl AddressesRepository for MemoryStore {
    async fn list_by_user(&self, user_id: &UserId) -> Result<Vec<Address>, RepositoryError> {
        let tables = self.inner.tables.lock().await;
        let mut addresses: Vec<Address> = tables
            .addresses
            .values()
            .filter(|a| &a.user_id == user_id)
            .cloned()
            .collect();
        addresses.sort_by(|a, b| {
            b.is_primary
                .cmp(&a.is_primary)
                .then(b.address_id.cmp(&a.address_id))
        });
        Ok(addresses)
    }
}

#[async_trait]
impl OrdersRepository for MemoryStore {
    async fn query_by_user(&self, user_id: &UserId) -> Result<Vec<Order>, RepositoryError> {
        let tables = self.inner.tables.lock().await;
        Ok(tables
            .orders
            .values()
            .rev()
            .filter(|o| &o.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn query_items_by_order_ids(
        &self,
        order_ids: &[OrderId],
    ) -> Result<Vec<OrderItem>, RepositoryError> {
        let wanted: HashSet<&OrderId> = order_ids.iter().collect();
        let tables = self.inner.tables.lock().await;
        Ok(tables
            .items
            .values()
            .filter(|item| wanted.contains(&item.order_id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl TransactionalStore for MemoryStore {
    type Tx = MemoryTransaction;

    async fn begin(&self) -> Result<MemoryTransaction, RepositoryError> {
        self.inner.trip(FailPoint::Begin)?;
        let guard = self.inner.tables.clone().lock_owned().await;
        self.inner.begun.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryTransaction {
            staged: (*guard).clone(),
            guard,
            store: self.inner.clone(),
            finished: false,
        })
    }
}

/// Open transaction on a [`MemoryStore`].
pub struct MemoryTransaction {
    guard: OwnedMutexGuard<Tables>,
    staged: Tables,
    store: Arc<Inner>,
    finished: bool,
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.store.rolled_back.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn find_address(
        &mut self,
        user_id: &UserId,
        address_id: AddressId,
    ) -> Result<Option<Address>, RepositoryError> {
        self.store.trip(FailPoint::FindAddress)?;
        Ok(self
            .staged
            .addresses
            .get(&address_id)
            .filter(|a| &a.user_id == user_id)
            .cloned())
    }

    async fn lock_user_addresses(&mut self, _user_id: &UserId) -> Result<(), RepositoryError> {
        // The transaction already holds the whole store.
        Ok(())
    }

    async fn clear_primary(&mut self, user_id: &UserId) -> Result<u64, RepositoryError> {
        self.store.trip(FailPoint::ClearPrimary)?;
        let mut cleared = 0;
        for address in self.staged.addresses.values_mut() {
            if &address.user_id == user_id && address.is_primary {
                address.is_primary = false;
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    async fn mark_primary(
        &mut self,
        user_id: &UserId,
        address_id: AddressId,
    ) -> Result<bool, RepositoryError> {
        self.store.trip(FailPoint::MarkPrimary)?;
        match self.staged.addresses.get_mut(&address_id) {
            Some(address) if &address.user_id == user_id => {
                address.is_primary = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_address(
        &mut self,
        user_id: &UserId,
        address: &NewAddress,
    ) -> Result<Address, RepositoryError> {
        self.store.trip(FailPoint::InsertAddress)?;
        Ok(self.staged.push_address(user_id, address))
    }

    async fn insert_order(&mut self, order: &NewOrder) -> Result<Order, RepositoryError> {
        self.store.trip(FailPoint::InsertOrder)?;
        if !self
            .staged
            .addresses
            .get(&order.address_id)
            .is_some_and(|a| a.user_id == order.user_id)
        {
            return Err(RepositoryError::Conflict(format!(
                "address {} does not exist for user {}",
                order.address_id, order.user_id
            )));
        }
        self.staged.last_order_id += 1;
        let stored = Order {
            order_id: OrderId(self.staged.last_order_id),
            user_id: order.user_id.clone(),
            address_id: order.address_id,
            payment_id: order.payment_id.clone(),
            total: order.total,
            status: order.status.clone(),
            created_at: Utc::now(),
            tracking_number: order.tracking_number.clone(),
            items: Vec::new(),
        };
        self.staged.orders.insert(stored.order_id, stored.clone());
        Ok(stored)
    }

    async fn insert_order_item(
        &mut self,
        order_id: OrderId,
        line: &NormalizedLine,
    ) -> Result<OrderItem, RepositoryError> {
        self.store.trip(FailPoint::InsertOrderItem)?;
        if !self.staged.orders.contains_key(&order_id) {
            return Err(RepositoryError::Conflict(format!("order {order_id} does not exist")));
        }
        self.staged.last_item_id += 1;
        let item = OrderItem {
            item_id: OrderItemId(self.staged.last_item_id),
            order_id,
            product_id: line.product_id,
            name: line.name.clone(),
            price: line.price,
            quantity: line.quantity,
        };
        self.staged.items.insert(item.item_id, item.clone());
        Ok(item)
    }

    async fn commit(mut self) -> Result<(), RepositoryError> {
        self.store.trip(FailPoint::Commit)?;
        if let Some(user_id) = self.staged.primary_conflict() {
            return Err(RepositoryError::Conflict(format!(
                "user {user_id} would have more than one primary address"
            )));
        }
        *self.guard = std::mem::take(&mut self.staged);
        self.finished = true;
        self.store.committed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(mut self) -> Result<(), RepositoryError> {
        self.finished = true;
        self.store.rolled_back.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn new_address(is_primary: bool) -> NewAddress {
        NewAddress {
            full_name: "Test User".into(),
            country: "US".into(),
            address: "1 Main St".into(),
            unit: None,
            city: "Springfield".into(),
            state: "IL".into(),
            zip_code: "62701".into(),
            phone_num: "+15550000000".into(),
            is_primary,
        }
    }

    fn new_order(user_id: &UserId, address_id: AddressId) -> NewOrder {
        NewOrder {
            user_id: user_id.clone(),
            address_id,
            payment_id: None,
            tracking_number: None,
            total: dec!(10.00),
            status: model::ORDER_PLACED.into(),
        }
    }

    #[tokio::test]
    async fn test_uncommitted_writes_are_discarded() {
        let store = MemoryStore::new();
        let user = UserId::new("u1");
        let address = store.seed_address(&user, &new_address(false)).await;

        let mut tx = store.begin().await.unwrap();
        tx.insert_order(&new_order(&user, address.address_id)).await.unwrap();
        drop(tx);

        assert_eq!(store.order_count().await, 0);
        assert_eq!(store.rollbacks(), 1);
        assert!(store.is_idle());
    }

    #[tokio::test]
    async fn test_commit_publishes_writes() {
        let store = MemoryStore::new();
        let user = UserId::new("u1");
        let address = store.seed_address(&user, &new_address(false)).await;

        let mut tx = store.begin().await.unwrap();
        let order = tx.insert_order(&new_order(&user, address.address_id)).await.unwrap();
        assert_eq!(order.order_id, OrderId(1));
        tx.commit().await.unwrap();

        let orders = store.query_by_user(&user).await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(store.commits(), 1);
    }

    #[tokio::test]
    async fn test_commit_rejects_second_primary() {
        let store = MemoryStore::new();
        let user = UserId::new("u1");
        store.seed_address(&user, &new_address(true)).await;

        let mut tx = store.begin().await.unwrap();
        tx.insert_address(&user, &new_address(true)).await.unwrap();
        let err = tx.commit().await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
        assert_eq!(store.list_by_user(&user).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fail_point_fires_once() {
        let store = MemoryStore::new();
        store.fail_next(FailPoint::Begin);
        assert!(store.begin().await.is_err());
        assert!(store.begin().await.is_ok());
    }

    #[tokio::test]
    async fn test_list_addresses_primary_first() {
        let store = MemoryStore::new();
        let user = UserId::new("u1");
        let first = store.seed_address(&user, &new_address(true)).await;
        let second = store.seed_address(&user, &new_address(false)).await;
        store.seed_address(&UserId::new("u2"), &new_address(false)).await;

        let listed = store.list_by_user(&user).await.unwrap();
        let ids: Vec<AddressId> = listed.iter().map(|a| a.address_id).collect();
        assert_eq!(ids, vec![first.address_id, second.address_id]);
        let foreign = store.list_by_user(&UserId::new("u2")).await.unwrap();
        assert!(foreign.iter().all(|a| a.address_id != first.address_id));
    }
}
