//! Order placement and order history.

use std::collections::HashMap;

use async_trait::async_trait;
use model::{AddressId, NewOrder, Order, OrderId, OrderItem, OrderRequest, ORDER_PLACED, PlacedOrder, UserId};
use pricing::PricingError;
use repository::{OrdersRepository, StoreTransaction, TransactionalStore};
use tracing::{info, instrument};

use crate::{ServiceError, require_user, settle, store_failure, validate_address};

/// Checkout operations.
///
/// The caller resolves the user's identity; the service trusts the `user_id` it is given.
#[async_trait]
pub trait OrderService: Send + Sync {
    /// Validates the address, prices the cart and persists the order with all
    /// of its items in one transaction.
    ///
    /// # Errors
    /// - [`ServiceError::InvalidRequest`] for a blank user, missing address
    ///   reference or empty cart; no transaction is opened.
    /// - [`ServiceError::AddressNotFound`] if the address is not the user's.
    /// - [`ServiceError::Persistence`] if any store operation fails; nothing is persisted.
    async fn place_order(
        &self,
        user_id: &UserId,
        request: OrderRequest,
    ) -> Result<PlacedOrder, ServiceError>;

    /// All orders of a user, newest first, each with its items.
    ///
    /// A user without orders gets an empty list.
    async fn orders_for_user(&self, user_id: &UserId) -> Result<Vec<Order>, ServiceError>;
}

/// [`OrderService`] over a read repository and a transactional store.
pub struct OrderServiceImpl<O, S> {
    orders_repo: O,
    store: S,
}

impl<O, S> OrderServiceImpl<O, S>
where
    O: OrdersRepository,
    S: TransactionalStore,
{
    pub fn new(orders_repo: O, store: S) -> Self {
        Self { orders_repo, store }
    }

    /// Checks everything that can be checked without the store.
    fn validate_request(
        user_id: &UserId,
        request: &OrderRequest,
    ) -> Result<AddressId, ServiceError> {
        require_user(user_id)?;
        let address_id = request
            .address_id
            .filter(|id| id.0 > 0)
            .ok_or_else(|| ServiceError::InvalidRequest("Missing addressID".into()))?;
        if request.items.is_empty() {
            return Err(ServiceError::InvalidRequest("Cart is empty".into()));
        }
        Ok(address_id)
    }

    /// Everything between BEGIN and COMMIT. The order header always goes in
    /// before its items, which need the generated `order_id`.
    async fn write_order(
        tx: &mut S::Tx,
        user_id: &UserId,
        address_id: AddressId,
        request: &OrderRequest,
    ) -> Result<PlacedOrder, ServiceError> {
        validate_address(&mut *tx, user_id, address_id).await?;

        let priced = pricing::price_cart(&request.items).map_err(|err| match err {
            PricingError::EmptyOrder => ServiceError::InvalidRequest("Cart is empty".into()),
            PricingError::TotalOutOfRange(_) => {
                ServiceError::InvalidRequest("Order total is out of range".into())
            }
        })?;

        let order = tx
            .insert_order(&NewOrder {
                user_id: user_id.clone(),
                address_id,
                payment_id: request.payment_id.clone(),
                tracking_number: request.tracking_number.clone(),
                total: priced.total,
                status: ORDER_PLACED.to_string(),
            })
            .await?;

        for line in &priced.lines {
            tx.insert_order_item(order.order_id, line).await?;
        }

        Ok(PlacedOrder {
            order_id: order.order_id,
            total: order.total,
        })
    }
}

#[async_trait]
impl<O, S> OrderService for OrderServiceImpl<O, S>
where
    O: OrdersRepository,
    S: TransactionalStore,
{
    #[instrument(skip(self, request), fields(address_id = ?request.address_id, lines = request.items.len()))]
    async fn place_order(
        &self,
        user_id: &UserId,
        request: OrderRequest,
    ) -> Result<PlacedOrder, ServiceError> {
        let address_id = Self::validate_request(user_id, &request)?;

        let mut tx = self.store.begin().await.map_err(store_failure)?;
        let outcome = Self::write_order(&mut tx, user_id, address_id, &request).await;
        let placed = settle(tx, outcome).await?;

        info!(order_id = %placed.order_id, total = %placed.total, "order placed");
        Ok(placed)
    }

    #[instrument(skip(self))]
    async fn orders_for_user(&self, user_id: &UserId) -> Result<Vec<Order>, ServiceError> {
        require_user(user_id)?;

        let mut orders = self
            .orders_repo
            .query_by_user(user_id)
            .await
            .map_err(store_failure)?;
        if orders.is_empty() {
            return Ok(orders);
        }

        let order_ids: Vec<OrderId> = orders.iter().map(|o| o.order_id).collect();
        let items = self
            .orders_repo
            .query_items_by_order_ids(&order_ids)
            .await
            .map_err(store_failure)?;

        let mut by_order: HashMap<OrderId, Vec<OrderItem>> = HashMap::new();
        for item in items {
            by_order.entry(item.order_id).or_default().push(item);
        }
        for order in &mut orders {
            order.items = by_order.remove(&order.order_id).unwrap_or_default();
        }
        Ok(orders)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use model::{CartLine, NewAddress};
    use repository::{FailPoint, MemoryStore};
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn service(store: &MemoryStore) -> OrderServiceImpl<MemoryStore, MemoryStore> {
        OrderServiceImpl::new(store.clone(), store.clone())
    }

    fn shipping_address() -> NewAddress {
        NewAddress {
            full_name: "Test Testov".into(),
            country: "US".into(),
            address: "1 Main St".into(),
            unit: Some("4B".into()),
            city: "Springfield".into(),
            state: "IL".into(),
            zip_code: "62701".into(),
            phone_num: "+15550000000".into(),
            is_primary: true,
        }
    }

    fn cart_line(name: &str, price: f64, quantity: i64) -> CartLine {
        CartLine {
            product_id: json!(1),
            name: json!(name),
            price: json!(price),
            quantity: json!(quantity),
        }
    }

    fn request(address_id: AddressId, items: Vec<CartLine>) -> OrderRequest {
        OrderRequest {
            address_id: Some(address_id),
            payment_id: Some("pay_1".into()),
            tracking_number: None,
            items,
        }
    }

    async fn seeded(user: &UserId) -> (MemoryStore, AddressId) {
        let store = MemoryStore::new();
        let address = store.seed_address(user, &shipping_address()).await;
        (store, address.address_id)
    }

    #[tokio::test]
    async fn test_place_order_and_read_it_back() {
        let user = UserId::new("U1");
        let (store, address_id) = seeded(&user).await;
        let service = service(&store);

        let items = vec![cart_line("Mascara", 29.99, 2), cart_line("Brush", 10.00, 1)];
        let placed = service.place_order(&user, request(address_id, items)).await.unwrap();
        assert_eq!(placed.total, dec!(69.98));

        let orders = service.orders_for_user(&user).await.unwrap();
        assert_eq!(orders.len(), 1);
        let order = &orders[0];
        assert_eq!(order.order_id, placed.order_id);
        assert_eq!(order.total, dec!(69.98));
        assert_eq!(order.status, ORDER_PLACED);
        assert_eq!(order.address_id, address_id);
        assert_eq!(order.payment_id.as_deref(), Some("pay_1"));
        assert_eq!(order.items.len(), 2);
        assert_eq!(order.items[0].name, "Mascara");
        assert_eq!(order.items[0].price, dec!(29.99));
        assert_eq!(order.items[0].quantity, 2);
        assert_eq!(order.items[1].name, "Brush");
        assert_eq!(order.items[1].price, dec!(10.00));
        assert_eq!(order.items[1].quantity, 1);
        assert!(store.is_idle());
    }

    #[tokio::test]
    async fn test_foreign_address_is_rejected_without_writes() {
        let owner = UserId::new("U1");
        let (store, address_id) = seeded(&owner).await;
        let service = service(&store);

        let err = service
            .place_order(&UserId::new("U2"), request(address_id, vec![cart_line("X", 1.0, 1)]))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::AddressNotFound));
        assert_eq!(store.order_count().await, 0);
        assert_eq!(store.item_count().await, 0);
        assert_eq!(store.rollbacks(), 1);
        assert!(store.is_idle());
    }

    #[tokio::test]
    async fn test_unknown_address_is_rejected() {
        let user = UserId::new("U1");
        let (store, _) = seeded(&user).await;
        let err = service(&store)
            .place_order(&user, request(AddressId(999), vec![cart_line("X", 1.0, 1)]))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::AddressNotFound));
        assert_eq!(store.order_count().await, 0);
    }

    #[tokio::test]
    async fn test_empty_cart_is_rejected_before_any_transaction() {
        let user = UserId::new("U1");
        let (store, address_id) = seeded(&user).await;

        let err = service(&store)
            .place_order(&user, request(address_id, Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidRequest(_)));
        assert_eq!(store.transactions_begun(), 0);
    }

    #[tokio::test]
    async fn test_missing_identity_or_address_is_invalid() {
        let user = UserId::new("U1");
        let (store, address_id) = seeded(&user).await;
        let service = service(&store);

        let err = service
            .place_order(&UserId::new(""), request(address_id, vec![cart_line("X", 1.0, 1)]))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidRequest(_)));

        let mut no_address = request(address_id, vec![cart_line("X", 1.0, 1)]);
        no_address.address_id = None;
        let err = service.place_order(&user, no_address).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidRequest(_)));

        assert_eq!(store.transactions_begun(), 0);
    }

    #[tokio::test]
    async fn test_failure_between_order_and_items_leaves_nothing() {
        let user = UserId::new("U1");
        let (store, address_id) = seeded(&user).await;
        store.fail_next(FailPoint::InsertOrderItem);

        let err = service(&store)
            .place_order(&user, request(address_id, vec![cart_line("X", 5.0, 1)]))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Persistence(_)));
        assert_eq!(store.order_count().await, 0);
        assert_eq!(store.item_count().await, 0);
        assert!(service(&store).orders_for_user(&user).await.unwrap().is_empty());
        assert!(store.is_idle());
    }

    #[tokio::test]
    async fn test_address_lookup_failure_leaves_nothing() {
        let user = UserId::new("U1");
        let (store, address_id) = seeded(&user).await;
        store.fail_next(FailPoint::FindAddress);

        let err = service(&store)
            .place_order(&user, request(address_id, vec![cart_line("X", 5.0, 1)]))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Persistence(_)));
        assert_eq!(store.order_count().await, 0);
        assert_eq!(store.rollbacks(), 1);
        assert!(store.is_idle());
    }

    #[tokio::test]
    async fn test_oversized_order_total_is_rejected() {
        let user = UserId::new("U1");
        let (store, address_id) = seeded(&user).await;
        let lines = vec![CartLine {
            product_id: json!(1),
            name: json!("Yacht"),
            price: json!("999999999.99"),
            quantity: json!(1_000_000),
        }];

        let err = service(&store)
            .place_order(&user, request(address_id, lines))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidRequest(msg) if msg.contains("out of range")));
        assert_eq!(store.order_count().await, 0);
        assert!(store.is_idle());
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_nothing() {
        let user = UserId::new("U1");
        let (store, address_id) = seeded(&user).await;
        store.fail_next(FailPoint::Commit);

        let err = service(&store)
            .place_order(&user, request(address_id, vec![cart_line("X", 5.0, 3)]))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Persistence(_)));
        assert_eq!(store.order_count().await, 0);
        assert_eq!(store.commits(), 0);
        assert!(store.is_idle());
    }

    #[tokio::test]
    async fn test_begin_failure_is_a_persistence_failure() {
        let user = UserId::new("U1");
        let (store, address_id) = seeded(&user).await;
        store.fail_next(FailPoint::Begin);

        let err = service(&store)
            .place_order(&user, request(address_id, vec![cart_line("X", 5.0, 1)]))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Persistence(_)));
    }

    #[tokio::test]
    async fn test_no_orders_is_an_empty_list() {
        let store = MemoryStore::new();
        let orders = service(&store).orders_for_user(&UserId::new("nobody")).await.unwrap();
        assert!(orders.is_empty());
    }

    #[tokio::test]
    async fn test_orders_are_newest_first_with_their_own_items() {
        let user = UserId::new("U1");
        let (store, address_id) = seeded(&user).await;
        let other = UserId::new("U2");
        let other_address = store.seed_address(&other, &shipping_address()).await;
        let service = service(&store);

        let first = service
            .place_order(&user, request(address_id, vec![cart_line("A", 1.0, 1)]))
            .await
            .unwrap();
        service
            .place_order(&other, request(other_address.address_id, vec![cart_line("Z", 9.0, 1)]))
            .await
            .unwrap();
        let second = service
            .place_order(
                &user,
                request(address_id, vec![cart_line("B", 2.0, 1), cart_line("C", 3.0, 2)]),
            )
            .await
            .unwrap();

        let orders = service.orders_for_user(&user).await.unwrap();
        let ids: Vec<OrderId> = orders.iter().map(|o| o.order_id).collect();
        assert_eq!(ids, vec![second.order_id, first.order_id]);
        assert_eq!(orders[0].items.len(), 2);
        assert_eq!(orders[0].total, dec!(8.00));
        assert_eq!(orders[1].items.len(), 1);
        assert_eq!(orders[1].items[0].name, "A");
        assert!(orders.iter().flat_map(|o| &o.items).all(|i| i.name != "Z"));
    }

    #[tokio::test]
    async fn test_malformed_lines_are_coerced() {
        let user = UserId::new("U1");
        let (store, address_id) = seeded(&user).await;
        let service = service(&store);

        let lines = vec![
            CartLine {
                product_id: json!("abc"),
                name: json!(null),
                price: json!("-4"),
                quantity: json!(0),
            },
            CartLine {
                product_id: json!(7),
                name: json!("Gift"),
                price: json!("3.333"),
                quantity: json!("3"),
            },
        ];
        let placed = service.place_order(&user, request(address_id, lines)).await.unwrap();
        assert_eq!(placed.total, dec!(9.99));

        let order = service.orders_for_user(&user).await.unwrap().remove(0);
        assert_eq!(order.items[0].name, "Item");
        assert_eq!(order.items[0].price, dec!(0.00));
        assert_eq!(order.items[0].quantity, 1);
        assert_eq!(order.items[0].product_id, None);
        assert_eq!(order.items[1].product_id, Some(7));
        assert_eq!(order.items[1].price, dec!(3.33));
    }

    #[tokio::test]
    async fn test_concurrent_orders_are_independent() {
        let user = UserId::new("U1");
        let (store, address_id) = seeded(&user).await;
        let service = Arc::new(service(&store));

        let handles: Vec<_> = (0..8)
            .map(|n| {
                let service = service.clone();
                let user = user.clone();
                tokio::spawn(async move {
                    service
                        .place_order(&user, request(address_id, vec![cart_line("X", 1.0, n + 1)]))
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let orders = service.orders_for_user(&user).await.unwrap();
        assert_eq!(orders.len(), 8);
        assert!(orders.iter().all(|o| o.items.len() == 1));
        assert_eq!(store.item_count().await, 8);
    }
}
