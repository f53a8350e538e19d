//! Domain types shared by every layer of the storefront order backend.
//!
//! JSON field names follow the storefront's wire format (`addressID`,
//! `orderID`, `is_primary`, ...), which is why most fields carry an explicit
//! `serde(rename)`.

use std::fmt;

use chrono::{DateTime, Utc};
use postgres_types::{FromSql, ToSql};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Status assigned to every freshly placed order.
pub const ORDER_PLACED: &str = "Order Placed";

macro_rules! row_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
            Serialize, Deserialize, ToSql, FromSql,
        )]
        #[serde(transparent)]
        #[postgres(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }
    };
}

row_id!(
    /// Primary key of an `addresses` row.
    AddressId
);
row_id!(
    /// Primary key of an `orders` row, generated by the store.
    OrderId
);
row_id!(
    /// Primary key of an `order_items` row.
    OrderItemId
);

/// Identity of an authenticated user, as handed to us by the upstream auth layer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSql, FromSql)]
#[serde(transparent)]
#[postgres(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// An empty or whitespace-only id counts as "no identity".
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Address: a user's shipping address.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Address {
    #[serde(rename = "addressID")]
    pub address_id: AddressId,
    #[serde(rename = "userID")]
    pub user_id: UserId,
    #[serde(rename = "fullName")]
    pub full_name: String,
    pub country: String,
    /// Street line.
    pub address: String,
    pub unit: Option<String>,
    pub city: String,
    pub state: String,
    #[serde(rename = "zipCode")]
    pub zip_code: String,
    #[serde(rename = "phoneNum")]
    pub phone_num: String,
    #[serde(rename = "is_primary", serialize_with = "as_flag", deserialize_with = "flag")]
    pub is_primary: bool,
    #[serde(rename = "created_at")]
    pub created_at: DateTime<Utc>,
}

/// NewAddress: payload for creating an address.
///
/// `is_primary` accepts both booleans and `0`/`1`, and is written as `0`/`1`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewAddress {
    #[serde(rename = "fullName", default)]
    pub full_name: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub state: String,
    #[serde(rename = "zipCode", default)]
    pub zip_code: String,
    #[serde(rename = "phoneNum", default)]
    pub phone_num: String,
    #[serde(
        rename = "is_primary",
        default,
        serialize_with = "as_flag",
        deserialize_with = "flag"
    )]
    pub is_primary: bool,
}

impl NewAddress {
    /// Names of required fields that are missing or blank.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        [
            ("fullName", &self.full_name),
            ("country", &self.country),
            ("address", &self.address),
            ("city", &self.city),
            ("state", &self.state),
            ("zipCode", &self.zip_code),
            ("phoneNum", &self.phone_num),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name)
        .collect()
    }
}

/// The storefront UI compares `is_primary` against `1`.
fn as_flag<S>(value: &bool, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u8(u8::from(*value))
}

fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Bool(b) => b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => matches!(s.trim(), "1" | "true"),
        _ => false,
    })
}

/// CartLine: one raw cart entry as sent by the checkout UI.
///
/// Every field is left untyped on purpose: the checkout UI may send partial or
/// malformed data and the pricing layer coerces it instead of rejecting it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CartLine {
    #[serde(rename = "productID", default)]
    pub product_id: Value,
    #[serde(default)]
    pub name: Value,
    #[serde(default)]
    pub price: Value,
    #[serde(default)]
    pub quantity: Value,
}

/// NormalizedLine: a cart line after price/quantity coercion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedLine {
    pub product_id: Option<i64>,
    pub name: String,
    /// Unit price, exactly two fraction digits, never negative.
    pub price: Decimal,
    /// Always at least 1.
    pub quantity: i32,
    /// `round2(price * quantity)`.
    pub line_total: Decimal,
}

/// OrderRequest: checkout payload for placing an order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OrderRequest {
    #[serde(rename = "addressID", default)]
    pub address_id: Option<AddressId>,
    #[serde(rename = "paymentID", default)]
    pub payment_id: Option<String>,
    #[serde(rename = "trackingNumber", default)]
    pub tracking_number: Option<String>,
    #[serde(default)]
    pub items: Vec<CartLine>,
}

/// NewOrder: an order header ready to be inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOrder {
    pub user_id: UserId,
    pub address_id: AddressId,
    pub payment_id: Option<String>,
    pub tracking_number: Option<String>,
    pub total: Decimal,
    pub status: String,
}

/// OrderItem: a persisted order line with snapshot name and price.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrderItem {
    #[serde(rename = "itemID")]
    pub item_id: OrderItemId,
    #[serde(rename = "orderID")]
    pub order_id: OrderId,
    #[serde(rename = "productID")]
    pub product_id: Option<i64>,
    pub name: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
    pub quantity: i32,
}

/// Order: the order header together with its items.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Order {
    #[serde(rename = "orderID")]
    pub order_id: OrderId,
    #[serde(rename = "userID")]
    pub user_id: UserId,
    #[serde(rename = "addressID")]
    pub address_id: AddressId,
    #[serde(rename = "paymentID")]
    pub payment_id: Option<String>,
    #[serde(with = "rust_decimal::serde::float")]
    pub total: Decimal,
    pub status: String,
    #[serde(rename = "created_at")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "trackingNumber")]
    pub tracking_number: Option<String>,
    #[serde(default)]
    pub items: Vec<OrderItem>,
}

/// PlacedOrder: confirmation returned after a successful checkout.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlacedOrder {
    #[serde(rename = "orderID")]
    pub order_id: OrderId,
    #[serde(with = "rust_decimal::serde::float")]
    pub total: Decimal,
}
