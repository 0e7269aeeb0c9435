use crate::db::Database;
use crate::error::{Result, StoreError};
use chrono::{DateTime, Datelike, Utc};
use rusqlite::{OptionalExtension, Row, Transaction, params};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Order lifecycle states.
///
/// The adjacency table in [`OrderStatus::next_states`] is the only
/// definition of legal movement; every mutator goes through
/// [`OrderStore::transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    New,
    Validated,
    InvoiceCreated,
    Paid,
    OrderCreatedExport,
    TrackingIssued,
    Shipped,
    Cancelled,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 8] = [
        Self::New,
        Self::Validated,
        Self::InvoiceCreated,
        Self::Paid,
        Self::OrderCreatedExport,
        Self::TrackingIssued,
        Self::Shipped,
        Self::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Validated => "validated",
            Self::InvoiceCreated => "invoice_created",
            Self::Paid => "paid",
            Self::OrderCreatedExport => "order_created_export",
            Self::TrackingIssued => "tracking_issued",
            Self::Shipped => "shipped",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Shipped | Self::Cancelled)
    }

    fn next_states(self) -> &'static [OrderStatus] {
        match self {
            Self::New => &[Self::Validated, Self::Cancelled],
            Self::Validated => &[Self::InvoiceCreated, Self::Cancelled],
            Self::InvoiceCreated => &[Self::Paid, Self::Cancelled],
            Self::Paid => &[Self::OrderCreatedExport, Self::Cancelled],
            Self::OrderCreatedExport => &[Self::TrackingIssued, Self::Cancelled],
            Self::TrackingIssued => &[Self::Shipped, Self::Cancelled],
            Self::Shipped => &[],
            Self::Cancelled => &[],
        }
    }

    pub fn can_transition(self, to: OrderStatus) -> bool {
        self.next_states().contains(&to)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown order status: {s}")))
    }
}

/// One order line. `unit_price` is always the catalog price captured at
/// order time, never a price quoted in free text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub code: String,
    pub name: String,
    pub quantity: u32,
    pub unit_price: f64,
}

impl OrderItem {
    pub fn line_total(&self) -> f64 {
        self.quantity as f64 * self.unit_price
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Order {
    pub id: Uuid,
    pub order_number: String,
    pub status: OrderStatus,
    pub channel: String,
    pub customer_name: Option<String>,
    pub customer_phone: Option<String>,
    pub customer_address: Option<String>,
    pub customer_email: Option<String>,
    pub chat_user_id: Option<String>,
    pub items: Vec<OrderItem>,
    pub delivery_cost: f64,
    pub total_amount: f64,
    pub invoice_number: Option<String>,
    pub transaction_id: Option<String>,
    pub tracking_number: Option<String>,
    pub exported: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub shipped_at: Option<DateTime<Utc>>,
}

impl Order {
    pub fn items_total(&self) -> f64 {
        self.items.iter().map(OrderItem::line_total).sum()
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewOrder {
    pub channel: String,
    pub customer_name: Option<String>,
    pub customer_phone: Option<String>,
    pub customer_address: Option<String>,
    pub customer_email: Option<String>,
    pub chat_user_id: Option<String>,
    pub items: Vec<OrderItem>,
    pub delivery_cost: f64,
}

/// Fields a collaborator may supply alongside a transition request.
/// Each is only applied by the transition it belongs to, and only when the
/// order does not already carry a value.
#[derive(Debug, Clone, Default)]
pub struct TransitionFields {
    pub transaction_id: Option<String>,
    pub tracking_number: Option<String>,
    pub invoice_number: Option<String>,
}

#[derive(Clone)]
pub struct OrderStore {
    db: Database,
}

impl OrderStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create an order from validated input. Requires at least one item;
    /// `total_amount` is always recomputed from items plus delivery cost.
    pub async fn create(&self, new_order: NewOrder) -> Result<Order> {
        if new_order.items.is_empty() {
            return Err(StoreError::InvalidOrder(
                "an order requires at least one item".to_string(),
            ));
        }
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                let order_number = allocate_order_number(&tx)?;
                let id = Uuid::new_v4();
                let now = Utc::now();
                let items_total: f64 = new_order.items.iter().map(OrderItem::line_total).sum();
                let total_amount = items_total + new_order.delivery_cost;
                let items_json = serde_json::to_string(&new_order.items)?;
                tx.execute(
                    "INSERT INTO orders (
                        id, order_number, status, channel,
                        customer_name, customer_phone, customer_address, customer_email,
                        chat_user_id, items_json, delivery_cost, total_amount,
                        created_at, updated_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)",
                    params![
                        id.to_string(),
                        order_number,
                        OrderStatus::New.as_str(),
                        new_order.channel,
                        new_order.customer_name,
                        new_order.customer_phone,
                        new_order.customer_address,
                        new_order.customer_email,
                        new_order.chat_user_id,
                        items_json,
                        new_order.delivery_cost,
                        total_amount,
                        now.to_rfc3339(),
                    ],
                )?;
                let order = load_order(&tx, id)?.ok_or(StoreError::OrderNotFound(id))?;
                tx.commit()?;
                tracing::info!(
                    order_number = %order.order_number,
                    order_id = %order.id,
                    channel = %order.channel,
                    items = order.items.len(),
                    total_amount = order.total_amount,
                    "order created"
                );
                Ok(order)
            })
            .await
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Order>> {
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                let order = load_order(&tx, id)?;
                tx.commit()?;
                Ok(order)
            })
            .await
    }

    /// Update customer fields and optionally replace items, recomputing
    /// totals. Used when a clarification reply fills in missing data.
    /// `None` fields are left untouched.
    pub async fn update_customer_data(
        &self,
        id: Uuid,
        customer_name: Option<String>,
        customer_phone: Option<String>,
        customer_address: Option<String>,
        items: Option<Vec<OrderItem>>,
        delivery_cost: Option<f64>,
    ) -> Result<Order> {
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                let current = load_order(&tx, id)?.ok_or(StoreError::OrderNotFound(id))?;

                let items = items.unwrap_or(current.items);
                if items.is_empty() {
                    return Err(StoreError::InvalidOrder(
                        "an order requires at least one item".to_string(),
                    ));
                }
                let delivery_cost = delivery_cost.unwrap_or(current.delivery_cost);
                let items_total: f64 = items.iter().map(OrderItem::line_total).sum();
                let total_amount = items_total + delivery_cost;
                let items_json = serde_json::to_string(&items)?;

                tx.execute(
                    "UPDATE orders SET
                        customer_name = COALESCE(?2, customer_name),
                        customer_phone = COALESCE(?3, customer_phone),
                        customer_address = COALESCE(?4, customer_address),
                        items_json = ?5,
                        delivery_cost = ?6,
                        total_amount = ?7,
                        updated_at = ?8
                     WHERE id = ?1",
                    params![
                        id.to_string(),
                        customer_name,
                        customer_phone,
                        customer_address,
                        items_json,
                        delivery_cost,
                        total_amount,
                        Utc::now().to_rfc3339(),
                    ],
                )?;
                let order = load_order(&tx, id)?.ok_or(StoreError::OrderNotFound(id))?;
                tx.commit()?;
                Ok(order)
            })
            .await
    }

    /// The single choke point for status changes. Validates the requested
    /// move against the adjacency table and applies transition-bound side
    /// effects before committing.
    pub async fn transition(
        &self,
        id: Uuid,
        target: OrderStatus,
        fields: TransitionFields,
    ) -> Result<Order> {
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                let current = load_order(&tx, id)?.ok_or(StoreError::OrderNotFound(id))?;

                if !current.status.can_transition(target) {
                    return Err(StoreError::InvalidTransition {
                        from: current.status,
                        to: target,
                    });
                }

                let now = Utc::now();
                match target {
                    OrderStatus::InvoiceCreated => {
                        if current.invoice_number.is_none() {
                            if let Some(invoice_number) = &fields.invoice_number {
                                tx.execute(
                                    "UPDATE orders SET invoice_number = ?2 WHERE id = ?1",
                                    params![id.to_string(), invoice_number],
                                )?;
                            }
                        }
                    }
                    OrderStatus::Paid => {
                        if current.paid_at.is_none() {
                            tx.execute(
                                "UPDATE orders SET paid_at = ?2 WHERE id = ?1",
                                params![id.to_string(), now.to_rfc3339()],
                            )?;
                        }
                        if current.transaction_id.is_none() {
                            if let Some(transaction_id) = &fields.transaction_id {
                                tx.execute(
                                    "UPDATE orders SET transaction_id = ?2 WHERE id = ?1",
                                    params![id.to_string(), transaction_id],
                                )?;
                            }
                        }
                    }
                    OrderStatus::OrderCreatedExport => {
                        tx.execute(
                            "UPDATE orders SET exported = 1 WHERE id = ?1",
                            params![id.to_string()],
                        )?;
                    }
                    OrderStatus::TrackingIssued | OrderStatus::Shipped => {
                        if current.shipped_at.is_none() {
                            tx.execute(
                                "UPDATE orders SET shipped_at = ?2 WHERE id = ?1",
                                params![id.to_string(), now.to_rfc3339()],
                            )?;
                        }
                        if current.tracking_number.is_none() {
                            if let Some(tracking_number) = &fields.tracking_number {
                                tx.execute(
                                    "UPDATE orders SET tracking_number = ?2 WHERE id = ?1",
                                    params![id.to_string(), tracking_number],
                                )?;
                            }
                        }
                    }
                    OrderStatus::New | OrderStatus::Validated | OrderStatus::Cancelled => {}
                }

                tx.execute(
                    "UPDATE orders SET status = ?2, updated_at = ?3 WHERE id = ?1",
                    params![id.to_string(), target.as_str(), now.to_rfc3339()],
                )?;
                let order = load_order(&tx, id)?.ok_or(StoreError::OrderNotFound(id))?;
                tx.commit()?;
                tracing::info!(
                    order_number = %order.order_number,
                    from = %current.status,
                    to = %target,
                    "order status transition"
                );
                Ok(order)
            })
            .await
    }

    /// Allocate an `INV-YYYYMM-NNNN` invoice number from a monthly counter.
    pub async fn allocate_invoice_number(&self) -> Result<String> {
        self.db
            .call(|conn| {
                let tx = conn.transaction()?;
                let month = Utc::now().format("%Y%m").to_string();
                let counter = format!("invoice-{month}");
                tx.execute(
                    "INSERT INTO counters (name, value) VALUES (?1, 0) ON CONFLICT(name) DO NOTHING",
                    params![counter],
                )?;
                tx.execute(
                    "UPDATE counters SET value = value + 1 WHERE name = ?1",
                    params![counter],
                )?;
                let sequence: i64 = tx.query_row(
                    "SELECT value FROM counters WHERE name = ?1",
                    params![counter],
                    |row| row.get(0),
                )?;
                tx.commit()?;
                Ok(format!("INV-{month}-{sequence:04}"))
            })
            .await
    }

    /// Orders currently in any of the given states, oldest first. Used by
    /// startup recovery to find committed-but-unnotified orders.
    pub async fn by_status(&self, statuses: &[OrderStatus], limit: u32) -> Result<Vec<Order>> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        self.db
            .call(move |conn| {
                let placeholders = vec!["?"; statuses.len()].join(", ");
                let sql = format!(
                    "SELECT * FROM orders WHERE status IN ({placeholders})
                     ORDER BY created_at ASC LIMIT {limit}"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(
                    rusqlite::params_from_iter(statuses.iter()),
                    order_from_row,
                )?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row??);
                }
                Ok(out)
            })
            .await
    }

    #[cfg(test)]
    pub(crate) async fn force_status(&self, id: Uuid, status: OrderStatus) -> Result<()> {
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE orders SET status = ?2 WHERE id = ?1",
                    params![id.to_string(), status.as_str()],
                )?;
                Ok(())
            })
            .await
    }
}

fn allocate_order_number(tx: &Transaction<'_>) -> Result<String> {
    let year = Utc::now().year();
    let counter = format!("order-{year}");
    tx.execute(
        "INSERT INTO counters (name, value) VALUES (?1, 0) ON CONFLICT(name) DO NOTHING",
        params![counter],
    )?;
    tx.execute(
        "UPDATE counters SET value = value + 1 WHERE name = ?1",
        params![counter],
    )?;
    let sequence: i64 = tx.query_row(
        "SELECT value FROM counters WHERE name = ?1",
        params![counter],
        |row| row.get(0),
    )?;
    Ok(format!("ORD-{year}-{sequence:04}"))
}

fn load_order(tx: &Transaction<'_>, id: Uuid) -> Result<Option<Order>> {
    let row = tx
        .query_row(
            "SELECT * FROM orders WHERE id = ?1",
            params![id.to_string()],
            order_from_row,
        )
        .optional()?;
    row.transpose()
}

fn order_from_row(row: &Row<'_>) -> rusqlite::Result<Result<Order>> {
    let id: String = row.get("id")?;
    let status: String = row.get("status")?;
    let items_json: String = row.get("items_json")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    let paid_at: Option<String> = row.get("paid_at")?;
    let shipped_at: Option<String> = row.get("shipped_at")?;

    let order = (|| -> Result<Order> {
        Ok(Order {
            id: Uuid::parse_str(&id).map_err(|e| StoreError::Corrupt(e.to_string()))?,
            order_number: row_string(row, "order_number")?,
            status: status.parse()?,
            channel: row_string(row, "channel")?,
            customer_name: row.get("customer_name").map_err(store_err)?,
            customer_phone: row.get("customer_phone").map_err(store_err)?,
            customer_address: row.get("customer_address").map_err(store_err)?,
            customer_email: row.get("customer_email").map_err(store_err)?,
            chat_user_id: row.get("chat_user_id").map_err(store_err)?,
            items: serde_json::from_str(&items_json)?,
            delivery_cost: row.get("delivery_cost").map_err(store_err)?,
            total_amount: row.get("total_amount").map_err(store_err)?,
            invoice_number: row.get("invoice_number").map_err(store_err)?,
            transaction_id: row.get("transaction_id").map_err(store_err)?,
            tracking_number: row.get("tracking_number").map_err(store_err)?,
            exported: row.get::<_, i64>("exported").map_err(store_err)? != 0,
            created_at: parse_timestamp(&created_at)?,
            updated_at: parse_timestamp(&updated_at)?,
            paid_at: paid_at.as_deref().map(parse_timestamp).transpose()?,
            shipped_at: shipped_at.as_deref().map(parse_timestamp).transpose()?,
        })
    })();
    Ok(order)
}

fn row_string(row: &Row<'_>, column: &str) -> Result<String> {
    row.get(column).map_err(store_err)
}

fn store_err(e: rusqlite::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::temp_database;

    fn widget_item(quantity: u32) -> OrderItem {
        OrderItem {
            code: "WX-1001".to_string(),
            name: "Widget".to_string(),
            quantity,
            unit_price: 25.0,
        }
    }

    fn sample_order() -> NewOrder {
        NewOrder {
            channel: "chat".to_string(),
            customer_name: Some("Jane Doe".to_string()),
            customer_phone: Some("+15550100".to_string()),
            customer_address: Some("Springfield, 123 Main St".to_string()),
            items: vec![widget_item(2)],
            delivery_cost: 10.0,
            ..NewOrder::default()
        }
    }

    #[tokio::test]
    async fn create_recomputes_total_and_allocates_numbers() {
        let (db, _dir) = temp_database().await;
        let orders = OrderStore::new(db);

        let first = orders.create(sample_order()).await.expect("create");
        assert_eq!(first.status, OrderStatus::New);
        assert!((first.total_amount - 60.0).abs() < f64::EPSILON);
        assert!(first.order_number.starts_with("ORD-"));

        let second = orders.create(sample_order()).await.expect("create");
        assert_ne!(first.order_number, second.order_number);
    }

    #[tokio::test]
    async fn create_rejects_empty_items() {
        let (db, _dir) = temp_database().await;
        let orders = OrderStore::new(db);

        let mut empty = sample_order();
        empty.items.clear();
        let err = orders.create(empty).await.expect_err("must fail");
        assert!(matches!(err, StoreError::InvalidOrder(_)));
    }

    #[tokio::test]
    async fn adjacency_table_is_enforced_for_every_pair() {
        let (db, _dir) = temp_database().await;
        let orders = OrderStore::new(db);

        for from in OrderStatus::ALL {
            for to in OrderStatus::ALL {
                let order = orders.create(sample_order()).await.expect("create");
                orders.force_status(order.id, from).await.expect("force");

                let result = orders
                    .transition(order.id, to, TransitionFields::default())
                    .await;
                if from.can_transition(to) {
                    let moved = result.expect("valid transition must succeed");
                    assert_eq!(moved.status, to, "{from} -> {to}");
                } else {
                    match result {
                        Err(StoreError::InvalidTransition { from: f, to: t }) => {
                            assert_eq!(f, from);
                            assert_eq!(t, to);
                        }
                        other => panic!("expected InvalidTransition for {from} -> {to}, got {other:?}"),
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn terminal_states_reject_everything() {
        for terminal in [OrderStatus::Shipped, OrderStatus::Cancelled] {
            assert!(terminal.is_terminal());
            for to in OrderStatus::ALL {
                assert!(!terminal.can_transition(to));
            }
        }
    }

    #[tokio::test]
    async fn paid_transition_stamps_payment_fields_once() {
        let (db, _dir) = temp_database().await;
        let orders = OrderStore::new(db);

        let order = orders.create(sample_order()).await.expect("create");
        orders
            .force_status(order.id, OrderStatus::InvoiceCreated)
            .await
            .expect("force");

        let paid = orders
            .transition(
                order.id,
                OrderStatus::Paid,
                TransitionFields {
                    transaction_id: Some("tx-778".to_string()),
                    ..TransitionFields::default()
                },
            )
            .await
            .expect("transition");
        assert_eq!(paid.status, OrderStatus::Paid);
        assert!(paid.paid_at.is_some());
        assert_eq!(paid.transaction_id.as_deref(), Some("tx-778"));
    }

    #[tokio::test]
    async fn export_transition_sets_flag_and_tracking_stamps_shipment() {
        let (db, _dir) = temp_database().await;
        let orders = OrderStore::new(db);

        let order = orders.create(sample_order()).await.expect("create");
        orders
            .force_status(order.id, OrderStatus::Paid)
            .await
            .expect("force");

        let exported = orders
            .transition(
                order.id,
                OrderStatus::OrderCreatedExport,
                TransitionFields::default(),
            )
            .await
            .expect("export transition");
        assert!(exported.exported);

        let tracked = orders
            .transition(
                order.id,
                OrderStatus::TrackingIssued,
                TransitionFields {
                    tracking_number: Some("TRACK-20260806-000001".to_string()),
                    ..TransitionFields::default()
                },
            )
            .await
            .expect("tracking transition");
        assert_eq!(
            tracked.tracking_number.as_deref(),
            Some("TRACK-20260806-000001")
        );
        assert!(tracked.shipped_at.is_some());
    }

    #[tokio::test]
    async fn invoice_transition_stamps_invoice_number() {
        let (db, _dir) = temp_database().await;
        let orders = OrderStore::new(db);

        let order = orders.create(sample_order()).await.expect("create");
        orders
            .force_status(order.id, OrderStatus::Validated)
            .await
            .expect("force");

        let invoiced = orders
            .transition(
                order.id,
                OrderStatus::InvoiceCreated,
                TransitionFields {
                    invoice_number: Some("INV-202608-0001".to_string()),
                    ..TransitionFields::default()
                },
            )
            .await
            .expect("transition");
        assert_eq!(invoiced.invoice_number.as_deref(), Some("INV-202608-0001"));
    }

    #[tokio::test]
    async fn update_customer_data_recomputes_totals() {
        let (db, _dir) = temp_database().await;
        let orders = OrderStore::new(db);

        let order = orders.create(sample_order()).await.expect("create");
        let updated = orders
            .update_customer_data(
                order.id,
                None,
                Some("+15550199".to_string()),
                None,
                Some(vec![widget_item(4)]),
                None,
            )
            .await
            .expect("update");

        assert_eq!(updated.customer_phone.as_deref(), Some("+15550199"));
        assert_eq!(updated.customer_name.as_deref(), Some("Jane Doe"));
        assert_eq!(updated.items[0].quantity, 4);
        assert!((updated.total_amount - 110.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn by_status_returns_matching_orders() {
        let (db, _dir) = temp_database().await;
        let orders = OrderStore::new(db);

        let a = orders.create(sample_order()).await.expect("create");
        let b = orders.create(sample_order()).await.expect("create");
        orders
            .force_status(b.id, OrderStatus::Validated)
            .await
            .expect("force");

        let validated = orders
            .by_status(&[OrderStatus::Validated], 10)
            .await
            .expect("by_status");
        assert_eq!(validated.len(), 1);
        assert_eq!(validated[0].id, b.id);

        let both = orders
            .by_status(&[OrderStatus::New, OrderStatus::Validated], 10)
            .await
            .expect("by_status");
        assert_eq!(both.len(), 2);
        assert_eq!(both[0].id, a.id);
    }
}
