//! Order intake and the read paths shared by the REST handlers and the
//! in-process device backend.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::engine::queue::enqueue_order;
use crate::error::AppError;
use crate::models::actor::{Actor, ActorRole};
use crate::models::offer::AssignmentOffer;
use crate::models::order::{DeliveryTarget, LineItem, Order, PaymentMethod};
use crate::state::AppState;

#[derive(Debug, Clone, Deserialize)]
pub struct NewOrder {
    pub items: Vec<LineItem>,
    pub delivery: DeliveryTarget,
    pub payment_method: PaymentMethod,
    #[serde(default)]
    pub delivery_fee: Option<Decimal>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiderOrderScope {
    /// Orders currently offered to the rider and awaiting a decision.
    #[default]
    Available,
    /// Orders the rider has accepted and not yet finished.
    Active,
}

fn validate(request: &NewOrder) -> Result<(), AppError> {
    if request.items.is_empty() {
        return Err(AppError::BadRequest("order needs at least one item".to_string()));
    }
    for item in &request.items {
        if item.name.trim().is_empty() {
            return Err(AppError::BadRequest("item name cannot be empty".to_string()));
        }
        if item.quantity == 0 {
            return Err(AppError::BadRequest(format!(
                "quantity of {} must be at least 1",
                item.name
            )));
        }
        if item.unit_price.is_sign_negative() {
            return Err(AppError::BadRequest(format!(
                "unit price of {} cannot be negative",
                item.name
            )));
        }
    }
    if !request.delivery.location.is_valid() {
        return Err(AppError::BadRequest("delivery location out of range".to_string()));
    }
    if request.delivery_fee.is_some_and(|fee| fee.is_sign_negative()) {
        return Err(AppError::BadRequest("delivery fee cannot be negative".to_string()));
    }
    Ok(())
}

/// Stores a new pending order for `actor` and queues it for dispatch.
pub async fn place_order(
    state: &AppState,
    actor: &Actor,
    request: NewOrder,
) -> Result<Order, AppError> {
    if actor.role != ActorRole::Customer {
        return Err(AppError::Forbidden("only customers place orders".to_string()));
    }
    validate(&request)?;

    let fee = request
        .delivery_fee
        .unwrap_or(state.settings.default_delivery_fee);
    let order = Order::new(
        actor.id,
        request.items,
        request.delivery,
        request.payment_method,
        fee,
        Utc::now(),
    )?;

    state.orders.insert(order.id, order.clone());
    enqueue_order(state, order.id).await?;

    info!(
        order_id = %order.id,
        customer_id = %actor.id,
        total = %order.payment.total,
        "order placed"
    );

    Ok(order)
}

pub fn order_snapshot(state: &AppState, actor: &Actor, order_id: Uuid) -> Result<Order, AppError> {
    let order = state
        .orders
        .get(&order_id)
        .map(|order| order.clone())
        .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))?;

    // The candidate rider of a pending offer sees the order before accepting.
    let offered_to_actor = actor.role == ActorRole::Rider
        && state
            .offers
            .get(&order_id)
            .and_then(|ledger| ledger.pending().map(|offer| offer.rider_id == actor.id))
            .unwrap_or(false);

    if order.is_visible_to(actor) || offered_to_actor {
        Ok(order)
    } else {
        Err(AppError::Forbidden(format!("order {order_id} is not visible to this actor")))
    }
}

/// Latest offer made for `order_id`, whatever its outcome.
pub fn current_offer(
    state: &AppState,
    actor: &Actor,
    order_id: Uuid,
) -> Result<AssignmentOffer, AppError> {
    let offer = state
        .offers
        .get(&order_id)
        .and_then(|ledger| ledger.current().cloned())
        .ok_or_else(|| AppError::NotFound(format!("no offer for order {order_id}")))?;

    let visible = match actor.role {
        ActorRole::Operator | ActorRole::System => true,
        ActorRole::Rider => offer.rider_id == actor.id,
        ActorRole::Customer => state
            .orders
            .get(&order_id)
            .is_some_and(|order| order.customer_id == actor.id),
    };

    if visible {
        Ok(offer)
    } else {
        Err(AppError::Forbidden(format!("offer for order {order_id} is not visible to this actor")))
    }
}

pub fn rider_orders(
    state: &AppState,
    actor: &Actor,
    rider_id: Uuid,
    scope: RiderOrderScope,
) -> Result<Vec<Order>, AppError> {
    let allowed = match actor.role {
        ActorRole::Operator | ActorRole::System => true,
        ActorRole::Rider => actor.id == rider_id,
        ActorRole::Customer => false,
    };
    if !allowed {
        return Err(AppError::Forbidden("riders may only list their own orders".to_string()));
    }
    if !state.riders.contains_key(&rider_id) {
        return Err(AppError::NotFound(format!("rider {rider_id} not found")));
    }

    let mut orders: Vec<Order> = match scope {
        RiderOrderScope::Available => {
            let offered: Vec<Uuid> = state
                .offers
                .iter()
                .filter_map(|ledger| {
                    ledger
                        .pending()
                        .filter(|offer| offer.rider_id == rider_id)
                        .map(|offer| offer.order_id)
                })
                .collect();
            offered
                .iter()
                .filter_map(|order_id| state.orders.get(order_id).map(|order| order.clone()))
                .collect()
        }
        RiderOrderScope::Active => state
            .orders
            .iter()
            .filter(|order| order.rider_id == Some(rider_id) && order.status.is_active_delivery())
            .map(|order| order.value().clone())
            .collect(),
    };

    orders.sort_by_key(|order| order.created_at);
    Ok(orders)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchSettings;
    use crate::models::rider::GeoPoint;

    fn request() -> NewOrder {
        NewOrder {
            items: vec![
                LineItem {
                    name: "6kg cylinder refill".to_string(),
                    quantity: 1,
                    unit_price: Decimal::from(30),
                },
                LineItem {
                    name: "hose".to_string(),
                    quantity: 1,
                    unit_price: Decimal::from(15),
                },
            ],
            delivery: DeliveryTarget {
                location: GeoPoint {
                    lat: 5.6037,
                    lng: -0.187,
                },
                address: "Osu, Accra".to_string(),
            },
            payment_method: PaymentMethod::Cash,
            delivery_fee: None,
        }
    }

    #[tokio::test]
    async fn placed_order_uses_default_fee_and_is_queued() {
        let (state, mut rx) = AppState::new(DispatchSettings::default(), 8, 8);
        let customer = Actor::customer(Uuid::new_v4());

        let order = place_order(&state, &customer, request()).await.unwrap();

        assert_eq!(order.payment.subtotal, Decimal::from(45));
        assert_eq!(order.payment.total, Decimal::from(55));
        assert_eq!(rx.recv().await, Some(order.id));
    }

    #[tokio::test]
    async fn riders_cannot_place_orders() {
        let (state, _rx) = AppState::new(DispatchSettings::default(), 8, 8);
        let rider = Actor::rider(Uuid::new_v4());

        let err = place_order(&state, &rider, request()).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn zero_quantity_is_rejected() {
        let (state, _rx) = AppState::new(DispatchSettings::default(), 8, 8);
        let customer = Actor::customer(Uuid::new_v4());
        let mut bad = request();
        bad.items[0].quantity = 0;

        let err = place_order(&state, &customer, bad).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
        assert!(state.orders.is_empty());
    }

    #[tokio::test]
    async fn overflowing_total_is_a_bad_request() {
        let (state, mut rx) = AppState::new(DispatchSettings::default(), 8, 8);
        let customer = Actor::customer(Uuid::new_v4());
        let mut bad = request();
        bad.items[0].quantity = 2;
        bad.items[0].unit_price = Decimal::MAX;

        let err = place_order(&state, &customer, bad).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
        assert!(state.orders.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn other_customers_cannot_read_the_order() {
        let (state, _rx) = AppState::new(DispatchSettings::default(), 8, 8);
        let owner = Actor::customer(Uuid::new_v4());
        let order = place_order(&state, &owner, request()).await.unwrap();

        assert!(order_snapshot(&state, &owner, order.id).is_ok());

        let stranger = Actor::customer(Uuid::new_v4());
        assert!(matches!(
            order_snapshot(&state, &stranger, order.id),
            Err(AppError::Forbidden(_))
        ));
    }
}
