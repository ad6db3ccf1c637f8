//! A small shop: price lookups, a cart, and a checkout saga.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use statecraft::{
    Action, ActionRef, AsyncAction, AsyncFailed, AsyncFlowFinished, AsyncSucceeded,
    SagaDefinition, SagaTransition,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Shop {
    pub prices: BTreeMap<String, u64>,
    pub cart: Vec<String>,
    pub last_order: u64,
    pub confirmed: Vec<u64>,
    pub last_error: Option<String>,
}

impl Shop {
    /// Cart total in cents. Items without a known price count as zero.
    pub fn cart_total(&self) -> u64 {
        self.cart
            .iter()
            .filter_map(|sku| self.prices.get(sku))
            .sum()
    }
}

// =============================================================================
// Actions
// =============================================================================

/// Look up the price of `sku`. Cacheable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FetchPrice {
    pub sku: String,
}
impl Action for FetchPrice {}

#[derive(Debug, Clone, PartialEq)]
pub struct PriceQuoted {
    pub sku: String,
    pub cents: u64,
}
impl Action for PriceQuoted {}

#[derive(Debug, Clone, PartialEq)]
pub struct AddToCart {
    pub sku: String,
}
impl Action for AddToCart {}

#[derive(Debug, Clone, PartialEq)]
pub struct PlaceOrder {
    pub order: u64,
    pub total: u64,
}
impl Action for PlaceOrder {}

#[derive(Debug, Clone, PartialEq)]
pub struct ChargeCard {
    pub order: u64,
    pub total: u64,
}
impl Action for ChargeCard {}

#[derive(Debug, Clone, PartialEq)]
pub struct PaymentCaptured {
    pub order: u64,
}
impl Action for PaymentCaptured {}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderConfirmed {
    pub order: u64,
}
impl Action for OrderConfirmed {}

fn catalog(sku: &str) -> Option<u64> {
    match sku {
        "coffee" => Some(450),
        "bagel" => Some(325),
        "juice" => Some(500),
        _ => None,
    }
}

#[async_trait]
impl AsyncAction for FetchPrice {
    type Output = PriceQuoted;

    async fn execute(&self) -> Result<PriceQuoted> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let cents = catalog(&self.sku).ok_or_else(|| anyhow!("unknown sku {}", self.sku))?;
        Ok(PriceQuoted {
            sku: self.sku.clone(),
            cents,
        })
    }
}

#[async_trait]
impl AsyncAction for ChargeCard {
    type Output = PaymentCaptured;

    async fn execute(&self) -> Result<PaymentCaptured> {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if self.total == 0 {
            return Err(anyhow!("refusing to charge an empty order"));
        }
        Ok(PaymentCaptured { order: self.order })
    }
}

// =============================================================================
// Reducer
// =============================================================================

fn quoted(action: &ActionRef) -> Option<&PriceQuoted> {
    if let Some(succeeded) = action.downcast_ref::<AsyncSucceeded>() {
        return succeeded.output.downcast_ref::<PriceQuoted>();
    }
    // A cache hit replays the finished flow instead of its parts.
    action
        .downcast_ref::<AsyncFlowFinished>()
        .and_then(|finished| finished.output())
        .and_then(|output| output.downcast_ref::<PriceQuoted>())
}

pub fn reduce(shop: &Shop, action: &ActionRef) -> Shop {
    let mut next = shop.clone();

    if let Some(quote) = quoted(action) {
        next.prices.insert(quote.sku.clone(), quote.cents);
    } else if let Some(add) = action.downcast_ref::<AddToCart>() {
        next.cart.push(add.sku.clone());
    } else if let Some(place) = action.downcast_ref::<PlaceOrder>() {
        next.last_order = next.last_order.max(place.order);
    } else if let Some(confirmed) = action.downcast_ref::<OrderConfirmed>() {
        if !next.confirmed.contains(&confirmed.order) {
            next.confirmed.push(confirmed.order);
            next.cart.clear();
        }
    } else if let Some(failed) = action.downcast_ref::<AsyncFailed>() {
        next.last_error = Some(failed.error.clone());
    }

    next
}

// =============================================================================
// Checkout saga
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Checkout {
    AwaitingPayment { order: u64, total: u64 },
}

impl Checkout {
    fn order(&self) -> u64 {
        match self {
            Checkout::AwaitingPayment { order, .. } => *order,
        }
    }
}

fn captured(action: &ActionRef) -> Option<&PaymentCaptured> {
    action
        .downcast_ref::<AsyncSucceeded>()?
        .output
        .downcast_ref::<PaymentCaptured>()
}

pub fn checkout_saga() -> SagaDefinition<Checkout> {
    SagaDefinition::new("checkout")
        .start_on(|place: &PlaceOrder| {
            SagaTransition::continue_with(Checkout::AwaitingPayment {
                order: place.order,
                total: place.total,
            })
            .dispatch(ChargeCard {
                order: place.order,
                total: place.total,
            })
        })
        .on_matching(
            |action, state: &Checkout| captured(action).is_some_and(|p| p.order == state.order()),
            |_, instance| {
                SagaTransition::complete()
                    .delay(Duration::from_millis(20))
                    .dispatch(OrderConfirmed {
                        order: instance.state.order(),
                    })
            },
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use statecraft::SagaEngine;
    use statecraft::testing::RecordingSink;

    #[test]
    fn test_reducer_applies_quotes_from_either_shape() {
        let quote = ActionRef::new(PriceQuoted {
            sku: "coffee".into(),
            cents: 450,
        });
        let source = ActionRef::new(FetchPrice { sku: "coffee".into() });
        let succeeded = ActionRef::new(AsyncSucceeded {
            source: source.clone(),
            output: quote,
        });
        let finished = ActionRef::new(AsyncFlowFinished {
            source,
            actions: vec![succeeded.clone()],
        });

        let from_succeeded = reduce(&Shop::default(), &succeeded);
        let from_finished = reduce(&Shop::default(), &finished);

        assert_eq!(from_succeeded.prices.get("coffee"), Some(&450));
        assert_eq!(from_succeeded, from_finished);
    }

    #[test]
    fn test_confirmation_is_idempotent() {
        let mut shop = Shop::default();
        shop.cart.push("bagel".into());

        let confirmed = ActionRef::new(OrderConfirmed { order: 1 });
        let once = reduce(&shop, &confirmed);
        let twice = reduce(&once, &confirmed);

        assert_eq!(once.confirmed, vec![1]);
        assert!(once.cart.is_empty());
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn test_unknown_sku_fails() {
        let err = FetchPrice { sku: "caviar".into() }.execute().await.unwrap_err();
        assert!(err.to_string().contains("caviar"));
    }

    #[tokio::test]
    async fn test_checkout_saga_charges_then_confirms() {
        let engine = SagaEngine::builder().register(checkout_saga()).build().unwrap();
        let sink = RecordingSink::new();

        engine
            .handle(sink.clone(), &ActionRef::new(PlaceOrder { order: 3, total: 775 }))
            .await;
        assert_eq!(engine.instance_count("checkout").unwrap(), 1);

        let payment = ActionRef::new(AsyncSucceeded {
            source: ActionRef::new(ChargeCard { order: 3, total: 775 }),
            output: ActionRef::new(PaymentCaptured { order: 3 }),
        });
        engine.handle(sink.clone(), &payment).await;
        assert_eq!(engine.instance_count("checkout").unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.find::<ChargeCard>(), vec![ChargeCard { order: 3, total: 775 }]);
        assert_eq!(sink.find::<OrderConfirmed>(), vec![OrderConfirmed { order: 3 }]);
    }
}
