//! A small order workflow: place, charge, confirm or expire.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use sagabus_core::{CorrelationId, HandlerError};
use sagabus_messages::{Invocation, Message, MessageEnvelope, Saga, SagaDeclaration, Transition};

pub const SERVICE: &str = "shop";
pub const EXCHANGE: &str = "shop";
pub const CONFIRMED_TOPIC: &str = "orders.confirmed";
pub const EXPIRED_TOPIC: &str = "orders.expired";

/// Charges above this are declined by the payment handler.
pub const CARD_LIMIT: u64 = 1_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub order_id: u64,
    pub total: u64,
}

impl Message for OrderPlaced {
    fn message_type() -> &'static str {
        "shop.OrderPlaced"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeCard {
    pub order_id: u64,
    pub amount: u64,
}

impl Message for ChargeCard {
    fn message_type() -> &'static str {
        "shop.ChargeCard"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentReceived {
    pub order_id: u64,
    pub amount: u64,
}

impl Message for PaymentReceived {
    fn message_type() -> &'static str {
        "shop.PaymentReceived"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderConfirmed {
    pub order_id: u64,
}

impl Message for OrderConfirmed {
    fn message_type() -> &'static str {
        "shop.OrderConfirmed"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderExpired {
    pub order_id: u64,
}

impl Message for OrderExpired {
    fn message_type() -> &'static str {
        "shop.OrderExpired"
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct OrderState {
    pub order_id: u64,
    pub total: u64,
    pub paid: u64,
}

pub struct OrderSaga {
    pub payment_window: Duration,
}

impl Saga for OrderSaga {
    type State = OrderState;

    fn declare(&self) -> SagaDeclaration {
        SagaDeclaration::new("order")
            .started_by::<OrderPlaced>()
            .handles::<PaymentReceived>()
            .with_timeout(self.payment_window)
    }

    fn correlate(&self, envelope: &MessageEnvelope) -> Option<CorrelationId> {
        envelope
            .payload()
            .get("order_id")
            .and_then(|v| v.as_u64())
            .map(CorrelationId::from)
    }

    fn handle(
        &self,
        mut state: OrderState,
        envelope: &MessageEnvelope,
        invocation: &mut Invocation,
    ) -> Result<Transition<OrderState>, HandlerError> {
        if envelope.is::<OrderPlaced>() {
            let order = envelope.decode::<OrderPlaced>()?;
            state.order_id = order.order_id;
            state.total = order.total;
            invocation.send(
                SERVICE,
                &ChargeCard {
                    order_id: order.order_id,
                    amount: order.total,
                },
            )?;
            return Ok(Transition::next(state));
        }

        let payment = envelope.decode::<PaymentReceived>()?;
        state.paid += payment.amount;
        if state.paid < state.total {
            return Ok(Transition::next(state));
        }
        invocation.publish(
            EXCHANGE,
            CONFIRMED_TOPIC,
            &OrderConfirmed {
                order_id: state.order_id,
            },
        )?;
        Ok(Transition::complete(state))
    }

    fn timeout(
        &self,
        state: OrderState,
        invocation: &mut Invocation,
    ) -> Result<Transition<OrderState>, HandlerError> {
        invocation.publish(
            EXCHANGE,
            EXPIRED_TOPIC,
            &OrderExpired {
                order_id: state.order_id,
            },
        )?;
        Ok(Transition::complete(state))
    }
}

/// Payment service stand-in: replies with the charged amount.
pub fn charge_card(invocation: &mut Invocation, charge: ChargeCard) -> Result<(), HandlerError> {
    if charge.amount > CARD_LIMIT {
        return Err(HandlerError::rejected(format!(
            "charge of {} exceeds card limit",
            charge.amount
        )));
    }
    invocation.reply(&PaymentReceived {
        order_id: charge.order_id,
        amount: charge.amount,
    })
}
