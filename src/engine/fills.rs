//! Pending-order fill detection.
//!
//! Event-reporting brokers hand over fill notifications; polling brokers are
//! asked for each tracked order's state every tick. Both produce the same
//! [`FillResolution`]s, applied identically by the execution engine.

use tracing::{debug, warn};

use crate::broker::{Broker, FillReporting, OrderState};

use super::ticket_mapper::TicketMapper;

/// What happened to a tracked pending order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillResolution {
    Filled { pending_ticket: u64, position_ticket: u64 },
    Cancelled { pending_ticket: u64 },
}

/// Source of pending-fill resolutions, chosen by the broker's reporting style.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillDetector {
    Events,
    Polling,
}

impl FillDetector {
    pub fn for_reporting(reporting: FillReporting) -> Self {
        match reporting {
            FillReporting::Events => Self::Events,
            FillReporting::Polling => Self::Polling,
        }
    }

    /// Resolve tracked pending orders that are no longer working.
    pub async fn detect<B: Broker>(
        &self,
        broker: &mut B,
        mapper: &TicketMapper,
    ) -> Vec<FillResolution> {
        match self {
            Self::Events => Self::from_events(broker, mapper).await,
            Self::Polling => Self::from_polling(broker, mapper).await,
        }
    }

    async fn from_events<B: Broker>(
        broker: &mut B,
        mapper: &TicketMapper,
    ) -> Vec<FillResolution> {
        let mut resolutions: Vec<FillResolution> = broker
            .take_fill_events()
            .into_iter()
            .filter(|event| mapper.remote_for_pending(event.order_ticket).is_some())
            .map(|event| FillResolution::Filled {
                pending_ticket: event.order_ticket,
                position_ticket: event.position_ticket,
            })
            .collect();

        // Deletions and expiries carry no fill event; history tells.
        for (_, pending_ticket) in mapper.pending_entries() {
            if resolutions.iter().any(|r| r.pending_ticket() == pending_ticket) {
                continue;
            }
            if let Ok(OrderState::Cancelled) = broker.order_state(pending_ticket).await {
                resolutions.push(FillResolution::Cancelled { pending_ticket });
            }
        }
        resolutions
    }

    async fn from_polling<B: Broker>(
        broker: &mut B,
        mapper: &TicketMapper,
    ) -> Vec<FillResolution> {
        let mut resolutions = Vec::new();

        for (remote, pending_ticket) in mapper.pending_entries() {
            let state = match broker.order_state(pending_ticket).await {
                Ok(state) => state,
                Err(e) => {
                    warn!(
                        remote = remote,
                        ticket = pending_ticket,
                        error = %e,
                        "Order state check failed"
                    );
                    continue;
                }
            };

            match state {
                OrderState::Pending => {}
                OrderState::Filled { position_ticket } => resolutions.push(FillResolution::Filled {
                    pending_ticket,
                    position_ticket,
                }),
                // Gone without a history record: filled into a position that
                // kept the order ticket.
                OrderState::Missing => resolutions.push(FillResolution::Filled {
                    pending_ticket,
                    position_ticket: pending_ticket,
                }),
                OrderState::Cancelled => {
                    resolutions.push(FillResolution::Cancelled { pending_ticket })
                }
            }
        }

        if !resolutions.is_empty() {
            debug!(count = resolutions.len(), "Pending orders resolved by polling");
        }
        resolutions
    }
}

impl FillResolution {
    pub fn pending_ticket(&self) -> u64 {
        match self {
            Self::Filled { pending_ticket, .. } | Self::Cancelled { pending_ticket } => {
                *pending_ticket
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{PaperBroker, PendingOrderRequest};
    use crate::models::OrderType;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    async fn place(broker: &mut PaperBroker, order_type: OrderType, price: Decimal) -> u64 {
        broker
            .place_pending(&PendingOrderRequest {
                symbol: "EURUSD".to_string(),
                order_type,
                volume: dec!(0.1),
                price,
                stop_loss: None,
                take_profit: None,
                magic: 0,
                comment: "P1".to_string(),
                expiry: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_polling_detects_fill_and_cancel() {
        let mut broker = PaperBroker::new(FillReporting::Polling);
        broker.set_quote("EURUSD", dec!(1.1), dec!(1.10002));
        let filled = place(&mut broker, OrderType::BuyLimit, dec!(1.09)).await;
        let cancelled = place(&mut broker, OrderType::SellLimit, dec!(1.2)).await;
        let working = place(&mut broker, OrderType::BuyStop, dec!(1.3)).await;

        let mut mapper = TicketMapper::new();
        mapper.add_pending(1, filled).unwrap();
        mapper.add_pending(2, cancelled).unwrap();
        mapper.add_pending(3, working).unwrap();

        broker.set_quote("EURUSD", dec!(1.08998), dec!(1.09));
        broker.cancel_pending(cancelled).await.unwrap();

        let detector = FillDetector::for_reporting(broker.fill_reporting());
        let resolutions = detector.detect(&mut broker, &mapper).await;

        assert_eq!(resolutions.len(), 2);
        assert!(resolutions.contains(&FillResolution::Filled {
            pending_ticket: filled,
            position_ticket: filled
        }));
        assert!(resolutions.contains(&FillResolution::Cancelled {
            pending_ticket: cancelled
        }));
    }

    #[tokio::test]
    async fn test_events_ignore_untracked_orders() {
        let mut broker = PaperBroker::new(FillReporting::Events);
        broker.set_quote("EURUSD", dec!(1.1), dec!(1.10002));
        let tracked = place(&mut broker, OrderType::BuyLimit, dec!(1.09)).await;
        let manual = place(&mut broker, OrderType::BuyLimit, dec!(1.095)).await;

        let mut mapper = TicketMapper::new();
        mapper.add_pending(7, tracked).unwrap();

        broker.set_quote("EURUSD", dec!(1.08998), dec!(1.09));
        let resolutions = FillDetector::Events.detect(&mut broker, &mapper).await;

        assert_eq!(resolutions.len(), 1);
        let FillResolution::Filled { pending_ticket, position_ticket } = resolutions[0] else {
            panic!("expected fill");
        };
        assert_eq!(pending_ticket, tracked);
        assert_ne!(position_ticket, tracked);
        assert_ne!(position_ticket, manual);
    }
}
