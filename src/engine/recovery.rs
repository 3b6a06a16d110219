//! Startup recovery of the ticket mapping from the terminal's comment tags.

use std::fmt;

use tracing::info;

use crate::broker::{Broker, BrokerResult};

use super::ticket_mapper::{parse_ticket_tag, TaggedItem, TicketMapper};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub positions_scanned: usize,
    pub orders_scanned: usize,
    pub confirmed: usize,
    pub pending: usize,
    /// Items without a tag, e.g. opened by hand
    pub untagged: usize,
}

impl RecoveryReport {
    pub fn recovered(&self) -> usize {
        self.confirmed + self.pending
    }
}

impl fmt::Display for RecoveryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} confirmed, {} pending, {} untagged ({} positions, {} orders scanned)",
            self.confirmed, self.pending, self.untagged, self.positions_scanned, self.orders_scanned
        )
    }
}

/// Rebuilds a [`TicketMapper`] from broker-visible state.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryScanner;

impl RecoveryScanner {
    /// Clear `mapper` and repopulate it from open positions and pending orders.
    pub async fn run<B: Broker + ?Sized>(
        &self,
        broker: &B,
        mapper: &mut TicketMapper,
    ) -> BrokerResult<RecoveryReport> {
        let positions = broker.positions().await?;
        let orders = broker.pending_orders().await?;

        let position_items: Vec<TaggedItem<'_>> = positions
            .iter()
            .map(|p| TaggedItem {
                local_ticket: p.ticket,
                comment: &p.comment,
            })
            .collect();
        let order_items: Vec<TaggedItem<'_>> = orders
            .iter()
            .map(|o| TaggedItem {
                local_ticket: o.ticket,
                comment: &o.comment,
            })
            .collect();

        mapper.recover_from_positions(&position_items, &order_items);

        let tagged = position_items
            .iter()
            .chain(order_items.iter())
            .filter(|item| parse_ticket_tag(item.comment).is_some())
            .count();
        let report = RecoveryReport {
            positions_scanned: positions.len(),
            orders_scanned: orders.len(),
            confirmed: mapper.active_len(),
            pending: mapper.pending_len(),
            untagged: positions.len() + orders.len() - tagged,
        };

        info!(
            broker = broker.name(),
            confirmed = report.confirmed,
            pending = report.pending,
            untagged = report.untagged,
            "Ticket mapping recovered"
        );
        Ok(report)
    }
}
