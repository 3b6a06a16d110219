//! Master ticket -> local ticket associations.
//!
//! Nothing here is persisted directly. The durable copy of the mapping is the
//! comment tag written on every local position and order (`M<ticket>` or
//! `P<ticket>`), re-read on startup by [`TicketMapper::recover_from_positions`].

use std::collections::HashMap;

use thiserror::Error;
use tracing::warn;

const MARKET_TAG: char = 'M';
const PENDING_TAG: char = 'P';

/// Broker comment fields are short; a tag never exceeds this.
pub const MAX_COMMENT_LEN: usize = 21;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("master ticket {remote} already mapped to local ticket {existing}")]
    DuplicateMapping { remote: u64, existing: u64 },
}

/// Correlation tag parsed from a broker comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TicketTag {
    pub remote_ticket: u64,
    pub is_pending: bool,
}

/// Comment for a position that mirrors master ticket `remote`.
pub fn build_market_comment(remote: u64) -> String {
    format!("{}{}", MARKET_TAG, remote)
}

/// Comment for a pending order placed on behalf of master ticket `remote`.
pub fn build_pending_comment(remote: u64) -> String {
    format!("{}{}", PENDING_TAG, remote)
}

/// Parse an `M<ticket>` / `P<ticket>` tag.
///
/// Brokers append their own text to comments (`"M123 [sl]"`, legacy
/// `"M123#from 99"`), so everything from the first space or `#` is ignored.
pub fn parse_ticket_tag(comment: &str) -> Option<TicketTag> {
    let tag = comment
        .split(|c: char| c == ' ' || c == '#')
        .next()
        .unwrap_or_default();

    let mut chars = tag.chars();
    let is_pending = match chars.next()? {
        MARKET_TAG => false,
        PENDING_TAG => true,
        _ => return None,
    };

    let digits = chars.as_str();
    if tag.len() > MAX_COMMENT_LEN
        || digits.is_empty()
        || !digits.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    let remote_ticket = digits.parse::<u64>().ok()?;

    Some(TicketTag {
        remote_ticket,
        is_pending,
    })
}

/// A local item seen on the terminal during recovery.
#[derive(Debug, Clone, Copy)]
pub struct TaggedItem<'a> {
    pub local_ticket: u64,
    pub comment: &'a str,
}

/// Confirmed and pending ticket tables.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TicketMapper {
    active: HashMap<u64, u64>,
    pending: HashMap<u64, u64>,
}

impl TicketMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_mapping(&mut self, remote: u64, local: u64) -> Result<(), MappingError> {
        if let Some(existing) = self.active.get(&remote) {
            return Err(MappingError::DuplicateMapping {
                remote,
                existing: *existing,
            });
        }
        self.active.insert(remote, local);
        Ok(())
    }

    pub fn get_local(&self, remote: u64) -> Option<u64> {
        self.active.get(&remote).copied()
    }

    /// Idempotent.
    pub fn remove_mapping(&mut self, remote: u64) -> Option<u64> {
        self.active.remove(&remote)
    }

    pub fn add_pending(&mut self, remote: u64, pending_ticket: u64) -> Result<(), MappingError> {
        if let Some(existing) = self.pending.get(&remote) {
            return Err(MappingError::DuplicateMapping {
                remote,
                existing: *existing,
            });
        }
        self.pending.insert(remote, pending_ticket);
        Ok(())
    }

    pub fn get_pending(&self, remote: u64) -> Option<u64> {
        self.pending.get(&remote).copied()
    }

    /// Idempotent.
    pub fn remove_pending(&mut self, remote: u64) -> Option<u64> {
        self.pending.remove(&remote)
    }

    /// Master ticket owning a pending local order.
    pub fn remote_for_pending(&self, pending_ticket: u64) -> Option<u64> {
        self.pending
            .iter()
            .find(|(_, local)| **local == pending_ticket)
            .map(|(remote, _)| *remote)
    }

    /// Move a filled pending order into the confirmed table.
    ///
    /// Returns the master ticket, or `None` if `pending_ticket` is not tracked.
    /// A stale confirmed entry for the same master ticket is replaced.
    pub fn promote_pending(&mut self, pending_ticket: u64, position_ticket: u64) -> Option<u64> {
        let remote = self.remote_for_pending(pending_ticket)?;
        self.pending.remove(&remote);
        if let Some(previous) = self.active.insert(remote, position_ticket) {
            warn!(
                remote = remote,
                previous = previous,
                local = position_ticket,
                "Replaced confirmed mapping on pending fill"
            );
        }
        Some(remote)
    }

    /// Master tickets with a working pending order, paired with the order ticket.
    pub fn pending_entries(&self) -> Vec<(u64, u64)> {
        let mut entries: Vec<_> = self.pending.iter().map(|(r, l)| (*r, *l)).collect();
        entries.sort_unstable();
        entries
    }

    pub fn active_entries(&self) -> Vec<(u64, u64)> {
        let mut entries: Vec<_> = self.active.iter().map(|(r, l)| (*r, *l)).collect();
        entries.sort_unstable();
        entries
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.active.clear();
        self.pending.clear();
    }

    /// Rebuild both tables from the terminal's open positions and pending orders.
    ///
    /// Items are placed by where they were found: a filled order keeps its
    /// `P` tag on platforms that reuse the order ticket, but it is a position
    /// now. Untagged items are left alone. Returns the number recovered.
    pub fn recover_from_positions(
        &mut self,
        positions: &[TaggedItem<'_>],
        pending_orders: &[TaggedItem<'_>],
    ) -> usize {
        self.clear();
        let mut recovered = 0;

        for item in positions {
            let Some(tag) = parse_ticket_tag(item.comment) else {
                continue;
            };
            match self.add_mapping(tag.remote_ticket, item.local_ticket) {
                Ok(()) => recovered += 1,
                Err(e) => warn!(local = item.local_ticket, error = %e, "Skipping duplicate position tag"),
            }
        }

        for item in pending_orders {
            let Some(tag) = parse_ticket_tag(item.comment) else {
                continue;
            };
            match self.add_pending(tag.remote_ticket, item.local_ticket) {
                Ok(()) => recovered += 1,
                Err(e) => warn!(local = item.local_ticket, error = %e, "Skipping duplicate order tag"),
            }
        }

        recovered
    }
}
