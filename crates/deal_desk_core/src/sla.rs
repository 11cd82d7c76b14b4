//! crates/deal_desk_core/src/sla.rs

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::domain::Deal;

/// Response-time standing of a deal at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlaState {
    pub breached: bool,
    /// Minutes past the threshold; zero unless breached.
    pub overdue_minutes: i64,
    /// The unanswered client message, if any.
    pub waiting_since: Option<DateTime<Utc>>,
}

/// A deal is breached when it is open, its latest client message has no manager
/// response at or after it, and at least `threshold` has elapsed since.
pub fn sla_state(deal: &Deal, now: DateTime<Utc>, threshold: Duration) -> SlaState {
    let waiting_since = match (deal.last_client_message_at, deal.last_manager_response_at) {
        (Some(client), Some(response)) if response >= client => None,
        (Some(client), _) => Some(client),
        (None, _) => None,
    };

    let Some(since) = waiting_since.filter(|_| !deal.status.is_closed()) else {
        return SlaState {
            breached: false,
            overdue_minutes: 0,
            waiting_since,
        };
    };

    let elapsed = now - since;
    if elapsed < threshold {
        return SlaState {
            breached: false,
            overdue_minutes: 0,
            waiting_since,
        };
    }
    SlaState {
        breached: true,
        overdue_minutes: (elapsed - threshold).num_minutes().max(0),
        waiting_since,
    }
}
