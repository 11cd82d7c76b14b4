//! services/api/src/adapters/notifier.rs
//!
//! Manager alerts written to the structured log.

use deal_desk_core::{domain::ManagerAlert, ports::NotificationService};
use tracing::info;

#[derive(Clone, Default)]
pub struct TracingNotifier;

impl NotificationService for TracingNotifier {
    fn notify(&self, alert: ManagerAlert) {
        match alert {
            ManagerAlert::NewDeal {
                deal_id,
                contact_name,
            } => info!(
                target: "deal_desk::alerts",
                alert = "new_deal",
                deal_id = %deal_id,
                contact = contact_name.as_deref().unwrap_or("unknown"),
                "New deal waiting for a manager."
            ),
            ManagerAlert::PriorityDeal { deal_id, excerpt } => info!(
                target: "deal_desk::alerts",
                alert = "priority_deal",
                deal_id = %deal_id,
                excerpt = %excerpt,
                "Deal marked as priority."
            ),
        }
    }
}
