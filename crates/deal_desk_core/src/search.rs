//! crates/deal_desk_core/src/search.rs
//!
//! Derived search text for deals. Recomputed in application code right after any
//! mutation that touches a searchable field.

use crate::domain::{Contact, Deal};

pub fn project(deal: &Deal, contact: &Contact) -> String {
    let analysis = deal.analysis.as_ref();
    [
        contact.display_name(),
        Some(contact.provider_id.clone()),
        deal.last_message_text.clone(),
        deal.note.clone(),
        analysis.map(|a| a.summary.clone()),
        analysis.map(|a| a.intent.clone()),
    ]
    .into_iter()
    .flatten()
    .map(|part| part.trim().to_lowercase())
    .filter(|part| !part.is_empty())
    .collect::<Vec<_>>()
    .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn projection_lowercases_and_skips_empty_parts() {
        let now = Utc::now();
        let contact = Contact {
            id: Uuid::new_v4(),
            provider_id: "PSID-1".into(),
            first_name: Some("Иван".into()),
            last_name: None,
            created_at: now,
            updated_at: now,
        };
        let mut deal = Deal::open(contact.id, Uuid::new_v4(), now);
        deal.last_message_text = Some("Сколько стоит?".into());
        deal.note = Some("   ".into());
        assert_eq!(project(&deal, &contact), "иван psid-1 сколько стоит?");
    }
}
