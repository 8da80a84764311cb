// Tenant directory read model, rebuilt from the event store on startup.

use courier_types::{DomainEvent, EventEnvelope};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    Active,
    Suspended,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantEntry {
    pub tenant_id: String,
    pub name: String,
    pub plan: String,
    pub status: TenantStatus,
    /// Last event applied to this entry
    pub last_event_id: String,
}

#[derive(Default)]
pub struct TenantDirectory {
    tenants: RwLock<HashMap<String, TenantEntry>>,
}

impl TenantDirectory {
    /// Fold one event into the directory. Non-tenant events are ignored.
    pub async fn apply(&self, envelope: &EventEnvelope) -> anyhow::Result<()> {
        let Some(event) = DomainEvent::from_envelope(envelope)? else {
            debug!(event_type = %envelope.event_type, "Unknown event type - skipped");
            return Ok(());
        };

        let mut tenants = self.tenants.write().await;
        match event {
            DomainEvent::TenantCreated(created) => {
                tenants.insert(
                    created.tenant_id.clone(),
                    TenantEntry {
                        tenant_id: created.tenant_id,
                        name: created.name,
                        plan: created.plan,
                        status: TenantStatus::Active,
                        last_event_id: envelope.id.clone(),
                    },
                );
            }
            DomainEvent::TenantUpdated(updated) => {
                let Some(entry) = tenants.get_mut(&updated.tenant_id) else {
                    warn!(tenant_id = %updated.tenant_id, "Update for unknown tenant");
                    return Ok(());
                };
                if let Some(name) = updated.name {
                    entry.name = name;
                }
                if let Some(plan) = updated.plan {
                    entry.plan = plan;
                }
                entry.last_event_id = envelope.id.clone();
            }
            DomainEvent::TenantSuspended(e) => {
                set_status(&mut tenants, &e.tenant_id, TenantStatus::Suspended, envelope)
            }
            DomainEvent::TenantReactivated(e) => {
                set_status(&mut tenants, &e.tenant_id, TenantStatus::Active, envelope)
            }
            DomainEvent::TenantDeleted(e) if e.hard_delete => {
                tenants.remove(&e.tenant_id);
            }
            DomainEvent::TenantDeleted(e) => {
                set_status(&mut tenants, &e.tenant_id, TenantStatus::Deleted, envelope)
            }
            _ => {}
        }
        Ok(())
    }

    pub async fn get(&self, tenant_id: &str) -> Option<TenantEntry> {
        self.tenants.read().await.get(tenant_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.tenants.read().await.len()
    }

    /// All entries, sorted by tenant id
    pub async fn snapshot(&self) -> Vec<TenantEntry> {
        let mut entries: Vec<TenantEntry> = self.tenants.read().await.values().cloned().collect();
        entries.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        entries
    }
}

fn set_status(
    tenants: &mut HashMap<String, TenantEntry>,
    tenant_id: &str,
    status: TenantStatus,
    envelope: &EventEnvelope,
) {
    match tenants.get_mut(tenant_id) {
        Some(entry) => {
            entry.status = status;
            entry.last_event_id = envelope.id.clone();
        }
        None => warn!(tenant_id = %tenant_id, event_type = %envelope.event_type, "Event for unknown tenant"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_types::{TenantCreated, TenantDeleted, TenantSuspended, TenantUpdated};

    fn envelope(event: DomainEvent, id: &str) -> EventEnvelope {
        event.into_envelope().unwrap().with_id(id)
    }

    fn created(tenant_id: &str) -> EventEnvelope {
        envelope(
            DomainEvent::TenantCreated(TenantCreated {
                tenant_id: tenant_id.to_string(),
                name: "Acme".to_string(),
                plan: "starter".to_string(),
                owner_email: None,
            }),
            "e1",
        )
    }

    #[tokio::test]
    async fn test_lifecycle_folds_into_entry() {
        let directory = TenantDirectory::default();
        directory.apply(&created("t1")).await.unwrap();
        directory
            .apply(&envelope(
                DomainEvent::TenantUpdated(TenantUpdated {
                    tenant_id: "t1".to_string(),
                    name: None,
                    plan: Some("pro".to_string()),
                }),
                "e2",
            ))
            .await
            .unwrap();
        directory
            .apply(&envelope(
                DomainEvent::TenantSuspended(TenantSuspended {
                    tenant_id: "t1".to_string(),
                    reason: "unpaid".to_string(),
                }),
                "e3",
            ))
            .await
            .unwrap();

        let entry = directory.get("t1").await.unwrap();
        assert_eq!(entry.name, "Acme");
        assert_eq!(entry.plan, "pro");
        assert_eq!(entry.status, TenantStatus::Suspended);
        assert_eq!(entry.last_event_id, "e3");
    }

    #[tokio::test]
    async fn test_hard_delete_removes_entry() {
        let directory = TenantDirectory::default();
        directory.apply(&created("t1")).await.unwrap();
        directory.apply(&created("t2")).await.unwrap();
        directory
            .apply(&envelope(
                DomainEvent::TenantDeleted(TenantDeleted {
                    tenant_id: "t1".to_string(),
                    hard_delete: true,
                }),
                "e4",
            ))
            .await
            .unwrap();

        assert!(directory.get("t1").await.is_none());
        assert_eq!(directory.len().await, 1);
    }

    #[tokio::test]
    async fn test_unknown_and_foreign_events_are_ignored() {
        let directory = TenantDirectory::default();
        let unknown = EventEnvelope::from_value("tenant.renamed", serde_json::json!({}));
        directory.apply(&unknown).await.unwrap();
        assert_eq!(directory.len().await, 0);
    }

    #[tokio::test]
    async fn test_malformed_known_payload_is_an_error() {
        let directory = TenantDirectory::default();
        let bad = EventEnvelope::from_value("tenant.created", serde_json::json!({"name": 7}));
        assert!(directory.apply(&bad).await.is_err());
    }
}
