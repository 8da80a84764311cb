// ============================================================================
// Typed Domain Event Dispatch
// ============================================================================
//
// Consumers match on `DomainEvent` instead of switching on type strings:
//
//   match DomainEvent::from_envelope(&envelope)? {
//       Some(DomainEvent::TenantCreated(t)) => directory.insert(t),
//       Some(other) => debug!(event_type = %other.event_type(), "ignored"),
//       None => warn!(event_type = %envelope.event_type, "unknown event type"),
//   }
//
// Unknown types decode to `None` and are never fatal. A known type whose
// payload does not match its shape is an error.
//
// ============================================================================

use crate::envelope::{EnvelopeError, EventEnvelope};
use crate::event_type::EventType;
use crate::payloads::*;
use serde::de::DeserializeOwned;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    TenantCreated(TenantCreated),
    TenantUpdated(TenantUpdated),
    TenantSuspended(TenantSuspended),
    TenantReactivated(TenantReactivated),
    TenantDeleted(TenantDeleted),
    InvoiceCreated(InvoiceCreated),
    InvoicePaid(InvoicePaid),
    InvoiceOverdue(InvoiceOverdue),
    InvoiceVoided(InvoiceVoided),
    PaymentFailed(PaymentFailed),
    SubscriptionChanged(SubscriptionChanged),
    UserCreated(UserCreated),
    UserUpdated(UserUpdated),
    UserDeleted(UserDeleted),
    UserInvited(UserInvited),
    UserRoleChanged(UserRoleChanged),
    NotificationRequested(NotificationRequested),
    NotificationSent(NotificationSent),
    NotificationFailed(NotificationFailed),
}

impl DomainEvent {
    /// Decode the envelope payload according to its type
    pub fn from_envelope(envelope: &EventEnvelope) -> Result<Option<Self>, EnvelopeError> {
        let Some(event_type) = EventType::parse(&envelope.event_type) else {
            return Ok(None);
        };

        let event = match event_type {
            EventType::TenantCreated => Self::TenantCreated(decode(envelope)?),
            EventType::TenantUpdated => Self::TenantUpdated(decode(envelope)?),
            EventType::TenantSuspended => Self::TenantSuspended(decode(envelope)?),
            EventType::TenantReactivated => Self::TenantReactivated(decode(envelope)?),
            EventType::TenantDeleted => Self::TenantDeleted(decode(envelope)?),
            EventType::InvoiceCreated => Self::InvoiceCreated(decode(envelope)?),
            EventType::InvoicePaid => Self::InvoicePaid(decode(envelope)?),
            EventType::InvoiceOverdue => Self::InvoiceOverdue(decode(envelope)?),
            EventType::InvoiceVoided => Self::InvoiceVoided(decode(envelope)?),
            EventType::PaymentFailed => Self::PaymentFailed(decode(envelope)?),
            EventType::SubscriptionChanged => Self::SubscriptionChanged(decode(envelope)?),
            EventType::UserCreated => Self::UserCreated(decode(envelope)?),
            EventType::UserUpdated => Self::UserUpdated(decode(envelope)?),
            EventType::UserDeleted => Self::UserDeleted(decode(envelope)?),
            EventType::UserInvited => Self::UserInvited(decode(envelope)?),
            EventType::UserRoleChanged => Self::UserRoleChanged(decode(envelope)?),
            EventType::NotificationRequested => Self::NotificationRequested(decode(envelope)?),
            EventType::NotificationSent => Self::NotificationSent(decode(envelope)?),
            EventType::NotificationFailed => Self::NotificationFailed(decode(envelope)?),
        };

        Ok(Some(event))
    }

    pub fn event_type(&self) -> EventType {
        match self {
            Self::TenantCreated(_) => EventType::TenantCreated,
            Self::TenantUpdated(_) => EventType::TenantUpdated,
            Self::TenantSuspended(_) => EventType::TenantSuspended,
            Self::TenantReactivated(_) => EventType::TenantReactivated,
            Self::TenantDeleted(_) => EventType::TenantDeleted,
            Self::InvoiceCreated(_) => EventType::InvoiceCreated,
            Self::InvoicePaid(_) => EventType::InvoicePaid,
            Self::InvoiceOverdue(_) => EventType::InvoiceOverdue,
            Self::InvoiceVoided(_) => EventType::InvoiceVoided,
            Self::PaymentFailed(_) => EventType::PaymentFailed,
            Self::SubscriptionChanged(_) => EventType::SubscriptionChanged,
            Self::UserCreated(_) => EventType::UserCreated,
            Self::UserUpdated(_) => EventType::UserUpdated,
            Self::UserDeleted(_) => EventType::UserDeleted,
            Self::UserInvited(_) => EventType::UserInvited,
            Self::UserRoleChanged(_) => EventType::UserRoleChanged,
            Self::NotificationRequested(_) => EventType::NotificationRequested,
            Self::NotificationSent(_) => EventType::NotificationSent,
            Self::NotificationFailed(_) => EventType::NotificationFailed,
        }
    }

    /// Tenant the event belongs to, when its payload names one
    pub fn tenant_id(&self) -> Option<&str> {
        match self {
            Self::TenantCreated(e) => Some(&e.tenant_id),
            Self::TenantUpdated(e) => Some(&e.tenant_id),
            Self::TenantSuspended(e) => Some(&e.tenant_id),
            Self::TenantReactivated(e) => Some(&e.tenant_id),
            Self::TenantDeleted(e) => Some(&e.tenant_id),
            Self::InvoiceCreated(e) => Some(&e.tenant_id),
            Self::InvoicePaid(e) => Some(&e.tenant_id),
            Self::InvoiceOverdue(e) => Some(&e.tenant_id),
            Self::InvoiceVoided(e) => Some(&e.tenant_id),
            Self::PaymentFailed(e) => Some(&e.tenant_id),
            Self::SubscriptionChanged(e) => Some(&e.tenant_id),
            Self::UserCreated(e) => Some(&e.tenant_id),
            Self::UserUpdated(e) => Some(&e.tenant_id),
            Self::UserDeleted(e) => Some(&e.tenant_id),
            Self::UserInvited(e) => Some(&e.tenant_id),
            Self::UserRoleChanged(e) => Some(&e.tenant_id),
            Self::NotificationRequested(_)
            | Self::NotificationSent(_)
            | Self::NotificationFailed(_) => None,
        }
    }

    /// Wrap the payload in a fresh envelope.
    ///
    /// The envelope's `tenantId` is taken from the payload when it has one.
    pub fn into_envelope(self) -> serde_json::Result<EventEnvelope> {
        let event_type = self.event_type();
        let tenant_id = self.tenant_id().map(str::to_string);
        let data = match self {
            Self::TenantCreated(e) => encode(&e)?,
            Self::TenantUpdated(e) => encode(&e)?,
            Self::TenantSuspended(e) => encode(&e)?,
            Self::TenantReactivated(e) => encode(&e)?,
            Self::TenantDeleted(e) => encode(&e)?,
            Self::InvoiceCreated(e) => encode(&e)?,
            Self::InvoicePaid(e) => encode(&e)?,
            Self::InvoiceOverdue(e) => encode(&e)?,
            Self::InvoiceVoided(e) => encode(&e)?,
            Self::PaymentFailed(e) => encode(&e)?,
            Self::SubscriptionChanged(e) => encode(&e)?,
            Self::UserCreated(e) => encode(&e)?,
            Self::UserUpdated(e) => encode(&e)?,
            Self::UserDeleted(e) => encode(&e)?,
            Self::UserInvited(e) => encode(&e)?,
            Self::UserRoleChanged(e) => encode(&e)?,
            Self::NotificationRequested(e) => encode(&e)?,
            Self::NotificationSent(e) => encode(&e)?,
            Self::NotificationFailed(e) => encode(&e)?,
        };

        let envelope = EventEnvelope::from_value(event_type.as_str(), data);
        Ok(match tenant_id {
            Some(tenant_id) => envelope.with_tenant(tenant_id),
            None => envelope,
        })
    }
}

fn decode<T: DeserializeOwned>(envelope: &EventEnvelope) -> Result<T, EnvelopeError> {
    envelope.data_as()
}

fn encode<T: Serialize>(payload: &T) -> serde_json::Result<serde_json::Value> {
    serde_json::to_value(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_known_type_decodes_typed_payload() {
        let envelope = EventEnvelope::from_value(
            "tenant.created",
            json!({"tenantId": "t1", "name": "Acme", "plan": "pro"}),
        );

        let event = DomainEvent::from_envelope(&envelope).unwrap();
        match event {
            Some(DomainEvent::TenantCreated(created)) => {
                assert_eq!(created.tenant_id, "t1");
                assert_eq!(created.plan, "pro");
                assert!(created.owner_email.is_none());
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_is_ignored() {
        let envelope = EventEnvelope::from_value("order.shipped", json!({"anything": true}));
        assert!(DomainEvent::from_envelope(&envelope).unwrap().is_none());
    }

    #[test]
    fn test_malformed_payload_is_an_error() {
        let envelope = EventEnvelope::from_value("invoice.paid", json!({"invoiceId": 7}));
        let err = DomainEvent::from_envelope(&envelope).unwrap_err();
        assert!(matches!(err, EnvelopeError::InvalidPayload { .. }));
        assert!(err.to_string().contains("invoice.paid"));
    }

    #[test]
    fn test_into_envelope_carries_type_and_tenant() {
        let event = DomainEvent::UserRoleChanged(UserRoleChanged {
            user_id: "u1".to_string(),
            tenant_id: "t9".to_string(),
            previous_role: "member".to_string(),
            new_role: "admin".to_string(),
        });

        let envelope = event.clone().into_envelope().unwrap();

        assert_eq!(envelope.event_type, "user.role_changed");
        assert_eq!(envelope.tenant_id.as_deref(), Some("t9"));
        assert_eq!(envelope.data["newRole"], "admin");
        assert_eq!(DomainEvent::from_envelope(&envelope).unwrap(), Some(event));
    }

    #[test]
    fn test_notification_events_are_not_tenant_scoped() {
        let event = DomainEvent::NotificationSent(NotificationSent {
            notification_id: "n1".to_string(),
            channel: NotificationChannel::Sms,
            provider_message_id: None,
        });

        let envelope = event.into_envelope().unwrap();
        assert!(envelope.tenant_id.is_none());
        assert_eq!(envelope.data["channel"], "sms");
    }
}
