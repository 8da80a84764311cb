//! Enumerated event types.
//!
//! Each business lifecycle is a flat family of dotted type strings. The
//! string form is the wire contract; the enum is for exhaustive matching.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default topic names, one per event family
pub mod topics {
    pub const TENANT_EVENTS: &str = "tenant-events";
    pub const BILLING_EVENTS: &str = "billing-events";
    pub const USER_EVENTS: &str = "user-events";
    pub const NOTIFICATION_EVENTS: &str = "notification-events";

    pub const ALL: [&str; 4] = [TENANT_EVENTS, BILLING_EVENTS, USER_EVENTS, NOTIFICATION_EVENTS];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventFamily {
    Tenant,
    Billing,
    User,
    Notification,
}

impl EventFamily {
    /// Topic this family is published to by default
    pub fn topic(&self) -> &'static str {
        match self {
            Self::Tenant => topics::TENANT_EVENTS,
            Self::Billing => topics::BILLING_EVENTS,
            Self::User => topics::USER_EVENTS,
            Self::Notification => topics::NOTIFICATION_EVENTS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    // Tenant lifecycle
    TenantCreated,
    TenantUpdated,
    TenantSuspended,
    TenantReactivated,
    TenantDeleted,

    // Billing lifecycle
    InvoiceCreated,
    InvoicePaid,
    InvoiceOverdue,
    InvoiceVoided,
    PaymentFailed,
    SubscriptionChanged,

    // User lifecycle
    UserCreated,
    UserUpdated,
    UserDeleted,
    UserInvited,
    UserRoleChanged,

    // Notification lifecycle
    NotificationRequested,
    NotificationSent,
    NotificationFailed,
}

impl EventType {
    pub const ALL: [EventType; 19] = [
        Self::TenantCreated,
        Self::TenantUpdated,
        Self::TenantSuspended,
        Self::TenantReactivated,
        Self::TenantDeleted,
        Self::InvoiceCreated,
        Self::InvoicePaid,
        Self::InvoiceOverdue,
        Self::InvoiceVoided,
        Self::PaymentFailed,
        Self::SubscriptionChanged,
        Self::UserCreated,
        Self::UserUpdated,
        Self::UserDeleted,
        Self::UserInvited,
        Self::UserRoleChanged,
        Self::NotificationRequested,
        Self::NotificationSent,
        Self::NotificationFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TenantCreated => "tenant.created",
            Self::TenantUpdated => "tenant.updated",
            Self::TenantSuspended => "tenant.suspended",
            Self::TenantReactivated => "tenant.reactivated",
            Self::TenantDeleted => "tenant.deleted",
            Self::InvoiceCreated => "invoice.created",
            Self::InvoicePaid => "invoice.paid",
            Self::InvoiceOverdue => "invoice.overdue",
            Self::InvoiceVoided => "invoice.voided",
            Self::PaymentFailed => "payment.failed",
            Self::SubscriptionChanged => "subscription.changed",
            Self::UserCreated => "user.created",
            Self::UserUpdated => "user.updated",
            Self::UserDeleted => "user.deleted",
            Self::UserInvited => "user.invited",
            Self::UserRoleChanged => "user.role_changed",
            Self::NotificationRequested => "notification.requested",
            Self::NotificationSent => "notification.sent",
            Self::NotificationFailed => "notification.failed",
        }
    }

    /// Look up a wire type string. Unknown types yield `None`.
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == value)
    }

    pub fn family(&self) -> EventFamily {
        match self {
            Self::TenantCreated
            | Self::TenantUpdated
            | Self::TenantSuspended
            | Self::TenantReactivated
            | Self::TenantDeleted => EventFamily::Tenant,
            Self::InvoiceCreated
            | Self::InvoicePaid
            | Self::InvoiceOverdue
            | Self::InvoiceVoided
            | Self::PaymentFailed
            | Self::SubscriptionChanged => EventFamily::Billing,
            Self::UserCreated
            | Self::UserUpdated
            | Self::UserDeleted
            | Self::UserInvited
            | Self::UserRoleChanged => EventFamily::User,
            Self::NotificationRequested | Self::NotificationSent | Self::NotificationFailed => {
                EventFamily::Notification
            }
        }
    }

    /// Default topic for this type
    pub fn topic(&self) -> &'static str {
        self.family().topic()
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("unknown event type: {}", s))
    }
}

impl Serialize for EventType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
