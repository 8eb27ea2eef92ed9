//! Subscription bookkeeping driven by webhook events.
//!
//! One account per (provider, subscriber email). The buyer's tax document is
//! sealed with the field cipher before it is stored.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use super::events::{PurchaseEvent, SubscriptionChangeEvent};
use super::processor::{ChangeOutcome, SubscriptionLifecycle};
use crate::crypto::FieldCipher;
use crate::security::masking::mask_email;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    PastDue,
    Canceled,
    Revoked,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriberAccount {
    pub provider: String,
    pub email: String,
    pub status: AccountStatus,
    pub plan: Option<String>,
    pub last_transaction: Option<String>,
    /// `base64(nonce || ciphertext)`
    #[serde(skip_serializing)]
    pub document_sealed: Option<String>,
    pub last_event_id: String,
    pub updated_at: DateTime<Utc>,
}

type AccountKey = (String, String);

fn account_key(provider: &str, email: &str) -> AccountKey {
    (provider.to_string(), email.trim().to_ascii_lowercase())
}

/// In-memory subscription book; the default pipeline consumer.
#[derive(Debug)]
pub struct SubscriptionBook {
    cipher: FieldCipher,
    accounts: RwLock<HashMap<AccountKey, SubscriberAccount>>,
}

impl SubscriptionBook {
    pub fn new(cipher: FieldCipher) -> Self {
        Self {
            cipher,
            accounts: RwLock::new(HashMap::new()),
        }
    }

    pub fn account(&self, provider: &str, email: &str) -> Option<SubscriberAccount> {
        self.accounts.read().get(&account_key(provider, email)).cloned()
    }

    /// Decrypted buyer document, if one was stored.
    pub fn document(&self, provider: &str, email: &str) -> anyhow::Result<Option<String>> {
        let sealed = self
            .account(provider, email)
            .and_then(|account| account.document_sealed);
        match sealed {
            Some(sealed) => Ok(Some(self.cipher.decrypt(&sealed)?)),
            None => Ok(None),
        }
    }

    pub fn len(&self) -> usize {
        self.accounts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.read().is_empty()
    }

    fn apply_purchase(
        &self,
        provider: &str,
        event: &PurchaseEvent,
        status: AccountStatus,
    ) -> anyhow::Result<()> {
        let sealed = event
            .data
            .buyer
            .document
            .as_deref()
            .map(|doc| self.cipher.encrypt(doc))
            .transpose()?;

        let key = account_key(provider, event.subscriber_email());
        let mut accounts = self.accounts.write();
        let account = accounts.entry(key.clone()).or_insert_with(|| SubscriberAccount {
            provider: key.0.clone(),
            email: key.1.clone(),
            status,
            plan: None,
            last_transaction: None,
            document_sealed: None,
            last_event_id: event.event_id.clone(),
            updated_at: Utc::now(),
        });

        account.status = status;
        account.last_transaction = Some(event.data.purchase.transaction.clone());
        account.last_event_id = event.event_id.clone();
        account.updated_at = Utc::now();
        if let Some(plan) = event.plan_name() {
            account.plan = Some(plan.to_string());
        }
        if sealed.is_some() {
            account.document_sealed = sealed;
        }

        info!(
            provider,
            subscriber = %mask_email(&account.email),
            status = ?account.status,
            "Subscriber account updated"
        );
        Ok(())
    }

    fn apply_change(
        &self,
        provider: &str,
        event: &SubscriptionChangeEvent,
        update: impl FnOnce(&mut SubscriberAccount),
    ) -> ChangeOutcome {
        let key = account_key(provider, &event.data.subscriber.email);
        let mut accounts = self.accounts.write();
        let Some(account) = accounts.get_mut(&key) else {
            warn!(
                provider,
                event_id = %event.event_id,
                subscriber = %mask_email(&event.data.subscriber.email),
                "No subscription on record for change"
            );
            return ChangeOutcome::UnknownSubscriber;
        };

        update(account);
        account.last_event_id = event.event_id.clone();
        account.updated_at = Utc::now();

        info!(
            provider,
            subscriber = %mask_email(&account.email),
            status = ?account.status,
            plan = ?account.plan,
            "Subscriber account changed"
        );
        ChangeOutcome::Applied
    }
}

#[async_trait]
impl SubscriptionLifecycle for SubscriptionBook {
    async fn on_activated(&self, provider: &str, event: &PurchaseEvent) -> anyhow::Result<()> {
        self.apply_purchase(provider, event, AccountStatus::Active)
    }

    async fn on_revoked(&self, provider: &str, event: &PurchaseEvent) -> anyhow::Result<()> {
        self.apply_purchase(provider, event, AccountStatus::Revoked)
    }

    async fn on_past_due(&self, provider: &str, event: &PurchaseEvent) -> anyhow::Result<()> {
        self.apply_purchase(provider, event, AccountStatus::PastDue)
    }

    async fn on_cancelled(
        &self,
        provider: &str,
        event: &SubscriptionChangeEvent,
    ) -> anyhow::Result<ChangeOutcome> {
        Ok(self.apply_change(provider, event, |account| {
            account.status = AccountStatus::Canceled;
        }))
    }

    async fn on_plan_changed(
        &self,
        provider: &str,
        event: &SubscriptionChangeEvent,
    ) -> anyhow::Result<ChangeOutcome> {
        let plan = event.data.plan.as_ref().map(|p| p.name.clone());
        Ok(self.apply_change(provider, event, |account| {
            if plan.is_some() {
                account.plan = plan;
            }
        }))
    }
}
