//! Batch dispatcher: concurrent settle-all send of one batch of recipients.
//!
//! A recipient's failure is recorded as data and never prevents the other
//! recipients of the batch from being attempted.

use chrono::Utc;
use futures::future::join_all;

use beacon_common::types::{
    Channel, DeliveryFailure, DeliveryLogEntry, DeliveryStatus, JobData, Recipient,
};

use crate::provider::{DeliveryProvider, OutboundMessage};
use crate::store::JobStore;
use crate::template::{merge_variables, render};

/// Everything a batch needs from its job, borrowed for the duration of a pass.
pub struct BatchContext<'a> {
    pub job_id: &'a str,
    pub channel: Channel,
    pub data: &'a JobData,
    pub provider: &'a dyn DeliveryProvider,
    pub store: &'a dyn JobStore,
}

/// Aggregated outcome of one or more batches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    pub sent: u32,
    pub failed: u32,
    pub errors: Vec<DeliveryFailure>,
}

impl BatchOutcome {
    pub fn merge(&mut self, other: BatchOutcome) {
        self.sent += other.sent;
        self.failed += other.failed;
        self.errors.extend(other.errors);
    }
}

/// Build the rendered message for one recipient, or `None` without a contact.
pub fn compose(channel: Channel, data: &JobData, recipient: &Recipient) -> Option<OutboundMessage> {
    let to = recipient.contact(channel)?.to_string();
    let vars = merge_variables(&data.template_variables, recipient);
    let is_email = channel == Channel::Email;

    Some(OutboundMessage {
        channel,
        to,
        subject: data
            .subject
            .as_deref()
            .filter(|_| is_email)
            .map(|subject| render(subject, &vars)),
        body: render(&data.message, &vars),
        is_html: is_email && data.is_html,
    })
}

/// Send to every recipient of `batch` concurrently and wait for all of them.
pub async fn dispatch_batch(ctx: &BatchContext<'_>, batch: &[Recipient]) -> BatchOutcome {
    let attempts = batch.iter().map(|recipient| deliver_one(ctx, recipient));
    let results = join_all(attempts).await;

    let mut outcome = BatchOutcome::default();
    for result in results {
        match result {
            Ok(()) => outcome.sent += 1,
            Err(failure) => {
                outcome.failed += 1;
                outcome.errors.push(failure);
            }
        }
    }

    tracing::debug!(
        job_id = %ctx.job_id,
        batch_size = batch.len(),
        sent = outcome.sent,
        failed = outcome.failed,
        "Batch dispatched"
    );

    outcome
}

async fn deliver_one(ctx: &BatchContext<'_>, recipient: &Recipient) -> Result<(), DeliveryFailure> {
    let result = match compose(ctx.channel, ctx.data, recipient) {
        Some(message) => match ctx.provider.send(&message).await {
            Ok(()) => Ok(message.to),
            Err(e) => Err((message.to, e.to_string())),
        },
        None => Err((
            String::new(),
            format!("recipient has no {} contact", ctx.channel),
        )),
    };

    let (contact, status, error) = match &result {
        Ok(contact) => (contact.clone(), DeliveryStatus::Sent, None),
        Err((contact, error)) => (contact.clone(), DeliveryStatus::Failed, Some(error.clone())),
    };

    let entry = DeliveryLogEntry {
        job_id: ctx.job_id.to_string(),
        recipient_id: recipient.id,
        channel: ctx.channel,
        contact,
        status,
        error,
        created_at: Utc::now(),
    };
    if let Err(e) = ctx.store.insert_delivery_log(&entry).await {
        tracing::warn!(
            job_id = %ctx.job_id,
            recipient_id = recipient.id,
            error = %e,
            "Failed to write delivery log"
        );
    }

    match result {
        Ok(_) => Ok(()),
        Err((contact, error)) => {
            tracing::debug!(
                job_id = %ctx.job_id,
                recipient_id = recipient.id,
                error = %error,
                "Recipient delivery failed"
            );
            Err(DeliveryFailure {
                recipient_id: recipient.id,
                recipient: contact,
                error,
            })
        }
    }
}
