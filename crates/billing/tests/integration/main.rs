//! Billing integration tests
//!
//! Run against the in-memory store and a scripted Stripe gateway; no network
//! or database is needed.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

mod common;
mod trial_expiry;
mod webhook_reconciliation;
