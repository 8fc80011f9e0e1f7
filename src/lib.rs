//! Payment reconciliation service - transaction/logbook matching and an
//! idempotency guard for payment-creating requests.

pub mod config;
pub mod dtos;
pub mod error;
pub mod handlers;
pub mod models;
pub mod observability;
pub mod services;
pub mod startup;
