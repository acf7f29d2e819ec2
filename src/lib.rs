//! Pharma CRM Sales Enablement API Library
//!
//! This library provides the core functionality for the pharma CRM backend:
//! MEDDPICC qualification scoring, commercial KPI aggregation over
//! prescription and call activity data, PEAK pipeline stage management,
//! and the HTTP surface that exposes them per organization.
//!
//! # Modules
//!
//! - `auth_client`: External auth provider client with circuit breaking.
//! - `cache_integrity`: Checksummed wrapping of cached payloads.
//! - `config`: Configuration management.
//! - `db`: Database connection and pool management.
//! - `db_storage`: Database storage operations.
//! - `errors`: Error handling types.
//! - `handlers`: HTTP request handlers and the application router.
//! - `kpi`: KPI kinds, periods, and aggregation arithmetic.
//! - `models`: Database and API data models.
//! - `peak`: Pipeline stages and transition rules.
//! - `scoring`: MEDDPICC pillar scoring and tier classification.
//! - `services`: Assessment and KPI resolution services.
//! - `tenancy`: Organization context extraction and role checks.
//! - `validate`: Request validation producing structured issues.
//! - `webhook_handler`: CRM webhook handler.
//! - `webhook_models`: CRM webhook payload models.

pub mod auth_client;
pub mod cache_integrity;
pub mod config;
pub mod db;
pub mod db_storage;
pub mod errors;
pub mod handlers;
pub mod kpi;
pub mod models;
pub mod peak;
pub mod scoring;
pub mod services;
pub mod tenancy;
pub mod validate;
pub mod webhook_handler;
pub mod webhook_models;
