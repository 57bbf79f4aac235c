//! Shared configuration cache for storefront, admin and delivery shells.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
