//! Handlers behind the `storefront-cache` subcommands.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::cache::{
    CacheConfig, CacheService, CacheStats, InitializeReport, PersistentKv, SystemClock,
};
use crate::config::{RefreshAllArgs, Settings, ShowArgs, WarmArgs};
use crate::domain::types::{ResourceKind, ResourceType, ResourceValue};
use crate::infra::{file_kv::FileKv, http_provider::HttpResourceProvider};

use super::error::AppError;

/// Wire the service to the HTTP provider and, when enabled, on-disk storage.
pub fn build_service(settings: &Settings) -> Result<CacheService, AppError> {
    let provider = HttpResourceProvider::new(&settings.provider)?;
    let kv: Option<Arc<dyn PersistentKv>> = if settings.storage.enabled {
        Some(Arc::new(FileKv::open(&settings.storage.directory)?))
    } else {
        None
    };

    Ok(CacheService::new(
        &CacheConfig::from(&settings.cache),
        Arc::new(provider),
        kv,
        Arc::new(SystemClock),
    ))
}

pub async fn warm(service: &CacheService, args: &WarmArgs) -> InitializeReport {
    let report = service
        .initialize_with_context(args.context, args.force)
        .await;
    log_report(&report);
    report
}

/// Force-refresh everything, then load each requested context on top.
pub async fn refresh_all(service: &CacheService, args: &RefreshAllArgs) -> Vec<InitializeReport> {
    let mut reports = service.force_refresh_all().await;
    for context in &args.contexts {
        if reports.iter().any(|report| report.context == *context) {
            continue;
        }
        reports.push(service.initialize_with_context(*context, false).await);
    }

    for report in &reports {
        log_report(report);
    }
    reports
}

pub fn stats(service: &CacheService) -> CacheStats {
    service.cache_stats()
}

/// Cached value for the requested resource. Never fetches.
pub fn show(service: &CacheService, args: &ShowArgs) -> Result<ResourceValue, AppError> {
    let resource = match (args.kind, args.page.as_deref()) {
        (ResourceKind::Page, Some(path)) => ResourceType::page(path),
        (ResourceKind::Page, None) => {
            return Err(AppError::validation("`show page` requires --page <PATH>"));
        }
        (_, Some(_)) => {
            return Err(AppError::validation(format!(
                "--page only applies to `page`, not `{}`",
                args.kind
            )));
        }
        (kind, None) => kind_to_singleton(kind)?,
    };

    Ok(service.get(&resource))
}

pub fn render_json<T: Serialize>(value: &T) -> Result<String, AppError> {
    serde_json::to_string_pretty(value)
        .map_err(|err| AppError::unexpected(format!("failed to render output: {err}")))
}

fn kind_to_singleton(kind: ResourceKind) -> Result<ResourceType, AppError> {
    ResourceType::SINGLETONS
        .into_iter()
        .find(|resource| resource.kind() == kind)
        .ok_or_else(|| AppError::validation(format!("`{kind}` is not a singleton resource")))
}

fn log_report(report: &InitializeReport) {
    if report.suppressed {
        info!(context = %report.context, "Initialize suppressed");
        return;
    }
    for failure in &report.failures {
        warn!(
            context = %report.context,
            resource = %failure.resource,
            error = %failure.error,
            "Resource could not be refreshed"
        );
    }
}
