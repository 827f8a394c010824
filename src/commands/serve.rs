//! `vcrproxy serve`.

use std::sync::Arc;

use crate::adapters::live::{LiveGit, LiveIdGenerator, LiveUpstream};
use crate::assets::AssetSynchronizer;
use crate::cli::ServeArgs;
use crate::config::ProxySettings;
use crate::proxy::{CertificateAuthority, Proxy};
use crate::session::SessionRegistry;

/// Applies `serve` flags over loaded settings.
#[must_use]
pub fn apply_flags(mut settings: ProxySettings, args: &ServeArgs) -> ProxySettings {
    if let Some(listen) = args.listen {
        settings.listen = listen;
    }
    if let Some(root) = &args.storage_root {
        settings.storage_root.clone_from(root);
    }
    if let Some(key) = &args.admin_key {
        settings.admin_key = Some(key.clone());
    }
    if let Some(dir) = &args.ca_dir {
        settings.tls.ca_dir.clone_from(dir);
    }
    if args.no_tls {
        settings.tls.enabled = false;
    }
    settings
}

/// Runs the proxy until interrupted.
///
/// # Errors
///
/// Returns an error string if the runtime, CA, upstream client or listener
/// cannot be set up.
pub fn run(settings: ProxySettings, args: &ServeArgs) -> Result<(), String> {
    let settings = apply_flags(settings, args);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| format!("failed to start runtime: {err}"))?;
    runtime.block_on(serve(settings))
}

/// Wires live adapters into a proxy and serves until Ctrl-C.
///
/// # Errors
///
/// Returns an error string if any component fails to initialize.
pub async fn serve(settings: ProxySettings) -> Result<(), String> {
    let options = settings.registry_options().map_err(|err| err.to_string())?;
    let registry = SessionRegistry::new(options, Arc::new(LiveIdGenerator))
        .map_err(|err| err.to_string())?;
    let upstream = LiveUpstream::new(&settings.upstream_options())
        .map_err(|err| format!("failed to build upstream client: {err}"))?;
    let git = Arc::new(LiveGit::new(settings.assets.git_timeout()));
    let assets = AssetSynchronizer::new(git, settings.assets.sync_options());

    let mut proxy = Proxy::new(Arc::new(registry), Arc::new(upstream))
        .with_admin_key(settings.admin_key.clone())
        .with_max_body_bytes(settings.max_body_bytes)
        .with_idle_timeout(settings.idle_timeout())
        .with_assets(Arc::new(assets));
    if settings.tls.enabled {
        let ca = CertificateAuthority::load_or_create(&settings.tls.ca_dir)
            .map_err(|err| err.to_string())?;
        let ca_cert = settings.tls.ca_dir.join(crate::proxy::tls::CA_CERT_FILE);
        tracing::info!(ca = %ca_cert.display(), "HTTPS interception enabled");
        proxy = proxy.with_certificate_authority(Arc::new(ca));
    }

    let server = proxy
        .bind(settings.listen)
        .await
        .map_err(|err| format!("failed to bind {}: {err}", settings.listen))?;
    server
        .serve_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %err, "cannot listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await
        .map_err(|err| err.to_string())
}
