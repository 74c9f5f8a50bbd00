//! scamp-discovery: inspect a SCAMP discovery cache.

use std::path::PathBuf;
use std::sync::Arc;

use scamp::registry::proxy::ServiceProxy;
use scamp::retry::{Attempt, RetryError};
use scamp::{Envelope, Registry, RegistryError, ScampConfig};

fn main() -> anyhow::Result<()> {
    // Parse CLI args
    let args: Vec<String> = std::env::args().collect();
    let flag = |name: &str| {
        args.iter()
            .position(|a| a == name)
            .and_then(|i| args.get(i + 1).cloned())
    };

    let config_path = flag("--config")
        .or_else(|| std::env::var("SCAMP_CONFIG").ok())
        .unwrap_or_else(|| "scamp.toml".to_string());
    let soa_path = flag("--soa").map(PathBuf::from);
    let cache_override = flag("--cache").map(PathBuf::from);

    let sector = flag("--sector");
    let action = flag("--action");
    let version = flag("--version")
        .map(|v| v.parse::<u32>())
        .transpose()
        .map_err(|e| anyhow::anyhow!("--version must be a number: {e}"))?
        .unwrap_or(1);
    let envelope = match flag("--envelope").as_deref() {
        None | Some("json") => Envelope::Json,
        Some("jsonstore") => Envelope::JsonStore,
        Some(other) => anyhow::bail!("--envelope must be `json` or `jsonstore`, got `{other}`"),
    };

    // Load configuration
    let mut config = ScampConfig::load(&config_path, soa_path.as_deref())?;

    // Apply CLI overrides (take precedence over files and env vars)
    if let Some(path) = cache_override {
        config.discovery.cache_path = path;
    }
    if args.iter().any(|a| a == "--no-verify") {
        config.discovery.verify_records = false;
    }

    // Build the tokio runtime first, the tonic gRPC exporter needs a reactor context
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let _tracing_guard = scamp_tracing::init_tracing(&config.tracing);

        tracing::info!(
            config_path = %config_path,
            soa_path = ?soa_path,
            cache_path = %config.discovery.cache_path.display(),
            verify_records = config.discovery.verify_records,
            "Starting scamp-discovery"
        );

        let registry = open_registry(&config).await?;

        let proxies = match (sector, action) {
            (Some(sector), Some(action)) => {
                let tag = envelope.dispatch_tag().unwrap_or("json");
                match registry.search_by_action(&sector, &action, version, tag) {
                    Ok(found) => found,
                    Err(RegistryError::NoInstances(key)) => {
                        tracing::warn!(key = %key, "No instances found");
                        Vec::new()
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            (None, None) => registry.all(),
            _ => anyhow::bail!("--sector and --action must be given together"),
        };

        print_proxies(&proxies)
    })
}

/// Open the cache, retrying while an announcer may be mid-write.
async fn open_registry(config: &ScampConfig) -> anyhow::Result<Arc<Registry>> {
    let discovery = &config.discovery;
    let validator = discovery.validator()?;

    let registry = config
        .retry
        .policy()
        .run_async(|attempt| {
            let path = discovery.cache_path.clone();
            let validator = validator.clone();
            let verify = discovery.verify_records;
            async move {
                let opened =
                    tokio::task::spawn_blocking(move || Registry::open(path, validator, verify))
                        .await
                        .map_err(|e| Attempt::Fatal(anyhow::Error::from(e)))?;
                opened.map_err(|e| match e {
                    RegistryError::Feed(_) | RegistryError::Record(_) => {
                        tracing::warn!(attempt, error = %e, "Discovery cache unreadable, retrying");
                        Attempt::Retry(anyhow::Error::from(e))
                    }
                    other => Attempt::Fatal(anyhow::Error::from(other)),
                })
            }
        })
        .await
        .map_err(RetryError::into_inner)?;

    tracing::info!(tracked = registry.len(), "Discovery cache loaded");
    Ok(Arc::new(registry))
}

fn print_proxies(proxies: &[Arc<ServiceProxy>]) -> anyhow::Result<()> {
    let listed: Vec<&ServiceProxy> = proxies.iter().map(Arc::as_ref).collect();
    println!("{}", serde_json::to_string_pretty(&listed)?);
    Ok(())
}
