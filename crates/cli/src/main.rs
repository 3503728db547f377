use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, ArgGroup, Parser};
use kreflect_core::{ListerWatcher, Selector};
use kreflect_kubehub::{ConnectParams, KubeListerWatcher};
use kreflect_reflector::{Reflector, ReflectorConfig};
use kreflect_store::Store;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod consumer;
mod report;

use consumer::ConsumerLoop;

#[derive(Parser, Debug)]
#[command(name = "kreflect", version, about = "Mirror a Kubernetes collection via list/watch and print its keys")]
#[command(group(
    ArgGroup::new("connection")
        .required(true)
        .multiple(true)
        .args(["master_url", "kubeconfig"])
))]
struct Cli {
    /// API server URL, e.g. http://127.0.0.1:8001 behind `kubectl proxy`
    #[arg(long = "master-url", env = "KREFLECT_MASTER_URL")]
    master_url: Option<String>,

    /// Path to a kubeconfig file (takes precedence over --master-url)
    #[arg(long = "kubeconfig", env = "KREFLECT_KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// GVK key of the mirrored collection, e.g. "v1/Pod" or "apps/v1/Deployment"
    #[arg(long = "resource", default_value = "v1/Pod")]
    resource: String,

    /// Restrict to one namespace (default: all)
    #[arg(short = 'n', long = "namespace")]
    namespace: Option<String>,

    #[arg(short = 'l', long = "label-selector")]
    label_selector: Option<String>,

    #[arg(long = "field-selector")]
    field_selector: Option<String>,

    /// Seconds between reports
    #[arg(long = "interval", default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
    interval_secs: u64,

    /// Stop after this many reports (default: until Ctrl-C)
    #[arg(long = "cycles")]
    cycles: Option<u32>,

    /// Forced re-list period in seconds; 0 disables
    #[arg(long = "resync")]
    resync_secs: Option<u64>,

    /// Cap on the retry delay in seconds
    #[arg(long = "backoff-max")]
    backoff_max_secs: Option<u64>,

    /// Give up after this many consecutive list failures (default: retry forever)
    #[arg(long = "max-list-attempts", value_parser = clap::value_parser!(u32).range(1..))]
    max_list_attempts: Option<u32>,

    /// Skip the one-shot listing printed at startup
    #[arg(long = "no-summary", action = ArgAction::SetTrue)]
    no_summary: bool,
}

impl Cli {
    fn connect_params(&self) -> ConnectParams {
        ConnectParams { master_url: self.master_url.clone(), kubeconfig: self.kubeconfig.clone() }
    }

    fn selector(&self) -> Selector {
        let mut sel = Selector::everything();
        if let Some(ns) = &self.namespace {
            sel = sel.namespace(ns.as_str());
        }
        if let Some(labels) = &self.label_selector {
            sel = sel.labels(labels.as_str());
        }
        if let Some(fields) = &self.field_selector {
            sel = sel.fields(fields.as_str());
        }
        sel
    }

    /// Environment defaults, overridden by explicit flags.
    fn reflector_config(&self) -> ReflectorConfig {
        let mut cfg = ReflectorConfig::from_env();
        if let Some(secs) = self.resync_secs {
            cfg.resync_period = Duration::from_secs(secs);
        }
        if let Some(secs) = self.backoff_max_secs {
            cfg.backoff_max = Duration::from_secs(secs);
        }
        if self.max_list_attempts.is_some() {
            cfg.max_list_attempts = self.max_list_attempts;
        }
        cfg
    }
}

fn init_tracing() {
    let env = std::env::var("KREFLECT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KREFLECT_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KREFLECT_METRICS_ADDR; expected host:port");
        }
    }
}

/// One-shot listing printed before mirroring starts. `None` if cancelled first;
/// a failed list is logged and yields an empty summary.
async fn startup_summary<L>(lw: &L, kind: &str, selector: &Selector, cancel: &CancellationToken) -> Option<String>
where
    L: ListerWatcher + ?Sized,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        res = lw.list(selector) => match res {
            Ok(list) => Some(report::render_summary(kind, &list)),
            Err(e) => {
                warn!(error = %e, "startup listing failed; the reflector will keep retrying");
                Some(String::new())
            }
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();
    init_metrics();

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received; shutting down");
                cancel.cancel();
            }
        }
    });

    let client = kreflect_kubehub::connect(&cli.connect_params()).await.context("connecting to the cluster")?;
    let lw = Arc::new(KubeListerWatcher::discover(client, &cli.resource).await?);
    let selector = cli.selector();
    if selector.namespace.is_some() && !lw.namespaced() {
        warn!(kind = %lw.kind(), "--namespace ignored: the resource is cluster-scoped");
    }
    if selector.is_everything() {
        info!(resource = %cli.resource, "mirroring the whole collection");
    } else {
        info!(resource = %cli.resource, selector = ?selector, "mirroring");
    }

    if !cli.no_summary {
        match startup_summary(lw.as_ref(), lw.kind(), &selector, &cancel).await {
            Some(text) => print!("{}", text),
            None => return Ok(()),
        }
    }

    let store = Arc::new(Store::new());
    let reflector = Arc::new(Reflector::new(
        cli.resource.clone(),
        Arc::clone(&lw),
        selector,
        Arc::clone(&store),
        cli.reflector_config(),
    ));
    let reflector_task = Arc::clone(&reflector).spawn(cancel.clone());

    let consumer = ConsumerLoop::new(Arc::clone(&store), Duration::from_secs(cli.interval_secs), cli.cycles);
    let reports = consumer.run(&cancel, &mut std::io::stdout()).await.context("writing report")?;

    cancel.cancel();
    match reflector_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(reflector = %reflector.name(), error = %e, "reflector stopped early"),
        Err(e) => error!(reflector = %reflector.name(), error = %e, "reflector task failed"),
    }
    info!(reflector = %reflector.name(), reports, version = ?reflector.last_synced_version(), "done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;
    use kreflect_core::{CollectionVersion, EventStream, FetchError, ListResult, MirroredObject};

    /// Lister whose list either hangs forever or answers with `items`.
    struct FixedLister {
        items: Option<Vec<MirroredObject>>,
    }

    #[async_trait::async_trait]
    impl ListerWatcher for FixedLister {
        async fn list(&self, _selector: &Selector) -> Result<ListResult, FetchError> {
            match &self.items {
                Some(items) => Ok(ListResult { items: items.clone(), version: CollectionVersion::new("42") }),
                None => std::future::pending().await,
            }
        }

        async fn watch(&self, _selector: &Selector, _since: &CollectionVersion) -> Result<EventStream, FetchError> {
            Err(FetchError::Transient("not scripted".into()))
        }
    }

    #[test]
    fn connection_flag_is_required() {
        let err = Cli::try_parse_from(["kreflect"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn both_connection_flags_accepted() {
        let cli = Cli::try_parse_from(["kreflect", "--master-url", "http://127.0.0.1:8001", "--kubeconfig", "/tmp/kc"])
            .unwrap();
        let params = cli.connect_params();
        assert_eq!(params.master_url.as_deref(), Some("http://127.0.0.1:8001"));
        assert_eq!(params.kubeconfig, Some(PathBuf::from("/tmp/kc")));
    }

    #[test]
    fn defaults_and_selector() {
        let cli = Cli::try_parse_from(["kreflect", "--master-url", "http://localhost:8001", "-n", "default", "-l", "app=web"])
            .unwrap();
        assert_eq!(cli.resource, "v1/Pod");
        assert_eq!(cli.interval_secs, 30);
        assert_eq!(cli.cycles, None);
        let sel = cli.selector();
        assert_eq!(sel.namespace.as_deref(), Some("default"));
        assert_eq!(sel.label_selector.as_deref(), Some("app=web"));
        assert_eq!(sel.field_selector, None);
    }

    #[test]
    fn flags_override_reflector_config() {
        let cli = Cli::try_parse_from([
            "kreflect",
            "--kubeconfig",
            "/tmp/kc",
            "--resync",
            "600",
            "--backoff-max",
            "5",
            "--max-list-attempts",
            "4",
        ])
        .unwrap();
        let cfg = cli.reflector_config();
        assert_eq!(cfg.resync_period, Duration::from_secs(600));
        assert_eq!(cfg.backoff_max, Duration::from_secs(5));
        assert_eq!(cfg.max_list_attempts, Some(4));
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_startup_listing_is_cancellable() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });
        let started = tokio::time::Instant::now();

        let out = startup_summary(&FixedLister { items: None }, "Pod", &Selector::everything(), &cancel).await;

        assert_eq!(out, None);
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn startup_listing_renders_summary() {
        let lw = FixedLister { items: Some(vec![MirroredObject::new(Some("default"), "web-0")]) };
        let out = startup_summary(&lw, "Pod", &Selector::everything(), &CancellationToken::new()).await;
        assert_eq!(
            out.as_deref(),
            Some("There are 1 Pod objects in the cluster\nresource version: 42\ndefault/web-0, phase:-, host:-\n")
        );
    }

    #[test]
    fn zero_interval_rejected() {
        let err = Cli::try_parse_from(["kreflect", "--master-url", "http://x", "--interval", "0"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValueValidation);
    }
}
