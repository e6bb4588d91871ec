use once_cell::sync::OnceCell;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

/// Tracing target carrying task lifecycle records.
pub const AUDIT_TARGET: &str = "netfleet.audit";

static AUDIT_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rotation {
    Minutely,
    Hourly,
    Daily,
}

impl Rotation {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "hourly" => Rotation::Hourly,
            "minutely" => Rotation::Minutely,
            _ => Rotation::Daily,
        }
    }
}

/// Install the global subscriber: console output filtered by `RUST_LOG`
/// (default `info`), plus a rolling audit file when `NETFLEET_AUDIT_LOG_ROLL=1`.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = fmt::layer();
    let registry = tracing_subscriber::registry().with(fmt_layer.with_filter(filter));
    if std::env::var("NETFLEET_AUDIT_LOG_ROLL").ok().as_deref() == Some("1") {
        let dir = std::env::var("NETFLEET_AUDIT_LOG_DIR")
            .ok()
            .or_else(|| std::env::var("NETFLEET_LOGS_DIR").ok())
            .unwrap_or_else(|| "logs".to_string());
        let prefix = std::env::var("NETFLEET_AUDIT_LOG_PREFIX").unwrap_or_else(|_| "audit".into());
        let rotation = std::env::var("NETFLEET_AUDIT_LOG_ROTATION").unwrap_or_default();
        if std::fs::create_dir_all(&dir).is_err() {
            tracing::warn!(directory = %dir, "failed to create audit log directory");
        }
        let writer = match Rotation::parse(&rotation) {
            Rotation::Hourly => tracing_appender::rolling::hourly(&dir, &prefix),
            Rotation::Minutely => tracing_appender::rolling::minutely(&dir, &prefix),
            Rotation::Daily => tracing_appender::rolling::daily(&dir, &prefix),
        };
        let (nb, guard) = tracing_appender::non_blocking(writer);
        let _ = AUDIT_GUARD.set(guard);
        let targets = Targets::new().with_target(AUDIT_TARGET, tracing::Level::INFO);
        let audit_layer = fmt::layer()
            .with_ansi(false)
            .with_target(false)
            .with_writer(nb)
            .with_filter(targets);
        let _ = registry.with(audit_layer).try_init();
    } else {
        let _ = registry.try_init();
    }
}
