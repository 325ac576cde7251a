//! Ban-prevention monitor.
//!
//! Every 429 is counted by endpoint and scope. A global 429 means the whole
//! bot identity is throttled; it gets its own counter and an ERROR log tagged
//! `severity = "critical"`, and may pause the worker pool.

use std::sync::Arc;

use crate::discord::RateLimitInfo;
use crate::job::{JobId, JobType};
use crate::metrics::MetricsRegistry;
use crate::worker::PoolControl;

pub struct BanPreventionMonitor {
    metrics: Arc<MetricsRegistry>,
    control: Arc<PoolControl>,
    auto_pause: bool,
}

impl BanPreventionMonitor {
    pub fn new(metrics: Arc<MetricsRegistry>, control: Arc<PoolControl>, auto_pause: bool) -> Self {
        Self {
            metrics,
            control,
            auto_pause,
        }
    }

    /// Returns true when the violation was global.
    pub fn observe(&self, job_id: JobId, job_type: JobType, info: &RateLimitInfo) -> bool {
        self.metrics
            .record_external_429(&info.endpoint, info.scope.as_str(), info.retry_after);

        if !info.scope.is_global() {
            tracing::warn!(
                job_id = %job_id,
                job_type = %job_type,
                endpoint = %info.endpoint,
                scope = %info.scope,
                retry_after_ms = info.retry_after.map(|d| d.as_millis() as u64),
                "External API rate limit hit"
            );
            return false;
        }

        self.metrics.record_external_429_global();
        tracing::error!(
            target: "synthesis::ban_prevention",
            severity = "critical",
            job_id = %job_id,
            job_type = %job_type,
            endpoint = %info.endpoint,
            retry_after_ms = info.retry_after.map(|d| d.as_millis() as u64),
            global_violations = self.metrics.external_429_global(),
            "CRITICAL: global rate limit violation, client identity at risk of suspension"
        );

        if self.auto_pause && !self.control.is_paused() {
            self.control.pause();
            tracing::error!(
                target: "synthesis::ban_prevention",
                severity = "critical",
                "Worker pool paused after global rate limit violation"
            );
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discord::RateLimitScope;
    use std::io;
    use std::sync::Mutex;
    use std::time::Duration;
    use tracing_subscriber::fmt::MakeWriter;
    use uuid::Uuid;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Captured {
        type Writer = Captured;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn info(scope: RateLimitScope) -> RateLimitInfo {
        RateLimitInfo {
            endpoint: "POST /guilds/:id/channels".into(),
            scope,
            retry_after: Some(Duration::from_millis(750)),
            bucket: None,
        }
    }

    #[test]
    fn test_scoped_violation_only_touches_scoped_counter() {
        let metrics = Arc::new(MetricsRegistry::new());
        let monitor = BanPreventionMonitor::new(metrics.clone(), Arc::new(PoolControl::new()), false);

        let global = monitor.observe(Uuid::new_v4(), JobType::CreateChannel, &info(RateLimitScope::User));

        assert!(!global);
        assert_eq!(metrics.external_429("POST /guilds/:id/channels", "user"), 1);
        assert_eq!(metrics.external_429_global(), 0);
    }

    #[test]
    fn test_global_violation_counts_twice_and_logs_critical() {
        let metrics = Arc::new(MetricsRegistry::new());
        let monitor = BanPreventionMonitor::new(metrics.clone(), Arc::new(PoolControl::new()), false);

        let sink = Captured::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(sink.clone())
            .with_ansi(false)
            .finish();

        let global = tracing::subscriber::with_default(subscriber, || {
            monitor.observe(Uuid::new_v4(), JobType::CreateChannel, &info(RateLimitScope::Global))
        });

        assert!(global);
        assert_eq!(metrics.external_429("POST /guilds/:id/channels", "global"), 1);
        assert_eq!(metrics.external_429_global(), 1);

        let logs = String::from_utf8(sink.0.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("ERROR"), "logs: {logs}");
        assert!(logs.contains("severity=\"critical\""), "logs: {logs}");
    }

    #[test]
    fn test_auto_pause_on_global_violation() {
        let control = Arc::new(PoolControl::new());
        let monitor = BanPreventionMonitor::new(Arc::new(MetricsRegistry::new()), control.clone(), true);

        monitor.observe(Uuid::new_v4(), JobType::AssignRole, &info(RateLimitScope::Shared));
        assert!(!control.is_paused());

        monitor.observe(Uuid::new_v4(), JobType::AssignRole, &info(RateLimitScope::Global));
        assert!(control.is_paused());
    }
}
