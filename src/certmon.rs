//! # Certificate Expiration Monitor
//!
//! Periodically reads `notAfter` from the node's certificates and logs a
//! security event as each one approaches or passes expiry. Observational
//! only: nothing is rotated or revoked here.
//!
//! | Remaining validity | Status | Event |
//! |--------------------|--------|-------|
//! | > `warning_days` | `Valid` | none |
//! | ≤ `warning_days` | `Warning` | `CertExpiryWarning` (2001) |
//! | ≤ `critical_days` | `Critical` | `CertExpiryCritical` (2002) |
//! | ≤ 0 | `Expired` | `CertExpired` (2003) |

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::CertMonitorSettings;
use crate::crypto::certificate_not_after_ms;
use crate::events::{self, SecurityEvent};

const DAY_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CertificateSource {
    /// DER certificate file, re-read on every scan.
    File(PathBuf),
    Der { label: String, der: Vec<u8> },
}

impl CertificateSource {
    fn label(&self) -> String {
        match self {
            CertificateSource::File(path) => path.display().to_string(),
            CertificateSource::Der { label, .. } => label.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CertificateStatus {
    Valid { days_remaining: u64 },
    Warning { days_remaining: u64 },
    Critical { days_remaining: u64 },
    Expired { expired_ms_ago: u64 },
    /// The certificate could not be read or parsed.
    Unreadable { reason: String },
}

impl CertificateStatus {
    pub fn event(&self) -> Option<SecurityEvent> {
        match self {
            CertificateStatus::Warning { .. } => Some(SecurityEvent::CertExpiryWarning),
            CertificateStatus::Critical { .. } => Some(SecurityEvent::CertExpiryCritical),
            CertificateStatus::Expired { .. } => Some(SecurityEvent::CertExpired),
            CertificateStatus::Valid { .. } | CertificateStatus::Unreadable { .. } => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateReport {
    pub label: String,
    pub not_after_ms: Option<u64>,
    pub status: CertificateStatus,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub scanned_at_ms: u64,
    pub certificates: Vec<CertificateReport>,
}

impl ScanReport {
    /// Reports that produced an expiry event.
    pub fn alerts(&self) -> impl Iterator<Item = &CertificateReport> {
        self.certificates.iter().filter(|c| c.status.event().is_some())
    }
}

pub struct CertificateExpirationMonitor {
    clock: Arc<dyn Clock>,
    settings: CertMonitorSettings,
    sources: Mutex<Vec<CertificateSource>>,
}

impl std::fmt::Debug for CertificateExpirationMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateExpirationMonitor")
            .field("settings", &self.settings)
            .field("sources", &self.lock_sources().len())
            .finish()
    }
}

impl CertificateExpirationMonitor {
    pub fn new(settings: CertMonitorSettings, clock: Arc<dyn Clock>) -> Self {
        let sources = settings
            .extra_certificates
            .iter()
            .cloned()
            .map(CertificateSource::File)
            .collect();
        Self {
            clock,
            settings,
            sources: Mutex::new(sources),
        }
    }

    fn lock_sources(&self) -> std::sync::MutexGuard<'_, Vec<CertificateSource>> {
        self.sources.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, source: CertificateSource) {
        let mut sources = self.lock_sources();
        if !sources.contains(&source) {
            sources.push(source);
        }
    }

    pub fn classify(&self, not_after_ms: u64) -> CertificateStatus {
        let now = self.clock.now_ms();
        if not_after_ms <= now {
            return CertificateStatus::Expired {
                expired_ms_ago: now - not_after_ms,
            };
        }
        let remaining = not_after_ms - now;
        let days_remaining = remaining / DAY_MS;
        if remaining <= u64::from(self.settings.critical_days) * DAY_MS {
            CertificateStatus::Critical { days_remaining }
        } else if remaining <= u64::from(self.settings.warning_days) * DAY_MS {
            CertificateStatus::Warning { days_remaining }
        } else {
            CertificateStatus::Valid { days_remaining }
        }
    }

    async fn inspect(&self, source: &CertificateSource) -> CertificateReport {
        let label = source.label();
        let der = match source {
            CertificateSource::File(path) => match tokio::fs::read(path).await {
                Ok(der) => der,
                Err(e) => {
                    return CertificateReport {
                        label,
                        not_after_ms: None,
                        status: CertificateStatus::Unreadable { reason: e.to_string() },
                    };
                }
            },
            CertificateSource::Der { der, .. } => der.clone(),
        };
        match certificate_not_after_ms(&der) {
            Some(not_after_ms) => CertificateReport {
                label,
                not_after_ms: Some(not_after_ms),
                status: self.classify(not_after_ms),
            },
            None => CertificateReport {
                label,
                not_after_ms: None,
                status: CertificateStatus::Unreadable {
                    reason: "not a DER X.509 certificate".to_string(),
                },
            },
        }
    }

    /// Check every registered certificate once and log what needs attention.
    pub async fn scan_once(&self) -> ScanReport {
        let sources = self.lock_sources().clone();
        let mut report = ScanReport {
            scanned_at_ms: self.clock.now_ms(),
            certificates: Vec::with_capacity(sources.len()),
        };
        for source in &sources {
            let cert = self.inspect(source).await;
            match (&cert.status, cert.status.event()) {
                (status, Some(event)) => events::emit(event, &cert.label, &format!("{status:?}")),
                (CertificateStatus::Unreadable { reason }, None) => {
                    warn!(certificate = %cert.label, reason = %reason, "certificate unreadable");
                }
                (status, None) => debug!(certificate = %cert.label, ?status, "certificate valid"),
            }
            report.certificates.push(cert);
        }
        report
    }

    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.settings.scan_interval());
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let report = self.scan_once().await;
                        info!(
                            scanned = report.certificates.len(),
                            alerts = report.alerts().count(),
                            "certificate scan complete"
                        );
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("certificate monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::crypto::generate_certificate;
    use crate::identity::Keypair;

    fn cert_expiring_in(days: i64) -> Vec<u8> {
        let now = time::OffsetDateTime::now_utc();
        generate_certificate(
            &Keypair::generate(),
            now - time::Duration::days(400),
            now + time::Duration::days(days),
        )
        .unwrap()
        .as_ref()
        .to_vec()
    }

    fn monitor() -> CertificateExpirationMonitor {
        let clock = ManualClock::new(time::OffsetDateTime::now_utc().unix_timestamp() as u64 * 1000);
        CertificateExpirationMonitor::new(CertMonitorSettings::default(), Arc::new(clock))
    }

    #[tokio::test]
    async fn horizons_map_to_statuses() {
        let monitor = monitor();
        for (label, days) in [("fresh", 200), ("soon", 20), ("urgent", 3), ("stale", -1)] {
            monitor.register(CertificateSource::Der {
                label: label.to_string(),
                der: cert_expiring_in(days),
            });
        }

        let report = monitor.scan_once().await;
        let status = |label: &str| {
            report
                .certificates
                .iter()
                .find(|c| c.label == label)
                .map(|c| c.status.clone())
                .unwrap()
        };
        assert!(matches!(status("fresh"), CertificateStatus::Valid { .. }));
        assert!(matches!(status("soon"), CertificateStatus::Warning { days_remaining } if days_remaining >= 19));
        assert!(matches!(status("urgent"), CertificateStatus::Critical { .. }));
        assert!(matches!(status("stale"), CertificateStatus::Expired { .. }));
        assert_eq!(report.alerts().count(), 3);
    }

    #[test]
    fn events_have_certificate_ids() {
        let monitor = monitor();
        let now = monitor.clock.now_ms();
        assert_eq!(monitor.classify(now).event().map(|e| e.id()), Some(2003));
        assert_eq!(monitor.classify(now + 2 * DAY_MS).event().map(|e| e.id()), Some(2002));
        assert_eq!(monitor.classify(now + 10 * DAY_MS).event().map(|e| e.id()), Some(2001));
        assert_eq!(monitor.classify(now + 100 * DAY_MS).event(), None);
    }

    #[tokio::test]
    async fn files_are_reread_and_bad_files_reported() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("identity.der");
        let bad = dir.path().join("garbage.der");
        std::fs::write(&good, cert_expiring_in(90)).unwrap();
        std::fs::write(&bad, b"not a certificate").unwrap();

        let monitor = monitor();
        monitor.register(CertificateSource::File(good.clone()));
        monitor.register(CertificateSource::File(good.clone()));
        monitor.register(CertificateSource::File(bad));
        monitor.register(CertificateSource::File(dir.path().join("missing.der")));

        let report = monitor.scan_once().await;
        assert_eq!(report.certificates.len(), 3, "duplicate registration ignored");
        assert!(matches!(report.certificates[0].status, CertificateStatus::Valid { .. }));
        assert!(matches!(report.certificates[1].status, CertificateStatus::Unreadable { .. }));
        assert!(matches!(report.certificates[2].status, CertificateStatus::Unreadable { .. }));

        // Replaced on disk by an expiring certificate: the next scan sees it.
        std::fs::write(&good, cert_expiring_in(2)).unwrap();
        let report = monitor.scan_once().await;
        assert!(matches!(report.certificates[0].status, CertificateStatus::Critical { .. }));
    }

    #[tokio::test]
    async fn background_scan_stops_on_shutdown() {
        let monitor = Arc::new(monitor());
        let (shutdown, rx) = watch::channel(false);
        let handle = monitor.spawn(rx);
        shutdown.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
