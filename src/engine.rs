use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::cache;
use crate::config::Config;
use crate::convert::{self, Converter};
use crate::error::AcquireError;
use crate::http_client::{Fetcher, Outcome};
use crate::resolver::{raw_path, resolve_path, resolve_remote_descriptor};
use crate::types::DatasetKey;
use crate::walker::{current_slot, hour_offset, is_future, previous_slot, slot_timestamp};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Current,
    Forecast,
}

/// Per-request retry state. Tries are consumed before each archive request,
/// and the loop stops once none are left.
#[derive(Clone, Copy, Debug)]
pub struct AcquisitionAttempt {
    pub key: DatasetKey,
    pub remaining_tries: u32,
    pub mode: Mode,
}

impl AcquisitionAttempt {
    fn new(key: DatasetKey, tries: u32, mode: Mode) -> Self {
        Self {
            key,
            remaining_tries: tries,
            mode,
        }
    }

    fn take_try(&mut self) -> bool {
        if self.remaining_tries == 0 {
            return false;
        }
        self.remaining_tries -= 1;
        true
    }
}

#[derive(Clone, Copy)]
enum Request {
    Current {
        tries: u32,
        /// Drop a cached entry older than the configured max age first.
        refresh_at: Option<DateTime<Utc>>,
    },
    Forecast {
        now: DateTime<Utc>,
    },
}

type Registry = std::sync::Mutex<HashMap<DatasetKey, Arc<Mutex<()>>>>;

/// Exclusive hold on the cache artifacts of one fetch key. The registry entry
/// is removed when the last holder or waiter goes away, including when the
/// owning request future is dropped mid-flight.
struct KeyGuard<'a> {
    registry: &'a Registry,
    key: DatasetKey,
    lock: Arc<Mutex<()>>,
    held: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.held.take();
        let mut registry = match self.registry.lock() {
            Ok(registry) => registry,
            Err(poisoned) => poisoned.into_inner(),
        };
        // One reference in the map, one in this guard.
        if Arc::strong_count(&self.lock) <= 2 {
            registry.remove(&self.key);
        }
    }
}

pub struct Engine {
    cfg: Arc<Config>,
    fetcher: Arc<dyn Fetcher>,
    converter: Arc<dyn Converter>,
    in_flight: Registry,
}

impl Engine {
    pub fn new(cfg: Arc<Config>, fetcher: Arc<dyn Fetcher>, converter: Arc<dyn Converter>) -> Self {
        Self {
            cfg,
            fetcher,
            converter,
            in_flight: Registry::default(),
        }
    }

    fn weather_dir(&self) -> PathBuf {
        self.cfg.weather_dir()
    }

    pub fn cache_path(&self, key: &DatasetKey) -> PathBuf {
        resolve_path(&self.weather_dir(), key)
    }

    /// Cached payload for `key`, deriving it from the underlying variable's
    /// entry when only that one is on disk.
    pub async fn lookup(&self, key: &DatasetKey) -> Result<Option<Vec<u8>>, AcquireError> {
        if let Some(bytes) = cache::read_entry(&self.cache_path(key)).await? {
            return Ok(Some(bytes));
        }

        let (_, post) = key.variable.derivation();
        let Some(post) = post else {
            return Ok(None);
        };
        let Some(source) = cache::read_entry(&self.cache_path(&key.fetch_key())).await? else {
            return Ok(None);
        };
        let derived = convert::apply(post, &source, key.level)?;
        cache::persist_atomic(&self.cache_path(key), &derived).await?;
        Ok(Some(derived))
    }

    /// Drops the cached payload for `key` and, for derived variables, the
    /// underlying entry it was computed from. Callers hold the key's lock.
    async fn evict(&self, key: &DatasetKey) -> Result<(), AcquireError> {
        cache::remove_entry(&self.cache_path(key)).await?;
        if key.fetch_key() != *key {
            cache::remove_entry(&self.cache_path(&key.fetch_key())).await?;
        }
        Ok(())
    }

    async fn evict_stale(&self, key: &DatasetKey, now: DateTime<Utc>) -> Result<(), AcquireError> {
        if let Some(bytes) = self.lookup(key).await? {
            if !cache::is_fresh(&bytes, now, self.cfg.max_age) {
                info!("Cached {key} is stale, refreshing");
                self.evict(key).await?;
            }
        }
        Ok(())
    }

    /// Serves `key` from cache or resolves the closest published dataset:
    /// forecast mode for future dates, latest-available mode otherwise.
    pub async fn acquire(&self, key: DatasetKey, now: DateTime<Utc>) -> Result<Vec<u8>, AcquireError> {
        if is_future(key.date, now.date_naive()) {
            self.acquire_forecast(key, now).await
        } else {
            self.acquire_current(key).await
        }
    }

    /// Latest-available data, stepping back from `key` one slot per miss.
    pub async fn acquire_current(&self, key: DatasetKey) -> Result<Vec<u8>, AcquireError> {
        let request = Request::Current {
            tries: self.cfg.current_tries,
            refresh_at: None,
        };
        self.coalesced(key, request).await
    }

    /// Like [`Engine::acquire_current`], but a cached entry whose reference
    /// time is older than `max_age` at `now` is downloaded again.
    pub async fn acquire_current_fresh(
        &self,
        key: DatasetKey,
        now: DateTime<Utc>,
    ) -> Result<Vec<u8>, AcquireError> {
        let request = Request::Current {
            tries: self.cfg.current_tries,
            refresh_at: Some(now),
        };
        self.coalesced(key, request).await
    }

    pub async fn acquire_forecast(
        &self,
        key: DatasetKey,
        now: DateTime<Utc>,
    ) -> Result<Vec<u8>, AcquireError> {
        self.coalesced(key, Request::Forecast { now }).await
    }

    /// Exactly one archive request for exactly `key`.
    pub async fn acquire_explicit(&self, key: DatasetKey) -> Result<Vec<u8>, AcquireError> {
        let request = Request::Current {
            tries: 1,
            refresh_at: None,
        };
        self.coalesced(key, request).await
    }

    async fn lock_key(&self, key: DatasetKey) -> KeyGuard<'_> {
        let lock = {
            let mut registry = match self.in_flight.lock() {
                Ok(registry) => registry,
                Err(poisoned) => poisoned.into_inner(),
            };
            Arc::clone(registry.entry(key).or_default())
        };
        let mut guard = KeyGuard {
            registry: &self.in_flight,
            key,
            lock,
            held: None,
        };
        guard.held = Some(Arc::clone(&guard.lock).lock_owned().await);
        guard
    }

    /// Runs `request` while holding the lock of the key whose files it writes,
    /// so `temp` and `air_density` requests for one slot never race.
    async fn coalesced(&self, key: DatasetKey, request: Request) -> Result<Vec<u8>, AcquireError> {
        let _guard = self.lock_key(key.fetch_key()).await;

        if let Request::Current {
            refresh_at: Some(now),
            ..
        } = request
        {
            self.evict_stale(&key, now).await?;
        }
        if let Some(bytes) = self.lookup(&key).await? {
            debug!("Cache hit for {key}");
            return Ok(bytes);
        }

        match request {
            Request::Current { tries, .. } => self.run_current(key, tries).await,
            Request::Forecast { now } => self.run_forecast(key, now).await,
        }
    }

    async fn run_current(&self, key: DatasetKey, tries: u32) -> Result<Vec<u8>, AcquireError> {
        let held_key = key.fetch_key();
        let mut attempt = AcquisitionAttempt::new(key, tries, Mode::Current);

        while attempt.take_try() {
            let fetch_key = attempt.key.fetch_key();
            // Earlier slots are locked while later ones are held, always in
            // that order, so walks never deadlock.
            let _walk_guard = if fetch_key == held_key {
                None
            } else {
                let guard = self.lock_key(fetch_key).await;
                if let Some(bytes) = self.lookup(&attempt.key).await? {
                    debug!("Cache hit for {} while walking back from {key}", attempt.key);
                    return Ok(bytes);
                }
                Some(guard)
            };

            let descriptor = resolve_remote_descriptor(&self.cfg.archive_url, &fetch_key);
            let dest = raw_path(&self.cache_path(&fetch_key));

            match self.fetcher.fetch_once(&descriptor, &dest).await {
                Outcome::Success(raw) => {
                    info!("Downloaded {} for requested {key}", attempt.key);
                    return self.finish(&raw, attempt.key).await;
                }
                Outcome::NotYetPublished => {
                    info!(
                        "{:?}: {} not published yet, {} tries left",
                        attempt.mode, attempt.key, attempt.remaining_tries
                    );
                    let (date, slot) = previous_slot(attempt.key.date, attempt.key.slot);
                    attempt.key = attempt.key.at(date, slot);
                }
                Outcome::HardFailure(failure) => {
                    warn!("Archive request for {} failed: {failure:?}", attempt.key);
                    return Err(failure.into());
                }
            }
        }

        Err(AcquireError::RetryBudgetExhausted {
            what: "Current data",
            attempts: tries,
        })
    }

    async fn run_forecast(&self, key: DatasetKey, now: DateTime<Utc>) -> Result<Vec<u8>, AcquireError> {
        let (date, slot) = current_slot(now);
        let base = self.find_base_cycle(key.at(date, slot).with_forecast_hour(0)).await?;

        let mut hour = hour_offset(
            slot_timestamp(key.date, key.slot),
            slot_timestamp(base.date, base.slot),
        );
        info!("Base cycle for {key} is {base}, starting at forecast hour {hour}");

        // The forecast is stored under the requested date/slot, not the base cycle.
        let dest = raw_path(&self.cache_path(&key.fetch_key()));
        let mut attempt =
            AcquisitionAttempt::new(base.fetch_key(), self.cfg.forecast_hour_tries, Mode::Forecast);
        let mut attempts = 0;

        while attempt.take_try() {
            attempts += 1;
            let candidate = attempt.key.with_forecast_hour(hour);
            let descriptor = resolve_remote_descriptor(&self.cfg.archive_url, &candidate);

            match self.fetcher.fetch_once(&descriptor, &dest).await {
                Outcome::Success(raw) => {
                    info!("Downloaded {candidate} for requested {key}");
                    return self.finish(&raw, key).await;
                }
                Outcome::NotYetPublished => {
                    info!(
                        "{:?}: {candidate} not published yet, {} tries left",
                        attempt.mode, attempt.remaining_tries
                    );
                    if hour == 0 {
                        break;
                    }
                    hour -= 1;
                }
                Outcome::HardFailure(failure) => {
                    warn!("Archive request for {candidate} failed: {failure:?}");
                    return Err(failure.into());
                }
            }
        }

        Err(AcquireError::RetryBudgetExhausted {
            what: "Forecast data",
            attempts,
        })
    }

    /// Most recent cycle whose analysis (forecast hour 0) is published,
    /// walking back from `start`.
    async fn find_base_cycle(&self, start: DatasetKey) -> Result<DatasetKey, AcquireError> {
        let tries = self.cfg.forecast_base_tries;
        let mut attempt = AcquisitionAttempt::new(start, tries, Mode::Forecast);

        while attempt.take_try() {
            let descriptor = resolve_remote_descriptor(&self.cfg.archive_url, &attempt.key.fetch_key());
            match self.fetcher.probe(&descriptor).await {
                Outcome::Success(()) => return Ok(attempt.key),
                Outcome::NotYetPublished => {
                    debug!("Base cycle {} not published yet", attempt.key);
                    let (date, slot) = previous_slot(attempt.key.date, attempt.key.slot);
                    attempt.key = attempt.key.at(date, slot);
                }
                Outcome::HardFailure(failure) => {
                    warn!("Archive probe for {} failed: {failure:?}", attempt.key);
                    return Err(failure.into());
                }
            }
        }

        Err(AcquireError::RetryBudgetExhausted {
            what: "Latest base cycle",
            attempts: tries,
        })
    }

    /// Converts the raw download and applies the key's post-processing, if any.
    async fn finish(&self, raw: &Path, key: DatasetKey) -> Result<Vec<u8>, AcquireError> {
        let payload = self.converter.convert(raw).await?;
        let (_, post) = key.variable.derivation();
        let Some(post) = post else {
            return Ok(payload);
        };

        let derived = convert::apply(post, &payload, key.level)?;
        cache::persist_atomic(&self.cache_path(&key), &derived).await?;
        Ok(derived)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::http::StatusCode;
    use chrono::TimeZone;
    use serde_json::Value;
    use tempfile::TempDir;

    use super::*;
    use crate::convert::json_path;
    use crate::http_client::FetchFailure;
    use crate::resolver::RemoteDescriptor;
    use crate::types::{Slot, Variable};

    const TEMP_PAYLOAD: &str =
        r#"[{"header":{"refTime":"2023-01-01T12:00:00.000Z"},"data":[250.0,300.0]}]"#;

    #[derive(Clone, Copy, Debug)]
    enum Reply {
        Ok,
        Missing,
        Status(u16),
    }

    #[derive(Default)]
    struct ScriptedFetcher {
        replies: std::sync::Mutex<VecDeque<Reply>>,
        fetched: std::sync::Mutex<Vec<RemoteDescriptor>>,
        probed: std::sync::Mutex<Vec<RemoteDescriptor>>,
        delay: Option<Duration>,
    }

    impl ScriptedFetcher {
        fn new(replies: &[Reply]) -> Self {
            Self {
                replies: std::sync::Mutex::new(replies.iter().copied().collect()),
                ..Default::default()
            }
        }

        fn next(&self) -> Reply {
            self.replies.lock().unwrap().pop_front().unwrap_or(Reply::Missing)
        }

        fn fetched(&self) -> Vec<RemoteDescriptor> {
            self.fetched.lock().unwrap().clone()
        }

        fn probed(&self) -> Vec<RemoteDescriptor> {
            self.probed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn fetch_once(&self, descriptor: &RemoteDescriptor, dest: &Path) -> Outcome<PathBuf> {
            self.fetched.lock().unwrap().push(descriptor.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match self.next() {
                Reply::Ok => {
                    std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
                    std::fs::write(dest, b"GRIB").unwrap();
                    Outcome::Success(dest.to_path_buf())
                }
                Reply::Missing => Outcome::NotYetPublished,
                Reply::Status(code) => Outcome::HardFailure(FetchFailure::Status(code)),
            }
        }

        async fn probe(&self, descriptor: &RemoteDescriptor) -> Outcome<()> {
            self.probed.lock().unwrap().push(descriptor.clone());
            match self.next() {
                Reply::Ok => Outcome::Success(()),
                Reply::Missing => Outcome::NotYetPublished,
                Reply::Status(code) => Outcome::HardFailure(FetchFailure::Status(code)),
            }
        }
    }

    struct FixedConverter {
        payload: &'static str,
        calls: AtomicUsize,
    }

    impl FixedConverter {
        fn new(payload: &'static str) -> Self {
            Self {
                payload,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Converter for FixedConverter {
        async fn convert(&self, raw: &Path) -> Result<Vec<u8>, AcquireError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::fs::write(json_path(raw), self.payload).unwrap();
            Ok(self.payload.as_bytes().to_vec())
        }
    }

    struct Harness {
        _dir: TempDir,
        cfg: Arc<Config>,
        fetcher: Arc<ScriptedFetcher>,
        converter: Arc<FixedConverter>,
        engine: Engine,
    }

    fn harness(fetcher: ScriptedFetcher, payload: &'static str, tune: impl FnOnce(&mut Config)) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::for_tests(dir.path().to_path_buf());
        tune(&mut cfg);
        let cfg = Arc::new(cfg);
        let fetcher = Arc::new(fetcher);
        let converter = Arc::new(FixedConverter::new(payload));
        let engine = Engine::new(cfg.clone(), fetcher.clone(), converter.clone());
        Harness {
            _dir: dir,
            cfg,
            fetcher,
            converter,
            engine,
        }
    }

    fn key(date: &str, time: &str, variable: &str) -> DatasetKey {
        DatasetKey::parse(date, time, "500", variable).unwrap()
    }

    fn dirs(descriptors: &[RemoteDescriptor]) -> Vec<String> {
        descriptors.iter().map(|d| d.dir.clone()).collect()
    }

    fn files(descriptors: &[RemoteDescriptor]) -> Vec<String> {
        descriptors.iter().map(|d| d.file.clone()).collect()
    }

    #[tokio::test]
    async fn current_success_on_first_attempt() {
        let h = harness(ScriptedFetcher::new(&[Reply::Ok]), TEMP_PAYLOAD, |_| {});
        let requested = key("20230101", "1200", "wind");

        let bytes = h.engine.acquire_current(requested).await.unwrap();

        assert_eq!(bytes, TEMP_PAYLOAD.as_bytes());
        assert_eq!(dirs(&h.fetcher.fetched()), vec!["/gfs.20230101/12/atmos"]);
        assert!(h.engine.cache_path(&requested).exists());
        assert!(raw_path(&h.engine.cache_path(&requested)).exists());
    }

    #[tokio::test]
    async fn current_walks_back_one_slot_per_miss_across_year_boundary() {
        let h = harness(
            ScriptedFetcher::new(&[Reply::Missing, Reply::Missing, Reply::Missing, Reply::Ok]),
            TEMP_PAYLOAD,
            |_| {},
        );

        h.engine
            .acquire_current(key("20230101", "1200", "wind"))
            .await
            .unwrap();

        assert_eq!(
            dirs(&h.fetcher.fetched()),
            vec![
                "/gfs.20230101/12/atmos",
                "/gfs.20230101/06/atmos",
                "/gfs.20230101/00/atmos",
                "/gfs.20221231/18/atmos",
            ]
        );
        let found = key("20221231", "1800", "wind");
        assert!(h.engine.cache_path(&found).exists());
    }

    #[tokio::test]
    async fn current_exhausts_after_exactly_budget_requests() {
        let h = harness(ScriptedFetcher::new(&[]), TEMP_PAYLOAD, |_| {});

        let error = h
            .engine
            .acquire_current(key("20230101", "0000", "hgt"))
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            AcquireError::RetryBudgetExhausted { attempts: 5, .. }
        ));
        assert_eq!(error.status(), StatusCode::NOT_FOUND);
        assert_eq!(h.fetcher.fetched().len(), h.cfg.current_tries as usize);
        assert_eq!(h.converter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn zero_budget_issues_no_request() {
        let h = harness(ScriptedFetcher::new(&[Reply::Ok]), TEMP_PAYLOAD, |cfg| {
            cfg.current_tries = 0
        });

        let error = h
            .engine
            .acquire_current(key("20230101", "0000", "hgt"))
            .await
            .unwrap_err();

        assert!(matches!(error, AcquireError::RetryBudgetExhausted { .. }));
        assert!(h.fetcher.fetched().is_empty());
    }

    #[tokio::test]
    async fn hard_failure_short_circuits_without_retry() {
        let h = harness(
            ScriptedFetcher::new(&[Reply::Status(500), Reply::Ok]),
            TEMP_PAYLOAD,
            |_| {},
        );

        let error = h
            .engine
            .acquire_current(key("20230101", "0600", "vvel"))
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            AcquireError::UpstreamHardFailure {
                status: Some(500),
                ..
            }
        ));
        assert_eq!(error.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(h.fetcher.fetched().len(), 1);
    }

    #[tokio::test]
    async fn explicit_acquisition_makes_a_single_attempt() {
        let h = harness(ScriptedFetcher::new(&[Reply::Missing, Reply::Ok]), TEMP_PAYLOAD, |_| {});

        let error = h
            .engine
            .acquire_explicit(key("20230101", "0600", "wind"))
            .await
            .unwrap_err();

        assert_eq!(error.status(), StatusCode::NOT_FOUND);
        assert_eq!(h.fetcher.fetched().len(), 1);
    }

    #[tokio::test]
    async fn air_density_fetches_temperature_and_derives_payload() {
        let h = harness(ScriptedFetcher::new(&[Reply::Ok]), TEMP_PAYLOAD, |_| {});
        let requested = key("20230101", "1200", "air_density");

        let bytes = h.engine.acquire_current(requested).await.unwrap();

        let fetched = h.fetcher.fetched();
        assert_eq!(fetched[0].variable_filters, vec!["TMP"]);
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        let first = value[0]["data"][0].as_f64().unwrap();
        assert!((first - 0.696864).abs() < 1e-12);

        let temp_path = h.engine.cache_path(&requested.fetch_key());
        assert_eq!(std::fs::read(&temp_path).unwrap(), TEMP_PAYLOAD.as_bytes());
        assert_eq!(std::fs::read(h.engine.cache_path(&requested)).unwrap(), bytes);
    }

    #[tokio::test]
    async fn failed_derivation_is_reported_not_substituted() {
        let h = harness(
            ScriptedFetcher::new(&[Reply::Ok]),
            r#"[{"header":{},"data":[0.0]}]"#,
            |_| {},
        );
        let requested = key("20230101", "1200", "air_density");

        let error = h.engine.acquire_current(requested).await.unwrap_err();

        assert!(matches!(error, AcquireError::DerivationFailed(_)));
        assert!(!h.engine.cache_path(&requested).exists());
    }

    #[tokio::test]
    async fn lookup_derives_from_cached_temperature() {
        let h = harness(ScriptedFetcher::new(&[]), TEMP_PAYLOAD, |_| {});
        let requested = key("20230101", "1200", "air_density");
        cache::persist_atomic(&h.engine.cache_path(&requested.fetch_key()), TEMP_PAYLOAD.as_bytes())
            .await
            .unwrap();

        let bytes = h.engine.lookup(&requested).await.unwrap().unwrap();

        assert_ne!(bytes, TEMP_PAYLOAD.as_bytes());
        assert!(h.engine.cache_path(&requested).exists());
        assert!(h.fetcher.fetched().is_empty());
    }

    #[tokio::test]
    async fn evicted_entry_is_downloaded_again() {
        let h = harness(ScriptedFetcher::new(&[Reply::Ok]), TEMP_PAYLOAD, |_| {});
        let requested = key("20230101", "1200", "air_density");
        cache::persist_atomic(&h.engine.cache_path(&requested), b"[]")
            .await
            .unwrap();

        h.engine.evict(&requested).await.unwrap();
        let bytes = h.engine.acquire_current(requested).await.unwrap();

        assert_ne!(bytes, b"[]");
        assert_eq!(h.fetcher.fetched().len(), 1);
    }

    #[tokio::test]
    async fn cache_hit_skips_archive() {
        let h = harness(ScriptedFetcher::new(&[Reply::Ok]), TEMP_PAYLOAD, |_| {});
        let requested = key("20230101", "1200", "wind");
        cache::persist_atomic(&h.engine.cache_path(&requested), b"[]")
            .await
            .unwrap();
        let now = Utc.with_ymd_and_hms(2023, 1, 1, 13, 0, 0).unwrap();

        let bytes = h.engine.acquire(requested, now).await.unwrap();

        assert_eq!(bytes, b"[]");
        assert!(h.fetcher.fetched().is_empty());
    }

    #[tokio::test]
    async fn forecast_finds_base_cycle_then_steps_hours_down() {
        let h = harness(
            ScriptedFetcher::new(&[
                Reply::Missing,
                Reply::Ok,
                Reply::Missing,
                Reply::Missing,
                Reply::Ok,
            ]),
            TEMP_PAYLOAD,
            |_| {},
        );
        let now = Utc.with_ymd_and_hms(2023, 5, 10, 13, 0, 0).unwrap();
        let requested = key("20230511", "1200", "temp");

        h.engine.acquire(requested, now).await.unwrap();

        assert_eq!(
            dirs(&h.fetcher.probed()),
            vec!["/gfs.20230510/12/atmos", "/gfs.20230510/06/atmos"]
        );
        let fetched = h.fetcher.fetched();
        assert_eq!(
            files(&fetched),
            vec![
                "gfs.t06z.pgrb2.0p25.f030",
                "gfs.t06z.pgrb2.0p25.f029",
                "gfs.t06z.pgrb2.0p25.f028",
            ]
        );
        assert!(fetched.iter().all(|d| d.dir == "/gfs.20230510/06/atmos"));
        assert!(h.engine.cache_path(&requested).exists());
        let base_cycle = key("20230510", "0600", "temp");
        assert!(!h.engine.cache_path(&base_cycle).exists());
    }

    #[tokio::test]
    async fn forecast_hours_terminate_within_budget() {
        let h = harness(ScriptedFetcher::new(&[Reply::Ok]), TEMP_PAYLOAD, |_| {});
        let now = Utc.with_ymd_and_hms(2023, 5, 10, 1, 0, 0).unwrap();
        let requested = key("20230512", "0000", "wind");

        let error = h.engine.acquire(requested, now).await.unwrap_err();

        assert!(matches!(
            error,
            AcquireError::RetryBudgetExhausted { attempts: 6, .. }
        ));
        assert_eq!(error.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            files(&h.fetcher.fetched()),
            vec![
                "gfs.t00z.pgrb2.0p25.f048",
                "gfs.t00z.pgrb2.0p25.f047",
                "gfs.t00z.pgrb2.0p25.f046",
                "gfs.t00z.pgrb2.0p25.f045",
                "gfs.t00z.pgrb2.0p25.f044",
                "gfs.t00z.pgrb2.0p25.f043",
            ]
        );
    }

    #[tokio::test]
    async fn forecast_without_base_cycle_is_not_found() {
        let h = harness(ScriptedFetcher::new(&[]), TEMP_PAYLOAD, |cfg| {
            cfg.forecast_base_tries = 3
        });
        let now = Utc.with_ymd_and_hms(2023, 5, 10, 1, 0, 0).unwrap();

        let error = h
            .engine
            .acquire_forecast(key("20230512", "0000", "wind"), now)
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            AcquireError::RetryBudgetExhausted {
                what: "Latest base cycle",
                attempts: 3
            }
        ));
        assert_eq!(h.fetcher.probed().len(), 3);
        assert!(h.fetcher.fetched().is_empty());
    }

    #[tokio::test]
    async fn forecast_probe_hard_failure_is_rejected() {
        let h = harness(ScriptedFetcher::new(&[Reply::Status(503)]), TEMP_PAYLOAD, |_| {});
        let now = Utc.with_ymd_and_hms(2023, 5, 10, 1, 0, 0).unwrap();

        let error = h
            .engine
            .acquire(key("20230512", "0000", "wind"), now)
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            AcquireError::UpstreamHardFailure {
                status: Some(503),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn concurrent_duplicate_requests_share_one_download() {
        let fetcher = ScriptedFetcher {
            delay: Some(Duration::from_millis(50)),
            ..ScriptedFetcher::new(&[Reply::Ok, Reply::Ok])
        };
        let h = harness(fetcher, TEMP_PAYLOAD, |_| {});
        let requested = key("20230101", "1200", "wind");

        let (first, second) = tokio::join!(
            h.engine.acquire_current(requested),
            h.engine.acquire_current(requested)
        );

        assert_eq!(first.unwrap(), second.unwrap());
        assert_eq!(h.fetcher.fetched().len(), 1);
        assert_eq!(h.converter.calls.load(Ordering::SeqCst), 1);
        assert!(h.engine.in_flight.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn temperature_and_air_density_share_one_download() {
        let fetcher = ScriptedFetcher {
            delay: Some(Duration::from_millis(50)),
            ..ScriptedFetcher::new(&[Reply::Ok, Reply::Ok])
        };
        let h = harness(fetcher, TEMP_PAYLOAD, |_| {});
        let temp = key("20230101", "1200", "temp");
        let density = key("20230101", "1200", "air_density");

        let (temp_bytes, density_bytes) = tokio::join!(
            h.engine.acquire_current(temp),
            h.engine.acquire_current(density)
        );

        assert_eq!(temp_bytes.unwrap(), TEMP_PAYLOAD.as_bytes());
        let value: Value = serde_json::from_slice(&density_bytes.unwrap()).unwrap();
        assert!((value[0]["data"][0].as_f64().unwrap() - 0.696864).abs() < 1e-12);
        assert_eq!(h.fetcher.fetched().len(), 1);
        assert_eq!(h.converter.calls.load(Ordering::SeqCst), 1);
        assert!(h.engine.in_flight.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn walk_waits_for_slot_already_being_fetched() {
        let fetcher = ScriptedFetcher {
            delay: Some(Duration::from_millis(50)),
            ..ScriptedFetcher::new(&[Reply::Missing, Reply::Ok])
        };
        let h = harness(fetcher, TEMP_PAYLOAD, |_| {});

        let (walked, direct) = tokio::join!(
            h.engine.acquire_current(key("20230101", "1200", "wind")),
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                h.engine.acquire_current(key("20230101", "0600", "wind")).await
            }
        );

        assert_eq!(walked.unwrap(), direct.unwrap());
        assert_eq!(
            dirs(&h.fetcher.fetched()),
            vec!["/gfs.20230101/12/atmos", "/gfs.20230101/06/atmos"]
        );
        assert_eq!(h.converter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_requests_leave_no_registry_entry() {
        let fetcher = ScriptedFetcher {
            delay: Some(Duration::from_millis(200)),
            ..ScriptedFetcher::new(&[Reply::Ok])
        };
        let h = harness(fetcher, TEMP_PAYLOAD, |_| {});
        let requested = key("20230101", "1200", "wind");

        let cancelled = tokio::time::timeout(
            Duration::from_millis(20),
            h.engine.acquire_current(requested),
        )
        .await;
        assert!(cancelled.is_err());
        assert!(h.engine.in_flight.lock().unwrap().is_empty());
        assert!(!raw_path(&h.engine.cache_path(&requested)).exists());

        let (holder, waiter) = tokio::join!(
            h.engine.acquire_current(requested),
            tokio::time::timeout(Duration::from_millis(20), h.engine.acquire_current(requested))
        );
        assert!(holder.is_ok());
        assert!(waiter.is_err());
        assert!(h.engine.in_flight.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn fresh_request_replaces_only_stale_entries() {
        let h = harness(ScriptedFetcher::new(&[Reply::Ok]), TEMP_PAYLOAD, |_| {});
        let requested = key("20230101", "1200", "wind");
        let stale = r#"[{"header":{"refTime":"2022-12-31T00:00:00.000Z"},"data":[1.0]}]"#;
        cache::persist_atomic(&h.engine.cache_path(&requested), stale.as_bytes())
            .await
            .unwrap();
        let now = Utc.with_ymd_and_hms(2023, 1, 1, 13, 0, 0).unwrap();

        let bytes = h.engine.acquire_current_fresh(requested, now).await.unwrap();
        assert_eq!(bytes, TEMP_PAYLOAD.as_bytes());
        assert_eq!(h.fetcher.fetched().len(), 1);

        let again = h.engine.acquire_current_fresh(requested, now).await.unwrap();
        assert_eq!(again, TEMP_PAYLOAD.as_bytes());
        assert_eq!(h.fetcher.fetched().len(), 1);
    }

    #[test]
    fn attempt_consumes_tries_before_each_request() {
        let dataset = DatasetKey::new(
            chrono::NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
            Slot::H00,
            500,
            Variable::Wind,
        );
        let mut attempt = AcquisitionAttempt::new(dataset, 2, Mode::Current);
        assert!(attempt.take_try());
        assert!(attempt.take_try());
        assert!(!attempt.take_try());
        assert_eq!(attempt.remaining_tries, 0);
        assert_eq!(attempt.mode, Mode::Current);
    }
}
