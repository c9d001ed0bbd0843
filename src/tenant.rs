use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, Offset, TimeZone, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::info;

use crate::engine::Engine;
use crate::limits::*;
use crate::locks::ReservationLockManager;
use crate::model::{Booking, Ms, Span, TenantId};
use crate::notify::NotifyHub;
use crate::reaper;

/// A tenant's wall clock, as a fixed UTC offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timezone(FixedOffset);

impl Timezone {
    pub fn utc() -> Self {
        Self(Utc.fix())
    }

    pub fn from_offset_secs(secs: i32) -> Option<Self> {
        FixedOffset::east_opt(secs).map(Self)
    }

    pub fn offset(&self) -> FixedOffset {
        self.0
    }

    /// The instant at which `time` strikes on `date`.
    pub fn instant(&self, date: NaiveDate, time: NaiveTime) -> Option<Ms> {
        self.0
            .from_local_datetime(&date.and_time(time))
            .single()
            .map(|dt| dt.timestamp_millis())
    }

    /// Local midnight to the next local midnight.
    pub fn day_span(&self, date: NaiveDate) -> Option<Span> {
        let midnight = NaiveTime::from_hms_opt(0, 0, 0)?;
        let start = self.instant(date, midnight)?;
        let end = self.instant(date.succ_opt()?, midnight)?;
        Some(Span::new(start, end))
    }

    pub fn to_local(&self, at: Ms) -> Option<DateTime<FixedOffset>> {
        DateTime::from_timestamp_millis(at).map(|utc| utc.with_timezone(&self.0))
    }
}

impl Default for Timezone {
    fn default() -> Self {
        Self::utc()
    }
}

impl fmt::Display for Timezone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Timezone {
    type Err = String;

    /// Accepts `UTC`, `GMT`, `Z`, `+02:00`, `-0530` and `+5`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if matches!(s.to_ascii_uppercase().as_str(), "UTC" | "GMT" | "Z" | "ETC/UTC") {
            return Ok(Self::utc());
        }
        let bad = || format!("unsupported timezone: {s}");
        let (sign, rest) = match s.as_bytes().first() {
            Some(b'+') => (1, &s[1..]),
            Some(b'-') => (-1, &s[1..]),
            _ => return Err(bad()),
        };
        let digits: String = rest.chars().filter(|c| *c != ':').collect();
        if digits.is_empty() || digits.len() > 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(bad());
        }
        let (hours, minutes) = if digits.len() <= 2 {
            (digits.parse::<i32>().map_err(|_| bad())?, 0)
        } else {
            let split = digits.len() - 2;
            (
                digits[..split].parse::<i32>().map_err(|_| bad())?,
                digits[split..].parse::<i32>().map_err(|_| bad())?,
            )
        };
        if hours > 14 || minutes > 59 {
            return Err(bad());
        }
        Self::from_offset_secs(sign * (hours * 3600 + minutes * 60)).ok_or_else(bad)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Locale {
    En,
    #[default]
    Es,
}

impl Locale {
    /// `es`, `es_ES`, `es-ES.UTF-8` ... Anything unrecognised is `None`.
    pub fn from_tag(tag: &str) -> Option<Self> {
        let lang: String = tag
            .trim()
            .chars()
            .take_while(|c| c.is_ascii_alphabetic())
            .collect();
        match lang.to_ascii_lowercase().as_str() {
            "en" | "c" | "posix" => Some(Locale::En),
            "es" => Some(Locale::Es),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Locale::En => "en",
            Locale::Es => "es",
        }
    }
}

/// Who is asking: threaded explicitly into every engine operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantContext {
    pub id: TenantId,
    pub timezone: Timezone,
    pub locale: Locale,
}

impl TenantContext {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: TenantId::new(id),
            timezone: Timezone::utc(),
            locale: Locale::default(),
        }
    }

    pub fn with_timezone(mut self, timezone: Timezone) -> Self {
        self.timezone = timezone;
        self
    }

    pub fn with_locale(mut self, locale: Locale) -> Self {
        self.locale = locale;
        self
    }
}

/// Manages per-tenant engines. Each tenant gets its own Engine + WAL + compactor;
/// reservation locks are shared by every tenant through one lock manager.
pub struct TenantManager {
    engines: DashMap<TenantId, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    locks: Arc<ReservationLockManager>,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, locks: Arc<ReservationLockManager>) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            locks,
        }
    }

    pub fn locks(&self) -> &Arc<ReservationLockManager> {
        &self.locks
    }

    /// Get or lazily create the engine for `ctx.id`. The context seen on first
    /// use fixes the engine's timezone and locale.
    pub fn get_or_create(&self, ctx: &TenantContext) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(&ctx.id) {
            return Ok(engine.value().clone());
        }
        let name = ctx.id.as_str();
        if name.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        if name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }
        let file_stem = wal_file_stem(name);

        let engine = match self.engines.entry(ctx.id.clone()) {
            Entry::Occupied(existing) => return Ok(existing.get().clone()),
            Entry::Vacant(slot) => {
                let wal_path = self.data_dir.join(format!("{file_stem}.wal"));
                let engine = Arc::new(Engine::new(
                    ctx.clone(),
                    wal_path,
                    Arc::new(NotifyHub::new()),
                    self.locks.clone(),
                )?);
                slot.insert(engine.clone());
                engine
            }
        };

        tokio::spawn(reaper::run_compactor(Arc::downgrade(&engine), self.compact_threshold));

        info!(tenant = %ctx.id, timezone = %ctx.timezone, locale = ctx.locale.as_str(), "tenant loaded");
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }

    /// Every booking of every loaded tenant. Administrative escape hatch only.
    pub fn unscoped_bookings(&self) -> Vec<Booking> {
        let engines: Vec<Arc<Engine>> = self.engines.iter().map(|e| e.value().clone()).collect();
        let mut all: Vec<Booking> = engines
            .iter()
            .flat_map(|engine| engine.unscoped_bookings())
            .collect();
        all.sort_by_key(|b| (b.span.start, b.id));
        all
    }
}

/// File stem for a tenant's WAL. ASCII letters, digits, `_` and `-` stay as
/// they are; every other byte becomes `%XX`, so distinct tenants never share
/// a file and no name can leave the data directory.
fn wal_file_stem(name: &str) -> String {
    let mut stem = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            stem.push(byte as char);
        } else {
            stem.push_str(&format!("%{byte:02X}"));
        }
    }
    stem
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("lessond_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(dir: PathBuf) -> TenantManager {
        TenantManager::new(dir, 1000, Arc::new(ReservationLockManager::in_memory()))
    }

    #[test]
    fn timezone_parsing() {
        assert_eq!("UTC".parse::<Timezone>().unwrap(), Timezone::utc());
        assert_eq!(
            "+02:00".parse::<Timezone>().unwrap(),
            Timezone::from_offset_secs(7200).unwrap()
        );
        assert_eq!(
            "-0530".parse::<Timezone>().unwrap(),
            Timezone::from_offset_secs(-(5 * 3600 + 30 * 60)).unwrap()
        );
        assert_eq!(
            "+5".parse::<Timezone>().unwrap(),
            Timezone::from_offset_secs(5 * 3600).unwrap()
        );
        assert!("Europe/Madrid".parse::<Timezone>().is_err());
        assert!("+25:00".parse::<Timezone>().is_err());
    }

    #[test]
    fn day_span_follows_offset() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let utc = Timezone::utc().day_span(date).unwrap();
        assert_eq!(utc.start, 1_704_067_200_000);
        assert_eq!(utc.duration_ms(), 86_400_000);

        let plus_two = "+02:00".parse::<Timezone>().unwrap().day_span(date).unwrap();
        assert_eq!(plus_two.start, utc.start - 7_200_000);
    }

    #[test]
    fn locale_tags() {
        assert_eq!(Locale::from_tag("es_ES.UTF-8"), Some(Locale::Es));
        assert_eq!(Locale::from_tag("en-US"), Some(Locale::En));
        assert_eq!(Locale::from_tag("C"), Some(Locale::En));
        assert_eq!(Locale::from_tag("fr"), None);
        assert_eq!(Locale::default(), Locale::Es);
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = manager(dir.clone());

        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
        let _eng = tm.get_or_create(&TenantContext::new("my_school")).unwrap();
        assert!(dir.join("my_school.wal").exists());
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let tm = manager(test_data_dir("same_eng"));
        let eng1 = tm.get_or_create(&TenantContext::new("foo")).unwrap();
        let eng2 = tm.get_or_create(&TenantContext::new("foo")).unwrap();
        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test]
    async fn first_context_fixes_timezone() {
        let tm = manager(test_data_dir("first_ctx"));
        let plus_one = "+01:00".parse::<Timezone>().unwrap();
        tm.get_or_create(&TenantContext::new("foo").with_timezone(plus_one))
            .unwrap();
        let again = tm.get_or_create(&TenantContext::new("foo")).unwrap();
        assert_eq!(again.tenant().timezone, plus_one);
    }

    #[tokio::test]
    async fn tenant_name_stays_in_data_dir() {
        let dir = test_data_dir("sanitize");
        let tm = manager(dir.clone());

        let _eng = tm.get_or_create(&TenantContext::new("../evil")).unwrap();
        assert!(dir.join("%2E%2E%2Fevil.wal").exists());
        let _eng = tm.get_or_create(&TenantContext::new("../..")).unwrap();
        assert!(dir.join("%2E%2E%2F%2E%2E.wal").exists());
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 2);

        assert!(tm.get_or_create(&TenantContext::new("")).is_err());
    }

    #[test]
    fn wal_stems_never_collide() {
        let names = ["schoola", "school.a", "school a", "school%2Ea", "escuela-ñ", "escuela-n"];
        let stems: std::collections::HashSet<String> = names.iter().map(|n| wal_file_stem(n)).collect();
        assert_eq!(stems.len(), names.len());
        assert_eq!(wal_file_stem("my_school-1"), "my_school-1");
    }

    #[tokio::test]
    async fn look_alike_tenants_keep_separate_logs() {
        use crate::model::{VehicleStatus, VehicleType};
        use ulid::Ulid;

        let dir = test_data_dir("look_alike");
        let student = Ulid::new();
        let vehicle = Ulid::new();
        {
            let tm = manager(dir.clone());
            let dotted = tm.get_or_create(&TenantContext::new("a.b")).unwrap();
            let plain = tm.get_or_create(&TenantContext::new("ab")).unwrap();
            dotted.upsert_student(student, 4, None).await.unwrap();
            dotted
                .upsert_vehicle(vehicle, VehicleType::Manual, VehicleStatus::Active, None, None, None)
                .await
                .unwrap();
            plain.upsert_student(student, 9, None).await.unwrap();
            plain.compact_wal().await.unwrap();
        }
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 2);

        let tm = manager(dir);
        let dotted = tm.get_or_create(&TenantContext::new("a.b")).unwrap();
        let plain = tm.get_or_create(&TenantContext::new("ab")).unwrap();
        assert_eq!(dotted.student_credits(student).await, Some(4));
        assert!(dotted.get_vehicle(vehicle).is_some());
        assert_eq!(plain.student_credits(student).await, Some(9));
        assert!(plain.get_vehicle(vehicle).is_none());
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let tm = manager(test_data_dir("name_too_long"));
        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&TenantContext::new(long_name)).err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test]
    async fn tenant_count_limit() {
        let tm = manager(test_data_dir("count_limit"));
        for i in 0..MAX_TENANTS {
            tm.get_or_create(&TenantContext::new(format!("t{i}"))).unwrap();
        }
        let err = tm.get_or_create(&TenantContext::new("one_more")).err().unwrap();
        assert!(err.to_string().contains("too many tenants"));
    }
}
