use chrono::{Duration, NaiveDate, NaiveTime};
use serde::Deserialize;
use slotwise_core::collaborators::EventSink;
use slotwise_core::repository::{HoldRepository, SessionRepository};
use slotwise_core::{
    Clock, ConflictKind, CoreError, CoreResult, Hold, HoldStatus, SessionType, SlotKey, HOLD_TTL_MINUTES,
};
use slotwise_shared::events::HoldCreatedEvent;
use slotwise_shared::Masked;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Longest session a hold may be taken for.
const MAX_DURATION_MINUTES: i32 = 240;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldRequest {
    pub resource_id: String,
    pub slot_date: NaiveDate,
    pub slot_time: NaiveTime,
    pub duration_minutes: i32,
    pub purpose: SessionType,
    pub owner: String,
}

impl HoldRequest {
    pub fn slot(&self) -> SlotKey {
        SlotKey::new(self.resource_id.clone(), self.slot_date, self.slot_time)
    }

    fn validate(&self, now: chrono::DateTime<chrono::Utc>) -> CoreResult<()> {
        if self.resource_id.trim().is_empty() {
            return Err(CoreError::Validation("resource is required".to_string()));
        }
        if self.owner.trim().is_empty() {
            return Err(CoreError::Validation("owner is required".to_string()));
        }
        if self.duration_minutes <= 0 || self.duration_minutes > MAX_DURATION_MINUTES {
            return Err(CoreError::Validation(format!(
                "duration must be between 1 and {} minutes",
                MAX_DURATION_MINUTES
            )));
        }
        if self.slot().starts_at() <= now {
            return Err(CoreError::Validation("slot is in the past".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HoldLookup {
    Id(Uuid),
    Slot(SlotKey),
}

#[derive(Debug, Clone)]
pub struct HoldGrant {
    pub hold: Hold,
    /// True when the caller already held the slot and only the expiry moved.
    pub extended: bool,
}

/// Creates, refreshes, releases and inspects slot holds.
///
/// Holds no state of its own. Which of several concurrent callers wins a slot
/// is decided by the hold store's uniqueness constraint, so any number of
/// replicas can run this side by side.
pub struct HoldManager {
    holds: Arc<dyn HoldRepository>,
    sessions: Arc<dyn SessionRepository>,
    clock: Arc<dyn Clock>,
    events: Option<Arc<dyn EventSink>>,
    ttl: Duration,
}

impl HoldManager {
    pub fn new(
        holds: Arc<dyn HoldRepository>,
        sessions: Arc<dyn SessionRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            holds,
            sessions,
            clock,
            events: None,
            ttl: Duration::minutes(HOLD_TTL_MINUTES),
        }
    }

    /// Publishes a `hold.created` event for every new hold.
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn create_or_extend(&self, req: HoldRequest) -> CoreResult<HoldGrant> {
        let now = self.clock.now();
        req.validate(now)?;

        // Lazy sweep: expired rows are only removed when someone asks for a
        // slot (or by the optional reaper).
        let purged = self.holds.purge_expired(now).await?;
        if purged > 0 {
            debug!("Purged {} expired holds", purged);
        }

        let slot = req.slot();
        if self.sessions.find_booked(&slot).await?.is_some() {
            return Err(CoreError::slot_booked());
        }

        match self.holds.find_active_by_slot(&slot, now).await? {
            Some(current) if current.is_owned_by(&req.owner) => match self.extend(&current, &req, now).await? {
                Some(grant) => Ok(grant),
                // Released or expired between the read and the update.
                None => self.insert(&req, &slot, now).await,
            },
            Some(current) => {
                debug!("Slot {} held until {}", slot, current.expires_at);
                Err(CoreError::slot_held(current.expires_at))
            }
            None => self.insert(&req, &slot, now).await,
        }
    }

    async fn extend(
        &self,
        current: &Hold,
        req: &HoldRequest,
        now: chrono::DateTime<chrono::Utc>,
    ) -> CoreResult<Option<HoldGrant>> {
        let refreshed = self
            .holds
            .extend_hold(current.id, &req.owner, now + self.ttl, now)
            .await?;
        Ok(refreshed.map(|hold| {
            info!("Hold {} on {} extended for {}", hold.id, hold.slot(), Masked(&req.owner));
            HoldGrant { hold, extended: true }
        }))
    }

    /// Inserts a new hold. If the insert loses to a concurrent request from
    /// the same owner, the winning hold is extended instead.
    async fn insert(&self, req: &HoldRequest, slot: &SlotKey, now: chrono::DateTime<chrono::Utc>) -> CoreResult<HoldGrant> {
        match self.insert_new(req, slot, now).await {
            Err(err @ CoreError::Conflict { kind: ConflictKind::SlotHeld, .. }) => {
                match self.holds.find_active_by_slot(slot, now).await? {
                    Some(current) if current.is_owned_by(&req.owner) => {
                        self.extend(&current, req, now).await?.ok_or(err)
                    }
                    _ => Err(err),
                }
            }
            other => other,
        }
    }

    async fn insert_new(&self, req: &HoldRequest, slot: &SlotKey, now: chrono::DateTime<chrono::Utc>) -> CoreResult<HoldGrant> {
        let hold = Hold::new(slot, req.duration_minutes, req.purpose, req.owner.clone(), now, self.ttl);
        let hold = self.holds.insert_hold(&hold, now).await?;
        info!("Hold {} created on {} for {}", hold.id, slot, Masked(&req.owner));

        if let Some(events) = &self.events {
            let event = HoldCreatedEvent {
                hold_id: hold.id,
                resource_id: hold.resource_id.clone(),
                slot_date: hold.slot_date,
                slot_time: hold.slot_time,
                expires_at: hold.expires_at.timestamp(),
            };
            if let Err(e) = events.publish_hold_created(&event).await {
                warn!("Failed to publish hold.created for {}: {}", hold.id, e);
            }
        }
        Ok(HoldGrant { hold, extended: false })
    }

    /// Deletes a hold. With `owner`, only the owner may release it.
    pub async fn release(&self, hold_id: Uuid, owner: Option<&str>) -> CoreResult<()> {
        let hold = self
            .holds
            .get_hold(hold_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("hold {}", hold_id)))?;

        if let Some(owner) = owner {
            if !hold.is_owned_by(owner) {
                return Err(CoreError::Forbidden(format!("hold {} belongs to another owner", hold_id)));
            }
        }

        if !self.holds.delete_hold(hold_id).await? {
            return Err(CoreError::NotFound(format!("hold {}", hold_id)));
        }
        info!("Hold {} released", hold_id);
        Ok(())
    }

    /// Expiry is evaluated against the clock on every call.
    pub async fn status(&self, lookup: HoldLookup) -> CoreResult<HoldStatus> {
        let now = self.clock.now();
        let hold = match lookup {
            HoldLookup::Id(id) => self.holds.get_hold(id).await?,
            HoldLookup::Slot(slot) => self.holds.find_active_by_slot(&slot, now).await?,
        };
        Ok(HoldStatus::evaluate(hold.as_ref(), now))
    }

    /// Purge pass for the background reaper.
    pub async fn reap_expired(&self) -> CoreResult<u64> {
        self.holds.purge_expired(self.clock.now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use slotwise_core::{ManualClock, NewSession, Session};
    use slotwise_store::MemoryStore;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 30, 9, 0, 0).unwrap()
    }

    fn setup() -> (Arc<MemoryStore>, Arc<ManualClock>, HoldManager) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let manager = HoldManager::new(store.clone(), store.clone(), clock.clone());
        (store, clock, manager)
    }

    fn request(coach: &str, date: (i32, u32, u32), hour: u32, owner: &str) -> HoldRequest {
        HoldRequest {
            resource_id: coach.to_string(),
            slot_date: NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap(),
            slot_time: NaiveTime::from_hms_opt(hour, 0, 0).unwrap(),
            duration_minutes: 45,
            purpose: SessionType::Coaching,
            owner: owner.to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_then_conflict_for_other_owner() {
        let (_, _, manager) = setup();
        let grant = manager
            .create_or_extend(request("coachB", (2025, 6, 2), 15, "p1@example.com"))
            .await
            .unwrap();
        assert!(!grant.extended);
        assert_eq!(grant.hold.expires_at, start() + Duration::minutes(10));

        let err = manager
            .create_or_extend(request("coachB", (2025, 6, 2), 15, "p2@example.com"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "slot_held");
        assert_eq!(err.retry_after(), Some(grant.hold.expires_at));
    }

    #[tokio::test]
    async fn test_new_hold_is_announced_once() {
        let (_, _, manager) = setup();
        let events = Arc::new(slotwise_store::memory::MemoryEventSink::new());
        let manager = manager.with_events(events.clone());

        let grant = manager
            .create_or_extend(request("coachA", (2025, 6, 1), 10, "p1@example.com"))
            .await
            .unwrap();
        manager
            .create_or_extend(request("coachA", (2025, 6, 1), 10, "p1@example.com"))
            .await
            .unwrap();

        let published = events.hold_events().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].hold_id, grant.hold.id);
    }

    /// Misses the slot's hold on the first lookup, like a request racing
    /// another one from the same owner.
    struct LateReads {
        inner: Arc<MemoryStore>,
        missed: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl HoldRepository for LateReads {
        async fn purge_expired(&self, now: DateTime<Utc>) -> CoreResult<u64> {
            self.inner.purge_expired(now).await
        }

        async fn insert_hold(&self, hold: &Hold, now: DateTime<Utc>) -> CoreResult<Hold> {
            self.inner.insert_hold(hold, now).await
        }

        async fn get_hold(&self, id: Uuid) -> CoreResult<Option<Hold>> {
            self.inner.get_hold(id).await
        }

        async fn find_active_by_slot(&self, slot: &SlotKey, now: DateTime<Utc>) -> CoreResult<Option<Hold>> {
            if !self.missed.swap(true, std::sync::atomic::Ordering::SeqCst) {
                return Ok(None);
            }
            self.inner.find_active_by_slot(slot, now).await
        }

        async fn extend_hold(
            &self,
            id: Uuid,
            owner: &str,
            expires_at: DateTime<Utc>,
            now: DateTime<Utc>,
        ) -> CoreResult<Option<Hold>> {
            self.inner.extend_hold(id, owner, expires_at, now).await
        }

        async fn delete_hold(&self, id: Uuid) -> CoreResult<bool> {
            self.inner.delete_hold(id).await
        }
    }

    fn racing(store: &Arc<MemoryStore>, clock: &Arc<ManualClock>) -> HoldManager {
        let holds = Arc::new(LateReads {
            inner: store.clone(),
            missed: std::sync::atomic::AtomicBool::new(false),
        });
        HoldManager::new(holds, store.clone(), clock.clone())
    }

    #[tokio::test]
    async fn test_same_owner_losing_insert_extends_own_hold() {
        let (store, clock, manager) = setup();
        let first = manager
            .create_or_extend(request("coachA", (2025, 6, 1), 10, "p1@example.com"))
            .await
            .unwrap();

        clock.advance(Duration::minutes(3));
        let second = racing(&store, &clock)
            .create_or_extend(request("coachA", (2025, 6, 1), 10, "p1@example.com"))
            .await
            .unwrap();

        assert!(second.extended);
        assert_eq!(second.hold.id, first.hold.id);
        assert_eq!(second.hold.expires_at, start() + Duration::minutes(13));
        assert_eq!(store.hold_count().await, 1);

        let err = racing(&store, &clock)
            .create_or_extend(request("coachA", (2025, 6, 1), 10, "p2@example.com"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "slot_held");
    }

    #[tokio::test]
    async fn test_same_owner_extends() {
        let (_, clock, manager) = setup();
        let first = manager
            .create_or_extend(request("coachA", (2025, 6, 1), 10, "p1@example.com"))
            .await
            .unwrap();

        clock.advance(Duration::minutes(4));
        let second = manager
            .create_or_extend(request("coachA", (2025, 6, 1), 10, "p1@example.com"))
            .await
            .unwrap();

        assert!(second.extended);
        assert_eq!(second.hold.id, first.hold.id);
        assert_eq!(second.hold.expires_at, start() + Duration::minutes(14));
    }

    #[tokio::test]
    async fn test_expired_hold_can_be_taken_by_another_owner() {
        let (_, clock, manager) = setup();
        let first = manager
            .create_or_extend(request("coachA", (2025, 6, 1), 10, "p1@example.com"))
            .await
            .unwrap();

        clock.advance(Duration::minutes(11));
        let second = manager
            .create_or_extend(request("coachA", (2025, 6, 1), 10, "p2@example.com"))
            .await
            .unwrap();

        assert_ne!(second.hold.id, first.hold.id);
        assert_eq!(second.hold.owner, "p2@example.com");
    }

    #[tokio::test]
    async fn test_expired_hold_reads_inactive_before_purge() {
        let (store, clock, manager) = setup();
        let grant = manager
            .create_or_extend(request("coachA", (2025, 6, 1), 10, "p1@example.com"))
            .await
            .unwrap();

        clock.advance(Duration::minutes(10));
        let status = manager.status(HoldLookup::Id(grant.hold.id)).await.unwrap();
        assert_eq!(status, HoldStatus::inactive());
        let status = manager.status(HoldLookup::Slot(grant.hold.slot())).await.unwrap();
        assert!(!status.active);
        // Still physically present.
        assert_eq!(store.hold_count().await, 1);
    }

    #[tokio::test]
    async fn test_create_sweeps_expired_holds_on_other_slots() {
        let (store, clock, manager) = setup();
        manager
            .create_or_extend(request("coachA", (2025, 6, 1), 10, "p1@example.com"))
            .await
            .unwrap();
        clock.advance(Duration::minutes(12));
        manager
            .create_or_extend(request("coachC", (2025, 6, 3), 11, "p2@example.com"))
            .await
            .unwrap();
        assert_eq!(store.hold_count().await, 1);
    }

    #[tokio::test]
    async fn test_booked_slot_is_rejected() {
        let (store, _, manager) = setup();
        let session = Session::scheduled(
            NewSession {
                enrollment_id: Uuid::new_v4(),
                coach_id: "coachA".to_string(),
                child_id: "child-1".to_string(),
                session_number: 1,
                session_type: SessionType::Coaching,
                scheduled_date: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
                scheduled_time: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
                duration_minutes: 45,
            },
            start(),
        );
        store.insert_session(session).await;

        let err = manager
            .create_or_extend(request("coachA", (2025, 6, 1), 10, "p1@example.com"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "slot_booked");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creates_have_one_winner() {
        let (_, _, manager) = setup();
        let manager = Arc::new(manager);

        let mut tasks = Vec::new();
        for i in 0..16 {
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move {
                manager
                    .create_or_extend(request("coachB", (2025, 6, 2), 15, &format!("parent{}@example.com", i)))
                    .await
            }));
        }

        let mut winners = Vec::new();
        let mut conflicts = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(grant) => winners.push(grant.hold),
                Err(err) => {
                    assert_eq!(err.code(), "slot_held");
                    conflicts += 1;
                }
            }
        }
        assert_eq!(winners.len(), 1);
        assert_eq!(conflicts, 15);
    }

    #[tokio::test]
    async fn test_release_checks_owner() {
        let (_, _, manager) = setup();
        let grant = manager
            .create_or_extend(request("coachA", (2025, 6, 1), 10, "p1@example.com"))
            .await
            .unwrap();

        let err = manager.release(grant.hold.id, Some("p2@example.com")).await.unwrap_err();
        assert!(matches!(err, CoreError::Forbidden(_)));

        manager.release(grant.hold.id, Some("p1@example.com")).await.unwrap();
        let err = manager.release(grant.hold.id, None).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_rejects_past_slot_and_bad_duration() {
        let (_, _, manager) = setup();
        let err = manager
            .create_or_extend(request("coachA", (2025, 5, 29), 10, "p1@example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));

        let mut req = request("coachA", (2025, 6, 1), 10, "p1@example.com");
        req.duration_minutes = 0;
        assert!(matches!(manager.create_or_extend(req).await, Err(CoreError::Validation(_))));
    }
}
