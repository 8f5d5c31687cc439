//! In-crate fakes for the external collaborators, shared by unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::{Result, SourceError};
use crate::fetch::source::{PayloadSource, ScheduleSource};
use crate::proxy::IdentitySource;
use crate::types::{PayloadKind, ProxyIdentity, ScheduleEntry};

type Reply = std::result::Result<Vec<u8>, SourceError>;

/// Payload + schedule source driven by a script of replies. Once the script
/// runs out every call gets `fallback`. Kinds listed in `failing_kinds`
/// always get their configured error regardless of the script.
pub struct ScriptedSource {
    script: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    failing_kinds: HashMap<PayloadKind, SourceError>,
    schedule: Mutex<std::result::Result<Vec<ScheduleEntry>, SourceError>>,
    delay: Option<Duration>,
    calls: AtomicU32,
    schedule_calls: AtomicU32,
    seen: Mutex<Vec<ProxyIdentity>>,
    requested: Mutex<Vec<(String, PayloadKind)>>,
    replacements: Mutex<Vec<usize>>,
}

impl ScriptedSource {
    pub fn always(reply: Reply) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: reply,
            failing_kinds: HashMap::new(),
            schedule: Mutex::new(Ok(Vec::new())),
            delay: None,
            calls: AtomicU32::new(0),
            schedule_calls: AtomicU32::new(0),
            seen: Mutex::new(Vec::new()),
            requested: Mutex::new(Vec::new()),
            replacements: Mutex::new(Vec::new()),
        }
    }

    pub fn always_ok(body: &[u8]) -> Self {
        Self::always(Ok(body.to_vec()))
    }

    pub fn with_script(script: Vec<Reply>) -> Self {
        let source = Self::always(Ok(b"{}".to_vec()));
        *source.script.lock().unwrap() = script.into();
        source
    }

    pub fn failing_kind(mut self, kind: PayloadKind, err: SourceError) -> Self {
        self.failing_kinds.insert(kind, err);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_schedule(&self, schedule: std::result::Result<Vec<ScheduleEntry>, SourceError>) {
        *self.schedule.lock().unwrap() = schedule;
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn schedule_calls(&self) -> u32 {
        self.schedule_calls.load(Ordering::SeqCst)
    }

    pub fn identities_seen(&self) -> Vec<ProxyIdentity> {
        self.seen.lock().unwrap().clone()
    }

    pub fn requested(&self) -> Vec<(String, PayloadKind)> {
        self.requested.lock().unwrap().clone()
    }

    /// Identity-set sizes reported through `identities_replaced`.
    pub fn replacements(&self) -> Vec<usize> {
        self.replacements.lock().unwrap().clone()
    }
}

#[async_trait]
impl PayloadSource for ScriptedSource {
    async fn get_payload(
        &self,
        identity: &ProxyIdentity,
        event_id: &str,
        kind: PayloadKind,
    ) -> std::result::Result<Vec<u8>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(identity.clone());
        self.requested.lock().unwrap().push((event_id.to_string(), kind));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.failing_kinds.get(&kind) {
            return Err(err.clone());
        }
        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| self.fallback.clone())
    }

    fn identities_replaced(&self, current: &[ProxyIdentity]) {
        self.replacements.lock().unwrap().push(current.len());
    }
}

#[async_trait]
impl ScheduleSource for ScriptedSource {
    async fn get_schedule(
        &self,
        _identity: &ProxyIdentity,
        _date: NaiveDate,
    ) -> std::result::Result<Vec<ScheduleEntry>, SourceError> {
        self.schedule_calls.fetch_add(1, Ordering::SeqCst);
        self.schedule.lock().unwrap().clone()
    }
}

/// Identity source that counts how often the pool reloads it.
pub struct CountingIdentities {
    identities: Vec<ProxyIdentity>,
    loads: AtomicU32,
}

impl CountingIdentities {
    pub fn new(identities: Vec<ProxyIdentity>) -> Self {
        Self { identities, loads: AtomicU32::new(0) }
    }

    pub fn loads(&self) -> u32 {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentitySource for CountingIdentities {
    async fn load(&self) -> Result<Vec<ProxyIdentity>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.identities.clone())
    }
}
