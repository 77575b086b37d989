//! In-memory stand-ins for the external collaborators of the controller.

use std::{
    collections::{BTreeMap, HashSet},
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use k8s_openapi::{
    apimachinery::pkg::{apis::meta::v1::Time, util::intstr::IntOrString},
    chrono::{self, DateTime, TimeZone, Utc},
};
use kube::{ResourceExt, api::ObjectMeta, error::ErrorResponse};
use kube_runtime::watcher;
use mimir_rules_controller_apis::{
    MimirRule, MimirRuleSpec, RemoteRuleGroup, Rule, RuleGroup,
};

use crate::{
    cache::{CacheWriter, NamespacedName},
    errors::ControllerError,
    leader::{Clock, LeaderElectionError, LeaseRecord, LeaseStore},
    metrics::SyncMetrics,
    mimir_client::{RuleClient, RuleClientError},
    store::RuleStore,
};

pub(crate) fn key(namespace: &str, name: &str) -> NamespacedName {
    NamespacedName {
        namespace: namespace.to_string(),
        name: name.to_string(),
    }
}

pub(crate) fn alerting_rule(alert: &str, expr: &str) -> Rule {
    Rule {
        record: None,
        alert: Some(alert.to_string()),
        expr: IntOrString::String(expr.to_string()),
        for_: Some("5m".to_string()),
        labels: Default::default(),
        annotations: Default::default(),
    }
}

pub(crate) fn group(name: &str, rules: Vec<Rule>) -> RuleGroup {
    RuleGroup {
        name: name.to_string(),
        interval: None,
        evaluation_delay: None,
        limit: None,
        rules,
        source_tenants: vec![],
    }
}

/// A rule with a single group `g1` alerting on `up == 0`.
pub(crate) fn rule(namespace: &str, name: &str, generation: i64) -> MimirRule {
    MimirRule {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            generation: Some(generation),
            resource_version: Some("1".to_string()),
            ..Default::default()
        },
        spec: MimirRuleSpec {
            groups: vec![group("g1", vec![alerting_rule("InstanceDown", "up == 0")])],
        },
        status: None,
    }
}

pub(crate) fn api_error(code: u16) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: "fake api server".to_string(),
        reason: "Fake".to_string(),
        code,
    })
}

/// Fake API server for [`MimirRule`] objects. Every write is echoed into the
/// attached cache, like the watch stream of a real API server would.
#[derive(Default)]
pub(crate) struct FakeRuleStore {
    objects: Mutex<BTreeMap<String, MimirRule>>,
    cache: Mutex<Option<CacheWriter>>,
    version: AtomicU64,
    status_writes: AtomicUsize,
    finalizer_writes: AtomicUsize,
    failing: AtomicBool,
}

impl FakeRuleStore {
    pub fn with_cache(writer: CacheWriter) -> Self {
        let store = Self::default();
        *store.cache.lock().unwrap() = Some(writer);
        store
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 2).to_string()
    }

    fn echo(&self, event: watcher::Event<MimirRule>) {
        if let Some(writer) = self.cache.lock().unwrap().as_mut() {
            writer.apply(event);
        }
    }

    fn store(&self, mut obj: MimirRule) -> MimirRule {
        obj.metadata.resource_version = Some(self.next_version());
        self.objects.lock().unwrap().insert(obj.id(), obj.clone());
        self.echo(watcher::Event::Apply(obj.clone()));
        obj
    }

    fn remove(&self, id: &str) -> Option<MimirRule> {
        let obj = self.objects.lock().unwrap().remove(id);
        if let Some(obj) = &obj {
            self.echo(watcher::Event::Delete(obj.clone()));
        }
        obj
    }

    pub fn insert(&self, obj: MimirRule) -> MimirRule {
        self.store(obj)
    }

    pub fn get(&self, id: &str) -> Option<MimirRule> {
        self.objects.lock().unwrap().get(id).cloned()
    }

    /// Modify a stored object, bumping its generation if the spec changed.
    pub fn edit<F: FnOnce(&mut MimirRule)>(&self, id: &str, f: F) -> MimirRule {
        let mut obj = self.get(id).unwrap();
        let spec = obj.spec.clone();
        f(&mut obj);
        if obj.spec != spec {
            obj.metadata.generation = Some(obj.generation() + 1);
        }
        self.store(obj)
    }

    /// Request deletion, the object is removed once it has no finalizers.
    pub fn delete(&self, id: &str) -> Option<MimirRule> {
        let mut obj = self.get(id)?;
        if obj.finalizers().is_empty() {
            return self.remove(id);
        }
        if obj.metadata.deletion_timestamp.is_none() {
            obj.metadata.deletion_timestamp = Some(Time(Utc::now()));
            obj.metadata.generation = Some(obj.generation() + 1);
        }
        Some(self.store(obj))
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn status_writes(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }

    pub fn finalizer_writes(&self) -> usize {
        self.finalizer_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RuleStore for FakeRuleStore {
    async fn update_finalizers(
        &self,
        rule: &MimirRule,
        finalizers: Vec<String>,
    ) -> Result<MimirRule, ControllerError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ControllerError::Persist(api_error(500)));
        }
        let mut obj = self
            .get(&rule.id())
            .ok_or_else(|| ControllerError::Persist(api_error(404)))?;
        // the patch is guarded by the resourceVersion that was read
        if obj.resource_version() != rule.resource_version() {
            return Err(ControllerError::Persist(api_error(422)));
        }
        self.finalizer_writes.fetch_add(1, Ordering::SeqCst);
        obj.metadata.finalizers = Some(finalizers);
        if obj.is_deleted() && obj.finalizers().is_empty() {
            self.remove(&rule.id());
            return Ok(obj);
        }
        Ok(self.store(obj))
    }

    async fn update_status(&self, rule: &MimirRule) -> Result<MimirRule, ControllerError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ControllerError::Persist(api_error(500)));
        }
        let mut obj = self
            .get(&rule.id())
            .ok_or_else(|| ControllerError::Persist(api_error(404)))?;
        if obj.resource_version() != rule.resource_version() {
            return Err(ControllerError::Persist(api_error(409)));
        }
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        obj.status = rule.status.clone();
        Ok(self.store(obj))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum RemoteCall {
    Create { namespace: String, group: String },
    Delete { namespace: String, group: String },
}

/// In-memory ruler.
#[derive(Default)]
pub(crate) struct FakeRuleClient {
    namespaces: Mutex<BTreeMap<String, Vec<RemoteRuleGroup>>>,
    calls: Mutex<Vec<RemoteCall>>,
    failing: Mutex<HashSet<String>>,
}

impl FakeRuleClient {
    /// Creates and deletes, in order. Listing is not recorded.
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Names of the groups stored under `namespace`, in creation order.
    pub fn groups(&self, namespace: &str) -> Vec<String> {
        self.namespaces
            .lock()
            .unwrap()
            .get(namespace)
            .map(|groups| groups.iter().map(|g| g.name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn group(&self, namespace: &str, name: &str) -> Option<RemoteRuleGroup> {
        self.namespaces
            .lock()
            .unwrap()
            .get(namespace)
            .and_then(|groups| groups.iter().find(|g| g.name == name).cloned())
    }

    /// Reject every create or delete of group `name`.
    pub fn fail_group(&self, name: &str) {
        self.failing.lock().unwrap().insert(name.to_string());
    }

    pub fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }

    fn check(&self, group: &str) -> Result<(), RuleClientError> {
        if self.failing.lock().unwrap().contains(group) {
            Err(RuleClientError::Status {
                status: 500,
                body: "fake ruler failure".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RuleClient for FakeRuleClient {
    async fn create_rule_group(
        &self,
        namespace: &str,
        group: &RemoteRuleGroup,
    ) -> Result<(), RuleClientError> {
        self.calls.lock().unwrap().push(RemoteCall::Create {
            namespace: namespace.to_string(),
            group: group.name.clone(),
        });
        self.check(&group.name)?;
        let mut namespaces = self.namespaces.lock().unwrap();
        let groups = namespaces.entry(namespace.to_string()).or_default();
        match groups.iter_mut().find(|g| g.name == group.name) {
            Some(existing) => *existing = group.clone(),
            None => groups.push(group.clone()),
        }
        Ok(())
    }

    async fn list_rule_groups(&self, namespace: &str) -> Result<Vec<String>, RuleClientError> {
        Ok(self.groups(namespace))
    }

    async fn delete_rule_group(
        &self,
        namespace: &str,
        group: &str,
    ) -> Result<(), RuleClientError> {
        self.calls.lock().unwrap().push(RemoteCall::Delete {
            namespace: namespace.to_string(),
            group: group.to_string(),
        });
        self.check(group)?;
        let mut namespaces = self.namespaces.lock().unwrap();
        if let Some(groups) = namespaces.get_mut(namespace) {
            groups.retain(|g| g.name != group);
            if groups.is_empty() {
                namespaces.remove(namespace);
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct RecordingMetrics {
    syncs: AtomicUsize,
    errors: AtomicUsize,
}

impl RecordingMetrics {
    pub fn syncs(&self) -> usize {
        self.syncs.load(Ordering::SeqCst)
    }

    pub fn errors(&self) -> usize {
        self.errors.load(Ordering::SeqCst)
    }
}

impl SyncMetrics for RecordingMetrics {
    fn record_sync(&self, _duration: Duration, failed: bool) {
        self.syncs.fetch_add(1, Ordering::SeqCst);
        if failed {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Lease store with compare-and-swap on a version counter.
#[derive(Default)]
pub(crate) struct FakeLeaseStore {
    record: Mutex<Option<LeaseRecord>>,
    version: AtomicU64,
    failing: AtomicBool,
}

impl FakeLeaseStore {
    pub fn record(&self) -> Option<LeaseRecord> {
        self.record.lock().unwrap().clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Overwrite the holder, bypassing the version check.
    pub fn steal(&self, holder: &str, now: DateTime<Utc>) {
        let mut record = self.record.lock().unwrap();
        if let Some(record) = record.as_mut() {
            record.holder = Some(holder.to_string());
            record.renew_time = Some(now);
            record.version = Some(self.next_version());
        }
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn check(&self) -> Result<(), LeaderElectionError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(LeaderElectionError::Kube(api_error(503)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LeaseStore for FakeLeaseStore {
    async fn get(&self) -> Result<Option<LeaseRecord>, LeaderElectionError> {
        self.check()?;
        Ok(self.record())
    }

    async fn create(&self, record: &LeaseRecord) -> Result<LeaseRecord, LeaderElectionError> {
        self.check()?;
        let mut current = self.record.lock().unwrap();
        if current.is_some() {
            return Err(LeaderElectionError::Conflict);
        }
        let mut stored = record.clone();
        stored.version = Some(self.next_version());
        *current = Some(stored.clone());
        Ok(stored)
    }

    async fn update(&self, record: &LeaseRecord) -> Result<LeaseRecord, LeaderElectionError> {
        self.check()?;
        let mut current = self.record.lock().unwrap();
        match current.as_ref() {
            Some(c) if c.version == record.version => (),
            _ => return Err(LeaderElectionError::Conflict),
        }
        let mut stored = record.clone();
        stored.version = Some(self.next_version());
        *current = Some(stored.clone());
        Ok(stored)
    }
}

/// Clock which only moves when told to.
pub(crate) struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self {
            now: Mutex::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
        }
    }
}

impl ManualClock {
    pub fn advance(&self, d: Duration) {
        *self.now.lock().unwrap() += chrono::Duration::milliseconds(d.as_millis() as i64);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}
