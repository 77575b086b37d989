//! Eventually consistent local mirror of all [`MimirRule`] objects.
//!
//! The [`CacheWriter`] is the only owner allowed to mutate the mirror. It
//! consumes the watch stream on a single task, publishes the new state to all
//! [`RuleCache`] readers and fans out one [`CacheEvent`] per observed change.
//! Readers only ever get cloned `Arc`s of immutable objects.

use std::{collections::HashMap, fmt, str::FromStr, sync::Arc};

use futures::{Stream, StreamExt};
use kube::ResourceExt;
use kube_runtime::watcher;
use mimir_rules_controller_apis::MimirRule;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::errors::ControllerError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl From<&MimirRule> for NamespacedName {
    fn from(o: &MimirRule) -> Self {
        Self {
            name: o.name_any(),
            namespace: o.namespace().unwrap_or_else(|| "".to_string()),
        }
    }
}

impl FromStr for NamespacedName {
    type Err = ControllerError;

    /// Parses `namespace/name`, or `name` for objects without namespace.
    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let (namespace, name) = match key.split('/').collect::<Vec<_>>().as_slice() {
            [name] => ("", *name),
            [namespace, name] => (*namespace, *name),
            _ => return Err(ControllerError::InvalidKey(key.to_string())),
        };
        if name.is_empty() {
            return Err(ControllerError::InvalidKey(key.to_string()));
        }
        Ok(Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }
}

/// Change notification, emitted after the mirror has been updated.
#[derive(Clone, Debug)]
pub(crate) enum CacheEvent {
    Added(Arc<MimirRule>),
    Updated {
        old: Arc<MimirRule>,
        new: Arc<MimirRule>,
    },
    Deleted(Arc<MimirRule>),
}

impl CacheEvent {
    pub fn key(&self) -> NamespacedName {
        match self {
            CacheEvent::Added(o) | CacheEvent::Updated { new: o, .. } | CacheEvent::Deleted(o) => {
                NamespacedName::from(o.as_ref())
            }
        }
    }
}

#[derive(Default)]
struct CacheState {
    objects: HashMap<NamespacedName, Arc<MimirRule>>,
    synced: bool,
}

/// Read handle, cheap to clone.
#[derive(Clone)]
pub(crate) struct RuleCache {
    state: watch::Receiver<CacheState>,
}

impl RuleCache {
    pub fn get(&self, key: &NamespacedName) -> Option<Arc<MimirRule>> {
        self.state.borrow().objects.get(key).cloned()
    }

    /// All objects matching `filter`, ordered by key.
    pub fn list<F>(&self, filter: F) -> Vec<Arc<MimirRule>>
    where
        F: Fn(&MimirRule) -> bool,
    {
        let state = self.state.borrow();
        let mut keys: Vec<&NamespacedName> = state
            .objects
            .iter()
            .filter(|(_, o)| filter(o))
            .map(|(k, _)| k)
            .collect();
        keys.sort();
        keys.into_iter()
            .filter_map(|k| state.objects.get(k).cloned())
            .collect()
    }

    /// `true` once the initial listing has been fully drained into the cache.
    pub fn has_synced(&self) -> bool {
        self.state.borrow().synced
    }

    pub async fn wait_for_sync(&self) -> Result<(), ControllerError> {
        let mut state = self.state.clone();
        state
            .wait_for(|s| s.synced)
            .await
            .map(|_| ())
            .map_err(|_| ControllerError::CacheSync("cache writer stopped".to_string()))
    }
}

pub(crate) struct CacheWriter {
    state: watch::Sender<CacheState>,
    events: mpsc::UnboundedSender<CacheEvent>,
    /// Objects of an ongoing (re-)listing, swapped in on `InitDone`.
    listing: Option<HashMap<NamespacedName, Arc<MimirRule>>>,
}

/// Create an empty cache, its writer and the receiving end of its change notifications.
pub(crate) fn cache() -> (CacheWriter, RuleCache, mpsc::UnboundedReceiver<CacheEvent>) {
    let (state, reader) = watch::channel(CacheState::default());
    let (events, notifications) = mpsc::unbounded_channel();
    (
        CacheWriter {
            state,
            events,
            listing: None,
        },
        RuleCache { state: reader },
        notifications,
    )
}

impl CacheWriter {
    pub fn apply(&mut self, event: watcher::Event<MimirRule>) {
        let mut notifications = Vec::new();
        match event {
            watcher::Event::Init => {
                self.listing = Some(HashMap::new());
            }
            watcher::Event::InitApply(obj) => {
                let obj = Arc::new(obj);
                self.listing
                    .get_or_insert_with(HashMap::new)
                    .insert(NamespacedName::from(obj.as_ref()), obj);
            }
            watcher::Event::InitDone => {
                let listing = self.listing.take().unwrap_or_default();
                self.state.send_modify(|state| {
                    for (key, new) in &listing {
                        notifications.push(match state.objects.get(key) {
                            Some(old) => CacheEvent::Updated {
                                old: old.clone(),
                                new: new.clone(),
                            },
                            None => CacheEvent::Added(new.clone()),
                        });
                    }
                    for (key, old) in &state.objects {
                        if !listing.contains_key(key) {
                            notifications.push(CacheEvent::Deleted(old.clone()));
                        }
                    }
                    state.objects = listing;
                    state.synced = true;
                });
            }
            watcher::Event::Apply(obj) => {
                let obj = Arc::new(obj);
                let key = NamespacedName::from(obj.as_ref());
                self.state.send_modify(|state| {
                    notifications.push(match state.objects.insert(key, obj.clone()) {
                        Some(old) => CacheEvent::Updated { old, new: obj },
                        None => CacheEvent::Added(obj),
                    });
                });
            }
            watcher::Event::Delete(obj) => {
                let key = NamespacedName::from(&obj);
                self.state.send_modify(|state| {
                    let old = state.objects.remove(&key).unwrap_or_else(|| Arc::new(obj));
                    notifications.push(CacheEvent::Deleted(old));
                });
            }
        }
        for notification in notifications {
            if self.events.send(notification).is_err() {
                debug!("dropping cache notification, no receiver left");
            }
        }
    }

    /// Drain the watch stream into the cache until it ends or `cancel` fires.
    pub async fn run<S>(mut self, stream: S, cancel: CancellationToken)
    where
        S: Stream<Item = Result<watcher::Event<MimirRule>, watcher::Error>>,
    {
        let mut stream = std::pin::pin!(stream);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                item = stream.next() => match item {
                    Some(Ok(event)) => self.apply(event),
                    Some(Err(e)) => warn!("MimirRule watch failed, retrying: {}", e),
                    None => break,
                },
            }
        }
        info!("stopped MimirRule cache");
    }
}
