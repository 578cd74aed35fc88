//! Local replica of the registry collections
//!
//! Each collection is mirrored into an [`IndexedCache`] by its own task: open
//! the realtime feed, backfill existing records while the feed buffers, then
//! apply live events until the stream ends, and reconnect with backoff. A
//! mirror that cannot reach the registry keeps serving its last known state.

use crate::indexed_cache::{Indexed, IndexedCache, ID_INDEX};
use crate::models::{Instance, Machine, User};
use crate::registry::{Backoff, FeedAction, FeedEvent, RegistryClient, RegistryError};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const INSTANCES: &str = "instances";
pub const USERS: &str = "users";
pub const MACHINES: &str = "machines";

/// One mirrored collection
pub struct MirrorCache<T> {
    collection: String,
    cache: IndexedCache<T>,
}

impl<T> MirrorCache<T>
where
    T: Indexed + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(collection: impl Into<String>) -> Self {
        let collection = collection.into();
        Self {
            cache: IndexedCache::new(collection.clone()),
            collection,
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn cache(&self) -> &IndexedCache<T> {
        &self.cache
    }

    pub fn get(&self, field: &str, value: &str) -> Option<Arc<T>> {
        self.cache.get_by_index(field, value)
    }

    /// Apply one feed event. Malformed events are logged and skipped.
    pub fn apply(&self, event: &FeedEvent) {
        match event.action {
            FeedAction::Create | FeedAction::Update => {
                self.upsert_value(event.record.clone());
            }
            FeedAction::Delete => match event.record_id() {
                Some(id) => {
                    self.cache.delete_by_index(ID_INDEX, id);
                }
                None => {
                    error!(collection = %self.collection, "Delete event has no record id");
                }
            },
            FeedAction::Unknown => {
                debug!(collection = %self.collection, "Ignoring unknown feed action");
            }
        }
    }

    /// Decode and upsert a raw record, returning its id on success
    pub fn upsert_value(&self, value: serde_json::Value) -> Option<String> {
        match serde_json::from_value::<T>(value) {
            Ok(record) => {
                let id = record
                    .field_map()
                    .into_iter()
                    .find(|(field, _)| *field == ID_INDEX)
                    .map(|(_, id)| id);
                self.cache.upsert(record);
                id
            }
            Err(e) => {
                warn!(collection = %self.collection, error = %e, "Failed to decode registry record");
                None
            }
        }
    }

    /// Load every existing record, then drop local records the registry no longer has.
    ///
    /// Records are walked in id order so the listing is complete even when
    /// records are deleted mid-walk. Only ids absent from that complete
    /// listing are pruned.
    pub async fn backfill(&self, client: &RegistryClient) -> Result<usize, RegistryError> {
        let page_size = client.page_size() as usize;
        let mut seen = HashSet::new();
        let mut cursor: Option<String> = None;
        loop {
            let items = client.list_records(&self.collection, cursor.as_deref()).await?;
            let full = items.len() >= page_size;
            let mut last_id = None;
            for item in items {
                if let Some(id) = item.get("id").and_then(|id| id.as_str()) {
                    last_id = Some(id.to_string());
                }
                if let Some(id) = self.upsert_value(item) {
                    seen.insert(id);
                }
            }
            match last_id {
                Some(id) if full && cursor.as_deref() != Some(id.as_str()) => cursor = Some(id),
                _ => break,
            }
        }

        let mut stale = Vec::new();
        self.cache.range(|record| {
            if let Some((_, id)) = record.field_map().into_iter().find(|(f, _)| *f == ID_INDEX) {
                if !seen.contains(&id) {
                    stale.push(id);
                }
            }
            true
        });
        for id in &stale {
            self.cache.delete_by_index(ID_INDEX, id);
        }
        if !stale.is_empty() {
            info!(collection = %self.collection, removed = stale.len(), "Pruned records missing from registry");
        }

        Ok(seen.len())
    }

    /// Mirror the collection until shutdown
    pub async fn run(self: Arc<Self>, client: Arc<RegistryClient>, mut shutdown: watch::Receiver<bool>) {
        info!(collection = %self.collection, "Starting mirroring");
        let mut backoff = client.backoff();

        loop {
            if *shutdown.borrow() {
                break;
            }
            if !client.is_authenticated() {
                client.authenticate_until_ok().await;
            }

            let result = tokio::select! {
                result = self.follow(&client, &mut backoff) => result,
                _ = shutdown.changed() => break,
            };

            match result {
                Ok(()) => info!(collection = %self.collection, "Registry feed ended, reconnecting"),
                Err(RegistryError::Unauthorized) => {
                    warn!(collection = %self.collection, "Registry session rejected, re-authenticating");
                    client.invalidate();
                }
                Err(e) => warn!(collection = %self.collection, error = %e, "Registry feed failed"),
            }

            let delay = backoff.next_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!(collection = %self.collection, "Stopped mirroring");
    }

    async fn follow(&self, client: &RegistryClient, backoff: &mut Backoff) -> Result<(), RegistryError> {
        let mut feed = client.open_feed(&self.collection).await?;
        backoff.reset();

        let loaded = self.backfill(client).await?;
        info!(collection = %self.collection, records = loaded, "Backfilled collection");

        while let Some(event) = feed.next().await {
            let event = match event {
                Ok(event) => event,
                Err(RegistryError::Decode(e)) => {
                    warn!(collection = %self.collection, error = %e, "Skipping malformed feed event");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if client.debug() {
                debug!(collection = %self.collection, action = ?event.action, record = %event.record, "Feed event");
            }
            self.apply(&event);
        }
        Ok(())
    }
}

/// The three mirrored collections plus host lookups over them
pub struct Mirror {
    instances: Arc<MirrorCache<Instance>>,
    users: Arc<MirrorCache<User>>,
    machines: Arc<MirrorCache<Machine>>,
    apex_domain: Option<String>,
}

impl Mirror {
    pub fn new(apex_domain: Option<String>) -> Self {
        Self {
            instances: Arc::new(MirrorCache::new(INSTANCES)),
            users: Arc::new(MirrorCache::new(USERS)),
            machines: Arc::new(MirrorCache::new(MACHINES)),
            apex_domain: apex_domain
                .map(|apex| apex.trim_matches('.').to_ascii_lowercase())
                .filter(|apex| !apex.is_empty()),
        }
    }

    pub fn instances(&self) -> &MirrorCache<Instance> {
        &self.instances
    }

    pub fn users(&self) -> &MirrorCache<User> {
        &self.users
    }

    pub fn machines(&self) -> &MirrorCache<Machine> {
        &self.machines
    }

    /// Authenticate in the background, then mirror every collection
    pub fn start(&self, client: Arc<RegistryClient>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let instances = Arc::clone(&self.instances);
        let users = Arc::clone(&self.users);
        let machines = Arc::clone(&self.machines);

        tokio::spawn(async move {
            client.authenticate_until_ok().await;
            info!("Registry client authenticated");

            let tasks = vec![
                tokio::spawn(instances.run(Arc::clone(&client), shutdown.clone())),
                tokio::spawn(users.run(Arc::clone(&client), shutdown.clone())),
                tokio::spawn(machines.run(client, shutdown)),
            ];
            for task in tasks {
                if let Err(e) = task.await {
                    error!(error = %e, "Mirror task panicked");
                }
            }
        })
    }

    /// Find the instance a request host is addressed to.
    ///
    /// An active custom domain wins over the platform subdomain.
    pub fn instance_by_host_header(&self, host: &str) -> Option<Arc<Instance>> {
        let host = normalize_host(host);
        if host.is_empty() {
            return None;
        }

        if let Some(instance) = self.instances.get("cname", &host) {
            if instance.cname_active {
                return Some(instance);
            }
            debug!(host = %host, instance_id = %instance.id, "Custom domain not active");
        }

        let subdomain = self.subdomain_of(&host)?;
        self.instances.get("subdomain", subdomain)
    }

    pub fn user_by_id(&self, id: &str) -> Option<Arc<User>> {
        self.users.get(ID_INDEX, id)
    }

    pub fn machine_by_id(&self, id: &str) -> Option<Arc<Machine>> {
        self.machines.get(ID_INDEX, id)
    }

    fn subdomain_of<'a>(&self, host: &'a str) -> Option<&'a str> {
        match &self.apex_domain {
            Some(apex) => host
                .strip_suffix(apex.as_str())
                .and_then(|rest| rest.strip_suffix('.'))
                .filter(|sub| !sub.is_empty()),
            None => host.split('.').next().filter(|sub| !sub.is_empty()),
        }
    }
}

/// Lowercase and strip any port
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let host = match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    };
    host.trim_end_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(action: FeedAction, record: serde_json::Value) -> FeedEvent {
        FeedEvent { action, record }
    }

    fn mirror_with(apex: Option<&str>) -> Mirror {
        let mirror = Mirror::new(apex.map(String::from));
        mirror.instances().apply(&event(
            FeedAction::Create,
            json!({"id": "i1", "uid": "u1", "subdomain": "acme", "cname": "www.acme.com", "cname_active": true}),
        ));
        mirror.instances().apply(&event(
            FeedAction::Create,
            json!({"id": "i2", "uid": "u1", "subdomain": "beta", "cname": "www.beta.com", "cname_active": false}),
        ));
        mirror
    }

    #[test]
    fn test_apply_create_update_delete() {
        let cache: MirrorCache<User> = MirrorCache::new(USERS);

        cache.apply(&event(FeedAction::Create, json!({"id": "u1", "email": "a@example.com"})));
        assert!(cache.get("email", "a@example.com").is_some());

        cache.apply(&event(FeedAction::Update, json!({"id": "u1", "email": "b@example.com"})));
        assert!(cache.get("email", "a@example.com").is_none());
        assert_eq!(cache.get("id", "u1").unwrap().email, "b@example.com");

        cache.apply(&event(FeedAction::Delete, json!({"id": "u1"})));
        assert!(cache.get("id", "u1").is_none());
        assert!(cache.get("email", "b@example.com").is_none());
    }

    #[test]
    fn test_malformed_record_is_skipped() {
        let cache: MirrorCache<User> = MirrorCache::new(USERS);
        cache.apply(&event(FeedAction::Create, json!({"id": "u1", "verified": "yes"})));
        assert!(cache.cache().is_empty());

        // The mirror keeps working afterwards
        cache.apply(&event(FeedAction::Create, json!({"id": "u2"})));
        assert_eq!(cache.cache().len(), 1);
    }

    #[test]
    fn test_delete_without_id_is_ignored() {
        let cache: MirrorCache<Machine> = MirrorCache::new(MACHINES);
        cache.apply(&event(FeedAction::Create, json!({"id": "m1"})));
        cache.apply(&event(FeedAction::Delete, json!({})));
        assert_eq!(cache.cache().len(), 1);
    }

    #[test]
    fn test_lookup_by_active_cname() {
        let mirror = mirror_with(None);
        assert_eq!(mirror.instance_by_host_header("www.acme.com").unwrap().id, "i1");
        assert_eq!(mirror.instance_by_host_header("WWW.ACME.COM:443").unwrap().id, "i1");
    }

    #[test]
    fn test_inactive_cname_is_not_routed() {
        let mirror = mirror_with(Some("tenant.example"));
        assert!(mirror.instance_by_host_header("www.beta.com").is_none());
    }

    #[test]
    fn test_lookup_by_subdomain_under_apex() {
        let mirror = mirror_with(Some("tenant.example"));
        assert_eq!(mirror.instance_by_host_header("acme.tenant.example").unwrap().id, "i1");
        assert_eq!(mirror.instance_by_host_header("beta.tenant.example:8080").unwrap().id, "i2");
        assert!(mirror.instance_by_host_header("acme.other.example").is_none());
        assert!(mirror.instance_by_host_header("tenant.example").is_none());
    }

    #[test]
    fn test_lookup_by_first_label_without_apex() {
        let mirror = mirror_with(None);
        assert_eq!(mirror.instance_by_host_header("acme.anything.test").unwrap().id, "i1");
        assert!(mirror.instance_by_host_header("missing.anything.test").is_none());
        assert!(mirror.instance_by_host_header("").is_none());
    }

    #[test]
    fn test_user_and_machine_lookup() {
        let mirror = Mirror::new(None);
        mirror.users().apply(&event(FeedAction::Create, json!({"id": "u1", "verified": true})));
        mirror.machines().apply(&event(FeedAction::Create, json!({"id": "m1", "privateUrl": "http://10.0.0.2:8080"})));

        assert!(mirror.user_by_id("u1").unwrap().verified);
        assert_eq!(mirror.machine_by_id("m1").unwrap().private_url, "http://10.0.0.2:8080");
        assert!(mirror.user_by_id("").is_none());
        assert!(mirror.machine_by_id("m2").is_none());
    }

    mod against_registry {
        use super::*;
        use crate::registry::testing::FakeRegistry;
        use std::time::Duration;

        async fn eventually(what: &str, check: impl Fn() -> bool) {
            for _ in 0..300 {
                if check() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("timed out waiting for {}", what);
        }

        fn instance(id: &str, subdomain: &str) -> serde_json::Value {
            json!({"id": id, "uid": "u1", "subdomain": subdomain})
        }

        #[tokio::test]
        async fn test_backfill_survives_deletes_between_pages() {
            let registry = FakeRegistry::start().await;
            for (id, subdomain) in [("a", "alpha"), ("b", "bravo"), ("c", "charlie"), ("d", "delta")] {
                registry.insert(INSTANCES, instance(id, subdomain));
            }
            let client = registry.client();
            client.authenticate().await.unwrap();

            let cache: MirrorCache<Instance> = MirrorCache::new(INSTANCES);
            cache.apply(&event(FeedAction::Create, instance("c", "charlie")));
            cache.apply(&event(FeedAction::Create, instance("z", "gone")));

            // "a" disappears after the first page; "c" must not be skipped
            registry.delete_after_next_list(INSTANCES, "a");
            let loaded = cache.backfill(&client).await.unwrap();

            assert_eq!(loaded, 4);
            for id in ["a", "b", "c", "d"] {
                assert!(cache.get("id", id).is_some(), "{} missing after backfill", id);
            }
            assert!(cache.get("id", "z").is_none());
            assert!(cache.get("subdomain", "gone").is_none());
        }

        #[tokio::test]
        async fn test_event_during_backfill_is_applied_after_it() {
            let registry = FakeRegistry::start().await;
            registry.insert(INSTANCES, instance("i1", "old"));
            registry.update_during_next_list(INSTANCES, instance("i1", "new"));

            let cache = Arc::new(MirrorCache::<Instance>::new(INSTANCES));
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let handle = tokio::spawn(Arc::clone(&cache).run(Arc::new(registry.client()), shutdown_rx));

            eventually("buffered update", || cache.get("subdomain", "new").is_some()).await;
            assert!(cache.get("subdomain", "old").is_none());
            assert_eq!(registry.connects(), 1);

            shutdown_tx.send(true).unwrap();
            tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        }

        #[tokio::test]
        async fn test_reconnects_after_feed_ends() {
            let registry = FakeRegistry::start().await;
            registry.insert(INSTANCES, instance("i1", "first"));

            let cache = Arc::new(MirrorCache::<Instance>::new(INSTANCES));
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let handle = tokio::spawn(Arc::clone(&cache).run(Arc::new(registry.client()), shutdown_rx));

            registry.wait_for_subscriptions(1).await;
            eventually("initial backfill", || cache.get("id", "i1").is_some()).await;

            // Created while the feed is down; only the re-backfill can see it
            registry.insert(INSTANCES, instance("i2", "quiet"));
            registry.drop_feeds();
            registry.wait_for_subscriptions(2).await;
            eventually("re-backfill", || cache.get("subdomain", "quiet").is_some()).await;

            registry.push(INSTANCES, "create", instance("i3", "live"));
            eventually("live event after reconnect", || cache.get("subdomain", "live").is_some()).await;
            assert_eq!(registry.connects(), 2);
            assert_eq!(registry.logins(), 1);

            shutdown_tx.send(true).unwrap();
            tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        }

        #[tokio::test]
        async fn test_rejected_session_reauthenticates() {
            let registry = FakeRegistry::start().await;
            let cache = Arc::new(MirrorCache::<Instance>::new(INSTANCES));
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let handle = tokio::spawn(Arc::clone(&cache).run(Arc::new(registry.client()), shutdown_rx));

            registry.wait_for_subscriptions(1).await;
            assert_eq!(registry.logins(), 1);

            registry.rotate_token();
            registry.drop_feeds();
            registry.wait_for_subscriptions(2).await;
            assert_eq!(registry.logins(), 2);

            registry.push(INSTANCES, "create", instance("i1", "after-reauth"));
            eventually("event on the new session", || cache.get("subdomain", "after-reauth").is_some()).await;

            shutdown_tx.send(true).unwrap();
            tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        }
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("Acme.Example.COM"), "acme.example.com");
        assert_eq!(normalize_host("acme.example.com:8080"), "acme.example.com");
        assert_eq!(normalize_host("acme.example.com."), "acme.example.com");
        assert_eq!(normalize_host("  acme  "), "acme");
    }
}
