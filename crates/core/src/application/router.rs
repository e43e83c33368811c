// Output Router - multiplexes app output into per-tenant ordered streams
//
// Many producers (slot pump tasks, the supervisor itself) publish into one
// bounded queue per tenant; the transport layer drains it through a
// subscription. Publishing never blocks: when a queue is full the oldest
// event is dropped and a synthetic Truncated marker takes its place, so
// bounded memory wins over lossless history.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::debug;

use crate::application::command::{OutboundEvent, OutboundKind};
use crate::domain::{AppKey, TenantId};
use crate::port::TimeProvider;

struct TenantOutbox {
    queue: Mutex<VecDeque<OutboundEvent>>,
    notify: Notify,
}

impl TenantOutbox {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }
}

pub struct OutputRouter {
    capacity: usize,
    time_provider: Arc<dyn TimeProvider>,
    outboxes: Mutex<HashMap<TenantId, Arc<TenantOutbox>>>,
    /// Last publish time per app, consulted for eviction fairness
    activity: Mutex<HashMap<AppKey, i64>>,
}

impl OutputRouter {
    /// `capacity` is the per-tenant event bound; at least 2 so a Truncated
    /// marker and the newest event always fit together.
    pub fn new(capacity: usize, time_provider: Arc<dyn TimeProvider>) -> Self {
        assert!(capacity >= 2, "outbox capacity must be at least 2");
        Self {
            capacity,
            time_provider,
            outboxes: Mutex::new(HashMap::new()),
            activity: Mutex::new(HashMap::new()),
        }
    }

    fn outbox(&self, tenant: &str) -> Arc<TenantOutbox> {
        let mut outboxes = self.outboxes.lock().unwrap();
        outboxes
            .entry(tenant.to_string())
            .or_insert_with(|| Arc::new(TenantOutbox::new()))
            .clone()
    }

    /// Enqueue an event for its tenant; never blocks
    pub fn publish(&self, event: OutboundEvent) {
        if let Some(app) = &event.app {
            if matches!(event.kind, OutboundKind::Output { .. }) {
                let key = AppKey::new(event.tenant.clone(), app.clone());
                self.activity
                    .lock()
                    .unwrap()
                    .insert(key, self.time_provider.now_millis());
            }
        }

        let outbox = self.outbox(&event.tenant);
        {
            let mut queue = outbox.queue.lock().unwrap();
            if queue.len() >= self.capacity {
                // Drop the two oldest events and plant a single marker in
                // their place. Markers only ever live at the front, so a
                // previous marker is simply replaced and consecutive
                // overflow runs coalesce into one.
                let victim = queue.pop_front().expect("queue is full, not empty");
                queue.pop_front();
                queue.push_front(OutboundEvent {
                    tenant: victim.tenant,
                    app: victim.app,
                    kind: OutboundKind::Truncated,
                });
                debug!(tenant = %event.tenant, "Outbox full, dropped oldest events");
            }
            queue.push_back(event);
        }
        outbox.notify.notify_one();
    }

    /// Subscribe to a tenant's outbound stream
    pub fn subscribe(&self, tenant: &str) -> OutputSubscription {
        OutputSubscription {
            outbox: self.outbox(tenant),
        }
    }

    /// When the app last produced output (epoch ms); 0 if never
    pub fn last_activity(&self, key: &AppKey) -> i64 {
        self.activity.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    /// Drop bookkeeping for a deleted app
    pub fn forget(&self, key: &AppKey) {
        self.activity.lock().unwrap().remove(key);
    }
}

/// Lazy per-tenant consumer handle for the transport layer
pub struct OutputSubscription {
    outbox: Arc<TenantOutbox>,
}

impl OutputSubscription {
    /// Next event in order, waiting if the queue is empty
    pub async fn recv(&mut self) -> OutboundEvent {
        loop {
            if let Some(event) = self.outbox.queue.lock().unwrap().pop_front() {
                return event;
            }
            self.outbox.notify.notified().await;
        }
    }

    /// Non-blocking pop
    pub fn try_recv(&mut self) -> Option<OutboundEvent> {
        self.outbox.queue.lock().unwrap().pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::time_provider::SystemTimeProvider;

    fn output(tenant: &str, app: &str, data: &str) -> OutboundEvent {
        OutboundEvent {
            tenant: tenant.to_string(),
            app: Some(app.to_string()),
            kind: OutboundKind::Output {
                stream: "stdout".to_string(),
                data: data.to_string(),
            },
        }
    }

    fn router(capacity: usize) -> OutputRouter {
        OutputRouter::new(capacity, Arc::new(SystemTimeProvider))
    }

    fn data_of(event: &OutboundEvent) -> Option<&str> {
        match &event.kind {
            OutboundKind::Output { data, .. } => Some(data),
            _ => None,
        }
    }

    #[tokio::test]
    async fn per_app_order_is_preserved() {
        let router = router(16);
        let mut sub = router.subscribe("t1");

        for i in 0..3 {
            router.publish(output("t1", "a", &format!("a{i}")));
            router.publish(output("t1", "b", &format!("b{i}")));
        }

        let mut a_seen = vec![];
        let mut b_seen = vec![];
        for _ in 0..6 {
            let event = sub.recv().await;
            match event.app.as_deref() {
                Some("a") => a_seen.push(data_of(&event).unwrap().to_string()),
                Some("b") => b_seen.push(data_of(&event).unwrap().to_string()),
                other => panic!("unexpected app {other:?}"),
            }
        }
        assert_eq!(a_seen, vec!["a0", "a1", "a2"]);
        assert_eq!(b_seen, vec!["b0", "b1", "b2"]);
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_inserts_marker() {
        let router = router(4);
        let mut sub = router.subscribe("t1");

        for i in 0..8 {
            router.publish(output("t1", "a", &format!("c{i}")));
        }

        // queue is bounded at 4: marker first, then the newest events
        let first = sub.recv().await;
        assert!(matches!(first.kind, OutboundKind::Truncated));

        let mut rest = vec![];
        while let Some(event) = sub.try_recv() {
            rest.push(data_of(&event).unwrap().to_string());
        }
        assert_eq!(rest, vec!["c5", "c6", "c7"]);
    }

    #[tokio::test]
    async fn consecutive_markers_coalesce() {
        let router = router(4);
        let mut sub = router.subscribe("t1");

        for i in 0..20 {
            router.publish(output("t1", "a", &format!("c{i}")));
        }

        let mut markers = 0;
        while let Some(event) = sub.try_recv() {
            if matches!(event.kind, OutboundKind::Truncated) {
                markers += 1;
            }
        }
        assert_eq!(markers, 1);
    }

    #[tokio::test]
    async fn tenants_are_isolated() {
        let router = router(4);
        let mut sub1 = router.subscribe("t1");
        let mut sub2 = router.subscribe("t2");

        router.publish(output("t1", "a", "for-t1"));
        router.publish(output("t2", "b", "for-t2"));

        assert_eq!(data_of(&sub1.recv().await), Some("for-t1"));
        assert_eq!(data_of(&sub2.recv().await), Some("for-t2"));
        assert!(sub1.try_recv().is_none());
    }

    #[tokio::test]
    async fn recv_wakes_on_publish() {
        let router = Arc::new(router(4));
        let mut sub = router.subscribe("t1");

        let publisher = {
            let router = Arc::clone(&router);
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                router.publish(output("t1", "a", "late"));
            })
        };

        let event = tokio::time::timeout(std::time::Duration::from_secs(1), sub.recv())
            .await
            .expect("recv should wake");
        assert_eq!(data_of(&event), Some("late"));
        publisher.await.unwrap();
    }

    #[test]
    fn activity_tracking() {
        let router = router(4);
        let key = AppKey::new("t1", "a");
        assert_eq!(router.last_activity(&key), 0);
        router.publish(output("t1", "a", "x"));
        assert!(router.last_activity(&key) > 0);
        router.forget(&key);
        assert_eq!(router.last_activity(&key), 0);
    }
}
