#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use unveil_db::{Database, NewGuest};
use unveil_engine::{
    ChannelProvider, DispatchSettings, Engine, OutboundMessage, ProviderOutcome, ProviderSet,
};
use unveil_messaging::ComplianceConfig;
use unveil_types::{Event, Guest, RsvpStatus, User};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Accept,
    Reject,
    Error,
    Hang,
}

type SendHook = Box<dyn FnOnce() + Send>;

/// Provider double that records every message it is handed.
pub struct RecordingProvider {
    behavior: Mutex<Behavior>,
    sent: Mutex<Vec<OutboundMessage>>,
    on_send: Mutex<Option<SendHook>>,
}

impl RecordingProvider {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior: Mutex::new(behavior),
            sent: Mutex::new(Vec::new()),
            on_send: Mutex::new(None),
        })
    }

    /// Run `hook` once, when the next batch arrives.
    pub fn on_send(&self, hook: impl FnOnce() + Send + 'static) {
        *self.on_send.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn bodies(&self) -> Vec<String> {
        self.sent().into_iter().map(|m| m.body).collect()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

#[async_trait]
impl ChannelProvider for RecordingProvider {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send_batch(&self, batch: Vec<OutboundMessage>) -> anyhow::Result<Vec<ProviderOutcome>> {
        let hook = self.on_send.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
        let behavior = *self.behavior.lock().unwrap();
        self.sent.lock().unwrap().extend(batch.iter().cloned());
        match behavior {
            Behavior::Accept => Ok(batch
                .iter()
                .map(|m| ProviderOutcome::accepted(m.delivery_id, format!("prov-{}", m.delivery_id)))
                .collect()),
            Behavior::Reject => Ok(batch
                .iter()
                .map(|m| ProviderOutcome::rejected(m.delivery_id, "invalid number"))
                .collect()),
            Behavior::Error => bail!("relay unavailable"),
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Vec::new())
            }
        }
    }
}

pub struct Harness {
    pub db: Arc<Database>,
    pub engine: Engine,
    pub sms: Arc<RecordingProvider>,
    pub push: Arc<RecordingProvider>,
    pub email: Arc<RecordingProvider>,
    pub host: User,
    pub event: Event,
}

pub fn harness() -> Harness {
    harness_with(ComplianceConfig::default(), DispatchSettings::default())
}

pub fn harness_with(compliance: ComplianceConfig, dispatch: DispatchSettings) -> Harness {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let sms = RecordingProvider::new(Behavior::Accept);
    let push = RecordingProvider::new(Behavior::Accept);
    let email = RecordingProvider::new(Behavior::Accept);
    let providers = ProviderSet {
        sms: sms.clone(),
        push: push.clone(),
        email: email.clone(),
    };
    let engine = Engine::new(db.clone(), providers, compliance, dispatch, 50);

    let host = user(&db, Some("Sarah Host"));
    let event = Event {
        id: Uuid::new_v4(),
        title: "Test Wedding".into(),
        host_user_id: host.id,
        sms_tag: Some("TestWed".into()),
        created_at: Utc::now(),
    };
    db.create_event(&event).unwrap();

    Harness {
        db,
        engine,
        sms,
        push,
        email,
        host,
        event,
    }
}

pub fn user(db: &Database, full_name: Option<&str>) -> User {
    let user = User {
        id: Uuid::new_v4(),
        full_name: full_name.map(str::to_string),
        phone: None,
        created_at: Utc::now(),
    };
    db.create_user(&user).unwrap();
    user
}

impl Harness {
    pub fn guest(&self, name: &str, phone: &str) -> Guest {
        self.db
            .insert_guest(NewGuest::new(self.event.id, name, phone), Utc::now())
            .unwrap()
    }

    /// Guest with a linked account, so it can read its inbox.
    pub fn member(&self, name: &str, phone: &str) -> (User, Guest) {
        let account = user(&self.db, Some(name));
        let mut new = NewGuest::new(self.event.id, name, phone);
        new.user_id = Some(account.id);
        let guest = self.db.insert_guest(new, Utc::now()).unwrap();
        (account, guest)
    }

    pub fn tagged_guest(&self, name: &str, phone: &str, tags: &[&str], rsvp: RsvpStatus) -> Guest {
        let mut new = NewGuest::new(self.event.id, name, phone);
        new.tags = tags.iter().map(|t| t.to_string()).collect::<BTreeSet<_>>();
        new.rsvp_status = rsvp;
        self.db.insert_guest(new, Utc::now()).unwrap()
    }

    pub fn reload(&self, guest: &Guest) -> Guest {
        self.db.get_guest(guest.id).unwrap().unwrap()
    }

    /// Make every later delivery insert fail.
    pub fn break_delivery_tracking(&self) {
        self.db
            .with_conn(|conn| {
                conn.execute_batch(
                    "CREATE TRIGGER reject_deliveries BEFORE INSERT ON deliveries
                     BEGIN SELECT RAISE(ABORT, 'deliveries table is read-only'); END;",
                )?;
                Ok(())
            })
            .unwrap();
    }
}

pub fn minutes_from_now(minutes: i64) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::minutes(minutes)
}
