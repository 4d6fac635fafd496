//! Registry of record cores and the services they share.

use super::dirty::DirtyService;
use super::merge::{MergeStrategy, MergeStrategyService};
use super::record_core::RecordCore;
use super::single_notifier::{NotifierCallback, SingleNotifier};
use super::write_ack::WriteAckService;
use super::{CoreId, MergeOutcome, RecordSnapshot, RemoteRecord};
use crate::bulk::{BulkKind, BulkSubscription};
use crate::config::ClientConfig;
use crate::emitter::OwnerId;
use crate::error::{ClientError, ClientResult};
use crate::outbox::ErrorKind;
use crate::services::Services;
use crate::task::Task;
use crate::timeout_registry::Expired;
use regex::Regex;
use std::collections::HashMap;
use tidewire_protocol::{Action, Message, RecordAction, Topic};
use tidewire_storage::NO_VERSION;
use tracing::{debug, trace};

/// Services shared by every record core.
#[derive(Debug)]
pub(crate) struct RecordServices {
    pub dirty: DirtyService,
    pub merge: MergeStrategyService,
    pub write_acks: WriteAckService,
    pub reads: SingleNotifier,
    pub heads: SingleNotifier,
    pub create_and_read: BulkSubscription,
    pub read: BulkSubscription,
    pub head: BulkSubscription,
}

impl RecordServices {
    fn new(config: &ClientConfig, default_strategy: Option<MergeStrategy>) -> Self {
        let interval = config.subscription_interval;
        Self {
            dirty: DirtyService::new(config),
            merge: MergeStrategyService::new(default_strategy),
            write_acks: WriteAckService::new(),
            reads: SingleNotifier::new(RecordAction::Read, config.record_read_timeout),
            heads: SingleNotifier::new(RecordAction::Head, config.record_read_timeout),
            create_and_read: BulkSubscription::new(BulkKind::RecordCreateAndRead, interval),
            read: BulkSubscription::new(BulkKind::RecordRead, interval),
            head: BulkSubscription::new(BulkKind::RecordHead, interval),
        }
    }

    fn bulk(&mut self, kind: BulkKind) -> Option<&mut BulkSubscription> {
        match kind {
            BulkKind::RecordCreateAndRead => Some(&mut self.create_and_read),
            BulkKind::RecordRead => Some(&mut self.read),
            BulkKind::RecordHead => Some(&mut self.head),
            BulkKind::Event | BulkKind::Rpc => None,
        }
    }
}

/// Owns one [`RecordCore`] per live record name.
#[derive(Debug)]
pub(crate) struct RecordHandler {
    cores: HashMap<String, RecordCore>,
    services: RecordServices,
    next_core: u64,
    next_owner: u64,
}

impl RecordHandler {
    pub fn new(config: &ClientConfig, default_strategy: Option<MergeStrategy>) -> Self {
        Self {
            cores: HashMap::new(),
            services: RecordServices::new(config, default_strategy),
            next_core: 0,
            next_owner: 0,
        }
    }

    /// Allocates an owner token for a new handle.
    pub fn new_owner(&mut self) -> OwnerId {
        self.next_owner += 1;
        OwnerId(self.next_owner)
    }

    /// Returns the live core for `name`, creating it if needed, and
    /// registers `owner` as a reference.
    pub fn get_core(
        &mut self,
        name: &str,
        owner: OwnerId,
        list: bool,
        cx: &mut Services<'_>,
    ) -> ClientResult<CoreId> {
        if name.is_empty() {
            return Err(ClientError::invalid_argument("record name must not be empty"));
        }
        let Self {
            cores,
            services,
            next_core,
            ..
        } = self;
        if !cores.contains_key(name) {
            *next_core += 1;
            let id = CoreId(*next_core);
            debug!(record = %name, ?id, "creating record core");
            let mut core = RecordCore::new(name, id, cx.config.is_read_only(name));
            core.start(cx, services);
            cores.insert(name.to_string(), core);
        }
        let Some(core) = cores.get_mut(name) else {
            return Err(ClientError::RecordDestroyed(name.to_string()));
        };
        if list {
            core.mark_list();
        }
        core.add_reference(owner, cx, services);
        Ok(core.id())
    }

    /// Runs `f` on the core `id` of `name`. Fails if that core is gone.
    pub fn with_core<R>(
        &mut self,
        name: &str,
        id: CoreId,
        cx: &mut Services<'_>,
        f: impl FnOnce(&mut RecordCore, &mut Services<'_>, &mut RecordServices) -> R,
    ) -> ClientResult<R> {
        let core = match self.cores.get_mut(name) {
            Some(core) if core.id() == id && !core.is_destroyed() => core,
            _ => return Err(ClientError::RecordDestroyed(name.to_string())),
        };
        let result = f(core, cx, &mut self.services);
        self.reap(name);
        Ok(result)
    }

    /// Read-only access to the core `id` of `name`.
    pub fn core(&self, name: &str, id: CoreId) -> ClientResult<&RecordCore> {
        match self.cores.get(name) {
            Some(core) if core.id() == id && !core.is_destroyed() => Ok(core),
            _ => Err(ClientError::RecordDestroyed(name.to_string())),
        }
    }

    fn reap(&mut self, name: &str) {
        if self.cores.get(name).map_or(false, RecordCore::is_destroyed) {
            trace!(record = %name, "record core removed");
            self.cores.remove(name);
        }
    }

    fn dispatch(
        &mut self,
        name: &str,
        cx: &mut Services<'_>,
        f: impl FnOnce(&mut RecordCore, &mut Services<'_>, &mut RecordServices),
    ) -> bool {
        let Some(core) = self.cores.get_mut(name) else {
            return false;
        };
        f(core, cx, &mut self.services);
        self.reap(name);
        true
    }

    fn dispatch_to(
        &mut self,
        name: &str,
        id: CoreId,
        cx: &mut Services<'_>,
        f: impl FnOnce(&mut RecordCore, &mut Services<'_>, &mut RecordServices),
    ) {
        if self.with_core(name, id, cx, f).is_err() {
            trace!(record = %name, ?id, "task for a destroyed record core dropped");
        }
    }

    /// Handles a record-topic message.
    pub fn handle(&mut self, message: Message, cx: &mut Services<'_>) {
        let Action::Record(action) = message.action else {
            return;
        };
        match action {
            RecordAction::ReadResponse => {
                if self.services.reads.receive(&message, cx) {
                    self.route_internal(message, cx, RecordCore::handle_read_response);
                }
                return;
            }
            RecordAction::HeadResponse => {
                if self.services.heads.receive(&message, cx) {
                    self.route_internal(message, cx, RecordCore::handle_head_response);
                }
                return;
            }
            RecordAction::WriteAcknowledgement => {
                if !self.services.write_acks.receive(&message, cx.outbox) {
                    cx.outbox.warn(
                        Topic::Record,
                        ErrorKind::UnknownCorrelationId,
                        format!(
                            "write acknowledgement {} has no waiter",
                            message.correlation_id.as_deref().unwrap_or_default()
                        ),
                    );
                }
                return;
            }
            RecordAction::RecordNotFound
            | RecordAction::MessageDenied
            | RecordAction::MessagePermissionError
                if self.fail_public_request(&message, cx) =>
            {
                return;
            }
            RecordAction::Subscribe
            | RecordAction::Unsubscribe
            | RecordAction::SubscribeCreateAndRead
            | RecordAction::SubscribeAndRead
            | RecordAction::SubscribeAndHead
                if message.is_ack =>
            {
                cx.remove_timeout(&message);
                return;
            }
            _ => {}
        }

        let Some(name) = message.name.clone() else {
            cx.outbox.warn(
                Topic::Record,
                ErrorKind::UnsolicitedMessage,
                format!("{} without a record name", message.action),
            );
            return;
        };
        if !self.dispatch(&name, cx, |core, cx, rs| core.handle(message, cx, rs)) {
            cx.outbox.warn(
                Topic::Record,
                ErrorKind::UnsolicitedMessage,
                format!("{action} for unknown record {name}"),
            );
        }
    }

    fn route_internal(
        &mut self,
        message: Message,
        cx: &mut Services<'_>,
        f: fn(&mut RecordCore, Message, &mut Services<'_>, &mut RecordServices),
    ) {
        let Some(name) = message.name.clone() else {
            return;
        };
        self.dispatch(&name, cx, |core, cx, rs| f(core, message, cx, rs));
    }

    /// Errors for a public read or head fail its waiters instead of a core.
    fn fail_public_request(&mut self, message: &Message, cx: &mut Services<'_>) -> bool {
        let Some(name) = message.name.as_deref() else {
            return false;
        };
        let notifier = match message.original_action {
            Some(Action::Record(RecordAction::Read)) => &mut self.services.reads,
            Some(Action::Record(RecordAction::Head)) => &mut self.services.heads,
            _ if message.action == Action::Record(RecordAction::RecordNotFound) => {
                &mut self.services.reads
            }
            _ => return false,
        };
        cx.remove_timeout(message);
        let err = if message.action == Action::Record(RecordAction::RecordNotFound) {
            ClientError::NotFound(name.to_string())
        } else {
            ClientError::RequestDenied {
                name: name.to_string(),
                action: message.action.as_str().to_string(),
            }
        };
        notifier.fail(name, err, cx.outbox)
    }

    pub fn load_dirty_index(&mut self, cx: &mut Services<'_>) {
        for (name, id) in self.services.dirty.load(cx) {
            cx.idle(Task::LoadRecord { name, core: id });
        }
    }

    pub fn load_record(&mut self, name: &str, id: CoreId, cx: &mut Services<'_>) {
        self.dispatch_to(name, id, cx, |core, cx, rs| core.load(cx, rs));
    }

    pub fn discard(&mut self, name: &str, id: CoreId, cx: &mut Services<'_>) {
        self.dispatch_to(name, id, cx, |core, cx, rs| core.on_discard_timer(cx, rs));
    }

    pub fn merge_resolved(
        &mut self,
        name: &str,
        id: CoreId,
        remote: RemoteRecord,
        outcome: MergeOutcome,
        cx: &mut Services<'_>,
    ) {
        self.dispatch_to(name, id, cx, |core, cx, rs| {
            core.on_record_recovered(remote, outcome, cx, rs)
        });
    }

    pub fn flush_bulk(&mut self, kind: BulkKind, cx: &mut Services<'_>) {
        if let Some(bulk) = self.services.bulk(kind) {
            bulk.flush(cx);
        }
    }

    pub fn flush_dirty(&mut self, cx: &mut Services<'_>) {
        self.services.dirty.flush(cx);
    }

    /// Handles an expired record request. Returns false if the request was
    /// not a record request.
    pub fn on_timeout(&mut self, expired: &Expired, cx: &mut Services<'_>) -> bool {
        let Action::Record(action) = expired.message.action else {
            return false;
        };
        let Some(name) = expired.message.name.as_deref() else {
            return true;
        };
        match action {
            RecordAction::Read => {
                self.services
                    .reads
                    .fail(name, ClientError::Timeout(action.as_str().to_string()), cx.outbox);
            }
            RecordAction::Head => {
                self.services
                    .heads
                    .fail(name, ClientError::Timeout(action.as_str().to_string()), cx.outbox);
            }
            RecordAction::Delete => {
                self.dispatch(name, cx, |core, cx, _| core.on_delete_timeout(cx));
            }
            _ => {}
        }
        true
    }

    /// Fails outstanding acknowledgements and requests and drops queued
    /// subscriptions.
    pub fn on_services_lost(&mut self, cx: &mut Services<'_>) {
        let services = &mut self.services;
        services.write_acks.on_connection_lost(cx.outbox);
        services.reads.on_connection_lost(cx.outbox);
        services.heads.on_connection_lost(cx.outbox);
        services.create_and_read.on_connection_lost(cx);
        services.read.on_connection_lost(cx);
        services.head.on_connection_lost(cx);
    }

    pub fn on_cores_lost(&mut self, cx: &mut Services<'_>) {
        let Self {
            cores, services, ..
        } = self;
        for core in cores.values_mut() {
            core.on_connection_lost(cx, services);
        }
    }

    pub fn on_reestablished(&mut self, cx: &mut Services<'_>) {
        self.services.reads.on_reestablished(cx);
        self.services.heads.on_reestablished(cx);
        let mut names: Vec<String> = self.cores.keys().cloned().collect();
        names.sort();
        for name in names {
            self.dispatch(&name, cx, |core, cx, rs| core.on_reestablished(cx, rs));
        }
    }

    pub fn on_exit_limbo(&mut self, cx: &mut Services<'_>) {
        self.services.reads.on_exit_limbo(cx.outbox);
        self.services.heads.on_exit_limbo(cx.outbox);
    }

    /// Reads data and version, locally if the record is loaded and ready.
    pub fn snapshot(
        &mut self,
        name: &str,
        callback: Box<dyn FnOnce(ClientResult<RecordSnapshot>) + Send>,
        cx: &mut Services<'_>,
    ) -> ClientResult<()> {
        if name.is_empty() {
            return Err(ClientError::invalid_argument("record name must not be empty"));
        }
        if let Some(snapshot) = self.cores.get(name).and_then(RecordCore::snapshot) {
            cx.outbox.call(move || callback(Ok(snapshot)));
            return Ok(());
        }
        let on_response: NotifierCallback = Box::new(move |result| {
            callback(result.map(|message| RecordSnapshot {
                version: message.version.unwrap_or(NO_VERSION),
                data: message.data.unwrap_or_else(super::empty_object),
            }))
        });
        self.services.reads.request(name, on_response, cx);
        Ok(())
    }

    /// Reads the version only. `-1` means the record does not exist.
    pub fn head(
        &mut self,
        name: &str,
        callback: Box<dyn FnOnce(ClientResult<i64>) + Send>,
        cx: &mut Services<'_>,
    ) -> ClientResult<()> {
        if name.is_empty() {
            return Err(ClientError::invalid_argument("record name must not be empty"));
        }
        if let Some(version) = self
            .cores
            .get(name)
            .and_then(RecordCore::snapshot)
            .map(|s| s.version)
        {
            cx.outbox.call(move || callback(Ok(version)));
            return Ok(());
        }
        let on_response: NotifierCallback = Box::new(move |result| {
            callback(result.map(|message| message.version.unwrap_or(NO_VERSION)))
        });
        self.services.heads.request(name, on_response, cx);
        Ok(())
    }

    pub fn set_merge_strategy(&mut self, name: &str, strategy: MergeStrategy) {
        self.services.merge.set_for_name(name, strategy);
    }

    pub fn set_merge_strategy_by_pattern(&mut self, pattern: Regex, strategy: MergeStrategy) {
        self.services.merge.set_for_pattern(pattern, strategy);
    }

    pub fn set_default_merge_strategy(&mut self, strategy: Option<MergeStrategy>) {
        self.services.merge.set_default(strategy);
    }

    pub fn dirty_names(&self) -> Vec<String> {
        self.services.dirty.dirty_names()
    }

    pub fn len(&self) -> usize {
        self.cores.len()
    }

    #[cfg(test)]
    pub fn state_of(&self, name: &str) -> Option<super::RecordState> {
        self.cores.get(name).map(RecordCore::state)
    }

    #[cfg(test)]
    pub fn services(&self) -> &RecordServices {
        &self.services
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::OutboxItem;
    use crate::record::RecordState;
    use crate::testing::Harness;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tidewire_storage::OfflineStore;

    /// Runs idle record tasks and outbox calls until nothing is left.
    fn settle(handler: &mut RecordHandler, harness: &mut Harness) {
        loop {
            let tasks = harness.advance(Duration::ZERO);
            if tasks.is_empty() {
                break;
            }
            for task in tasks {
                run(handler, harness, task);
            }
        }
        for item in harness.outbox.take() {
            if let OutboxItem::Call(f) = item {
                f();
            }
        }
    }

    fn run(handler: &mut RecordHandler, harness: &mut Harness, task: Task) {
        let mut cx = harness.services();
        match task {
            Task::LoadDirtyIndex => handler.load_dirty_index(&mut cx),
            Task::LoadRecord { name, core } => handler.load_record(&name, core, &mut cx),
            Task::DiscardRecord { name, core } => handler.discard(&name, core, &mut cx),
            Task::MergeResolved {
                name,
                core,
                remote,
                outcome,
            } => handler.merge_resolved(&name, core, remote, outcome, &mut cx),
            Task::DirtyFlush => handler.flush_dirty(&mut cx),
            Task::Idle(f) => f(),
            _ => {}
        }
    }

    fn open(handler: &mut RecordHandler, harness: &mut Harness, name: &str) -> (CoreId, OwnerId) {
        let owner = handler.new_owner();
        let id = handler
            .get_core(name, owner, false, &mut harness.services())
            .unwrap();
        settle(handler, harness);
        (id, owner)
    }

    fn read_response(name: &str, version: i64, data: Value) -> Message {
        Message::named(RecordAction::ReadResponse, name)
            .with_version(version)
            .with_data(data)
    }

    fn ready_record(harness: &mut Harness, data: Value) -> (RecordHandler, CoreId, OwnerId) {
        let mut handler = RecordHandler::new(&harness.config, Some(MergeStrategy::remote_wins()));
        handler.load_dirty_index(&mut harness.services());
        let (id, owner) = open(&mut handler, harness, "doc");
        harness.sent();
        handler.handle(read_response("doc", 1, data), &mut harness.services());
        settle(&mut handler, harness);
        assert_eq!(handler.state_of("doc"), Some(RecordState::Ready));
        (handler, id, owner)
    }

    #[test]
    fn online_record_subscribes_and_becomes_ready() {
        let mut harness = Harness::connected();
        let mut handler = RecordHandler::new(&harness.config, None);
        handler.load_dirty_index(&mut harness.services());
        let (id, _) = open(&mut handler, &mut harness, "doc");

        let sent = harness.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].action,
            Action::Record(RecordAction::SubscribeCreateAndRead)
        );
        assert_eq!(sent[0].names, Some(vec!["doc".to_string()]));
        assert_eq!(handler.state_of("doc"), Some(RecordState::Subscribing));

        handler.handle(read_response("doc", 3, json!({"a": 1})), &mut harness.services());
        let core = handler.core("doc", id).unwrap();
        assert_eq!(core.state(), RecordState::Ready);
        assert_eq!(core.version(), Some(3));
        assert_eq!(core.get(Some("a")), Some(json!(1)));
    }

    #[test]
    fn writes_before_ready_are_combined_into_one_update() {
        let mut harness = Harness::connected();
        let mut handler = RecordHandler::new(&harness.config, None);
        handler.load_dirty_index(&mut harness.services());
        let owner = handler.new_owner();
        let id = handler
            .get_core("doc", owner, false, &mut harness.services())
            .unwrap();
        for (path, value) in [("b", 2), ("c", 3)] {
            handler
                .with_core("doc", id, &mut harness.services(), |core, cx, rs| {
                    core.set(Some(path), Some(json!(value)), None, cx, rs)
                })
                .unwrap()
                .unwrap();
        }
        settle(&mut handler, &mut harness);
        harness.sent();

        handler.handle(read_response("doc", 3, json!({"a": 1})), &mut harness.services());
        let sent = harness.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].action, Action::Record(RecordAction::Update));
        assert_eq!(sent[0].version, Some(4));
        assert_eq!(sent[0].data, Some(json!({"a": 1, "b": 2, "c": 3})));
    }

    #[test]
    fn version_gap_reads_and_merges() {
        let mut harness = Harness::connected();
        let (mut handler, id, _) = ready_record(&mut harness, json!({"a": 1}));

        let update = Message::named(RecordAction::Update, "doc")
            .with_version(2)
            .with_data(json!({"a": 2}));
        handler.handle(update, &mut harness.services());
        assert_eq!(handler.core("doc", id).unwrap().version(), Some(2));

        let gap = Message::named(RecordAction::Patch, "doc")
            .with_version(5)
            .with_path("a")
            .with_data(json!(5));
        handler.handle(gap, &mut harness.services());
        assert_eq!(handler.state_of("doc"), Some(RecordState::Merging));
        let sent = harness.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].action, Action::Record(RecordAction::Read));

        handler.handle(read_response("doc", 5, json!({"a": 5})), &mut harness.services());
        settle(&mut handler, &mut harness);
        let core = handler.core("doc", id).unwrap();
        assert_eq!(core.state(), RecordState::Ready);
        assert_eq!(core.version(), Some(5));
        assert_eq!(core.get(None), Some(json!({"a": 5})));
        assert!(harness.sent().is_empty());
    }

    #[test]
    fn conflict_without_strategy_is_reported() {
        let mut harness = Harness::connected();
        let (mut handler, _, _) = ready_record(&mut harness, json!({"a": 1}));
        handler.set_default_merge_strategy(None);

        let exists = Message::named(RecordAction::VersionExists, "doc")
            .with_version(4)
            .with_data(json!({"a": 4}));
        handler.handle(exists, &mut harness.services());
        for task in harness.advance(Duration::ZERO) {
            run(&mut handler, &mut harness, task);
        }
        assert_eq!(handler.state_of("doc"), Some(RecordState::Merging));
        assert_eq!(handler.dirty_names(), vec!["doc"]);
        assert!(harness.outbox.events().iter().any(|event| matches!(
            event,
            crate::outbox::ClientEvent::Error {
                kind: ErrorKind::RecordVersionExists,
                ..
            }
        )));

        // The next remote change triggers another attempt.
        handler.set_default_merge_strategy(Some(MergeStrategy::remote_wins()));
        harness.sent();
        let update = Message::named(RecordAction::Update, "doc")
            .with_version(5)
            .with_data(json!({"a": 5}));
        handler.handle(update, &mut harness.services());
        let sent = harness.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].action, Action::Record(RecordAction::Read));
    }

    #[test]
    fn dirty_record_missing_remotely_is_created() {
        let mut harness = Harness::connected();
        let key = harness.config.dirty_storage_key.clone();
        harness.storage.set(&key, 1, &json!(["doc"])).unwrap();
        harness.storage.set("doc", 1, &json!({"x": 1})).unwrap();

        let mut handler = RecordHandler::new(&harness.config, None);
        handler.load_dirty_index(&mut harness.services());
        assert_eq!(handler.dirty_names(), vec!["doc"]);
        open(&mut handler, &mut harness, "doc");

        let sent = harness.sent();
        assert_eq!(sent[0].action, Action::Record(RecordAction::SubscribeAndHead));
        assert_eq!(handler.state_of("doc"), Some(RecordState::Resubscribing));

        let head = Message::named(RecordAction::HeadResponse, "doc").with_version(NO_VERSION);
        handler.handle(head, &mut harness.services());
        let sent = harness.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].action, Action::Record(RecordAction::CreateAndUpdate));
        assert_eq!(sent[0].version, Some(1));
        assert_eq!(sent[0].data, Some(json!({"x": 1})));
        assert_eq!(handler.state_of("doc"), Some(RecordState::Ready));
        assert!(handler.dirty_names().is_empty());
    }

    #[test]
    fn dirty_record_one_ahead_sends_its_update() {
        let mut harness = Harness::connected();
        let key = harness.config.dirty_storage_key.clone();
        harness.storage.set(&key, 1, &json!(["doc"])).unwrap();
        harness.storage.set("doc", 4, &json!({"x": 2})).unwrap();

        let mut handler = RecordHandler::new(&harness.config, None);
        handler.load_dirty_index(&mut harness.services());
        open(&mut handler, &mut harness, "doc");
        harness.sent();

        let head = Message::named(RecordAction::HeadResponse, "doc").with_version(3);
        handler.handle(head, &mut harness.services());
        let sent = harness.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].action, Action::Record(RecordAction::Update));
        assert_eq!(sent[0].version, Some(4));
        assert_eq!(handler.state_of("doc"), Some(RecordState::Ready));
    }

    #[test]
    fn offline_writes_keep_the_record_dirty() {
        let mut harness = Harness::disconnected();
        let mut handler = RecordHandler::new(&harness.config, None);
        handler.load_dirty_index(&mut harness.services());
        let (id, _) = open(&mut handler, &mut harness, "doc");
        assert_eq!(handler.state_of("doc"), Some(RecordState::Ready));
        assert_eq!(handler.dirty_names(), vec!["doc"]);

        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&results);
        handler
            .with_core("doc", id, &mut harness.services(), |core, cx, rs| {
                core.set(
                    Some("x"),
                    Some(json!(1)),
                    Some(Box::new(move |result| sink.lock().push(result))),
                    cx,
                    rs,
                )
            })
            .unwrap()
            .unwrap();
        settle(&mut handler, &mut harness);

        assert!(matches!(
            results.lock().as_slice(),
            [Err(ClientError::Offline)]
        ));
        let stored = harness.storage.get("doc").unwrap().unwrap();
        assert_eq!(stored.version, harness.config.initial_record_version);
        assert_eq!(stored.data, json!({"x": 1}));
        assert!(harness.sent().is_empty());
    }

    #[test]
    fn delete_while_offline_fails() {
        let mut harness = Harness::disconnected();
        let mut handler = RecordHandler::new(&harness.config, None);
        handler.load_dirty_index(&mut harness.services());
        let (id, _) = open(&mut handler, &mut harness, "doc");

        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&results);
        handler
            .with_core("doc", id, &mut harness.services(), |core, cx, rs| {
                core.delete(Box::new(move |result| sink.lock().push(result)), cx, rs)
            })
            .unwrap();
        settle(&mut handler, &mut harness);
        assert!(matches!(
            results.lock().as_slice(),
            [Err(ClientError::DeleteOffline)]
        ));
        assert_eq!(handler.state_of("doc"), Some(RecordState::Ready));
    }

    #[test]
    fn last_reference_unsubscribes_after_grace_period() {
        let mut harness = Harness::connected();
        let (mut handler, id, owner) = ready_record(&mut harness, json!({"a": 1}));

        handler
            .with_core("doc", id, &mut harness.services(), |core, cx, rs| {
                core.remove_reference(owner, cx, rs)
            })
            .unwrap();
        assert_eq!(handler.state_of("doc"), Some(RecordState::Unsubscribing));
        assert!(harness.sent().is_empty());

        let discard = harness.config.record_discard_timeout;
        for task in harness.advance(discard) {
            run(&mut handler, &mut harness, task);
        }
        let sent = harness.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].action, Action::Record(RecordAction::Unsubscribe));
        assert_eq!(handler.len(), 0);
        assert!(handler.core("doc", id).is_err());
    }

    #[test]
    fn new_reference_cancels_the_discard() {
        let mut harness = Harness::connected();
        let (mut handler, id, owner) = ready_record(&mut harness, json!({"a": 1}));
        handler
            .with_core("doc", id, &mut harness.services(), |core, cx, rs| {
                core.remove_reference(owner, cx, rs)
            })
            .unwrap();

        let again = handler.new_owner();
        let same = handler
            .get_core("doc", again, false, &mut harness.services())
            .unwrap();
        assert_eq!(same, id);
        assert_eq!(handler.state_of("doc"), Some(RecordState::Ready));

        let discard = harness.config.record_discard_timeout;
        assert!(harness
            .advance(discard)
            .iter()
            .all(|task| !matches!(task, Task::DiscardRecord { .. })));
    }

    #[test]
    fn empty_name_is_rejected() {
        let mut harness = Harness::connected();
        let mut handler = RecordHandler::new(&harness.config, None);
        let owner = handler.new_owner();
        assert!(handler
            .get_core("", owner, false, &mut harness.services())
            .is_err());
    }

    #[test]
    fn stale_update_is_not_applied() {
        let mut harness = Harness::connected();
        let (mut handler, id, _) = ready_record(&mut harness, json!({"a": 1}));

        let stale = Message::named(RecordAction::Update, "doc")
            .with_version(1)
            .with_data(json!({"a": 0}));
        handler.handle(stale, &mut harness.services());
        let core = handler.core("doc", id).unwrap();
        assert_eq!(core.state(), RecordState::Merging);
        assert_eq!(core.version(), Some(1));
        assert_eq!(core.get(None), Some(json!({"a": 1})));
    }

    #[test]
    fn setting_equal_data_sends_nothing() {
        let mut harness = Harness::connected();
        let (mut handler, id, _) = ready_record(&mut harness, json!({"a": 1}));

        let calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&calls);
        handler
            .with_core("doc", id, &mut harness.services(), |core, cx, rs| {
                core.set(
                    Some("a"),
                    Some(json!(1)),
                    Some(Box::new(move |result| {
                        assert!(result.is_ok());
                        *counter.lock() += 1;
                    })),
                    cx,
                    rs,
                )
            })
            .unwrap()
            .unwrap();
        settle(&mut handler, &mut harness);
        assert!(harness.sent().is_empty());
        assert_eq!(*calls.lock(), 1);
    }

    proptest! {
        #[test]
        fn queued_writes_match_sequential_application(
            writes in prop::collection::vec(("[a-c]", "[x-z]", any::<i32>()), 1..8),
        ) {
            let mut harness = Harness::connected();
            let mut handler = RecordHandler::new(&harness.config, None);
            handler.load_dirty_index(&mut harness.services());
            let owner = handler.new_owner();
            let id = handler
                .get_core("doc", owner, false, &mut harness.services())
                .unwrap();

            let mut expected = json!({"base": 0});
            for (outer, inner, value) in &writes {
                let path = format!("{outer}.{inner}");
                expected = crate::json_path::set(&expected, Some(&path), Some(json!(value)));
                handler
                    .with_core("doc", id, &mut harness.services(), |core, cx, rs| {
                        core.set(Some(&path), Some(json!(value)), None, cx, rs)
                    })
                    .unwrap()
                    .unwrap();
            }
            settle(&mut handler, &mut harness);
            harness.sent();

            handler.handle(read_response("doc", 1, json!({"base": 0})), &mut harness.services());
            let sent = harness.sent();
            prop_assert_eq!(sent.len(), 1);
            prop_assert_eq!(sent[0].version, Some(2));
            prop_assert_eq!(sent[0].data.clone(), Some(expected));
        }
    }
}
