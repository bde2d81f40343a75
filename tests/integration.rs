//! End-to-end tests driving the public API: command ordering and event
//! pairing, query single-flight and cancellation, undo, and an attribute
//! filter sharing the engine's event bus.

use std::collections::HashMap;
use std::future::IntoFuture;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::StreamExt;

use dashboard_engine::attribute_filter::{
    AttributeFilterLoader, AttributeMetadata, AttributeRef, Element, ElementsBackend, ElementsPage,
    LoadOptions, Selection, SelectionMode, events,
};
use dashboard_engine::{
    BackendError, Command, CommandOutcome, Engine, EngineBuilder, EngineConfig, EngineRegistry,
    Event, EventFilter, HandlerContext, HandlerError, Model, QUERY_FAILED, QUERY_SUCCEEDED, Query, QueryError,
    QueryStatus, Subscription, command_fn, query_fn,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct Board {
    log: Vec<String>,
}

#[derive(Debug, Clone)]
enum BoardMutation {
    Append(String),
    Pop,
}

#[derive(Debug, thiserror::Error)]
#[error("log is empty")]
struct EmptyLog;

impl Model for Board {
    type Mutation = BoardMutation;
    type Error = EmptyLog;

    fn apply(mut self, mutation: &BoardMutation) -> Result<Self, EmptyLog> {
        match mutation {
            BoardMutation::Append(entry) => self.log.push(entry.clone()),
            BoardMutation::Pop => {
                self.log.pop().ok_or(EmptyLog)?;
            }
        }
        Ok(self)
    }
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Pages {
    calls: AtomicUsize,
    fail_next: AtomicUsize,
    delay: Duration,
}

impl Pages {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn page(&self, offset: usize) -> Result<Vec<String>, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if self.fail_next.swap(0, Ordering::SeqCst) > 0 {
            return Err(BackendError::new("backend unavailable"));
        }
        Ok((offset..offset + 3).map(|i| format!("element-{i}")).collect())
    }
}

#[async_trait]
impl ElementsBackend for Pages {
    async fn load_attribute(&self, attribute: &AttributeRef) -> Result<AttributeMetadata, BackendError> {
        Ok(AttributeMetadata {
            id: attribute.display_form.clone(),
            title: "Region".into(),
            elements_count: Some(4),
        })
    }

    async fn load_elements(
        &self,
        _attribute: &AttributeRef,
        options: &LoadOptions,
    ) -> Result<ElementsPage, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let all = ["A", "B", "C", "D"];
        let elements = all
            .iter()
            .filter(|key| options.keys.as_ref().is_none_or(|keys| keys.iter().any(|k| k == *key)))
            .skip(options.offset as usize)
            .take(options.limit as usize)
            .map(|key| Element::new(*key, format!("Region {key}")))
            .collect();
        Ok(ElementsPage {
            elements,
            total_count: all.len() as u64,
            options: options.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

type Ctx = HandlerContext<Board, Pages>;
type Outcome = Result<CommandOutcome<BoardMutation>, HandlerError>;

#[derive(Deserialize)]
struct Append {
    entry: String,
    #[serde(default)]
    delay_ms: u64,
}

async fn append(ctx: Ctx, command: Command) -> Outcome {
    let Append { entry, delay_ms } = command.payload_as()?;
    if entry.is_empty() {
        return Err(HandlerError::validation("entry must not be empty"));
    }
    let seen_before = ctx.select(|b| b.log.len());
    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    Ok(CommandOutcome::new()
        .mutation(BoardMutation::Append(entry.clone()))
        .event("log.appended", json!({ "entry": entry, "seen_before": seen_before }))
        .inverse(Command::new("log.pop", json!({}))))
}

async fn pop(_ctx: Ctx, _command: Command) -> Outcome {
    Ok(CommandOutcome::new().mutation(BoardMutation::Pop))
}

async fn load_page(ctx: Ctx, query: Query) -> Result<Vec<String>, HandlerError> {
    let offset: usize = query.payload_as()?;
    ctx.call(move |pages| async move { pages.page(offset).await }).await
}

fn engine(pages: Pages, config: EngineConfig) -> (Engine<Board, Pages>, Arc<Pages>) {
    init_tracing();
    let pages = Arc::new(pages);
    let engine = EngineBuilder::with_shared_backend(Board::default(), Arc::clone(&pages))
        .config(config)
        .command_handler("log.append", command_fn(append))
        .and_then(|b| b.command_handler("log.pop", command_fn(pop)))
        .and_then(|b| b.query_handler("loadPage", query_fn(load_page)))
        .expect("handler registration should succeed")
        .build();
    (engine, pages)
}

fn append_cmd(entry: &str, delay_ms: u64) -> Command {
    Command::new("log.append", json!({ "entry": entry, "delay_ms": delay_ms }))
}

fn record(engine: &Engine<Board, Pages>) -> (Arc<Mutex<Vec<Event>>>, Subscription) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let sub = engine.subscribe(EventFilter::All, move |e| sink.lock().push(e.clone()));
    (seen, sub)
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// A fast command dispatched right behind a slow one observes the slow
/// command's result.
#[tokio::test(start_paused = true)]
async fn commands_never_interleave() {
    let (engine, _pages) = engine(Pages::default(), EngineConfig::default());
    let mut stream = engine.events("log.appended");

    engine.dispatch(append_cmd("slow", 50)).expect("dispatch should succeed");
    engine.dispatch(append_cmd("fast", 0)).expect("dispatch should succeed");

    let first = stream.next().await.expect("first event");
    let second = stream.next().await.expect("second event");
    assert_eq!(first.payload["entry"], "slow");
    assert_eq!(second.payload["entry"], "fast");
    assert_eq!(second.payload["seen_before"], 1);
    assert_eq!(engine.read(|b| b.log.clone()), vec!["slow", "fast"]);
}

/// Every command ends in exactly one event with its correlation ID,
/// whether it succeeds, fails validation or fails to apply.
#[tokio::test]
async fn every_command_yields_exactly_one_event() {
    let (engine, _pages) = engine(Pages::default(), EngineConfig::default());
    let (seen, _sub) = record(&engine);

    let ids = vec![
        engine.dispatch(append_cmd("a", 0)).expect("dispatch should succeed"),
        engine.dispatch(append_cmd("", 0)).expect("dispatch should succeed"),
        engine.dispatch(Command::new("log.pop", json!({}))).expect("dispatch should succeed"),
        engine.dispatch(Command::new("log.pop", json!({}))).expect("dispatch should succeed"),
    ];
    engine
        .dispatch_and_wait(append_cmd("last", 0))
        .await
        .expect("last command should succeed");

    let seen = seen.lock();
    let mut per_id: HashMap<&str, usize> = HashMap::new();
    for event in seen.iter() {
        if let Some(id) = event.correlation_id.as_deref() {
            *per_id.entry(id).or_default() += 1;
        }
    }
    for id in &ids {
        assert_eq!(per_id.get(id.as_str()), Some(&1), "one event for {id}");
    }
    assert_eq!(seen.len(), 5);
    assert!(seen[1].is_command_failure());
    assert!(seen[3].is_command_failure());
    assert_eq!(engine.read(|b| b.log.clone()), vec!["last"]);
}

#[tokio::test]
async fn undo_reverts_last_command() {
    let (engine, _pages) = engine(Pages::default(), EngineConfig::default());
    for entry in ["one", "two"] {
        engine
            .dispatch_and_wait(append_cmd(entry, 0))
            .await
            .expect("append should succeed");
    }

    let mut stream = engine.events(EventFilter::All);
    engine.undo().expect("undo should queue").expect("something to undo");
    stream.next().await.expect("undo event should arrive");

    assert_eq!(engine.read(|b| b.log.clone()), vec!["one"]);
    assert_eq!(engine.undo_log().len(), 1);
}

#[tokio::test]
async fn registry_isolates_dashboards() {
    let registry = EngineRegistry::new();
    registry.insert("sales", engine(Pages::default(), EngineConfig::default()).0);
    registry.insert("ops", engine(Pages::default(), EngineConfig::default()).0);

    let sales = registry.get("sales").expect("sales should be registered");
    sales
        .dispatch_and_wait(append_cmd("q1", 0))
        .await
        .expect("append should succeed");

    let ops = registry.get("ops").expect("ops should be registered");
    assert!(ops.read(|b| b.log.is_empty()));

    registry.shutdown_all().await;
    assert!(!sales.is_running());
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn concurrent_queries_share_one_backend_call() {
    let (engine, pages) = engine(Pages::with_delay(Duration::from_millis(10)), EngineConfig::default());
    let query = Query::new("loadPage", json!(0)).with_cache_key("f1:p0");

    let first = engine.query::<Vec<String>>(query.clone()).expect("query should start");
    let second = engine.query::<Vec<String>>(query).expect("query should start");
    let (first, second) = tokio::join!(first.into_future(), second.into_future());

    let first = first.expect("first caller should get the page");
    let second = second.expect("second caller should get the page");
    assert_eq!(pages.calls(), 1);
    assert!(Arc::ptr_eq(&first, &second));
}

#[tokio::test]
async fn failed_query_is_retried_on_next_request() {
    let (engine, pages) = engine(Pages::default(), EngineConfig::default());
    pages.fail_next.store(1, Ordering::SeqCst);
    let query = Query::new("loadPage", json!(3));

    let err = engine
        .query::<Vec<String>>(query.clone())
        .expect("query should start")
        .await
        .unwrap_err();
    assert!(matches!(err, QueryError::Handler(HandlerError::External(_))));

    let page = engine
        .query::<Vec<String>>(query)
        .expect("query should start")
        .await
        .expect("retry should succeed");
    assert_eq!(page[0], "element-3");
    assert_eq!(pages.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn canceling_every_caller_suppresses_effects() {
    let config = EngineConfig {
        notify_queries: true,
        ..EngineConfig::default()
    };
    let (engine, pages) = engine(Pages::with_delay(Duration::from_millis(10)), config);
    let (seen, _sub) = record(&engine);
    let query = Query::new("loadPage", json!(0));
    let key = query.default_cache_key();

    let a = engine.query::<Vec<String>>(query.clone()).expect("query should start");
    let b = engine.query::<Vec<String>>(query).expect("query should start");
    a.cancel();
    b.cancel();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(pages.calls(), 1);
    assert_eq!(engine.query_status(&key), Some(QueryStatus::Canceled));
    assert!(
        seen.lock()
            .iter()
            .all(|e| e.event_type != QUERY_SUCCEEDED && e.event_type != QUERY_FAILED)
    );
    assert!(engine.read(|b| b.log.is_empty()));
}

// ---------------------------------------------------------------------------
// Attribute filter
// ---------------------------------------------------------------------------

#[tokio::test]
async fn filter_selection_roundtrip_on_engine_bus() {
    let (engine, _pages) = engine(Pages::default(), EngineConfig::default());
    let mut committed = engine.events(events::SELECTION_COMMITTED);

    let loader = AttributeFilterLoader::builder("region", AttributeRef::new("label.region"), Arc::new(Pages::default()))
        .event_bus(engine.bus().clone())
        .build();
    loader.init(None).await.expect("init should succeed");
    assert_eq!(loader.all_elements().len(), 4);

    loader.change_selection(Selection::include(["A"]));
    loader.commit_selection();
    loader.revert_selection();

    assert_eq!(loader.working_selection(), Selection::include(["A"]));
    assert_eq!(loader.committed_selection(), Selection::include(["A"]));

    let event = committed.next().await.expect("commit should be announced");
    assert_eq!(event.payload["filter_id"], "region");
    assert_eq!(event.payload["selection"]["keys"], json!(["A"]));
    assert!(
        tokio::time::timeout(Duration::from_millis(20), committed.next())
            .await
            .is_err(),
        "revert must not announce a commit"
    );
}

#[test]
fn invert_twice_restores_selection() {
    let selection = Selection::include(["A", "B"]);
    assert_eq!(selection.inverted().inverted(), selection);

    assert!(Selection::include(Vec::<String>::new()).is_empty());
    let everything = Selection {
        mode: SelectionMode::Exclude,
        keys: Default::default(),
    };
    assert!(!everything.is_empty());
}
