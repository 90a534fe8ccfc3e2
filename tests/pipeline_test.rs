//! End-to-end lifecycle tests over the in-memory transport.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use jobtrail::job::{
    FailureLog, Job, JobError, JobInterceptor, JobOutcome, JobRegistry, JobRunner, Perform,
    Worker, WorkerConfig,
};
use jobtrail::publisher::FilterPublisher;
use jobtrail::publisher::filter::event_type_is;
use jobtrail::queue::{MemoryTransport, QueueInterceptor, QueueTransport};
use jobtrail::runtime::RuntimeContext;
use jobtrail::{EventType, Instrumentation, Item, LifecycleEvent, Metadata};
use serde_json::{Value, json};

const QUEUE: &str = "default";

struct Succeed;

#[async_trait]
impl Perform for Succeed {
    async fn perform(&self, _args: &[Value], _ctx: &RuntimeContext) -> Result<(), JobError> {
        Ok(())
    }
}

/// Raises a RuntimeError with the first argument as its message.
struct Raise;

#[async_trait]
impl Perform for Raise {
    async fn perform(&self, args: &[Value], _ctx: &RuntimeContext) -> Result<(), JobError> {
        let message = args.first().and_then(Value::as_str).unwrap_or("boom");
        Err(JobError::new("RuntimeError", message))
    }
}

/// Writes to its runtime context, including a pipeline-owned key.
struct Annotate;

#[async_trait]
impl Perform for Annotate {
    async fn perform(&self, args: &[Value], ctx: &RuntimeContext) -> Result<(), JobError> {
        ctx.insert("user_key", 1);
        ctx.insert("event_hash", "overwritten");
        if args.first() == Some(&json!("fail")) {
            return Err(JobError::new("RuntimeError", "annotated failure"));
        }
        Ok(())
    }
}

/// Counts performs; used where no publisher is wired.
struct Counter(Arc<AtomicUsize>);

#[async_trait]
impl Perform for Counter {
    async fn perform(&self, _args: &[Value], _ctx: &RuntimeContext) -> Result<(), JobError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn registry() -> JobRegistry {
    let mut registry = JobRegistry::new();
    registry.register("Succeed", Arc::new(Succeed));
    registry.register("Raise", Arc::new(Raise));
    registry.register("Annotate", Arc::new(Annotate));
    registry
}

struct Pipeline {
    transport: Arc<MemoryTransport>,
    producer: QueueInterceptor<Arc<MemoryTransport>>,
    worker: Worker<MemoryTransport>,
    events: Arc<FilterPublisher>,
}

fn pipeline_with(instrumentation: Instrumentation, events: Arc<FilterPublisher>) -> Pipeline {
    let instrumentation = Arc::new(instrumentation);
    let transport = Arc::new(MemoryTransport::new());
    Pipeline {
        producer: QueueInterceptor::new(Arc::clone(&transport), Arc::clone(&instrumentation)),
        worker: Worker::new(
            Arc::clone(&transport),
            Arc::new(registry()),
            instrumentation,
            WorkerConfig {
                poll_interval: Duration::from_millis(10),
            },
        ),
        transport,
        events,
    }
}

fn pipeline() -> Pipeline {
    let events = Arc::new(FilterPublisher::new());
    pipeline_with(Instrumentation::with_publisher(events.clone()), events)
}

fn types(events: &[LifecycleEvent]) -> Vec<EventType> {
    events.iter().map(|e| e.event_type).collect()
}

// ---------------------------------------------------------------------------
// Full lifecycles
// ---------------------------------------------------------------------------

#[tokio::test]
async fn successful_job_publishes_four_correlated_events() {
    let p = pipeline();
    p.producer
        .push(QUEUE, Item::new("Succeed").arg("test"))
        .await
        .unwrap();
    let outcome = p.worker.work_once(QUEUE).await.unwrap();
    assert!(matches!(outcome, Some(JobOutcome::Finished { .. })));

    let events = p.events.events();
    assert_eq!(
        types(&events),
        vec![
            EventType::Enqueued,
            EventType::Dequeued,
            EventType::PerformStarted,
            EventType::PerformFinished,
        ]
    );
    let hash = events[0].event_hash().unwrap().to_string();
    assert!(events.iter().all(|e| e.event_hash() == Some(hash.as_str())));
    assert!(events.iter().all(|e| e.queue == QUEUE && e.args == vec![json!("test")]));
    assert!(events[1].metadata["time_in_queue"].as_f64().unwrap() >= 0.0);
    assert!(events[3].metadata["time_to_perform"].as_f64().unwrap() >= 0.0);
    assert!(!events[1].metadata.contains_key("time_to_perform"));
}

#[tokio::test]
async fn failing_job_publishes_failed_with_error_details() {
    let p = pipeline();
    p.producer
        .push(QUEUE, Item::new("Raise").arg("test"))
        .await
        .unwrap();
    let outcome = p.worker.work_once(QUEUE).await.unwrap();
    assert!(matches!(outcome, Some(JobOutcome::Failed { .. })));

    let events = p.events.events();
    assert_eq!(
        types(&events),
        vec![
            EventType::Enqueued,
            EventType::Dequeued,
            EventType::PerformStarted,
            EventType::Failed,
        ]
    );
    let failed = &events[3].metadata;
    assert_eq!(failed["exception"], "RuntimeError");
    assert_eq!(failed["message"], "test");
    assert!(!failed["backtrace"].as_array().unwrap().is_empty());
    assert!(failed["time_to_perform"].as_f64().unwrap() >= 0.0);
    assert_eq!(events[3].event_hash(), events[0].event_hash());

    // The runner's own bookkeeping ran too.
    assert_eq!(p.worker.failures().len(), 1);
}

#[tokio::test]
async fn unregistered_worker_class_fails_as_unknown_job() {
    let p = pipeline();
    p.producer.push(QUEUE, Item::new("Missing")).await.unwrap();
    p.worker.work_once(QUEUE).await.unwrap();

    let failed = p.events.filter(event_type_is(EventType::Failed)).filtered_events();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].metadata["exception"], "UnknownJob");
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stage_identity_is_stamped_per_stage() {
    let p = pipeline();
    p.producer.push(QUEUE, Item::new("Succeed")).await.unwrap();
    p.worker.work_once(QUEUE).await.unwrap();

    let events = p.events.events();
    let hostname = jobtrail::metadata::hostname();
    assert_eq!(events[0].metadata["enqueued_hostname"], hostname);
    assert_eq!(events[1].metadata["dequeued_hostname"], hostname);
    assert_eq!(events[2].metadata["performed_hostname"], hostname);
    assert_eq!(events[3].metadata["hostname"], hostname);
    assert_eq!(events[3].metadata["process"], std::process::id());
}

#[tokio::test]
async fn enqueue_keeps_caller_keys_but_owns_pipeline_keys() {
    let p = pipeline();
    let mut caller = Metadata::new();
    caller.insert("tenant".to_string(), json!("acme"));
    caller.insert("event_hash".to_string(), json!("mine"));
    p.producer
        .push(QUEUE, Item::new("Succeed").metadata(caller))
        .await
        .unwrap();

    let stored = p.transport.peek_raw(QUEUE);
    let stored = &stored[0]["metadata"];
    assert_eq!(stored["tenant"], "acme");
    assert_ne!(stored["event_hash"], "mine");
    assert_eq!(stored["event_hash"].as_str().unwrap().len(), 32);
}

#[tokio::test]
async fn preprocessor_changes_are_published_and_stored() {
    let events = Arc::new(FilterPublisher::new());
    let instrumentation = Instrumentation::builder()
        .event_publisher(events.clone())
        .item_preprocessor(|_queue, _item, metadata| {
            metadata.insert("employer_id".to_string(), json!(1));
        })
        .build();
    let p = pipeline_with(instrumentation, events);
    p.producer.push(QUEUE, Item::new("Succeed")).await.unwrap();

    assert_eq!(p.events.events()[0].metadata["employer_id"], 1);
    assert_eq!(p.transport.peek_raw(QUEUE)[0]["metadata"]["employer_id"], 1);
}

#[tokio::test]
async fn panicking_preprocessor_does_not_block_enqueue() {
    let events = Arc::new(FilterPublisher::new());
    let instrumentation = Instrumentation::builder()
        .event_publisher(events.clone())
        .item_preprocessor(|_queue, _item, _metadata| panic!("preprocessor bug"))
        .build();
    let p = pipeline_with(instrumentation, events);
    p.producer.push(QUEUE, Item::new("Succeed")).await.unwrap();

    assert_eq!(p.transport.len(QUEUE), 1);
    assert!(p.transport.peek_raw(QUEUE)[0]["metadata"]["event_hash"].is_string());
}

#[tokio::test]
async fn runtime_context_is_merged_without_overwriting() {
    let p = pipeline();
    p.producer.push(QUEUE, Item::new("Annotate")).await.unwrap();
    p.producer
        .push(QUEUE, Item::new("Annotate").arg("fail"))
        .await
        .unwrap();
    p.worker.work_once(QUEUE).await.unwrap();
    p.worker.work_once(QUEUE).await.unwrap();

    for terminal in p
        .events
        .events()
        .into_iter()
        .filter(|e| e.event_type.is_terminal())
    {
        assert_eq!(terminal.metadata["user_key"], 1);
        assert_ne!(terminal.metadata["event_hash"], "overwritten");
    }
    assert_eq!(
        p.events
            .filter(event_type_is(EventType::PerformStarted))
            .filtered_events()
            .iter()
            .filter(|e| e.metadata.contains_key("user_key"))
            .count(),
        0
    );
}

// ---------------------------------------------------------------------------
// Pass-through paths
// ---------------------------------------------------------------------------

#[tokio::test]
async fn disabled_instrumentation_is_a_pure_pass_through() {
    let performed = Arc::new(AtomicUsize::new(0));
    let mut registry = JobRegistry::new();
    registry.register("Count", Arc::new(Counter(performed.clone())));

    let instrumentation = Arc::new(Instrumentation::disabled());
    let transport = Arc::new(MemoryTransport::new());
    let producer = QueueInterceptor::new(Arc::clone(&transport), Arc::clone(&instrumentation));
    producer.push(QUEUE, Item::new("Count").arg(1)).await.unwrap();

    let stored = transport.peek_raw(QUEUE);
    assert_eq!(stored, vec![json!({"worker_class": "Count", "args": [1]})]);

    let worker = Worker::new(
        transport,
        Arc::new(registry),
        instrumentation,
        WorkerConfig::default(),
    );
    worker.work_once(QUEUE).await.unwrap();
    assert_eq!(performed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn disabled_job_interceptor_still_runs_inner_fail() {
    let failures = FailureLog::new();
    let job = Job::new(QUEUE, Item::new("Missing"), &registry(), failures.clone());
    let mut job = JobInterceptor::new(job, Arc::new(Instrumentation::disabled()));

    let error = job.perform().await.unwrap_err();
    assert_eq!(error.kind, "UnknownJob");
    job.fail(&error).await;
    assert_eq!(failures.len(), 1);
    assert!(job.context().is_none());
}

#[tokio::test]
async fn empty_queue_publishes_nothing() {
    let p = pipeline();
    assert!(p.worker.work_once(QUEUE).await.unwrap().is_none());
    assert!(p.events.is_empty());
}

#[tokio::test]
async fn items_without_metadata_are_performed_silently() {
    let p = pipeline();
    p.transport
        .push_raw(QUEUE, json!({"worker_class": "Succeed", "args": ["x"]}));
    let outcome = p.worker.work_once(QUEUE).await.unwrap();
    assert!(matches!(outcome, Some(JobOutcome::Finished { .. })));
    assert!(p.events.is_empty());
}

#[tokio::test]
async fn pop_returns_items_without_metadata_unchanged() {
    let p = pipeline();
    let raw = json!({"worker_class": "Succeed", "args": ["x"], "metadata": null, "retry": 3});
    p.transport.push_raw(QUEUE, raw.clone());

    let item = p.producer.pop(QUEUE).await.unwrap().unwrap();
    assert_eq!(item, serde_json::from_value::<Item>(raw.clone()).unwrap());
    assert_eq!(serde_json::to_value(&item).unwrap(), raw);
    assert!(p.events.is_empty());
}

#[tokio::test]
async fn non_numeric_enqueued_time_gives_zero_time_in_queue() {
    let p = pipeline();
    let raw = json!({
        "worker_class": "Succeed",
        "args": [],
        "metadata": {"event_hash": "abc", "enqueued_time": "yesterday"},
    });
    p.transport.push_raw(QUEUE, raw);

    let item = p.producer.pop(QUEUE).await.unwrap().unwrap();
    let metadata = item.metadata.unwrap();
    assert_eq!(metadata["time_in_queue"], 0.0);
    assert_eq!(metadata["enqueued_time"], "yesterday");
    assert_eq!(types(&p.events.events()), vec![EventType::Dequeued]);
}

#[tokio::test]
async fn undecodable_payloads_fail_the_pop_without_events() {
    let p = pipeline();
    let legacy = json!({"class": "LegacyJob", "args": [1]});
    p.transport.push_raw(QUEUE, legacy.clone());

    assert!(p.worker.work_once(QUEUE).await.is_err());
    assert_eq!(p.transport.archived(QUEUE), vec![legacy]);
    assert!(p.events.is_empty());
}

#[tokio::test]
async fn outcomes_are_also_published_under_underscore_keys() {
    let p = pipeline();
    p.producer.push(QUEUE, Item::new("Succeed")).await.unwrap();
    p.producer
        .push(QUEUE, Item::new("Raise").arg("test"))
        .await
        .unwrap();
    p.worker.work_once(QUEUE).await.unwrap();
    p.worker.work_once(QUEUE).await.unwrap();

    let finished = p
        .events
        .filter(event_type_is(EventType::PerformFinished))
        .filtered_events();
    let finished = &finished[0].metadata;
    assert_eq!(finished["_time_to_perform"], finished["time_to_perform"]);
    assert!(!finished.contains_key("_exception"));

    p.events.clear_filters();
    let failed = p
        .events
        .filter(event_type_is(EventType::Failed))
        .filtered_events();
    let failed = &failed[0].metadata;
    assert!(failed["_time_to_perform"].as_f64().unwrap() >= 0.0);
    assert_eq!(failed["_exception"], "RuntimeError");
    assert_eq!(failed["_message"], "test");
    assert_eq!(failed["_backtrace"], failed["backtrace"]);
}

#[tokio::test]
async fn configured_marshaller_reaches_byte_sinks() {
    let buffer = Arc::new(std::sync::Mutex::new(Vec::<u8>::new()));
    let writer = SharedWriter(Arc::clone(&buffer));
    let marshaller = |event: &LifecycleEvent| -> jobtrail::error::Result<Vec<u8>> {
        Ok(format!("CUSTOM {}\n", event.event_type).into_bytes())
    };
    let instrumentation = Instrumentation::builder()
        .event_marshaller(Arc::new(marshaller))
        .event_publisher(Arc::new(jobtrail::publisher::StreamPublisher::new(writer)))
        .build();
    let p = pipeline_with(instrumentation, Arc::new(FilterPublisher::new()));

    p.producer.push(QUEUE, Item::new("Succeed")).await.unwrap();
    p.worker.work_once(QUEUE).await.unwrap();

    let written = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
    assert_eq!(
        written,
        "CUSTOM enqueued\nCUSTOM dequeued\nCUSTOM perform_started\nCUSTOM perform_finished\n"
    );
}

/// `Write` over a shared buffer.
struct SharedWriter(Arc<std::sync::Mutex<Vec<u8>>>);

impl std::io::Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn unknown_payload_fields_survive_the_round_trip() {
    let p = pipeline();
    p.producer
        .push(QUEUE, Item::new("Succeed").extra("retry", true))
        .await
        .unwrap();
    let item = p.producer.pop(QUEUE).await.unwrap().unwrap();
    assert_eq!(item.extra["retry"], true);
}

#[tokio::test]
async fn fail_without_perform_reports_zero_time_to_perform() {
    let events = Arc::new(FilterPublisher::new());
    let instrumentation = Arc::new(Instrumentation::with_publisher(events.clone()));
    let mut metadata = jobtrail::metadata::enqueue_metadata();
    metadata.insert("tenant".to_string(), json!("acme"));
    let item = Item::new("Succeed").metadata(metadata);

    let job = Job::new(QUEUE, item, &registry(), FailureLog::new());
    let mut job = JobInterceptor::new(job, instrumentation);
    job.fail(&JobError::new("Timeout", "gave up")).await;

    let published = events.events();
    assert_eq!(types(&published), vec![EventType::Failed]);
    assert_eq!(published[0].metadata["time_to_perform"], 0.0);
    assert_eq!(published[0].metadata["exception"], "Timeout");
    assert_eq!(published[0].metadata["tenant"], "acme");
}

// ---------------------------------------------------------------------------
// Publisher failures
// ---------------------------------------------------------------------------

struct Broken;

impl jobtrail::publisher::Publisher for Broken {
    fn publish(&self, _event: &LifecycleEvent) -> jobtrail::error::Result<()> {
        Err(jobtrail::error::Error::Transport("sink down".to_string()))
    }
}

struct Panicking;

impl jobtrail::publisher::Publisher for Panicking {
    fn publish(&self, _event: &LifecycleEvent) -> jobtrail::error::Result<()> {
        panic!("sink exploded")
    }
}

#[tokio::test]
async fn publisher_errors_never_reach_the_pipeline() {
    for publisher in [
        Arc::new(Broken) as Arc<dyn jobtrail::publisher::Publisher>,
        Arc::new(Panicking),
    ] {
        let p = pipeline_with(
            Instrumentation::with_publisher(publisher),
            Arc::new(FilterPublisher::new()),
        );
        p.producer.push(QUEUE, Item::new("Succeed")).await.unwrap();
        let outcome = p.worker.work_once(QUEUE).await.unwrap();
        assert!(matches!(outcome, Some(JobOutcome::Finished { .. })));
    }
}

// ---------------------------------------------------------------------------
// Destroy
// ---------------------------------------------------------------------------

#[tokio::test]
async fn destroy_publishes_destroyed_for_removed_items() {
    let p = pipeline();
    for item in [
        Item::new("Succeed").arg("a"),
        Item::new("Succeed").arg("b"),
        Item::new("Raise").arg("a"),
    ] {
        p.producer.push(QUEUE, item).await.unwrap();
    }

    let removed = p
        .producer
        .destroy(QUEUE, "Succeed", Some(&[json!("a")][..]))
        .await
        .unwrap();
    assert_eq!(removed.len(), 1);
    assert_eq!(p.transport.len(QUEUE), 2);

    let destroyed = p
        .events
        .filter(event_type_is(EventType::Destroyed))
        .filtered_events();
    assert_eq!(destroyed.len(), 1);
    assert_eq!(destroyed[0].args, vec![json!("a")]);
    assert_eq!(
        destroyed[0].event_hash(),
        removed[0].metadata.as_ref().unwrap()["event_hash"].as_str()
    );

    let removed = p.producer.destroy(QUEUE, "Succeed", None).await.unwrap();
    assert_eq!(removed.len(), 1);
    assert_eq!(p.transport.len(QUEUE), 1);
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

/// Stores its argument, yields, then checks nobody else changed it.
struct Isolated;

#[async_trait]
impl Perform for Isolated {
    async fn perform(&self, args: &[Value], ctx: &RuntimeContext) -> Result<(), JobError> {
        let mine = args.first().cloned().unwrap_or(Value::Null);
        ctx.insert("seen", mine.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        let current = RuntimeContext::current()
            .and_then(|c| c.get("seen"))
            .unwrap_or(Value::Null);
        if current == mine {
            Ok(())
        } else {
            Err(JobError::new("Leak", format!("saw {current}")))
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_jobs_have_independent_contexts() {
    let events = Arc::new(FilterPublisher::new());
    let instrumentation = Arc::new(Instrumentation::with_publisher(events.clone()));
    let transport = Arc::new(MemoryTransport::new());
    let producer = QueueInterceptor::new(Arc::clone(&transport), Arc::clone(&instrumentation));
    for n in 0..8 {
        producer.push(QUEUE, Item::new("Isolated").arg(n)).await.unwrap();
    }

    let mut registry = JobRegistry::new();
    registry.register("Isolated", Arc::new(Isolated));
    let worker = Arc::new(Worker::new(
        transport,
        Arc::new(registry),
        instrumentation,
        WorkerConfig::default(),
    ));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move { worker.work_once(QUEUE).await })
        })
        .collect();
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        assert!(matches!(outcome, Some(JobOutcome::Finished { .. })));
    }

    let finished = events
        .filter(event_type_is(EventType::PerformFinished))
        .filtered_events();
    assert_eq!(finished.len(), 8);
    for event in finished {
        assert_eq!(event.metadata["seen"], event.args[0]);
    }
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn worker_run_drains_queue_until_shutdown() {
    let p = Arc::new(pipeline());
    for _ in 0..3 {
        p.producer.push(QUEUE, Item::new("Succeed")).await.unwrap();
    }

    let runner = Arc::clone(&p);
    let handle = tokio::spawn(async move { runner.worker.run(QUEUE).await });

    tokio::time::timeout(Duration::from_secs(5), async {
        while p.transport.len(QUEUE) > 0
            || p
                .events
                .events()
                .iter()
                .filter(|e| e.event_type == EventType::PerformFinished)
                .count()
                < 3
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    p.worker.shutdown();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
