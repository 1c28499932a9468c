//! Lock, election, blocking and cache behaviour against the fake service.

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use parking_lot::Mutex;
use prim::fake::{FakeService, FakeServiceBuilder};
use prim::protocol::{ElectionEvent, ElectionResponse, LeadershipRequest, Name, ResponseHeader, ResponseType, StreamHeader};
use prim::{
	AtomicLock, Blocking, BlockingLock, ElectionService, Error, LeaderElection, ManagedPrimitive, PrimitiveCache, PrimitiveState, SessionOptions, StreamEvent,
};
use serde_json::{Value as JsonValue, json};
use tokio::sync::mpsc;

fn name(value: &str) -> Name {
	Name::new("test", value)
}

fn stream_ack(index: u64) -> ResponseHeader {
	ResponseHeader {
		response_type: ResponseType::OpenStream,
		..ResponseHeader::at(1, index)
	}
}

#[tokio::test]
async fn lock_operations_round_trip() -> anyhow::Result<()> {
	common::init_tracing();
	let (service, mut controller) = FakeServiceBuilder::new().session_id(7).build();
	let lock = AtomicLock::connect(name("lock"), service, SessionOptions::default()).await?;
	assert_eq!(controller.opened_sessions()[0].name, name("lock"));
	assert_eq!(lock.primitive().session_id(), 7);

	let (version, ()) = tokio::join!(lock.lock(), async {
		let call = controller.next_call().await.unwrap();
		assert_eq!(call.method, "lock");
		assert_eq!(call.header.session_id, 7);
		assert_eq!(call.header.sequence_number, 1);
		assert_eq!(call.body["timeout"], JsonValue::Null);
		call.respond_at(8, json!({"acquired": true, "version": 8})).unwrap();
	});
	assert_eq!(version?, 8);

	let (locked, ()) = tokio::join!(lock.is_locked_version(8), async {
		let call = controller.next_call().await.unwrap();
		assert_eq!(call.method, "is_locked");
		assert_eq!(call.header.sequence_number, 1);
		assert_eq!(call.body["version"], 8);
		call.respond_at(8, json!({"locked": true})).unwrap();
	});
	assert!(locked?);

	let (attempt, ()) = tokio::join!(lock.try_lock(), async {
		let call = controller.next_call().await.unwrap();
		assert_eq!(call.body["timeout"], json!({"secs": 0, "nanos": 0}));
		call.respond_at(9, json!({"acquired": false})).unwrap();
	});
	assert_eq!(attempt?, None);

	lock.close().await?;
	assert_eq!(lock.primitive().state(), PrimitiveState::Closed);
	let closed = controller.closed_sessions();
	assert_eq!(closed.len(), 1);
	assert!(!closed[0].delete);

	assert_eq!(lock.is_locked().await, Err(Error::session_closed()));
	assert!(controller.try_next_call().is_none());
	Ok(())
}

#[tokio::test(start_paused = true)]
async fn keep_alive_recovery_resends_outstanding_commands() {
	let (service, mut controller) = FakeServiceBuilder::new().build();
	controller.script_keep_alive(Err(Error::ConnectionRefused("partition".into())));
	let options = SessionOptions::default()
		.with_timeout(Duration::from_secs(10))
		.with_keep_alive_interval(Duration::from_secs(2));
	let lock = AtomicLock::connect(name("lock"), service, options).await.unwrap();

	let states = Arc::new(Mutex::new(Vec::new()));
	let seen = Arc::clone(&states);
	lock.primitive().add_state_change_listener(move |state| seen.lock().push(state));

	let (unlocked, ()) = tokio::join!(lock.unlock_version(3), async {
		let first = controller.next_call().await.unwrap();
		let second = controller.next_call().await.unwrap();
		assert_eq!(second.id(), first.id());
		assert_eq!(second.header.sequence_number, first.header.sequence_number);
		assert_eq!(second.attempt(), 2);
		second.respond_at(4, json!({"unlocked": true})).unwrap();
	});
	assert!(unlocked.unwrap());
	assert_eq!(*states.lock(), vec![PrimitiveState::Suspended, PrimitiveState::Connected]);
	assert!(controller.keep_alives().len() >= 2);
}

#[tokio::test(start_paused = true)]
async fn dead_keep_alive_expires_the_session() {
	let (service, controller) = FakeServiceBuilder::new().build();
	controller.script_keep_alive(Ok(false));
	let options = SessionOptions::default().with_keep_alive_interval(Duration::from_secs(1));
	let lock = AtomicLock::connect(name("lock"), service, options).await.unwrap();

	tokio::time::sleep(Duration::from_millis(1500)).await;
	assert_eq!(lock.primitive().state(), PrimitiveState::Expired);

	tokio::time::sleep(Duration::from_secs(5)).await;
	assert_eq!(controller.keep_alives().len(), 1, "keep-alive stops once the session is gone");
	assert_eq!(lock.try_lock().await, Err(Error::session_closed()));
}

#[tokio::test]
async fn election_commands_and_leadership_events() -> anyhow::Result<()> {
	let (service, mut controller) = FakeServiceBuilder::new().build();
	let election = LeaderElection::connect(name("election"), service, SessionOptions::default()).await?;

	let (leadership, ()) = tokio::join!(election.run("a"), async {
		let call = controller.next_call().await.unwrap();
		assert_eq!(call.method, "enter");
		assert_eq!(call.body["candidateId"], "a");
		let term = json!({"leader": "a", "term": 1, "timestamp": 10, "candidates": ["a"]});
		call.respond_at(3, json!({ "term": term })).unwrap();
	});
	let leader = leadership?.leader.unwrap();
	assert_eq!((leader.id.as_str(), leader.term), ("a", 1));

	let (anointed, ()) = tokio::join!(election.anoint("b"), async {
		let call = controller.next_call().await.unwrap();
		assert_eq!(call.method, "anoint");
		call.respond_at(4, json!({"succeeded": false})).unwrap();
	});
	assert!(!anointed?);

	let (tx, mut events) = mpsc::unbounded_channel();
	let (listener, stream) = tokio::join!(
		election.add_listener(move |event| {
			let _ = tx.send(event.clone());
		}),
		async {
			let call = controller.next_call().await.unwrap();
			assert_eq!(call.method, "events");
			let ack = ResponseHeader {
				response_type: ResponseType::OpenStream,
				..ResponseHeader::at(1, 5)
			};
			call.respond_with(ack, json!({"type": "CHANGED"})).unwrap();
			call
		}
	);
	let listener = listener?;

	let item = ResponseHeader {
		streams: vec![StreamHeader {
			stream_id: stream.header.sequence_number,
			response_id: 1,
			index: 6,
		}],
		..ResponseHeader::at(1, 6)
	};
	let term = json!({"leader": "b", "term": 2, "timestamp": 20, "candidates": ["b", "a"]});
	stream.respond_with(item, json!({"type": "CHANGED", "term": term}))?;
	let event = events.recv().await.unwrap();
	assert_eq!(event.leadership.leader.unwrap().id, "b");
	assert_eq!(event.leadership.candidates, vec!["b".to_string(), "a".to_string()]);

	// A completed stream is re-opened while listeners remain.
	stream.complete();
	let reopened = controller.next_call().await.unwrap();
	assert_eq!(reopened.method, "events");
	assert!(reopened.header.sequence_number > stream.header.sequence_number);

	assert!(election.remove_listener(listener));
	election.delete().await?;
	assert!(controller.closed_sessions()[0].delete);
	Ok(())
}

#[test]
fn blocking_lock_bounds_each_wait() {
	let runtime = tokio::runtime::Runtime::new().unwrap();
	let (service, mut controller) = FakeServiceBuilder::new().build();
	let options = SessionOptions::default().with_operation_timeout(Duration::from_millis(200));
	let lock = runtime.block_on(AtomicLock::connect(name("lock"), service, options)).unwrap();
	let blocking = Blocking::new(runtime.handle().clone(), lock.primitive().options().operation_timeout);
	let lock = BlockingLock::new(Arc::new(lock), blocking);

	let responder = runtime.spawn(async move {
		let call = controller.next_call().await.unwrap();
		call.respond_at(2, json!({"acquired": true, "version": 2})).unwrap();
		controller
	});
	assert_eq!(lock.lock(), Ok(2));
	let mut controller = runtime.block_on(responder).unwrap();

	assert_eq!(lock.is_locked(), Err(Error::Timeout));
	let unanswered = runtime.block_on(controller.next_call()).unwrap();
	assert_eq!(unanswered.method, "is_locked");
}

#[tokio::test]
async fn cache_shares_one_session_per_primitive() -> anyhow::Result<()> {
	let (service, controller) = FakeServiceBuilder::new().build();
	let cache = PrimitiveCache::new();
	let election = name("election");

	let connect = || LeaderElection::connect(election.clone(), service.clone(), SessionOptions::default());
	let first = cache.get_or_create(&election, connect).await?;
	let second = cache.get_or_create(&election, connect).await?;
	assert!(Arc::ptr_eq(&first, &second));
	assert_eq!(controller.opened_sessions().len(), 1);

	let lock: Arc<AtomicLock<_>> = cache
		.get_or_create(&election, || AtomicLock::connect(election.clone(), service.clone(), SessionOptions::default()))
		.await?;
	assert_eq!(lock.primitive().name(), &election);
	assert_eq!(controller.opened_sessions().len(), 2);
	Ok(())
}

#[tokio::test]
async fn close_after_a_server_conflict_still_ends_open_streams() -> anyhow::Result<()> {
	let (service, mut controller) = FakeServiceBuilder::new().build();
	let primitive = ManagedPrimitive::connect(name("election"), service, SessionOptions::default()).await?;

	let (events, mut received) = mpsc::unbounded_channel::<StreamEvent<ElectionEvent>>();
	let opened = primitive.command_stream(|service: &FakeService, header, sink| service.events(LeadershipRequest { header }, sink), events);
	let stream = controller.next_call().await.unwrap();
	stream.respond_with(stream_ack(2), json!({"type": "CHANGED"}))?;
	assert_eq!(opened.await, Ok(2));

	let leadership = primitive.query(|service: &FakeService, header, sink: prim::ResponseSink<ElectionResponse>| {
		service.get_leadership(LeadershipRequest { header }, sink)
	});
	let conflict = Error::ConcurrentModification("session replaced".into());
	controller.next_call().await.unwrap().fail(conflict.clone());
	assert_eq!(leadership.await, Err(conflict));
	assert_eq!(primitive.state(), PrimitiveState::Closed);
	assert!(received.try_recv().is_err());

	primitive.close().await?;
	assert_eq!(received.recv().await, Some(StreamEvent::Error(Error::session_closed())));
	assert!(controller.closed_sessions().is_empty(), "the server already ended the session");
	Ok(())
}

#[tokio::test]
async fn listeners_added_while_the_stream_opens_wait_for_it() -> anyhow::Result<()> {
	let (service, mut controller) = FakeServiceBuilder::new().build();
	let election = LeaderElection::connect(name("election"), service, SessionOptions::default()).await?;

	let mut first = Box::pin(election.add_listener(|_| {}));
	let mut second = Box::pin(election.add_listener(|_| {}));
	assert!((&mut first).now_or_never().is_none());
	assert!((&mut second).now_or_never().is_none(), "second listener waits for the open in flight");

	let call = controller.next_call().await.unwrap();
	assert_eq!(call.method, "events");
	tokio::task::yield_now().await;
	assert!(controller.try_next_call().is_none(), "one stream serves every listener");

	call.respond_with(stream_ack(3), json!({"type": "CHANGED"}))?;
	let (first, second) = tokio::join!(first, second);
	assert_ne!(first?, second?);
	Ok(())
}
