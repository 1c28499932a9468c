//! Failure classification, backoff and replay.

mod common;

use std::time::Duration;

use common::{executor, header, reply, settle, stream_ack, stream_item, transport};
use futures_util::FutureExt;
use prim::{Error, PrimitiveState, StreamEvent};
use tokio::sync::mpsc;

#[tokio::test(start_paused = true)]
async fn connectivity_failures_back_off_along_fibonacci() {
	common::init_tracing();
	let executor = executor(Duration::from_secs(60));
	let (request, mut calls) = transport();

	let result = executor.execute_command(request, header);
	let mut attempts = Vec::new();
	for _ in 0..6 {
		let call = calls.recv().await.unwrap();
		call.sink.on_error(Error::ConnectionRefused("unreachable".into()));
		attempts.push(call);
	}
	let last = calls.recv().await.unwrap();
	assert_eq!(executor.state().state(), PrimitiveState::Suspended);
	last.sink.on_next(reply(9, 42));
	attempts.push(last);

	assert_eq!(result.await.unwrap().value, 42);
	assert_eq!(executor.state().state(), PrimitiveState::Connected);

	let gaps: Vec<u64> = attempts.windows(2).map(|pair| (pair[1].at - pair[0].at).as_secs()).collect();
	assert_eq!(gaps, vec![1, 1, 2, 3, 5, 5]);

	let numbers: Vec<u32> = attempts.iter().map(|call| call.attempt()).collect();
	assert_eq!(numbers, (1..=7).collect::<Vec<_>>());
	assert!(attempts.iter().all(|call| call.id() == 1 && call.header.sequence_number == 1));
}

#[tokio::test(start_paused = true)]
async fn unary_queries_do_not_retry_connectivity_failures() {
	let executor = executor(Duration::from_secs(60));
	let (request, mut calls) = transport();

	let result = executor.execute_query(request, header);
	let call = calls.recv().await.unwrap();
	call.sink.on_error(Error::RequestTimeout("slow".into()));

	assert_eq!(result.await, Err(Error::query_failed()));
	tokio::time::sleep(Duration::from_secs(10)).await;
	assert!(calls.try_recv().is_err());
	assert_eq!(executor.state().state(), PrimitiveState::Connected);
}

#[tokio::test]
async fn unknown_session_expires_the_session() {
	let executor = executor(Duration::from_secs(60));
	let (request, mut calls) = transport();

	let result = executor.execute_command(request.clone(), header);
	calls.recv().await.unwrap().sink.on_error(Error::UnknownSession);
	assert_eq!(result.await, Err(Error::UnknownSession));
	assert_eq!(executor.state().state(), PrimitiveState::Expired);

	let next = executor.execute_command(request, header);
	assert_eq!(next.await, Err(Error::session_closed()));
	assert!(calls.try_recv().is_err());
}

#[tokio::test]
async fn conflicts_close_the_session() {
	let executor = executor(Duration::from_secs(60));
	let (request, mut calls) = transport();

	let result = executor.execute_query(request, header);
	let conflict = Error::ConcurrentModification("replaced".into());
	calls.recv().await.unwrap().sink.on_error(conflict.clone());
	assert_eq!(result.await, Err(conflict));
	assert_eq!(executor.state().state(), PrimitiveState::Closed);
}

#[tokio::test]
async fn reset_resends_outstanding_commands_in_order() {
	let executor = executor(Duration::from_secs(60));
	let (request, mut calls) = transport();

	let handles: Vec<_> = (0..3).map(|_| executor.execute_command(request.clone(), header)).collect();
	let query = executor.execute_query(request, header);
	let mut first_round = Vec::new();
	for _ in 0..4 {
		first_round.push(calls.recv().await.unwrap());
	}

	executor.reset();

	let mut second_round = Vec::new();
	for _ in 0..3 {
		second_round.push(calls.recv().await.unwrap());
	}
	for (before, after) in first_round.iter().zip(&second_round) {
		assert_eq!(after.id(), before.id());
		assert_eq!(after.header.sequence_number, before.header.sequence_number);
		assert_eq!(after.attempt(), before.attempt() + 1);
	}
	assert!(calls.try_recv().is_err());

	for (i, call) in second_round.iter().enumerate() {
		call.sink.on_next(reply(20 + i as u64, i as u64));
	}
	for (i, handle) in handles.into_iter().enumerate() {
		assert_eq!(handle.await.unwrap().value, i as u64);
	}
	assert_eq!(query.await, Err(Error::query_failed()));
}

#[tokio::test]
async fn out_of_sequence_replays_later_commands() {
	let executor = executor(Duration::from_secs(60));
	let (request, mut calls) = transport();

	let handles: Vec<_> = (0..3).map(|_| executor.execute_command(request.clone(), header)).collect();
	let mut first_round = Vec::new();
	for _ in 0..3 {
		first_round.push(calls.recv().await.unwrap());
	}

	first_round[0].sink.on_error(Error::OutOfSequence { last_applied: 0 });
	let mut replayed = Vec::new();
	for _ in 0..3 {
		replayed.push(calls.recv().await.unwrap());
	}
	let order: Vec<(u64, u32)> = replayed.iter().map(|call| (call.id(), call.attempt())).collect();
	assert_eq!(order, vec![(1, 2), (2, 2), (3, 2)]);

	for call in replayed.iter().rev() {
		call.sink.on_next(reply(30 + call.id(), call.id()));
	}
	for (i, handle) in handles.into_iter().enumerate() {
		assert_eq!(handle.await.unwrap().value, i as u64 + 1);
	}
}

#[tokio::test(start_paused = true)]
async fn late_success_from_an_earlier_attempt_is_accepted() {
	let executor = executor(Duration::from_secs(60));
	let (request, mut calls) = transport();

	let mut result = executor.execute_command(request, header);
	let first = calls.recv().await.unwrap();
	first.sink.on_error(Error::ChannelClosed);
	let second = calls.recv().await.unwrap();
	assert_eq!(second.attempt(), 2);

	first.sink.on_next(reply(5, 1));
	settle(&executor).await;
	assert_eq!((&mut result).now_or_never().unwrap().unwrap().value, 1);

	// The retry's own answer finds nothing left to complete.
	second.sink.on_next(reply(6, 2));
	second.sink.on_error(Error::ChannelClosed);
	assert_eq!(executor.in_flight().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn suspension_outlasting_the_timeout_expires_the_session() {
	let executor = executor(Duration::from_secs(3));
	let (request, mut calls) = transport();

	let result = executor.execute_command(request, header);
	loop {
		let call = calls.recv().await.unwrap();
		call.sink.on_error(Error::ConnectionRefused("down".into()));
		settle(&executor).await;
		if executor.state().state() == PrimitiveState::Expired {
			break;
		}
	}
	assert_eq!(result.await, Err(Error::session_closed()));
}

#[tokio::test]
async fn reset_reopens_acknowledged_streams() {
	let executor = executor(Duration::from_secs(60));
	let (request, mut calls) = transport();
	let (events, mut received) = mpsc::unbounded_channel();

	let opened = executor.execute_command_stream(request, header, events);
	let first = calls.recv().await.unwrap();
	let stream_id = first.header.sequence_number;
	first.sink.on_next(stream_ack(2));
	assert_eq!(opened.await, Ok(2));
	first.sink.on_next(stream_item(stream_id, 1, 3, 10));
	assert_eq!(received.recv().await, Some(StreamEvent::Next(stream_item(stream_id, 1, 3, 10))));

	executor.reset();
	let second = calls.recv().await.unwrap();
	assert_eq!(second.id(), first.id());
	assert_eq!(second.attempt(), first.attempt() + 1);
	assert_eq!(second.header.sequence_number, stream_id);

	// The server replays from the start; the observer only sees new items.
	second.sink.on_next(stream_ack(2));
	second.sink.on_next(stream_item(stream_id, 1, 3, 10));
	second.sink.on_next(stream_item(stream_id, 2, 4, 20));
	first.sink.on_next(stream_item(stream_id, 3, 5, 99));
	assert_eq!(received.recv().await, Some(StreamEvent::Next(stream_item(stream_id, 2, 4, 20))));
	settle(&executor).await;
	assert!(received.try_recv().is_err());
}

#[tokio::test]
async fn unknown_session_fails_an_acknowledged_command_stream() {
	let executor = executor(Duration::from_secs(60));
	let (request, mut calls) = transport();
	let (events, mut received) = mpsc::unbounded_channel();

	let opened = executor.execute_command_stream(request, header, events);
	let call = calls.recv().await.unwrap();
	call.sink.on_next(stream_ack(6));
	assert_eq!(opened.await, Ok(6));

	call.sink.on_error(Error::UnknownSession);
	assert_eq!(received.recv().await, Some(StreamEvent::Error(Error::UnknownSession)));
	assert_eq!(received.recv().await, None);
	assert_eq!(executor.state().state(), PrimitiveState::Expired);
	assert_eq!(executor.in_flight().await.unwrap(), 0);
}

#[tokio::test]
async fn conflict_fails_an_acknowledged_query_stream() {
	let executor = executor(Duration::from_secs(60));
	let (request, mut calls) = transport();
	let (events, mut received) = mpsc::unbounded_channel();

	let opened = executor.execute_query_stream(request, header, events);
	let call = calls.recv().await.unwrap();
	call.sink.on_next(reply(3, 1));
	assert_eq!(opened.await, Ok(()));
	assert_eq!(received.recv().await, Some(StreamEvent::Next(reply(3, 1))));

	let conflict = Error::ConcurrentModification("replaced".into());
	call.sink.on_error(conflict.clone());
	assert_eq!(received.recv().await, Some(StreamEvent::Error(conflict)));
	assert_eq!(executor.state().state(), PrimitiveState::Closed);
	settle(&executor).await;
	assert!(calls.try_recv().is_err(), "conflicts are not retried");
}
