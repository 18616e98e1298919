//! Call flows between two user agents over the loopback stack

mod common;

use common::*;
use sipua::domain::call::{CallEventKind, CallState, TerminationReason};
use sipua::infrastructure::protocols::sip::{
    RequestBuilder, SipMethod, StackEvent, TerminatedEvent, TimeoutEvent, TransactionRef,
};
use sipua::UaError;
use std::collections::HashSet;
use std::sync::atomic::Ordering;

struct Setup {
    alice: Peer,
    bob: Peer,
    bob_endpoint: std::sync::Arc<RecordingEndpoint>,
}

async fn setup() -> Setup {
    let alice = Peer::new(5060);
    let bob = Peer::new(5070);
    let bob_endpoint = RecordingEndpoint::new();
    bob.ua
        .register_endpoint(BOB, bob_endpoint.clone())
        .await
        .unwrap();
    Setup {
        alice,
        bob,
        bob_endpoint,
    }
}

#[tokio::test]
async fn test_rejected_call() {
    let s = setup().await;
    let caller = RecordingListener::new();

    let call = s.alice.ua.dial(ALICE, BOB, None, caller.clone()).await.unwrap();
    assert_eq!(call.state().await, CallState::Dialing);
    pump(&s.alice, &s.bob).await;
    assert_eq!(call.state().await, CallState::Ringing);

    let incoming = s.bob_endpoint.last_call();
    assert_eq!(incoming.state().await, CallState::Ringing);
    let callee = RecordingListener::new();
    incoming.add_listener(callee.clone()).await;

    incoming.reject(None).await.unwrap();
    pump(&s.alice, &s.bob).await;

    assert_eq!(
        caller.kinds(),
        vec![
            CallEventKind::Dialing,
            CallEventKind::Ringing,
            CallEventKind::Rejected { status_code: 486 },
        ]
    );
    assert_eq!(callee.kinds(), vec![CallEventKind::Rejected { status_code: 486 }]);
    assert_eq!(
        call.state().await,
        CallState::Terminated(TerminationReason::Rejected)
    );
    assert_eq!(s.bob.stack.sent_statuses(), vec![180, 486]);
}

async fn establish(s: &Setup) -> (sipua::SipCall, sipua::SipCall, std::sync::Arc<RecordingListener>) {
    let caller = RecordingListener::new();
    let call = s
        .alice
        .ua
        .dial(ALICE, BOB, Some("v=0\r\n"), caller.clone())
        .await
        .unwrap();
    pump(&s.alice, &s.bob).await;

    let incoming = s.bob_endpoint.last_call();
    incoming.accept(Some("v=0\r\n")).await.unwrap();
    pump(&s.alice, &s.bob).await;
    (call, incoming, caller)
}

#[tokio::test]
async fn test_answered_call_hung_up_by_caller() {
    let s = setup().await;
    let (call, incoming, caller) = establish(&s).await;

    assert_eq!(call.state().await, CallState::Established);
    assert_eq!(incoming.state().await, CallState::Established);
    assert!(call.stats().await.answered_at.is_some());

    let callee = RecordingListener::new();
    incoming.add_listener(callee.clone()).await;

    call.hangup().await.unwrap();
    // The caller's state only moves when the BYE is answered
    assert_eq!(call.state().await, CallState::Established);
    pump(&s.alice, &s.bob).await;

    assert_eq!(
        caller.names(),
        vec!["call.dialing", "call.ringing", "call.established", "call.terminated"]
    );
    assert_eq!(
        call.state().await,
        CallState::Terminated(TerminationReason::LocalHangup)
    );
    assert_eq!(
        incoming.state().await,
        CallState::Terminated(TerminationReason::RemoteHangup)
    );
    assert_eq!(
        callee.kinds(),
        vec![CallEventKind::Terminated(TerminationReason::RemoteHangup)]
    );
}

#[tokio::test]
async fn test_answered_call_hung_up_by_callee() {
    let s = setup().await;
    let (call, incoming, _caller) = establish(&s).await;

    incoming.hangup().await.unwrap();
    pump(&s.alice, &s.bob).await;

    assert_eq!(
        incoming.state().await,
        CallState::Terminated(TerminationReason::LocalHangup)
    );
    assert_eq!(
        call.state().await,
        CallState::Terminated(TerminationReason::RemoteHangup)
    );
}

#[tokio::test]
async fn test_in_dialog_requests_follow_dialog() {
    let s = setup().await;
    let (call, incoming, _caller) = establish(&s).await;
    call.hangup().await.unwrap();
    pump(&s.alice, &s.bob).await;

    let requests = s.alice.stack.sent_requests();
    let invite = &requests[0];
    let ack = requests
        .iter()
        .find(|r| r.method() == Some(SipMethod::Ack))
        .unwrap();
    let bye = requests
        .iter()
        .find(|r| r.method() == Some(SipMethod::Bye))
        .unwrap();

    // ACK reuses the INVITE's CSeq number, BYE moves past it
    assert_eq!(ack.cseq(), invite.cseq());
    assert!(bye.cseq().unwrap() > invite.cseq().unwrap());
    assert_eq!(bye.call_id(), invite.call_id());
    assert_eq!(bye.from_tag(), invite.from_tag());
    assert_eq!(bye.to_tag().as_deref(), Some(incoming.local_tag()));
    // Sent to the callee's Contact, not the original Request-URI
    assert_eq!(bye.uri().to_string(), "sip:bob@127.0.0.1:5070");
    assert_eq!(invite.body(), b"v=0\r\n");

    let dialog = call.dialog_id().await.unwrap();
    assert_eq!(dialog.local_tag, call.local_tag());
    assert_eq!(dialog.remote_tag, incoming.local_tag());
}

#[tokio::test]
async fn test_caller_cancels_ringing_call() {
    let s = setup().await;
    let caller = RecordingListener::new();
    let call = s.alice.ua.dial(ALICE, BOB, None, caller.clone()).await.unwrap();
    pump(&s.alice, &s.bob).await;
    let incoming = s.bob_endpoint.last_call();

    call.hangup().await.unwrap();
    pump(&s.alice, &s.bob).await;

    assert_eq!(
        caller.kinds(),
        vec![
            CallEventKind::Dialing,
            CallEventKind::Ringing,
            CallEventKind::Cancelled
        ]
    );
    assert_eq!(
        incoming.state().await,
        CallState::Terminated(TerminationReason::Cancelled)
    );
    // 200 for the CANCEL, 487 for the INVITE
    assert_eq!(s.bob.stack.sent_statuses(), vec![180, 200, 487]);

    let requests = s.alice.stack.sent_requests();
    assert_eq!(requests[1].method(), Some(SipMethod::Cancel));
    assert_eq!(requests[1].branch(), requests[0].branch());
    assert_eq!(requests[1].cseq(), requests[0].cseq());
}

#[tokio::test]
async fn test_hangup_declines_unanswered_inbound_call() {
    let s = setup().await;
    let caller = RecordingListener::new();
    let call = s.alice.ua.dial(ALICE, BOB, None, caller.clone()).await.unwrap();
    pump(&s.alice, &s.bob).await;

    s.bob_endpoint.last_call().hangup().await.unwrap();
    pump(&s.alice, &s.bob).await;

    assert_eq!(
        caller.kinds().last(),
        Some(&CallEventKind::Rejected { status_code: 603 })
    );
    assert!(call.state().await.is_terminated());
}

#[tokio::test]
async fn test_invite_timeout_ends_call_once() {
    let s = setup().await;
    let caller = RecordingListener::new();
    let call = s.alice.ua.dial(ALICE, BOB, None, caller.clone()).await.unwrap();
    let invite = call.transactions().await[0].clone();

    for _ in 0..2 {
        s.alice
            .ua
            .handle_event(StackEvent::Timeout(TimeoutEvent {
                transaction: TransactionRef::Client(invite.clone()),
                call_id: Some(call.call_id().to_string()),
            }))
            .await;
    }

    assert_eq!(
        caller.kinds(),
        vec![CallEventKind::Dialing, CallEventKind::Timeout]
    );
    assert_eq!(
        call.state().await,
        CallState::Terminated(TerminationReason::Timeout)
    );
    assert_eq!(s.alice.stack.terminated(), vec![invite]);
}

#[tokio::test]
async fn test_finished_call_leaves_registry() {
    let s = setup().await;
    let (call, _incoming, _caller) = establish(&s).await;
    call.hangup().await.unwrap();
    pump(&s.alice, &s.bob).await;
    assert_eq!(s.alice.ua.active_calls().await, 1);

    for key in call.transactions().await {
        let method = key.method;
        s.alice
            .ua
            .handle_event(StackEvent::TransactionTerminated(TerminatedEvent {
                transaction: TransactionRef::Client(key),
                call_id: Some(call.call_id().to_string()),
            }))
            .await;
        if method == SipMethod::Invite {
            // BYE still outstanding
            assert_eq!(s.alice.ua.active_calls().await, 1);
        }
    }
    assert_eq!(s.alice.ua.active_calls().await, 0);
    assert_eq!(s.alice.ua.client_transaction_count().await, 0);
}

#[tokio::test]
async fn test_unanswerable_bye_ends_call_with_error() {
    let s = setup().await;
    let (call, incoming, _caller) = establish(&s).await;

    s.bob.stack.fail_responses.store(true, Ordering::SeqCst);
    call.hangup().await.unwrap();
    pump(&s.alice, &s.bob).await;

    assert_eq!(
        incoming.state().await,
        CallState::Terminated(TerminationReason::Error)
    );
    // The BYE was never kept, only the INVITE holds the call now
    assert_eq!(s.bob.ua.server_transaction_count().await, 1);
    assert_eq!(s.bob.ua.active_calls().await, 1);

    for key in incoming.transactions().await {
        s.bob
            .ua
            .handle_event(StackEvent::TransactionTerminated(TerminatedEvent {
                transaction: TransactionRef::Server(key),
                call_id: Some(incoming.call_id().to_string()),
            }))
            .await;
    }
    assert_eq!(s.bob.ua.active_calls().await, 0);
    assert_eq!(s.bob.ua.server_transaction_count().await, 0);
}

#[tokio::test]
async fn test_unsupported_method_gets_501() {
    let s = setup().await;
    let options = RequestBuilder::new(SipMethod::Options, BOB.try_into().unwrap())
        .via("UDP", "127.0.0.1:5060", "z9hG4bKoptions1")
        .from(ALICE, "a1")
        .to(BOB, None)
        .call_id("options-1@127.0.0.1")
        .cseq(1, SipMethod::Options)
        .max_forwards(70)
        .build();

    s.bob.ua.handle_event(request_event(options)).await;

    assert_eq!(s.bob.stack.sent_statuses(), vec![501]);
    assert_eq!(s.bob.ua.server_transaction_count().await, 0);
    assert_eq!(s.bob.ua.active_calls().await, 0);
}

#[tokio::test]
async fn test_unknown_address_gets_404() {
    let s = setup().await;
    let invite = RequestBuilder::new(SipMethod::Invite, "sip:carol@127.0.0.1:5070".try_into().unwrap())
        .via("UDP", "127.0.0.1:5060", "z9hG4bKcarol1")
        .from(ALICE, "a1")
        .to("sip:carol@127.0.0.1:5070", None)
        .call_id("carol-1@127.0.0.1")
        .cseq(1, SipMethod::Invite)
        .contact("sip:alice@127.0.0.1:5060")
        .max_forwards(70)
        .build();

    s.bob.ua.handle_event(request_event(invite)).await;

    assert_eq!(s.bob.stack.sent_statuses(), vec![404]);
    assert!(s.bob_endpoint.calls().is_empty());
    assert_eq!(s.bob.ua.active_calls().await, 0);
    assert_eq!(s.bob.ua.server_transaction_count().await, 0);
}

#[tokio::test]
async fn test_bye_for_unknown_dialog_gets_481() {
    let s = setup().await;
    let bye = RequestBuilder::new(SipMethod::Bye, BOB.try_into().unwrap())
        .via("UDP", "127.0.0.1:5060", "z9hG4bKstale1")
        .from(ALICE, "a1")
        .to(BOB, Some("gone"))
        .call_id("stale@127.0.0.1")
        .cseq(2, SipMethod::Bye)
        .max_forwards(70)
        .build();

    s.bob.ua.handle_event(request_event(bye)).await;
    assert_eq!(s.bob.stack.sent_statuses(), vec![481]);
}

#[tokio::test]
async fn test_unmatched_responses_are_dropped() {
    let s = setup().await;
    let caller = RecordingListener::new();
    let call = s.alice.ua.dial(ALICE, BOB, None, caller.clone()).await.unwrap();
    pump(&s.alice, &s.bob).await;

    // Replay the 180 under a branch nobody owns
    let ringing = s
        .bob
        .stack
        .sent()
        .into_iter()
        .find_map(|wire| match wire {
            Wire::Response(response) => Some(response),
            Wire::Request(_) => None,
        })
        .unwrap();
    s.alice
        .ua
        .handle_event(StackEvent::Response(sipua::infrastructure::protocols::sip::ResponseEvent {
            key: None,
            response: ringing,
        }))
        .await;

    assert_eq!(caller.kinds().len(), 2);
    assert_eq!(call.state().await, CallState::Ringing);
}

#[tokio::test]
async fn test_dial_failures_leave_nothing_behind() {
    let s = setup().await;
    let listener = RecordingListener::new();

    s.alice.stack.fail_sends.store(true, Ordering::SeqCst);
    let err = s.alice.ua.dial(ALICE, BOB, None, listener.clone()).await.unwrap_err();
    assert!(matches!(err, UaError::TransportSend(_)));

    s.alice.stack.fail_sends.store(false, Ordering::SeqCst);
    s.alice.stack.up.store(false, Ordering::SeqCst);
    let err = s.alice.ua.dial(ALICE, BOB, None, listener.clone()).await.unwrap_err();
    assert!(matches!(err, UaError::TransportUnavailable(_)));

    s.alice.stack.up.store(true, Ordering::SeqCst);
    let err = s.alice.ua.dial(ALICE, "mailto:bob", None, listener.clone()).await.unwrap_err();
    assert!(matches!(err, UaError::ProtocolBuild(_)));

    assert!(listener.kinds().is_empty());
    assert_eq!(s.alice.ua.active_calls().await, 0);
    assert_eq!(s.alice.ua.client_transaction_count().await, 0);
}

#[tokio::test]
async fn test_identifiers_are_unique() {
    let s = setup().await;
    let mut call_ids = HashSet::new();
    let mut tags = HashSet::new();
    let mut branches = HashSet::new();

    for _ in 0..20 {
        let call = s
            .alice
            .ua
            .dial(ALICE, BOB, None, RecordingListener::new())
            .await
            .unwrap();
        assert!(call_ids.insert(call.call_id().to_string()));
        assert!(tags.insert(call.local_tag().to_string()));
    }
    for request in s.alice.stack.sent_requests() {
        let branch = request.branch().unwrap();
        assert!(branch.starts_with("z9hG4bK"));
        assert!(branches.insert(branch));
    }
    assert_eq!(branches.len(), 20);
}

#[tokio::test]
async fn test_accept_twice_is_refused() {
    let s = setup().await;
    s.alice
        .ua
        .dial(ALICE, BOB, None, RecordingListener::new())
        .await
        .unwrap();
    pump(&s.alice, &s.bob).await;

    let incoming = s.bob_endpoint.last_call();
    incoming.accept(None).await.unwrap();
    let err = incoming.accept(None).await.unwrap_err();
    assert!(matches!(err, UaError::InvalidStateTransition(_)));
}
