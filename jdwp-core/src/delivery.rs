// Per-request event delivery
//
// One task per armed request. It pulls events off the request's route in
// arrival order and runs the handler for each one with the target suspended
// and the class cache frozen.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::eventrequest::{EventHandler, EventRequest};
use crate::events::EventResponse;
use crate::protocol::JdwpError;
use crate::session::WeakSession;
use crate::translator::EventObject;

pub(crate) struct DeliveryLoop {
    pub(crate) request: EventRequest,
    pub(crate) session: WeakSession,
    pub(crate) request_id: i32,
    pub(crate) events: mpsc::UnboundedReceiver<EventResponse>,
    pub(crate) stop: CancellationToken,
    pub(crate) handler: EventHandler,
}

enum Exit {
    // Handler returned false.
    Handler,
    // Disabled, deleted or the session ended.
    Stopped,
}

pub(crate) async fn run(mut delivery: DeliveryLoop) {
    debug!("Delivery loop started for request id={}", delivery.request_id);

    match delivery.deliver_until_exit().await {
        Exit::Stopped => {
            delivery.request.release_from_loop(delivery.request_id).await;
        }
        Exit::Handler => {
            if delivery.request.disarm_from_loop(delivery.request_id).await {
                delivery.drain().await;
            }
        }
    }

    debug!("Delivery loop ended for request id={}", delivery.request_id);
}

impl DeliveryLoop {
    async fn deliver_until_exit(&mut self) -> Exit {
        loop {
            self.resume().await;

            let response = tokio::select! {
                biased;
                _ = self.stop.cancelled() => return Exit::Stopped,
                next = self.events.recv() => match next {
                    Some(response) => response,
                    None => return Exit::Stopped,
                },
            };

            if !self.deliver(response).await {
                return Exit::Handler;
            }
        }
    }

    async fn deliver(&self, response: EventResponse) -> bool {
        let session = match self.session.upgrade() {
            Ok(session) => session,
            // The stop token fires on the next iteration.
            Err(_) => return true,
        };

        if let Err(e) = session.suspend_all().await {
            log_rpc_failure("suspend", self.request_id, &e);
        }

        let keep = {
            let _freeze = session.freeze();
            let event = EventObject::new(self.session.clone(), response);
            (self.handler)(event).await
        };

        if let Err(e) = session.resume_all().await {
            log_rpc_failure("resume", self.request_id, &e);
        }
        keep
    }

    async fn resume(&self) {
        let Ok(session) = self.session.upgrade() else {
            return;
        };
        if let Err(e) = session.resume_all().await {
            log_rpc_failure("resume", self.request_id, &e);
        }
    }

    // Events queued before the request was cleared get one handler call each,
    // without suspending the target.
    async fn drain(&mut self) {
        let mut drained = 0usize;
        while let Ok(response) = self.events.try_recv() {
            let event = EventObject::new(self.session.clone(), response);
            (self.handler)(event).await;
            drained += 1;
        }
        if drained > 0 {
            debug!(
                "Drained {} queued events for request id={}",
                drained, self.request_id
            );
        }
    }
}

fn log_rpc_failure(what: &str, request_id: i32, err: &JdwpError) {
    match err {
        JdwpError::Cancelled | JdwpError::ConnectionClosed => {
            debug!("Skipped {} for request id={}: session closed", what, request_id)
        }
        _ => warn!("Failed to {} target for request id={}: {}", what, request_id, err),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tokio::sync::mpsc;

    use crate::commands::{command_sets, event_commands, vm_commands};
    use crate::eventrequest::SuspendPolicy;
    use crate::events::EventResponse;
    use crate::testing::FakeTarget;
    use crate::types::{Location, ThreadId};

    fn thread_start(request_id: i32, thread: u64) -> EventResponse {
        EventResponse::ThreadStart {
            request_id,
            thread: ThreadId(thread),
        }
    }

    #[tokio::test]
    async fn test_events_fan_out_in_arrival_order() {
        let target = FakeTarget::builder().spawn();
        let session = target.attach().await.unwrap();
        let manager = session.event_request_manager();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let a = manager.create_thread_start_request();
        let tx_a = tx.clone();
        a.set_handler(move |event| {
            let tx = tx_a.clone();
            async move {
                let _ = tx.send(("a", event.response().thread()));
                true
            }
        })
        .await
        .unwrap();
        a.enable().await.unwrap();

        let b = manager.create_thread_start_request();
        b.set_handler(move |event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(("b", event.response().thread()));
                true
            }
        })
        .await
        .unwrap();
        b.enable().await.unwrap();

        let id_a = a.request_id().await.unwrap();
        let id_b = b.request_id().await.unwrap();
        target.emit(
            SuspendPolicy::All,
            vec![thread_start(id_a, 1), thread_start(id_b, 2), thread_start(id_a, 3)],
        );

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(rx.recv().await.unwrap());
        }
        let for_a: Vec<_> = seen.iter().filter(|(h, _)| *h == "a").collect();
        assert_eq!(
            for_a,
            vec![&("a", Some(ThreadId(1))), &("a", Some(ThreadId(3)))]
        );
        assert!(seen.contains(&("b", Some(ThreadId(2)))));
    }

    #[tokio::test]
    async fn test_event_right_behind_set_reply_is_delivered() {
        let target = FakeTarget::builder()
            .events_after_set(|request_id| vec![thread_start(request_id, 7), thread_start(555, 8)])
            .spawn();
        let session = target.attach().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let request = session.event_request_manager().create_thread_start_request();
        request
            .set_handler(move |event| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(event.response().thread());
                    true
                }
            })
            .await
            .unwrap();
        request.enable().await.unwrap();

        assert_eq!(rx.recv().await, Some(Some(ThreadId(7))));

        // The stray event for an id nobody armed is not kept around.
        session.get_all_threads().await.unwrap_err();
        assert_eq!(session.parked_count(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_handler_false_disarms_and_drains() {
        let target = FakeTarget::builder().spawn();
        let session = target.attach().await.unwrap();
        let request = session.event_request_manager().create_breakpoint_request(Location::default());

        let calls = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        {
            let calls = calls.clone();
            request
                .set_handler(move |event| {
                    let calls = calls.clone();
                    let done = done_tx.clone();
                    async move {
                        let thread = event.response().thread();
                        let mut calls = calls.lock().unwrap();
                        calls.push(thread);
                        let _ = done.send(());
                        calls.len() > 1
                    }
                })
                .await
                .unwrap();
        }
        request.enable().await.unwrap();
        let id = request.request_id().await.unwrap();

        let bp = |thread| EventResponse::Breakpoint {
            request_id: id,
            thread: ThreadId(thread),
            location: Location::default(),
        };
        target.emit(SuspendPolicy::All, vec![bp(1), bp(2), bp(3)]);
        for _ in 0..3 {
            done_rx.recv().await.unwrap();
        }

        target
            .wait_for_command(command_sets::EVENT_REQUEST, event_commands::CLEAR)
            .await;
        // Anything after the clear has no route and is dropped.
        target.emit(SuspendPolicy::All, vec![bp(4)]);
        session.get_all_threads().await.unwrap_err();
        tokio::task::yield_now().await;

        assert_eq!(
            *calls.lock().unwrap(),
            vec![Some(ThreadId(1)), Some(ThreadId(2)), Some(ThreadId(3))]
        );
        assert_eq!(
            target.count(command_sets::EVENT_REQUEST, event_commands::CLEAR),
            1
        );
        assert!(!request.is_enabled().await);
        assert_eq!(session.route_count(), 0);
    }

    #[tokio::test]
    async fn test_handler_runs_suspended_and_frozen() {
        let target = FakeTarget::builder().spawn();
        let session = target.attach().await.unwrap();
        let request = session.event_request_manager().create_vm_death_request();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let weak = session.downgrade();
        request
            .set_handler(move |_| {
                let tx = tx.clone();
                let weak = weak.clone();
                async move {
                    let frozen = weak.upgrade().map(|s| s.is_frozen()).unwrap_or(false);
                    let _ = tx.send(frozen);
                    true
                }
            })
            .await
            .unwrap();
        request.enable().await.unwrap();
        let id = request.request_id().await.unwrap();

        target.emit(SuspendPolicy::All, vec![EventResponse::VmDeath { request_id: id }]);
        assert!(rx.recv().await.unwrap());

        // Resume on loop start, after the handler, then again on the next pass.
        let commands = target.commands();
        assert!(commands.iter().any(|c| {
            (c.command_set, c.command) == (command_sets::VIRTUAL_MACHINE, vm_commands::SUSPEND)
        }));
        target
            .wait_for_count(command_sets::VIRTUAL_MACHINE, vm_commands::RESUME, 3)
            .await;
        assert!(!session.is_frozen());
    }

    #[tokio::test]
    async fn test_disable_stops_handler_calls() {
        let target = FakeTarget::builder().spawn();
        let session = target.attach().await.unwrap();
        let request = session.event_request_manager().create_thread_death_request();

        let (tx, mut rx) = mpsc::unbounded_channel();
        request
            .set_handler(move |event| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(event.kind());
                    true
                }
            })
            .await
            .unwrap();
        request.enable().await.unwrap();
        let id = request.request_id().await.unwrap();
        request.disable().await.unwrap();

        target.emit(
            SuspendPolicy::None,
            vec![EventResponse::ThreadDeath {
                request_id: id,
                thread: ThreadId(1),
            }],
        );
        // Round trip so the event above has been read before checking.
        session.get_all_threads().await.unwrap_err();

        assert!(rx.try_recv().is_err());
        assert_eq!(session.route_count(), 0);
    }

    #[tokio::test]
    async fn test_session_shutdown_ends_loops_without_rpc() {
        let target = FakeTarget::builder().spawn();
        let session = target.attach().await.unwrap();
        let request = session.event_request_manager().create_class_prepare_request();
        request.set_handler(|_| async { true }).await.unwrap();
        request.enable().await.unwrap();

        session.shutdown();
        // The handler closure is dropped once the loop exits.
        while request.is_enabled().await {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            target.count(command_sets::EVENT_REQUEST, event_commands::CLEAR),
            0
        );
    }
}
