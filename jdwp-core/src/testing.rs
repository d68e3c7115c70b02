// In-process fake JDWP target for tests
//
// Speaks the wire protocol over a tokio duplex pipe: answers the handshake,
// records every command it receives, replies according to per-command
// behaviors and can push composite event packets at any time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::codec::{encode_to_vec, JdwpEncode};
use crate::commands::{command_sets, event_commands, event_packet_commands, vm_commands};
use crate::config::SessionConfig;
use crate::eventloop::read_packet;
use crate::eventrequest::SuspendPolicy;
use crate::events::{EventResponse, EventSet};
use crate::protocol::{CommandPacket, JdwpResult, Packet, ReplyPacket, JDWP_HANDSHAKE};
use crate::session::Session;
use crate::types::IdSizes;

const NOT_IMPLEMENTED: u16 = 99;
const INTERNAL: u16 = 113;

type Responder = Arc<dyn Fn(&[u8], IdSizes) -> JdwpResult<Vec<u8>> + Send + Sync>;
type SetFollowUp = Arc<dyn Fn(i32) -> Vec<EventResponse> + Send + Sync>;

#[derive(Clone)]
enum Behavior {
    Respond(Responder),
    // Hold replies until `count` commands are in, then answer them newest first.
    Batched { count: usize, respond: Responder },
    Fail(u16),
    Silent,
}

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub(crate) struct FakeTargetBuilder {
    sizes: IdSizes,
    behaviors: HashMap<(u8, u8), Behavior>,
    after_set: Option<SetFollowUp>,
}

impl FakeTargetBuilder {
    pub(crate) fn id_sizes(mut self, sizes: IdSizes) -> Self {
        self.sizes = sizes;
        self
    }

    pub(crate) fn respond<F>(mut self, command_set: u8, command: u8, respond: F) -> Self
    where
        F: Fn(&[u8], IdSizes) -> JdwpResult<Vec<u8>> + Send + Sync + 'static,
    {
        self.behaviors
            .insert((command_set, command), Behavior::Respond(Arc::new(respond)));
        self
    }

    pub(crate) fn respond_batched<F>(
        mut self,
        command_set: u8,
        command: u8,
        count: usize,
        respond: F,
    ) -> Self
    where
        F: Fn(&[u8], IdSizes) -> JdwpResult<Vec<u8>> + Send + Sync + 'static,
    {
        self.behaviors.insert(
            (command_set, command),
            Behavior::Batched {
                count,
                respond: Arc::new(respond),
            },
        );
        self
    }

    pub(crate) fn fail(mut self, command_set: u8, command: u8, error_code: u16) -> Self {
        self.behaviors
            .insert((command_set, command), Behavior::Fail(error_code));
        self
    }

    pub(crate) fn silent(mut self, command_set: u8, command: u8) -> Self {
        self.behaviors.insert((command_set, command), Behavior::Silent);
        self
    }

    /// Right behind each default EventRequest.Set reply, send the events
    /// returned for the newly assigned request id.
    pub(crate) fn events_after_set<F>(mut self, events: F) -> Self
    where
        F: Fn(i32) -> Vec<EventResponse> + Send + Sync + 'static,
    {
        self.after_set = Some(Arc::new(events));
        self
    }

    /// Start serving. Must be called inside a tokio runtime.
    pub(crate) fn spawn(self) -> FakeTarget {
        init_tracing();

        let (client, server) = tokio::io::duplex(64 * 1024);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::default());
        let disconnect = CancellationToken::new();

        let server_state = Server {
            sizes: self.sizes,
            behaviors: self.behaviors,
            shared: shared.clone(),
            out: out_tx.clone(),
            next_request_id: 1,
            batches: HashMap::new(),
            after_set: self.after_set,
        };
        tokio::spawn(serve(server, server_state, out_rx, disconnect.clone()));

        FakeTarget {
            client: Mutex::new(Some(client)),
            shared,
            out: out_tx,
            sizes: self.sizes,
            next_event_id: AtomicU32::new(0x4000_0000),
            disconnect,
        }
    }
}

#[derive(Default)]
struct Shared {
    commands: Mutex<Vec<CommandPacket>>,
    notify: Notify,
}

pub(crate) struct FakeTarget {
    client: Mutex<Option<DuplexStream>>,
    shared: Arc<Shared>,
    out: mpsc::UnboundedSender<Vec<u8>>,
    sizes: IdSizes,
    next_event_id: AtomicU32,
    disconnect: CancellationToken,
}

impl FakeTarget {
    pub(crate) fn builder() -> FakeTargetBuilder {
        FakeTargetBuilder {
            sizes: IdSizes::default(),
            behaviors: HashMap::new(),
            after_set: None,
        }
    }

    /// Open a session against this target. Only the first call gets a stream.
    pub(crate) async fn attach(&self) -> JdwpResult<Session> {
        let client = self
            .client
            .lock()
            .unwrap()
            .take()
            .expect("fake target already attached");
        Session::open(client, SessionConfig::default()).await
    }

    /// Every command received so far, in arrival order.
    pub(crate) fn commands(&self) -> Vec<CommandPacket> {
        self.shared.commands.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, command_set: u8, command: u8) -> usize {
        self.shared
            .commands
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.command_set == command_set && c.command == command)
            .count()
    }

    pub(crate) async fn wait_for_command(&self, command_set: u8, command: u8) {
        self.wait_for_count(command_set, command, 1).await
    }

    pub(crate) async fn wait_for_count(&self, command_set: u8, command: u8, count: usize) {
        loop {
            let notified = self.shared.notify.notified();
            if self.count(command_set, command) >= count {
                return;
            }
            notified.await;
        }
    }

    /// Send a composite event packet, encoded with the target's id sizes.
    pub(crate) fn emit(&self, suspend_policy: SuspendPolicy, events: Vec<EventResponse>) {
        let set = EventSet {
            suspend_policy,
            events,
        };
        let data = encode_to_vec(&set, self.sizes).expect("encode event set");
        self.inject(command_sets::EVENT, event_packet_commands::COMPOSITE, data);
    }

    /// Send an arbitrary command packet to the client.
    pub(crate) fn inject(&self, command_set: u8, command: u8, data: Vec<u8>) {
        let id = self.next_event_id.fetch_add(1, Ordering::SeqCst);
        let packet = CommandPacket::new(id, command_set, command).with_data(data);
        self.send_raw(packet.encode());
    }

    /// Put bytes on the wire as they are.
    pub(crate) fn send_raw(&self, bytes: Vec<u8>) {
        let _ = self.out.send(bytes);
    }

    /// Close the connection from the target side.
    pub(crate) fn disconnect(&self) {
        self.disconnect.cancel();
    }
}

impl Drop for FakeTarget {
    fn drop(&mut self) {
        self.disconnect.cancel();
    }
}

struct Server {
    sizes: IdSizes,
    behaviors: HashMap<(u8, u8), Behavior>,
    shared: Arc<Shared>,
    out: mpsc::UnboundedSender<Vec<u8>>,
    next_request_id: i32,
    batches: HashMap<(u8, u8), Vec<CommandPacket>>,
    after_set: Option<SetFollowUp>,
}

async fn serve(
    mut stream: DuplexStream,
    mut server: Server,
    mut out_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    disconnect: CancellationToken,
) {
    let mut handshake = vec![0u8; JDWP_HANDSHAKE.len()];
    if stream.read_exact(&mut handshake).await.is_err() || handshake != JDWP_HANDSHAKE {
        return;
    }
    if stream.write_all(JDWP_HANDSHAKE).await.is_err() {
        return;
    }

    let (mut reader, mut writer) = tokio::io::split(stream);

    let write_token = disconnect.clone();
    let write_task = tokio::spawn(async move {
        loop {
            let bytes = tokio::select! {
                _ = write_token.cancelled() => break,
                next = out_rx.recv() => match next {
                    Some(bytes) => bytes,
                    None => break,
                },
            };
            if writer.write_all(&bytes).await.is_err() {
                break;
            }
        }
        writer
    });

    loop {
        let packet = tokio::select! {
            _ = disconnect.cancelled() => break,
            packet = read_packet(&mut reader, usize::MAX) => match packet {
                Ok(packet) => packet,
                Err(_) => break,
            },
        };
        if let Packet::Command(command) = packet {
            server.handle(command);
        }
    }

    disconnect.cancel();
    // Dropping both halves closes the pipe.
    if let Ok(writer) = write_task.await {
        drop(writer);
    }
    drop(reader);
}

impl Server {
    fn handle(&mut self, command: CommandPacket) {
        {
            self.shared.commands.lock().unwrap().push(command.clone());
        }
        self.shared.notify.notify_waiters();

        let key = (command.command_set, command.command);
        match self.behaviors.get(&key).cloned() {
            Some(Behavior::Respond(respond)) => {
                let reply = match respond(&command.data, self.sizes) {
                    Ok(data) => ReplyPacket::new(command.id, 0, data),
                    Err(_) => ReplyPacket::new(command.id, INTERNAL, Vec::new()),
                };
                self.send(reply);
            }
            Some(Behavior::Batched { count, respond }) => {
                let batch = self.batches.entry(key).or_default();
                batch.push(command);
                if batch.len() >= count {
                    let batch = std::mem::take(batch);
                    for command in batch.into_iter().rev() {
                        let reply = match respond(&command.data, self.sizes) {
                            Ok(data) => ReplyPacket::new(command.id, 0, data),
                            Err(_) => ReplyPacket::new(command.id, INTERNAL, Vec::new()),
                        };
                        self.send(reply);
                    }
                }
            }
            Some(Behavior::Fail(code)) => {
                self.send(ReplyPacket::new(command.id, code, Vec::new()));
            }
            Some(Behavior::Silent) => {}
            None => {
                let reply = self.default_reply(&command);
                self.send(reply);
                if key == (command_sets::EVENT_REQUEST, event_commands::SET) {
                    self.follow_set(self.next_request_id - 1);
                }
            }
        }
    }

    fn default_reply(&mut self, command: &CommandPacket) -> ReplyPacket {
        let ok = |data: Vec<u8>| ReplyPacket::new(command.id, 0, data);
        match (command.command_set, command.command) {
            (command_sets::VIRTUAL_MACHINE, vm_commands::ID_SIZES) => {
                ok(self.encode(&self.sizes))
            }
            (command_sets::VIRTUAL_MACHINE, vm_commands::SUSPEND)
            | (command_sets::VIRTUAL_MACHINE, vm_commands::RESUME)
            | (command_sets::VIRTUAL_MACHINE, vm_commands::DISPOSE)
            | (command_sets::EVENT_REQUEST, event_commands::CLEAR)
            | (command_sets::EVENT_REQUEST, event_commands::CLEAR_ALL_BREAKPOINTS) => {
                ok(Vec::new())
            }
            (command_sets::EVENT_REQUEST, event_commands::SET) => {
                let id = self.next_request_id;
                self.next_request_id += 1;
                ok(self.encode(&id))
            }
            _ => ReplyPacket::new(command.id, NOT_IMPLEMENTED, Vec::new()),
        }
    }

    fn follow_set(&self, request_id: i32) {
        let Some(after_set) = &self.after_set else {
            return;
        };
        let set = EventSet {
            suspend_policy: SuspendPolicy::None,
            events: after_set(request_id),
        };
        let packet = CommandPacket::new(
            0x7fff_0000,
            command_sets::EVENT,
            event_packet_commands::COMPOSITE,
        )
        .with_data(self.encode(&set));
        let _ = self.out.send(packet.encode());
    }

    fn encode<T: JdwpEncode + ?Sized>(&self, value: &T) -> Vec<u8> {
        encode_to_vec(value, self.sizes).expect("fake target encode")
    }

    fn send(&self, reply: ReplyPacket) {
        let _ = self.out.send(reply.encode());
    }
}
