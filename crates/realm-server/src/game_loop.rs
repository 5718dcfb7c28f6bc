//! The control loop: the only task that touches the [`World`].
//!
//! Every timer sleeps until its own deadline and, after its callback has run,
//! sets the next deadline one period from *now*. A slow tick therefore delays
//! the next one instead of piling up behind it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use realm_core::admin::{self, AdminCommand, AdminOutcome};
use realm_core::authority::{AuthorityReply, AuthorityRequest};
use realm_core::error::{AdminError, TickError};
use realm_core::participant::ParticipantId;
use realm_core::protocol::{ClientMessage, encode_server_message};
use realm_core::session;
use realm_core::tick;
use realm_core::time::Millis;
use realm_core::world::World;

use crate::authority::Authority;
use crate::config::TicksConfig;

/// Delay between dropping every connection and leaving the loop after a
/// failed tick, so close frames get out.
const FAIL_FAST_DELAY: Duration = Duration::from_millis(500);

/// How long a stopping loop waits for authority calls still in flight.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A frame for one connection's writer task.
#[derive(Debug, Clone)]
pub enum Frame {
    /// Shared so one encoded batch can go to every connection without copying.
    Text(Arc<str>),
    Close(String),
}

/// Commands sent from connection handlers and the admin surface to the loop.
#[derive(Debug)]
pub enum GameCommand {
    Connect {
        fingerprint: String,
        outbound: mpsc::Sender<Frame>,
        reply: oneshot::Sender<ParticipantId>,
    },
    Message {
        id: ParticipantId,
        msg: ClientMessage,
    },
    /// A frame from `id` that could not be decoded.
    Malformed {
        id: ParticipantId,
    },
    Disconnect {
        id: ParticipantId,
    },
    Admin {
        cmd: AdminCommand,
        reply: oneshot::Sender<Result<AdminOutcome, AdminError>>,
    },
    Shutdown,
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    Shutdown,
    /// The configured round count was reached; the supervisor restarts us.
    Reboot,
}

/// Maps the world clock onto tokio instants.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
    base: Millis,
}

impl Clock {
    pub fn new(base: Millis) -> Self {
        Self {
            origin: Instant::now(),
            base,
        }
    }

    pub fn now(&self) -> Millis {
        self.base + self.origin.elapsed().as_millis() as Millis
    }

    pub fn instant(&self, at: Millis) -> Instant {
        self.origin + Duration::from_millis(at.saturating_sub(self.base))
    }
}

/// Open connections and their outbound channels.
#[derive(Default)]
pub struct Connections {
    senders: HashMap<ParticipantId, mpsc::Sender<Frame>>,
}

impl Connections {
    pub fn insert(&mut self, id: ParticipantId, tx: mpsc::Sender<Frame>) {
        self.senders.insert(id, tx);
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    /// Queue a frame for one connection. A full buffer drops the frame.
    pub fn send(&self, id: ParticipantId, frame: Frame) {
        if let Some(tx) = self.senders.get(&id)
            && tx.try_send(frame).is_err()
        {
            tracing::debug!(participant_id = id, "Outbound buffer full, frame dropped");
        }
    }

    pub fn broadcast(&self, text: &Arc<str>) {
        for (id, tx) in &self.senders {
            if tx.try_send(Frame::Text(Arc::clone(text))).is_err() {
                tracing::debug!(participant_id = id, "Outbound buffer full, batch dropped");
            }
        }
    }

    /// Close one connection and forget it.
    pub fn close(&mut self, id: ParticipantId, reason: &str) {
        if let Some(tx) = self.senders.remove(&id) {
            let _ = tx.try_send(Frame::Close(reason.to_string()));
        }
    }

    pub fn close_all(&mut self, reason: &str) {
        for (_, tx) in self.senders.drain() {
            let _ = tx.try_send(Frame::Close(reason.to_string()));
        }
    }
}

/// Everything the loop owns besides the world.
struct Host {
    connections: Connections,
    authority: Arc<dyn Authority>,
    replies: mpsc::UnboundedSender<AuthorityReply>,
    /// Authority calls spawned whose reply has not been applied yet.
    in_flight: usize,
}

impl Host {
    /// Deliver what the world produced since the last flush. The shared
    /// event batch only goes out with a fast tick, one frame per tick.
    fn flush(&mut self, world: &mut World, with_batch: bool) {
        let out = if with_batch {
            world.take_outbound()
        } else {
            world.take_unicast()
        };
        if let Some(batch) = out.batch {
            self.connections.broadcast(&Arc::from(batch));
        }
        for (id, msg) in out.direct {
            match encode_server_message(&msg) {
                Ok(text) => self.connections.send(id, Frame::Text(Arc::from(text))),
                Err(e) => {
                    tracing::error!(
                        participant_id = id,
                        error = %e,
                        "Failed to encode direct message"
                    );
                },
            }
        }
        for (id, reason) in out.kicks {
            self.connections.close(id, &reason);
            session::disconnect(world, id);
        }
        for req in out.requests {
            self.in_flight += 1;
            let authority = Arc::clone(&self.authority);
            let replies = self.replies.clone();
            tokio::spawn(async move {
                let reply = authority.call(req).await;
                let _ = replies.send(reply);
            });
        }
    }

    fn handle(&mut self, world: &mut World, now: Millis, cmd: GameCommand) -> bool {
        world.now = now;
        match cmd {
            GameCommand::Connect {
                fingerprint,
                outbound,
                reply,
            } => {
                let id = session::connect(world, fingerprint);
                self.connections.insert(id, outbound);
                let _ = reply.send(id);
            },
            GameCommand::Message { id, msg } => session::handle(world, id, msg),
            GameCommand::Malformed { id } => session::reject_input(world, id),
            GameCommand::Disconnect { id } => {
                self.connections.close(id, "closed");
                session::disconnect(world, id);
            },
            GameCommand::Admin { cmd, reply } => {
                let result = admin::apply(world, cmd);
                if let Err(e) = &result {
                    tracing::info!(error = %e, "Admin command rejected");
                }
                let _ = reply.send(result);
            },
            GameCommand::Shutdown => return false,
        }
        true
    }

    fn apply_reply(&mut self, world: &mut World, now: Millis, reply: AuthorityReply) {
        self.in_flight = self.in_flight.saturating_sub(1);
        world.now = now;
        world.apply_authority(reply);
    }

    /// Wait for the authority calls still in flight so a failed persist lands
    /// back in the local queue, then log every round record nobody stored.
    /// Returns how many records were left unpersisted.
    async fn drain(
        &mut self,
        world: &mut World,
        replies: &mut mpsc::UnboundedReceiver<AuthorityReply>,
        clock: &Clock,
        timeout: Duration,
    ) -> usize {
        let deadline = Instant::now() + timeout;
        while self.in_flight > 0 {
            match tokio::time::timeout_at(deadline, replies.recv()).await {
                Ok(Some(reply)) => self.apply_reply(world, clock.now(), reply),
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(pending = self.in_flight, "Authority calls still in flight");
                    break;
                },
            }
        }

        // retries queued by the replies above are never sent
        let unsent = world
            .take_unicast()
            .requests
            .into_iter()
            .filter_map(|req| match req {
                AuthorityRequest::Persist(record) => Some(*record),
                _ => None,
            });
        let mut left: Vec<_> = world.persist_queue.drain(..).collect();
        left.extend(unsent);
        for record in &left {
            match serde_json::to_string(record) {
                Ok(json) => tracing::error!(
                    record_id = %record.record_id,
                    record = %json,
                    "Round record left unpersisted"
                ),
                Err(e) => tracing::error!(
                    record_id = %record.record_id,
                    error = %e,
                    "Round record left unpersisted and could not be encoded"
                ),
            }
        }
        left.len()
    }
}

struct Deadlines {
    fast: Instant,
    slow: Instant,
    update: Instant,
    reward: Instant,
    connection: Instant,
}

impl Deadlines {
    fn new(ticks: &TicksConfig) -> Self {
        let now = Instant::now();
        Self {
            fast: now + ms(ticks.fast_ms),
            slow: now + ms(ticks.slow_ms),
            update: now + ms(ticks.update_ms),
            reward: now + ms(ticks.reward_ms),
            connection: now + ms(ticks.connection_ms),
        }
    }
}

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

/// Spawn the control loop. Returns the command sender and the loop's handle.
pub fn spawn_game_loop(
    world: World,
    clock: Clock,
    ticks: TicksConfig,
    authority: Arc<dyn Authority>,
    command_buffer: usize,
) -> (mpsc::Sender<GameCommand>, JoinHandle<Result<LoopExit, TickError>>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(command_buffer);
    let handle = tokio::spawn(run_game_loop(world, clock, ticks, authority, cmd_rx));
    (cmd_tx, handle)
}

async fn run_game_loop(
    mut world: World,
    clock: Clock,
    ticks: TicksConfig,
    authority: Arc<dyn Authority>,
    mut cmd_rx: mpsc::Receiver<GameCommand>,
) -> Result<LoopExit, TickError> {
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
    let mut host = Host {
        connections: Connections::default(),
        authority,
        replies: reply_tx,
        in_flight: 0,
    };
    let mut next = Deadlines::new(&ticks);
    world.last_fast_tick = clock.now();
    tracing::info!(round = world.round.id, mode = %world.rules.mode, "Control loop started");

    loop {
        let round_deadline = world.round_ends_at.map(|at| clock.instant(at));
        let mut ticked = false;
        let exit = tokio::select! {
            _ = tokio::time::sleep_until(next.fast) => {
                if let Err(e) = tick::fast_tick(&mut world, clock.now()) {
                    tracing::error!(error = %e, "Fast tick failed, disconnecting everyone");
                    host.connections.close_all("server error");
                    tokio::time::sleep(FAIL_FAST_DELAY).await;
                    return Err(e);
                }
                next.fast = Instant::now() + ms(ticks.fast_ms);
                ticked = true;
                None
            }
            _ = tokio::time::sleep_until(next.slow) => {
                tick::slow_tick(&mut world, clock.now());
                next.slow = Instant::now() + ms(ticks.slow_ms);
                None
            }
            _ = tokio::time::sleep_until(next.update) => {
                tick::update_tick(&mut world, clock.now());
                next.update = Instant::now() + ms(ticks.update_ms);
                None
            }
            _ = tokio::time::sleep_until(next.reward) => {
                tick::reward_tick(&mut world, clock.now());
                next.reward = Instant::now() + ms(ticks.reward_ms);
                None
            }
            _ = tokio::time::sleep_until(next.connection) => {
                tick::connection_tick(&mut world, clock.now());
                next.connection = Instant::now() + ms(ticks.connection_ms);
                None
            }
            _ = sleep_until_opt(round_deadline), if round_deadline.is_some() => {
                if let Some(summary) = tick::round_tick(&mut world, clock.now()) {
                    tracing::info!(
                        round = summary.round,
                        next_preset = %summary.next_preset,
                        next_mode = %summary.next_mode,
                        winners = summary.standings.len(),
                        "Round settled"
                    );
                }
                None
            }
            Some(reply) = reply_rx.recv() => {
                host.apply_reply(&mut world, clock.now(), reply);
                None
            }
            cmd = cmd_rx.recv() => match cmd {
                Some(cmd) => {
                    (!host.handle(&mut world, clock.now(), cmd)).then_some(LoopExit::Shutdown)
                },
                None => Some(LoopExit::Shutdown),
            },
        };

        let force_flush = ticked || exit.is_some() || world.shutdown_requested;
        host.flush(&mut world, force_flush);

        if let Some(exit) = exit {
            tracing::info!(connections = host.connections.len(), "Control loop shutting down");
            host.connections.close_all("shutdown");
            host.drain(&mut world, &mut reply_rx, &clock, DRAIN_TIMEOUT).await;
            return Ok(exit);
        }
        if world.shutdown_requested {
            tracing::warn!(rounds = world.rounds_played, "Rebooting after configured round count");
            host.connections.close_all("server restarting");
            host.drain(&mut world, &mut reply_rx, &clock, DRAIN_TIMEOUT).await;
            return Ok(LoopExit::Reboot);
        }
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
