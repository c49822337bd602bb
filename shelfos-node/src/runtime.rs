//! Wires the scheduler, radio, host peripherals and pairing state machines
//! into one cooperative loop, driven by frames off the radio and commands
//! off the control socket.
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crossbeam_channel as chan;
use thiserror::Error;

use shelfos::clock::RefClock;
use shelfos::codec::Value;
use shelfos::config::{Config, EnrollmentConfig};
use shelfos::discovery::Resolution;
use shelfos::envelope;
use shelfos::identity::{NodeId, SwarmIdentity};
use shelfos::message::Payload;
use shelfos::pairing::{Candidate, QueenPairing, WorkerPairing, WorkerState};
use shelfos::peripheral::HostPeripherals;
use shelfos::queen::{Credentials, QueenAuthority};
use shelfos::rpc::CallResult;
use shelfos::scheduler::{Radio, Scheduler};
use shelfos::trust::Registry;

use crate::control::{Command, CommandResult};

const TICK_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Error, Debug)]
pub enum HandleError {
    #[error("this node is already enrolled in a swarm")]
    AlreadyEnrolled,
    #[error("this node is not the queen")]
    NotQueen,
    #[error("no such peripheral, or it did not resolve in time")]
    Unreachable,
    #[error(transparent)]
    Registry(#[from] shelfos::trust::Error),
    #[error(transparent)]
    QueenAuthority(#[from] shelfos::queen::Error),
    #[error(transparent)]
    Config(#[from] shelfos::config::Error),
}

pub struct Paths {
    pub config: PathBuf,
    pub registry: PathBuf,
}

pub struct Runtime {
    config: Config,
    scheduler: Scheduler,
    queen: Option<QueenAuthority>,
    /// Set for the lifetime of one `pairAsQueen` call, so the `PAIR_COMPLETE`
    /// frame it waits for (and its own timeout) can be recognized when it
    /// arrives off the radio on a later tick.
    queen_pairing: Option<QueenPairing>,
    worker_pairing: WorkerPairing,
    host: Box<dyn HostPeripherals>,
    radio: Box<dyn Radio>,
    /// Control-socket replies still waiting on an RPC RESULT or timeout,
    /// keyed by request id. Never blocks the loop: `Call` against a remote
    /// peripheral registers here and returns control to the loop
    /// immediately, so the frame that resolves it can still be received.
    pending_calls: HashMap<String, chan::Sender<CommandResult>>,
    /// `discoverOnce` requests still collecting ANNOUNCE replies, keyed by
    /// the deadline they were opened against rather than a request id --
    /// DISCOVER carries none. Flushed from the main loop once their
    /// deadline elapses.
    pending_discoveries: Vec<PendingDiscovery>,
    commands: chan::Receiver<(Command, chan::Sender<CommandResult>)>,
    paths: Paths,
}

struct PendingDiscovery {
    deadline: shelfos::clock::Timestamp,
    reply: chan::Sender<CommandResult>,
}

impl Runtime {
    pub fn init(
        paths: Paths,
        label: &str,
        host: Box<dyn HostPeripherals>,
        radio: Box<dyn Radio>,
        commands: chan::Receiver<(Command, chan::Sender<CommandResult>)>,
    ) -> Result<Self, HandleError> {
        let config = Config::load(&paths.config, label)?;
        let clock = RefClock::now();
        let mut scheduler = Scheduler::new(config.node_id().clone(), config.label(), clock);

        let queen = match config.enrollment() {
            Some(enrollment) if enrollment.queen_node_id == *config.node_id() => {
                scheduler.set_swarm_secret(enrollment.swarm_secret.clone());
                let identity = SwarmIdentity {
                    swarm_id: enrollment.swarm_id.clone(),
                    display_name: label.to_owned(),
                    swarm_secret: enrollment.swarm_secret.clone(),
                    created_at: 0,
                    queen_node_id: enrollment.queen_node_id.clone(),
                };
                let registry = Registry::load(&paths.registry)?;
                Some(QueenAuthority::new(identity, registry))
            }
            Some(enrollment) => {
                scheduler.set_swarm_secret(enrollment.swarm_secret.clone());
                None
            }
            None => None,
        };

        scheduler.rescan(host.as_ref());
        let worker_pairing = WorkerPairing::new(config.node_id().clone(), config.label());

        Ok(Self {
            config,
            scheduler,
            queen,
            queen_pairing: None,
            worker_pairing,
            host,
            radio,
            pending_calls: HashMap::new(),
            pending_discoveries: Vec::new(),
            commands,
            paths,
        })
    }

    /// Run the cooperative loop until the process is killed. Never spawns a
    /// thread: radio polling, command dispatch and housekeeping all happen
    /// on this one thread, per tick.
    pub fn run(mut self) -> Result<(), HandleError> {
        loop {
            while let Some(frame) = self.radio.try_recv() {
                if self.try_handle_pairing_frame(&frame, now()) {
                    continue;
                }
                let reaction = self.scheduler.on_receive(self.host.as_ref(), &frame);
                for payload in &reaction.to_send {
                    self.scheduler.send(self.radio.as_mut(), payload);
                }
                if let Some((request_id, result)) = reaction.resolved_call {
                    self.resolve_pending_call(&request_id, result);
                }
            }

            let now = now();
            if let Some(payload) = self.worker_pairing.tick(now) {
                self.radio.broadcast(&payload.encode());
            }
            if let Some(session) = self.queen_pairing.as_mut() {
                if session.tick(now).is_err() {
                    self.queen_pairing = None;
                }
            }

            for timed_out in self.scheduler.tick(self.radio.as_mut()) {
                self.resolve_pending_call(&timed_out, CallResult::TimedOut);
            }

            self.flush_pending_discoveries(now);

            while let Ok((command, reply)) = self.commands.try_recv() {
                self.handle(command, reply);
            }

            std::thread::sleep(TICK_INTERVAL);
        }
    }

    /// PAIR_READY, PAIR_DELIVER and PAIR_COMPLETE never carry a swarm
    /// secret (that's the point -- a worker mid-pairing doesn't have one
    /// yet), so they bypass `Scheduler::on_receive` entirely and are
    /// recognized here first. Returns `true` if the frame was a pairing
    /// frame, whether or not it was actually actionable right now.
    fn try_handle_pairing_frame(&mut self, frame: &[u8], now: shelfos::clock::Timestamp) -> bool {
        let Ok(value) = shelfos::codec::decode(frame) else {
            return false;
        };

        if let Ok(payload) = Payload::from_value(&value) {
            match payload {
                Payload::PairComplete { node_id, label } => {
                    if let (Some(queen), Some(session)) =
                        (self.queen.as_mut(), self.queen_pairing.as_mut())
                    {
                        match session.on_pair_complete(&node_id, label, queen, now) {
                            Ok(true) => self.queen_pairing = None,
                            Ok(false) => {}
                            Err(e) => log::warn!(target: "pairing", "commit failed: {e}"),
                        }
                    }
                    return true;
                }
                Payload::PairReady { .. } => {
                    // The operator supplies peerID and code directly through
                    // `pairAsQueen`; there is no listening candidate list to
                    // feed here.
                    return true;
                }
                _ => {}
            }
        }

        if *self.worker_pairing.state() == WorkerState::Advertising {
            if let Ok(envelope) = envelope::from_wire_value(&value) {
                if let Some(credentials) = self.worker_pairing.on_envelope(&envelope, now) {
                    self.finish_worker_pairing(credentials, envelope.sender_id);
                    return true;
                }
            }
        }

        false
    }

    /// Persist the credentials handed down by the queen, install the swarm
    /// secret so general traffic starts authenticating, and send the
    /// unwrapped `PAIR_COMPLETE` acknowledgement back.
    fn finish_worker_pairing(&mut self, credentials: Credentials, queen_node_id: NodeId) {
        let enrollment = EnrollmentConfig {
            swarm_id: credentials.swarm_id,
            swarm_secret: credentials.swarm_secret.clone(),
            swarm_fingerprint: credentials.swarm_fingerprint,
            queen_node_id,
        };
        self.scheduler.set_swarm_secret(enrollment.swarm_secret.clone());
        self.config.enroll(enrollment);
        if let Err(e) = self.config.save() {
            log::error!(target: "pairing", "failed to persist enrollment: {e}");
        }

        let complete = self.worker_pairing.complete_payload(self.config.label());
        self.radio.broadcast(&complete.encode());
    }

    /// Reply to every `discoverOnce` whose collection window has elapsed,
    /// with whatever peers and remote peripherals discovery has accumulated
    /// by now (including from ANNOUNCEs the DISCOVER prompted).
    fn flush_pending_discoveries(&mut self, now: shelfos::clock::Timestamp) {
        let (due, pending): (Vec<_>, Vec<_>) = self
            .pending_discoveries
            .drain(..)
            .partition(|p| p.deadline <= now);
        self.pending_discoveries = pending;

        if due.is_empty() {
            return;
        }
        let discovery = self.scheduler.discovery();
        let peers: Vec<_> = discovery
            .list_peers()
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect();
        let remote_peripherals: Vec<_> = discovery
            .list_remote_peripherals()
            .map(|(name, r)| (name.clone(), r.clone()))
            .collect();
        for p in due {
            p.reply
                .send(CommandResult::Discovered {
                    peers: peers.clone(),
                    remote_peripherals: remote_peripherals.clone(),
                })
                .ok();
        }
    }

    fn resolve_pending_call(&mut self, request_id: &str, result: CallResult) {
        let Some(reply) = self.pending_calls.remove(request_id) else {
            return;
        };
        let response = match result {
            CallResult::Ok(values) => CommandResult::CallResult(values),
            CallResult::Err(text) => CommandResult::Error(text),
            CallResult::TimedOut => CommandResult::Error("call timed out".into()),
        };
        reply.send(response).ok();
    }

    fn handle(&mut self, command: Command, reply: chan::Sender<CommandResult>) {
        let result = match command {
            Command::CreateSwarm { name } => Some(self.create_swarm(name).into()),
            Command::PairAsQueen { peer_id, label, code } => {
                Some(self.pair_as_queen(peer_id, label, code).into())
            }
            Command::PairAsWorker => Some(self.pair_as_worker().into()),
            Command::Revoke { peer_id } => Some(self.revoke(peer_id).into()),
            Command::Remove { peer_id } => Some(self.remove(peer_id).into()),
            Command::ListPeers => Some(CommandResult::Peers(
                self.scheduler
                    .discovery()
                    .list_peers()
                    .map(|(id, record)| (id.clone(), record.clone()))
                    .collect(),
            )),
            Command::ListRemotePeripherals => Some(CommandResult::RemotePeripherals(
                self.scheduler
                    .discovery()
                    .list_remote_peripherals()
                    .map(|(name, r)| (name.clone(), r.clone()))
                    .collect(),
            )),
            Command::DiscoverOnce { timeout_ms } => {
                self.discover_once(timeout_ms, reply.clone());
                None
            }
            Command::Call {
                peripheral_name,
                method,
                args,
            } => self.call(peripheral_name, method, args, reply.clone()),
            Command::Status => Some(CommandResult::Status(self.scheduler.activity())),
        };
        if let Some(result) = result {
            reply.send(result).ok();
        }
    }

    fn create_swarm(&mut self, name: String) -> Result<(), HandleError> {
        if self.config.is_enrolled() {
            return Err(HandleError::AlreadyEnrolled);
        }
        let identity = SwarmIdentity::create(name, self.scheduler.node_id().clone(), now());
        let enrollment = EnrollmentConfig {
            swarm_id: identity.swarm_id.clone(),
            swarm_secret: identity.swarm_secret.clone(),
            swarm_fingerprint: identity.fingerprint(),
            queen_node_id: identity.queen_node_id.clone(),
        };
        self.scheduler.set_swarm_secret(identity.swarm_secret.clone());
        self.config.enroll(enrollment);
        self.config.save()?;

        let registry = Registry::load(&self.paths.registry)?;
        self.queen = Some(QueenAuthority::new(identity, registry));
        Ok(())
    }

    /// A simplified, single-shot form of the queen's listen/select/deliver
    /// flow: the operator already knows `peerID` and the code displayed on
    /// the worker's screen, so `reserve` and `deliver` happen in one step
    /// rather than modeling a multi-candidate `LISTENING` window here.
    fn pair_as_queen(
        &mut self,
        peer_id: NodeId,
        label: Option<String>,
        code: String,
    ) -> Result<(), HandleError> {
        let queen = self.queen.as_mut().ok_or(HandleError::NotQueen)?;
        let now = now();

        let candidate = Candidate {
            node_id: peer_id.clone(),
            label: label.clone().unwrap_or_else(|| peer_id.to_string()),
            code: code.clone(),
            last_seen: now,
        };
        let mut session = QueenPairing::new(now);
        session.select(&candidate);
        let envelope = session
            .deliver(queen, label, &code, now)
            .map_err(|_| HandleError::Unreachable)?;
        self.radio.broadcast(&shelfos::codec::encode(&envelope::to_wire_value(&envelope)));
        self.queen_pairing = Some(session);
        Ok(())
    }

    /// Broadcast a DISCOVER and stash `reply` to fire once `timeout_ms` of
    /// collection has elapsed, with whatever ANNOUNCEs it prompted.
    fn discover_once(&mut self, timeout_ms: i64, reply: chan::Sender<CommandResult>) {
        let payload = self.scheduler.discovery().discover_payload();
        self.scheduler.send(self.radio.as_mut(), &payload);
        self.pending_discoveries.push(PendingDiscovery {
            deadline: now() + timeout_ms.max(0),
            reply,
        });
    }

    fn pair_as_worker(&mut self) -> Result<(), HandleError> {
        let payload = self.worker_pairing.start(now());
        self.radio.broadcast(&payload.encode());
        Ok(())
    }

    fn revoke(&mut self, peer_id: NodeId) -> Result<(), HandleError> {
        let queen = self.queen.as_mut().ok_or(HandleError::NotQueen)?;
        queen.registry_mut().revoke(&peer_id, now())?;
        queen.registry_mut().save()?;
        Ok(())
    }

    fn remove(&mut self, peer_id: NodeId) -> Result<(), HandleError> {
        let queen = self.queen.as_mut().ok_or(HandleError::NotQueen)?;
        queen.registry_mut().remove(&peer_id);
        queen.registry_mut().save()?;
        Ok(())
    }

    /// Returns `Some(result)` when the answer is already known (local
    /// invocation, or no such peripheral); returns `None` when a remote
    /// CALL was just sent and `reply` has been stashed to fire later.
    fn call(
        &mut self,
        peripheral_name: String,
        method: String,
        args: Vec<Value>,
        reply: chan::Sender<CommandResult>,
    ) -> Option<CommandResult> {
        match self
            .scheduler
            .discovery()
            .resolve(&peripheral_name, self.scheduler.local_peripherals())
        {
            Resolution::Local => Some(
                match self.host.invoke(&peripheral_name, &method, &args) {
                    Ok(values) => CommandResult::CallResult(values),
                    Err(e) => CommandResult::Error(e.to_string()),
                },
            ),
            Resolution::Remote(origin) => {
                let (request_id, payload) =
                    self.scheduler
                        .rpc_client_mut()
                        .call(origin, peripheral_name, method, args, now());
                self.scheduler.send(self.radio.as_mut(), &payload);
                self.pending_calls.insert(request_id, reply);
                None
            }
            Resolution::Unknown => Some(CommandResult::Error(
                HandleError::Unreachable.to_string(),
            )),
        }
    }
}

fn now() -> shelfos::clock::Timestamp {
    localtime::LocalTime::now().as_millis() as shelfos::clock::Timestamp
}

impl From<Result<(), HandleError>> for CommandResult {
    fn from(r: Result<(), HandleError>) -> Self {
        match r {
            Ok(()) => CommandResult::Okay,
            Err(e) => CommandResult::Error(e.to_string()),
        }
    }
}
