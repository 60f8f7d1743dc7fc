//! CHP heartbeating.
//!
//! The publisher emits one beat per interval carrying the current FSM state;
//! a state change triggers an immediate extrasystole without resetting the
//! cadence clock. The receiver keeps one subscriber socket per discovered
//! heartbeat service and tracks a deadline per remote: three missed intervals
//! or a beat reporting ERROR/SAFE escalate through the interrupt callback.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use constellation_core::{Md5Hash, State};
use constellation_protocol::chirp::ServiceIdentifier;
use constellation_protocol::ChpMessage;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::chirp::ChirpManager;
use crate::error::NetworkError;
use crate::pool::{PoolEvent, SubscriberPool};
use crate::sockets::PubSocket;

/// Default heartbeat interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Lower clamp for the heartbeat interval.
pub const MIN_INTERVAL: Duration = Duration::from_millis(500);

/// Upper clamp for the heartbeat interval.
pub const MAX_INTERVAL: Duration = Duration::from_secs(30);

/// Lives granted to a remote; replenished by every on-time beat.
const LIVES: u8 = 3;

/// Cap on the watchdog sleep when no deadline is nearer.
const WATCHDOG_CAP: Duration = Duration::from_secs(3);

/// Provider of the state to advertise in outgoing beats.
pub type StateProvider = Arc<dyn Fn() -> State + Send + Sync>;

/// Provider of the status string attached to outgoing beats.
pub type StatusProvider = Arc<dyn Fn() -> Option<String> + Send + Sync>;

/// Callback escalating a degraded or vanished remote.
pub type InterruptCallback = Arc<dyn Fn(String) + Send + Sync>;

// ─────────────────────────────────────────────────────────────────────────────
// Publisher
// ─────────────────────────────────────────────────────────────────────────────

/// Periodic heartbeat publisher.
pub struct HeartbeatSend {
    extrasystole: Arc<Notify>,
    port: u16,
    cancel: CancellationToken,
}

impl HeartbeatSend {
    /// Start publishing on the given socket.
    ///
    /// The interval is clamped to [`MIN_INTERVAL`]..=[`MAX_INTERVAL`].
    #[must_use]
    pub fn start(
        sender: String,
        socket: PubSocket,
        interval: Duration,
        state: StateProvider,
        status: StatusProvider,
    ) -> Self {
        let interval = interval.clamp(MIN_INTERVAL, MAX_INTERVAL);
        let extrasystole = Arc::new(Notify::new());
        let cancel = CancellationToken::new();
        let port = socket.port();

        let notify = Arc::clone(&extrasystole);
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            let send_beat = |socket: &PubSocket| {
                let mut message = ChpMessage::new(sender.clone(), state(), interval);
                if let Some(status) = status() {
                    message = message.with_status(status);
                }
                match message.assemble() {
                    Ok(frames) => socket.publish(&frames),
                    Err(err) => warn!(%err, "failed to assemble heartbeat"),
                }
            };

            let mut next_beat = Instant::now();
            loop {
                tokio::select! {
                    () = task_cancel.cancelled() => break,
                    () = notify.notified() => {
                        // Out of cadence; the next scheduled beat is unchanged.
                        send_beat(&socket);
                    }
                    () = tokio::time::sleep_until(next_beat) => {
                        send_beat(&socket);
                        next_beat += interval;
                    }
                }
            }
            socket.close();
        });

        Self {
            extrasystole,
            port,
            cancel,
        }
    }

    /// TCP port of the underlying publisher socket.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Emit a beat immediately, out of cadence.
    pub fn extrasystole(&self) {
        self.extrasystole.notify_one();
    }

    /// Stop publishing.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for HeartbeatSend {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Receiver
// ─────────────────────────────────────────────────────────────────────────────

struct Remote {
    sender: String,
    interval: Duration,
    last_heartbeat: Instant,
    last_state: State,
    lives: u8,
}

/// Deadline-tracking heartbeat receiver.
pub struct HeartbeatRecv {
    pool: Arc<SubscriberPool>,
    cancel: CancellationToken,
}

impl HeartbeatRecv {
    /// Start receiving heartbeats from every discovered heartbeat service.
    #[must_use]
    pub fn start(chirp: Arc<ChirpManager>, interrupt: InterruptCallback) -> Self {
        let (pool, mut events) = SubscriberPool::new(Arc::clone(&chirp), ServiceIdentifier::Heartbeat);
        let pool = Arc::new(pool);
        let cancel = CancellationToken::new();

        let task_pool = Arc::clone(&pool);
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            // Pick up peers that started heartbeating before we did.
            chirp.send_request(ServiceIdentifier::Heartbeat).await;

            let mut remotes: HashMap<Md5Hash, Remote> = HashMap::new();
            loop {
                let next_deadline = remotes
                    .values()
                    .filter(|remote| remote.lives > 0)
                    .map(|remote| remote.last_heartbeat + remote.interval)
                    .min()
                    .unwrap_or_else(|| Instant::now() + WATCHDOG_CAP)
                    .min(Instant::now() + WATCHDOG_CAP);

                tokio::select! {
                    () = task_cancel.cancelled() => break,
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        handle_pool_event(&task_pool, &mut remotes, event, &interrupt).await;
                    }
                    () = tokio::time::sleep_until(next_deadline) => {
                        check_deadlines(&mut remotes, &interrupt);
                    }
                }
            }
        });

        Self { pool, cancel }
    }

    /// Stop the receiver and disconnect from all remotes.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.pool.shutdown().await;
    }
}

impl Drop for HeartbeatRecv {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn handle_pool_event(
    pool: &SubscriberPool,
    remotes: &mut HashMap<Md5Hash, Remote>,
    event: PoolEvent,
    interrupt: &InterruptCallback,
) {
    match event {
        PoolEvent::Connected(service) => {
            // Heartbeats have an empty subscription topic.
            if let Err(err) = pool.subscribe(service.host_id, b"").await {
                debug!(%err, "failed to subscribe to heartbeat service");
            }
        }
        PoolEvent::Message(service, frames) => {
            let message = match ChpMessage::disassemble(&frames) {
                Ok(message) => message,
                Err(err) => {
                    warn!(%err, "discarding malformed heartbeat");
                    return;
                }
            };
            process_heartbeat(remotes, service.host_id, &message, interrupt);
        }
        PoolEvent::Disconnected(service) => {
            // A clean departure must not escalate into an interrupt.
            remotes.remove(&service.host_id);
        }
    }
}

fn process_heartbeat(
    remotes: &mut HashMap<Md5Hash, Remote>,
    host_id: Md5Hash,
    message: &ChpMessage,
    interrupt: &InterruptCallback,
) {
    let sender = message.header().sender().to_owned();
    let state = message.state();
    debug!(
        sender = %sender,
        state = %state,
        interval_ms = message.interval().as_millis() as u64,
        "heartbeat received"
    );

    let remote = remotes.entry(host_id).or_insert_with(|| Remote {
        sender: sender.clone(),
        interval: message.interval(),
        last_heartbeat: Instant::now(),
        last_state: state,
        lives: LIVES,
    });
    let previous_state = remote.last_state;
    remote.sender = sender.clone();
    remote.interval = message.interval();
    remote.last_heartbeat = Instant::now();
    remote.last_state = state;
    remote.lives = LIVES;

    // A peer dropping to ERROR or SAFE pulls the constellation down with it.
    if matches!(state, State::Error | State::Safe) && !matches!(previous_state, State::Error | State::Safe)
    {
        warn!(sender = %sender, state = %state, "remote reports degraded state");
        interrupt(format!("{sender} reports state {state}"));
    }
}

fn check_deadlines(remotes: &mut HashMap<Md5Hash, Remote>, interrupt: &InterruptCallback) {
    let now = Instant::now();
    for remote in remotes.values_mut() {
        if remote.lives == 0 || now <= remote.last_heartbeat + remote.interval {
            continue;
        }
        remote.lives -= 1;
        // One life spent buys one more interval of patience.
        remote.last_heartbeat = now;
        debug!(sender = %remote.sender, lives = remote.lives, "missed heartbeat");

        if remote.lives == 0 {
            warn!(sender = %remote.sender, "no heartbeat lives left");
            interrupt(format!("no heartbeats from {}", remote.sender));
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Manager
// ─────────────────────────────────────────────────────────────────────────────

/// Combined heartbeat publisher and receiver for one satellite.
pub struct HeartbeatManager {
    send: HeartbeatSend,
    recv: HeartbeatRecv,
    chirp: Arc<ChirpManager>,
    port: u16,
}

impl HeartbeatManager {
    /// Bind the publisher socket, announce it via CHIRP and start both sides.
    ///
    /// # Errors
    /// Returns [`NetworkError::Bind`] if the publisher socket cannot be
    /// created.
    pub async fn start(
        chirp: Arc<ChirpManager>,
        sender: String,
        interval: Duration,
        state: StateProvider,
        status: StatusProvider,
        interrupt: InterruptCallback,
    ) -> Result<Self, NetworkError> {
        let socket = PubSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)).await?;
        let port = socket.port();

        let send = HeartbeatSend::start(sender, socket, interval, state, status);
        let recv = HeartbeatRecv::start(Arc::clone(&chirp), interrupt);
        chirp.register_service(ServiceIdentifier::Heartbeat, port).await;

        Ok(Self {
            send,
            recv,
            chirp,
            port,
        })
    }

    /// TCP port of the heartbeat publisher.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Emit an out-of-cadence beat, e.g. on a state change.
    pub fn extrasystole(&self) {
        self.send.extrasystole();
    }

    /// Stop both sides and withdraw the CHIRP announcement.
    pub async fn shutdown(&self) {
        self.send.stop();
        self.recv.shutdown().await;
        self.chirp
            .unregister_service(ServiceIdentifier::Heartbeat, self.port)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU8, Ordering};

    fn remote(interval_ms: u64, lives: u8) -> Remote {
        Remote {
            sender: "Sat.one".into(),
            interval: Duration::from_millis(interval_ms),
            last_heartbeat: Instant::now() - Duration::from_millis(interval_ms * 2),
            last_state: State::Orbit,
            lives,
        }
    }

    fn counting_interrupt() -> (InterruptCallback, Arc<AtomicU8>) {
        let count = Arc::new(AtomicU8::new(0));
        let cb_count = Arc::clone(&count);
        let callback: InterruptCallback = Arc::new(move |_| {
            cb_count.fetch_add(1, Ordering::SeqCst);
        });
        (callback, count)
    }

    #[tokio::test]
    async fn missed_deadline_spends_one_life() {
        let (interrupt, count) = counting_interrupt();
        let mut remotes = HashMap::new();
        remotes.insert(Md5Hash::new("a"), remote(100, LIVES));

        check_deadlines(&mut remotes, &interrupt);
        assert_eq!(remotes[&Md5Hash::new("a")].lives, LIVES - 1);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn exhausted_lives_trigger_interrupt_once() {
        let (interrupt, count) = counting_interrupt();
        let mut remotes = HashMap::new();
        remotes.insert(Md5Hash::new("a"), remote(100, 1));

        check_deadlines(&mut remotes, &interrupt);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Dead remote: no further escalation.
        remotes.get_mut(&Md5Hash::new("a")).unwrap().last_heartbeat =
            Instant::now() - Duration::from_secs(1);
        check_deadlines(&mut remotes, &interrupt);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn beat_replenishes_lives() {
        let (interrupt, count) = counting_interrupt();
        let mut remotes = HashMap::new();
        remotes.insert(Md5Hash::new("Sat.one"), remote(100, 1));

        let message = ChpMessage::new("Sat.one", State::Orbit, Duration::from_millis(100));
        process_heartbeat(&mut remotes, Md5Hash::new("Sat.one"), &message, &interrupt);
        assert_eq!(remotes[&Md5Hash::new("Sat.one")].lives, LIVES);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn error_state_triggers_interrupt() {
        let (interrupt, count) = counting_interrupt();
        let mut remotes = HashMap::new();

        let orbit = ChpMessage::new("Sat.one", State::Orbit, Duration::from_secs(1));
        process_heartbeat(&mut remotes, Md5Hash::new("Sat.one"), &orbit, &interrupt);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        let error = ChpMessage::new("Sat.one", State::Error, Duration::from_secs(1));
        process_heartbeat(&mut remotes, Md5Hash::new("Sat.one"), &error, &interrupt);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Repeated ERROR beats do not re-escalate.
        let error = ChpMessage::new("Sat.one", State::Error, Duration::from_secs(1));
        process_heartbeat(&mut remotes, Md5Hash::new("Sat.one"), &error, &interrupt);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn safe_state_triggers_interrupt() {
        let (interrupt, count) = counting_interrupt();
        let mut remotes = HashMap::new();
        let safe = ChpMessage::new("Sat.one", State::Safe, Duration::from_secs(1));
        process_heartbeat(&mut remotes, Md5Hash::new("Sat.one"), &safe, &interrupt);
        assert_eq!(count.load(Ordering::SeqCst), 0, "first contact sets the baseline");

        let orbit = ChpMessage::new("Sat.two", State::Orbit, Duration::from_secs(1));
        process_heartbeat(&mut remotes, Md5Hash::new("Sat.two"), &orbit, &interrupt);
        let safe = ChpMessage::new("Sat.two", State::Safe, Duration::from_secs(1));
        process_heartbeat(&mut remotes, Md5Hash::new("Sat.two"), &safe, &interrupt);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn publisher_sends_beats_and_extrasystoles() {
        use crate::sockets::SubSocket;

        let socket = PubSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
            .await
            .unwrap();
        let addr = socket.local_addr();

        let state: StateProvider = Arc::new(|| State::Init);
        let status: StatusProvider = Arc::new(|| None);
        let send = HeartbeatSend::start(
            "Sat.one".into(),
            socket,
            Duration::from_secs(10),
            state,
            status,
        );

        let (subscriber, mut messages) = SubSocket::connect(addr).await.unwrap();
        subscriber.subscribe(b"").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Interval is clamped to 10 s (within bounds), so the only prompt
        // beat after the initial one is the extrasystole.
        send.extrasystole();
        let frames = tokio::time::timeout(Duration::from_secs(1), messages.recv())
            .await
            .unwrap()
            .unwrap();
        let beat = ChpMessage::disassemble(&frames).unwrap();
        assert_eq!(beat.state(), State::Init);
        assert_eq!(beat.header().sender(), "Sat.one");
        send.stop();
    }

    #[test]
    fn interval_clamping() {
        assert_eq!(
            Duration::from_millis(10).clamp(MIN_INTERVAL, MAX_INTERVAL),
            MIN_INTERVAL
        );
        assert_eq!(
            Duration::from_secs(60).clamp(MIN_INTERVAL, MAX_INTERVAL),
            MAX_INTERVAL
        );
    }
}
