//! The satellite lifecycle state machine.
//!
//! Transition commands arrive via CSCP and are validated against the current
//! state; an accepted command enters the transitional state, runs the
//! satellite's action on its own task and settles in the target steady state
//! when the action returns. A failing action routes through the failure
//! handler and drops the satellite to ERROR. The run loop is a separate task
//! cancelled cooperatively through its stop token; `stop`, `interrupt` and
//! shutdown all raise it.
//!
//! State changes are published on a broadcast channel so observers (the
//! heartbeat extrasystole above all) never block a transition.

use std::sync::Arc;

use bytes::Bytes;
use constellation_core::{Configuration, State, Transition, TransitionCommand};
use constellation_protocol::codec;
use constellation_protocol::cscp::CscpMessageType;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::satellite::{SatelliteContext, SharedSatellite};

/// Capacity of the state-update broadcast channel. A lagging observer skips
/// intermediate states but always converges on the latest.
const UPDATE_CHANNEL_CAPACITY: usize = 16;

/// The transitional state a command enters from a given steady state, or
/// `None` if the transition is not legal there.
fn transitional_state(state: State, transition: Transition) -> Option<State> {
    match (state, transition) {
        (State::New | State::Init | State::Safe | State::Error, Transition::Initialize) => {
            Some(State::Initializing)
        }
        (State::Init, Transition::Launch) => Some(State::Launching),
        (State::Orbit, Transition::Land) => Some(State::Landing),
        (State::Orbit, Transition::Reconfigure) => Some(State::Reconfiguring),
        (State::Orbit, Transition::Start) => Some(State::Starting),
        (State::Run, Transition::Stop) => Some(State::Stopping),
        (State::Orbit | State::Run, Transition::Interrupt) => Some(State::Interrupting),
        _ => None,
    }
}

/// A validated transition with its decoded payload.
enum Action {
    Initialize(Configuration),
    Launch,
    Land,
    Reconfigure(Configuration),
    Start(String),
    Stop,
    Interrupt(State),
}

struct RunHandles {
    token: Option<CancellationToken>,
    task: Option<tokio::task::JoinHandle<()>>,
}

struct FsmInner {
    state: watch::Sender<State>,
    updates: broadcast::Sender<State>,
    satellite: SharedSatellite,
    supports_reconfigure: bool,
    context: Arc<SatelliteContext>,
    /// Serializes transition validation and state entry; never held across
    /// an await point.
    engine: Mutex<()>,
    run: Mutex<RunHandles>,
}

/// The satellite finite state machine.
#[derive(Clone)]
pub struct Fsm {
    inner: Arc<FsmInner>,
}

impl Fsm {
    /// Create a state machine in `NEW` driving the given satellite.
    #[must_use]
    pub fn new(
        satellite: SharedSatellite,
        supports_reconfigure: bool,
        context: Arc<SatelliteContext>,
    ) -> Self {
        let (state, _) = watch::channel(State::New);
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(FsmInner {
                state,
                updates,
                satellite,
                supports_reconfigure,
                context,
                engine: Mutex::new(()),
                run: Mutex::new(RunHandles {
                    token: None,
                    task: None,
                }),
            }),
        }
    }

    /// The current state.
    #[must_use]
    pub fn state(&self) -> State {
        *self.inner.state.borrow()
    }

    /// Subscribe to state updates.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<State> {
        self.inner.updates.subscribe()
    }

    /// A watch receiver over the current state, for deadline-free waiting.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<State> {
        self.inner.state.subscribe()
    }

    /// Whether a transition is allowed in the current state.
    #[must_use]
    pub fn is_allowed(&self, transition: Transition) -> bool {
        transitional_state(self.state(), transition).is_some()
    }

    /// Handle a transition command from CSCP, synthesizing the reply verb.
    pub fn react_command(
        &self,
        command: TransitionCommand,
        payload: Option<&Bytes>,
    ) -> (CscpMessageType, String) {
        let transition = command.transition();
        info!(%transition, "reacting to transition command");

        let gate = self.inner.engine.lock();
        let current = *self.inner.state.borrow();

        let Some(entered) = transitional_state(current, transition) else {
            let message = format!("Transition {transition} not allowed from {current} state");
            warn!("{message}");
            return (CscpMessageType::Invalid, message);
        };

        if command == TransitionCommand::Reconfigure && !self.inner.supports_reconfigure {
            let message = "Transition reconfigure is not implemented by this satellite".to_owned();
            warn!("{message}");
            return (CscpMessageType::NotImplemented, message);
        }

        let (action, note) = match decode_payload(command, payload) {
            Ok(decoded) => decoded,
            Err(message) => {
                warn!("{message}");
                return (CscpMessageType::Incomplete, message);
            }
        };

        self.inner.set_state(entered);
        tokio::spawn(run_transition(Arc::clone(&self.inner), action));
        drop(gate);

        (
            CscpMessageType::Success,
            format!("Transition {transition} is being initiated{note}"),
        )
    }

    /// Interrupt as soon as possible.
    ///
    /// Waits for the next steady state; in `ORBIT` or `RUN` the interrupt
    /// action runs and the satellite settles in `SAFE`, otherwise nothing
    /// happens. Returns once a steady state is reached either way, so the
    /// satellite can be torn down safely afterwards.
    pub async fn request_interrupt(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut rx = self.inner.state.subscribe();

        loop {
            enum Outcome {
                Entered,
                Idle,
                Wait,
            }
            let outcome = {
                let _gate = self.inner.engine.lock();
                let current = *self.inner.state.borrow();
                if !current.is_steady() {
                    Outcome::Wait
                } else if matches!(current, State::Orbit | State::Run) {
                    info!(%reason, "interrupting");
                    self.inner.context.set_status(reason.clone());
                    self.inner.set_state(State::Interrupting);
                    tokio::spawn(run_transition(
                        Arc::clone(&self.inner),
                        Action::Interrupt(current),
                    ));
                    Outcome::Entered
                } else {
                    Outcome::Idle
                }
            };
            match outcome {
                Outcome::Idle => return,
                Outcome::Entered => break,
                Outcome::Wait => {
                    if rx.changed().await.is_err() {
                        return;
                    }
                }
            }
        }

        // Wait for the interrupt action to settle.
        loop {
            if rx.borrow_and_update().is_steady() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Drop to `ERROR` as soon as possible, unless already there.
    pub async fn request_failure(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let current = self.state();
        if current == State::Error {
            return;
        }
        self.inner.fail(reason, current).await;
    }

    /// Raise the run-loop stop token without waiting.
    pub fn cancel_run(&self) {
        let run = self.inner.run.lock();
        if let Some(token) = &run.token {
            token.cancel();
        }
    }
}

fn decode_payload(
    command: TransitionCommand,
    payload: Option<&Bytes>,
) -> Result<(Action, &'static str), String> {
    let payload = payload.filter(|bytes| !bytes.is_empty());
    match command {
        TransitionCommand::Initialize | TransitionCommand::Reconfigure => {
            let Some(bytes) = payload else {
                return Err(format!("Transition {command} requires a payload frame"));
            };
            let dict = codec::decode_dictionary(bytes)
                .map_err(|err| format!("Transition {command} received invalid payload: {err}"))?;
            let config = Configuration::from_dictionary(dict);
            let action = if command == TransitionCommand::Initialize {
                Action::Initialize(config)
            } else {
                Action::Reconfigure(config)
            };
            Ok((action, ""))
        }
        TransitionCommand::Start => {
            let Some(bytes) = payload else {
                return Err("Transition start requires a payload frame".to_owned());
            };
            let run_id: String = codec::value_from_bytes(bytes)
                .and_then(|value| {
                    value
                        .get()
                        .map_err(|err| constellation_protocol::ProtocolError::decoding(err.to_string()))
                })
                .map_err(|err| format!("Transition start received invalid payload: {err}"))?;
            if run_id.is_empty()
                || !run_id
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            {
                return Err(format!("Run identifier {run_id:?} is invalid"));
            }
            Ok((Action::Start(run_id), ""))
        }
        TransitionCommand::Launch => Ok((Action::Launch, ignored_note(payload))),
        TransitionCommand::Land => Ok((Action::Land, ignored_note(payload))),
        TransitionCommand::Stop => Ok((Action::Stop, ignored_note(payload))),
    }
}

fn ignored_note(payload: Option<&Bytes>) -> &'static str {
    if payload.is_some() {
        " (payload frame is ignored)"
    } else {
        ""
    }
}

impl FsmInner {
    fn set_state(&self, new_state: State) {
        self.state.send_replace(new_state);
        let _ = self.updates.send(new_state);
        info!(state = %new_state, "new state");
    }

    /// Complete a transition: enter `target` only if the FSM still sits in
    /// the transitional state the action was started from. A concurrent
    /// failure wins.
    fn complete(&self, expected: State, target: State) -> bool {
        let _gate = self.engine.lock();
        if *self.state.borrow() == expected {
            self.set_state(target);
            true
        } else {
            debug!(
                expected = %expected,
                current = %*self.state.borrow(),
                "dropping completion of superseded transition"
            );
            false
        }
    }

    async fn fail(self: &Arc<Self>, reason: String, previous: State) {
        error!(%reason, "transition failed, entering ERROR state");
        self.context.set_status(reason);

        {
            let run = self.run.lock();
            if let Some(token) = &run.token {
                token.cancel();
            }
        }
        {
            let _gate = self.engine.lock();
            self.set_state(State::Error);
        }

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let mut satellite = inner.satellite.lock().await;
            satellite.failure(previous).await;
        });
    }

    fn spawn_run_loop(self: &Arc<Self>) {
        let token = CancellationToken::new();
        let inner = Arc::clone(self);
        let task_token = token.clone();
        // Hold the handle slot while spawning so an instantly-returning run
        // loop cannot observe it empty.
        let mut run = self.run.lock();
        let task = tokio::spawn(async move {
            let result = {
                let mut satellite = inner.satellite.lock().await;
                satellite.running(task_token.clone()).await
            };
            match result {
                Err(err) => inner.fail(err.to_string(), State::Run).await,
                Ok(()) => {
                    if !task_token.is_cancelled() {
                        // The run loop finished on its own; stop the run.
                        let entered = {
                            let _gate = inner.engine.lock();
                            if *inner.state.borrow() == State::Run {
                                inner.set_state(State::Stopping);
                                true
                            } else {
                                false
                            }
                        };
                        if entered {
                            tokio::spawn(run_transition(Arc::clone(&inner), Action::Stop));
                        }
                    }
                }
            }
        });
        run.token = Some(token);
        run.task = Some(task);
    }

    async fn stop_run_task(&self) {
        let (token, task) = {
            let mut run = self.run.lock();
            (run.token.take(), run.task.take())
        };
        if let Some(token) = token {
            token.cancel();
        }
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(%err, "run task aborted");
            }
        }
    }
}

async fn run_transition(inner: Arc<FsmInner>, action: Action) {
    match action {
        Action::Initialize(mut config) => {
            debug!("calling initializing action");
            let result = {
                let mut satellite = inner.satellite.lock().await;
                satellite.initializing(&mut config).await
            };
            match result {
                Ok(()) => {
                    inner.context.store_config(config);
                    inner.complete(State::Initializing, State::Init);
                }
                Err(err) => inner.fail(err.to_string(), State::Initializing).await,
            }
        }
        Action::Launch => {
            debug!("calling launching action");
            let result = {
                let mut satellite = inner.satellite.lock().await;
                satellite.launching().await
            };
            match result {
                Ok(()) => {
                    inner.complete(State::Launching, State::Orbit);
                }
                Err(err) => inner.fail(err.to_string(), State::Launching).await,
            }
        }
        Action::Land => {
            debug!("calling landing action");
            let result = {
                let mut satellite = inner.satellite.lock().await;
                satellite.landing().await
            };
            match result {
                Ok(()) => {
                    inner.complete(State::Landing, State::Init);
                }
                Err(err) => inner.fail(err.to_string(), State::Landing).await,
            }
        }
        Action::Reconfigure(mut partial) => {
            debug!("calling reconfiguring action");
            let result = {
                let mut satellite = inner.satellite.lock().await;
                satellite.reconfiguring(&mut partial).await
            };
            match result {
                Ok(()) => {
                    inner.context.update_config(&partial);
                    inner.complete(State::Reconfiguring, State::Orbit);
                }
                Err(err) => inner.fail(err.to_string(), State::Reconfiguring).await,
            }
        }
        Action::Start(run_id) => {
            debug!(run_id = %run_id, "calling starting action");
            let result = {
                let mut satellite = inner.satellite.lock().await;
                satellite.starting(&run_id).await
            };
            match result {
                Ok(()) => {
                    inner.context.set_run_identifier(run_id);
                    if inner.complete(State::Starting, State::Run) {
                        inner.spawn_run_loop();
                    }
                }
                Err(err) => inner.fail(err.to_string(), State::Starting).await,
            }
        }
        Action::Stop => {
            debug!("stopping run loop");
            inner.stop_run_task().await;
            let result = {
                let mut satellite = inner.satellite.lock().await;
                satellite.stopping().await
            };
            match result {
                Ok(()) => {
                    inner.complete(State::Stopping, State::Orbit);
                }
                Err(err) => inner.fail(err.to_string(), State::Stopping).await,
            }
        }
        Action::Interrupt(previous) => {
            debug!(previous = %previous, "calling interrupting action");
            inner.stop_run_task().await;
            let result = {
                let mut satellite = inner.satellite.lock().await;
                satellite.interrupting(previous).await
            };
            match result {
                Ok(()) => {
                    inner.complete(State::Interrupting, State::Safe);
                }
                Err(err) => inner.fail(err.to_string(), State::Interrupting).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::satellite::{Satellite, SatelliteError};
    use async_trait::async_trait;
    use std::time::Duration;

    #[derive(Default)]
    struct TestSatellite {
        fail_launch: bool,
        reads_key: Option<&'static str>,
    }

    #[async_trait]
    impl Satellite for TestSatellite {
        async fn initializing(&mut self, config: &mut Configuration) -> Result<(), SatelliteError> {
            if let Some(key) = self.reads_key {
                let _ = config.get::<i64>(key);
            }
            Ok(())
        }

        async fn launching(&mut self) -> Result<(), SatelliteError> {
            if self.fail_launch {
                return Err(SatelliteError::new("no thrust"));
            }
            Ok(())
        }
    }

    fn fsm_with(satellite: TestSatellite) -> Fsm {
        let shared: SharedSatellite = Arc::new(tokio::sync::Mutex::new(satellite));
        Fsm::new(shared, false, Arc::new(SatelliteContext::new()))
    }

    fn config_payload(entries: &[(&str, i64)]) -> Bytes {
        let mut dict = constellation_core::Dictionary::new();
        for (key, value) in entries {
            dict.insert(*key, *value);
        }
        Bytes::from(codec::encode_dictionary(&dict).unwrap())
    }

    fn run_id_payload(run_id: &str) -> Bytes {
        Bytes::from(codec::value_to_bytes(&constellation_core::Value::String(run_id.into())).unwrap())
    }

    async fn wait_for(fsm: &Fsm, state: State) {
        let mut rx = fsm.watch();
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if *rx.borrow_and_update() == state {
                    return;
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for state {state}"));
    }

    #[tokio::test]
    async fn happy_path_reaches_run_and_back() {
        let fsm = fsm_with(TestSatellite::default());
        assert_eq!(fsm.state(), State::New);

        let (reply, _) = fsm.react_command(TransitionCommand::Initialize, Some(&config_payload(&[])));
        assert_eq!(reply, CscpMessageType::Success);
        wait_for(&fsm, State::Init).await;

        let (reply, _) = fsm.react_command(TransitionCommand::Launch, None);
        assert_eq!(reply, CscpMessageType::Success);
        wait_for(&fsm, State::Orbit).await;

        let (reply, _) = fsm.react_command(TransitionCommand::Start, Some(&run_id_payload("run-7")));
        assert_eq!(reply, CscpMessageType::Success);
        wait_for(&fsm, State::Run).await;

        let (reply, _) = fsm.react_command(TransitionCommand::Stop, None);
        assert_eq!(reply, CscpMessageType::Success);
        wait_for(&fsm, State::Orbit).await;

        let (reply, _) = fsm.react_command(TransitionCommand::Land, None);
        assert_eq!(reply, CscpMessageType::Success);
        wait_for(&fsm, State::Init).await;
    }

    #[tokio::test]
    async fn illegal_transition_is_invalid_and_names_the_state() {
        let fsm = fsm_with(TestSatellite::default());
        let (reply, message) = fsm.react_command(TransitionCommand::Launch, None);
        assert_eq!(reply, CscpMessageType::Invalid);
        assert!(message.contains("NEW"), "message was {message:?}");
        assert_eq!(fsm.state(), State::New);
    }

    #[tokio::test]
    async fn reconfigure_without_support_is_notimplemented() {
        let fsm = fsm_with(TestSatellite::default());
        fsm.react_command(TransitionCommand::Initialize, Some(&config_payload(&[])));
        wait_for(&fsm, State::Init).await;
        fsm.react_command(TransitionCommand::Launch, None);
        wait_for(&fsm, State::Orbit).await;

        let (reply, _) = fsm.react_command(TransitionCommand::Reconfigure, Some(&config_payload(&[("x", 1)])));
        assert_eq!(reply, CscpMessageType::NotImplemented);
        assert_eq!(fsm.state(), State::Orbit);
    }

    #[tokio::test]
    async fn missing_payload_is_incomplete() {
        let fsm = fsm_with(TestSatellite::default());
        let (reply, message) = fsm.react_command(TransitionCommand::Initialize, None);
        assert_eq!(reply, CscpMessageType::Incomplete);
        assert!(message.contains("payload"));
    }

    #[tokio::test]
    async fn malformed_run_id_is_incomplete() {
        let fsm = fsm_with(TestSatellite::default());
        fsm.react_command(TransitionCommand::Initialize, Some(&config_payload(&[])));
        wait_for(&fsm, State::Init).await;
        fsm.react_command(TransitionCommand::Launch, None);
        wait_for(&fsm, State::Orbit).await;

        let (reply, _) = fsm.react_command(TransitionCommand::Start, Some(&run_id_payload("bad run id")));
        assert_eq!(reply, CscpMessageType::Incomplete);
        assert_eq!(fsm.state(), State::Orbit);
    }

    #[tokio::test]
    async fn failing_action_drops_to_error() {
        let fsm = fsm_with(TestSatellite {
            fail_launch: true,
            ..Default::default()
        });
        fsm.react_command(TransitionCommand::Initialize, Some(&config_payload(&[])));
        wait_for(&fsm, State::Init).await;
        fsm.react_command(TransitionCommand::Launch, None);
        wait_for(&fsm, State::Error).await;

        // ERROR is recoverable through initialize.
        let (reply, _) = fsm.react_command(TransitionCommand::Initialize, Some(&config_payload(&[])));
        assert_eq!(reply, CscpMessageType::Success);
        wait_for(&fsm, State::Init).await;
    }

    #[tokio::test]
    async fn interrupt_from_run_reaches_safe() {
        let fsm = fsm_with(TestSatellite::default());
        fsm.react_command(TransitionCommand::Initialize, Some(&config_payload(&[])));
        wait_for(&fsm, State::Init).await;
        fsm.react_command(TransitionCommand::Launch, None);
        wait_for(&fsm, State::Orbit).await;
        fsm.react_command(TransitionCommand::Start, Some(&run_id_payload("run-1")));
        wait_for(&fsm, State::Run).await;

        fsm.request_interrupt("test interrupt").await;
        assert_eq!(fsm.state(), State::Safe);
    }

    #[tokio::test]
    async fn interrupt_outside_orbit_and_run_is_a_noop() {
        let fsm = fsm_with(TestSatellite::default());
        fsm.react_command(TransitionCommand::Initialize, Some(&config_payload(&[])));
        wait_for(&fsm, State::Init).await;

        fsm.request_interrupt("nothing to do").await;
        assert_eq!(fsm.state(), State::Init);
    }

    #[tokio::test]
    async fn commands_during_transition_are_invalid() {
        // An action slow enough to observe the transitional state.
        struct SlowSatellite;
        #[async_trait]
        impl Satellite for SlowSatellite {
            async fn initializing(&mut self, _config: &mut Configuration) -> Result<(), SatelliteError> {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            }
        }

        let shared: SharedSatellite = Arc::new(tokio::sync::Mutex::new(SlowSatellite));
        let fsm = Fsm::new(shared, false, Arc::new(SatelliteContext::new()));

        fsm.react_command(TransitionCommand::Initialize, Some(&config_payload(&[])));
        assert_eq!(fsm.state(), State::Initializing);

        let (reply, _) = fsm.react_command(TransitionCommand::Launch, None);
        assert_eq!(reply, CscpMessageType::Invalid);
        wait_for(&fsm, State::Init).await;
    }

    #[tokio::test]
    async fn observer_sees_transitional_then_steady() {
        let fsm = fsm_with(TestSatellite::default());
        let mut updates = fsm.subscribe();

        fsm.react_command(TransitionCommand::Initialize, Some(&config_payload(&[])));
        wait_for(&fsm, State::Init).await;

        let first = updates.recv().await.unwrap();
        let second = updates.recv().await.unwrap();
        assert_eq!(first, State::Initializing);
        assert_eq!(second, State::Init);
    }
}
