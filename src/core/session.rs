//! Bridge session
//! Drives one attached transport: polls it for status frames, keeps the pin
//! table and rule table current, pushes rule results back to the device and
//! records every frame in the message log.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use crate::config::engine_config::{EngineConfig, PinConfig};
use crate::core::error::{BridgeError, Result};
use crate::core::logic::{LogicRule, MAX_RULES, PinCommand, RuleEngine};
use crate::core::message_log::{Message, MessageDirection, MessageLog};
use crate::core::pins::{Pin, PinChange, PinTable};
use crate::core::protocol::{Command, LineBuffer, Response};
use crate::core::transport::{DeviceTransport, LinkState};

const STATUS_CAPACITY: usize = 256;

/// What the session reports to its observers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusEvent {
    /// A pin value changed
    Pin(PinChange),
    /// A rule was configured locally or echoed by the device
    Rule(LogicRule),
    Analog { pin: u8, value: i32 },
    /// The device answered with `ERROR:`
    DeviceError { message: String },
    /// A received line matched no known frame and was dropped
    Malformed { line: String },
}

struct EngineState {
    pins: PinTable,
    rules: RuleEngine,
}

/// Rule table and output values from before a local change
struct EngineSnapshot {
    rules: RuleEngine,
    values: Vec<(u8, bool)>,
}

impl EngineState {
    fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            rules: self.rules.clone(),
            values: self.pins.pins().iter().map(|p| (p.number, p.value)).collect(),
        }
    }

    /// Undoes a local change the device never heard about. Only `touched`
    /// pins are reset so values reported meanwhile by the device survive.
    fn restore(&mut self, snapshot: EngineSnapshot, touched: &[u8]) {
        self.rules = snapshot.rules;
        for (number, value) in snapshot.values {
            if touched.contains(&number) {
                if let Err(e) = self.pins.set(number, value) {
                    warn!("Could not restore pin {}: {}", number, e);
                }
            }
        }
    }

    /// Evaluates until no output changes, so rules that read other rules'
    /// outputs see the final values. Returns the last command per pin.
    fn settle(&mut self) -> Vec<PinCommand> {
        let mut commands: Vec<PinCommand> = Vec::new();
        for _ in 0..=MAX_RULES {
            let pass = self.rules.evaluate(&mut self.pins);
            if pass.is_empty() {
                return commands;
            }
            for command in pass {
                match commands.iter_mut().find(|c| c.pin == command.pin) {
                    Some(existing) => existing.value = command.value,
                    None => commands.push(command),
                }
            }
        }
        warn!("Rule outputs did not settle after {} passes", MAX_RULES + 1);
        commands
    }
}

#[derive(Clone)]
pub struct BridgeSession {
    engine: Arc<Mutex<EngineState>>,
    log: Arc<std::sync::Mutex<MessageLog>>,
    transport: Arc<Mutex<Option<Arc<dyn DeviceTransport>>>>,
    status: broadcast::Sender<StatusEvent>,
    connection: Arc<watch::Sender<LinkState>>,
    tasks: Arc<std::sync::Mutex<Option<CancellationToken>>>,
    poll_interval: Duration,
}

impl BridgeSession {
    pub fn new(config: &EngineConfig) -> Self {
        let (status, _) = broadcast::channel(STATUS_CAPACITY);
        let (connection, _) = watch::channel(LinkState::Disconnected);
        Self {
            engine: Arc::new(Mutex::new(EngineState {
                pins: PinTable::new(&config.pins),
                rules: RuleEngine::new(),
            })),
            log: Arc::new(std::sync::Mutex::new(MessageLog::new())),
            transport: Arc::new(Mutex::new(None)),
            status,
            connection: Arc::new(connection),
            tasks: Arc::new(std::sync::Mutex::new(None)),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
        }
    }

    /// Makes `transport` the active link and starts the read loop and the
    /// rule engine for it. A previously attached transport is detached, not
    /// closed.
    pub async fn attach(&self, transport: Arc<dyn DeviceTransport>) {
        self.detach().await;
        info!("Attaching {:?} transport {}", transport.kind(), transport.name());

        let cancel = CancellationToken::new();
        *self.lock_tasks() = Some(cancel.clone());
        *self.transport.lock().await = Some(transport.clone());
        self.connection.send_replace(transport.state());

        let events = self.engine.lock().await.pins.subscribe();
        tokio::spawn(self.clone().mirror_state(transport.clone(), cancel.clone()));
        tokio::spawn(self.clone().poll_loop(transport.clone(), cancel.clone()));
        tokio::spawn(self.clone().engine_loop(transport, events, cancel));
    }

    /// Stops the session tasks and hands back the transport, still open.
    pub async fn detach(&self) -> Option<Arc<dyn DeviceTransport>> {
        if let Some(cancel) = self.lock_tasks().take() {
            cancel.cancel();
        }
        let previous = self.transport.lock().await.take();
        if previous.is_some() {
            self.connection.send_replace(LinkState::Disconnected);
        }
        previous
    }

    /// Detaches and closes the active transport. Safe to call repeatedly.
    pub async fn disconnect(&self) -> Result<()> {
        match self.detach().await {
            Some(transport) => transport.close().await,
            None => Ok(()),
        }
    }

    pub fn connection_state(&self) -> LinkState {
        *self.connection.borrow()
    }

    /// Follows the state of whichever transport is attached
    pub fn watch_connection(&self) -> watch::Receiver<LinkState> {
        self.connection.subscribe()
    }

    pub fn on_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.status.subscribe()
    }

    /// Sends one line as is and records it.
    pub async fn send_raw(&self, text: &str) -> Result<()> {
        let transport = self.connected_transport().await?;
        self.send_via(transport.as_ref(), text).await
    }

    /// Asks the device for a full status dump
    pub async fn request_state(&self) -> Result<()> {
        self.send_raw(&Command::GetGpioState.to_string()).await
    }

    /// Direct output write. The pin is overridden until a rule is configured
    /// for it again. When the device never gets the command the override
    /// and the pin value are put back.
    pub async fn set_pin(&self, pin: u8, value: bool) -> Result<()> {
        let transport = self.connected_transport().await?;
        let (command, snapshot) = {
            let mut engine = self.engine.lock().await;
            let snapshot = engine.snapshot();
            let EngineState { pins, rules } = &mut *engine;
            (rules.set_override(pin, value, pins)?, snapshot)
        };
        if let Err(e) = self.send_commands(transport.as_ref(), &[command]).await {
            self.engine.lock().await.restore(snapshot, &[pin]);
            return Err(e);
        }
        Ok(())
    }

    /// Stores `rule`, pushes it to the device and drives the outputs it
    /// computes right away. If the rule itself cannot be sent the local rule
    /// table and outputs are put back.
    pub async fn configure_rule(&self, rule: LogicRule) -> Result<()> {
        let transport = self.connected_transport().await?;
        let (commands, snapshot) = {
            let mut engine = self.engine.lock().await;
            let snapshot = engine.snapshot();
            let EngineState { pins, rules } = &mut *engine;
            let outcome = rules.upsert(rule.clone(), pins)?;
            debug!("Rule for pin {} placed in slot {}", rule.output_pin, outcome.slot);
            (engine.settle(), snapshot)
        };

        if let Err(e) = self
            .send_via(transport.as_ref(), &Command::SetLogic(rule.clone()).to_string())
            .await
        {
            let driven: Vec<u8> = commands.iter().map(|c| c.pin).collect();
            self.engine.lock().await.restore(snapshot, &driven);
            return Err(e);
        }
        let _ = self.status.send(StatusEvent::Rule(rule));
        // The device runs the rule itself, so a failure here leaves both sides agreeing
        self.send_commands(transport.as_ref(), &commands).await
    }

    /// Replaces the pin table wholesale
    pub async fn reconfigure_pins(&self, pins: &[PinConfig]) {
        self.engine.lock().await.pins.reconfigure(pins);
    }

    pub async fn pins(&self) -> Vec<Pin> {
        self.engine.lock().await.pins.pins()
    }

    pub async fn pin(&self, number: u8) -> Option<Pin> {
        self.engine.lock().await.pins.get(number).cloned()
    }

    pub async fn analog(&self, pin: u8) -> Option<i32> {
        self.engine.lock().await.pins.analog(pin)
    }

    pub async fn rules(&self) -> Vec<LogicRule> {
        self.engine.lock().await.rules.rules()
    }

    pub async fn is_overridden(&self, pin: u8) -> bool {
        self.engine.lock().await.rules.is_overridden(pin)
    }

    pub fn messages(&self) -> Vec<Message> {
        self.lock_log().messages().to_vec()
    }

    pub fn clear_messages(&self) {
        self.lock_log().clear();
    }

    pub fn export_messages(&self) -> String {
        self.lock_log().export_as_text()
    }

    pub async fn export_messages_to_file(&self, path: &Path) -> Result<()> {
        let snapshot = self.lock_log().clone();
        snapshot.export_to_file(path).await
    }

    /// Applies one received line. Lines that parse as nothing known are
    /// dropped and reported as [`StatusEvent::Malformed`].
    pub async fn handle_line(&self, line: &str) {
        self.record(MessageDirection::Received, line);
        let frame = match Response::parse(line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping frame: {}", e);
                let _ = self.status.send(StatusEvent::Malformed {
                    line: line.to_string(),
                });
                return;
            }
        };

        let event = {
            let mut engine = self.engine.lock().await;
            match &frame {
                Response::Gpio { .. } => engine.pins.apply(&frame).map(StatusEvent::Pin),
                Response::Adc { pin, value } => {
                    engine.pins.apply(&frame);
                    Some(StatusEvent::Analog {
                        pin: *pin,
                        value: *value,
                    })
                }
                Response::Logic(rule) => match engine.rules.apply_echo(rule.clone()) {
                    Ok(_) => Some(StatusEvent::Rule(rule.clone())),
                    Err(e) => {
                        warn!("Ignoring echoed rule: {}", e);
                        None
                    }
                },
                Response::Error(message) => {
                    warn!("Device reported error: {}", message);
                    Some(StatusEvent::DeviceError {
                        message: message.clone(),
                    })
                }
            }
        };
        if let Some(event) = event {
            let _ = self.status.send(event);
        }
    }

    async fn connected_transport(&self) -> Result<Arc<dyn DeviceTransport>> {
        match self.transport.lock().await.as_ref() {
            Some(transport) if transport.is_connected() => Ok(transport.clone()),
            _ => Err(BridgeError::NotConnected),
        }
    }

    async fn send_via(&self, transport: &dyn DeviceTransport, text: &str) -> Result<()> {
        let text = text.trim_end();
        transport.write(text).await?;
        debug!("Sent {}", text);
        self.record(MessageDirection::Sent, text);
        Ok(())
    }

    async fn send_commands(&self, transport: &dyn DeviceTransport, commands: &[PinCommand]) -> Result<()> {
        for command in commands {
            let line = Command::SetGpio {
                pin: command.pin,
                value: command.value,
            }
            .to_string();
            self.send_via(transport, &line).await?;
        }
        Ok(())
    }

    async fn mirror_state(self, transport: Arc<dyn DeviceTransport>, cancel: CancellationToken) {
        let mut states = transport.watch_state();
        loop {
            let current = *states.borrow_and_update();
            self.connection.send_if_modified(|state| {
                let changed = *state != current;
                *state = current;
                changed
            });
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                changed = states.changed() => if changed.is_err() { break },
            }
        }
    }

    /// External driver of the transport: reads while connected, pauses while
    /// the link is down and resumes once it is back.
    async fn poll_loop(self, transport: Arc<dyn DeviceTransport>, cancel: CancellationToken) {
        let mut lines = LineBuffer::new();
        let mut states = transport.watch_state();
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Polling {} every {:?}", transport.name(), self.poll_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if !transport.is_connected() {
                debug!("Link down, polling paused");
                lines.clear();
                let resumed = tokio::select! {
                    _ = cancel.cancelled() => false,
                    up = states.wait_for(|s| *s == LinkState::Connected) => up.is_ok(),
                };
                if !resumed {
                    break;
                }
                info!("Link back up, polling resumed");
                continue;
            }

            // Drain everything that is already buffered before sleeping again
            loop {
                match transport.read().await {
                    Ok(Some(bytes)) if bytes.is_empty() => break,
                    Ok(Some(bytes)) => {
                        for line in lines.push(&bytes) {
                            self.handle_line(&line).await;
                        }
                    }
                    Ok(None) => {
                        info!("{} closed by the device", transport.name());
                        break;
                    }
                    Err(e) => {
                        error!("Read from {} failed: {}", transport.name(), e);
                        break;
                    }
                }
                if cancel.is_cancelled() {
                    break;
                }
            }
        }
        debug!("Poll loop stopped");
    }

    /// Re-evaluates the rules on every pin change while the link is up.
    async fn engine_loop(
        self,
        transport: Arc<dyn DeviceTransport>,
        mut events: broadcast::Receiver<PinChange>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Engine skipped {} pin events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
            if !transport.is_connected() {
                continue;
            }

            let commands = {
                let mut engine = self.engine.lock().await;
                // Everything queued so far is covered by this evaluation
                drain(&mut events);
                let commands = engine.settle();
                // Changes made by the evaluation itself need no second pass
                drain(&mut events);
                commands
            };
            if commands.is_empty() {
                continue;
            }
            if let Err(e) = self.send_commands(transport.as_ref(), &commands).await {
                error!("Failed to push rule outputs: {}", e);
            }
        }
        debug!("Engine loop stopped");
    }

    fn record(&self, direction: MessageDirection, content: &str) {
        self.lock_log().record(direction, content);
    }

    fn lock_log(&self) -> std::sync::MutexGuard<'_, MessageLog> {
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Discards queued pin events
fn drain(events: &mut broadcast::Receiver<PinChange>) {
    loop {
        match events.try_recv() {
            Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use tokio::time::{sleep, timeout};

    use crate::core::logic::ConditionType;
    use crate::core::transport::{LinkStateCell, TransportKind};

    /// Transport double: reads come from a queue, writes are recorded.
    struct MockTransport {
        state: LinkStateCell,
        inbound: std::sync::Mutex<VecDeque<Vec<u8>>>,
        written: std::sync::Mutex<Vec<String>>,
        /// Writes starting with this prefix fail while the link stays up
        rejected: std::sync::Mutex<Option<String>>,
    }

    impl MockTransport {
        fn connected() -> Arc<Self> {
            let transport = Self {
                state: LinkStateCell::new("mock"),
                inbound: std::sync::Mutex::new(VecDeque::new()),
                written: std::sync::Mutex::new(Vec::new()),
                rejected: std::sync::Mutex::new(None),
            };
            transport.state.set(LinkState::Connected);
            Arc::new(transport)
        }

        fn feed(&self, text: &str) {
            self.inbound.lock().unwrap().push_back(text.as_bytes().to_vec());
        }

        fn written(&self) -> Vec<String> {
            self.written.lock().unwrap().clone()
        }

        fn reject_writes(&self, prefix: &str) {
            *self.rejected.lock().unwrap() = Some(prefix.to_string());
        }

        fn drop_link(&self) {
            self.state.set(LinkState::Disconnected);
        }
    }

    #[async_trait]
    impl DeviceTransport for MockTransport {
        fn kind(&self) -> TransportKind {
            TransportKind::Serial
        }

        fn name(&self) -> String {
            "mock".to_string()
        }

        fn state(&self) -> LinkState {
            self.state.get()
        }

        fn watch_state(&self) -> watch::Receiver<LinkState> {
            self.state.subscribe()
        }

        async fn close(&self) -> Result<()> {
            self.state.set(LinkState::Disconnected);
            Ok(())
        }

        async fn read(&self) -> Result<Option<Vec<u8>>> {
            if !self.is_connected() {
                return Err(BridgeError::NotConnected);
            }
            Ok(Some(self.inbound.lock().unwrap().pop_front().unwrap_or_default()))
        }

        async fn write(&self, text: &str) -> Result<()> {
            if !self.is_connected() {
                return Err(BridgeError::NotConnected);
            }
            if let Some(prefix) = self.rejected.lock().unwrap().as_deref() {
                if text.starts_with(prefix) {
                    return Err(BridgeError::WriteError("port stalled".into()));
                }
            }
            self.written.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    fn session() -> BridgeSession {
        BridgeSession::new(&EngineConfig {
            poll_interval_ms: 5,
            ..Default::default()
        })
    }

    async fn wait_for_write(transport: &MockTransport, line: &str) {
        timeout(Duration::from_secs(2), async {
            while !transport.written().iter().any(|w| w == line) {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{} never sent, got {:?}", line, transport.written()));
    }

    #[tokio::test]
    async fn test_and_rule_drives_output_from_inbound_frames() {
        let session = session();
        let transport = MockTransport::connected();
        session.attach(transport.clone()).await;

        session
            .configure_rule(LogicRule::new(16, ConditionType::And, vec![32, 33], true))
            .await
            .unwrap();
        assert_eq!(transport.written(), vec!["SET_LOGIC:16:AND:32,33:1"]);

        transport.feed("GPIO:32:1\nGPIO:3");
        transport.feed("3:1\n");
        wait_for_write(&transport, "SET_GPIO:16:1").await;

        assert!(session.pin(16).await.unwrap().value);
        let received: Vec<String> = session
            .messages()
            .into_iter()
            .filter(|m| m.direction == MessageDirection::Received)
            .map(|m| m.content)
            .collect();
        assert_eq!(received, vec!["GPIO:32:1", "GPIO:33:1"]);
    }

    #[tokio::test]
    async fn test_configure_rule_drives_immediately() {
        let session = session();
        let transport = MockTransport::connected();
        session.attach(transport.clone()).await;

        session
            .configure_rule(LogicRule::new(17, ConditionType::Not, vec![35], true))
            .await
            .unwrap();
        assert_eq!(
            transport.written(),
            vec!["SET_LOGIC:17:NOT:35:1", "SET_GPIO:17:1"]
        );
        assert_eq!(session.rules().await.len(), 1);
    }

    #[tokio::test]
    async fn test_override_blocks_rule_until_reconfigured() {
        let session = session();
        let transport = MockTransport::connected();
        session.attach(transport.clone()).await;

        let rule = LogicRule::new(16, ConditionType::Or, vec![32], true);
        session.configure_rule(rule.clone()).await.unwrap();
        session.set_pin(16, true).await.unwrap();
        assert!(session.is_overridden(16).await);

        transport.feed("GPIO:32:1\nGPIO:32:0\n");
        sleep(Duration::from_millis(100)).await;
        assert!(session.pin(16).await.unwrap().value);
        assert_eq!(
            transport.written().iter().filter(|w| w.starts_with("SET_GPIO:16")).count(),
            1
        );

        session.configure_rule(rule).await.unwrap();
        assert!(!session.is_overridden(16).await);
        assert!(!session.pin(16).await.unwrap().value);
        assert_eq!(transport.written().last().unwrap(), "SET_GPIO:16:0");
    }

    #[tokio::test]
    async fn test_failed_set_pin_restores_override_and_value() {
        let session = session();
        let transport = MockTransport::connected();
        session.attach(transport.clone()).await;

        session
            .configure_rule(LogicRule::new(16, ConditionType::Or, vec![32], true))
            .await
            .unwrap();
        transport.reject_writes("SET_GPIO");

        assert!(matches!(
            session.set_pin(16, true).await,
            Err(BridgeError::WriteError(_))
        ));
        assert!(!session.is_overridden(16).await);
        assert!(!session.pin(16).await.unwrap().value);
        assert_eq!(session.rules().await.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_rule_push_restores_rules_and_outputs() {
        let session = session();
        let transport = MockTransport::connected();
        session.attach(transport.clone()).await;

        session.set_pin(17, true).await.unwrap();
        transport.reject_writes("SET_LOGIC");

        assert!(session
            .configure_rule(LogicRule::new(16, ConditionType::Not, vec![35], true))
            .await
            .is_err());
        assert!(session.rules().await.is_empty());
        assert!(!session.pin(16).await.unwrap().value);
        assert!(session.pin(17).await.unwrap().value);
        assert!(session.is_overridden(17).await);
        assert_eq!(transport.written(), vec!["SET_GPIO:17:1"]);
        assert!(!session.messages().iter().any(|m| m.content.starts_with("SET_LOGIC")));
    }

    #[tokio::test]
    async fn test_set_pin_rejects_inputs() {
        let session = session();
        let transport = MockTransport::connected();
        session.attach(transport.clone()).await;

        assert!(matches!(
            session.set_pin(32, true).await,
            Err(BridgeError::InvalidDirection(32))
        ));
        assert!(!session.pin(32).await.unwrap().value);
        assert!(transport.written().is_empty());
    }

    #[tokio::test]
    async fn test_status_events() {
        let session = session();
        let transport = MockTransport::connected();
        let mut status = session.on_status();
        session.attach(transport.clone()).await;

        transport.feed("ADC:34:1234\nERROR:Unknown command: X\nhello\nLOGIC:18:XOR:32,33:1\n");

        let mut events = Vec::new();
        while events.len() < 4 {
            events.push(
                timeout(Duration::from_secs(2), status.recv())
                    .await
                    .unwrap()
                    .unwrap(),
            );
        }
        assert_eq!(
            events,
            vec![
                StatusEvent::Analog { pin: 34, value: 1234 },
                StatusEvent::DeviceError {
                    message: "Unknown command: X".to_string()
                },
                StatusEvent::Malformed {
                    line: "hello".to_string()
                },
                StatusEvent::Rule(LogicRule::new(18, ConditionType::Xor, vec![32, 33], true)),
            ]
        );
        assert_eq!(session.analog(34).await, Some(1234));
        assert_eq!(session.rules().await.len(), 1);
    }

    #[tokio::test]
    async fn test_no_evaluation_while_disconnected() {
        let session = session();
        let transport = MockTransport::connected();
        session.attach(transport.clone()).await;
        session
            .configure_rule(LogicRule::new(16, ConditionType::And, vec![32], true))
            .await
            .unwrap();

        transport.drop_link();
        timeout(
            Duration::from_secs(1),
            session
                .watch_connection()
                .wait_for(|s| *s == LinkState::Disconnected),
        )
        .await
        .unwrap()
        .unwrap();

        session.handle_line("GPIO:32:1").await;
        sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.written(), vec!["SET_LOGIC:16:AND:32:1"]);
        assert!(!session.pin(16).await.unwrap().value);
        assert!(matches!(
            session.send_raw("GET_GPIO_STATE").await,
            Err(BridgeError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_attach_reports_link_state_at_once() {
        let session = session();
        let states = session.watch_connection();
        let transport = MockTransport::connected();

        session.attach(transport.clone()).await;
        assert_eq!(session.connection_state(), LinkState::Connected);
        assert_eq!(*states.borrow(), LinkState::Connected);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let session = session();
        let transport = MockTransport::connected();
        session.attach(transport.clone()).await;

        session.disconnect().await.unwrap();
        assert_eq!(transport.state(), LinkState::Disconnected);
        assert_eq!(session.connection_state(), LinkState::Disconnected);
        session.disconnect().await.unwrap();
        assert_eq!(session.connection_state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_raw_is_logged() {
        let session = session();
        let transport = MockTransport::connected();
        session.attach(transport.clone()).await;

        session.request_state().await.unwrap();
        assert_eq!(transport.written(), vec!["GET_GPIO_STATE"]);
        assert!(session.export_messages().ends_with("> GET_GPIO_STATE\n"));

        session.clear_messages();
        assert!(session.messages().is_empty());
    }

    #[tokio::test]
    async fn test_reconfigure_replaces_pin_table() {
        let session = session();
        assert!(session.pin(2).await.is_some());

        session
            .reconfigure_pins(&[
                PinConfig::output(13, "RELAY"),
                PinConfig::input(14, "BUTTON"),
            ])
            .await;
        assert!(session.pin(2).await.is_none());
        assert_eq!(session.pins().await.len(), 2);

        let transport = MockTransport::connected();
        session.attach(transport.clone()).await;
        session.set_pin(13, true).await.unwrap();
        assert!(matches!(
            session.set_pin(14, true).await,
            Err(BridgeError::InvalidDirection(14))
        ));
        assert_eq!(transport.written(), vec!["SET_GPIO:13:1"]);
    }
}
