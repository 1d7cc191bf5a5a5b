//! In-process stand-in for the device firmware
//! Answers the wire protocol with the same pin table and rule engine the bridge
//! uses, so demos and tests run without hardware.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;

use crate::config::engine_config::{PinConfig, default_pin_table};
use crate::core::error::BridgeError;
use crate::core::logic::RuleEngine;
use crate::core::pins::PinTable;
use crate::core::protocol::{Command, LineBuffer, Response, frame_line};

const UNSOLICITED_CAPACITY: usize = 64;

pub struct SimulatedDevice {
    pins: PinTable,
    engine: RuleEngine,
    analog: BTreeMap<u8, i32>,
    /// Frames the device sends without being asked (input edges, ADC samples)
    unsolicited: broadcast::Sender<Response>,
}

impl SimulatedDevice {
    pub fn new(pins: &[PinConfig]) -> Self {
        let (unsolicited, _) = broadcast::channel(UNSOLICITED_CAPACITY);
        Self {
            pins: PinTable::new(pins),
            engine: RuleEngine::new(),
            analog: BTreeMap::new(),
            unsolicited,
        }
    }

    pub fn shared(self) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(self))
    }

    /// Handles one command line and returns the response frames.
    pub fn handle_line(&mut self, line: &str) -> Vec<Response> {
        let command = match Command::parse(line) {
            Ok(command) => command,
            Err(_) => {
                warn!("Simulated device got unknown command {:?}", line);
                return vec![Response::Error(format!("Unknown command: {}", line.trim()))];
            }
        };
        debug!("Simulated device handling {}", command);

        match command {
            Command::GetGpioState => {
                let mut frames: Vec<Response> = self
                    .pins
                    .pins()
                    .iter()
                    .map(|pin| Response::Gpio {
                        pin: pin.number,
                        value: pin.value,
                    })
                    .collect();
                frames.extend(self.engine.rules().into_iter().map(Response::Logic));
                frames.extend(
                    self.analog
                        .iter()
                        .map(|(pin, value)| Response::Adc { pin: *pin, value: *value }),
                );
                frames
            }
            Command::SetGpio { pin, value } => {
                match self.engine.set_override(pin, value, &mut self.pins) {
                    Ok(command) => vec![Response::Gpio {
                        pin: command.pin,
                        value: command.value,
                    }],
                    Err(e) => vec![Self::error_frame(e)],
                }
            }
            Command::SetLogic(rule) => match self.engine.upsert(rule.clone(), &self.pins) {
                Ok(_) => {
                    let mut frames = vec![Response::Logic(rule)];
                    frames.extend(self.evaluate());
                    frames
                }
                Err(e) => vec![Self::error_frame(e)],
            },
        }
    }

    /// Simulates an edge on a physical input. Returns (and broadcasts) the
    /// frames the device reports for it.
    pub fn set_input(&mut self, pin: u8, value: bool) -> Vec<Response> {
        let frame = Response::Gpio { pin, value };
        let mut frames = Vec::new();
        if self.pins.apply(&frame).is_some() {
            frames.push(frame);
            frames.extend(self.evaluate());
        }
        for frame in &frames {
            let _ = self.unsolicited.send(frame.clone());
        }
        frames
    }

    /// Simulates an analog sample and broadcasts it.
    pub fn set_analog(&mut self, pin: u8, value: i32) -> Response {
        self.analog.insert(pin, value);
        let frame = Response::Adc { pin, value };
        let _ = self.unsolicited.send(frame.clone());
        frame
    }

    pub fn value(&self, pin: u8) -> bool {
        self.pins.value(pin)
    }

    /// Links currently attached to the device
    pub fn attached_links(&self) -> usize {
        self.unsolicited.receiver_count()
    }

    pub fn subscribe_unsolicited(&self) -> broadcast::Receiver<Response> {
        self.unsolicited.subscribe()
    }

    fn evaluate(&mut self) -> Vec<Response> {
        self.engine
            .evaluate(&mut self.pins)
            .into_iter()
            .map(|command| Response::Gpio {
                pin: command.pin,
                value: command.value,
            })
            .collect()
    }

    fn error_frame(error: BridgeError) -> Response {
        let message = match error {
            BridgeError::InvalidDirection(pin) => format!("Pin {} is not an output", pin),
            BridgeError::UnknownPin(pin) => format!("Invalid pin {}", pin),
            other => other.to_string(),
        };
        Response::Error(message)
    }

    /// Serves the protocol over a byte stream until the peer hangs up or
    /// `cancel` fires. Dropping the stream on cancel looks like an unplugged
    /// cable to the other side. `unsolicited` must be subscribed before the
    /// task is spawned so no early input edge is missed.
    pub async fn serve<S>(
        device: Arc<Mutex<SimulatedDevice>>,
        stream: S,
        mut unsolicited: broadcast::Receiver<Response>,
        cancel: CancellationToken,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut lines = LineBuffer::new();
        let mut buf = [0u8; 256];

        info!("Simulated device online");
        loop {
            let frames = tokio::select! {
                _ = cancel.cancelled() => break,
                read = reader.read(&mut buf) => match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let mut device = device.lock().await;
                        lines
                            .push(&buf[..n])
                            .iter()
                            .flat_map(|line| device.handle_line(line))
                            .collect::<Vec<_>>()
                    }
                },
                frame = unsolicited.recv() => match frame {
                    Ok(frame) => vec![frame],
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };

            let mut out = String::new();
            for frame in frames {
                out.push_str(&frame_line(&frame.to_string()));
            }
            if writer.write_all(out.as_bytes()).await.is_err() || writer.flush().await.is_err() {
                break;
            }
        }
        info!("Simulated device offline");
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new(&default_pin_table())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};

    fn lines(frames: &[Response]) -> Vec<String> {
        frames.iter().map(|f| f.to_string()).collect()
    }

    #[test]
    fn test_state_dump_lists_pins_and_rules() {
        let mut device = SimulatedDevice::default();
        device.handle_line("SET_LOGIC:16:AND:32,33:1");
        device.set_analog(34, 512);

        let dump = lines(&device.handle_line("GET_GPIO_STATE"));
        assert!(dump.contains(&"GPIO:2:0".to_string()));
        assert!(dump.contains(&"GPIO:39:0".to_string()));
        assert!(dump.contains(&"LOGIC:16:AND:32,33:1".to_string()));
        assert!(dump.contains(&"ADC:34:512".to_string()));
    }

    #[test]
    fn test_set_logic_echoes_and_drives_outputs() {
        let mut device = SimulatedDevice::default();
        let frames = lines(&device.handle_line("SET_LOGIC:17:NOT:35:1"));
        assert_eq!(frames, vec!["LOGIC:17:NOT:35:1", "GPIO:17:1"]);
        assert!(device.value(17));
    }

    #[test]
    fn test_input_edge_reevaluates_rules() {
        let mut device = SimulatedDevice::default();
        device.handle_line("SET_LOGIC:16:AND:32,33:1");
        assert_eq!(lines(&device.set_input(32, true)), vec!["GPIO:32:1"]);
        assert_eq!(
            lines(&device.set_input(33, true)),
            vec!["GPIO:33:1", "GPIO:16:1"]
        );
    }

    #[test]
    fn test_errors() {
        let mut device = SimulatedDevice::default();
        assert_eq!(
            lines(&device.handle_line("BLINK")),
            vec!["ERROR:Unknown command: BLINK"]
        );
        assert_eq!(
            lines(&device.handle_line("SET_GPIO:32:1")),
            vec!["ERROR:Pin 32 is not an output"]
        );
        assert!(lines(&device.handle_line("SET_LOGIC:16:NOT:32,33:1"))[0].starts_with("ERROR:"));
    }

    #[test]
    fn test_set_gpio_overrides_rule() {
        let mut device = SimulatedDevice::default();
        device.handle_line("SET_LOGIC:16:NOR:32:1");
        assert!(device.value(16));
        assert_eq!(lines(&device.handle_line("SET_GPIO:16:0")), vec!["GPIO:16:0"]);
        device.set_input(32, true);
        device.set_input(32, false);
        assert!(!device.value(16));
    }

    #[tokio::test]
    async fn test_serve_over_duplex() {
        let device = SimulatedDevice::default().shared();
        let (ours, theirs) = tokio::io::duplex(1024);
        let cancel = CancellationToken::new();
        let unsolicited = device.lock().await.subscribe_unsolicited();
        let server = tokio::spawn(SimulatedDevice::serve(
            device.clone(),
            theirs,
            unsolicited,
            cancel.clone(),
        ));

        let (read_half, mut write_half) = tokio::io::split(ours);
        let mut reader = BufReader::new(read_half).lines();

        write_half.write_all(b"SET_GPIO:2:1\n").await.unwrap();
        assert_eq!(reader.next_line().await.unwrap().unwrap(), "GPIO:2:1");

        device.lock().await.set_input(33, true);
        assert_eq!(reader.next_line().await.unwrap().unwrap(), "GPIO:33:1");

        cancel.cancel();
        server.await.unwrap();
        assert!(reader.next_line().await.unwrap().is_none());
    }
}
