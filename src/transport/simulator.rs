// MIT License - Copyright (c) 2026 Peter Wright
// In-process panel simulator speaking the JA-121T line protocol

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::debug;

use super::TransportChannels;
use crate::config::SimulatorConfig;
use crate::constants::CHANNEL_CAPACITY;

/// Section state machine and PIN check of a JA-121T style panel.
#[derive(Debug, Clone)]
pub struct PanelSimulator {
    pin: String,
    /// Section code -> armed
    sections: BTreeMap<u32, bool>,
}

fn is_number(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

impl PanelSimulator {
    pub fn new(config: &SimulatorConfig) -> Self {
        Self {
            pin: config.pin.clone(),
            sections: config.sections.iter().map(|s| (s.code, s.armed)).collect(),
        }
    }

    fn section_line(code: u32, armed: bool) -> String {
        format!("STATE {code} {}", if armed { "ARMED" } else { "READY" })
    }

    /// Lines the panel answers to one received line.
    pub fn respond(&mut self, line: &str) -> Vec<String> {
        let line = line.trim_end_matches(['\r', '\n']);
        let words: Vec<&str> = line.split(' ').collect();

        match words.as_slice() {
            [pin, command @ ("SET" | "UNSET"), code] if is_number(pin) && is_number(code) => {
                if *pin != self.pin {
                    return vec!["ERROR: 3 NO_ACCESS".to_string()];
                }
                let arm = *command == "SET";
                let Some((code, armed)) = code
                    .parse::<u32>()
                    .ok()
                    .and_then(|code| self.sections.get_mut(&code).map(|a| (code, a)))
                else {
                    return vec!["ERROR: 4 INVALID_VALUE".to_string()];
                };
                if *armed == arm {
                    return vec!["OK".to_string()];
                }
                *armed = arm;
                vec![Self::section_line(code, arm)]
            }
            [pin, "STATE"] if is_number(pin) => {
                if *pin != self.pin {
                    return vec!["ERROR: 3 NO_ACCESS".to_string()];
                }
                self.sections
                    .iter()
                    .map(|(&code, &armed)| Self::section_line(code, armed))
                    .collect()
            }
            _ => {
                debug!("Simulator ignoring {line:?}");
                Vec::new()
            }
        }
    }
}

/// Start a simulated panel behind a channel pair.
///
/// Responses are delayed by `response_delay_ms`; periodic lines are emitted
/// on their own schedule.
pub fn spawn(config: &SimulatorConfig) -> TransportChannels {
    let (in_tx, in_rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);
    let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);
    let mut panel = PanelSimulator::new(config);
    let delay = Duration::from_millis(config.response_delay_ms);
    let mut tasks = Vec::new();

    let tx = in_tx.clone();
    tasks.push(tokio::spawn(async move {
        let mut pending = BytesMut::new();
        while let Some(data) = out_rx.recv().await {
            pending.extend_from_slice(&data);
            while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                let line = pending.split_to(pos + 1);
                let line = String::from_utf8_lossy(&line).into_owned();
                let responses = panel.respond(&line);
                if responses.is_empty() {
                    continue;
                }
                tokio::time::sleep(delay).await;
                for response in responses {
                    if tx.send(Bytes::from(format!("{response}\n"))).await.is_err() {
                        return;
                    }
                }
            }
        }
    }));

    for periodic in &config.periodic {
        let tx = in_tx.clone();
        let every = Duration::from_secs(periodic.every_secs.max(1));
        let line = Bytes::from(format!("{}\n", periodic.line));
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            loop {
                interval.tick().await;
                if tx.send(line.clone()).await.is_err() {
                    break;
                }
            }
        }));
    }

    TransportChannels::new(in_rx, out_tx, Arc::new(AtomicBool::new(false)), tasks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PeriodicLine, SimulatedSection};

    fn config() -> SimulatorConfig {
        SimulatorConfig {
            pin: "1234".into(),
            response_delay_ms: 500,
            sections: vec![
                SimulatedSection { code: 1, armed: false },
                SimulatedSection { code: 2, armed: true },
            ],
            periodic: vec![PeriodicLine {
                every_secs: 30,
                line: "ZONE 1 1".into(),
            }],
        }
    }

    #[test]
    fn test_set_and_unset() {
        let mut panel = PanelSimulator::new(&config());
        assert_eq!(panel.respond("1234 SET 1\n"), vec!["STATE 1 ARMED"]);
        assert_eq!(panel.respond("1234 SET 1"), vec!["OK"]);
        assert_eq!(panel.respond("1234 UNSET 2"), vec!["STATE 2 READY"]);
        assert_eq!(panel.respond("1234 UNSET 2"), vec!["OK"]);
    }

    #[test]
    fn test_errors() {
        let mut panel = PanelSimulator::new(&config());
        assert_eq!(panel.respond("9999 SET 1"), vec!["ERROR: 3 NO_ACCESS"]);
        assert_eq!(panel.respond("1234 SET 7"), vec!["ERROR: 4 INVALID_VALUE"]);
        assert_eq!(panel.respond("9999 STATE"), vec!["ERROR: 3 NO_ACCESS"]);
        assert!(panel.respond("HELLO").is_empty());
    }

    #[test]
    fn test_state_lists_all_sections() {
        let mut panel = PanelSimulator::new(&config());
        assert_eq!(
            panel.respond("1234 STATE"),
            vec!["STATE 1 READY", "STATE 2 ARMED"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_response_and_periodic_line() {
        let mut channels = spawn(&config());
        channels.tx.send(Bytes::from_static(b"1234 SET")).await.unwrap();
        channels.tx.send(Bytes::from_static(b" 1\n")).await.unwrap();

        let start = tokio::time::Instant::now();
        assert_eq!(channels.rx.recv().await.unwrap().as_ref(), b"STATE 1 ARMED\n");
        assert!(start.elapsed() >= Duration::from_millis(500));

        assert_eq!(channels.rx.recv().await.unwrap().as_ref(), b"ZONE 1 1\n");
        assert!(start.elapsed() >= Duration::from_secs(30));
    }
}
