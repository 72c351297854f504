/// Operator control channel over a local Unix socket
///
/// One command per line. Every command gets exactly one reply,
/// `OK:<CMD>:<payload>` or `ERR:<CMD>:<message>`. A connection that enabled
/// pairing additionally receives `MSG:<event>:<address>` lines as the
/// handshake progresses.
use log::{debug, info, warn};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast::{self, error::RecvError};

use crate::capacity::{self, SettingError, SettingUpdate};
use crate::gateway::Gateway;
use crate::models::{Address, AddressParseError};
use crate::pairing::PairingEvent;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    PairEnable,
    PairDisable,
    PairAccept(Address),
    List,
    View(Address),
    Forget(Address),
    SetGatewayId(String),
    SetGatewayPassword(String),
    SetSensorSetting(Address, SettingUpdate),
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("unknown command")]
    Unknown,
    #[error("missing argument <{0}>")]
    MissingArgument(&'static str),
    #[error(transparent)]
    Address(#[from] AddressParseError),
    #[error(transparent)]
    Setting(#[from] SettingError),
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let line = line.trim();
        let (name, args) = line.split_once(' ').unwrap_or((line, ""));
        let args = args.trim();

        let command = match name {
            "PAIR-ENABLE" => Command::PairEnable,
            "PAIR-DISABLE" => Command::PairDisable,
            "PAIR-ACCEPT" => Command::PairAccept(address(args)?),
            "LIST" => Command::List,
            "VIEW" => Command::View(address(args)?),
            "FORGET" => Command::Forget(address(args)?),
            "SET-GATEWAY-ID" => Command::SetGatewayId(required(args, "id")?.to_string()),
            "SET-GATEWAY-PASSWORD" => {
                Command::SetGatewayPassword(required(args, "password")?.to_string())
            }
            "SET-SENSOR-SETTING" => {
                let (mac, rest) = args.split_once(' ').unwrap_or((args, ""));
                let mac = address(mac)?;
                let rest = rest.trim();
                let (setting, value) = rest.split_once(' ').unwrap_or((rest, ""));
                let setting = required(setting, "setting")?;
                let update = SettingUpdate::parse(setting, value.trim())?;
                Command::SetSensorSetting(mac, update)
            }
            "STOP" => Command::Stop,
            _ => return Err(CommandError::Unknown),
        };
        Ok(command)
    }
}

fn required<'a>(arg: &'a str, name: &'static str) -> Result<&'a str, CommandError> {
    if arg.is_empty() {
        Err(CommandError::MissingArgument(name))
    } else {
        Ok(arg)
    }
}

fn address(arg: &str) -> Result<Address, CommandError> {
    Ok(required(arg, "mac")?.parse()?)
}

/// Runs one command against the daemon state and returns the reply payload.
pub async fn execute(gateway: &Gateway, command: &Command) -> Result<String, String> {
    match command {
        Command::PairEnable => {
            gateway.pairing.enable().await;
            Ok(String::new())
        }
        Command::PairDisable => {
            gateway.pairing.disable().await;
            Ok(String::new())
        }
        Command::PairAccept(mac) => {
            gateway.pairing.accept(*mac).await.map_err(|e| e.to_string())?;
            Ok(mac.to_string())
        }
        Command::List => {
            let registry = gateway.registry.read().await;
            serde_json::to_string(registry.sensors()).map_err(|e| e.to_string())
        }
        Command::View(mac) => {
            let registry = gateway.registry.read().await;
            let sensor = registry
                .get(mac)
                .ok_or_else(|| format!("sensor with MAC address {} not found", mac))?;
            serde_json::to_string(sensor).map_err(|e| e.to_string())
        }
        Command::Forget(mac) => {
            let mut registry = gateway.registry.write().await;
            registry.remove(mac).await.map_err(|e| e.to_string())?;
            Ok(mac.to_string())
        }
        Command::SetGatewayId(id) => {
            let mut settings = gateway.settings.write().await;
            settings.set_id(id).await.map_err(|e| e.to_string())?;
            info!("Gateway id set to {}", id);
            Ok(id.clone())
        }
        Command::SetGatewayPassword(password) => {
            let mut settings = gateway.settings.write().await;
            settings
                .set_password(password)
                .await
                .map_err(|e| e.to_string())?;
            info!("Gateway password changed");
            Ok(String::new())
        }
        Command::SetSensorSetting(mac, update) => {
            let mut registry = gateway.registry.write().await;
            let sensor = registry
                .update_setting(mac, update)
                .await
                .map_err(|e| e.to_string())?;
            info!(
                "Updated settings of {} (collection size {} of {} bytes)",
                mac,
                capacity::collection_size(sensor),
                sensor.collection_capacity
            );
            serde_json::to_string(sensor).map_err(|e| e.to_string())
        }
        Command::Stop => {
            if !gateway.stop_advertising() {
                info!("STOP received while not advertising");
            }
            Ok(String::new())
        }
    }
}

/// Accepts operator connections on `path` until the listener fails.
pub async fn serve(gateway: Arc<Gateway>, path: PathBuf) -> std::io::Result<()> {
    // a previous run may have left its socket behind
    match std::fs::remove_file(&path) {
        Err(e) if e.kind() != ErrorKind::NotFound => return Err(e),
        _ => {}
    }
    let listener = UnixListener::bind(&path)?;
    info!("Control socket listening on {}", path.display());

    loop {
        let (stream, _) = listener.accept().await?;
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(gateway, stream).await {
                warn!("Control connection failed: {}", e);
            }
        });
    }
}

async fn handle_connection(gateway: Arc<Gateway>, stream: UnixStream) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let mut events: Option<broadcast::Receiver<PairingEvent>> = None;
    debug!("Control client connected");

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let name = line.split_whitespace().next().unwrap_or_default().to_string();
                let reply = match Command::parse(&line) {
                    Ok(command) => {
                        match command {
                            // subscribe first so no event slips past
                            Command::PairEnable if events.is_none() => {
                                events = Some(gateway.pairing.subscribe())
                            }
                            Command::PairDisable => events = None,
                            _ => {}
                        }
                        execute(&gateway, &command).await
                    }
                    Err(e) => Err(e.to_string()),
                };
                let line = match reply {
                    Ok(payload) => format!("OK:{}:{}\n", name, payload),
                    Err(message) => format!("ERR:{}:{}\n", name, message),
                };
                writer.write_all(line.as_bytes()).await?;
            }
            event = next_event(&mut events) => match event {
                Ok(event) => {
                    writer.write_all(format!("MSG:{}\n", event).as_bytes()).await?;
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!("Control client missed {} pairing event(s)", missed)
                }
                Err(RecvError::Closed) => events = None,
            },
        }
    }
    debug!("Control client disconnected");
    Ok(())
}

async fn next_event(
    events: &mut Option<broadcast::Receiver<PairingEvent>>,
) -> Result<PairingEvent, RecvError> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test_support::TestKey;
    use crate::gateway::test_support::gateway;
    use crate::models::{Capabilities, MeasurementType, Sensor};

    const MAC: Address = Address([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("PAIR-ENABLE"), Ok(Command::PairEnable));
        assert_eq!(
            Command::parse("PAIR-ACCEPT 11:22:33:44:55:66\n"),
            Ok(Command::PairAccept(MAC))
        );
        assert_eq!(
            Command::parse("SET-GATEWAY-PASSWORD two words"),
            Ok(Command::SetGatewayPassword("two words".into()))
        );
        assert_eq!(
            Command::parse("SET-SENSOR-SETTING 11:22:33:44:55:66 name Pump motor"),
            Ok(Command::SetSensorSetting(
                MAC,
                SettingUpdate::Name("Pump motor".into())
            ))
        );
        assert_eq!(
            Command::parse("SET-SENSOR-SETTING 11:22:33:44:55:66 audio_sampling_frequency 4000"),
            Ok(Command::SetSensorSetting(
                MAC,
                SettingUpdate::SamplingFrequency(MeasurementType::Audio, 4000)
            ))
        );
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(Command::parse("REBOOT"), Err(CommandError::Unknown));
        assert_eq!(
            Command::parse("VIEW"),
            Err(CommandError::MissingArgument("mac"))
        );
        assert!(matches!(
            Command::parse("FORGET 11:22"),
            Err(CommandError::Address(_))
        ));
        assert!(matches!(
            Command::parse("SET-SENSOR-SETTING 11:22:33:44:55:66 colour red"),
            Err(CommandError::Setting(SettingError::UnknownSetting(_)))
        ));
        assert_eq!(
            Command::parse("SET-SENSOR-SETTING 11:22:33:44:55:66"),
            Err(CommandError::MissingArgument("setting"))
        );
    }

    #[tokio::test]
    async fn test_execute_sensor_commands() {
        let t = gateway();
        let device = TestKey::generate();
        t.gateway
            .registry
            .write()
            .await
            .insert(Sensor::enrolled(MAC, &Capabilities::default(), device.public_key()))
            .await
            .unwrap();

        let list = execute(&t.gateway, &Command::List).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&list).unwrap();
        assert_eq!(parsed[0]["mac"], "11:22:33:44:55:66");

        let update = SettingUpdate::SamplingFrequency(MeasurementType::Vibration, 1_000_000);
        let rejected = execute(&t.gateway, &Command::SetSensorSetting(MAC, update)).await;
        assert!(rejected.unwrap_err().contains("exceeds collection capacity"));

        let renamed = execute(
            &t.gateway,
            &Command::SetSensorSetting(MAC, SettingUpdate::Name("Pump".into())),
        )
        .await
        .unwrap();
        assert!(renamed.contains("\"name\":\"Pump\""));

        assert_eq!(
            execute(&t.gateway, &Command::Forget(MAC)).await,
            Ok(MAC.to_string())
        );
        assert!(execute(&t.gateway, &Command::View(MAC)).await.is_err());
    }

    #[tokio::test]
    async fn test_execute_gateway_commands() {
        let t = gateway();
        execute(&t.gateway, &Command::SetGatewayId("site-7".into()))
            .await
            .unwrap();
        assert_eq!(t.gateway.settings.read().await.id, "site-7");

        let accept = execute(&t.gateway, &Command::PairAccept(MAC)).await;
        assert_eq!(accept, Err("pairing mode disabled".to_string()));

        // stopping only ends advertising, so it can be repeated
        assert_eq!(execute(&t.gateway, &Command::Stop).await, Ok(String::new()));
        assert_eq!(execute(&t.gateway, &Command::Stop).await, Ok(String::new()));
        assert_eq!(
            execute(&t.gateway, &Command::List).await,
            Ok("[]".to_string())
        );
    }

    #[tokio::test]
    async fn test_socket_session() {
        let t = gateway();
        let path = t.dir.path().join("control.sock");
        let server = tokio::spawn(serve(t.gateway.clone(), path.clone()));
        // wait for the listener to come up
        let stream = loop {
            match UnixStream::connect(&path).await {
                Ok(stream) => break stream,
                Err(_) => tokio::task::yield_now().await,
            }
        };
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        writer.write_all(b"LIST\n").await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "OK:LIST:[]");

        writer.write_all(b"FROBNICATE now\n").await.unwrap();
        assert_eq!(
            lines.next_line().await.unwrap().unwrap(),
            "ERR:FROBNICATE:unknown command"
        );

        writer.write_all(b"PAIR-ENABLE\n").await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "OK:PAIR-ENABLE:");

        let device = TestKey::generate();
        let mut request = MAC.0.to_vec();
        request.extend(device.public_der());
        t.gateway.pairing.on_pair_request(&request).await;
        assert_eq!(
            lines.next_line().await.unwrap().unwrap(),
            "MSG:REQUEST-NEW:11:22:33:44:55:66"
        );

        writer
            .write_all(b"PAIR-ACCEPT 11:22:33:44:55:66\n")
            .await
            .unwrap();
        let mut replies = vec![
            lines.next_line().await.unwrap().unwrap(),
            lines.next_line().await.unwrap().unwrap(),
        ];
        replies.sort();
        assert_eq!(
            replies,
            vec![
                "MSG:PAIRING-WITH:11:22:33:44:55:66".to_string(),
                "OK:PAIR-ACCEPT:11:22:33:44:55:66".to_string(),
            ]
        );

        server.abort();
    }
}
